// A hosted rendition of a small teaching kernel's scheduling core:
// the process/thread table, three pluggable scheduling policies, the
// sleep/wakeup/kill protocol, the fork/exit/wait lifecycle, and the
// credential store, with the paging and file-system collaborators
// simulated just far enough to be driven through their real
// operations. Kernel stacks are parked host threads and the outside
// world feeds the trap path explicitly, so everything runs - and is
// tested - deterministically on an ordinary machine.

#[macro_use]
pub mod printf;

pub mod account;
pub mod file;
pub mod fs;
pub mod param;
pub mod proc;
pub mod scheduler;
pub mod spinlock;
pub mod swtch;
pub mod syscall;
pub mod trap;
pub mod vm;

pub use proc::{Chan, Kernel, ProcState, Trapframe};
pub use scheduler::Policy;
pub use syscall::Sys;
pub use trap::CpuState;
