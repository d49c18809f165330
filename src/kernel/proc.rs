use crate::account::Utable;
use crate::file::File;
use crate::fs::{FileSystem, Inode};
use crate::param::*;
use crate::scheduler::{Policy, Scheduler};
use crate::spinlock::{self, SpinLock};
use crate::swtch::{swtch, Context};
use crate::vm::Uvm;
use array_macro::array;
use bitflags::bitflags;
use std::cell::{Cell, UnsafeCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

bitflags! {
    pub struct Eflags: usize {
        const IF = 1 << 9; // interrupt enable
    }
}

// user segment selectors
pub const SEG_UCODE: usize = 3;
pub const SEG_UDATA: usize = 4;
pub const DPL_USER: usize = 3;

// Saved user-mode register image, x86 layout. Lives at the top of the
// owning thread's kernel stack in the real machine; here it lives in
// the thread record itself.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Trapframe {
    pub edi: usize,
    pub esi: usize,
    pub ebp: usize,
    pub oesp: usize,
    pub ebx: usize,
    pub edx: usize,
    pub ecx: usize,
    pub eax: usize,
    pub gs: usize,
    pub fs: usize,
    pub es: usize,
    pub ds: usize,
    pub trapno: usize,
    pub err: usize,
    pub eip: usize,
    pub cs: usize,
    pub eflags: usize,
    pub esp: usize,
    pub ss: usize,
}

impl Trapframe {
    pub const fn new() -> Self {
        Self {
            edi: 0,
            esi: 0,
            ebp: 0,
            oesp: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            gs: 0,
            fs: 0,
            es: 0,
            ds: 0,
            trapno: 0,
            err: 0,
            eip: 0,
            cs: 0,
            eflags: 0,
            esp: 0,
            ss: 0,
        }
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum ProcState {
    UNUSED,
    EMBRYO,
    SLEEPING,
    RUNNABLE,
    RUNNING,
    ZOMBIE,
}

// Wait key for sleep/wakeup matching. The original kernel uses raw
// addresses; distinct variants keep the keys from aliasing.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Chan {
    Ticks,
    Proc(usize),
    Thread(usize),
}

// Pending traps for a thread sitting in user space. The hosted
// stand-in for "the user program runs until the next interrupt or
// system call": the outside context queues them, the thread's trap
// loop takes them.
pub enum Trap {
    Timer,
    Syscall(crate::syscall::Sys),
}

// A kernel stack. On hardware this is one page plus the saved context
// pointing into it; here it is a parked host thread and the Context
// that resumes it.
pub struct Kstack {
    pub context: Context,
    _thread: JoinHandle<()>,
}

// Per-thread state. The queue policies use only slot 0, which then
// carries the process's kernel stack, context and trap frame.
pub struct Thd {
    // ptable lock must be held when using these:
    pub state: Cell<ProcState>,
    pub tid: Cell<usize>,
    pub chan: Cell<Option<Chan>>,
    pub retval: Cell<usize>,
    pub cpu: Cell<Option<usize>>,
    pub inuser: Cell<bool>,
    pub tf: UnsafeCell<Trapframe>,
    pub kstack: UnsafeCell<Option<Kstack>>,
    pub pending: UnsafeCell<VecDeque<Trap>>,
}

impl Thd {
    fn new() -> Self {
        Self {
            state: Cell::new(ProcState::UNUSED),
            tid: Cell::new(0),
            chan: Cell::new(None),
            retval: Cell::new(0),
            cpu: Cell::new(None),
            inuser: Cell::new(false),
            tf: UnsafeCell::new(Trapframe::new()),
            kstack: UnsafeCell::new(None),
            pending: UnsafeCell::new(VecDeque::new()),
        }
    }
}

// Data private to the process; no lock needed to touch your own.
pub struct ProcData {
    pub sz: usize,
    pub uvm: Option<Box<Uvm>>,
    pub name: String,
    pub ofile: [Option<Arc<File>>; NOFILE],
    pub cwd: Option<Inode>,
    pub ustacks: [usize; NTHREAD],
}

impl ProcData {
    fn new() -> Self {
        Self {
            sz: 0,
            uvm: None,
            name: String::new(),
            ofile: array![_ => None; NOFILE],
            cwd: None,
            ustacks: [0; NTHREAD],
        }
    }
}

// Per-process state.
pub struct Proc {
    // ptable lock must be held when using these:
    pub state: Cell<ProcState>,
    pub pid: Cell<usize>,
    pub parent: Cell<Option<usize>>, // slot index; cleared when the slot is reaped
    pub killed: Cell<bool>,
    pub chan: Cell<Option<Chan>>, // wait key under the queue policies
    pub level: Cell<usize>,       // scheduling queue under the queue policies
    pub ticks: Cell<u32>,         // ticks accrued in the current MLFQ quantum
    pub priority: Cell<u32>,
    pub tid: Cell<usize>, // index of the current thread
    pub thds: [Thd; NTHREAD],
    // private to the process:
    pub data: UnsafeCell<ProcData>,
}

impl Proc {
    fn new() -> Self {
        Self {
            state: Cell::new(ProcState::UNUSED),
            pid: Cell::new(0),
            parent: Cell::new(None),
            killed: Cell::new(false),
            chan: Cell::new(None),
            level: Cell::new(0),
            ticks: Cell::new(0),
            priority: Cell::new(0),
            tid: Cell::new(0),
            thds: array![_ => Thd::new(); NTHREAD],
            data: UnsafeCell::new(ProcData::new()),
        }
    }
}

pub struct Ptable {
    pub lock: SpinLock,
    pub proc: [Proc; NPROC],
    nextpid: Cell<usize>,
    nexttid: Cell<usize>,
}

impl Ptable {
    fn new() -> Self {
        Self {
            lock: SpinLock::new("ptable"),
            proc: array![_ => Proc::new(); NPROC],
            nextpid: Cell::new(1),
            nexttid: Cell::new(1),
        }
    }

    // ptable lock must be held.
    pub(crate) fn alloc_pid(&self) -> usize {
        let pid = self.nextpid.get();
        self.nextpid.set(pid + 1);
        pid
    }

    // ptable lock must be held.
    pub(crate) fn alloc_tid(&self) -> usize {
        let tid = self.nexttid.get();
        self.nexttid.set(tid + 1);
        tid
    }
}

// Per-CPU state.
pub struct Cpu {
    pub proc: Cell<Option<(usize, usize)>>, // (slot, thread) running here, or None
    pub context: Context,                   // swtch() here to enter scheduler()
    pub vm: Cell<Option<usize>>,            // slot whose address space is installed
    pub(crate) started: Cell<bool>,
    pub(crate) handle: UnsafeCell<Option<JoinHandle<()>>>,
}

impl Cpu {
    fn new() -> Self {
        Self {
            proc: Cell::new(None),
            context: Context::new(),
            vm: Cell::new(None),
            started: Cell::new(false),
            handle: UnsafeCell::new(None),
        }
    }
}

// user bootstrap image copied into the first page of the first
// process; it traps straight into exec("/init")
static INITCODE: [u8; 44] = [
    0x68, 0x24, 0x00, 0x00, 0x00, 0x68, 0x1c, 0x00, 0x00, 0x00, 0xb8, 0x07, 0x00, 0x00, 0x00, 0xcd,
    0x40, 0xb8, 0x02, 0x00, 0x00, 0x00, 0xcd, 0x40, 0xeb, 0xf7, 0x00, 0x00, 0x2f, 0x69, 0x6e, 0x69,
    0x74, 0x00, 0x00, 0x00, 0x24, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

// The whole machine: CPUs, process table, clock, policy and the
// simulated collaborators. No global state; every test boots its own.
pub struct Kernel {
    pub(crate) cpus: [Cpu; NCPU],
    pub(crate) ptable: Ptable,
    pub(crate) policy: Box<dyn Scheduler + Send + Sync>,
    pub(crate) tickslock: SpinLock,
    pub(crate) ticks: Cell<u32>,
    pub(crate) fs: FileSystem,
    pub(crate) utable: Utable,
    // the outside (boot/driver) context that feeds the kernel
    // interrupts and traps; see trap.rs
    pub(crate) outside: Context,
    pub(crate) initproc: Cell<Option<usize>>,
    first: AtomicBool,
    // handle to ourselves, for the host threads standing in for
    // kernel stacks
    weak: Weak<Kernel>,
}

unsafe impl Send for Kernel {}
unsafe impl Sync for Kernel {}

impl Kernel {
    pub fn new(policy: Policy) -> Arc<Kernel> {
        Arc::new_cyclic(|weak| Kernel {
            cpus: array![_ => Cpu::new(); NCPU],
            ptable: Ptable::new(),
            policy: policy.build(),
            tickslock: SpinLock::new("time"),
            ticks: Cell::new(0),
            fs: FileSystem::new(),
            utable: Utable::new(),
            outside: Context::new(),
            initproc: Cell::new(None),
            first: AtomicBool::new(true),
            weak: weak.clone(),
        })
    }

    pub(crate) fn arc(&self) -> Arc<Kernel> {
        self.weak.upgrade().expect("kernel gone")
    }

    // Spawn the host thread standing in for a fresh kernel stack. It
    // parks immediately; the first dispatch resumes it in fork_ret.
    fn alloc_kstack(&self, slot: usize, tidx: usize) -> std::io::Result<Kstack> {
        let context = Context::new();
        let ctx = context.clone();
        let k = self.arc();
        let handle = thread::Builder::new()
            .name(format!("kstack-{}.{}", slot, tidx))
            .spawn(move || {
                // born as if mid-swtch: table lock held, interrupts off
                spinlock::prime_kstack();
                ctx.wait();
                let cpu = k.ptable.proc[slot].thds[tidx].cpu.get().expect("kstack: no cpu");
                spinlock::set_cpu(cpu);
                k.fork_ret(slot, tidx);
            })?;
        Ok(Kstack {
            context,
            _thread: handle,
        })
    }

    // Look in the process table for an UNUSED slot. If found, change
    // state to EMBRYO and initialize state required to run in the
    // kernel. Otherwise return None.
    pub(crate) fn allocproc(&self) -> Option<usize> {
        self.ptable.lock.acquire();

        let slot = match self
            .ptable
            .proc
            .iter()
            .position(|p| p.state.get() == ProcState::UNUSED)
        {
            Some(slot) => slot,
            None => {
                self.ptable.lock.release();
                return None;
            }
        };

        let p = &self.ptable.proc[slot];
        p.state.set(ProcState::EMBRYO);
        p.pid.set(self.ptable.alloc_pid());
        self.policy.setup_proc(self, slot);

        self.ptable.lock.release();

        // Allocate the kernel stack. Spawning may block in the host,
        // so the table lock is not held across it.
        match self.alloc_kstack(slot, 0) {
            Ok(ks) => unsafe {
                *p.thds[0].kstack.get() = Some(ks);
            },
            Err(_) => {
                p.state.set(ProcState::UNUSED);
                if self.policy.threads() {
                    p.thds[0].tid.set(0);
                    p.thds[0].state.set(ProcState::UNUSED);
                }
                return None;
            }
        }

        // Fresh trap frame; the saved context enters fork_ret, which
        // returns to user space.
        unsafe {
            *p.thds[0].tf.get() = Trapframe::new();
        }
        p.tid.set(0);

        Some(slot)
    }

    // Set up the first user process.
    pub fn userinit(&self) {
        let slot = self.allocproc().expect("userinit: out of procs");
        self.initproc.set(Some(slot));
        let p = &self.ptable.proc[slot];
        let data = unsafe { &mut *p.data.get() };

        let mut uvm = Uvm::create().expect("userinit: out of memory?");
        uvm.init(&INITCODE);
        data.uvm = Some(uvm);
        data.sz = PGSIZE;

        let tf = unsafe { &mut *p.thds[0].tf.get() };
        *tf = Trapframe::new();
        tf.cs = (SEG_UCODE << 3) | DPL_USER;
        tf.ds = (SEG_UDATA << 3) | DPL_USER;
        tf.es = tf.ds;
        tf.ss = tf.ds;
        tf.eflags = Eflags::IF.bits();
        tf.esp = PGSIZE;
        tf.eip = 0; // beginning of initcode

        data.name.push_str("initcode");
        data.cwd = self.fs.namei("/");

        // this assignment lets other cores run this process. the
        // acquire forces the above writes to be visible to them.
        self.ptable.lock.acquire();
        p.state.set(ProcState::RUNNABLE);
        if self.policy.threads() {
            p.thds[0].state.set(ProcState::RUNNABLE);
        }
        self.ptable.lock.release();
    }

    // Grow the current process's memory by n bytes.
    // Threads of one process grow a shared space, so the threaded
    // policy serializes here under the table lock.
    pub(crate) fn growproc(&self, slot: usize, tidx: usize, n: isize) -> Result<(), ()> {
        let p = &self.ptable.proc[slot];
        if self.policy.threads() {
            self.ptable.lock.acquire();
        }
        let data = unsafe { &mut *p.data.get() };
        let mut sz = data.sz;
        if n > 0 {
            match data.uvm.as_mut().unwrap().alloc(sz, sz + n as usize) {
                Some(newsz) => sz = newsz,
                None => {
                    if self.policy.threads() {
                        self.ptable.lock.release();
                    }
                    return Err(());
                }
            }
        } else if n < 0 {
            sz = data.uvm.as_mut().unwrap().dealloc(sz, (sz as isize + n) as usize);
        }
        data.sz = sz;
        let cpu = p.thds[tidx].cpu.get().expect("growproc: no cpu");
        self.switchuvm(cpu, slot);
        if self.policy.threads() {
            self.ptable.lock.release();
        }
        Ok(())
    }

    // Create a new process copying the caller. Sets up the child's
    // main thread to return as if from the fork system call.
    pub(crate) fn fork(&self, slot: usize) -> Result<usize, ()> {
        let cur = &self.ptable.proc[slot];
        let cur_tid = cur.tid.get();

        let ns = self.allocproc().ok_or(())?;
        let np = &self.ptable.proc[ns];
        let data = unsafe { &mut *cur.data.get() };
        let ndata = unsafe { &mut *np.data.get() };

        // Copy the address space.
        match data.uvm.as_ref().unwrap().copy(data.sz) {
            Some(uvm) => ndata.uvm = Some(uvm),
            None => {
                unsafe {
                    (*np.thds[0].kstack.get()).take();
                }
                np.state.set(ProcState::UNUSED);
                if self.policy.threads() {
                    np.thds[0].state.set(ProcState::UNUSED);
                }
                return Err(());
            }
        }
        ndata.sz = data.sz;
        np.parent.set(Some(slot));

        // Copy saved user registers; fork returns 0 in the child.
        let tf = unsafe { &*cur.thds[cur_tid].tf.get() };
        let ntf = unsafe { &mut *np.thds[0].tf.get() };
        *ntf = *tf;
        ntf.eax = 0;

        // Duplicate open file descriptors and the working directory.
        for (fd, f) in data.ofile.iter().enumerate() {
            if let Some(f) = f {
                ndata.ofile[fd] = Some(File::dup(f));
            }
        }
        ndata.cwd = data.cwd.as_ref().map(|ip| ip.dup());

        ndata.name.clear();
        ndata.name.push_str(&data.name);

        let pid = np.pid.get();

        self.ptable.lock.acquire();
        np.state.set(ProcState::RUNNABLE);
        if self.policy.threads() {
            np.thds[0].state.set(ProcState::RUNNABLE);
            // the child's main thread runs on the stack the caller's
            // active thread was using, so swap the two descriptors
            ndata.ustacks = data.ustacks;
            ndata.ustacks[0] = data.ustacks[cur_tid];
            ndata.ustacks[cur_tid] = data.ustacks[0];
        }
        self.ptable.lock.release();

        Ok(pid)
    }

    // Exit the current process. Does not return. An exited process
    // remains a zombie until its parent calls wait().
    pub(crate) fn exit(&self, slot: usize, tidx: usize) -> ! {
        assert!(
            self.initproc.get() != Some(slot),
            "init exiting"
        );
        let p = &self.ptable.proc[slot];
        let data = unsafe { &mut *p.data.get() };

        // Close all open files.
        for fd in data.ofile.iter_mut() {
            fd.take();
        }

        self.fs.log.begin_op();
        data.cwd.take();
        self.fs.log.end_op();

        self.ptable.lock.acquire();

        // Parent might be sleeping in wait().
        let parent = p.parent.get().expect("exit: no parent");
        self.wakeup1(Chan::Proc(parent));

        // Pass abandoned children to init.
        let initslot = self.initproc.get().expect("exit: no init");
        for pp in self.ptable.proc.iter() {
            if pp.parent.get() == Some(slot) {
                pp.parent.set(Some(initslot));
                if pp.state.get() == ProcState::ZOMBIE {
                    self.wakeup1(Chan::Proc(initslot));
                }
            }
        }

        p.state.set(ProcState::ZOMBIE);
        if self.policy.threads() {
            for t in p.thds.iter() {
                if t.state.get() != ProcState::UNUSED {
                    t.state.set(ProcState::ZOMBIE);
                }
            }
        }

        // Jump into the scheduler, never to return.
        self.sched(slot, tidx);
        panic!("zombie exit");
    }

    // Wait for a child process to exit; return its pid, or None if
    // this process has no children or has itself been killed.
    pub(crate) fn wait(&self, slot: usize) -> Option<usize> {
        let cur = &self.ptable.proc[slot];
        self.ptable.lock.acquire();
        loop {
            // Scan the table looking for exited children.
            let mut havekids = false;
            for p in self.ptable.proc.iter() {
                if p.parent.get() != Some(slot) {
                    continue;
                }
                havekids = true;
                if p.state.get() == ProcState::ZOMBIE {
                    // Found one.
                    let pid = p.pid.get();
                    let data = unsafe { &mut *p.data.get() };
                    for (i, t) in p.thds.iter().enumerate() {
                        t.tid.set(0);
                        t.state.set(ProcState::UNUSED);
                        t.chan.set(None);
                        t.retval.set(0);
                        data.ustacks[i] = 0;
                        unsafe {
                            (*t.kstack.get()).take();
                            (*t.pending.get()).clear();
                        }
                    }
                    data.uvm.take();
                    data.sz = 0;
                    data.name.clear();
                    p.pid.set(0);
                    p.parent.set(None);
                    p.killed.set(false);
                    p.chan.set(None);
                    p.level.set(0);
                    p.ticks.set(0);
                    p.priority.set(0);
                    p.tid.set(0);
                    p.state.set(ProcState::UNUSED);
                    self.ptable.lock.release();
                    return Some(pid);
                }
            }

            // No point waiting if we don't have any children.
            if !havekids || cur.killed.get() {
                self.ptable.lock.release();
                return None;
            }

            // Wait for children to exit. (See wakeup1 call in exit.)
            self.sleep(slot, cur.tid.get(), Chan::Proc(slot), &self.ptable.lock);
        }
    }

    // Enter scheduler. Must hold only the ptable lock and have
    // changed the caller's state. Saves and restores intena because
    // intena is a property of this kernel thread, not this CPU.
    pub(crate) fn sched(&self, slot: usize, tidx: usize) {
        let p = &self.ptable.proc[slot];
        let t = &p.thds[tidx];

        assert!(self.ptable.lock.holding(), "sched ptable.lock");
        assert!(spinlock::ncli() == 1, "sched locks");
        if self.policy.threads() {
            assert!(t.state.get() != ProcState::RUNNING, "sched running");
        } else {
            assert!(p.state.get() != ProcState::RUNNING, "sched running");
        }
        assert!(!spinlock::intr_get(), "sched interruptible");

        let intena = spinlock::intena();
        let cpu = t.cpu.get().expect("sched: no cpu");
        let ctx = unsafe { (*t.kstack.get()).as_ref().expect("sched: no kstack").context.clone() };
        swtch(&ctx, &self.cpus[cpu].context);
        // dispatched again, possibly on another cpu
        spinlock::set_cpu(t.cpu.get().expect("sched: no cpu"));
        spinlock::set_intena(intena);
    }

    // Give up the CPU for one scheduling round.
    pub(crate) fn yielding(&self, slot: usize, tidx: usize) {
        self.ptable.lock.acquire();
        let p = &self.ptable.proc[slot];
        p.state.set(ProcState::RUNNABLE);
        if self.policy.threads() {
            p.thds[tidx].state.set(ProcState::RUNNABLE);
        }
        self.sched(slot, tidx);
        self.ptable.lock.release();
    }

    // A fork child's very first scheduling by scheduler() swtches
    // here. "Return" to user space.
    fn fork_ret(&self, slot: usize, tidx: usize) -> ! {
        // Still holding ptable.lock from scheduler.
        self.ptable.lock.release();

        if self.first.swap(false, Ordering::SeqCst) {
            // File system initialization must run in the context of a
            // regular process (it may sleep), and so cannot be run
            // from the boot path.
            self.fs.init(ROOTDEV);
            self.utable.load(&self.fs);
        }

        self.usertrap_ret(slot, tidx)
    }

    // Atomically release lk and sleep on chan; reacquire lk when
    // awakened. The ptable lock is taken first, which makes a missed
    // wakeup impossible: wakeup runs with the ptable lock held.
    pub(crate) fn sleep(&self, slot: usize, tidx: usize, chan: Chan, lk: &SpinLock) {
        assert!(lk.holding(), "sleep without lk");

        if !std::ptr::eq(lk, &self.ptable.lock) {
            self.ptable.lock.acquire();
            lk.release();
        }

        // Go to sleep.
        let p = &self.ptable.proc[slot];
        if self.policy.threads() {
            let t = &p.thds[tidx];
            t.chan.set(Some(chan));
            t.state.set(ProcState::SLEEPING);
            self.sched(slot, tidx);
            t.chan.set(None);
        } else {
            p.chan.set(Some(chan));
            p.state.set(ProcState::SLEEPING);
            self.sched(slot, tidx);
            p.chan.set(None);
        }

        // Reacquire original lock.
        if !std::ptr::eq(lk, &self.ptable.lock) {
            self.ptable.lock.release();
            lk.acquire();
        }
    }

    // Wake up all sleepers on chan. The ptable lock must be held.
    pub(crate) fn wakeup1(&self, chan: Chan) {
        if self.policy.threads() {
            for p in self.ptable.proc.iter() {
                if p.state.get() == ProcState::RUNNABLE {
                    for t in p.thds.iter() {
                        if t.state.get() == ProcState::SLEEPING && t.chan.get() == Some(chan) {
                            t.state.set(ProcState::RUNNABLE);
                        }
                    }
                }
            }
        } else {
            for p in self.ptable.proc.iter() {
                if p.state.get() == ProcState::SLEEPING && p.chan.get() == Some(chan) {
                    p.state.set(ProcState::RUNNABLE);
                }
            }
        }
    }

    // Wake up all sleepers on chan.
    pub fn wakeup(&self, chan: Chan) {
        self.ptable.lock.acquire();
        self.wakeup1(chan);
        self.ptable.lock.release();
    }

    // Kill the process with the given pid. The victim won't exit
    // until it next returns toward user space (see trap.rs).
    pub fn kill(&self, pid: usize) -> Result<(), ()> {
        self.ptable.lock.acquire();
        for p in self.ptable.proc.iter() {
            if p.pid.get() == pid {
                p.killed.set(true);
                // Wake it from sleep so it notices promptly.
                if self.policy.threads() {
                    for t in p.thds.iter() {
                        if t.state.get() == ProcState::SLEEPING {
                            t.state.set(ProcState::RUNNABLE);
                        }
                    }
                } else if p.state.get() == ProcState::SLEEPING {
                    p.state.set(ProcState::RUNNABLE);
                }
                self.ptable.lock.release();
                return Ok(());
            }
        }
        self.ptable.lock.release();
        Err(())
    }

    // Current queue level of the caller. Queue policies only.
    pub(crate) fn getlev(&self, slot: usize) -> i32 {
        if self.policy.threads() {
            panic!("getlev");
        }
        self.ptable.proc[slot].level.get() as i32
    }

    // Set the priority of a child of the caller. MLFQ only.
    pub(crate) fn setpriority(&self, slot: usize, pid: usize, priority: i32) -> i32 {
        if !self.policy.mlfq() {
            panic!("setpriority");
        }
        if !(0..=10).contains(&priority) {
            return -2;
        }
        self.ptable.lock.acquire();
        for p in self.ptable.proc.iter() {
            if p.pid.get() == pid && p.parent.get() == Some(slot) {
                p.priority.set(priority as u32);
                self.ptable.lock.release();
                return 0;
            }
        }
        self.ptable.lock.release();
        -1
    }

    // Put every process back in the top queue with a fresh quantum.
    // Priorities are left alone. The ptable lock must be held.
    pub(crate) fn priority_boosting(&self) {
        for p in self.ptable.proc.iter() {
            if p.pid.get() > 0 {
                p.level.set(0);
                p.ticks.set(0);
            }
        }
    }

    // Create a thread in the current process running start_routine
    // with one argument. The new thread's id is stored to thread_addr
    // in user memory. Threaded policy only.
    pub(crate) fn thread_create(
        &self,
        slot: usize,
        thread_addr: usize,
        start_routine: usize,
        arg: u32,
    ) -> Result<(), ()> {
        if !self.policy.threads() {
            panic!("thread_create");
        }
        let p = &self.ptable.proc[slot];

        self.ptable.lock.acquire();

        let ti = match p
            .thds
            .iter()
            .position(|t| t.state.get() == ProcState::UNUSED)
        {
            Some(ti) => ti,
            None => {
                self.ptable.lock.release();
                return Err(());
            }
        };
        let t = &p.thds[ti];
        t.state.set(ProcState::EMBRYO);
        t.tid.set(self.ptable.alloc_tid());

        match self.thread_stack(slot, ti, thread_addr, start_routine, arg) {
            Ok(()) => {
                t.state.set(ProcState::RUNNABLE);
                self.ptable.lock.release();
                Ok(())
            }
            Err(()) => {
                unsafe {
                    (*t.kstack.get()).take();
                }
                t.tid.set(0);
                t.state.set(ProcState::UNUSED);
                self.ptable.lock.release();
                Err(())
            }
        }
    }

    // Build the kernel and user stacks of a new thread; the slot is
    // already EMBRYO with a fresh tid. ptable lock must be held.
    fn thread_stack(
        &self,
        slot: usize,
        ti: usize,
        thread_addr: usize,
        start_routine: usize,
        arg: u32,
    ) -> Result<(), ()> {
        let p = &self.ptable.proc[slot];
        let t = &p.thds[ti];

        let ks = self.alloc_kstack(slot, ti).map_err(|_| ())?;
        unsafe {
            *t.kstack.get() = Some(ks);
        }

        let data = unsafe { &mut *p.data.get() };

        // Start from a copy of the caller's frame.
        unsafe {
            *t.tf.get() = *p.thds[p.tid.get()].tf.get();
        }

        // Make sure this slot has a user stack; stacks left behind by
        // joined threads are reused.
        if data.ustacks[ti] == 0 {
            let sz = pgroundup(data.sz);
            let newsz = data.uvm.as_mut().unwrap().alloc(sz, sz + PGSIZE).ok_or(())?;
            data.ustacks[ti] = newsz;
            data.sz = newsz;
        }

        // Push the argument and a fake return PC.
        let mut sp = data.ustacks[ti];
        sp -= 4;
        data.uvm.as_mut().unwrap().copyout(sp, &arg)?;
        sp -= 4;
        data.uvm.as_mut().unwrap().copyout(sp, &0xffff_ffffu32)?;

        let tf = unsafe { &mut *t.tf.get() };
        tf.eip = start_routine;
        tf.esp = sp;

        let tid = t.tid.get() as u32;
        data.uvm.as_mut().unwrap().copyout(thread_addr, &tid)?;
        Ok(())
    }

    // Terminate the calling thread, leaving retval for a joiner.
    // Does not return. Threaded policy only.
    pub(crate) fn thread_exit(&self, slot: usize, tidx: usize, retval: u32) -> ! {
        if !self.policy.threads() {
            panic!("thread_exit");
        }
        let t = &self.ptable.proc[slot].thds[tidx];

        self.ptable.lock.acquire();
        self.wakeup1(Chan::Thread(t.tid.get()));
        t.retval.set(retval as usize);
        t.state.set(ProcState::ZOMBIE);
        self.sched(slot, tidx);
        panic!("zombie exit");
    }

    // Wait for the thread with the given id to exit, store its retval
    // to retval_addr in user memory, and free its slot. Threaded
    // policy only.
    pub(crate) fn thread_join(
        &self,
        slot: usize,
        tidx: usize,
        tid: usize,
        retval_addr: usize,
    ) -> Result<(), ()> {
        if !self.policy.threads() {
            panic!("thread_join");
        }

        self.ptable.lock.acquire();

        // The scan only visits processes that are RUNNABLE.
        let mut found = None;
        'search: for pp in self.ptable.proc.iter() {
            if pp.state.get() != ProcState::RUNNABLE {
                continue;
            }
            for t in pp.thds.iter() {
                if t.state.get() != ProcState::UNUSED && t.tid.get() == tid {
                    found = Some(t);
                    break 'search;
                }
            }
        }
        let t = match found {
            Some(t) => t,
            None => {
                self.ptable.lock.release();
                return Err(());
            }
        };

        if t.state.get() != ProcState::ZOMBIE {
            self.sleep(slot, tidx, Chan::Thread(tid), &self.ptable.lock);
        }

        if retval_addr != 0 {
            let data = unsafe { &mut *self.ptable.proc[slot].data.get() };
            let retval = t.retval.get() as u32;
            // a bad address still reaps the thread below
            let _ = data.uvm.as_mut().unwrap().copyout(retval_addr, &retval);
        }

        unsafe {
            (*t.kstack.get()).take();
            (*t.pending.get()).clear();
        }
        t.retval.set(0);
        t.tid.set(0);
        t.chan.set(None);
        t.state.set(ProcState::UNUSED);

        self.ptable.lock.release();
        Ok(())
    }

    // Print a process listing to the console. For debugging. No lock
    // to avoid wedging a stuck machine further.
    pub fn procdump(&self) {
        for p in self.ptable.proc.iter() {
            if p.state.get() == ProcState::UNUSED {
                continue;
            }
            let data = unsafe { &*p.data.get() };
            println!(
                "{} {:?} {}",
                p.pid.get(),
                p.state.get(),
                data.name
            );
        }
    }
}

// Introspection for the outside context: the demo binary and the
// tests read kernel state through these instead of poking the table.
impl Kernel {
    // slot of a live pid; ptable lock must be held
    fn slot_of(&self, pid: usize) -> Option<usize> {
        if pid == 0 {
            return None;
        }
        self.ptable
            .proc
            .iter()
            .position(|p| p.pid.get() == pid && p.state.get() != ProcState::UNUSED)
    }

    pub fn ticks(&self) -> u32 {
        self.tickslock.acquire();
        let t = self.ticks.get();
        self.tickslock.release();
        t
    }

    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }

    pub fn init_pid(&self) -> usize {
        let slot = self.initproc.get().expect("no init process");
        self.ptable.proc[slot].pid.get()
    }

    pub fn state_of(&self, pid: usize) -> Option<ProcState> {
        self.ptable.lock.acquire();
        let r = self.slot_of(pid).map(|s| self.ptable.proc[s].state.get());
        self.ptable.lock.release();
        r
    }

    pub fn thread_state_of(&self, pid: usize, tidx: usize) -> Option<ProcState> {
        self.ptable.lock.acquire();
        let r = self
            .slot_of(pid)
            .map(|s| self.ptable.proc[s].thds[tidx].state.get());
        self.ptable.lock.release();
        r
    }

    pub fn level_of(&self, pid: usize) -> Option<usize> {
        self.ptable.lock.acquire();
        let r = self.slot_of(pid).map(|s| self.ptable.proc[s].level.get());
        self.ptable.lock.release();
        r
    }

    pub fn queue_ticks_of(&self, pid: usize) -> Option<u32> {
        self.ptable.lock.acquire();
        let r = self.slot_of(pid).map(|s| self.ptable.proc[s].ticks.get());
        self.ptable.lock.release();
        r
    }

    pub fn priority_of(&self, pid: usize) -> Option<u32> {
        self.ptable.lock.acquire();
        let r = self
            .slot_of(pid)
            .map(|s| self.ptable.proc[s].priority.get());
        self.ptable.lock.release();
        r
    }

    // pid of the process occupying a CPU, if any.
    pub fn current_on(&self, cpu: usize) -> Option<usize> {
        self.ptable.lock.acquire();
        let r = self.cpus[cpu]
            .proc
            .get()
            .map(|(s, _)| self.ptable.proc[s].pid.get());
        self.ptable.lock.release();
        r
    }

    // Saved trap frame of the pid's current thread.
    pub fn tf_of(&self, pid: usize) -> Option<Trapframe> {
        self.ptable.lock.acquire();
        let r = self.slot_of(pid).map(|s| {
            let p = &self.ptable.proc[s];
            unsafe { *p.thds[p.tid.get()].tf.get() }
        });
        self.ptable.lock.release();
        r
    }

    pub fn tf_of_thread(&self, pid: usize, tidx: usize) -> Option<Trapframe> {
        self.ptable.lock.acquire();
        let r = self
            .slot_of(pid)
            .map(|s| unsafe { *self.ptable.proc[s].thds[tidx].tf.get() });
        self.ptable.lock.release();
        r
    }

    // What the last system call left in the caller-saved return
    // register of the pid's current thread.
    pub fn syscall_return(&self, pid: usize) -> i32 {
        self.tf_of(pid).expect("syscall_return: no such pid").eax as i32
    }

    pub fn read_user_u32(&self, pid: usize, addr: usize) -> Option<u32> {
        self.ptable.lock.acquire();
        let r = self.slot_of(pid).and_then(|s| {
            let data = unsafe { &*self.ptable.proc[s].data.get() };
            let mut word = 0u32;
            data.uvm.as_ref()?.copyin(&mut word, addr).ok()?;
            Some(word)
        });
        self.ptable.lock.release();
        r
    }

    pub fn name_of(&self, pid: usize) -> Option<String> {
        self.ptable.lock.acquire();
        let r = self.slot_of(pid).map(|s| {
            let data = unsafe { &*self.ptable.proc[s].data.get() };
            data.name.clone()
        });
        self.ptable.lock.release();
        r
    }

    // Reference count on an open file, fork-duplication included.
    pub fn ofile_refs(&self, pid: usize, fd: usize) -> Option<usize> {
        self.ptable.lock.acquire();
        let r = self.slot_of(pid).and_then(|s| {
            let data = unsafe { &*self.ptable.proc[s].data.get() };
            data.ofile.get(fd)?.as_ref().map(Arc::strong_count)
        });
        self.ptable.lock.release();
        r
    }

    // Install a file into the lowest free descriptor of a process.
    pub fn fdalloc(&self, pid: usize, f: Arc<File>) -> Result<usize, ()> {
        self.ptable.lock.acquire();
        let r = (|| {
            let s = self.slot_of(pid).ok_or(())?;
            let data = unsafe { &mut *self.ptable.proc[s].data.get() };
            for (fd, slot) in data.ofile.iter_mut().enumerate() {
                if slot.is_none() {
                    *slot = Some(f);
                    return Ok(fd);
                }
            }
            Err(())
        })();
        self.ptable.lock.release();
        r
    }
}
