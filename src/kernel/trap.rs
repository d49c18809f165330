use crate::param::NCPU;
use crate::proc::{Chan, Kernel, Trap};
use crate::swtch::swtch;
use crate::syscall::{self, Sys};
use std::thread;
use std::time::Duration;

// How long the outside context waits for the kernel to hand the
// baton back before declaring it wedged.
const OUTSIDE_TIMEOUT: Duration = Duration::from_secs(10);

// What a CPU was left doing when control came back outside.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CpuState {
    // scheduler parked, nothing runnable
    Idle,
    // this pid is sitting in user space and owns the CPU until it traps
    User(usize),
}

// The outside face of the trap machinery. On hardware the clock and
// the syscall instruction drive the kernel; here the embedding test
// or demo binary does, through these three entry points.
impl Kernel {
    // Hand a CPU to its scheduler loop and wait for the machine to
    // quiesce: either the scheduler runs out of runnable work, or
    // some process is left running in user space.
    pub fn run(&self, cpu: usize) -> CpuState {
        assert!(cpu < NCPU, "run: no such cpu");
        let c = &self.cpus[cpu];

        if let Some((slot, _)) = c.proc.get() {
            // a process owns this cpu until it traps
            return CpuState::User(self.ptable.proc[slot].pid.get());
        }

        if !c.started.get() {
            c.started.set(true);
            let k = self.arc();
            let handle = thread::Builder::new()
                .name(format!("cpu{}", cpu))
                .spawn(move || {
                    k.scheduler(cpu);
                })
                .expect("run: cannot start cpu");
            unsafe {
                *self.cpus[cpu].handle.get() = Some(handle);
            }
        }

        c.context.resume();
        self.outside.wait_for(OUTSIDE_TIMEOUT);

        match c.proc.get() {
            Some((slot, _)) => CpuState::User(self.ptable.proc[slot].pid.get()),
            None => CpuState::Idle,
        }
    }

    // Deliver a timer interrupt to a CPU. If a process is running
    // there, the tick is taken on its kernel stack and may make it
    // yield; an idle CPU just services the clock.
    pub fn tick(&self, cpu: usize) {
        assert!(cpu < NCPU, "tick: no such cpu");
        match self.cpus[cpu].proc.get() {
            Some((slot, tidx)) => {
                let t = &self.ptable.proc[slot].thds[tidx];
                assert!(t.inuser.get(), "tick: cpu busy in kernel");
                unsafe {
                    (*t.pending.get()).push_back(Trap::Timer);
                }
                let ctx = unsafe {
                    (*t.kstack.get()).as_ref().expect("tick: no kstack").context.clone()
                };
                ctx.resume();
                self.outside.wait_for(OUTSIDE_TIMEOUT);
            }
            None => self.clock_tick(cpu, None),
        }
    }

    // Queue a system call on a process's current thread and, if that
    // thread is sitting in user space, take the trap now. Returns
    // whether the trap was taken; otherwise it stays queued until the
    // thread next returns to user space.
    pub fn syscall(&self, pid: usize, call: Sys) -> bool {
        match self.find(pid) {
            Some(slot) => {
                let tidx = self.ptable.proc[slot].tid.get();
                self.deliver(slot, tidx, Trap::Syscall(call))
            }
            None => false,
        }
    }

    // Like syscall, but aimed at one particular thread slot.
    pub fn syscall_to(&self, pid: usize, tidx: usize, call: Sys) -> bool {
        match self.find(pid) {
            Some(slot) => self.deliver(slot, tidx, Trap::Syscall(call)),
            None => false,
        }
    }

    fn find(&self, pid: usize) -> Option<usize> {
        self.ptable.lock.acquire();
        let slot = self.ptable.proc.iter().position(|p| {
            p.pid.get() == pid && p.state.get() != crate::proc::ProcState::UNUSED
        });
        self.ptable.lock.release();
        slot
    }

    fn deliver(&self, slot: usize, tidx: usize, tr: Trap) -> bool {
        let t = &self.ptable.proc[slot].thds[tidx];
        unsafe {
            (*t.pending.get()).push_back(tr);
        }
        if !t.inuser.get() {
            return false;
        }
        let ctx = unsafe {
            (*t.kstack.get())
                .as_ref()
                .expect("deliver: no kstack")
                .context
                .clone()
        };
        ctx.resume();
        self.outside.wait_for(OUTSIDE_TIMEOUT);
        true
    }

    // The timer arm of the trap path. CPU 0 owns the global clock;
    // every CPU runs the policy's per-tick bookkeeping for whatever
    // the interrupt cut into.
    pub(crate) fn clock_tick(&self, cpu: usize, running: Option<usize>) {
        let mut boost = false;
        if cpu == 0 {
            self.tickslock.acquire();
            self.ticks.set(self.ticks.get().wrapping_add(1));
            boost = self.policy.clock(self);
            self.wakeup(Chan::Ticks);
            self.tickslock.release();
        }
        self.policy.on_tick(self, running, boost);
    }

    // "Return" to user space. The simulated user program runs by
    // taking whatever traps the outside context has queued; when none
    // are queued the thread parks, which is this machine's picture of
    // user-mode execution.
    pub(crate) fn usertrap_ret(&self, slot: usize, tidx: usize) -> ! {
        loop {
            let t = &self.ptable.proc[slot].thds[tidx];
            let tr = unsafe { (*t.pending.get()).pop_front() };
            match tr {
                Some(tr) => self.usertrap(slot, tidx, tr),
                None => {
                    t.inuser.set(true);
                    let ctx = unsafe {
                        (*t.kstack.get())
                            .as_ref()
                            .expect("usertrap_ret: no kstack")
                            .context
                            .clone()
                    };
                    swtch(&ctx, &self.outside);
                    t.inuser.set(false);
                }
            }
        }
    }

    // Handle one trap taken from user space.
    fn usertrap(&self, slot: usize, tidx: usize, tr: Trap) {
        let p = &self.ptable.proc[slot];
        match tr {
            Trap::Syscall(call) => {
                if p.killed.get() {
                    self.exit(slot, tidx);
                }
                let r = syscall::dispatch(self, slot, tidx, call);
                unsafe {
                    (*p.thds[tidx].tf.get()).eax = r as usize;
                }
                if p.killed.get() {
                    self.exit(slot, tidx);
                }
                // system calls go straight back to user space
                return;
            }
            Trap::Timer => {
                let cpu = p.thds[tidx].cpu.get().expect("usertrap: no cpu");
                self.clock_tick(cpu, Some(slot));
            }
        }

        // Force the exit of a killed process while it is in user space.
        if p.killed.get() {
            self.exit(slot, tidx);
        }

        // Give up the CPU per policy.
        if self.policy.wants_yield(self, slot, tidx) {
            self.yielding(slot, tidx);
        }

        // Check again: it may have been killed since the yield.
        if p.killed.get() {
            self.exit(slot, tidx);
        }
    }
}
