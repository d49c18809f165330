use crate::param::{BOOST_INTERVAL, MLFQ_K, NPROC, NTHREAD};
use crate::proc::{Kernel, ProcState};
use crate::spinlock;
use crate::swtch::swtch;

// Scheduling policy, chosen once when the kernel is built.
pub enum Policy {
    Threads,
    Multilevel,
    Mlfq,
}

impl Policy {
    pub(crate) fn build(self) -> Box<dyn Scheduler + Send + Sync> {
        match self {
            Policy::Threads => Box::new(RoundRobin),
            Policy::Multilevel => Box::new(Multilevel),
            Policy::Mlfq => Box::new(Mlfq),
        }
    }
}

// The pieces of the core that differ per policy. Everything else -
// lifecycle, sleep/wakeup, the table itself - is shared.
pub trait Scheduler {
    // Policy-specific fields of a freshly allocated process.
    // ptable lock must be held.
    fn setup_proc(&self, k: &Kernel, slot: usize);

    // One pass over the table: dispatch whatever the policy selects,
    // return how many units ran. ptable lock must be held; it rides
    // across every dispatch.
    fn pass(&self, k: &Kernel, cpu: usize) -> usize;

    // Under the ticks lock, right after the global counter advanced.
    // Returns whether a priority boost is due.
    fn clock(&self, k: &Kernel) -> bool {
        let _ = k;
        false
    }

    // Per-tick bookkeeping after the ticks lock is dropped. `running`
    // is the process the interrupt cut into on this CPU, if any.
    fn on_tick(&self, k: &Kernel, running: Option<usize>, boost: bool) {
        let _ = (k, running, boost);
    }

    // Should the interrupted unit give up the CPU?
    fn wants_yield(&self, k: &Kernel, slot: usize, tidx: usize) -> bool;

    fn threads(&self) -> bool {
        false
    }

    fn mlfq(&self) -> bool {
        false
    }
}

// Default policy: round-robin over the threads of each runnable
// process, itself visited in table order.
pub struct RoundRobin;

impl Scheduler for RoundRobin {
    fn setup_proc(&self, k: &Kernel, slot: usize) {
        let t = &k.ptable.proc[slot].thds[0];
        t.state.set(ProcState::EMBRYO);
        t.tid.set(k.ptable.alloc_tid());
    }

    fn pass(&self, k: &Kernel, cpu: usize) -> usize {
        let mut dispatched = 0;
        for slot in 0..NPROC {
            let p = &k.ptable.proc[slot];
            if p.state.get() != ProcState::RUNNABLE {
                continue;
            }
            // Cycle the thread slots starting at the current one,
            // stopping once we come back around to it. Each dispatch
            // moves the current index, so the stop point moves too.
            let mut around = false;
            let mut ti = p.tid.get();
            loop {
                if p.thds[ti].state.get() == ProcState::RUNNABLE {
                    k.dispatch(cpu, slot, ti);
                    dispatched += 1;
                }
                if around && ti == p.tid.get() {
                    break;
                }
                around = true;
                ti = (ti + 1) % NTHREAD;
            }
        }
        dispatched
    }

    fn wants_yield(&self, k: &Kernel, slot: usize, tidx: usize) -> bool {
        k.ptable.proc[slot].thds[tidx].state.get() == ProcState::RUNNING
    }

    fn threads(&self) -> bool {
        true
    }
}

// Two classes by queue level, assigned pid mod 2 at allocation.
// Class 0 runs round-robin and starves class 1; class 1 runs one at
// a time, oldest pid first, and is never preempted by the clock.
pub struct Multilevel;

impl Scheduler for Multilevel {
    fn setup_proc(&self, k: &Kernel, slot: usize) {
        let p = &k.ptable.proc[slot];
        p.level.set(p.pid.get() % 2);
    }

    fn pass(&self, k: &Kernel, cpu: usize) -> usize {
        let mut dispatched = 0;

        let round_robin = k
            .ptable
            .proc
            .iter()
            .any(|p| p.state.get() == ProcState::RUNNABLE && p.level.get() == 0);

        if round_robin {
            for slot in 0..NPROC {
                let p = &k.ptable.proc[slot];
                if p.state.get() != ProcState::RUNNABLE || p.level.get() != 0 {
                    continue;
                }
                k.dispatch(cpu, slot, 0);
                dispatched += 1;
            }
        } else {
            // first-come-first-served: smallest pid wins
            let mut point: Option<usize> = None;
            for slot in 0..NPROC {
                let p = &k.ptable.proc[slot];
                if p.state.get() != ProcState::RUNNABLE || p.level.get() != 1 {
                    continue;
                }
                if point.map_or(true, |q| k.ptable.proc[q].pid.get() > p.pid.get()) {
                    point = Some(slot);
                }
            }
            if let Some(slot) = point {
                k.dispatch(cpu, slot, 0);
                dispatched += 1;
            }
        }

        dispatched
    }

    fn wants_yield(&self, k: &Kernel, slot: usize, _tidx: usize) -> bool {
        let p = &k.ptable.proc[slot];
        p.level.get() == 0 && p.state.get() == ProcState::RUNNING
    }
}

// Multilevel feedback queue with MLFQ_K levels. A process burns a
// quantum of 4*level + 2 ticks per level before it is demoted; every
// BOOST_INTERVAL global ticks everyone returns to the top.
pub struct Mlfq;

impl Scheduler for Mlfq {
    fn setup_proc(&self, k: &Kernel, slot: usize) {
        let p = &k.ptable.proc[slot];
        p.level.set(0);
        p.priority.set(0);
        p.ticks.set(0);
    }

    fn pass(&self, k: &Kernel, cpu: usize) -> usize {
        let mut point: Option<usize> = None;
        for slot in 0..NPROC {
            let p = &k.ptable.proc[slot];
            if p.state.get() != ProcState::RUNNABLE {
                continue;
            }
            let level = p.level.get();
            if level >= MLFQ_K {
                continue;
            }
            point = Some(match point {
                None => slot,
                Some(q) => {
                    let b = &k.ptable.proc[q];
                    if b.level.get() != level {
                        if b.level.get() > level {
                            slot
                        } else {
                            q
                        }
                    } else if (b.ticks.get() > 0) != (p.ticks.get() > 0) {
                        // mid-quantum beats a fresh quantum
                        if p.ticks.get() > 0 {
                            slot
                        } else {
                            q
                        }
                    } else if b.priority.get() != p.priority.get() {
                        if b.priority.get() < p.priority.get() {
                            slot
                        } else {
                            q
                        }
                    } else if b.pid.get() > p.pid.get() {
                        slot
                    } else {
                        q
                    }
                }
            });
        }

        match point {
            None => {
                // nothing runnable: boost while the cpu has nothing
                // better to do
                k.priority_boosting();
                0
            }
            Some(slot) => {
                k.dispatch(cpu, slot, 0);
                1
            }
        }
    }

    fn clock(&self, k: &Kernel) -> bool {
        let t = k.ticks.get();
        if t % BOOST_INTERVAL == 0 {
            // keep the counter clear of 32-bit wraparound
            if t == 4_294_967_200 {
                k.ticks.set(0);
            }
            return true;
        }
        false
    }

    fn on_tick(&self, k: &Kernel, running: Option<usize>, boost: bool) {
        k.ptable.lock.acquire();
        if boost {
            k.priority_boosting();
        } else if let Some(slot) = running {
            let p = &k.ptable.proc[slot];
            if p.state.get() == ProcState::RUNNING && p.level.get() < MLFQ_K {
                let ticks = p.ticks.get() + 1;
                p.ticks.set(ticks);
                if ticks >= 4 * p.level.get() as u32 + 2 {
                    p.level.set(p.level.get() + 1);
                    p.ticks.set(0);
                }
            }
        }
        k.ptable.lock.release();
    }

    fn wants_yield(&self, k: &Kernel, slot: usize, _tidx: usize) -> bool {
        // ticks goes back to zero exactly at a demotion or boost, so
        // this hands the cpu over at the end of each quantum
        let p = &k.ptable.proc[slot];
        p.state.get() == ProcState::RUNNING && p.ticks.get() == 0
    }
}

impl Kernel {
    // Hand the CPU to a schedulable unit. ptable lock must be held;
    // the unit inherits it and the scheduler takes it back when the
    // unit swtches out.
    pub(crate) fn dispatch(&self, cpu: usize, slot: usize, tidx: usize) {
        let c = &self.cpus[cpu];
        let p = &self.ptable.proc[slot];
        let t = &p.thds[tidx];

        p.tid.set(tidx);
        c.proc.set(Some((slot, tidx)));
        self.switchuvm(cpu, slot);
        if self.policy.threads() {
            t.state.set(ProcState::RUNNING);
        } else {
            p.state.set(ProcState::RUNNING);
        }
        t.cpu.set(Some(cpu));

        let ctx = unsafe {
            (*t.kstack.get())
                .as_ref()
                .expect("dispatch: no kstack")
                .context
                .clone()
        };
        swtch(&c.context, &ctx);

        // the unit handed the cpu back
        self.switchkvm(cpu);
        c.proc.set(None);
        t.cpu.set(None);
    }

    // Per-CPU scheduler. Never returns. Each iteration waits for the
    // outside context to hand over the CPU, then keeps making passes
    // until nothing more is runnable.
    pub(crate) fn scheduler(&self, cpu: usize) -> ! {
        spinlock::set_cpu(cpu);
        let c = &self.cpus[cpu];
        loop {
            c.context.wait();
            loop {
                // interrupts would land here on hardware
                spinlock::sti();

                self.ptable.lock.acquire();
                let n = self.policy.pass(self, cpu);
                self.ptable.lock.release();

                if n == 0 {
                    break;
                }
            }
            // nothing runnable; idle until kicked again
            self.outside.resume();
        }
    }
}
