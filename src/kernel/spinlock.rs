use crate::param::NCPU;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

// Tag for a kernel stack that is not executing on any simulated CPU
// (the boot/driver context that feeds the kernel interrupts and traps).
pub const NOCPU: usize = NCPU;

const NOBODY: usize = usize::MAX;

thread_local! {
    // Interrupt state of the current kernel stack. On hardware this
    // lives in the CPU's flag register and per-CPU struct; here every
    // host thread is one kernel stack and only one of them runs at a
    // time, so the state can ride along with the stack itself.
    static NCLI: Cell<i32> = Cell::new(0);
    static INTENA: Cell<bool> = Cell::new(false);
    static INTR: Cell<bool> = Cell::new(false);
    static CPU: Cell<usize> = Cell::new(NOCPU);
}

// Enable interrupts on the current kernel stack.
pub fn sti() {
    INTR.with(|i| i.set(true));
}

// Disable interrupts on the current kernel stack.
pub fn cli() {
    INTR.with(|i| i.set(false));
}

pub fn intr_get() -> bool {
    INTR.with(|i| i.get())
}

pub fn ncli() -> i32 {
    NCLI.with(|n| n.get())
}

pub fn intena() -> bool {
    INTENA.with(|e| e.get())
}

pub fn set_intena(intena: bool) {
    INTENA.with(|e| e.set(intena));
}

// Which simulated CPU this kernel stack is executing on.
pub fn cpu_id() -> usize {
    CPU.with(|c| c.get())
}

pub(crate) fn set_cpu(id: usize) {
    CPU.with(|c| c.set(id));
}

// A freshly allocated kernel stack wakes up inside fork_ret with the
// process table lock held and interrupts off, exactly as if it had
// entered the kernel through pushcli + acquire. Seed its state so the
// release in fork_ret balances.
pub(crate) fn prime_kstack() {
    NCLI.with(|n| n.set(1));
    INTENA.with(|e| e.set(true));
    INTR.with(|i| i.set(false));
}

// pushcli/popcli are like cli/sti except that they are matched:
// it takes two popcli to undo two pushcli. Also, if interrupts
// are off, then pushcli, popcli leaves them off.
pub fn pushcli() {
    let eflags_if = intr_get();
    cli();
    NCLI.with(|n| {
        if n.get() == 0 {
            INTENA.with(|e| e.set(eflags_if));
        }
        n.set(n.get() + 1);
    });
}

pub fn popcli() {
    assert!(!intr_get(), "popcli - interruptible");
    let n = NCLI.with(|n| {
        n.set(n.get() - 1);
        n.get()
    });
    assert!(n >= 0, "popcli");
    if n == 0 && INTENA.with(|e| e.get()) {
        sti();
    }
}

// Mutual exclusion lock. Deliberately not guard-based: the process
// table lock is passed across swtch from the outgoing kernel stack to
// the incoming one on the same CPU, a handoff RAII guards cannot
// express. The owner is therefore tracked per CPU, not per host
// thread.
pub struct SpinLock {
    locked: AtomicBool,
    cpu: AtomicUsize,
    name: &'static str,
}

impl SpinLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            cpu: AtomicUsize::new(NOBODY),
            name,
        }
    }

    // Acquire the lock.
    // Loops (spins) until the lock is acquired.
    // Holding a lock that long can cause other CPUs to waste time spinning.
    pub fn acquire(&self) {
        pushcli(); // disable interrupts to avoid deadlock
        assert!(!self.holding(), "acquire {}", self.name);

        while self.locked.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }

        // Record info about lock acquisition for holding().
        self.cpu.store(cpu_id(), Ordering::Relaxed);
    }

    // Release the lock.
    pub fn release(&self) {
        assert!(self.holding(), "release {}", self.name);

        self.cpu.store(NOBODY, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);

        popcli();
    }

    // Check whether this cpu is holding the lock.
    pub fn holding(&self) -> bool {
        pushcli();
        let r = self.locked.load(Ordering::Relaxed) && self.cpu.load(Ordering::Relaxed) == cpu_id();
        popcli();
        r
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_balances_cli() {
        let lk = SpinLock::new("test");
        sti();
        assert!(!lk.holding());
        lk.acquire();
        assert!(lk.holding());
        assert!(!intr_get());
        assert_eq!(ncli(), 1);
        lk.release();
        assert!(!lk.holding());
        assert!(intr_get());
        assert_eq!(ncli(), 0);
    }

    #[test]
    #[should_panic(expected = "acquire test")]
    fn reacquire_panics() {
        let lk = SpinLock::new("test");
        lk.acquire();
        lk.acquire();
    }

    #[test]
    #[should_panic(expected = "release test")]
    fn release_unheld_panics() {
        let lk = SpinLock::new("test");
        lk.release();
    }
}
