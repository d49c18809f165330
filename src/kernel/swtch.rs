use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

// Saved kernel context.
//
// On hardware this is a callee-saved register set plus a stack pointer;
// here each kernel stack is a parked host thread and a Context is the
// handle used to resume it. swtch performs the same one-shot
// continuation exchange the assembly stub does: the target stack starts
// running where it last parked, the current stack parks until somebody
// swtches back into it. At most one kernel stack runs at any time.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    run: Mutex<bool>,
    resumed: Condvar,
}

impl Context {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                run: Mutex::new(false),
                resumed: Condvar::new(),
            }),
        }
    }

    // Hand this context the CPU. The matching wait() may not have
    // started yet; the flag keeps the resume from being lost.
    pub(crate) fn resume(&self) {
        let mut run = self.inner.run.lock().unwrap();
        *run = true;
        self.inner.resumed.notify_one();
    }

    // Park until resumed.
    pub(crate) fn wait(&self) {
        let mut run = self.inner.run.lock().unwrap();
        while !*run {
            run = self.inner.resumed.wait(run).unwrap();
        }
        *run = false;
    }

    // Park with a deadline. Used by the outside (boot/driver) context
    // so a kernel stack that dies without handing the CPU on fails the
    // run loudly instead of hanging it.
    pub(crate) fn wait_for(&self, timeout: Duration) {
        let mut run = self.inner.run.lock().unwrap();
        while !*run {
            let (guard, res) = self.inner.resumed.wait_timeout(run, timeout).unwrap();
            run = guard;
            if res.timed_out() && !*run {
                panic!("swtch: lost the cpu");
            }
        }
        *run = false;
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

// Context switch: resume `to`, park `from`. Caller conventions follow
// the assembly version: whatever locks and interrupt state the caller
// holds are inherited by the resumed stack.
pub fn swtch(from: &Context, to: &Context) {
    to.resume();
    from.wait();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn exchange_round_trip() {
        let main_ctx = Context::new();
        let child_ctx = Context::new();
        let (m, c) = (main_ctx.clone(), child_ctx.clone());
        let child = thread::spawn(move || {
            c.wait();
            // hand it straight back
            swtch(&c, &m);
        });
        swtch(&main_ctx, &child_ctx);
        // the child parked itself again; unpark it so it can finish
        child_ctx.resume();
        child.join().unwrap();
    }

    #[test]
    fn resume_before_wait_is_not_lost() {
        let ctx = Context::new();
        ctx.resume();
        ctx.wait(); // returns immediately
    }
}
