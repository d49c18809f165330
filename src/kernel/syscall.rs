use crate::proc::{Chan, Kernel};

// The scheduling-relevant system-call surface. The argument-fetching
// shims live with the trap injection; by the time a call reaches
// dispatch its arguments are already decoded.
#[derive(Debug, Clone)]
pub enum Sys {
    Fork,
    Exit,
    Wait,
    Kill(usize),
    Yield,
    Getlev,
    SetPriority { pid: usize, priority: i32 },
    Sleep(u32),
    Sbrk(isize),
    ThreadCreate { thread: usize, start_routine: usize, arg: u32 },
    ThreadExit { retval: u32 },
    ThreadJoin { thread: usize, retval: usize },
    AddUser { username: String, password: String },
    Verify { username: String, password: String },
    Logout,
}

// Runs on the calling thread's kernel stack; the result lands in the
// saved eax on the way back to user space.
pub(crate) fn dispatch(k: &Kernel, slot: usize, tidx: usize, call: Sys) -> i32 {
    match call {
        Sys::Fork => match k.fork(slot) {
            Ok(pid) => pid as i32,
            Err(()) => -1,
        },
        Sys::Exit => k.exit(slot, tidx),
        Sys::Wait => match k.wait(slot) {
            Some(pid) => pid as i32,
            None => -1,
        },
        Sys::Kill(pid) => match k.kill(pid) {
            Ok(()) => 0,
            Err(()) => -1,
        },
        Sys::Yield => {
            k.yielding(slot, tidx);
            0
        }
        Sys::Getlev => k.getlev(slot),
        Sys::SetPriority { pid, priority } => k.setpriority(slot, pid, priority),
        Sys::Sleep(n) => sys_sleep(k, slot, tidx, n),
        Sys::Sbrk(n) => sys_sbrk(k, slot, tidx, n),
        Sys::ThreadCreate {
            thread,
            start_routine,
            arg,
        } => match k.thread_create(slot, thread, start_routine, arg) {
            Ok(()) => 0,
            Err(()) => -1,
        },
        Sys::ThreadExit { retval } => k.thread_exit(slot, tidx, retval),
        Sys::ThreadJoin { thread, retval } => match k.thread_join(slot, tidx, thread, retval) {
            Ok(()) => 0,
            Err(()) => -1,
        },
        Sys::AddUser { username, password } => k.add_user(&username, &password),
        Sys::Verify { username, password } => k.verify(&username, &password),
        Sys::Logout => k.logout(),
    }
}

// Sleep for n clock ticks.
fn sys_sleep(k: &Kernel, slot: usize, tidx: usize, n: u32) -> i32 {
    k.tickslock.acquire();
    let ticks0 = k.ticks.get();
    while k.ticks.get().wrapping_sub(ticks0) < n {
        if k.ptable.proc[slot].killed.get() {
            k.tickslock.release();
            return -1;
        }
        k.sleep(slot, tidx, Chan::Ticks, &k.tickslock);
    }
    k.tickslock.release();
    0
}

// Grow the address space by n bytes; returns its previous size.
fn sys_sbrk(k: &Kernel, slot: usize, tidx: usize, n: isize) -> i32 {
    let addr = unsafe { (*k.ptable.proc[slot].data.get()).sz };
    if k.growproc(slot, tidx, n).is_err() {
        return -1;
    }
    addr as i32
}
