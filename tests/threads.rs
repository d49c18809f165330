use kernel::param::PGSIZE;
use kernel::{CpuState, Kernel, Policy, ProcState, Sys};
use std::sync::Arc;

fn boot() -> (Arc<Kernel>, usize) {
    let k = Kernel::new(Policy::Threads);
    k.userinit();
    assert_eq!(k.run(0), CpuState::User(k.init_pid()));
    let init = k.init_pid();
    (k, init)
}

fn fork(k: &Kernel, parent: usize) -> usize {
    assert!(k.syscall(parent, Sys::Fork));
    let pid = k.syscall_return(parent);
    assert!(pid > 0, "fork failed");
    pid as usize
}

fn spin_to(k: &Kernel, pid: usize) {
    for _ in 0..200 {
        match k.current_on(0) {
            Some(p) if p == pid => return,
            Some(_) => {
                k.tick(0);
            }
            None => {
                k.run(0);
            }
        }
    }
    panic!("pid {} never got cpu0", pid);
}

// spin the clock until a condition holds
fn settle(k: &Kernel, what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        if k.current_on(0).is_some() {
            k.tick(0);
        } else {
            k.run(0);
        }
    }
    panic!("never settled: {}", what);
}

const TID_PTR: usize = 0x100;
const RET_PTR: usize = 0x104;
const ENTRY: usize = 0x5000;

#[test]
fn thread_create_builds_the_user_stack() {
    let (k, init) = boot();
    let p = fork(&k, init);
    spin_to(&k, p);

    assert!(k.syscall(
        p,
        Sys::ThreadCreate {
            thread: TID_PTR,
            start_routine: ENTRY,
            arg: 41,
        }
    ));
    assert_eq!(k.syscall_return(p), 0);

    let tid = k.read_user_u32(p, TID_PTR).unwrap() as usize;
    assert!(tid > 0);
    assert_eq!(k.thread_state_of(p, 1), Some(ProcState::RUNNABLE));

    // one fresh stack page above the page-rounded image, entry point
    // installed, argument above a poisoned return address
    let tf = k.tf_of_thread(p, 1).unwrap();
    assert_eq!(tf.eip, ENTRY);
    assert_eq!(tf.esp, 2 * PGSIZE - 8);
    assert_eq!(k.read_user_u32(p, tf.esp), Some(0xffff_ffff));
    assert_eq!(k.read_user_u32(p, tf.esp + 4), Some(41));
}

#[test]
fn thread_join_returns_the_exit_value() {
    let (k, init) = boot();
    let p = fork(&k, init);
    spin_to(&k, p);

    assert!(k.syscall(
        p,
        Sys::ThreadCreate {
            thread: TID_PTR,
            start_routine: ENTRY,
            arg: 41,
        }
    ));
    let tid = k.read_user_u32(p, TID_PTR).unwrap() as usize;

    // the main thread joins; the scheduler hands the cpu to the new
    // thread, which plays f(x) { thread_exit(x + 1); }
    k.syscall(p, Sys::ThreadJoin {
        thread: tid,
        retval: RET_PTR,
    });
    assert_eq!(k.thread_state_of(p, 0), Some(ProcState::SLEEPING));

    let x = {
        let tf = k.tf_of_thread(p, 1).unwrap();
        k.read_user_u32(p, tf.esp + 4).unwrap()
    };
    assert_eq!(x, 41);
    k.syscall_to(p, 1, Sys::ThreadExit { retval: x + 1 });

    // the joiner wakes up, copies the value out and frees the slot
    settle(&k, "join done", || {
        k.thread_state_of(p, 1) == Some(ProcState::UNUSED)
    });
    assert_eq!(k.read_user_u32(p, RET_PTR), Some(42));
    assert_eq!(k.syscall_return(p), 0);
}

#[test]
fn joined_stacks_are_reused() {
    let (k, init) = boot();
    let p = fork(&k, init);
    spin_to(&k, p);

    k.syscall(p, Sys::Sbrk(0));
    let sz0 = k.syscall_return(p);

    for round in 0..3 {
        assert!(k.syscall(
            p,
            Sys::ThreadCreate {
                thread: TID_PTR,
                start_routine: ENTRY,
                arg: round,
            }
        ));
        let tid = k.read_user_u32(p, TID_PTR).unwrap() as usize;
        let esp = k.tf_of_thread(p, 1).unwrap().esp;
        assert_eq!(esp, 2 * PGSIZE - 8);

        k.syscall(p, Sys::ThreadJoin {
            thread: tid,
            retval: 0,
        });
        k.syscall_to(p, 1, Sys::ThreadExit { retval: round });
        settle(&k, "join done", || {
            k.thread_state_of(p, 1) == Some(ProcState::UNUSED)
        });
        spin_to(&k, p);
    }

    // the process never grew past the first thread's stack page
    k.syscall(p, Sys::Sbrk(0));
    assert_eq!(k.syscall_return(p), sz0 + PGSIZE as i32);
}

#[test]
fn join_of_unknown_tid_fails() {
    let (k, init) = boot();
    let p = fork(&k, init);
    spin_to(&k, p);

    k.syscall(p, Sys::ThreadJoin {
        thread: 4242,
        retval: 0,
    });
    assert_eq!(k.syscall_return(p), -1);
}

#[test]
fn exit_zombifies_every_live_thread() {
    let (k, init) = boot();
    let p = fork(&k, init);
    spin_to(&k, p);

    assert!(k.syscall(
        p,
        Sys::ThreadCreate {
            thread: TID_PTR,
            start_routine: ENTRY,
            arg: 0,
        }
    ));
    k.syscall(p, Sys::Exit);
    assert_eq!(k.state_of(p), Some(ProcState::ZOMBIE));
    assert_eq!(k.thread_state_of(p, 0), Some(ProcState::ZOMBIE));
    assert_eq!(k.thread_state_of(p, 1), Some(ProcState::ZOMBIE));

    // wait releases every thread's kernel stack and clears the slots
    assert!(k.syscall(init, Sys::Wait));
    assert_eq!(k.syscall_return(init), p as i32);
    assert_eq!(k.state_of(p), None);
}
