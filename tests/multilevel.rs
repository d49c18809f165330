use kernel::{CpuState, Kernel, Policy, Sys};
use std::sync::Arc;

fn boot() -> (Arc<Kernel>, usize) {
    let k = Kernel::new(Policy::Multilevel);
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

#[test]
fn queue_class_is_pid_mod_two() {
    let (k, init) = boot();
    assert_eq!(k.level_of(init), Some(1)); // init is pid 1

    let kids: Vec<usize> = (0..4).map(|_| fork(&k, init)).collect();
    for &pid in &kids {
        assert_eq!(k.level_of(pid), Some(pid % 2));
    }
}

#[test]
fn class0_round_robins_and_class1_runs_fcfs() {
    let (k, init) = boot();

    // four children: even pids are class 0, odd pids class 1
    let kids: Vec<usize> = (0..4).map(|_| fork(&k, init)).collect();
    let (e0, o0, e1, o1) = (kids[0], kids[1], kids[2], kids[3]);
    assert_eq!(k.level_of(e0), Some(0));
    assert_eq!(k.level_of(o0), Some(1));
    assert_eq!(k.level_of(e1), Some(0));
    assert_eq!(k.level_of(o1), Some(1));

    // init blocks in wait; as long as class 0 has runnable work,
    // only class 0 runs, alternating on every tick
    k.syscall(init, Sys::Wait);
    assert_eq!(k.current_on(0), Some(e0));
    k.tick(0);
    assert_eq!(k.current_on(0), Some(e1));
    k.tick(0);
    assert_eq!(k.current_on(0), Some(e0));
    k.tick(0);
    assert_eq!(k.current_on(0), Some(e1));

    // getlev reports the class
    k.tick(0);
    assert_eq!(k.current_on(0), Some(e0));
    k.syscall(e0, Sys::Getlev);
    assert_eq!(k.syscall_return(e0), 0);

    // the class-0 pair drains; init (pid 1, the oldest class-1
    // process) reaps them first-come-first-served
    k.syscall(e0, Sys::Exit);
    assert_eq!(k.current_on(0), Some(e1));
    k.syscall(e1, Sys::Exit);
    assert_eq!(k.current_on(0), Some(init));
    assert_eq!(k.syscall_return(init), e0 as i32);
    k.syscall(init, Sys::Wait);
    assert_eq!(k.syscall_return(init), e1 as i32);

    // with init back in wait, the oldest class-1 child runs
    k.syscall(init, Sys::Wait);
    assert_eq!(k.current_on(0), Some(o0));

    // class 1 is not preempted by the clock
    k.tick(0);
    k.tick(0);
    assert_eq!(k.current_on(0), Some(o0));
    k.syscall(o0, Sys::Getlev);
    assert_eq!(k.syscall_return(o0), 1);

    // only blocking hands the cpu to the next class-1 process
    k.syscall(o0, Sys::Exit);
    assert_eq!(k.current_on(0), Some(init));
    assert_eq!(k.syscall_return(init), o0 as i32);
    k.syscall(init, Sys::Wait);
    assert_eq!(k.current_on(0), Some(o1));
    k.syscall(o1, Sys::Exit);
    assert_eq!(k.syscall_return(init), o1 as i32);
}
