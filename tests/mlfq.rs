use kernel::param::MLFQ_K;
use kernel::{CpuState, Kernel, Policy, Sys};
use std::sync::Arc;

fn boot() -> (Arc<Kernel>, usize) {
    let k = Kernel::new(Policy::Mlfq);
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
fn cpu_bound_process_demotes_at_the_quantum_boundary() {
    let (k, init) = boot();
    assert_eq!(k.level_of(init), Some(0));

    // level 0 quantum is 4*0 + 2 = 2 ticks
    k.tick(0);
    assert_eq!(k.level_of(init), Some(0));
    assert_eq!(k.queue_ticks_of(init), Some(1));
    k.tick(0);
    assert_eq!(k.level_of(init), Some(1));
    assert_eq!(k.queue_ticks_of(init), Some(0));

    // level 1 quantum is 4*1 + 2 = 6 ticks
    for _ in 0..5 {
        k.tick(0);
    }
    assert_eq!(k.level_of(init), Some(1));
    assert_eq!(k.queue_ticks_of(init), Some(5));
    k.tick(0);
    assert_eq!(k.level_of(init), Some(2));
    assert_eq!(k.queue_ticks_of(init), Some(0));
}

#[test]
fn falling_off_the_last_queue_triggers_the_idle_boost() {
    let (k, init) = boot();

    // burn straight through every level: 2 + 6 + 10 ticks
    let total: u32 = (0..MLFQ_K as u32).map(|l| 4 * l + 2).sum();
    for _ in 0..total - 1 {
        k.tick(0);
    }
    assert_eq!(k.level_of(init), Some(MLFQ_K - 1));

    // the last tick of the last quantum pushes init off the bottom
    // queue; the scheduler finds nothing runnable and boosts
    k.tick(0);
    assert_eq!(k.current_on(0), None);
    assert_eq!(k.level_of(init), Some(0));
    assert_eq!(k.queue_ticks_of(init), Some(0));

    // it schedules normally again afterwards
    assert_eq!(k.run(0), CpuState::User(init));
}

#[test]
fn periodic_boost_resets_levels_but_not_priorities() {
    let (k, init) = boot();
    let c = fork(&k, init);

    k.syscall(init, Sys::SetPriority {
        pid: c,
        priority: 5,
    });
    assert_eq!(k.syscall_return(init), 0);
    assert_eq!(k.priority_of(c), Some(5));

    // out-of-range and no-such-child are told apart
    k.syscall(init, Sys::SetPriority {
        pid: c,
        priority: 11,
    });
    assert_eq!(k.syscall_return(init), -2);
    k.syscall(init, Sys::SetPriority {
        pid: 999,
        priority: 3,
    });
    assert_eq!(k.syscall_return(init), -1);

    for _ in 0..100 {
        k.tick(0);
    }
    assert_eq!(k.ticks(), 100);
    assert_eq!(k.level_of(init), Some(0));
    assert_eq!(k.queue_ticks_of(init), Some(0));
    assert_eq!(k.level_of(c), Some(0));
    assert_eq!(k.queue_ticks_of(c), Some(0));
    // the boost leaves priorities alone
    assert_eq!(k.priority_of(c), Some(5));
}

#[test]
fn higher_priority_wins_within_a_level() {
    let (k, init) = boot();
    let c = fork(&k, init);

    k.syscall(init, Sys::SetPriority {
        pid: c,
        priority: 5,
    });
    assert_eq!(k.syscall_return(init), 0);

    // both at level 0 with fresh quanta; when init yields, the
    // higher-priority child is picked over the smaller pid
    k.syscall(init, Sys::Yield);
    assert_eq!(k.current_on(0), Some(c));

    k.syscall(c, Sys::Getlev);
    assert_eq!(k.syscall_return(c), 0);
}
