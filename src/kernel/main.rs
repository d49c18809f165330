use kernel::{CpuState, Kernel, Policy, Sys};

// Spin the clock until the given pid owns cpu0.
fn spin_to(k: &Kernel, pid: usize) {
    for _ in 0..64 {
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

// Boot the machine with the default policy, let init fork a couple of
// workers, drive the clock for a while and reap them again.
fn main() {
    let k = Kernel::new(Policy::Threads);
    k.userinit();

    assert_eq!(k.run(0), CpuState::User(k.init_pid()));
    let init = k.init_pid();
    println!("booted; init is pid {}", init);

    k.syscall(init, Sys::Fork);
    let a = k.syscall_return(init) as usize;
    k.syscall(init, Sys::Fork);
    let b = k.syscall_return(init) as usize;
    println!("init forked pid {} and pid {}", a, b);

    // let the clock drive the round-robin for a while
    for _ in 0..6 {
        k.tick(0);
    }
    println!("after 6 ticks, pid {:?} holds cpu0", k.current_on(0));
    k.procdump();

    spin_to(&k, a);
    k.syscall(a, Sys::Exit);
    spin_to(&k, init);
    k.syscall(init, Sys::Wait);
    println!("init reaped pid {}", k.syscall_return(init));

    spin_to(&k, b);
    k.syscall(b, Sys::Exit);
    spin_to(&k, init);
    k.syscall(init, Sys::Wait);
    println!("init reaped pid {}", k.syscall_return(init));

    k.procdump();
    println!("clock saw {} ticks", k.ticks());
}
