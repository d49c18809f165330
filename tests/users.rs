use kernel::{CpuState, Kernel, Policy, Sys};
use std::sync::Arc;

fn boot() -> (Arc<Kernel>, usize) {
    let k = Kernel::new(Policy::Threads);
    k.userinit();
    assert_eq!(k.run(0), CpuState::User(k.init_pid()));
    let init = k.init_pid();
    (k, init)
}

#[test]
fn first_boot_seeds_the_root_account() {
    let (k, _) = boot();

    // the first process's return to user space loaded the store
    assert_eq!(k.verify("root", "0000"), 0);
    assert_eq!(k.current_user(), 0);
    assert_eq!(k.user_name(0).as_deref(), Some("root"));

    assert_eq!(k.logout(), 0);
    assert_eq!(k.current_user(), -1);
}

#[test]
fn accounts_managed_through_system_calls() {
    let (k, init) = boot();

    k.syscall(init, Sys::AddUser {
        username: "alice".into(),
        password: "aaa".into(),
    });
    // add reports the entry count before the add (root is slot 0)
    assert_eq!(k.syscall_return(init), 1);

    k.syscall(init, Sys::Verify {
        username: "alice".into(),
        password: "aaa".into(),
    });
    assert_eq!(k.syscall_return(init), 0);
    assert_eq!(k.current_user(), 1);

    k.syscall(init, Sys::Verify {
        username: "alice".into(),
        password: "wrong".into(),
    });
    assert_eq!(k.syscall_return(init), 1);

    k.syscall(init, Sys::Logout);
    assert_eq!(k.syscall_return(init), 0);
    assert_eq!(k.current_user(), -1);
}

#[test]
fn store_survives_in_the_account_inode() {
    let (k, _) = boot();

    assert_eq!(k.add_user("alice", "aaa"), 1);
    assert_eq!(k.add_user("bob", "bbb"), 2);
    // the write-through rewrote the whole 320-byte image
    assert_eq!(k.fs().namei("account").unwrap().size(), 320);

    assert_eq!(k.verify("bob", "bbb"), 0);
    assert_eq!(k.current_user(), 2);

    // duplicates and deletion are refused
    assert_eq!(k.add_user("bob", "elsewhere"), 0);
    assert_eq!(k.delete_user("bob"), 0);
    assert_eq!(k.verify("bob", "bbb"), 0);
}
