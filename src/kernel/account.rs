use crate::fs::FileSystem;
use crate::param::{BSIZE, MAXOPBLOCKS, MAXPASSWORD, MAXUSERNAME, NUSER};
use crate::proc::Kernel;
use std::cell::{Cell, UnsafeCell};
use zerocopy::AsBytes;

// The on-disk image sizes both fields as MAXUSERNAME.
const _: () = assert!(MAXPASSWORD == MAXUSERNAME);

const USERNAME: usize = 0;
const PASSWORD: usize = 1;

// Credential table, persisted to the account inode as a contiguous
// NUSER x 2 x MAXUSERNAME byte image (320 bytes). An entry is empty
// iff the first byte of its username is zero. Callers are serialized
// at the system-call boundary; the table itself takes no lock.
pub struct Utable {
    current_user: Cell<i32>,
    cnt: Cell<usize>,
    user: UnsafeCell<[[[u8; MAXUSERNAME]; 2]; NUSER]>,
}

unsafe impl Send for Utable {}
unsafe impl Sync for Utable {}

// Fixed-width field image of s, truncated and zero padded.
fn field(s: &str) -> [u8; MAXUSERNAME] {
    let mut f = [0u8; MAXUSERNAME];
    let b = s.as_bytes();
    let n = b.len().min(MAXUSERNAME);
    f[..n].copy_from_slice(&b[..n]);
    f
}

impl Utable {
    pub fn new() -> Self {
        Self {
            current_user: Cell::new(-1),
            cnt: Cell::new(0),
            user: UnsafeCell::new([[[0; MAXUSERNAME]; 2]; NUSER]),
        }
    }

    // Clear the table and mark no user current.
    pub fn init(&self) {
        self.current_user.set(-1);
        let user = unsafe { &mut *self.user.get() };
        for entry in user.iter_mut() {
            *entry = [[0; MAXUSERNAME]; 2];
        }
    }

    // Read the table image back from the account inode, count the
    // occupied entries, and seed the default root account if the
    // store is empty. Returns 1 on success, 0 on a failed read.
    pub fn load(&self, fs: &FileSystem) -> i32 {
        let user = unsafe { &mut *self.user.get() };
        if fs.account().readi(user.as_bytes_mut(), 0).is_err() {
            return 0;
        }

        let mut cnt = self.cnt.get();
        for entry in user.iter() {
            if entry[USERNAME][0] != 0 {
                cnt += 1;
            }
        }
        self.cnt.set(cnt);
        if cnt == 0 {
            user[0][USERNAME] = field("root");
            user[0][PASSWORD] = field("0000");
            self.cnt.set(1);
        }

        self.write_through(fs);
        1
    }

    // Add a user and write the table through. Refuses duplicates and
    // overflow with 0; otherwise returns the entry count before the
    // add.
    pub fn add(&self, username: &str, password: &str, fs: &FileSystem) -> i32 {
        if self.cnt.get() >= NUSER {
            return 0;
        }
        let user = unsafe { &mut *self.user.get() };
        let uname = field(username);
        for entry in user.iter() {
            if entry[USERNAME][0] != 0 && entry[USERNAME] == uname {
                return 0;
            }
        }
        let slot = match user.iter().position(|e| e[USERNAME][0] == 0) {
            Some(i) => i,
            None => return 0,
        };
        user[slot][USERNAME] = uname;
        user[slot][PASSWORD] = field(password);

        self.write_through(fs);

        let cnt = self.cnt.get();
        self.cnt.set(cnt + 1);
        cnt as i32
    }

    // TODO: removal needs a tombstone story for the slot-ordered image;
    // until then this is a stub.
    pub fn delete(&self, _username: &str) -> i32 {
        0
    }

    // Scan for an exact username/password match. On success the entry
    // index becomes the current user and the result is 0; 1 otherwise.
    pub fn verify(&self, username: &str, password: &str) -> i32 {
        let user = unsafe { &*self.user.get() };
        let uname = field(username);
        let pass = field(password);
        for (i, entry) in user.iter().enumerate() {
            if entry[USERNAME] == uname && entry[PASSWORD] == pass {
                self.current_user.set(i as i32);
                return 0;
            }
        }
        1
    }

    pub fn logout(&self) -> i32 {
        self.current_user.set(-1);
        0
    }

    pub fn current_user(&self) -> i32 {
        self.current_user.get()
    }

    pub fn user_name(&self, idx: i32) -> Option<String> {
        if idx < 0 || idx as usize >= NUSER {
            return None;
        }
        let user = unsafe { &*self.user.get() };
        let name = &user[idx as usize][USERNAME];
        let len = name.iter().position(|&b| b == 0).unwrap_or(MAXUSERNAME);
        Some(String::from_utf8_lossy(&name[..len]).into_owned())
    }

    // Rewrite the whole image, in chunks bounded by what a single
    // log transaction can absorb.
    fn write_through(&self, fs: &FileSystem) {
        let user = unsafe { &*self.user.get() };
        let image = user.as_bytes();
        let max = ((MAXOPBLOCKS - 1 - 1 - 2) / 2) * BSIZE;
        let n = image.len();
        let mut i = 0;
        let mut off = 0;
        while i < n {
            let n1 = (n - i).min(max);
            fs.log.begin_op();
            let r = fs.account().writei(&image[i..i + n1], off);
            fs.log.end_op();
            match r {
                Ok(r) => {
                    off += r;
                    if r != n1 {
                        panic!("short filewrite");
                    }
                    i += r;
                }
                Err(_) => break,
            }
        }
    }
}

impl Default for Utable {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    pub fn add_user(&self, username: &str, password: &str) -> i32 {
        self.utable.add(username, password, &self.fs)
    }

    pub fn delete_user(&self, username: &str) -> i32 {
        self.utable.delete(username)
    }

    pub fn verify(&self, username: &str, password: &str) -> i32 {
        self.utable.verify(username, password)
    }

    pub fn logout(&self) -> i32 {
        self.utable.logout()
    }

    pub fn current_user(&self) -> i32 {
        self.utable.current_user()
    }

    pub fn user_name(&self, idx: i32) -> Option<String> {
        self.utable.user_name(idx)
    }
}
