use crate::fs::Inode;
use bitflags::bitflags;
use std::sync::Arc;

bitflags! {
    // Open modes. RDONLY is the empty mode.
    pub struct OMode: u32 {
        const WRONLY = 0x001;
        const RDWR = 0x002;
        const CREATE = 0x200;
    }
}

// An open file. Shared by every descriptor that refers to it; the Arc
// count is the file reference count, so dup is a clone and close is a
// drop.
pub struct File {
    pub ip: Inode,
    pub readable: bool,
    pub writable: bool,
}

impl File {
    pub fn alloc(ip: Inode, mode: OMode) -> Arc<File> {
        Arc::new(File {
            ip,
            readable: !mode.intersects(OMode::WRONLY),
            writable: mode.intersects(OMode::WRONLY | OMode::RDWR),
        })
    }

    // Increment the reference count for file f.
    pub fn dup(f: &Arc<File>) -> Arc<File> {
        Arc::clone(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileSystem;

    #[test]
    fn modes() {
        let fs = FileSystem::new();
        let f = File::alloc(fs.namei("/").unwrap(), OMode::empty());
        assert!(f.readable && !f.writable);
        let f = File::alloc(fs.namei("/").unwrap(), OMode::RDWR);
        assert!(f.readable && f.writable);
        let f = File::alloc(fs.namei("/").unwrap(), OMode::WRONLY);
        assert!(!f.readable && f.writable);
    }

    #[test]
    fn dup_bumps_refcount() {
        let fs = FileSystem::new();
        let f = File::alloc(fs.namei("/").unwrap(), OMode::empty());
        let g = File::dup(&f);
        assert_eq!(Arc::strong_count(&f), 2);
        drop(g);
        assert_eq!(Arc::strong_count(&f), 1);
    }
}
