use crate::param::{pgroundup, KERNBASE, PGSIZE};
use crate::proc::Kernel;
use zerocopy::{AsBytes, FromBytes};

// Per-process user address space.
//
// The hosted stand-in for the paging collaborator: a flat byte image
// indexed by user virtual address. The operations keep the shape of
// the real ones - page-granular growth, an upper bound at KERNBASE,
// copy-on-fork - so the scheduling core drives it exactly as it would
// drive the paging code.
pub struct Uvm {
    mem: Vec<u8>,
}

impl Uvm {
    // An empty user address space.
    pub fn create() -> Option<Box<Uvm>> {
        Some(Box::new(Uvm { mem: Vec::new() }))
    }

    // Load the initcode image into address 0 of the space.
    // Used only by the very first process. sz must be less than a page.
    pub fn init(&mut self, code: &[u8]) {
        assert!(code.len() < PGSIZE, "init: more than a page");
        self.mem.resize(PGSIZE, 0);
        self.mem[..code.len()].copy_from_slice(code);
    }

    // Grow the space from oldsz to newsz, which need not be
    // page aligned. Returns the new size or None on failure.
    pub fn alloc(&mut self, oldsz: usize, newsz: usize) -> Option<usize> {
        if newsz >= KERNBASE {
            return None;
        }
        if newsz < oldsz {
            return Some(oldsz);
        }
        let newsz = pgroundup(newsz);
        self.mem.resize(newsz, 0);
        Some(newsz)
    }

    // Shrink the space from oldsz to newsz. oldsz and newsz need not
    // be page-aligned, nor does newsz need to be less than oldsz.
    // Returns the new size.
    pub fn dealloc(&mut self, oldsz: usize, newsz: usize) -> usize {
        if newsz >= oldsz {
            return oldsz;
        }
        let newsz = pgroundup(newsz);
        self.mem.truncate(newsz);
        newsz
    }

    // Duplicate the first sz bytes for a child process.
    pub fn copy(&self, sz: usize) -> Option<Box<Uvm>> {
        let mut new = Uvm::create()?;
        new.mem.extend_from_slice(&self.mem[..sz.min(self.mem.len())]);
        Some(new)
    }

    // Copy from kernel to user memory at dst.
    pub fn copyout<T: AsBytes + ?Sized>(&mut self, dst: usize, src: &T) -> Result<(), ()> {
        let src = src.as_bytes();
        let end = dst.checked_add(src.len()).ok_or(())?;
        if end > self.mem.len() {
            return Err(());
        }
        self.mem[dst..end].copy_from_slice(src);
        Ok(())
    }

    // Copy from user memory at src into dst.
    pub fn copyin<T: AsBytes + FromBytes + ?Sized>(
        &self,
        dst: &mut T,
        src: usize,
    ) -> Result<(), ()> {
        let dst = dst.as_bytes_mut();
        let end = src.checked_add(dst.len()).ok_or(())?;
        if end > self.mem.len() {
            return Err(());
        }
        dst.copy_from_slice(&self.mem[src..end]);
        Ok(())
    }
}

impl Kernel {
    // Install the process's address space on the CPU on the way into
    // user execution.
    pub(crate) fn switchuvm(&self, cpu: usize, slot: usize) {
        let p = &self.ptable.proc[slot];
        let t = &p.thds[p.tid.get()];
        assert!(
            unsafe { (*t.kstack.get()).is_some() },
            "switchuvm: no kstack"
        );
        assert!(
            unsafe { (*p.data.get()).uvm.is_some() },
            "switchuvm: no pgdir"
        );
        self.cpus[cpu].vm.set(Some(slot));
    }

    // Back to the kernel's own address space.
    pub(crate) fn switchkvm(&self, cpu: usize) {
        self.cpus[cpu].vm.set(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rounds_to_pages() {
        let mut uvm = Uvm::create().unwrap();
        let sz = uvm.alloc(0, 100).unwrap();
        assert_eq!(sz, PGSIZE);
        let sz = uvm.alloc(sz, sz + 1).unwrap();
        assert_eq!(sz, 2 * PGSIZE);
        assert!(uvm.alloc(sz, KERNBASE).is_none());
    }

    #[test]
    fn dealloc_truncates() {
        let mut uvm = Uvm::create().unwrap();
        let sz = uvm.alloc(0, 3 * PGSIZE).unwrap();
        assert_eq!(uvm.dealloc(sz, PGSIZE + 1), 2 * PGSIZE);
        assert_eq!(uvm.dealloc(2 * PGSIZE, 2 * PGSIZE), 2 * PGSIZE);
    }

    #[test]
    fn copy_preserves_contents() {
        let mut uvm = Uvm::create().unwrap();
        let sz = uvm.alloc(0, PGSIZE).unwrap();
        uvm.copyout(16, &0xdead_beefu32).unwrap();
        let child = uvm.copy(sz).unwrap();
        let mut word = 0u32;
        child.copyin(&mut word, 16).unwrap();
        assert_eq!(word, 0xdead_beef);
    }

    #[test]
    fn copyout_bounds_checked() {
        let mut uvm = Uvm::create().unwrap();
        uvm.alloc(0, PGSIZE).unwrap();
        assert!(uvm.copyout(PGSIZE - 2, &0u32).is_err());
        assert!(uvm.copyout(usize::MAX, &0u32).is_err());
    }
}
