pub const NPROC: usize = 64; // maximum number of processes
pub const NTHREAD: usize = 8; // maximum number of threads per process
pub const NCPU: usize = 8; // maximum number of CPUs
pub const NOFILE: usize = 16; // open files per process
pub const ROOTDEV: u32 = 1; // device number of file system root disk
pub const MAXOPBLOCKS: usize = 10; // max # of blocks any FS op writes
pub const BSIZE: usize = 512; // block size

pub const PGSIZE: usize = 4096;
pub const KSTACKSIZE: usize = PGSIZE; // size of per-thread kernel stack
pub const KERNBASE: usize = 0x8000_0000; // user addresses live below here

// MLFQ policy: number of feedback queues and the periodic boost interval
// (in global ticks).
pub const MLFQ_K: usize = 3;
pub const BOOST_INTERVAL: u32 = 100;

// credential store
pub const NUSER: usize = 10;
pub const MAXUSERNAME: usize = 16;
pub const MAXPASSWORD: usize = 16;

pub const fn pgroundup(sz: usize) -> usize {
    (sz + PGSIZE - 1) & !(PGSIZE - 1)
}
