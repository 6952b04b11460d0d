//! Narrow stand-in for the on-disk file table and VFS, which are out of
//! scope for this core (§1). Provides just enough of a `Devsw`/file handle
//! surface for the console device and for `fork`/`exit` to compile and
//! behave sensibly against a real, if tiny, open-file table.

use crate::param::{NDEV, NFILE};
use crate::spinlock::Spinlock;

pub const CONSOLE: usize = 1;

/// Device-switch table entry: a character device reachable through
/// read()/write() syscalls. Console is the only one registered by this
/// core; block devices and pipes are out of scope.
pub trait Devsw {
    fn read(&mut self, is_user_dst: bool, dst: usize, sz: usize) -> i32;
    fn write(&mut self, is_user_src: bool, src: usize, sz: usize) -> i32;
}

pub static mut DEVSW: [Option<*mut dyn Devsw>; NDEV] = [None; NDEV];

#[derive(Copy, Clone, PartialEq)]
enum FileType {
    None,
    Device,
    Inode,
    Pipe,
}

/// An open-file table entry. `exec`/`open`/pipes are out of scope, so only
/// the reference-counting behaviour `fork`/`exit` rely on is implemented.
#[derive(Copy, Clone)]
pub struct File {
    kind: FileType,
    refcount: i32,
    readable: bool,
    writable: bool,
    major: u16, // device major number, valid when kind == Device
}

impl File {
    const fn default() -> Self {
        File {
            kind: FileType::None,
            refcount: 0,
            readable: false,
            writable: false,
            major: 0,
        }
    }
}

struct FTable {
    lock: Spinlock,
    files: [File; NFILE],
}

static mut FTABLE: FTable = FTable {
    lock: Spinlock::init_lock("ftable"),
    files: [File::default(); NFILE],
};

pub fn fileinit() {
    // FTABLE is statically initialized; nothing else to do.
}

/// Increment ref count for file f. Returns the same index back to the
/// caller, mirroring the original `filedup`'s "return f" convention.
pub fn file_dup(idx: usize) -> usize {
    unsafe {
        FTABLE.lock.acquire();
        if FTABLE.files[idx].kind == FileType::None {
            FTABLE.lock.release();
            panic!("file_dup");
        }
        FTABLE.files[idx].refcount += 1;
        FTABLE.lock.release();
    }
    idx
}

/// Decrement ref count for file at idx, closing it if this was the last
/// reference. Closing a console/device file is a no-op beyond bookkeeping
/// since the device itself is not owned per-open here.
pub fn file_close(idx: usize) {
    unsafe {
        FTABLE.lock.acquire();
        let f = &mut FTABLE.files[idx];
        if f.kind == FileType::None || f.refcount < 1 {
            FTABLE.lock.release();
            panic!("file_close");
        }
        f.refcount -= 1;
        if f.refcount == 0 {
            *f = File::default();
        }
        FTABLE.lock.release();
    }
}
