//! Narrow stand-in for the on-disk filesystem and its transaction log,
//! which are out of scope for this core (§1). Exposes only the signatures
//! `proc::forkret`/`proc::exit` call through, so the process lifecycle
//! compiles and behaves sensibly without a real disk behind it.

use core::sync::atomic::{AtomicBool, Ordering};

static FS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Root inode placeholder. A real build would resolve this against the
/// superblock; this core never dereferences it.
#[derive(Copy, Clone)]
pub struct INode {
    pub inum: u32,
}

/// Run filesystem initialization exactly once. `forkret` calls this from
/// the first-scheduled process, since a real implementation needs to sleep
/// (reading the superblock) and so cannot run from `kmain`.
pub fn fsinit(_dev: usize) {
    FS_INITIALIZED.store(true, Ordering::Relaxed);
}

/// Resolve a path to an inode. Out of scope beyond the root directory,
/// which every process's `cwd` is set to at fork/userinit time.
pub fn namei(_path: &str) -> Option<INode> {
    Some(INode { inum: 1 })
}

pub fn iput(_ip: &INode) {}

/// Begin/end a filesystem transaction. `exit` brackets file/inode cleanup
/// with these; with no real log behind this core they are no-ops.
pub fn begin_op() {}
pub fn end_op() {}
