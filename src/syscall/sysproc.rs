//! Per-syscall bodies. Each function reads its own arguments via
//! `syscall::arg*` and returns the value `syscall()` will place in a0;
//! the real work happens in `proc`.

use super::syscall::{argaddr, arguint};
use crate::proc;

pub(super) fn sys_fork() -> u64 {
    proc::fork() as u64
}

pub(super) fn sys_exit() -> u64 {
    let status = arguint(0) as i32;
    proc::exit(status);
}

pub(super) fn sys_wait() -> u64 {
    let addr = argaddr(0);
    proc::wait(addr) as u64
}

pub(super) fn sys_waitx() -> u64 {
    let addr = argaddr(0);
    let rtime = argaddr(1);
    let wtime = argaddr(2);
    proc::waitx(addr, rtime, wtime) as u64
}

pub(super) fn sys_kill() -> u64 {
    let pid = arguint(0) as u32;
    proc::kill(pid) as u64
}

pub(super) fn sys_getpid() -> u64 {
    let idx = proc::myproc().expect("sys_getpid: no current process");
    proc::proc_pid(idx) as u64
}

pub(super) fn sys_yield() -> u64 {
    proc::yield_();
    0
}

pub(super) fn sys_sigalarm() -> u64 {
    let interval = arguint(0) as u64;
    let handler = argaddr(1);
    proc::sigalarm(interval, handler);
    0
}

pub(super) fn sys_sigreturn() -> u64 {
    proc::sigreturn() as u64
}

pub(super) fn sys_trace() -> u64 {
    let mask = arguint(0);
    proc::set_mask(mask) as u64
}

#[cfg(feature = "policy-lbs")]
pub(super) fn sys_settickets() -> u64 {
    let n = arguint(0) as i32;
    proc::settickets(n) as u64
}

#[cfg(feature = "policy-pbs")]
pub(super) fn sys_set_priority() -> u64 {
    let new_priority = arguint(0) as i32;
    let pid = arguint(1) as u32;
    proc::set_priority(new_priority, pid) as u64
}
