use core::mem;

use crate::printf;
use crate::proc::{myproc, proc_pid, proc_sz, trapframe, with_proc_pagetable};
use crate::string::strlen;
use crate::vm::{copyin, copyinstr};

use super::sysproc::{
    sys_exit, sys_fork, sys_getpid, sys_kill, sys_sigalarm, sys_sigreturn, sys_trace, sys_wait,
    sys_waitx, sys_yield,
};
#[cfg(feature = "policy-lbs")]
use super::sysproc::sys_settickets;
#[cfg(feature = "policy-pbs")]
use super::sysproc::sys_set_priority;

use super::{
    NSYSCALL, SYS_EXIT, SYS_FORK, SYS_GETPID, SYS_KILL, SYS_SIGALARM, SYS_SIGRETURN, SYS_TRACE,
    SYS_WAIT, SYS_WAITX, SYS_YIELD,
};
#[cfg(feature = "policy-lbs")]
use super::SYS_SETTICKETS;
#[cfg(feature = "policy-pbs")]
use super::SYS_SET_PRIORITY;

// Retrieve the nth syscall argument as a raw u64, from the current
// process's trapframe (a0..a5).
fn argraw(n: u8) -> u64 {
    let idx = myproc().expect("argraw: no current process");
    let tf = trapframe(idx);
    match n {
        0 => tf.a0,
        1 => tf.a1,
        2 => tf.a2,
        3 => tf.a3,
        4 => tf.a4,
        5 => tf.a5,
        _ => panic!("argraw: out of range"),
    }
}

pub(super) fn arguint(n: u8) -> u64 {
    argraw(n)
}

pub(super) fn argaddr(n: u8) -> usize {
    argraw(n) as usize
}

// Fetch the nul-terminated string at addr from the current process.
// Returns length of string, not including nul, or -1 for error.
#[allow(dead_code)]
pub(super) fn argstr(n: u8, buf: *mut u8, max: usize) -> i32 {
    let addr = argaddr(n);
    fetchstr(addr, buf, max)
}

#[allow(dead_code)]
pub(super) fn fetchaddr(addr: usize, ip: &mut usize) -> i32 {
    let idx = myproc().expect("fetchaddr: no current process");
    let sz = proc_sz(idx);
    if addr >= sz || addr + mem::size_of::<usize>() > sz {
        return -1;
    }
    let rc = with_proc_pagetable(idx, |pt| copyin(pt, ip as *mut usize as *mut u8, addr, mem::size_of::<usize>()));
    if rc != 0 {
        -1
    } else {
        0
    }
}

pub(super) fn fetchstr(addr: usize, buf: *mut u8, max: usize) -> i32 {
    let idx = myproc().expect("fetchstr: no current process");
    let rc = with_proc_pagetable(idx, |pt| copyinstr(pt, buf, addr, max));
    if rc < 0 {
        -1
    } else {
        strlen(buf) as i32
    }
}

type SyscallFn = fn() -> u64;

const SYSCALLS: [Option<SyscallFn>; NSYSCALL] = {
    let mut arr: [Option<SyscallFn>; NSYSCALL] = [None; NSYSCALL];
    arr[SYS_FORK] = Some(sys_fork);
    arr[SYS_EXIT] = Some(sys_exit);
    arr[SYS_WAIT] = Some(sys_wait);
    arr[SYS_KILL] = Some(sys_kill);
    arr[SYS_GETPID] = Some(sys_getpid);
    arr[SYS_YIELD] = Some(sys_yield);
    arr[SYS_WAITX] = Some(sys_waitx);
    arr[SYS_SIGALARM] = Some(sys_sigalarm);
    arr[SYS_SIGRETURN] = Some(sys_sigreturn);
    arr[SYS_TRACE] = Some(sys_trace);
    #[cfg(feature = "policy-lbs")]
    {
        arr[SYS_SETTICKETS] = Some(sys_settickets);
    }
    #[cfg(feature = "policy-pbs")]
    {
        arr[SYS_SET_PRIORITY] = Some(sys_set_priority);
    }
    arr
};

// Dispatch the current process's pending syscall, identified by a7, and
// store its return value in a0.
pub fn syscall() {
    let idx = myproc().expect("syscall: no current process");
    let num = trapframe(idx).a7 as usize;

    let result = if num < NSYSCALL {
        SYSCALLS[num]
    } else {
        None
    };

    match result {
        Some(f) => {
            let r = f();
            trapframe(idx).a0 = r;
        }
        None => {
            printf!("{}: unknown sys call {}\n", proc_pid(idx), num);
            trapframe(idx).a0 = u64::MAX;
        }
    }
}
