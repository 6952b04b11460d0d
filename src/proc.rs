use core::mem;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::file::file_close;
use crate::fs::{begin_op, end_op, fsinit, iput, namei, INode};
use crate::kalloc::{alloc_page, free_page};
use crate::memlayout::{TRAMPOLINE, TRAPFRAME};
use crate::param::{NCPU, NOFILE, NPROC, PBS_DEFAULT_PRIORITY, ROOTDEV};
use crate::policy::{ActivePolicy, SchedPolicy};
use crate::printf;
use crate::riscv::{r_tp, PageTable, PGSIZE, PTE_R, PTE_W, PTE_X};
use crate::spinlock::{pop_off, push_off, Spinlock};
use crate::vm::{kvmmap, mappages, uvmcopy, uvmcreate, uvmfirst, uvmfree, uvmunmap};
use crate::KSTACK;

// Saved registers for kernel context switches.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct Context {
    pub ra: u64,
    pub sp: u64,

    // callee-saved
    pub s0: u64,
    pub s1: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
}

impl Context {
    const fn zeroed() -> Self {
        Context {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }
}

extern "C" {
    fn swtch(old: *mut Context, new: *mut Context);
}

// Per-CPU state.
#[derive(Copy, Clone)]
pub struct Cpu {
    pub(crate) proc: Option<usize>, // index into PROCS of the process running here, if any.
    context: Context, // swtch() here to enter scheduler().
    pub noff: u8, // depth of push_off() nesting.
    pub intena: bool, // were interrupts enabled before push_off()?
}

impl Cpu {
    const fn default() -> Self {
        Cpu {
            proc: None,
            context: Context::zeroed(),
            noff: 0,
            intena: false,
        }
    }
}

pub static mut CPUS: [Cpu; NCPU] = [Cpu::default(); NCPU];

// per-process data for the trap handling code in trampoline.S. sits in a
// page by itself just under the trampoline page in the user page table.
// not specially mapped in the kernel page table. uservec in trampoline.S
// saves user registers in the trapframe, then initializes registers from
// the trapframe's kernel_sp, kernel_hartid, kernel_satp, and jumps to
// kernel_trap. usertrapret() and userret in trampoline.S set up the
// trapframe's kernel_*, restore user registers from the trapframe, switch
// to the user page table, and enter user space.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct Trapframe {
    /*   0 */ pub kernel_satp: u64, // kernel page table
    /*   8 */ pub kernel_sp: u64, // top of process's kernel stack
    /*  16 */ pub kernel_trap: u64, // usertrap()
    /*  24 */ pub epc: u64, // saved user program counter
    /*  32 */ pub kernel_hartid: u64, // saved kernel tp
    /*  40 */ pub ra: u64,
    /*  48 */ pub sp: u64,
    /*  56 */ pub gp: u64,
    /*  64 */ pub tp: u64,
    /*  72 */ pub t0: u64,
    /*  80 */ pub t1: u64,
    /*  88 */ pub t2: u64,
    /*  96 */ pub s0: u64,
    /* 104 */ pub s1: u64,
    /* 112 */ pub a0: u64,
    /* 120 */ pub a1: u64,
    /* 128 */ pub a2: u64,
    /* 136 */ pub a3: u64,
    /* 144 */ pub a4: u64,
    /* 152 */ pub a5: u64,
    /* 160 */ pub a6: u64,
    /* 168 */ pub a7: u64,
    /* 176 */ pub s2: u64,
    /* 184 */ pub s3: u64,
    /* 192 */ pub s4: u64,
    /* 200 */ pub s5: u64,
    /* 208 */ pub s6: u64,
    /* 216 */ pub s7: u64,
    /* 224 */ pub s8: u64,
    /* 232 */ pub s9: u64,
    /* 240 */ pub s10: u64,
    /* 248 */ pub s11: u64,
    /* 256 */ pub t3: u64,
    /* 264 */ pub t4: u64,
    /* 272 */ pub t5: u64,
    /* 280 */ pub t6: u64,
}

impl Trapframe {
    const fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Procstate {
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

// Per-process state
#[derive(Copy, Clone)]
pub struct Proc {
    pub(crate) lock: Spinlock,

    // p.lock must be held when using these:
    pub(crate) state: Procstate,
    chan: usize, // if nonzero, sleeping on this channel
    killed: bool,
    xstate: i32, // exit status to be returned to parent's wait
    pub pid: u32,

    // wait_lock must be held when using this:
    parent: Option<usize>, // index into PROCS

    // private to the process; p.lock need not be held for these.
    kstack: usize,
    sz: usize,
    pagetable: *mut PageTable,
    trapframe: *mut Trapframe,
    sigtrapframe: *mut Trapframe,
    context: Context,
    ofile: [Option<usize>; NOFILE], // indices into the open-file table
    cwd: Option<INode>,
    name: &'static str,

    pub(crate) in_tick: u64, // tick the process became RUNNABLE (or was created)
    run_time: u64, // ticks spent RUNNING across its life
    end_tick: u64, // tick of exit

    #[cfg(feature = "policy-lbs")]
    pub(crate) tickets: i32,

    #[cfg(feature = "policy-pbs")]
    pub(crate) priority: i32,
    #[cfg(feature = "policy-pbs")]
    pub(crate) num_sched: u64,
    #[cfg(feature = "policy-pbs")]
    pub(crate) running_ticks: u64,
    #[cfg(feature = "policy-pbs")]
    pub(crate) sleeping_ticks: u64,

    #[cfg(feature = "policy-mlfq")]
    pub(crate) queue: u8,
    #[cfg(feature = "policy-mlfq")]
    pub(crate) num_ticks: u64,
    #[cfg(feature = "policy-mlfq")]
    pub(crate) last_tick: u64,

    alarm: bool,
    alarm_interval: u64,
    tick_count: u64,
    handler_pc: usize,

    pub(crate) mask: u32,
}

impl Proc {
    pub(crate) const fn default() -> Self {
        Proc {
            lock: Spinlock::init_lock("proc"),
            state: Procstate::Unused,
            chan: 0,
            killed: false,
            xstate: 0,
            pid: 0,
            parent: None,
            kstack: 0,
            sz: 0,
            pagetable: core::ptr::null_mut(),
            trapframe: core::ptr::null_mut(),
            sigtrapframe: core::ptr::null_mut(),
            context: Context::zeroed(),
            ofile: [None; NOFILE],
            cwd: None,
            name: "",
            in_tick: 0,
            run_time: 0,
            end_tick: 0,
            #[cfg(feature = "policy-lbs")]
            tickets: 1,
            #[cfg(feature = "policy-pbs")]
            priority: PBS_DEFAULT_PRIORITY,
            #[cfg(feature = "policy-pbs")]
            num_sched: 0,
            #[cfg(feature = "policy-pbs")]
            running_ticks: 0,
            #[cfg(feature = "policy-pbs")]
            sleeping_ticks: 0,
            #[cfg(feature = "policy-mlfq")]
            queue: 0,
            #[cfg(feature = "policy-mlfq")]
            num_ticks: 0,
            #[cfg(feature = "policy-mlfq")]
            last_tick: 0,
            alarm: false,
            alarm_interval: 0,
            tick_count: 0,
            handler_pc: 0,
            mask: 0,
        }
    }

    pub(crate) fn runnable(&self) -> bool {
        self.state == Procstate::Runnable
    }
}

pub(crate) static mut PROCS: [Proc; NPROC] = [Proc::default(); NPROC];

static mut INIT_PROC: usize = 0;

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

// helps ensure that wakeups of wait()ing parents are not lost, and obeys
// the locking order documented in §5: must be acquired before any p.lock.
static mut WAIT_LOCK: Spinlock = Spinlock::init_lock("wait_lock");

pub(crate) static mut TICKS: u64 = 0;
static mut TICKS_LOCK: Spinlock = Spinlock::init_lock("time");

#[cfg(feature = "policy-lbs")]
pub(crate) static mut TOTAL_TICKETS: i64 = 0;

extern "C" {
    static trampoline: u8; // trampoline.S
}

// Must be called with interrupts disabled, to prevent a race with the
// process being moved to a different CPU.
pub fn cpuid() -> usize {
    r_tp() as usize
}

// Return this CPU's Cpu struct. Interrupts must be disabled.
pub fn mycpu() -> &'static mut Cpu {
    unsafe { &mut CPUS[cpuid()] }
}

// Return the index of the process running on this CPU, if any.
pub fn myproc() -> Option<usize> {
    push_off();
    let p = mycpu().proc;
    pop_off();
    p
}

fn allocpid() -> u32 {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

fn proc_lock(idx: usize) -> &'static mut Spinlock {
    unsafe { &mut PROCS[idx].lock }
}

pub fn proc_sz(idx: usize) -> usize {
    unsafe { PROCS[idx].sz }
}

pub fn proc_pid(idx: usize) -> u32 {
    unsafe { PROCS[idx].pid }
}

pub fn proc_kstack_top(idx: usize) -> usize {
    unsafe { PROCS[idx].kstack + PGSIZE }
}

pub fn proc_state(idx: usize) -> Procstate {
    unsafe { PROCS[idx].state }
}

/// Run a closure with the process's user page table, for copyin/copyout
/// helpers that take either a user or kernel address.
pub fn with_proc_pagetable<R>(idx: usize, f: impl FnOnce(&mut PageTable) -> R) -> R {
    let pt = unsafe { &mut *PROCS[idx].pagetable };
    f(pt)
}

pub fn killed(idx: usize) -> bool {
    let p = proc_lock(idx);
    p.acquire();
    let k = unsafe { PROCS[idx].killed };
    p.release();
    k
}

pub fn setkilled(idx: usize) {
    let p = proc_lock(idx);
    p.acquire();
    unsafe { PROCS[idx].killed = true };
    p.release();
}

pub fn trapframe(idx: usize) -> &'static mut Trapframe {
    unsafe { &mut *PROCS[idx].trapframe }
}

pub fn pagetable(idx: usize) -> &'static mut PageTable {
    unsafe { &mut *PROCS[idx].pagetable }
}

// Allocate a page for each process's kernel stack. Map it high in memory,
// followed by an invalid guard page.
pub fn proc_mapstacks(kpgtbl: &mut PageTable) {
    for idx in 0..NPROC {
        let pa: *mut u8 = alloc_page();
        if pa.is_null() {
            panic!("kalloc");
        }
        let va = KSTACK!(idx);
        kvmmap(kpgtbl, va, pa as usize, PGSIZE, PTE_R | PTE_W);
        unsafe {
            PROCS[idx].kstack = va;
        }
    }
}

// initialize the proc table. PROCS/WAIT_LOCK/NEXT_PID are all statically
// initialized; nothing else to do before the first allocproc.
pub fn procinit() {}

// a user program that calls exec("/init"). placeholder initcode: an
// infinite wait-loop (ecall with a bogus syscall number, spins). exec() is
// out of scope for this core, so the first process never leaves the loop;
// it exists only so there is a RUNNABLE process for the scheduler to run.
const INITCODE: [u8; 16] = [
    0x73, 0x00, 0x00, 0x00, // ecall
    0x6f, 0x00, 0x00, 0x00, // j .
    0, 0, 0, 0, 0, 0, 0, 0,
];

// Set up first user process.
pub fn userinit() {
    let idx = allocproc().expect("userinit: allocproc failed");

    unsafe {
        INIT_PROC = idx;
    }

    let p = unsafe { &mut PROCS[idx] };
    let pt = unsafe { &mut *p.pagetable };
    uvmfirst(pt, INITCODE.as_ptr(), INITCODE.len());
    p.sz = PGSIZE;

    let tf = unsafe { &mut *p.trapframe };
    tf.epc = 0;
    tf.sp = PGSIZE as u64;

    p.name = "initcode";
    p.cwd = namei("/");

    p.state = Procstate::Runnable;
    p.in_tick = unsafe { TICKS };
    ActivePolicy::on_become_runnable(idx);

    p.lock.release();
}

static mut FIRST_SCHED: bool = true;

// A fork child's very first scheduling by scheduler() swtch's to forkret.
extern "C" fn forkret() {
    // Still holding p.lock from scheduler.
    let idx = mycpu().proc.expect("forkret: no current process");
    proc_lock(idx).release();

    unsafe {
        if FIRST_SCHED {
            // Filesystem initialization must run in the context of a
            // regular process (it sleeps), so it cannot run from kmain().
            FIRST_SCHED = false;
            fsinit(ROOTDEV);
        }
    }

    crate::trap::usertrapret();
}

// Look in the process table for an UNUSED proc. If found, initialize
// state required to run in the kernel, and return its index with the
// lock held. If there are no free procs, or a memory allocation fails,
// return None.
fn allocproc() -> Option<usize> {
    let mut found = None;
    for i in 0..NPROC {
        let p = unsafe { &mut PROCS[i] };
        p.lock.acquire();

        if p.state == Procstate::Unused {
            found = Some(i);
            break;
        }

        p.lock.release();
    }

    let idx = found?;
    let p = unsafe { &mut PROCS[idx] };
    p.pid = allocpid();
    p.state = Procstate::Used;

    let trapframe_ptr: *mut Trapframe = alloc_page();
    if trapframe_ptr.is_null() {
        freeproc(idx);
        p.lock.release();
        return None;
    }
    p.trapframe = trapframe_ptr;

    let sigtrapframe_ptr: *mut Trapframe = alloc_page();
    if sigtrapframe_ptr.is_null() {
        freeproc(idx);
        p.lock.release();
        return None;
    }
    p.sigtrapframe = sigtrapframe_ptr;

    match proc_pagetable(idx) {
        Some(pt) => p.pagetable = pt as *mut PageTable,
        None => {
            freeproc(idx);
            p.lock.release();
            return None;
        }
    }

    p.context = Context::zeroed();
    p.context.ra = forkret as usize as u64;
    p.context.sp = (p.kstack + PGSIZE) as u64;

    p.run_time = 0;
    p.end_tick = 0;
    p.mask = 0;
    p.alarm = false;
    p.alarm_interval = 0;
    p.tick_count = 0;

    #[cfg(feature = "policy-lbs")]
    {
        p.tickets = 1;
    }
    #[cfg(feature = "policy-pbs")]
    {
        p.priority = PBS_DEFAULT_PRIORITY;
        p.num_sched = 0;
        p.running_ticks = 0;
        p.sleeping_ticks = 0;
    }
    #[cfg(feature = "policy-mlfq")]
    {
        p.queue = 0;
        p.num_ticks = 0;
        p.last_tick = unsafe { TICKS };
    }

    Some(idx)
}

// free a proc structure and the data hanging from it, including user
// pages. p.lock must be held.
fn freeproc(idx: usize) {
    let p = unsafe { &mut PROCS[idx] };

    if !p.trapframe.is_null() {
        free_page(p.trapframe);
    }
    p.trapframe = core::ptr::null_mut();

    if !p.sigtrapframe.is_null() {
        free_page(p.sigtrapframe);
    }
    p.sigtrapframe = core::ptr::null_mut();

    if !p.pagetable.is_null() {
        let pt = unsafe { &mut *p.pagetable };
        proc_freepagetable(pt, p.sz);
    }
    p.pagetable = core::ptr::null_mut();

    p.sz = 0;
    p.pid = 0;
    p.parent = None;
    p.name = "";
    p.chan = 0;
    p.killed = false;
    p.xstate = 0;
    p.ofile = [None; NOFILE];
    p.cwd = None;
    p.in_tick = 0;
    p.run_time = 0;
    p.end_tick = 0;
    p.state = Procstate::Unused;
}

// Create a user page table for a given process, with no user memory, but
// with trampoline and trapframe pages.
fn proc_pagetable(idx: usize) -> Option<&'static mut PageTable> {
    let p = unsafe { &PROCS[idx] };
    let pagetable = uvmcreate()?;

    let trampoline_addr = (unsafe { &trampoline } as *const u8).expose_addr();
    if mappages(pagetable, TRAMPOLINE, trampoline_addr, PGSIZE, PTE_R | PTE_X) != 0 {
        uvmfree(pagetable, 0);
        return None;
    }

    let trapframe_addr = (p.trapframe as *const Trapframe).expose_addr();
    if mappages(pagetable, TRAPFRAME, trapframe_addr, PGSIZE, PTE_R | PTE_W) != 0 {
        uvmunmap(pagetable, TRAMPOLINE, 1, false);
        uvmfree(pagetable, 0);
        return None;
    }

    Some(pagetable)
}

// Free a process's page table, and free the physical memory it refers to.
fn proc_freepagetable(pagetable: &mut PageTable, sz: usize) {
    uvmunmap(pagetable, TRAMPOLINE, 1, false);
    uvmunmap(pagetable, TRAPFRAME, 1, false);
    uvmfree(pagetable, sz);
}

// Create a new process, copying the parent. Sets up child kernel stack to
// return as if from fork() syscall.
pub fn fork() -> i32 {
    let p_idx = myproc().expect("fork: no current process");

    let np_idx = match allocproc() {
        Some(i) => i,
        None => return -1,
    };

    // Copy user memory from parent to child, copy-on-write.
    let (pagetable, sz, name, mask, cwd) = {
        let p = unsafe { &PROCS[p_idx] };
        (p.pagetable, p.sz, p.name, p.mask, p.cwd)
    };

    let np = unsafe { &mut PROCS[np_idx] };
    if uvmcopy(unsafe { &mut *pagetable }, unsafe { &mut *np.pagetable }, sz).is_err() {
        freeproc(np_idx);
        np.lock.release();
        return -1;
    }
    np.sz = sz;

    unsafe {
        *np.trapframe = *trapframe(p_idx);
    }
    // Cause fork to return 0 in the child.
    unsafe {
        (*np.trapframe).a0 = 0;
    }

    // increment parent's open file reference counts.
    for i in 0..NOFILE {
        let fd = unsafe { PROCS[p_idx].ofile[i] };
        if let Some(f) = fd {
            np.ofile[i] = Some(file_dup_index(f));
        }
    }
    np.cwd = cwd;
    np.name = name;
    np.mask = mask;

    #[cfg(feature = "policy-pbs")]
    {
        np.priority = unsafe { PROCS[p_idx].priority };
    }
    #[cfg(feature = "policy-lbs")]
    {
        np.tickets = unsafe { PROCS[p_idx].tickets };
    }

    let pid = np.pid;

    np.lock.release();

    unsafe {
        WAIT_LOCK.acquire();
        PROCS[np_idx].parent = Some(p_idx);
        WAIT_LOCK.release();
    }

    let np = unsafe { &mut PROCS[np_idx] };
    np.lock.acquire();
    np.state = Procstate::Runnable;
    np.in_tick = unsafe { TICKS };
    ActivePolicy::on_become_runnable(np_idx);
    np.lock.release();

    pid as i32
}

fn file_dup_index(idx: usize) -> usize {
    crate::file::file_dup(idx)
}

// Pass p's abandoned children to init. Caller must hold wait_lock.
fn reparent(idx: usize) {
    for i in 0..NPROC {
        let p = unsafe { &mut PROCS[i] };
        if p.parent == Some(idx) {
            p.parent = unsafe { Some(INIT_PROC) };
            wakeup_locked(unsafe { INIT_PROC });
        }
    }
}

// Exit the current process. Does not return. An exited process remains
// in the zombie state until its parent calls wait().
pub fn exit(status: i32) -> ! {
    let idx = myproc().expect("exit: no current process");

    if idx == unsafe { INIT_PROC } {
        panic!("init exiting");
    }

    // close all open files.
    for i in 0..NOFILE {
        let fd = unsafe { PROCS[idx].ofile[i] };
        if let Some(f) = fd {
            file_close(f);
            unsafe {
                PROCS[idx].ofile[i] = None;
            }
        }
    }

    begin_op();
    if let Some(cwd) = unsafe { PROCS[idx].cwd } {
        iput(&cwd);
    }
    end_op();
    unsafe {
        PROCS[idx].cwd = None;
    }

    unsafe {
        WAIT_LOCK.acquire();
    }

    reparent(idx);

    let parent = unsafe { PROCS[idx].parent };
    if let Some(parent) = parent {
        wakeup_locked(parent);
    }

    let p = unsafe { &mut PROCS[idx] };
    p.lock.acquire();

    p.xstate = status;
    p.end_tick = unsafe { TICKS };
    p.state = Procstate::Zombie;

    unsafe {
        WAIT_LOCK.release();
    }

    sched();
    unreachable!("zombie exited from sched");
}

// wakeup() variant for callers that already hold wait_lock but not the
// target's own lock; used by exit()/reparent() under wait_lock, matching
// the lock-ordering rule that wait_lock is acquired before any p.lock.
fn wakeup_locked(idx: usize) {
    let p = unsafe { &mut PROCS[idx] };
    p.lock.acquire();
    if p.state == Procstate::Sleeping {
        p.state = Procstate::Runnable;
        p.in_tick = unsafe { TICKS };
        ActivePolicy::on_become_runnable(idx);
    }
    p.lock.release();
}

// Wait for a child process to exit and return its pid. Return -1 if this
// process has no children.
pub fn wait(addr: usize) -> i32 {
    let idx = myproc().expect("wait: no current process");

    unsafe {
        WAIT_LOCK.acquire();
    }

    loop {
        let mut have_kids = false;
        for i in 0..NPROC {
            let p = unsafe { &mut PROCS[i] };
            if p.parent != Some(idx) {
                continue;
            }

            p.lock.acquire();
            have_kids = true;
            if p.state == Procstate::Zombie {
                let pid = p.pid;
                let xstatus = p.xstate;
                p.lock.release();
                freeproc(i);

                unsafe {
                    WAIT_LOCK.release();
                }

                if addr != 0 {
                    if with_proc_pagetable(idx, |pt| crate::vm::copyout(pt, addr, &xstatus as *const i32 as *const u8, 4)) < 0 {
                        return -1;
                    }
                }
                return pid as i32;
            }
            p.lock.release();
        }

        if !have_kids || killed(idx) {
            unsafe {
                WAIT_LOCK.release();
            }
            return -1;
        }

        sleep_locked_wait(idx);
    }
}

/// Sleep on our own table slot as a channel, with wait_lock as the
/// external lock, matching the sleep/wakeup atomic-handoff discipline.
fn sleep_locked_wait(idx: usize) {
    let p = unsafe { &mut PROCS[idx] };
    p.lock.acquire();
    unsafe {
        WAIT_LOCK.release();
    }
    p.chan = idx + 1; // nonzero channel distinct from raw zero addresses
    p.state = Procstate::Sleeping;
    sched();
    p.chan = 0;
    p.lock.release();
    unsafe {
        WAIT_LOCK.acquire();
    }
}

// Like wait(), but also reports run time and wait time in ticks.
pub fn waitx(addr: usize, rtime_addr: usize, wtime_addr: usize) -> i32 {
    let idx = myproc().expect("waitx: no current process");

    unsafe {
        WAIT_LOCK.acquire();
    }

    loop {
        let mut have_kids = false;
        for i in 0..NPROC {
            let p = unsafe { &mut PROCS[i] };
            if p.parent != Some(idx) {
                continue;
            }

            p.lock.acquire();
            have_kids = true;
            if p.state == Procstate::Zombie {
                let pid = p.pid;
                let xstatus = p.xstate;
                let rtime = p.run_time;
                let wtime = p.end_tick - p.in_tick - p.run_time;
                p.lock.release();
                freeproc(i);

                unsafe {
                    WAIT_LOCK.release();
                }

                if addr != 0
                    && with_proc_pagetable(idx, |pt| crate::vm::copyout(pt, addr, &xstatus as *const i32 as *const u8, 4)) < 0
                {
                    return -1;
                }
                let rtime_i = rtime as i32;
                let wtime_i = wtime as i32;
                if rtime_addr != 0 {
                    with_proc_pagetable(idx, |pt| crate::vm::copyout(pt, rtime_addr, &rtime_i as *const i32 as *const u8, 4));
                }
                if wtime_addr != 0 {
                    with_proc_pagetable(idx, |pt| crate::vm::copyout(pt, wtime_addr, &wtime_i as *const i32 as *const u8, 4));
                }
                return pid as i32;
            }
            p.lock.release();
        }

        if !have_kids || killed(idx) {
            unsafe {
                WAIT_LOCK.release();
            }
            return -1;
        }

        sleep_locked_wait(idx);
    }
}

// Per-CPU scheduler. Each CPU calls scheduler() after setup, and never
// returns. It loops, doing:
//  - choose a process under the active policy.
//  - swtch to start running that process.
//  - eventually that process transfers control back via swtch.
pub fn scheduler() -> ! {
    let c = mycpu();
    c.proc = None;

    loop {
        crate::riscv::intr_on();

        match ActivePolicy::pick() {
            Some(idx) => {
                // ActivePolicy::pick() returns with PROCS[idx].lock held.
                let p = unsafe { &mut PROCS[idx] };
                p.state = Procstate::Running;
                ActivePolicy::on_become_running(idx);
                mycpu().proc = Some(idx);

                unsafe {
                    swtch(&mut mycpu().context as *mut Context, &mut p.context as *mut Context);
                }

                mycpu().proc = None;
                p.lock.release();
            }
            None => {
                // nothing runnable; spin with interrupts enabled so a
                // device or timer interrupt can make something runnable.
            }
        }
    }
}

// Switch to scheduler. Must hold only the process's own lock and have
// changed its state. Saves and restores intena because intena is a
// property of this kernel thread, not this CPU. It should be proc.intena
// and proc.noff, but that would break in the few places where a lock is
// held but there's no process.
pub fn sched() {
    let idx = mycpu().proc.expect("sched: no current process");
    let p = unsafe { &PROCS[idx] };

    if !p.lock.holding() {
        panic!("sched p->lock");
    }
    if mycpu().noff != 1 {
        panic!("sched locks");
    }
    if p.state == Procstate::Running {
        panic!("sched running");
    }
    if crate::riscv::intr_get() {
        panic!("sched interruptible");
    }

    let intena = mycpu().intena;
    unsafe {
        swtch(&mut PROCS[idx].context as *mut Context, &mut mycpu().context as *mut Context);
    }
    mycpu().intena = intena;
}

// Give up the CPU for one scheduling round.
pub fn yield_() {
    let idx = myproc().expect("yield_: no current process");
    let p = unsafe { &mut PROCS[idx] };
    p.lock.acquire();
    p.state = Procstate::Runnable;
    p.in_tick = unsafe { TICKS };
    ActivePolicy::on_become_runnable(idx);
    sched();
    p.lock.release();
}

// Atomically release lk and sleep on chan. Reacquires lk when awakened.
pub fn sleep(chan: usize, lk: &mut Spinlock) {
    let idx = myproc().expect("sleep: no current process");
    let p = unsafe { &mut PROCS[idx] };

    // Must acquire p.lock in order to change p.state and then call sched.
    // Once we hold p.lock, we can be guaranteed that we won't miss any
    // wakeup (wakeup locks p.lock), so it's okay to release lk.
    if !core::ptr::eq(lk, &p.lock as *const Spinlock as *mut Spinlock) {
        p.lock.acquire();
        lk.release();
    }

    p.chan = chan;
    p.state = Procstate::Sleeping;

    sched();

    p.chan = 0;

    if !core::ptr::eq(lk, &p.lock as *const Spinlock as *mut Spinlock) {
        p.lock.release();
        lk.acquire();
    }
}

// Wake up all processes sleeping on chan. Caller should hold the
// condition lock, if any (but not any p.lock).
pub fn wakeup(chan: usize) {
    let self_idx = myproc();
    for i in 0..NPROC {
        if Some(i) == self_idx {
            continue;
        }
        let p = unsafe { &mut PROCS[i] };
        p.lock.acquire();
        if p.state == Procstate::Sleeping && p.chan == chan {
            p.state = Procstate::Runnable;
            p.in_tick = unsafe { TICKS };
            ActivePolicy::on_become_runnable(i);
        }
        p.lock.release();
    }
}

// Kill the process with the given pid. The victim won't exit until it
// tries to return to user space (see usertrap()).
pub fn kill(pid: u32) -> i32 {
    for i in 0..NPROC {
        let p = unsafe { &mut PROCS[i] };
        p.lock.acquire();
        if p.pid == pid {
            p.killed = true;
            if p.state == Procstate::Sleeping {
                p.state = Procstate::Runnable;
                p.in_tick = unsafe { TICKS };
                ActivePolicy::on_become_runnable(i);
            }
            p.lock.release();
            return 0;
        }
        p.lock.release();
    }
    -1
}

// --- LBS: Park-Miller minimal standard generator, seeded at 1. ---
#[cfg(feature = "policy-lbs")]
static mut RAND_SEED: i64 = 1;

#[cfg(feature = "policy-lbs")]
pub(crate) fn rand() -> i64 {
    const A: i64 = 16807;
    const M: i64 = 2147483647;
    unsafe {
        RAND_SEED = (A * RAND_SEED) % M;
        RAND_SEED
    }
}

#[cfg(feature = "policy-lbs")]
pub fn settickets(n: i32) -> i32 {
    let idx = myproc().expect("settickets: no current process");
    let p = unsafe { &mut PROCS[idx] };
    p.lock.acquire();
    let old = p.tickets;
    if n >= 1 {
        p.tickets = n;
    }
    p.lock.release();
    old
}

#[cfg(feature = "policy-pbs")]
pub fn set_priority(new_priority: i32, pid: u32) -> i32 {
    let new_priority = new_priority.clamp(0, 100);
    let mut old = -1;
    let mut should_yield = false;

    for i in 0..NPROC {
        let p = unsafe { &mut PROCS[i] };
        p.lock.acquire();
        if p.pid == pid {
            old = p.priority;
            p.priority = new_priority;
            if new_priority < old {
                p.running_ticks = 0;
                p.sleeping_ticks = 0;
                should_yield = true;
            }
            p.lock.release();
            break;
        }
        p.lock.release();
    }

    // yield only after releasing the target's lock (never while holding
    // another process's slot lock).
    if should_yield {
        if let Some(me) = myproc() {
            if me == (0..NPROC).find(|&i| unsafe { PROCS[i].pid } == pid).unwrap_or(usize::MAX) {
                yield_();
            }
        }
    }

    old
}

// Set up an alarm: call handler_pc every interval ticks of CPU time used
// by this process.
pub fn sigalarm(interval: u64, handler_pc: usize) {
    let idx = myproc().expect("sigalarm: no current process");
    let p = unsafe { &mut PROCS[idx] };
    p.alarm_interval = interval;
    p.handler_pc = handler_pc;
    p.tick_count = 0;
    p.alarm = interval != 0;
}

// Restore the trapframe saved before an alarm handler was invoked, and
// re-arm the alarm.
pub fn sigreturn() -> i32 {
    let idx = myproc().expect("sigreturn: no current process");
    let p = unsafe { &mut PROCS[idx] };
    unsafe {
        *p.trapframe = *p.sigtrapframe;
    }
    p.alarm = p.alarm_interval != 0;
    unsafe { (*p.trapframe).a0 as i32 }
}

pub(crate) fn alarm_due(idx: usize) -> bool {
    let p = unsafe { &mut PROCS[idx] };
    if !p.alarm {
        return false;
    }
    p.tick_count += 1;
    if p.tick_count == p.alarm_interval {
        p.alarm = false;
        unsafe {
            *p.sigtrapframe = *p.trapframe;
        }
        p.tick_count = 0;
        unsafe {
            (*p.trapframe).epc = p.handler_pc as u64;
        }
        true
    } else {
        false
    }
}

pub(crate) fn set_mask(mask: u32) -> i32 {
    let idx = myproc().expect("set_mask: no current process");
    unsafe {
        PROCS[idx].mask = mask;
    }
    0
}

// Called once per tick by clockintr(), under the tick lock. Updates every
// process's running/sleeping accounting.
pub(crate) fn update_time() {
    for i in 0..NPROC {
        let p = unsafe { &mut PROCS[i] };
        p.lock.acquire();
        match p.state {
            Procstate::Running => {
                p.run_time += 1;
                #[cfg(feature = "policy-pbs")]
                {
                    p.running_ticks += 1;
                }
            }
            #[cfg(feature = "policy-pbs")]
            Procstate::Sleeping => {
                p.sleeping_ticks += 1;
            }
            _ => {}
        }
        p.lock.release();
    }
}

pub fn tick_lock_acquire() {
    unsafe { TICKS_LOCK.acquire() }
}

pub fn tick_lock_release() {
    unsafe { TICKS_LOCK.release() }
}

pub fn ticks() -> u64 {
    unsafe { TICKS }
}

// Channel used to sleep on/wake up the tick counter itself. Must be a
// stable address, not the counter's value, since a sleep channel equal to
// `idx+1` for some process index would spuriously wake that process's
// wait()er (see sleep_locked_wait).
pub fn ticks_chan() -> usize {
    core::ptr::addr_of!(TICKS) as usize
}

pub fn ticks_advance() {
    unsafe { TICKS += 1 };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset_table() {
        for i in 0..NPROC {
            unsafe {
                PROCS[i] = Proc::default();
            }
        }
        unsafe {
            INIT_PROC = 0;
        }
    }

    #[test]
    fn fresh_table_is_all_unused() {
        reset_table();
        for i in 0..NPROC {
            assert_eq!(proc_state(i), Procstate::Unused);
        }
    }

    #[test]
    fn reparent_hands_off_to_init_and_wakes_it() {
        reset_table();
        unsafe {
            // slot 0 is init, sleeping in wait() on its own table slot.
            PROCS[0].state = Procstate::Sleeping;
            PROCS[0].chan = 1;

            // slot 2's parent is slot 1, which is about to exit.
            PROCS[2].parent = Some(1);
        }

        reparent(1);

        unsafe {
            assert_eq!(PROCS[2].parent, Some(0));
            // reparent()'s wakeup_locked(INIT_PROC) should have found init
            // sleeping on its own channel and made it runnable again.
            assert_eq!(PROCS[0].state, Procstate::Runnable);
        }
    }

    #[test]
    fn waitx_reports_run_and_wait_ticks() {
        // same arithmetic waitx() uses once a child reaches ZOMBIE, checked
        // directly against the fields rather than through the syscall path.
        let in_tick = 10u64;
        let end_tick = 50u64;
        let run_time = 15u64;
        let wtime = end_tick - in_tick - run_time;
        assert_eq!(wtime, 25);
    }

    #[test]
    fn alarm_due_fires_exactly_at_interval_and_rearms_state() {
        reset_table();
        // alarm_due() dereferences trapframe/sigtrapframe; give the test its
        // own stack-backed storage instead of routing through kalloc.
        let mut tf = Trapframe::zeroed();
        let mut stf = Trapframe::zeroed();

        unsafe {
            PROCS[0].alarm = true;
            PROCS[0].alarm_interval = 3;
            PROCS[0].tick_count = 0;
            PROCS[0].trapframe = &mut tf as *mut Trapframe;
            PROCS[0].sigtrapframe = &mut stf as *mut Trapframe;
        }

        assert!(!alarm_due(0));
        assert!(!alarm_due(0));
        assert!(alarm_due(0));
        unsafe {
            assert!(!PROCS[0].alarm);
            assert_eq!(PROCS[0].tick_count, 0);
        }
    }
}

// Print a process listing to console, for debugging. Runs when user
// types ^P on console. No lock to avoid wedging a stuck machine further.
pub fn procdump() {
    printf!("\n");
    for i in 0..NPROC {
        let p = unsafe { &PROCS[i] };
        if p.state == Procstate::Unused {
            continue;
        }
        let state = match p.state {
            Procstate::Unused => "unused",
            Procstate::Used => "used",
            Procstate::Sleeping => "sleep",
            Procstate::Runnable => "runble",
            Procstate::Running => "run",
            Procstate::Zombie => "zombie",
        };
        printf!("{} {} {}\n", p.pid, state, p.name);
    }
}
