use crate::memlayout::{TRAMPOLINE, UART0_IRQ, VIRTIO0_IRQ};
use crate::plic::{plic_claim, plic_complete};
use crate::policy::{ActivePolicy, SchedPolicy};
use crate::printf;
use crate::proc::{
    alarm_due, cpuid, killed, mycpu, myproc, pagetable, proc_kstack_top, proc_pid, proc_state,
    setkilled, tick_lock_acquire, tick_lock_release, ticks_advance, ticks_chan, trapframe,
    update_time, wakeup, yield_, Procstate,
};
use crate::riscv::{
    intr_get, intr_off, intr_on, r_satp, r_scause, r_sepc, r_sip, r_sstatus, r_stval, r_tp, w_sepc,
    w_sip, w_sstatus, w_stvec, MAXVA, PGSIZE, SSTATUS_SPIE, SSTATUS_SPP,
};
use crate::uart::uartintr;
use crate::vm::cow_fault;
use crate::MAKE_SATP;

extern "C" {
    // in kernelvec.S, calls kerneltrap().
    static kernelvec: u8;
    // in trampoline.S.
    static trampoline: u8;
    static uservec: u8;
    static userret: u8;
}

pub fn trapinit() {
    // TICKS_LOCK/PID_LOCK/WAIT_LOCK are statically initialised in proc.rs.
}

// set up to take exceptions and traps while in the kernel.
pub fn trapinithart() {
    w_stvec((unsafe { &kernelvec } as *const u8).expose_addr());
}

// handle an interrupt, exception, or system call from user space. called
// from trampoline.S's uservec.
#[no_mangle]
pub extern "C" fn usertrap() {
    if (r_sstatus() & SSTATUS_SPP) != 0 {
        panic!("usertrap: not from user mode");
    }

    // send interrupts and exceptions to kerneltrap(), since we're now in
    // the kernel.
    w_stvec((unsafe { &kernelvec } as *const u8).expose_addr());

    let idx = myproc().expect("usertrap: no current process");
    trapframe(idx).epc = r_sepc() as u64;

    let scause = r_scause();
    let mut which_dev = 0;

    if scause == 8 {
        // system call
        if killed(idx) {
            crate::proc::exit(-1);
        }

        // sepc points to the ecall instruction, but we want to return to
        // the next instruction.
        trapframe(idx).epc += 4;

        // an interrupt will change sepc, scause, and sstatus, so enable
        // only now that we're done with those registers.
        intr_on();

        crate::syscall::syscall();
    } else if scause == 13 || scause == 15 {
        // page fault. if the COW bit is set on the faulting page, resolve
        // it; otherwise this is a genuine fault and the process is killed.
        let fault_va = r_stval() as usize;
        let sp = trapframe(idx).sp as usize;

        if fault_va >= MAXVA || fault_va == 0 || (fault_va >= sp.saturating_sub(PGSIZE) && fault_va < sp) {
            setkilled(idx);
        } else {
            let pt = pagetable(idx);
            if cow_fault(pt, fault_va).is_err() {
                printf!(
                    "usertrap(): unexpected scause {:#x} pid={}\n",
                    scause,
                    proc_pid(idx)
                );
                printf!("             sepc={:#x} stval={:#x}\n", r_sepc(), r_stval());
                setkilled(idx);
            }
        }
    } else if { which_dev = devintr(); which_dev != 0 } {
        // ok
    } else {
        printf!(
            "usertrap(): unexpected scause {:#x} pid={}\n",
            scause,
            proc_pid(idx)
        );
        printf!("             sepc={:#x} stval={:#x}\n", r_sepc(), r_stval());
        setkilled(idx);
    }

    if killed(idx) {
        crate::proc::exit(-1);
    }

    // give up the CPU if this is a timer interrupt.
    if which_dev == 2 {
        alarm_due(idx); // redirects trapframe.epc to the handler, if due.
        if ActivePolicy::on_tick(idx) {
            yield_();
        }
    }

    usertrapret();
}

// return to user space
pub fn usertrapret() {
    let idx = myproc().expect("usertrapret: no current process");

    // we're about to switch the destination of traps from kerneltrap()
    // to usertrap(), so turn off interrupts until we're back in user
    // space, where usertrap() is correct.
    intr_off();

    // send syscalls, interrupts, and exceptions to uservec in
    // trampoline.S.
    let trampoline_base = (unsafe { &trampoline } as *const u8).expose_addr();
    let uservec_addr = (unsafe { &uservec } as *const u8).expose_addr();
    let trampoline_uservec = TRAMPOLINE + (uservec_addr - trampoline_base);
    w_stvec(trampoline_uservec);

    // set up trapframe values that uservec will need next time this
    // process traps into the kernel.
    {
        let kstack_top = proc_kstack_top(idx);
        let tf = trapframe(idx);
        tf.kernel_satp = r_satp() as u64;
        tf.kernel_sp = kstack_top as u64;
        tf.kernel_trap = usertrap as usize as u64;
        tf.kernel_hartid = r_tp();
    }

    // set S Previous Privilege mode to User.
    let mut x = r_sstatus();
    x &= !SSTATUS_SPP;
    x |= SSTATUS_SPIE;
    w_sstatus(x);

    // set S Exception Program Counter to the saved user pc.
    w_sepc(trapframe(idx).epc as usize);

    // tell trampoline.S the user page table to switch to.
    let satp = MAKE_SATP!(pagetable(idx) as *mut _ as usize);

    let trampoline_userret = TRAMPOLINE + ((unsafe { &userret } as *const u8).expose_addr() - trampoline_base);
    let userret_fn: extern "C" fn(usize) = unsafe { core::mem::transmute(trampoline_userret) };
    userret_fn(satp);
}

// interrupts and exceptions from kernel code go here via kernelvec, on
// whatever the current kernel stack is.
#[no_mangle]
pub extern "C" fn kerneltrap() {
    let sepc = r_sepc();
    let sstatus = r_sstatus();
    let scause = r_scause();

    if (sstatus & SSTATUS_SPP) == 0 {
        panic!("kerneltrap: not from supervisor mode");
    }
    if intr_get() {
        panic!("kerneltrap: interrupts enabled");
    }

    let which_dev = devintr();
    if which_dev == 0 {
        printf!("scause {:#x}\n", scause);
        printf!("sepc={:#x} stval={:#x}\n", r_sepc(), r_stval());
        panic!("kerneltrap");
    }

    // give up the CPU if this is a timer interrupt and a process is
    // actually running here.
    if which_dev == 2 {
        if let Some(idx) = mycpu().proc {
            if proc_state(idx) == Procstate::Running && ActivePolicy::on_tick(idx) {
                yield_();
            }
        }
    }

    // the yield may have caused some traps to occur, so restore trap
    // registers for use by kernelvec.S's sepc instruction.
    w_sepc(sepc);
    w_sstatus(sstatus);
}

pub fn clockintr() {
    tick_lock_acquire();
    ticks_advance();

    ActivePolicy::on_global_tick();
    update_time();
    wakeup(ticks_chan());

    tick_lock_release();
}

// check if it's an external interrupt or software interrupt, and handle
// it. returns 2 if timer interrupt, 1 if other device, 0 if not
// recognized.
fn devintr() -> i32 {
    let scause = r_scause();

    if (scause & 0x8000000000000000) != 0 && (scause & 0xff) == 9 {
        // supervisor external interrupt via PLIC.
        let irq = plic_claim();

        if irq as usize == UART0_IRQ {
            uartintr();
        } else if irq as usize == VIRTIO0_IRQ {
            // no block device behind this core; nothing to service.
        } else if irq != 0 {
            printf!("unexpected interrupt irq={}\n", irq);
        }

        if irq != 0 {
            plic_complete(irq);
        }

        1
    } else if scause == 0x8000000000000001 {
        // software interrupt from a machine-mode timer interrupt,
        // forwarded by timervec in kernelvec.S.
        if cpuid() == 0 {
            clockintr();
        }

        // acknowledge the software interrupt by clearing SSIP in sip.
        w_sip(r_sip() & !2);

        2
    } else {
        0
    }
}
