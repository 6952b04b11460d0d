#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![feature(panic_info_message)]
#![feature(strict_provenance)]

mod asm;
mod console;
mod file;
mod fs;
mod kalloc;
mod kernel_log;
mod memlayout;
mod param;
mod plic;
mod policy;
mod printf;
mod proc;
mod riscv;
mod spinlock;
mod start;
mod string;
mod syscall;
mod trap;
mod uart;
mod vm;

use core::sync::atomic::{AtomicBool, Ordering};

use crate::kalloc::KMem;
use crate::proc::cpuid;
use crate::riscv::__sync_synchronize;
use crate::uart::Uart;

#[cfg(not(test))]
#[no_mangle]
extern "C" fn eh_personality() {}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    printf!("Aborting: \n");
    if let Some(p) = info.location() {
        if let Some(msg) = info.message() {
            printf!("line {}, file {}: {}\n", p.line(), p.file(), msg);
        } else {
            printf!("line {}, file {}\n", p.line(), p.file());
        }
    } else {
        printf!("no information available.\n");
    }
    abort();
}

#[cfg(not(test))]
#[no_mangle]
extern "C" fn abort() -> ! {
    loop {
        unsafe { core::arch::asm!("wfi") }
    }
}

static STARTED: AtomicBool = AtomicBool::new(false);

#[no_mangle]
pub extern "C" fn kmain() {
    if cpuid() == 0 {
        Uart::init();
        kernel_log::init();
        printf!("\nkernel is booting...\n\n");

        KMem::kinit(); // physical page allocator
        log::debug!("memory allocator initialized");

        vm::kvminit(); // create kernel page table
        log::debug!("kernel page table created");

        vm::kvminithart(); // turn on paging
        log::debug!("paging enabled");

        proc::procinit(); // process table
        log::debug!("process table initialized");

        trap::trapinit(); // trap vectors
        trap::trapinithart(); // install kernel trap vector
        log::debug!("trap vectors installed");

        plic::plicinit(); // set up interrupt controller
        plic::plicinithart(); // ask PLIC for device interrupts
        log::debug!("PLIC configured");

        file::fileinit(); // open-file table
        console::Console::init(); // wire console into the device-switch table

        proc::userinit(); // first user process
        log::info!("first user process scheduled");

        __sync_synchronize();
        STARTED.store(true, Ordering::Relaxed);
        printf!("\nboot successful\n");
    } else {
        while !STARTED.load(Ordering::Relaxed) {}

        __sync_synchronize();
        printf!("hart {} starting\n", cpuid());
        vm::kvminithart(); // turn on paging
        trap::trapinithart(); // install kernel trap vector
        plic::plicinithart(); // ask PLIC for device interrupts
    }

    proc::scheduler();
}
