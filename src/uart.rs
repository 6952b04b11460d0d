//! Minimal 16550-compatible UART driver, polled on transmit and
//! interrupt-driven on receive, matching the qemu `virt` machine's UART0.

use crate::memlayout::UART0;
use crate::console::CONSOLE_INSTANCE;
use crate::spinlock::Spinlock;

// the UART control registers are memory-mapped at address UART0.
const RHR: usize = 0; // receive holding register (for input bytes)
const THR: usize = 0; // transmit holding register (for output bytes)
const IER: usize = 1; // interrupt enable register
const IER_RX_ENABLE: u8 = 1 << 0;
const IER_TX_ENABLE: u8 = 1 << 1;
const FCR: usize = 2; // FIFO control register
const FCR_FIFO_ENABLE: u8 = 1 << 0;
const FCR_FIFO_CLEAR: u8 = 3 << 1; // clear the content of the two FIFOs
const ISR: usize = 2; // interrupt status register
const LCR: usize = 3; // line control register
const LCR_EIGHT_BITS: u8 = 3;
const LCR_BAUD_LATCH: u8 = 1 << 7; // special mode to set baud rate
const LSR: usize = 5; // line status register
const LSR_RX_READY: u8 = 1 << 0; // input is waiting to be read from RHR
const LSR_TX_IDLE: u8 = 1 << 5; // THR can accept another character to send

fn reg(reg: usize) -> *mut u8 {
    (UART0 + reg) as *mut u8
}

fn write_reg(r: usize, v: u8) {
    unsafe { reg(r).write_volatile(v) }
}

fn read_reg(r: usize) -> u8 {
    unsafe { reg(r).read_volatile() }
}

pub struct Uart {
    lock: Spinlock,
}

pub static mut UART_INSTANCE: Uart = Uart::create();

impl Uart {
    const fn create() -> Self {
        Self {
            lock: Spinlock::init_lock("uart"),
        }
    }

    pub fn init() {
        // disable interrupts.
        write_reg(IER, 0x00);

        // special mode to set baud rate.
        write_reg(LCR, LCR_BAUD_LATCH);

        // LSB for baud rate of 38.4K.
        write_reg(0, 0x03);
        // MSB for baud rate of 38.4K.
        write_reg(1, 0x00);

        // leave set-baud mode, and set word length to 8 bits, no parity.
        write_reg(LCR, LCR_EIGHT_BITS);

        // reset and enable FIFOs.
        write_reg(FCR, FCR_FIFO_ENABLE | FCR_FIFO_CLEAR);

        // enable transmit and receive interrupts.
        write_reg(IER, IER_TX_ENABLE | IER_RX_ENABLE);
    }

    /// Write one character to the UART, blocking until the hardware can
    /// accept it. Used by the kernel printf path and by putc() echoing,
    /// never called while an interrupt handler may reenter it.
    pub fn putc_sync(self: &mut Self, c: u8) {
        self.lock.acquire();
        while read_reg(LSR) & LSR_TX_IDLE == 0 {
            // FIFO might be full; spin.
        }
        write_reg(THR, c);
        self.lock.release();
    }

    /// Read one input character from the UART. Returns None if none is
    /// waiting.
    fn getc(self: &mut Self) -> Option<u8> {
        if read_reg(LSR) & LSR_RX_READY != 0 {
            Some(read_reg(RHR))
        } else {
            None
        }
    }
}

/// Handle a UART interrupt, raised because input has arrived, or the UART
/// is ready for more output, or both.
pub fn uartintr() {
    loop {
        let c = unsafe { UART_INSTANCE.getc() };
        match c {
            Some(c) => unsafe { CONSOLE_INSTANCE.consoleintr(c) },
            None => break,
        }
    }
}
