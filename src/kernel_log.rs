//! Wires the `log` crate up to the kernel console, so the rest of the
//! kernel can use `log::info!`/`warn!`/`debug!` instead of ad hoc `printf!`
//! calls for anything that isn't operator-facing text (panics, `^P`).

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::printf::PRINTER;

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        unsafe {
            PRINTER.printf(core::format_args!(
                "[{}] {}\n",
                record.level(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Must be called once, early in boot, before
/// any other subsystem logs anything.
pub fn init() {
    // log::set_logger requires a &'static Log; KernelLogger carries no
    // state so a single static instance is fine to hand out repeatedly.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LevelFilter::Info);
}
