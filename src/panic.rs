//! Report-and-halt path.
//!
//! CPU exceptions, a failed idle-task bootstrap and Rust panics on the
//! bare-metal target all end here: print the report, mask interrupts and stop
//! the processor. Once halted the kernel never switches tasks again.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::{self, Cpu};

static HALTED: AtomicBool = AtomicBool::new(false);

/// Returns whether the kernel has entered the permanent halt state.
pub fn is_halted() -> bool {
    HALTED.load(Ordering::Acquire)
}

/// Prints a kernel panic report and stops the CPU for good.
pub fn halt(reason: fmt::Arguments<'_>) -> ! {
    HALTED.store(true, Ordering::Release);
    if let Some(cpu) = arch::platform() {
        cpu.disable_interrupts();
    }

    log::error!(target: "halt", "KERNEL PANIC: {}", reason);
    log::error!(target: "halt", "System halted.");

    match arch::platform() {
        Some(cpu) => cpu.halt_forever(),
        None => panic!("kernel halted without a platform: {}", reason),
    }
}

/// Panic handler - called when the kernel panics
#[cfg(all(target_os = "none", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    match info.location() {
        Some(location) => halt(format_args!(
            "{} at {}:{}",
            info.message(),
            location.file(),
            location.line()
        )),
        None => halt(format_args!("{}", info.message())),
    }
}
