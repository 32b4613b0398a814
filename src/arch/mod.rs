//! Architecture layer for the 16-bit real-mode x86 target.
//!
//! The kernel core never touches hardware directly. Everything it needs from
//! the machine is expressed by the traits below:
//!
//! | Trait           | Concern                                         |
//! |-----------------|-------------------------------------------------|
//! | [`PortIo`]      | `in`/`out` on byte ports (8259 programming)     |
//! | [`Cpu`]         | interrupt flag, halt, kernel segment values     |
//! | [`VectorTable`] | reading/writing IVT entries at 0000:0000        |
//! | [`TrapStubs`]   | addresses of the per-vector entry stubs         |
//! | [`ContextSwitch`] | the register save/restore primitive           |
//!
//! [`realmode::RealModeMachine`] implements all of them on the bare-metal
//! target. Host tests use [`crate::testing::RecordingMachine`].

pub mod constants;
pub mod context;
pub mod interrupts;
pub mod ivt;
pub mod pic;
pub mod port;

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod realmode;

use spin::Once;

pub use context::{ContextSwitch, CpuState};
pub use ivt::{FarPtr, TrapStubs, VectorTable};

/// Byte-wide port I/O.
pub trait PortIo {
    /// Reads one byte from `port`.
    ///
    /// # Safety
    /// Port I/O can change arbitrary hardware state.
    unsafe fn read_u8(&self, port: u16) -> u8;

    /// Writes one byte to `port`.
    ///
    /// # Safety
    /// Port I/O can change arbitrary hardware state.
    unsafe fn write_u8(&self, port: u16, value: u8);
}

/// Processor control used by the scheduler, trap layer and halt path.
pub trait Cpu {
    /// Returns whether maskable interrupts are currently enabled (IF set).
    fn interrupts_enabled(&self) -> bool;

    /// Clears IF.
    fn disable_interrupts(&self);

    /// Sets IF.
    fn enable_interrupts(&self);

    /// Stops the processor for good with interrupts masked.
    fn halt_forever(&self) -> !;

    /// Segment the kernel code runs in (CS of new tasks and entry stubs).
    fn kernel_code_segment(&self) -> u16;

    /// Segment holding kernel data, the heap pool and all task stacks.
    fn kernel_data_segment(&self) -> u16;
}

/// Everything the kernel core needs from the machine.
pub trait Platform: PortIo + Cpu + VectorTable + TrapStubs + ContextSwitch + Sync {}

impl<T> Platform for T where T: PortIo + Cpu + VectorTable + TrapStubs + ContextSwitch + Sync {}

static PLATFORM: Once<&'static dyn Platform> = Once::new();

/// Registers the active platform. Only the first call has an effect.
pub fn install(platform: &'static dyn Platform) -> &'static dyn Platform {
    *PLATFORM.call_once(|| platform)
}

/// Returns the platform registered with [`install`], if any.
pub fn platform() -> Option<&'static dyn Platform> {
    PLATFORM.get().copied()
}
