//! Boot sequence for the execution-control core.
//!
//! Order matters: traps first so a fault during the later phases is
//! reported instead of vectoring into firmware, then the heap, then the
//! scheduler whose idle task needs a stack from the heap.

use core::fmt;

use crate::arch::{self, interrupts, Cpu, Platform};
use crate::config::KernelConfig;
use crate::memory::heap::{self, HeapError};
use crate::scheduler::{self, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    /// The heap rejected the configured pool.
    Heap(HeapError),
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Heap(err) => write!(f, "heap: {}", err),
        }
    }
}

impl From<HeapError> for BootError {
    fn from(err: HeapError) -> Self {
        Self::Heap(err)
    }
}

fn init_phase<T>(name: &str, phase: impl FnOnce() -> Result<T, BootError>) -> Result<T, BootError> {
    log::info!(target: "boot", "{}...", name);
    let result = phase();
    match &result {
        Ok(_) => log::info!(target: "boot", "{} done", name),
        Err(err) => log::error!(target: "boot", "{} failed: {}", name, err),
    }
    result
}

/// Brings up traps, heap and scheduler on `platform`.
///
/// On success the calling flow is the running idle task; finish boot with
/// [`run_idle`] after creating the initial tasks.
///
/// # Safety
/// `config.heap_start..config.heap_start + config.heap_size` must be unused,
/// writable memory in the kernel data segment.
pub unsafe fn init_kernel(platform: &'static dyn Platform, config: &KernelConfig) -> Result<TaskId, BootError> {
    let platform = arch::install(platform);
    log::set_max_level(config.log_level);

    init_phase("traps", || {
        interrupts::set_timer_preemption(config.timer_preemption);
        interrupts::init(platform, config.irq_lines);
        Ok(())
    })?;

    init_phase("heap", || {
        // SAFETY:
        // - Forwarded caller contract on the configured pool.
        unsafe { heap::init(config.heap_start as *mut u8, config.heap_size) }?;
        Ok(())
    })?;

    init_phase("scheduler", || Ok(scheduler::init()))
}

/// Turns the boot flow into the idle loop. Never returns.
pub fn run_idle() -> ! {
    log::info!(target: "boot", "entering idle loop");
    if let Some(cpu) = arch::platform() {
        cpu.enable_interrupts();
    }
    loop {
        scheduler::yield_now();
    }
}
