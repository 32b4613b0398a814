//! Kernel tunables and boot-time configuration.

use log::LevelFilter;

use crate::arch::constants::SEGMENT_SIZE;
use crate::arch::pic::IrqMask;

/// Size of the task table, idle task included.
pub const MAX_TASKS: usize = 16;

/// Stack bytes reserved for the idle task.
pub const IDLE_TASK_STACK_SIZE: usize = 1024;

/// Stack size used by boot code for its first long-running task.
pub const DEFAULT_TASK_STACK_SIZE: usize = 2048;

/// Segment the kernel image, its heap and all task stacks live in.
pub const KERNEL_DATA_SEGMENT: u16 = 0x07E0;

/// First vector of the remapped 8259 block (primary 0x20..0x27, secondary 0x28..0x2F).
pub const PIC_REMAP_OFFSET: u8 = 0x20;

/// Largest pool the heap accepts: one real-mode data segment.
pub const MAX_POOL_SIZE: usize = SEGMENT_SIZE;

/// Runtime configuration consumed by [`crate::boot::init_kernel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Offset of the heap pool inside the kernel data segment.
    pub heap_start: usize,
    /// Pool length in bytes.
    pub heap_size: usize,
    /// Controller lines enabled once the trap layer is up.
    pub irq_lines: IrqMask,
    /// Let the timer line call `yield_now` after acknowledging the tick.
    pub timer_preemption: bool,
    /// Maximum level the kernel logger emits.
    pub log_level: LevelFilter,
}

impl KernelConfig {
    /// Configuration for a heap pool at `heap_start..heap_start + heap_size`.
    pub const fn new(heap_start: usize, heap_size: usize) -> Self {
        Self {
            heap_start,
            heap_size,
            irq_lines: IrqMask::BOOT_DEFAULT,
            timer_preemption: false,
            log_level: LevelFilter::Info,
        }
    }

    pub const fn with_irq_lines(mut self, lines: IrqMask) -> Self {
        self.irq_lines = lines;
        self
    }

    pub const fn with_timer_preemption(mut self, enabled: bool) -> Self {
        self.timer_preemption = enabled;
        self
    }

    pub const fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }
}
