//! Architecture-wide constants shared across subsystems.

use bitflags::bitflags;

/// Number of entries in the real-mode interrupt vector table at 0000:0000.
pub const IVT_ENTRIES: usize = 256;

/// Size of one IVT entry (offset word + segment word).
pub const IVT_ENTRY_SIZE: usize = 4;

/// Size of one real-mode segment in bytes.
pub const SEGMENT_SIZE: usize = 0x1_0000;

bitflags! {
    /// FLAGS register bits the kernel reads or seeds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u16 {
        /// Carry flag.
        const CARRY = 1 << 0;
        /// Reserved bit 1, always reads as one.
        const RESERVED = 1 << 1;
        /// Zero flag.
        const ZERO = 1 << 6;
        /// Trap (single-step) flag.
        const TRAP = 1 << 8;
        /// Interrupt enable flag.
        const INTERRUPT = 1 << 9;
        /// Direction flag.
        const DIRECTION = 1 << 10;
    }
}

/// FLAGS value seeded into every new task: IF set plus the reserved bit.
pub const DEFAULT_TASK_FLAGS: Flags = Flags::INTERRUPT.union(Flags::RESERVED);
