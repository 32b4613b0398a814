//! Real-mode interrupt vector table handling.
//!
//! The IVT lives at physical 0000:0000 and holds one `offset:segment` pair
//! per vector. The kernel only rewrites the vectors it services; everything
//! else keeps the firmware's handler so BIOS services stay reachable.

use core::fmt;

use super::interrupts::{is_serviced_vector, SERVICED_VECTOR_COUNT, SERVICED_VECTORS};

/// A real-mode `segment:offset` code address.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FarPtr {
    pub offset: u16,
    pub segment: u16,
}

impl FarPtr {
    pub const fn new(segment: u16, offset: u16) -> Self {
        Self { offset, segment }
    }

    /// 20-bit physical address this pointer resolves to.
    pub const fn linear(&self) -> u32 {
        ((self.segment as u32) << 4) + self.offset as u32
    }
}

impl fmt::Display for FarPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.segment, self.offset)
    }
}

/// Access to the 256 IVT entries.
pub trait VectorTable {
    /// Returns the handler address stored for `vector`.
    fn read_vector(&self, vector: u8) -> FarPtr;

    /// Points `vector` at `target`. Callers keep interrupts masked.
    fn write_vector(&self, vector: u8, target: FarPtr);
}

/// Source of the per-vector entry stubs that funnel into the dispatcher.
pub trait TrapStubs {
    /// Entry stub for a serviced vector, or `None` for any other vector.
    fn stub_address(&self, vector: u8) -> Option<FarPtr>;
}

/// Writes the entry stub of every serviced vector into the IVT.
///
/// Returns the number of vectors written. Vectors outside the serviced set
/// are never touched, and a serviced vector without a stub keeps its
/// current entry.
pub fn install_trap_stubs<T>(table: &T) -> usize
where
    T: VectorTable + TrapStubs + ?Sized,
{
    let mut installed = 0;
    for &vector in SERVICED_VECTORS.iter() {
        debug_assert!(is_serviced_vector(vector));
        let Some(stub) = table.stub_address(vector) else {
            log::warn!(target: "traps", "no entry stub for vector {:#04x}", vector);
            continue;
        };
        table.write_vector(vector, stub);
        installed += 1;
    }

    log::debug!(
        target: "traps",
        "installed {}/{} trap stubs",
        installed,
        SERVICED_VECTOR_COUNT
    );
    installed
}
