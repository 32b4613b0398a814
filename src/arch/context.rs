//! Saved CPU state and the context-switch primitive.

use core::mem::{offset_of, size_of};

/// Complete 16-bit register image of a suspended flow of control.
///
/// Layout contract:
/// - Field offsets are hard-coded in the real-mode switch routine.
/// - Any change requires synchronized updates in assembly and tests.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuState {
    pub di: u16,
    pub si: u16,
    pub bp: u16,
    pub sp: u16,
    pub bx: u16,
    pub dx: u16,
    pub cx: u16,
    pub ax: u16,
    pub es: u16,
    pub ds: u16,
    pub flags: u16,
    pub ip: u16,
    pub cs: u16,
    pub ss: u16,
}

impl CpuState {
    /// All-zero record used for unused task slots.
    pub const fn zeroed() -> Self {
        Self {
            di: 0,
            si: 0,
            bp: 0,
            sp: 0,
            bx: 0,
            dx: 0,
            cx: 0,
            ax: 0,
            es: 0,
            ds: 0,
            flags: 0,
            ip: 0,
            cs: 0,
            ss: 0,
        }
    }
}

pub const CPU_STATE_DI: usize = offset_of!(CpuState, di);
pub const CPU_STATE_SI: usize = offset_of!(CpuState, si);
pub const CPU_STATE_BP: usize = offset_of!(CpuState, bp);
pub const CPU_STATE_SP: usize = offset_of!(CpuState, sp);
pub const CPU_STATE_BX: usize = offset_of!(CpuState, bx);
pub const CPU_STATE_DX: usize = offset_of!(CpuState, dx);
pub const CPU_STATE_CX: usize = offset_of!(CpuState, cx);
pub const CPU_STATE_AX: usize = offset_of!(CpuState, ax);
pub const CPU_STATE_ES: usize = offset_of!(CpuState, es);
pub const CPU_STATE_DS: usize = offset_of!(CpuState, ds);
pub const CPU_STATE_FLAGS: usize = offset_of!(CpuState, flags);
pub const CPU_STATE_IP: usize = offset_of!(CpuState, ip);
pub const CPU_STATE_CS: usize = offset_of!(CpuState, cs);
pub const CPU_STATE_SS: usize = offset_of!(CpuState, ss);

const _: () = assert!(size_of::<CpuState>() == 28);
const _: () = assert!(CPU_STATE_SP == 6);
const _: () = assert!(CPU_STATE_FLAGS == 20);
const _: () = assert!(CPU_STATE_SS == 26);

/// The register save/restore primitive.
pub trait ContextSwitch {
    /// Saves the running flow into `old` and resumes the flow described by `new`.
    ///
    /// Returns only when some later switch loads the record written to `old`.
    ///
    /// # Safety
    /// - `old` must be valid for writes of one [`CpuState`].
    /// - `new` must hold a record produced by a previous switch-out or by the
    ///   scheduler's bootstrap, with `SS:SP` inside a live stack.
    unsafe fn switch(&self, old: *mut CpuState, new: *const CpuState);
}
