//! x86 port I/O.
//!
//! `inb`/`outb` are the raw instructions used by the real-mode backend.
//! [`PortByte`] binds a fixed port number and goes through a [`PortIo`]
//! implementation, so code built on it runs against any platform.

use super::PortIo;

/// `in al, dx`.
///
/// # Safety
/// Reading some ports acknowledges or consumes device state.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[inline]
pub(crate) unsafe fn inb(port: u16) -> u8 {
    let value: u8;
    core::arch::asm!(
        "in al, dx",
        out("al") value,
        in("dx") port,
        options(nomem, nostack, preserves_flags)
    );
    value
}

/// `out dx, al`.
///
/// # Safety
/// The write goes straight to the device behind `port`.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[inline]
pub(crate) unsafe fn outb(port: u16, value: u8) {
    core::arch::asm!(
        "out dx, al",
        in("dx") port,
        in("al") value,
        options(nomem, nostack, preserves_flags)
    );
}

/// A fixed byte-wide port, accessed through whichever [`PortIo`] is passed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortByte {
    port: u16,
}

impl PortByte {
    /// Binds port number `port`.
    pub const fn new(port: u16) -> Self {
        Self { port }
    }

    /// Reads one byte via `io`.
    ///
    /// # Safety
    /// Same contract as [`PortIo::read_u8`].
    #[inline]
    pub unsafe fn read<P: PortIo + ?Sized>(&self, io: &P) -> u8 {
        io.read_u8(self.port)
    }

    /// Writes `value` via `io`.
    ///
    /// # Safety
    /// Same contract as [`PortIo::write_u8`].
    #[inline]
    pub unsafe fn write<P: PortIo + ?Sized>(&self, io: &P, value: u8) {
        io.write_u8(self.port, value)
    }
}
