//! Chained 8259 programmable interrupt controllers.
//!
//! At power-on the BIOS maps the primary controller to vectors 0x08–0x0F,
//! which collide with CPU exception vectors. [`ChainedPic::remap`] moves the
//! sixteen lines to a contiguous block starting at the configured offset:
//!
//! | Line  | Vector | Device              |
//! |-------|--------|---------------------|
//! | 0     | 0x20   | PIT timer           |
//! | 1     | 0x21   | keyboard            |
//! | 2     | 0x22   | cascade (secondary) |
//! | 3     | 0x23   | COM2                |
//! | 4     | 0x24   | COM1                |
//! | 5–7   | 0x25–0x27 | LPT2, floppy, LPT1 |
//! | 8–15  | 0x28–0x2F | secondary controller |

use bitflags::bitflags;

use super::port::PortByte;
use super::PortIo;

const PIC1_COMMAND: PortByte = PortByte::new(0x20);
const PIC1_DATA: PortByte = PortByte::new(0x21);
const PIC2_COMMAND: PortByte = PortByte::new(0xA0);
const PIC2_DATA: PortByte = PortByte::new(0xA1);
/// POST diagnostic port, written to give the controllers time to settle.
const IO_WAIT_PORT: PortByte = PortByte::new(0x80);

const PIC_EOI: u8 = 0x20;
const PIC_ICW1_INIT: u8 = 0x10;
const PIC_ICW1_ICW4: u8 = 0x01;
const PIC_ICW3_PRIMARY_HAS_SECONDARY_ON_LINE2: u8 = 0x04;
const PIC_ICW3_SECONDARY_CASCADE_ID: u8 = 0x02;
const PIC_ICW4_8086: u8 = 0x01;

/// Number of lines served by both controllers together.
pub const PIC_LINES: u8 = 16;

bitflags! {
    /// One bit per controller line; a set bit means "line enabled".
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqMask: u16 {
        const TIMER = 1 << 0;
        const KEYBOARD = 1 << 1;
        const CASCADE = 1 << 2;
        const COM2 = 1 << 3;
        const COM1 = 1 << 4;
        const LPT2 = 1 << 5;
        const FLOPPY = 1 << 6;
        const LPT1 = 1 << 7;
        const RTC = 1 << 8;
        const LINE9 = 1 << 9;
        const LINE10 = 1 << 10;
        const LINE11 = 1 << 11;
        const MOUSE = 1 << 12;
        const FPU = 1 << 13;
        const PRIMARY_ATA = 1 << 14;
        const SECONDARY_ATA = 1 << 15;
    }
}

impl IrqMask {
    /// Lines the kernel enables at boot.
    pub const BOOT_DEFAULT: Self = Self::TIMER
        .union(Self::KEYBOARD)
        .union(Self::CASCADE)
        .union(Self::COM2)
        .union(Self::COM1);

    /// Mask bit for a single line, `None` when `line` is out of range.
    pub const fn line(line: u8) -> Option<Self> {
        if line < PIC_LINES {
            Some(Self::from_bits_retain(1 << line))
        } else {
            None
        }
    }
}

/// Primary/secondary controller pair with their vector offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainedPic {
    primary_offset: u8,
    secondary_offset: u8,
}

impl ChainedPic {
    /// Pair mapped to `base..base + 16`.
    pub const fn new(base: u8) -> Self {
        Self {
            primary_offset: base,
            secondary_offset: base.wrapping_add(8),
        }
    }

    pub const fn primary_offset(&self) -> u8 {
        self.primary_offset
    }

    pub const fn secondary_offset(&self) -> u8 {
        self.secondary_offset
    }

    /// Maps a vector back to its controller line.
    pub fn line_for_vector(&self, vector: u8) -> Option<u8> {
        let line = vector.checked_sub(self.primary_offset)?;
        (line < PIC_LINES).then_some(line)
    }

    /// Runs the ICW1..ICW4 initialization sequence on both controllers.
    ///
    /// Leaves every line masked; callers enable lines with [`Self::unmask`].
    pub fn remap<P: PortIo + ?Sized>(&self, io: &P) {
        let icw1 = PIC_ICW1_INIT | PIC_ICW1_ICW4;

        // SAFETY:
        // - Interrupts are masked by the caller for the whole sequence.
        // - The ports are the fixed ISA addresses of the 8259 pair.
        unsafe {
            PIC1_COMMAND.write(io, icw1);
            io_wait(io);
            PIC2_COMMAND.write(io, icw1);
            io_wait(io);

            PIC1_DATA.write(io, self.primary_offset);
            io_wait(io);
            PIC2_DATA.write(io, self.secondary_offset);
            io_wait(io);

            PIC1_DATA.write(io, PIC_ICW3_PRIMARY_HAS_SECONDARY_ON_LINE2);
            io_wait(io);
            PIC2_DATA.write(io, PIC_ICW3_SECONDARY_CASCADE_ID);
            io_wait(io);

            PIC1_DATA.write(io, PIC_ICW4_8086);
            io_wait(io);
            PIC2_DATA.write(io, PIC_ICW4_8086);
            io_wait(io);
        }
        self.mask_all(io);
    }

    /// Disables every line on both controllers.
    pub fn mask_all<P: PortIo + ?Sized>(&self, io: &P) {
        self.write_enabled(io, IrqMask::empty());
    }

    /// Enables `lines` in addition to whatever is already enabled.
    pub fn unmask<P: PortIo + ?Sized>(&self, io: &P, lines: IrqMask) {
        let enabled = self.enabled(io);
        self.write_enabled(io, enabled | lines);
    }

    /// Disables `lines`, leaving the others unchanged.
    pub fn mask<P: PortIo + ?Sized>(&self, io: &P, lines: IrqMask) {
        let enabled = self.enabled(io);
        self.write_enabled(io, enabled - lines);
    }

    /// Reads back the set of enabled lines from both mask registers.
    pub fn enabled<P: PortIo + ?Sized>(&self, io: &P) -> IrqMask {
        // SAFETY:
        // - Reading an 8259 data port returns its interrupt mask register.
        let (primary, secondary) = unsafe { (PIC1_DATA.read(io), PIC2_DATA.read(io)) };
        let masked = u16::from_le_bytes([primary, secondary]);
        IrqMask::from_bits_retain(!masked)
    }

    /// Acknowledges `line`. Lines 8–15 are acknowledged on both controllers.
    pub fn end_of_interrupt<P: PortIo + ?Sized>(&self, io: &P, line: u8) {
        // SAFETY:
        // - Writing the non-specific EOI command only clears the in-service bit.
        unsafe {
            if line >= 8 {
                PIC2_COMMAND.write(io, PIC_EOI);
            }
            PIC1_COMMAND.write(io, PIC_EOI);
        }
    }

    fn write_enabled<P: PortIo + ?Sized>(&self, io: &P, enabled: IrqMask) {
        let [primary, secondary] = (!enabled.bits()).to_le_bytes();
        // SAFETY:
        // - Writing the data port outside an init sequence sets the mask register.
        unsafe {
            PIC1_DATA.write(io, primary);
            PIC2_DATA.write(io, secondary);
        }
    }
}

#[inline]
fn io_wait<P: PortIo + ?Sized>(io: &P) {
    // SAFETY:
    // - Port 0x80 has no side effects besides the bus delay.
    unsafe {
        IO_WAIT_PORT.write(io, 0);
    }
}
