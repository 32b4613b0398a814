//! Trap setup and dispatch.
//!
//! Every serviced vector enters through a small stub that saves the
//! registers and calls [`trap_dispatch`]. From there:
//! - CPU exceptions (vectors below [`IRQ_BASE`]) print a report and halt.
//! - Remapped controller vectors run the handler registered for the line
//!   and are then acknowledged, whether a handler exists or not.
//! - Anything else is logged and ignored.

use core::fmt;
use core::mem::{offset_of, size_of};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::ivt::{self, FarPtr};
use super::pic::{ChainedPic, IrqMask, PIC_LINES};
use super::{Cpu, Platform, PortIo};
use crate::config::PIC_REMAP_OFFSET;
use crate::panic;
use crate::scheduler;
use crate::sync::spinlock::SpinLock;

/// First vector of the remapped controller block.
pub const IRQ_BASE: u8 = PIC_REMAP_OFFSET;
pub const IRQ0_PIT_TIMER_VECTOR: u8 = IRQ_BASE;
pub const IRQ1_KEYBOARD_VECTOR: u8 = IRQ_BASE + 1;
pub const IRQ2_PIC_CASCADE_VECTOR: u8 = IRQ_BASE + 2;
pub const IRQ3_COM2_VECTOR: u8 = IRQ_BASE + 3;
pub const IRQ4_COM1_VECTOR: u8 = IRQ_BASE + 4;
pub const IRQ8_CMOS_RTC_VECTOR: u8 = IRQ_BASE + 8;
pub const IRQ15_SECONDARY_ATA_VECTOR: u8 = IRQ_BASE + 15;

pub const EXCEPTION_DIVIDE_ERROR: u8 = 0;
pub const EXCEPTION_DEBUG: u8 = 1;
pub const EXCEPTION_NMI: u8 = 2;
pub const EXCEPTION_BREAKPOINT: u8 = 3;
pub const EXCEPTION_OVERFLOW: u8 = 4;
pub const EXCEPTION_BOUND_RANGE: u8 = 5;
pub const EXCEPTION_INVALID_OPCODE: u8 = 6;
pub const EXCEPTION_DEVICE_NOT_AVAILABLE: u8 = 7;

/// Controller line of the PIT timer.
pub const TIMER_LINE: u8 = 0;

/// Exception vectors that get a dispatch stub.
///
/// Vectors 0x08..0x1F are left to the firmware: in real mode that range
/// carries the legacy IRQ block and BIOS services (`int 0x10`, `int 0x13`,
/// ...), which the rest of the system still calls.
const SERVICED_EXCEPTIONS: core::ops::RangeInclusive<u8> =
    EXCEPTION_DIVIDE_ERROR..=EXCEPTION_DEVICE_NOT_AVAILABLE;

pub const SERVICED_VECTOR_COUNT: usize = 8 + PIC_LINES as usize;

/// Every vector whose IVT entry is pointed at a dispatch stub.
pub const SERVICED_VECTORS: [u8; SERVICED_VECTOR_COUNT] = serviced_vectors();

const fn serviced_vectors() -> [u8; SERVICED_VECTOR_COUNT] {
    let mut vectors = [0u8; SERVICED_VECTOR_COUNT];
    let mut i = 0;
    while i < 8 {
        vectors[i] = i as u8;
        i += 1;
    }
    while i < SERVICED_VECTOR_COUNT {
        vectors[i] = IRQ_BASE + (i - 8) as u8;
        i += 1;
    }
    vectors
}

/// Returns whether `vector` is routed to a dispatch stub.
pub fn is_serviced_vector(vector: u8) -> bool {
    SERVICED_EXCEPTIONS.contains(&vector) || (IRQ_BASE..IRQ_BASE + PIC_LINES).contains(&vector)
}

/// Register image pushed by the entry stubs.
///
/// Layout contract:
/// - `di..ax` is the `pusha` block, `es`/`ds` are pushed by the stub before
///   it, `ip`/`cs`/`flags` are the frame the CPU pushed on entry.
/// - Must match the push order in the real-mode stubs and the layout tests.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
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
    pub ip: u16,
    pub cs: u16,
    pub flags: u16,
}

const _: () = assert!(size_of::<TrapFrame>() == 26);
const _: () = assert!(offset_of!(TrapFrame, es) == 16);
const _: () = assert!(offset_of!(TrapFrame, ip) == 20);

/// Handler for one controller line; receives the line number.
pub type IrqHandler = fn(u8);

/// Diagnostic data for an unrecoverable CPU exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultReport {
    pub vector: u8,
    /// `cs:ip` of the faulting instruction, when the frame is known.
    pub at: Option<FarPtr>,
    pub flags: Option<u16>,
}

impl FaultReport {
    pub fn new(vector: u8, frame: Option<&TrapFrame>) -> Self {
        Self {
            vector,
            at: frame.map(|f| FarPtr::new(f.cs, f.ip)),
            flags: frame.map(|f| f.flags),
        }
    }

    /// Name of the exception, `None` for vectors without a specific case.
    pub fn name(&self) -> Option<&'static str> {
        match self.vector {
            EXCEPTION_DIVIDE_ERROR => Some("Divide by Zero"),
            EXCEPTION_INVALID_OPCODE => Some("Invalid Opcode"),
            _ => None,
        }
    }
}

impl fmt::Display for FaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} Exception!", name)?,
            None => write!(f, "Unhandled Exception {:#04x}!", self.vector)?,
        }
        if let Some(at) = self.at {
            write!(f, " at {}", at)?;
        }
        if let Some(flags) = self.flags {
            write!(f, " flags={:#06x}", flags)?;
        }
        Ok(())
    }
}

/// What [`Dispatcher::dispatch`] did with a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// CPU exception: the caller must report and halt.
    Fatal(FaultReport),
    /// Controller line acknowledged; `handled` is false for unregistered lines.
    Irq { line: u8, handled: bool },
    /// Vector outside both ranges.
    Ignored,
}

/// Per-line routing table plus the controller it acknowledges.
#[derive(Clone, Copy)]
pub struct Dispatcher {
    pic: ChainedPic,
    handlers: [Option<IrqHandler>; PIC_LINES as usize],
}

impl Dispatcher {
    pub const fn new(pic: ChainedPic) -> Self {
        Self {
            pic,
            handlers: [None; PIC_LINES as usize],
        }
    }

    pub const fn pic(&self) -> ChainedPic {
        self.pic
    }

    /// Installs `handler` for `line` and returns the one it replaces.
    pub fn register(&mut self, line: u8, handler: IrqHandler) -> Option<IrqHandler> {
        let slot = self.handlers.get_mut(line as usize)?;
        slot.replace(handler)
    }

    pub fn unregister(&mut self, line: u8) -> Option<IrqHandler> {
        self.handlers.get_mut(line as usize)?.take()
    }

    pub fn handler(&self, line: u8) -> Option<IrqHandler> {
        self.handlers.get(line as usize).copied().flatten()
    }

    /// Routes one vector. Never blocks.
    pub fn dispatch<P: PortIo + ?Sized>(
        &self,
        io: &P,
        vector: u8,
        frame: Option<&TrapFrame>,
    ) -> DispatchOutcome {
        if vector < self.pic.primary_offset() {
            return DispatchOutcome::Fatal(FaultReport::new(vector, frame));
        }

        let Some(line) = self.pic.line_for_vector(vector) else {
            log::warn!(target: "traps", "spurious vector {:#04x} ignored", vector);
            return DispatchOutcome::Ignored;
        };

        let handled = match self.handler(line) {
            Some(handler) => {
                handler(line);
                true
            }
            None => {
                log::warn!(
                    target: "traps",
                    "Unhandled IRQ {} (Vector {:#04x})",
                    line,
                    vector
                );
                false
            }
        };

        self.pic.end_of_interrupt(io, line);
        DispatchOutcome::Irq { line, handled }
    }
}

static DISPATCHER: SpinLock<Dispatcher> = SpinLock::new(Dispatcher::new(ChainedPic::new(IRQ_BASE)));

static TICKS: AtomicU32 = AtomicU32::new(0);

static TIMER_PREEMPTION: AtomicBool = AtomicBool::new(false);

fn dispatcher() -> Dispatcher {
    *DISPATCHER.lock()
}

/// Initializes the controllers and the IVT, then enables `lines` and IF.
///
/// Interrupts stay disabled for the whole reprogramming sequence.
pub fn init<P: Platform + ?Sized>(platform: &P, lines: IrqMask) {
    platform.disable_interrupts();

    let pic = dispatcher().pic();
    pic.remap(platform);
    let installed = ivt::install_trap_stubs(platform);

    let lines = lines | cascade_for(lines);
    pic.unmask(platform, lines);
    TICKS.store(0, Ordering::Release);

    log::info!(
        target: "traps",
        "pic remapped to {:#04x}/{:#04x}, {} vectors installed, lines {:#06x} enabled",
        pic.primary_offset(),
        pic.secondary_offset(),
        installed,
        lines.bits()
    );

    platform.enable_interrupts();
}

/// Lines on the secondary controller are only delivered through the cascade.
fn cascade_for(lines: IrqMask) -> IrqMask {
    if lines.bits() & 0xFF00 != 0 {
        IrqMask::CASCADE
    } else {
        IrqMask::empty()
    }
}

/// Registers the driver handler for controller `line` (0–15).
///
/// Returns the previously registered handler. Out-of-range lines are ignored.
pub fn register_irq_handler(line: u8, handler: IrqHandler) -> Option<IrqHandler> {
    if line >= PIC_LINES {
        log::warn!(target: "traps", "handler for invalid line {} ignored", line);
        return None;
    }
    DISPATCHER.lock().register(line, handler)
}

/// Removes the handler for `line`.
pub fn unregister_irq_handler(line: u8) -> Option<IrqHandler> {
    DISPATCHER.lock().unregister(line)
}

/// Enables one controller line.
pub fn unmask_line<P: PortIo + ?Sized>(io: &P, line: u8) {
    if let Some(mask) = IrqMask::line(line) {
        dispatcher().pic().unmask(io, mask);
    }
}

/// Disables one controller line.
pub fn mask_line<P: PortIo + ?Sized>(io: &P, line: u8) {
    if let Some(mask) = IrqMask::line(line) {
        dispatcher().pic().mask(io, mask);
    }
}

/// Lets the timer line call [`scheduler::yield_now`] after each tick.
pub fn set_timer_preemption(enabled: bool) {
    TIMER_PREEMPTION.store(enabled, Ordering::Release);
}

pub fn timer_preemption() -> bool {
    TIMER_PREEMPTION.load(Ordering::Acquire)
}

/// Timer interrupts seen since [`init`].
pub fn ticks() -> u32 {
    TICKS.load(Ordering::Acquire)
}

/// Dispatches one vector against the installed platform.
///
/// Exceptions do not return. Without a platform nothing is acknowledged and
/// the vector is reported as ignored.
pub fn dispatch(vector: u8, frame: Option<&TrapFrame>) -> DispatchOutcome {
    let Some(platform) = super::platform() else {
        log::error!(target: "traps", "vector {:#04x} before platform install", vector);
        return DispatchOutcome::Ignored;
    };

    let outcome = dispatcher().dispatch(platform, vector, frame);
    match outcome {
        DispatchOutcome::Fatal(report) => panic::halt(format_args!("{}", report)),
        DispatchOutcome::Irq { line: TIMER_LINE, .. } => {
            TICKS.fetch_add(1, Ordering::AcqRel);
            if timer_preemption() {
                scheduler::yield_now();
            }
        }
        DispatchOutcome::Irq { .. } | DispatchOutcome::Ignored => {}
    }
    outcome
}

/// Entry point called by every dispatch stub.
///
/// # Safety
/// - Must be entered only from a dispatch stub with interrupts disabled.
/// - `frame` must be null or point to the register block the stub pushed.
#[no_mangle]
pub unsafe extern "C" fn trap_dispatch(vector: u32, frame: *const TrapFrame) {
    // SAFETY:
    // - `frame` is provided by the stub and stays valid until it executes `iret`.
    let frame = unsafe { frame.as_ref() };
    let _ = dispatch(vector as u8, frame);
}
