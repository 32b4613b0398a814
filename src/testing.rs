//! Test support for running the kernel core on a development host.
//!
//! [`RecordingMachine`] implements the full [`Platform`](crate::arch::Platform)
//! surface in memory: port writes and context switches are logged, the IVT
//! is a plain array pre-filled with firmware-looking entries, and halting
//! the CPU panics with `"cpu halted"` so tests can observe it with
//! `#[should_panic]` or `catch_unwind`.
//!
//! Integration tests that touch the global kernel state (heap, scheduler,
//! dispatcher, installed platform) run in parallel threads of one process;
//! they serialize on [`GLOBAL_STATE_LOCK`] and call
//! [`install_recording_machine`] to get the shared machine.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use crate::arch::constants::IVT_ENTRIES;
use crate::arch::interrupts::is_serviced_vector;
use crate::arch::{self, ContextSwitch, Cpu, CpuState, FarPtr, PortIo, TrapStubs, VectorTable};
use crate::config::KERNEL_DATA_SEGMENT;
use crate::logging::ConsoleSink;

const PORT_LOG_CAPACITY: usize = 512;
const SWITCH_LOG_CAPACITY: usize = 128;

/// Code segment the recording machine reports for the kernel.
pub const TEST_CODE_SEGMENT: u16 = 0x0060;

/// Segment every untouched IVT entry points into.
pub const FIRMWARE_SEGMENT: u16 = 0xF000;

/// Offset of the first entry stub; stubs are 16 bytes apart by vector.
pub const STUB_BASE_OFFSET: u16 = 0x1000;

/// Serializes tests that use the kernel's global state.
pub static GLOBAL_STATE_LOCK: Mutex<()> = Mutex::new(());

/// One `out` instruction seen by the machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortWrite {
    pub port: u16,
    pub value: u8,
}

/// One call into the context-switch primitive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchEvent {
    pub save: usize,
    pub load: usize,
    /// Copy of the record that was loaded.
    pub loaded: CpuState,
}

struct MachineState {
    ivt: [FarPtr; IVT_ENTRIES],
    port_latch: [u8; 256],
    port_log: [PortWrite; PORT_LOG_CAPACITY],
    port_log_len: usize,
    switches: [SwitchEvent; SWITCH_LOG_CAPACITY],
    switch_len: usize,
    /// Port and IVT writes made while IF was set.
    unmasked_writes: usize,
}

impl MachineState {
    const fn new() -> Self {
        Self {
            ivt: firmware_ivt(),
            port_latch: [0; 256],
            port_log: [PortWrite { port: 0, value: 0 }; PORT_LOG_CAPACITY],
            port_log_len: 0,
            switches: [SwitchEvent {
                save: 0,
                load: 0,
                loaded: CpuState::zeroed(),
            }; SWITCH_LOG_CAPACITY],
            switch_len: 0,
            unmasked_writes: 0,
        }
    }
}

/// IVT entry the firmware would have installed for `vector`.
pub const fn firmware_vector(vector: u8) -> FarPtr {
    FarPtr::new(FIRMWARE_SEGMENT, 0xE000 + vector as u16 * 4)
}

const fn firmware_ivt() -> [FarPtr; IVT_ENTRIES] {
    let mut ivt = [FarPtr::new(0, 0); IVT_ENTRIES];
    let mut vector = 0;
    while vector < IVT_ENTRIES {
        ivt[vector] = firmware_vector(vector as u8);
        vector += 1;
    }
    ivt
}

/// In-memory machine implementing every platform trait.
pub struct RecordingMachine {
    state: Mutex<MachineState>,
    interrupts_enabled: AtomicBool,
    halts: AtomicUsize,
}

impl RecordingMachine {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(MachineState::new()),
            interrupts_enabled: AtomicBool::new(false),
            halts: AtomicUsize::new(0),
        }
    }

    /// Restores power-on state: firmware IVT, empty logs, IF clear.
    pub fn reset(&self) {
        *self.state.lock() = MachineState::new();
        self.interrupts_enabled.store(false, Ordering::Release);
    }

    /// Entry stub address this machine hands out for `vector`.
    pub const fn stub_for(vector: u8) -> FarPtr {
        FarPtr::new(TEST_CODE_SEGMENT, STUB_BASE_OFFSET + vector as u16 * 16)
    }

    /// Runs `f` on every port write since the last clear, oldest first.
    pub fn with_port_log<R>(&self, f: impl FnOnce(&[PortWrite]) -> R) -> R {
        let state = self.state.lock();
        f(&state.port_log[..state.port_log_len])
    }

    /// Number of writes to `port` since the last clear.
    pub fn writes_to(&self, port: u16) -> usize {
        self.with_port_log(|log| log.iter().filter(|w| w.port == port).count())
    }

    /// Values written to `port` since the last clear, oldest first, up to `N`.
    pub fn values_written_to<const N: usize>(&self, port: u16) -> ([u8; N], usize) {
        self.with_port_log(|log| {
            let mut values = [0u8; N];
            let mut count = 0;
            for write in log.iter().filter(|w| w.port == port) {
                if count < N {
                    values[count] = write.value;
                }
                count += 1;
            }
            (values, count)
        })
    }

    pub fn clear_port_log(&self) {
        self.state.lock().port_log_len = 0;
    }

    pub fn switch_count(&self) -> usize {
        self.state.lock().switch_len
    }

    pub fn last_switch(&self) -> Option<SwitchEvent> {
        let state = self.state.lock();
        state.switch_len.checked_sub(1).map(|i| state.switches[i])
    }

    pub fn clear_switches(&self) {
        self.state.lock().switch_len = 0;
    }

    /// Port and IVT writes made while interrupts were enabled, since reset.
    pub fn writes_while_interrupts_enabled(&self) -> usize {
        self.state.lock().unmasked_writes
    }

    /// Number of times the CPU was halted.
    pub fn halt_count(&self) -> usize {
        self.halts.load(Ordering::Acquire)
    }

    /// Forces IF, as if the code under test ran with interrupts on or off.
    pub fn set_interrupts_enabled(&self, enabled: bool) {
        self.interrupts_enabled.store(enabled, Ordering::Release);
    }
}

impl Default for RecordingMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PortIo for RecordingMachine {
    unsafe fn read_u8(&self, port: u16) -> u8 {
        let state = self.state.lock();
        state.port_latch.get(port as usize).copied().unwrap_or(0xFF)
    }

    unsafe fn write_u8(&self, port: u16, value: u8) {
        let mut state = self.state.lock();
        if let Some(latch) = state.port_latch.get_mut(port as usize) {
            *latch = value;
        }
        if self.interrupts_enabled() {
            state.unmasked_writes += 1;
        }
        let len = state.port_log_len;
        if len < PORT_LOG_CAPACITY {
            state.port_log[len] = PortWrite { port, value };
            state.port_log_len = len + 1;
        }
    }
}

impl Cpu for RecordingMachine {
    fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled.load(Ordering::Acquire)
    }

    fn disable_interrupts(&self) {
        self.interrupts_enabled.store(false, Ordering::Release);
    }

    fn enable_interrupts(&self) {
        self.interrupts_enabled.store(true, Ordering::Release);
    }

    fn halt_forever(&self) -> ! {
        self.interrupts_enabled.store(false, Ordering::Release);
        self.halts.fetch_add(1, Ordering::AcqRel);
        panic!("cpu halted");
    }

    fn kernel_code_segment(&self) -> u16 {
        TEST_CODE_SEGMENT
    }

    fn kernel_data_segment(&self) -> u16 {
        KERNEL_DATA_SEGMENT
    }
}

impl VectorTable for RecordingMachine {
    fn read_vector(&self, vector: u8) -> FarPtr {
        self.state.lock().ivt[vector as usize]
    }

    fn write_vector(&self, vector: u8, target: FarPtr) {
        let mut state = self.state.lock();
        if self.interrupts_enabled() {
            state.unmasked_writes += 1;
        }
        state.ivt[vector as usize] = target;
    }
}

impl TrapStubs for RecordingMachine {
    fn stub_address(&self, vector: u8) -> Option<FarPtr> {
        is_serviced_vector(vector).then(|| Self::stub_for(vector))
    }
}

impl ContextSwitch for RecordingMachine {
    /// Records the switch and returns at once, as if the loaded task had
    /// immediately switched back.
    unsafe fn switch(&self, old: *mut CpuState, new: *const CpuState) {
        // SAFETY:
        // - Callers pass a valid record per the trait contract.
        let loaded = unsafe { *new };
        let mut state = self.state.lock();
        let len = state.switch_len;
        if len < SWITCH_LOG_CAPACITY {
            state.switches[len] = SwitchEvent {
                save: old as usize,
                load: new as usize,
                loaded,
            };
            state.switch_len = len + 1;
        }
    }
}

static RECORDING_MACHINE: RecordingMachine = RecordingMachine::new();

/// Installs the shared [`RecordingMachine`] as the kernel platform.
///
/// Resets it to power-on state on every call.
pub fn install_recording_machine() -> &'static RecordingMachine {
    arch::install(&RECORDING_MACHINE);
    RECORDING_MACHINE.reset();
    &RECORDING_MACHINE
}

/// Console sink that drops everything; pair it with log capture.
pub struct DiscardSink;

impl ConsoleSink for DiscardSink {
    fn write_str(&self, _s: &str) {}
}

/// 16-byte aligned backing store for a test heap pool.
#[repr(C, align(16))]
pub struct AlignedPool<const N: usize>(pub [u8; N]);

impl<const N: usize> AlignedPool<N> {
    pub const fn new() -> Self {
        Self([0; N])
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr()
    }

    pub const fn len(&self) -> usize {
        N
    }

    pub const fn is_empty(&self) -> bool {
        N == 0
    }
}

impl<const N: usize> Default for AlignedPool<N> {
    fn default() -> Self {
        Self::new()
    }
}
