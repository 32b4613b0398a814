//! Boot Sequence Integration Tests
//!
//! Brings the whole core up on the recording machine and drives it through
//! the global trap entry, the way the hardware would after boot.

use core::sync::atomic::{AtomicU32, Ordering};

use lidos_kernel::arch::interrupts::{self, DispatchOutcome, IRQ0_PIT_TIMER_VECTOR, IRQ1_KEYBOARD_VECTOR};
use lidos_kernel::arch::pic::{ChainedPic, IrqMask};
use lidos_kernel::arch::{Cpu, VectorTable};
use lidos_kernel::boot::{self, BootError};
use lidos_kernel::config::{KernelConfig, DEFAULT_TASK_STACK_SIZE};
use lidos_kernel::logging::{self, ConsoleSink};
use lidos_kernel::memory::heap::{self, HeapError};
use lidos_kernel::scheduler::{self, TaskId};
use lidos_kernel::testing::{self, AlignedPool, DiscardSink, RecordingMachine};
use log::LevelFilter;

static SINK: DiscardSink = DiscardSink;

#[derive(Default)]
struct StringSink(spin::Mutex<String>);

impl ConsoleSink for StringSink {
    fn write_str(&self, s: &str) {
        self.0.lock().push_str(s);
    }
}

extern "C" fn task_a() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

fn boot_with(config_for: impl FnOnce(usize, usize) -> KernelConfig) -> (&'static RecordingMachine, TaskId) {
    let machine = testing::install_recording_machine();
    let _ = logging::init(&SINK, LevelFilter::Trace);
    logging::set_capture_enabled(true);

    let pool: &'static mut AlignedPool<8192> = Box::leak(Box::new(AlignedPool::new()));
    let config = config_for(pool.as_mut_ptr() as usize, pool.len());
    // SAFETY: the leaked pool is unused and lives for the rest of the process.
    let idle = unsafe { boot::init_kernel(machine, &config) }.expect("kernel init");
    (machine, idle)
}

/// Contract: boot brings up traps, heap and scheduler in that order.
#[test]
fn test_init_kernel_brings_up_every_subsystem() {
    let _guard = testing::GLOBAL_STATE_LOCK.lock();
    let (machine, idle) = boot_with(|start, size| KernelConfig::new(start, size).with_log_level(LevelFilter::Debug));

    assert!(logging::captured_contains("boot", "traps done"));
    assert!(logging::captured_contains("boot", "heap done"));
    assert!(logging::captured_contains("boot", "scheduler done"));
    logging::with_captured(|text, _| {
        let traps = text.find("boot|traps done").expect("traps phase");
        let heap = text.find("boot|heap done").expect("heap phase");
        let sched = text.find("boot|scheduler done").expect("scheduler phase");
        assert!(traps < heap && heap < sched, "phases out of order");
    });

    let dump = StringSink::default();
    logging::print_captured_target(&dump, "boot");
    let dump = dump.0.lock();
    assert!(dump.starts_with("\n--- boot debug ---\n"));
    assert!(dump.contains("heap done\n"));
    assert!(!dump.contains("pic remapped"), "other targets are filtered out");
    drop(dump);

    assert!(heap::is_initialized());
    assert_eq!(scheduler::current_task(), Some(idle));
    assert_eq!(scheduler::task_count(), 1);
    assert_eq!(machine.read_vector(IRQ0_PIT_TIMER_VECTOR), RecordingMachine::stub_for(IRQ0_PIT_TIMER_VECTOR));
    assert_eq!(ChainedPic::new(interrupts::IRQ_BASE).enabled(machine), IrqMask::BOOT_DEFAULT);
    assert!(machine.interrupts_enabled(), "boot leaves interrupts enabled");
    assert_eq!(machine.switch_count(), 0, "boot itself never switches");
}

/// Contract: an oversized pool aborts boot with a heap error.
#[test]
fn test_init_kernel_rejects_oversized_pool() {
    let _guard = testing::GLOBAL_STATE_LOCK.lock();
    let machine = testing::install_recording_machine();

    let mut pool = AlignedPool::<64>::new();
    let config = KernelConfig::new(pool.as_mut_ptr() as usize, 0x2_0000);
    // SAFETY: the heap rejects the pool before writing to it.
    let result = unsafe { boot::init_kernel(machine, &config) };

    let err = result.expect_err("pool larger than a segment");
    assert_eq!(err, BootError::Heap(HeapError::PoolTooLarge { size: 0x2_0000 }));
    assert!(format!("{}", err).starts_with("heap: "));
}

/// Contract: the timer line counts ticks and acknowledges without switching by default.
#[test]
fn test_timer_tick_without_preemption() {
    let _guard = testing::GLOBAL_STATE_LOCK.lock();
    let (machine, idle) = boot_with(KernelConfig::new);
    scheduler::create_task(task_a, DEFAULT_TASK_STACK_SIZE).expect("create task");
    machine.clear_port_log();

    let outcome = interrupts::dispatch(IRQ0_PIT_TIMER_VECTOR, None);

    assert_eq!(outcome, DispatchOutcome::Irq { line: 0, handled: false });
    assert_eq!(interrupts::ticks(), 1);
    assert_eq!(machine.writes_to(0x20), 1, "tick acknowledged");
    assert_eq!(machine.switch_count(), 0);
    assert_eq!(scheduler::current_task(), Some(idle));
}

/// Contract: with preemption on, each tick yields after the EOI.
#[test]
fn test_timer_tick_with_preemption_yields() {
    let _guard = testing::GLOBAL_STATE_LOCK.lock();
    let (machine, idle) = boot_with(|start, size| KernelConfig::new(start, size).with_timer_preemption(true));
    let a = scheduler::create_task(task_a, DEFAULT_TASK_STACK_SIZE).expect("create task");
    machine.clear_port_log();

    interrupts::dispatch(IRQ0_PIT_TIMER_VECTOR, None);
    assert_eq!(machine.writes_to(0x20), 1, "EOI sent before switching away");
    assert_eq!(machine.switch_count(), 1);
    assert_eq!(scheduler::current_task(), Some(a));

    interrupts::dispatch(IRQ0_PIT_TIMER_VECTOR, None);
    assert_eq!(machine.switch_count(), 2);
    assert_eq!(scheduler::current_task(), Some(idle));
    assert_eq!(interrupts::ticks(), 2);

    interrupts::set_timer_preemption(false);
}

static KEYBOARD_HITS: AtomicU32 = AtomicU32::new(0);

fn on_keyboard(_line: u8) {
    KEYBOARD_HITS.fetch_add(1, Ordering::SeqCst);
}

/// Contract: registered handlers run through the global trap entry; others are logged.
#[test]
fn test_global_dispatch_routes_registered_lines() {
    let _guard = testing::GLOBAL_STATE_LOCK.lock();
    let (machine, _idle) = boot_with(|start, size| KernelConfig::new(start, size).with_log_level(LevelFilter::Debug));

    assert!(interrupts::register_irq_handler(1, on_keyboard).is_none());
    let outcome = interrupts::dispatch(IRQ1_KEYBOARD_VECTOR, None);
    assert_eq!(outcome, DispatchOutcome::Irq { line: 1, handled: true });
    assert_eq!(KEYBOARD_HITS.load(Ordering::SeqCst), 1);
    assert!(interrupts::unregister_irq_handler(1).is_some());

    machine.clear_port_log();
    logging::set_capture_enabled(true);
    let outcome = interrupts::dispatch(0x25, None);
    assert_eq!(outcome, DispatchOutcome::Irq { line: 5, handled: false });
    assert!(logging::captured_contains("traps", "Unhandled IRQ 5 (Vector 0x25)"));
    assert_eq!(machine.writes_to(0x20), 1, "unhandled lines are still acknowledged");

    assert_eq!(interrupts::dispatch(0x30, None), DispatchOutcome::Ignored);
    assert!(logging::captured_contains("traps", "spurious vector 0x30"));
}

/// Contract: a trap entered through the stub ABI reaches the dispatcher.
#[test]
fn test_trap_entry_accepts_null_frame() {
    let _guard = testing::GLOBAL_STATE_LOCK.lock();
    let (machine, _idle) = boot_with(KernelConfig::new);
    machine.clear_port_log();

    // SAFETY: a null frame is allowed; vector 0x2C is a secondary line.
    unsafe { interrupts::trap_dispatch(0x2C, core::ptr::null()) };
    machine.with_port_log(|log| {
        let ports: Vec<u16> = log.iter().map(|w| w.port).collect();
        assert_eq!(ports, vec![0xA0, 0x20]);
    });
}
