//! Exception Halt Integration Test
//!
//! Runs in its own process: once the kernel has halted it stays halted.

use std::panic::{self, AssertUnwindSafe};

use lidos_kernel::arch::interrupts::{self, TrapFrame, EXCEPTION_INVALID_OPCODE};
use lidos_kernel::arch::Cpu;
use lidos_kernel::boot;
use lidos_kernel::config::KernelConfig;
use lidos_kernel::logging;
use lidos_kernel::scheduler;
use lidos_kernel::testing::{self, AlignedPool, DiscardSink};
use log::LevelFilter;

static SINK: DiscardSink = DiscardSink;

extern "C" fn task_a() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

/// Contract: a CPU exception reports, masks interrupts and halts for good.
#[test]
fn test_exception_halts_and_stops_scheduling() {
    let _guard = testing::GLOBAL_STATE_LOCK.lock();
    let machine = testing::install_recording_machine();
    let _ = logging::init(&SINK, LevelFilter::Info);

    let pool: &'static mut AlignedPool<4096> = Box::leak(Box::new(AlignedPool::new()));
    let config = KernelConfig::new(pool.as_mut_ptr() as usize, pool.len());
    // SAFETY: the leaked pool is unused and lives for the rest of the process.
    let idle = unsafe { boot::init_kernel(machine, &config) }.expect("kernel init");
    scheduler::create_task(task_a, 256).expect("create task");

    logging::set_capture_enabled(true);
    machine.clear_port_log();
    let frame = TrapFrame {
        ip: 0x0010,
        cs: 0x0060,
        flags: 0x0202,
        ..TrapFrame::default()
    };

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        interrupts::dispatch(EXCEPTION_INVALID_OPCODE, Some(&frame));
    }));

    let payload = result.expect_err("an exception must not return");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"cpu halted"));
    assert_eq!(machine.halt_count(), 1);
    assert!(lidos_kernel::panic::is_halted());
    assert!(!machine.interrupts_enabled(), "halt masks interrupts");
    machine.with_port_log(|log| assert!(log.is_empty(), "exceptions are not acknowledged"));

    assert!(logging::captured_contains(
        "halt",
        "KERNEL PANIC: Invalid Opcode Exception! at 0060:0010 flags=0x0202"
    ));
    assert!(logging::captured_contains("halt", "System halted."));

    scheduler::yield_now();
    assert_eq!(machine.switch_count(), 0, "no task runs after a halt");
    assert_eq!(scheduler::current_task(), Some(idle));
}
