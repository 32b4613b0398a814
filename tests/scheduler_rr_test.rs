//! Round-Robin Scheduler Integration Tests
//!
//! These tests drive the task table directly for selection order and
//! failure cases, and the global scheduler against the recording machine
//! for the switch path.

use lidos_kernel::arch::constants::{Flags, DEFAULT_TASK_FLAGS};
use lidos_kernel::arch::Cpu;
use lidos_kernel::config::{IDLE_TASK_STACK_SIZE, KERNEL_DATA_SEGMENT, MAX_TASKS};
use lidos_kernel::memory::heap::{self, Heap};
use lidos_kernel::scheduler::{self, KernelSegments, RoundRobin, SpawnError, TaskId, TaskState};
use lidos_kernel::testing::{self, AlignedPool, TEST_CODE_SEGMENT};

const SEGMENTS: KernelSegments = KernelSegments {
    code: TEST_CODE_SEGMENT,
    data: KERNEL_DATA_SEGMENT,
};

extern "C" fn idle_entry() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

extern "C" fn task_a() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

extern "C" fn task_b() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

extern "C" fn task_c() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

fn scheduler_over<const N: usize>(pool: &mut AlignedPool<N>) -> (RoundRobin, Heap, TaskId) {
    let mut heap = Heap::empty();
    // SAFETY: every test keeps `pool` alive longer than the heap.
    unsafe { heap.init(pool.as_mut_ptr(), pool.len()) }.expect("heap init");
    let mut sched = RoundRobin::new();
    let idle = sched.init(&mut heap, SEGMENTS, idle_entry).expect("idle task");
    (sched, heap, idle)
}

#[test]
fn test_init_makes_idle_the_running_task() {
    let mut pool = AlignedPool::<4096>::new();
    let (sched, _heap, idle) = scheduler_over(&mut pool);

    assert!(sched.is_initialized());
    assert_eq!(sched.current(), Some(idle));
    assert_eq!(sched.idle(), Some(idle));
    assert_eq!(sched.state(idle), TaskState::Running);
    assert_eq!(sched.task_count(), 1, "only the idle task should exist");

    let (_, size) = sched.stack(idle).expect("idle stack");
    assert_eq!(size, IDLE_TASK_STACK_SIZE);
}

#[test]
fn test_bootstrap_record_enters_task_on_fresh_stack() {
    let mut pool = AlignedPool::<4096>::new();
    let (mut sched, mut heap, _idle) = scheduler_over(&mut pool);

    let id = sched.create_task(&mut heap, task_a, 512).expect("create task");
    assert_eq!(sched.state(id), TaskState::Ready);

    let (base, size) = sched.stack(id).expect("task stack");
    let ctx = sched.context(id).expect("bootstrap record");

    assert_eq!(size, 512);
    assert_eq!(ctx.ip, task_a as usize as u16, "ip should be the entry point");
    assert_eq!(ctx.cs, TEST_CODE_SEGMENT);
    assert_eq!(ctx.sp, (base as usize + 512) as u16, "sp should be the stack top");
    assert_eq!(ctx.ss, KERNEL_DATA_SEGMENT);
    assert_eq!(ctx.ds, KERNEL_DATA_SEGMENT);
    assert_eq!(ctx.es, KERNEL_DATA_SEGMENT);
    assert_eq!(ctx.flags, 0x0202, "IF plus the always-one bit");
    assert_eq!(ctx.flags, DEFAULT_TASK_FLAGS.bits());
    assert!(Flags::from_bits_retain(ctx.flags).contains(Flags::INTERRUPT));
    assert_eq!((ctx.ax, ctx.bx, ctx.cx, ctx.dx), (0, 0, 0, 0));
}

#[test]
fn test_round_robin_visits_every_task_once_per_round() {
    let mut pool = AlignedPool::<4096>::new();
    let (mut sched, mut heap, idle) = scheduler_over(&mut pool);

    let a = sched.create_task(&mut heap, task_a, 256).expect("a");
    let b = sched.create_task(&mut heap, task_b, 256).expect("b");
    let c = sched.create_task(&mut heap, task_c, 256).expect("c");

    let expected = [a, b, c, idle, a, b, c, idle];
    let mut previous = idle;
    for (step, &want) in expected.iter().enumerate() {
        let plan = sched.pick_next().expect("another task is runnable");
        assert_eq!(plan.from, previous, "step {}: wrong outgoing task", step);
        assert_eq!(plan.to, want, "step {}: wrong incoming task", step);
        assert_eq!(sched.current(), Some(want));
        assert_eq!(sched.state(want), TaskState::Running);
        assert_eq!(sched.state(previous), TaskState::Ready);
        previous = want;
    }
}

#[test]
fn test_switch_plan_points_at_task_records() {
    let mut pool = AlignedPool::<4096>::new();
    let (mut sched, mut heap, _idle) = scheduler_over(&mut pool);
    let a = sched.create_task(&mut heap, task_a, 256).expect("a");

    let plan = sched.pick_next().expect("switch to a");
    assert_ne!(plan.save as usize, plan.load as usize);
    // SAFETY: `load` points into the task table, which is not moved here.
    let loaded = unsafe { *plan.load };
    assert_eq!(Some(loaded), sched.context(a));
}

#[test]
fn test_single_runnable_task_does_not_switch() {
    let mut pool = AlignedPool::<4096>::new();
    let (mut sched, _heap, idle) = scheduler_over(&mut pool);

    assert!(sched.pick_next().is_none(), "idle alone has nowhere to go");
    assert_eq!(sched.current(), Some(idle));
    assert_eq!(sched.state(idle), TaskState::Running);
}

#[test]
fn test_create_task_before_init_fails() {
    let mut pool = AlignedPool::<1024>::new();
    let mut heap = Heap::empty();
    // SAFETY: `pool` outlives the heap.
    unsafe { heap.init(pool.as_mut_ptr(), pool.len()) }.expect("heap init");
    let mut sched = RoundRobin::new();
    let before = heap.stats();

    assert_eq!(
        sched.create_task(&mut heap, task_a, 128),
        Err(SpawnError::NotInitialized)
    );
    assert!(sched.pick_next().is_none());
    assert_eq!(heap.stats(), before, "no stack may be allocated");
}

#[test]
fn test_full_table_rejects_without_side_effects() {
    let mut pool = AlignedPool::<8192>::new();
    let (mut sched, mut heap, _idle) = scheduler_over(&mut pool);

    for _ in 1..MAX_TASKS {
        sched.create_task(&mut heap, task_a, 64).expect("slot available");
    }
    assert_eq!(sched.task_count(), MAX_TASKS);

    let before = heap.stats();
    assert_eq!(
        sched.create_task(&mut heap, task_b, 64),
        Err(SpawnError::TableFull)
    );
    assert_eq!(sched.task_count(), MAX_TASKS);
    assert_eq!(heap.stats(), before, "no stack may leak on a full table");
}

#[test]
fn test_stack_allocation_failure_leaves_table_unchanged() {
    let mut pool = AlignedPool::<4096>::new();
    let (mut sched, mut heap, idle) = scheduler_over(&mut pool);

    assert_eq!(
        sched.create_task(&mut heap, task_a, 16 * 1024),
        Err(SpawnError::StackAllocationFailed)
    );
    assert_eq!(sched.task_count(), 1);
    assert!(sched.pick_next().is_none(), "no half-created task is runnable");
    assert_eq!(sched.current(), Some(idle));
}

#[test]
fn test_exited_task_is_reaped_after_switching_away() {
    let mut pool = AlignedPool::<4096>::new();
    let (mut sched, mut heap, idle) = scheduler_over(&mut pool);
    let free_before = heap.stats().free_bytes;

    let a = sched.create_task(&mut heap, task_a, 256).expect("a");
    sched.pick_next().expect("switch to a");

    assert_eq!(sched.exit_current(), Some(a));
    assert_eq!(sched.state(a), TaskState::Exiting);
    assert_eq!(sched.reap_exited(&mut heap), 0, "running stack must not be freed");

    let plan = sched.pick_next().expect("leave the exiting task");
    assert_eq!((plan.from, plan.to), (a, idle));
    assert_eq!(sched.state(a), TaskState::Exiting, "exiting task is never made ready");

    assert_eq!(sched.reap_exited(&mut heap), 1);
    assert_eq!(sched.state(a), TaskState::Unused);
    assert_eq!(sched.context(a), None);
    assert_eq!(heap.stats().free_bytes, free_before, "stack returned to the heap");
    assert!(sched.pick_next().is_none(), "exited task is never selected");
}

#[test]
fn test_idle_task_cannot_exit() {
    let mut pool = AlignedPool::<4096>::new();
    let (mut sched, _heap, idle) = scheduler_over(&mut pool);

    assert_eq!(sched.exit_current(), None);
    assert_eq!(sched.state(idle), TaskState::Running);
}

#[test]
fn test_task_ids_name_their_slot() {
    let mut pool = AlignedPool::<4096>::new();
    let (mut sched, mut heap, idle) = scheduler_over(&mut pool);
    let a = sched.create_task(&mut heap, task_a, 128).expect("a");

    assert_eq!(idle.index(), 0, "idle takes the first slot");
    assert_eq!(a.index(), 1);
    assert_eq!(format!("{}", a), "task#1");
}

#[test]
fn test_global_yield_switches_through_platform() {
    let _guard = testing::GLOBAL_STATE_LOCK.lock();
    let machine = testing::install_recording_machine();

    let pool: &'static mut AlignedPool<8192> = Box::leak(Box::new(AlignedPool::new()));
    // SAFETY: the leaked pool belongs to the kernel heap from here on.
    unsafe { heap::init(pool.as_mut_ptr(), pool.len()) }.expect("global heap init");

    let idle = scheduler::init();
    assert_eq!(scheduler::current_task(), Some(idle));
    let a = scheduler::create_task(task_a, 256).expect("create a");
    assert_eq!(scheduler::task_count(), 2);

    machine.set_interrupts_enabled(true);
    scheduler::yield_now();

    assert_eq!(machine.switch_count(), 1);
    let event = machine.last_switch().expect("switch recorded");
    assert_eq!(event.loaded.ip, task_a as usize as u16);
    assert_eq!(event.loaded.cs, TEST_CODE_SEGMENT);
    assert_eq!(scheduler::current_task(), Some(a));
    assert_eq!(scheduler::task_state(idle), TaskState::Ready);
    assert!(machine.interrupts_enabled(), "yield restores IF");

    machine.set_interrupts_enabled(false);
    scheduler::yield_now();
    assert_eq!(machine.switch_count(), 2);
    assert_eq!(scheduler::current_task(), Some(idle));
    assert!(!machine.interrupts_enabled(), "yield must not enable IF on its own");
}

#[test]
fn test_global_yield_with_only_idle_does_not_switch() {
    let _guard = testing::GLOBAL_STATE_LOCK.lock();
    let machine = testing::install_recording_machine();

    let pool: &'static mut AlignedPool<4096> = Box::leak(Box::new(AlignedPool::new()));
    // SAFETY: the leaked pool belongs to the kernel heap from here on.
    unsafe { heap::init(pool.as_mut_ptr(), pool.len()) }.expect("global heap init");
    let idle = scheduler::init();

    scheduler::yield_now();
    scheduler::yield_now();
    assert_eq!(machine.switch_count(), 0);
    assert_eq!(scheduler::current_task(), Some(idle));
    assert_eq!(scheduler::task_context(idle).map(|ctx| ctx.ss), Some(KERNEL_DATA_SEGMENT));
}
