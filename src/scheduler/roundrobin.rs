//! Cooperative round-robin scheduler.
//!
//! Tasks live in a fixed table of [`MAX_TASKS`] slots. Task stacks are
//! carved from the kernel heap at creation time and returned to it when an
//! exited task is reaped. Control only changes hands in [`yield_now`], either
//! called by a task or by the timer line when preemption is enabled.

use core::fmt;
use core::ptr::{self, NonNull};

use crate::arch::{self, constants::DEFAULT_TASK_FLAGS, ContextSwitch, Cpu, CpuState};
use crate::config::{IDLE_TASK_STACK_SIZE, KERNEL_DATA_SEGMENT, MAX_TASKS};
use crate::memory::heap::{self, Heap};
use crate::panic;
use crate::sync::spinlock::SpinLock;

/// Entry point type for schedulable kernel tasks.
///
/// Tasks are entered by loading a bootstrapped CPU-state record and are
/// expected to never return; a finished task calls [`exit_current`].
pub type TaskEntryFn = extern "C" fn() -> !;

/// Index of a task slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(usize);

impl TaskId {
    pub const fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// Scheduler has not been initialized via [`init`].
    NotInitialized,

    /// Every slot of the task table is in use.
    TableFull,

    /// Heap allocation for the task stack failed.
    StackAllocationFailed,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "scheduler not initialized"),
            Self::TableFull => write!(f, "task table full ({} slots)", MAX_TASKS),
            Self::StackAllocationFailed => write!(f, "task stack allocation failed"),
        }
    }
}

/// Lifecycle state of a task slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Slot is free for [`create_task`].
    Unused,

    /// Task is eligible for scheduling.
    Ready,

    /// Task is the one currently executing on the CPU.
    Running,

    /// Reserved for blocking I/O; nothing enters this state yet and the
    /// round-robin scan skips it.
    Blocked,

    /// Task has exited but its slot and stack are still reserved.
    ///
    /// Never selected again. The slot is reaped at the start of a later
    /// [`yield_now`], once execution is guaranteed to be off its stack.
    Exiting,
}

impl TaskState {
    const fn is_runnable(self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }
}

/// Segment values seeded into bootstrapped task records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSegments {
    pub code: u16,
    pub data: u16,
}

/// One slot in the task table.
#[derive(Clone, Copy)]
struct TaskSlot {
    /// Scheduler lifecycle state used by round-robin selection.
    state: TaskState,

    /// Saved register image; the bootstrap record until the first switch-out.
    context: CpuState,

    /// Base address of this task's heap-allocated stack.
    stack_base: *mut u8,

    /// Size of the heap-allocated stack in bytes.
    stack_size: usize,
}

impl TaskSlot {
    /// Returns an unused slot marker.
    const fn empty() -> Self {
        Self {
            state: TaskState::Unused,
            context: CpuState::zeroed(),
            stack_base: ptr::null_mut(),
            stack_size: 0,
        }
    }
}

/// Save/load pair handed to the context-switch primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchPlan {
    pub from: TaskId,
    pub to: TaskId,
    /// Record the outgoing flow is saved into.
    pub save: *mut CpuState,
    /// Record the incoming flow is loaded from.
    pub load: *const CpuState,
}

/// Task table plus round-robin cursor.
pub struct RoundRobin {
    slots: [TaskSlot; MAX_TASKS],
    /// Slot currently on the CPU; `None` before [`RoundRobin::init`].
    current: Option<usize>,
    /// First slot the next scan looks at.
    next_index: usize,
    segments: KernelSegments,
    idle: Option<usize>,
}

// SAFETY:
// - Raw stack pointers in slots point into heap memory owned by the scheduler.
// - The global instance is only reachable through `SpinLock<RoundRobin>`.
unsafe impl Send for RoundRobin {}

impl RoundRobin {
    pub const fn new() -> Self {
        Self {
            slots: [TaskSlot::empty(); MAX_TASKS],
            current: None,
            next_index: 0,
            segments: KernelSegments {
                code: 0,
                data: KERNEL_DATA_SEGMENT,
            },
            idle: None,
        }
    }

    /// Clears the task table and installs the idle task as the running task.
    ///
    /// No switch happens: the caller's flow of control becomes the idle task
    /// and its state is captured on the first switch-out.
    pub fn init(
        &mut self,
        heap: &mut Heap,
        segments: KernelSegments,
        idle_entry: TaskEntryFn,
    ) -> Result<TaskId, SpawnError> {
        *self = Self::new();
        self.segments = segments;

        let idle = self.spawn(heap, idle_entry, IDLE_TASK_STACK_SIZE)?;
        let index = idle.index();
        self.slots[index].state = TaskState::Running;
        self.current = Some(index);
        self.idle = Some(index);
        self.next_index = (index + 1) % MAX_TASKS;
        Ok(idle)
    }

    pub fn is_initialized(&self) -> bool {
        self.current.is_some()
    }

    /// Creates a ready task entered at `entry` on a fresh `stack_size` byte stack.
    ///
    /// Fails without touching the table or the heap when no slot is free,
    /// and without touching the table when the stack cannot be allocated.
    pub fn create_task(
        &mut self,
        heap: &mut Heap,
        entry: TaskEntryFn,
        stack_size: usize,
    ) -> Result<TaskId, SpawnError> {
        if !self.is_initialized() {
            return Err(SpawnError::NotInitialized);
        }
        self.spawn(heap, entry, stack_size)
    }

    fn spawn(&mut self, heap: &mut Heap, entry: TaskEntryFn, stack_size: usize) -> Result<TaskId, SpawnError> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.state == TaskState::Unused)
            .ok_or(SpawnError::TableFull)?;

        let stack = heap
            .allocate_stack(stack_size)
            .ok_or(SpawnError::StackAllocationFailed)?;

        self.slots[index] = TaskSlot {
            state: TaskState::Ready,
            context: bootstrap_context(entry, stack, stack_size, self.segments),
            stack_base: stack.as_ptr(),
            stack_size,
        };
        Ok(TaskId(index))
    }

    /// Picks the next task and updates states for a switch to it.
    ///
    /// The scan starts at the slot after the last selection and wraps. The
    /// caller is skipped; if the scan comes back to its start without
    /// another runnable task, nothing changes and `None` is returned.
    pub fn pick_next(&mut self) -> Option<SwitchPlan> {
        let old = self.current?;
        let start = self.next_index;

        loop {
            let candidate = self.next_index;
            self.next_index = (self.next_index + 1) % MAX_TASKS;

            if candidate != old && self.slots[candidate].state.is_runnable() {
                if self.slots[old].state == TaskState::Running {
                    self.slots[old].state = TaskState::Ready;
                }
                self.slots[candidate].state = TaskState::Running;
                self.current = Some(candidate);

                return Some(SwitchPlan {
                    from: TaskId(old),
                    to: TaskId(candidate),
                    save: ptr::addr_of_mut!(self.slots[old].context),
                    load: ptr::addr_of!(self.slots[candidate].context),
                });
            }

            if self.next_index == start {
                return None;
            }
        }
    }

    /// Marks the running task as exiting. The idle task cannot exit.
    pub fn exit_current(&mut self) -> Option<TaskId> {
        let current = self.current?;
        if Some(current) == self.idle {
            return None;
        }
        self.slots[current].state = TaskState::Exiting;
        Some(TaskId(current))
    }

    /// Returns stacks of exited tasks to `heap` and frees their slots.
    ///
    /// The current slot is left alone: its stack may still be in use.
    pub fn reap_exited(&mut self, heap: &mut Heap) -> usize {
        let mut reaped = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.state != TaskState::Exiting || Some(index) == self.current {
                continue;
            }
            if let Err(err) = heap.free(slot.stack_base) {
                log::warn!(target: "sched", "task#{} stack not returned: {}", index, err);
            }
            *slot = TaskSlot::empty();
            reaped += 1;
        }
        reaped
    }

    pub fn current(&self) -> Option<TaskId> {
        self.current.map(TaskId)
    }

    pub fn idle(&self) -> Option<TaskId> {
        self.idle.map(TaskId)
    }

    /// Lifecycle state of slot `id`.
    pub fn state(&self, id: TaskId) -> TaskState {
        self.slots
            .get(id.index())
            .map_or(TaskState::Unused, |slot| slot.state)
    }

    /// Saved register image of slot `id`, `None` for unused slots.
    pub fn context(&self, id: TaskId) -> Option<CpuState> {
        let slot = self.slots.get(id.index())?;
        (slot.state != TaskState::Unused).then_some(slot.context)
    }

    /// Stack base and size of slot `id`, `None` for unused slots.
    pub fn stack(&self, id: TaskId) -> Option<(*mut u8, usize)> {
        let slot = self.slots.get(id.index())?;
        (slot.state != TaskState::Unused).then_some((slot.stack_base, slot.stack_size))
    }

    /// Number of slots that are not unused.
    pub fn task_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state != TaskState::Unused)
            .count()
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the record a first switch into a new task loads.
///
/// It has the same shape a real switch-out produces: resume at `entry`,
/// stack pointer at the top of the (downward-growing) stack, every data
/// segment on the kernel segment and interrupts enabled.
fn bootstrap_context(
    entry: TaskEntryFn,
    stack: NonNull<u8>,
    stack_size: usize,
    segments: KernelSegments,
) -> CpuState {
    let stack_top = (stack.as_ptr() as usize).wrapping_add(stack_size);
    CpuState {
        ip: entry as usize as u16,
        cs: segments.code,
        sp: stack_top as u16,
        ss: segments.data,
        ds: segments.data,
        es: segments.data,
        flags: DEFAULT_TASK_FLAGS.bits(),
        ..CpuState::zeroed()
    }
}

static SCHED: SpinLock<RoundRobin> = SpinLock::new(RoundRobin::new());

/// Executes `f` while holding the scheduler spinlock.
fn with_sched<R>(f: impl FnOnce(&mut RoundRobin) -> R) -> R {
    let mut sched = SCHED.lock();
    f(&mut sched)
}

/// Body of the always-present idle task.
extern "C" fn idle_task() -> ! {
    loop {
        yield_now();
    }
}

fn kernel_segments() -> KernelSegments {
    match arch::platform() {
        Some(cpu) => KernelSegments {
            code: cpu.kernel_code_segment(),
            data: cpu.kernel_data_segment(),
        },
        None => KernelSegments {
            code: 0,
            data: KERNEL_DATA_SEGMENT,
        },
    }
}

/// Resets the scheduler and makes the calling flow the running idle task.
///
/// Halts the kernel if the idle stack cannot be allocated.
pub fn init() -> TaskId {
    let segments = kernel_segments();
    let result = with_sched(|sched| heap::with_heap(|heap| sched.init(heap, segments, idle_task)));

    match result {
        Ok(idle) => {
            log::info!(
                target: "sched",
                "initialized, idle {} cs={:#06x} ds={:#06x}",
                idle,
                segments.code,
                segments.data
            );
            idle
        }
        Err(err) => panic::halt(format_args!("failed to create idle task: {}", err)),
    }
}

/// Creates a new ready task. Failures leave the scheduler unchanged.
pub fn create_task(entry: TaskEntryFn, stack_size: usize) -> Result<TaskId, SpawnError> {
    let result = with_sched(|sched| heap::with_heap(|heap| sched.create_task(heap, entry, stack_size)));
    match result {
        Ok(id) => log::debug!(target: "sched", "created {} stack={}", id, stack_size),
        Err(err) => log::warn!(target: "sched", "create_task failed: {}", err),
    }
    result
}

/// Hands the CPU to the next runnable task in round-robin order.
///
/// Returns when this task is scheduled again, or immediately when no other
/// task is runnable. After a kernel halt it never switches.
pub fn yield_now() {
    if panic::is_halted() {
        return;
    }
    let Some(platform) = arch::platform() else {
        return;
    };

    let interrupts_were_enabled = platform.interrupts_enabled();
    platform.disable_interrupts();

    let plan = with_sched(|sched| {
        heap::with_heap(|heap| sched.reap_exited(heap));
        sched.pick_next()
    });

    if let Some(plan) = plan {
        log::trace!(target: "sched", "switch {} -> {}", plan.from, plan.to);
        // SAFETY:
        // - Both records live in the static task table and are not moved.
        // - `load` is either a bootstrap record or one saved by a switch-out.
        // - Interrupts stay masked until the switch has loaded the new flags.
        unsafe {
            platform.switch(plan.save, plan.load);
        }
    }

    if interrupts_were_enabled {
        platform.enable_interrupts();
    }
}

/// Terminates the calling task. Its stack is reclaimed by a later yield.
pub fn exit_current() -> ! {
    match with_sched(|sched| sched.exit_current()) {
        Some(id) => log::debug!(target: "sched", "{} exiting", id),
        None => log::warn!(target: "sched", "exit_current outside an exitable task"),
    }
    loop {
        yield_now();
    }
}

/// Task currently on the CPU.
pub fn current_task() -> Option<TaskId> {
    with_sched(|sched| sched.current())
}

/// Lifecycle state of `id`.
pub fn task_state(id: TaskId) -> TaskState {
    with_sched(|sched| sched.state(id))
}

/// Saved register image of `id`.
pub fn task_context(id: TaskId) -> Option<CpuState> {
    with_sched(|sched| sched.context(id))
}

/// Number of live task slots, idle task included.
pub fn task_count() -> usize {
    with_sched(|sched| sched.task_count())
}
