//! # Kernel
//!
//! Top-level kernel lifecycle and public task API. Owns the global
//! scheduler context and wires the port layer's interrupt entry points
//! (SysTick, PendSV) to it.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► kernel::init()        ← Build the scheduler context
//!         ├─► kernel::create_task() ← Register tasks (×N)
//!         └─► kernel::start()       ← Launch (no return)
//!               ├─► Create the idle task (fatal if impossible)
//!               ├─► Mark the scheduler running
//!               └─► arch::start_first_task()
//! ```
//!
//! ## Interrupt flow
//!
//! ```text
//! SysTick ──► tick_isr() ──► Scheduler::increment_tick()
//!                 │                 (reschedule needed?)
//!                 └──────────► arch::request_context_switch_from_isr()
//! PendSV ───► save_current_stack() / switch_context() / first_task_stack()
//! ```

use core::ffi::c_void;
use core::ptr;

use crate::arch;
use crate::config::{LOWEST_PRIORITY, MIN_STACK_WORDS, TICK_FOREVER};
use crate::scheduler::{Scheduler, SchedulerState};
use crate::sync::IntGuard;
use crate::task::{TaskHandle, TaskState};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Kernel operation failures. Fallible operations return these; fatal
/// conditions (stack overflow, no idle task) never surface here — they
/// halt through the port layer instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A bounded wait expired, or a zero-wait operation found the
    /// resource exhausted — indistinguishable at this boundary.
    Timeout,
    /// The allocator boundary returned nothing.
    OutOfMemory,
    /// A mutex unlock by a task that does not hold it.
    NotOwner,
}

// ---------------------------------------------------------------------------
// Global scheduler instance
// ---------------------------------------------------------------------------

/// The kernel context.
///
/// # Safety
/// Accessed via `SCHEDULER_PTR`, which is set during `init()`. All access
/// is through critical sections or from ISR context (where exception
/// priorities serialize it).
static mut SCHEDULER: Scheduler = Scheduler::new();

/// Raw pointer to the context for the port layer's handlers, which cannot
/// hold references across the asm boundary.
///
/// # Safety
/// Set once during `init()`, read thereafter.
static mut SCHEDULER_PTR: *mut Scheduler = ptr::null_mut();

/// The global context, for crate-internal wrappers.
///
/// Callers must have run [`init`] first.
#[inline]
pub(crate) fn sched_ptr() -> *mut Scheduler {
    unsafe { SCHEDULER_PTR }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Initialize the kernel. Must be called exactly once, before any other
/// kernel function, from the main thread.
pub fn init() {
    unsafe {
        SCHEDULER_PTR = &raw mut SCHEDULER;
        (*SCHEDULER_PTR).init();
    }
}

/// Start the scheduler. **Does not return.**
///
/// Creates the idle task at the lowest priority — with no runnable task
/// the kernel has nothing to execute, so failure here is fatal — then
/// hands control to the port layer, which starts the tick source and
/// launches the highest-priority created task.
pub fn start() -> ! {
    unsafe {
        let sched = sched_ptr();

        if (*sched)
            .create_task(
                idle_task,
                ptr::null_mut(),
                MIN_STACK_WORDS,
                LOWEST_PRIORITY,
                "idle",
            )
            .is_err()
        {
            arch::fatal_halt();
        }

        {
            let _guard = IntGuard::new();
            (*sched).next_unblock = TICK_FOREVER;
            (*sched).tick_count = 0;
            (*sched).running = true;
        }

        arch::start_first_task()
    }
}

/// The idle task: runs when nothing else is ready. Yields whenever
/// another lowest-priority task is ready, and frees the stacks of
/// self-deleted tasks.
extern "C" fn idle_task(_arg: *mut c_void) {
    loop {
        let others_ready = {
            let _guard = IntGuard::new();
            unsafe { (*sched_ptr()).ready[LOWEST_PRIORITY].len() > 1 }
        };
        if others_ready {
            arch::request_context_switch();
        }

        #[cfg(feature = "delete")]
        unsafe {
            if (*sched_ptr()).recycled > 0 {
                (*sched_ptr()).recycle_drain();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Task API
// ---------------------------------------------------------------------------

/// Create a task.
///
/// # Parameters
/// - `entry`: task entry function; must never return.
/// - `arg`: pointer handed to `entry`.
/// - `stack_words`: stack depth in words (floored at `MIN_STACK_WORDS`).
/// - `priority`: 0 (lowest) to `MAX_PRIORITIES - 1` (clamped).
/// - `name`: debug name, truncated to `NAME_LEN`.
///
/// # Example
/// ```ignore
/// kernel::init();
/// kernel::create_task(blink, core::ptr::null_mut(), 128, 3, "blink")?;
/// kernel::start();
/// ```
pub fn create_task(
    entry: arch::TaskEntry,
    arg: *mut c_void,
    stack_words: usize,
    priority: usize,
    name: &str,
) -> Result<TaskHandle, Error> {
    unsafe { (*sched_ptr()).create_task(entry, arg, stack_words, priority, name) }
}

/// Delete a task (`None` = the calling task). Self-deletion defers the
/// memory release to the idle task.
#[cfg(feature = "delete")]
pub fn delete_task(handle: Option<TaskHandle>) {
    unsafe { (*sched_ptr()).delete_task(handle) }
}

/// Put the calling task to sleep for `ticks`.
pub fn sleep(ticks: u32) {
    unsafe { (*sched_ptr()).task_sleep(ticks) }
}

/// Voluntarily give up the processor; same-priority ready tasks run next.
pub fn yield_task() {
    arch::request_context_switch();
}

/// Suspend a task (`None` = the calling task) until resumed.
pub fn suspend_task(handle: Option<TaskHandle>) {
    unsafe { (*sched_ptr()).suspend_task(handle) }
}

/// Resume a suspended task.
pub fn resume_task(handle: TaskHandle) {
    unsafe { (*sched_ptr()).resume_task(handle) }
}

/// Resume a suspended task from interrupt context.
pub fn resume_task_from_isr(handle: TaskHandle) {
    let need_switch = unsafe { (*sched_ptr()).resume_task_from_isr(handle) };
    arch::request_context_switch_from_isr(need_switch);
}

/// A task's current priority (`None` = the calling task).
pub fn task_priority(handle: Option<TaskHandle>) -> usize {
    unsafe { (*sched_ptr()).task_priority(handle) }
}

/// Change a task's priority (`None` = the calling task).
pub fn set_task_priority(handle: Option<TaskHandle>, priority: usize) {
    unsafe { (*sched_ptr()).set_task_priority(handle, priority) }
}

/// A task's lifecycle state.
pub fn task_state(handle: TaskHandle) -> TaskState {
    unsafe { (*sched_ptr()).task_state(handle) }
}

/// The calling task's handle.
pub fn current_task() -> Option<TaskHandle> {
    unsafe { (*sched_ptr()).current_task() }
}

/// Ticks elapsed since `start` (wrapping).
pub fn tick_count() -> u32 {
    unsafe { (*sched_ptr()).tick_count() }
}

/// Scheduler lifecycle state.
pub fn scheduler_state() -> SchedulerState {
    unsafe { (*sched_ptr()).state() }
}

/// Defer context switches; nests.
pub fn lock_scheduler() {
    unsafe { (*sched_ptr()).lock() }
}

/// Undo one [`lock_scheduler`]; the outermost unlock performs any
/// deferred wakeups and pended ticks.
pub fn unlock_scheduler() -> bool {
    unsafe { (*sched_ptr()).unlock() }
}

// ---------------------------------------------------------------------------
// Signal API (thin wrappers over the per-task signal slot)
// ---------------------------------------------------------------------------

/// Wait for a counting signal; consumes one count on success.
pub fn signal_wait(ticks: u32) -> bool {
    unsafe { (*sched_ptr()).signal_wait(ticks) }
}

/// Emit a counting signal to a task.
pub fn signal_emit(handle: TaskHandle) -> bool {
    unsafe { (*sched_ptr()).signal_emit(handle) }
}

/// Emit a counting signal from interrupt context.
pub fn signal_emit_from_isr(handle: TaskHandle) -> bool {
    unsafe { (*sched_ptr()).signal_emit_from_isr(handle) }
}

/// Wait for a value-carrying signal.
pub fn signal_wait_value(out: &mut u32, ticks: u32) -> bool {
    unsafe { (*sched_ptr()).signal_wait_value(out, ticks) }
}

/// Send a value-carrying signal to a task.
pub fn signal_emit_value(handle: TaskHandle, value: u32, overwrite: bool) -> bool {
    unsafe { (*sched_ptr()).signal_emit_value(handle, value, overwrite) }
}

/// Send a value-carrying signal from interrupt context.
pub fn signal_emit_value_from_isr(handle: TaskHandle, value: u32, overwrite: bool) -> bool {
    unsafe { (*sched_ptr()).signal_emit_value_from_isr(handle, value, overwrite) }
}

/// Clear a task's pending signal (`None` = the calling task).
pub fn signal_clear(handle: Option<TaskHandle>) -> bool {
    unsafe { (*sched_ptr()).signal_clear(handle) }
}

// ---------------------------------------------------------------------------
// Port-layer entry points
// ---------------------------------------------------------------------------

/// Timer-interrupt entry point: advance the tick and, when that made a
/// higher-or-equal-priority task ready, request a context switch. The
/// port's SysTick handler calls this.
pub fn tick_isr() {
    let need_switch = {
        let _guard = IntGuard::new();
        unsafe { (*sched_ptr()).increment_tick() }
    };
    arch::request_context_switch_from_isr(need_switch);
}

/// Context-switch decision point. The port's PendSV handler calls this
/// between saving the outgoing and loading the incoming context.
pub fn switch_context() {
    unsafe { (*sched_ptr()).switch_context() }
}

/// Record the outgoing task's saved stack pointer (PendSV save phase).
///
/// # Safety
/// Only a port's context-switch handler may call this, between saving
/// the outgoing register frame and selecting the next task.
pub unsafe fn save_current_stack(psp: *mut usize) {
    let sched = sched_ptr();
    if !(*sched).current.is_null() {
        (*(*sched).current).top_of_stack = psp;
    }
}

/// The running task's saved stack pointer (PendSV restore phase and
/// first-task launch).
pub fn first_task_stack() -> *mut usize {
    unsafe { (*(*sched_ptr()).current).top_of_stack }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
