//! # Task Control Block & Task Lifecycle
//!
//! Defines the task model and every operation that moves a task through
//! the scheduler's state machine.
//!
//! ```text
//!              create()                switch_context()
//!   (alloc) ──────────────► ┌───────┐ ◄───────────────► ┌─────────┐
//!                           │ Ready │                   │ Running │
//!                           └───────┘                   └─────────┘
//!                             ▲   ▲                       │  │  │
//!             tick / wake     │   │   resume()            │  │  │ delete(self)
//!                             │   └──────────┐   sleep()/ │  │  └────────────┐
//!                             │              │   block    │  │               ▼
//!                           ┌─┴───────┐   ┌──┴────────┐◄──┘  │        ┌─────────────┐
//!                           │ Blocked │   │ Suspended │◄─────┘        │PendingRecycle│
//!                           └─────────┘   └───────────┘  suspend()    └─────────────┘
//!                                                                      freed by idle
//! ```
//!
//! A task lives on exactly one *state* list at a time through its task
//! item (a ready list, a delay list, the suspended list, or the recycle
//! list) and on at most one *wait* list through its event item. The event
//! item's sort key is `MAX_PRIORITIES - priority`, so the head of any wait
//! list is always the highest-priority waiter.

use core::ffi::c_void;
use core::mem;
use core::ptr;

use crate::arch;
use crate::config::{MAX_PRIORITIES, MIN_STACK_WORDS, NAME_LEN, TICK_FOREVER};
use crate::kernel::Error;
use crate::list::{self, List, ListItem};
use crate::mem as kmem;
use crate::scheduler::{Scheduler, SchedulerState};
use crate::sync::IntGuard;
use crate::trace;

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Execution state of a task, derived from its list membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Currently executing. Exactly one task per core.
    Running,
    /// Eligible to run, waiting in its priority's ready list.
    Ready,
    /// On a delay list or a wait list, with a finite or forever timeout.
    Blocked,
    /// Explicitly suspended; not schedulable, no timeout.
    Suspended,
    /// Self-deleted; stack not yet freed by the idle task.
    PendingRecycle,
}

/// Per-task signal slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    NotWaiting,
    Waiting,
    Received,
}

/// Counting signals saturate at this value; further emits are refused.
const SIGNAL_COUNT_MAX: u32 = 0xF;

// ---------------------------------------------------------------------------
// Task control block
// ---------------------------------------------------------------------------

/// Task Control Block. One is allocated per task, together with the
/// task's stack, and freed on deletion (deferred to the idle task when a
/// task deletes itself — a task cannot free the stack it is executing on).
///
/// `top_of_stack` must stay the first member: the context-switch code in
/// the port layer stores and loads the saved stack pointer through the
/// TCB at offset 0.
#[repr(C)]
pub struct Tcb {
    /// Saved stack pointer, updated on every context switch.
    pub(crate) top_of_stack: *mut usize,

    /// Membership in a state list (ready / delay / suspended / recycle).
    /// Key: wake tick while delayed, ignored elsewhere.
    pub(crate) task_item: ListItem,

    /// Membership in a wait list or the pending-ready pool.
    /// Key: `MAX_PRIORITIES - priority`.
    pub(crate) event_item: ListItem,

    /// Current priority, including any inherited boost. 0 is lowest.
    pub(crate) priority: usize,

    /// Priority assigned by the application, before inheritance.
    pub(crate) base_priority: usize,

    /// Number of mutexes currently held; inheritance only unwinds fully
    /// at zero.
    pub(crate) mutexes_held: usize,

    /// Start of the allocated stack (lowest address; stacks grow down).
    pub(crate) stack_base: *mut usize,
    pub(crate) stack_words: usize,

    /// Task name, truncated to [`NAME_LEN`].
    pub(crate) name: [u8; NAME_LEN],

    pub(crate) sig_state: SignalState,
    pub(crate) sig_value: u32,
}

// Safety: TCBs hold raw pointers into their own allocations and are only
// touched inside critical sections or ISR-serialized paths.
unsafe impl Send for Tcb {}
unsafe impl Sync for Tcb {}

impl Tcb {
    /// Task name as registered at creation, truncated to [`NAME_LEN`].
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    fn init(&mut self, name: &str, priority: usize, stack_base: *mut usize, stack_words: usize) {
        let priority = priority.min(MAX_PRIORITIES - 1);

        self.name = [0; NAME_LEN];
        for (slot, byte) in self.name.iter_mut().zip(name.bytes()) {
            *slot = byte;
        }
        self.name[NAME_LEN - 1] = 0;

        self.priority = priority;
        self.base_priority = priority;
        self.mutexes_held = 0;
        self.stack_base = stack_base;
        self.stack_words = stack_words;
        self.sig_state = SignalState::NotWaiting;
        self.sig_value = 0;

        self.task_item.init();
        self.event_item.init();
        let me = self as *mut Tcb as *mut c_void;
        self.task_item.set_owner(me);
        // Wait lists are kept in priority order: lower key = higher
        // priority = closer to the head.
        self.event_item
            .set_value((MAX_PRIORITIES - priority) as u32);
        self.event_item.set_owner(me);
    }
}

/// Opaque task reference returned by `create_task`. Copyable; identity is
/// the underlying control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle(pub(crate) *mut Tcb);

// Safety: handles are plain references into kernel-owned memory; all
// dereferences happen inside the kernel's critical sections.
unsafe impl Send for TaskHandle {}

// ---------------------------------------------------------------------------
// Lifecycle operations
// ---------------------------------------------------------------------------

impl Scheduler {
    /// Pick the next task to run: round-robin within the highest ready
    /// priority.
    pub(crate) fn select_next(&mut self) {
        let top = self.top_ready_priority();
        self.current = unsafe { self.ready[top].advance() } as *mut Tcb;
        trace::task_switched_in(self.current);
    }

    /// Insert a task at the tail of its priority's ready list and mark the
    /// priority ready.
    pub(crate) fn ready_add(&mut self, tcb: *mut Tcb) {
        unsafe {
            let priority = (*tcb).priority;
            self.set_ready_priority(priority);
            self.ready[priority].insert_tail(&mut (*tcb).task_item);
        }
        trace::task_readied(tcb);
    }

    /// Move a task out of its current state list onto a delay list (or the
    /// suspended list for a forever wait that allows it). The wake tick
    /// that would wrap lands on the overflow delay list.
    pub(crate) fn pend_add(&mut self, tcb: *mut Tcb, ticks: u32, suspend_on_forever: bool) {
        unsafe {
            if list::remove(&mut (*tcb).task_item) == 0 {
                self.reset_ready_priority((*tcb).priority);
            }

            if ticks == TICK_FOREVER && suspend_on_forever {
                self.suspended.insert_tail(&mut (*tcb).task_item);
            } else {
                let now = self.tick_count;
                let wake_time = now.wrapping_add(ticks);
                (*tcb).task_item.set_value(wake_time);

                if wake_time < now {
                    // Wakes after the tick counter wraps.
                    let overflow = self.delayed_active ^ 1;
                    self.delayed[overflow].insert_ordered(&mut (*tcb).task_item);
                } else {
                    self.delayed[self.delayed_active].insert_ordered(&mut (*tcb).task_item);
                    self.update_next_unblock();
                }
            }
        }
        trace::task_blocked(tcb);
    }

    /// Block the running task on a wait list (priority-ordered) with the
    /// given timeout. `TICK_FOREVER` parks the task on the suspended list.
    pub(crate) fn event_wait_add(&mut self, event_list: *mut List, ticks: u32) {
        unsafe {
            (*event_list).insert_ordered(&mut (*self.current).event_item);
        }
        let current = self.current;
        self.pend_add(current, ticks, true);
    }

    /// Wake the head of a wait list — always the highest-priority waiter.
    /// While the scheduler is locked the task is parked in the pending
    /// ready pool instead of touching the ready/delay lists. Returns true
    /// (and records the need) when the woken task outranks the running
    /// one.
    pub(crate) fn event_wake_highest(&mut self, event_list: *mut List) -> bool {
        unsafe {
            let tcb = (*event_list).head_owner() as *mut Tcb;

            list::remove(&mut (*tcb).event_item);

            if !self.is_locked() {
                list::remove(&mut (*tcb).task_item);
                self.ready_add(tcb);
            } else {
                self.pending_ready.insert_tail(&mut (*tcb).event_item);
            }

            let need_switch = (*tcb).priority > (*self.current).priority;
            if need_switch {
                self.set_need_reschedule();
            }
            self.update_next_unblock();
            need_switch
        }
    }

    /// Create a task and insert it into its ready list. Before the
    /// scheduler starts, the highest-priority created task is elected as
    /// the provisional running task; afterwards a higher-priority creation
    /// preempts immediately.
    pub fn create_task(
        &mut self,
        entry: arch::TaskEntry,
        arg: *mut c_void,
        stack_words: usize,
        priority: usize,
        name: &str,
    ) -> Result<TaskHandle, Error> {
        let stack_words = stack_words.max(MIN_STACK_WORDS);

        let tcb = match kmem::allocate(mem::size_of::<Tcb>()) {
            Some(p) => p.as_ptr() as *mut Tcb,
            None => return Err(Error::OutOfMemory),
        };
        let stack_base = match kmem::allocate(stack_words * mem::size_of::<usize>()) {
            Some(p) => p.as_ptr() as *mut usize,
            None => {
                #[cfg(feature = "delete")]
                unsafe {
                    kmem::deallocate(ptr::NonNull::new_unchecked(tcb as *mut u8));
                }
                return Err(Error::OutOfMemory);
            }
        };

        unsafe {
            // Fill the stack with a recognizable pattern; useful when
            // inspecting high-water marks from a debugger.
            ptr::write_bytes(
                stack_base as *mut u8,
                0xA5,
                stack_words * mem::size_of::<usize>(),
            );

            ptr::write(
                tcb,
                Tcb {
                    top_of_stack: ptr::null_mut(),
                    task_item: ListItem::new(),
                    event_item: ListItem::new(),
                    priority: 0,
                    base_priority: 0,
                    mutexes_held: 0,
                    stack_base,
                    stack_words,
                    name: [0; NAME_LEN],
                    sig_state: SignalState::NotWaiting,
                    sig_value: 0,
                },
            );
            (*tcb).init(name, priority, stack_base, stack_words);
            (*tcb).top_of_stack =
                arch::initialize_stack(stack_base.add(stack_words), entry, arg);

            {
                let _guard = IntGuard::new();

                self.task_count += 1;
                if self.current.is_null() {
                    self.current = tcb;
                } else if self.state() == SchedulerState::NotStarted
                    && (*self.current).priority <= (*tcb).priority
                {
                    self.current = tcb;
                }

                self.ready_add(tcb);
            }
            trace::task_created(tcb);

            if self.state() != SchedulerState::NotStarted
                && (*self.current).priority < (*tcb).priority
            {
                arch::request_context_switch();
            }
        }

        Ok(TaskHandle(tcb))
    }

    /// Delete a task (`None` = the running task). Self-deletion parks the
    /// TCB on the recycle list for the idle task to free — the stack being
    /// executed on cannot be released here.
    #[cfg(feature = "delete")]
    pub fn delete_task(&mut self, handle: Option<TaskHandle>) {
        let tcb;
        let mut deferred = false;
        {
            let _guard = IntGuard::new();
            tcb = handle.map_or(self.current, |h| h.0);
            unsafe {
                if list::remove(&mut (*tcb).task_item) == 0 {
                    self.reset_ready_priority((*tcb).priority);
                }
                if (*tcb).event_item.is_linked() {
                    list::remove(&mut (*tcb).event_item);
                }

                if tcb == self.current {
                    self.recycle.insert_tail(&mut (*tcb).task_item);
                    self.recycled += 1;
                    deferred = true;
                } else {
                    self.task_count -= 1;
                    free_task_memory(tcb);
                    self.update_next_unblock();
                }
            }
        }

        if deferred && self.state() != SchedulerState::NotStarted {
            arch::request_context_switch();
        }
    }

    /// Free every task parked on the recycle list. Called from the idle
    /// task, which is guaranteed not to be one of them.
    #[cfg(feature = "delete")]
    pub(crate) fn recycle_drain(&mut self) {
        while self.recycled > 0 {
            let tcb;
            {
                let _guard = IntGuard::new();
                tcb = self.recycle.head_owner() as *mut Tcb;
                unsafe {
                    list::remove(&mut (*tcb).task_item);
                }
                self.task_count -= 1;
                self.recycled -= 1;
            }
            unsafe {
                free_task_memory(tcb);
            }
        }
    }

    /// Put the running task to sleep for `ticks`. A zero sleep returns
    /// immediately. Runs under the schedule lock so a tick arriving midway
    /// is replayed, not raced.
    pub fn task_sleep(&mut self, ticks: u32) {
        let mut already_switched = false;

        if ticks > 0 {
            self.lock();
            let current = self.current;
            self.pend_add(current, ticks, false);
            already_switched = self.unlock();
        }

        if !already_switched {
            arch::request_context_switch();
        }
    }

    /// Suspend a task (`None` = the running task): removed from every
    /// list, parked with no timeout until resumed.
    pub fn suspend_task(&mut self, handle: Option<TaskHandle>) {
        let task_count_on_entry = self.task_count;
        let tcb;
        {
            let _guard = IntGuard::new();
            tcb = handle.map_or(self.current, |h| h.0);
            unsafe {
                if list::remove(&mut (*tcb).task_item) == 0 {
                    self.reset_ready_priority((*tcb).priority);
                }
                if (*tcb).event_item.is_linked() {
                    list::remove(&mut (*tcb).event_item);
                }
                self.suspended.insert_tail(&mut (*tcb).task_item);

                if (*tcb).sig_state == SignalState::Waiting {
                    // The wait is abandoned; no signal arrived.
                    (*tcb).sig_state = SignalState::NotWaiting;
                }
            }
        }

        if self.state() != SchedulerState::NotStarted {
            let _guard = IntGuard::new();
            self.update_next_unblock();
        }

        if tcb == self.current {
            if self.state() != SchedulerState::NotStarted {
                arch::request_context_switch();
            } else if self.suspended.len() == task_count_on_entry {
                // Everything is suspended; there is no task to elect.
                self.current = ptr::null_mut();
            } else {
                self.switch_context();
            }
        }
    }

    /// True when the task is genuinely suspended: parked on the suspended
    /// list, not already routed through the pending-ready pool, and not
    /// blocked-forever on a wait list.
    fn is_task_suspended(&self, tcb: *mut Tcb) -> bool {
        unsafe {
            self.suspended.contains(&(*tcb).task_item)
                && !self.pending_ready.contains(&(*tcb).event_item)
                && !(*tcb).event_item.is_linked()
        }
    }

    /// Resume a suspended task from task context.
    pub fn resume_task(&mut self, handle: TaskHandle) {
        let tcb = handle.0;
        if tcb.is_null() || tcb == self.current {
            return;
        }

        let _guard = IntGuard::new();
        if self.is_task_suspended(tcb) {
            unsafe {
                list::remove(&mut (*tcb).task_item);
                self.ready_add(tcb);

                if (*tcb).priority >= (*self.current).priority {
                    arch::request_context_switch();
                }
            }
        }
    }

    /// Resume a suspended task from interrupt context. Defers to the
    /// pending-ready pool while the scheduler is locked. Returns true when
    /// the caller's ISR should request a context switch.
    pub fn resume_task_from_isr(&mut self, handle: TaskHandle) -> bool {
        let tcb = handle.0;
        let mut need_switch = false;

        let _guard = IntGuard::new();
        if self.is_task_suspended(tcb) {
            if !self.is_locked() {
                unsafe {
                    if (*tcb).priority >= (*self.current).priority {
                        need_switch = true;
                    }
                    list::remove(&mut (*tcb).task_item);
                    self.ready_add(tcb);
                }
            } else {
                unsafe {
                    self.pending_ready.insert_tail(&mut (*tcb).event_item);
                }
            }
        }
        need_switch
    }

    /// Current priority of a task (`None` = the running task).
    pub fn task_priority(&self, handle: Option<TaskHandle>) -> usize {
        let _guard = IntGuard::new();
        let tcb = handle.map_or(self.current, |h| h.0);
        unsafe { (*tcb).priority }
    }

    /// Change a task's application-assigned priority. While the task holds
    /// an inherited boost only the base priority changes; the boost stays
    /// until disinheritance. Re-homes a ready task into the right ready
    /// list and requests a switch when the change affects who should run.
    pub fn set_task_priority(&mut self, handle: Option<TaskHandle>, new_priority: usize) {
        let new_priority = new_priority.min(MAX_PRIORITIES - 1);
        let mut need_switch = false;

        let _guard = IntGuard::new();
        let tcb = handle.map_or(self.current, |h| h.0);

        unsafe {
            let base_on_entry = (*tcb).base_priority;
            if base_on_entry == new_priority {
                return;
            }

            if new_priority > base_on_entry {
                if tcb != self.current && new_priority >= (*self.current).priority {
                    need_switch = true;
                }
            } else if tcb == self.current {
                need_switch = true;
            }

            let priority_on_entry = (*tcb).priority;

            if (*tcb).base_priority == (*tcb).priority {
                (*tcb).priority = new_priority;
            }
            (*tcb).base_priority = new_priority;

            if !(*tcb).event_item.is_linked() {
                (*tcb)
                    .event_item
                    .set_value((MAX_PRIORITIES - new_priority) as u32);
            }

            if self.ready[priority_on_entry].contains(&(*tcb).task_item) {
                if list::remove(&mut (*tcb).task_item) == 0 {
                    self.reset_ready_priority(priority_on_entry);
                }
                self.ready_add(tcb);
            }

            if need_switch {
                arch::request_context_switch();
            }
        }
    }

    /// Report a task's lifecycle state from its list membership.
    pub fn task_state(&self, handle: TaskHandle) -> TaskState {
        let tcb = handle.0;
        if tcb == self.current {
            return TaskState::Running;
        }

        let state_list = {
            let _guard = IntGuard::new();
            unsafe { (*tcb).task_item.container() }
        };

        let delayed0 = &self.delayed[0] as *const List as *mut List;
        let delayed1 = &self.delayed[1] as *const List as *mut List;
        let suspended = &self.suspended as *const List as *mut List;

        if state_list == delayed0 || state_list == delayed1 {
            TaskState::Blocked
        } else if state_list == suspended {
            let event_linked = unsafe { (*tcb).event_item.is_linked() };
            if event_linked {
                TaskState::Blocked
            } else {
                TaskState::Suspended
            }
        } else {
            #[cfg(feature = "delete")]
            if state_list == &self.recycle as *const List as *mut List {
                return TaskState::PendingRecycle;
            }
            TaskState::Ready
        }
    }

    /// The running task's handle.
    pub fn current_task(&self) -> Option<TaskHandle> {
        if self.current.is_null() {
            None
        } else {
            Some(TaskHandle(self.current))
        }
    }

    // -----------------------------------------------------------------------
    // Context switching
    // -----------------------------------------------------------------------

    /// The scheduling decision made by the context-switch interrupt.
    /// Locked: record the request for the unlock path. Otherwise: consume
    /// it, verify the outgoing task's stack, pick the next task.
    pub fn switch_context(&mut self) {
        if self.is_locked() {
            self.need_reschedule = true;
        } else {
            self.need_reschedule = false;
            self.check_stack();
            self.select_next();
        }
    }

    /// Stack-overflow guard run before every switch: the saved stack
    /// pointer must still lie inside the task's allocation. Violation is
    /// a fatal halt, no recovery attempted.
    fn check_stack(&self) {
        unsafe {
            let tcb = self.current;
            let stack_end = (*tcb).stack_base.add((*tcb).stack_words);
            if (*tcb).top_of_stack <= (*tcb).stack_base || (*tcb).top_of_stack >= stack_end {
                arch::fatal_halt();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Priority inheritance
    // -----------------------------------------------------------------------

    /// The running task is about to block on a mutex owned by `holder`:
    /// raise the holder to the running task's priority when it is lower,
    /// re-homing it if it sits in a ready list. Returns true when the
    /// holder runs (or already ran) at an inherited priority on behalf of
    /// a task at least this important.
    pub(crate) fn priority_inherit(&mut self, holder: *mut Tcb) -> bool {
        if holder.is_null() {
            return false;
        }

        unsafe {
            let current_priority = (*self.current).priority;

            if (*holder).priority < current_priority {
                (*holder)
                    .event_item
                    .set_value((MAX_PRIORITIES - current_priority) as u32);

                if self.ready[(*holder).priority].contains(&(*holder).task_item) {
                    if list::remove(&mut (*holder).task_item) == 0 {
                        self.reset_ready_priority((*holder).priority);
                    }
                    (*holder).priority = current_priority;
                    self.ready_add(holder);
                } else {
                    (*holder).priority = current_priority;
                }
                true
            } else {
                // Already boosted at least this high by an earlier waiter.
                (*holder).base_priority < current_priority
            }
        }
    }

    /// A mutex was released: drop one hold. Once the holder holds nothing
    /// and carries a boost, restore its base priority and re-home it.
    /// Returns true when the restore warrants a context switch.
    pub(crate) fn priority_disinherit(&mut self, holder: *mut Tcb) -> bool {
        if holder.is_null() {
            return false;
        }

        unsafe {
            (*holder).mutexes_held -= 1;

            if (*holder).priority != (*holder).base_priority && (*holder).mutexes_held == 0 {
                if list::remove(&mut (*holder).task_item) == 0 {
                    self.reset_ready_priority((*holder).priority);
                }

                (*holder).priority = (*holder).base_priority;
                (*holder)
                    .event_item
                    .set_value((MAX_PRIORITIES - (*holder).priority) as u32);
                self.ready_add(holder);
                return true;
            }
        }
        false
    }

    /// A waiter timed out without acquiring the mutex: lower the holder
    /// only as far as the highest-priority *remaining* waiter (never below
    /// its own base). Applied only while exactly one mutex is held — with
    /// several held, another mutex may justify the boost.
    pub(crate) fn priority_disinherit_after_timeout(
        &mut self,
        holder: *mut Tcb,
        highest_waiting_priority: usize,
    ) {
        if holder.is_null() {
            return;
        }

        unsafe {
            let target = highest_waiting_priority.max((*holder).base_priority);

            if (*holder).priority != target && (*holder).mutexes_held == 1 {
                let priority_on_entry = (*holder).priority;
                (*holder).priority = target;

                if !(*holder).event_item.is_linked() {
                    (*holder)
                        .event_item
                        .set_value((MAX_PRIORITIES - target) as u32);
                }

                if self.ready[priority_on_entry].contains(&(*holder).task_item) {
                    if list::remove(&mut (*holder).task_item) == 0 {
                        self.reset_ready_priority(priority_on_entry);
                    }
                    self.ready_add(holder);
                }
            }
        }
    }

    /// Record the running task as the new owner of a mutex.
    pub(crate) fn mutex_holder_grab(&mut self) -> *mut Tcb {
        if !self.current.is_null() {
            unsafe {
                (*self.current).mutexes_held += 1;
            }
        }
        self.current
    }

    // -----------------------------------------------------------------------
    // Task signals
    // -----------------------------------------------------------------------

    /// Wait for a counting signal. Consumes one count and returns true
    /// when a signal was (or becomes) available within `ticks`.
    pub fn signal_wait(&mut self, ticks: u32) -> bool {
        {
            let _guard = IntGuard::new();
            unsafe {
                if (*self.current).sig_value == 0 {
                    (*self.current).sig_state = SignalState::Waiting;
                    if ticks > 0 {
                        let current = self.current;
                        self.pend_add(current, ticks, true);
                        arch::request_context_switch();
                    }
                }
            }
        }

        let _guard = IntGuard::new();
        unsafe {
            let got = (*self.current).sig_value > 0;
            if got {
                (*self.current).sig_value -= 1;
            }
            (*self.current).sig_state = SignalState::NotWaiting;
            got
        }
    }

    /// Emit a counting signal to a task, waking it if it waits. Refused
    /// when the count is saturated.
    pub fn signal_emit(&mut self, handle: TaskHandle) -> bool {
        let tcb = handle.0;
        let _guard = IntGuard::new();

        unsafe {
            let was_waiting = (*tcb).sig_state == SignalState::Waiting;
            (*tcb).sig_state = SignalState::Received;

            let accepted = (*tcb).sig_value <= SIGNAL_COUNT_MAX;
            if accepted {
                (*tcb).sig_value += 1;
            }

            if was_waiting {
                list::remove(&mut (*tcb).task_item);
                self.ready_add(tcb);
                self.update_next_unblock();

                if (*tcb).priority > (*self.current).priority {
                    arch::request_context_switch();
                }
            }
            accepted
        }
    }

    /// ISR flavor of [`Scheduler::signal_emit`]; parks the woken task in
    /// the pending-ready pool while the scheduler is locked. Returns
    /// whether the signal was accepted.
    pub fn signal_emit_from_isr(&mut self, handle: TaskHandle) -> bool {
        let tcb = handle.0;
        let mut need_switch = false;
        let accepted;

        {
            let _guard = IntGuard::new();
            unsafe {
                let was_waiting = (*tcb).sig_state == SignalState::Waiting;
                (*tcb).sig_state = SignalState::Received;

                accepted = (*tcb).sig_value <= SIGNAL_COUNT_MAX;
                if accepted {
                    (*tcb).sig_value += 1;
                }

                if was_waiting {
                    if !self.is_locked() {
                        list::remove(&mut (*tcb).task_item);
                        self.ready_add(tcb);
                    } else {
                        self.pending_ready.insert_tail(&mut (*tcb).event_item);
                    }

                    if (*tcb).priority > (*self.current).priority {
                        need_switch = true;
                    }
                }
            }
        }

        arch::request_context_switch_from_isr(need_switch);
        accepted
    }

    /// Wait for a value-carrying signal. On success the value is written
    /// to `out` and the slot cleared.
    pub fn signal_wait_value(&mut self, out: &mut u32, ticks: u32) -> bool {
        {
            let _guard = IntGuard::new();
            unsafe {
                if (*self.current).sig_state != SignalState::Received {
                    (*self.current).sig_value = 0;
                    (*self.current).sig_state = SignalState::Waiting;
                    if ticks > 0 {
                        let current = self.current;
                        self.pend_add(current, ticks, true);
                        arch::request_context_switch();
                    }
                }
            }
        }

        let _guard = IntGuard::new();
        unsafe {
            *out = (*self.current).sig_value;
            let got = (*self.current).sig_state == SignalState::Received;
            if got {
                (*self.current).sig_value = 0;
            }
            (*self.current).sig_state = SignalState::NotWaiting;
            got
        }
    }

    /// Emit a value-carrying signal. An unconsumed previous value is only
    /// replaced when `overwrite` is set.
    pub fn signal_emit_value(&mut self, handle: TaskHandle, value: u32, overwrite: bool) -> bool {
        let tcb = handle.0;
        let _guard = IntGuard::new();

        unsafe {
            let state_on_entry = (*tcb).sig_state;
            (*tcb).sig_state = SignalState::Received;

            let accepted = state_on_entry != SignalState::Received || overwrite;
            if accepted {
                (*tcb).sig_value = value;
            }

            if state_on_entry == SignalState::Waiting {
                list::remove(&mut (*tcb).task_item);
                self.ready_add(tcb);
                self.update_next_unblock();

                if (*tcb).priority > (*self.current).priority {
                    arch::request_context_switch();
                }
            }
            accepted
        }
    }

    /// ISR flavor of [`Scheduler::signal_emit_value`].
    pub fn signal_emit_value_from_isr(
        &mut self,
        handle: TaskHandle,
        value: u32,
        overwrite: bool,
    ) -> bool {
        let tcb = handle.0;
        let mut need_switch = false;
        let accepted;

        {
            let _guard = IntGuard::new();
            unsafe {
                let state_on_entry = (*tcb).sig_state;
                (*tcb).sig_state = SignalState::Received;

                accepted = state_on_entry != SignalState::Received || overwrite;
                if accepted {
                    (*tcb).sig_value = value;
                }

                if state_on_entry == SignalState::Waiting {
                    if !self.is_locked() {
                        list::remove(&mut (*tcb).task_item);
                        self.ready_add(tcb);
                    } else {
                        self.pending_ready.insert_tail(&mut (*tcb).event_item);
                    }

                    if (*tcb).priority > (*self.current).priority {
                        need_switch = true;
                    }
                }
            }
        }

        arch::request_context_switch_from_isr(need_switch);
        accepted
    }

    /// Drop any received-but-unconsumed signal. Returns true when one was
    /// cleared.
    pub fn signal_clear(&mut self, handle: Option<TaskHandle>) -> bool {
        let _guard = IntGuard::new();
        let tcb = handle.map_or(self.current, |h| h.0);

        unsafe {
            if (*tcb).sig_state == SignalState::Received {
                (*tcb).sig_state = SignalState::NotWaiting;
                (*tcb).sig_value = 0;
                true
            } else {
                false
            }
        }
    }
}

/// Release a task's stack and control block.
#[cfg(feature = "delete")]
unsafe fn free_task_memory(tcb: *mut Tcb) {
    kmem::deallocate(ptr::NonNull::new_unchecked((*tcb).stack_base as *mut u8));
    kmem::deallocate(ptr::NonNull::new_unchecked(tcb as *mut u8));
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
