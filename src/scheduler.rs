//! # Scheduler Core
//!
//! Tick accounting, readiness tracking, schedule-lock nesting, and timeout
//! bookkeeping. The [`Scheduler`] struct is the single process-wide kernel
//! context: every list the kernel owns lives inside it, it is constructed
//! once before any task runs, and it never moves afterwards (the intrusive
//! lists are address-stable). `kernel.rs` owns the global instance; unit
//! tests build their own.
//!
//! ## Tick processing
//!
//! Each timer interrupt calls [`Scheduler::increment_tick`]:
//!
//! 1. With the scheduler locked, the tick is only counted into
//!    `pended_ticks` and replayed later by [`Scheduler::unlock`] — nothing
//!    touches the ready or delay lists while a task-context traversal may
//!    be in flight.
//! 2. Otherwise the counter advances; on wraparound to zero the two delay
//!    lists swap roles and the overflow counter increments. The current
//!    delay list therefore always holds wake times reachable before the
//!    next wrap.
//! 3. Every task at the head of the current delay list whose wake time has
//!    arrived moves to its ready list; if any has priority at or above the
//!    running task's, a reschedule is signalled.
//! 4. With time-slicing enabled, a reschedule is also signalled whenever
//!    more than one task shares the running priority.
//!
//! ## Schedule lock
//!
//! [`Scheduler::lock`] / [`Scheduler::unlock`] nest. Interrupt-context
//! wakeups that arrive while locked are parked in the `pending_ready` pool
//! (or in a resource's credit counter) and drained on the final unlock,
//! which also replays pended ticks and requests an immediate context
//! switch when any of that work made one necessary.

use crate::arch;
use crate::config::{MAX_PRIORITIES, TICK_FOREVER};
use crate::list::{self, List};
use crate::sync::IntGuard;
use crate::task::Tcb;
use crate::trace;

// ---------------------------------------------------------------------------
// Scheduler state
// ---------------------------------------------------------------------------

/// Lifecycle state reported by [`Scheduler::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// `start` has not run; tasks may be created but nothing executes.
    NotStarted,
    /// Started and free to switch tasks.
    Running,
    /// Started but schedule-locked; switches are deferred.
    Locked,
}

/// Snapshot taken when a bounded wait begins, used to detect expiry across
/// retries and tick-counter wraparound.
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    overflow_count: i32,
    entered_at: u32,
}

impl Timeout {
    pub const fn new() -> Self {
        Timeout {
            overflow_count: 0,
            entered_at: 0,
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Scheduler context
// ---------------------------------------------------------------------------

/// The kernel context. Holds every task list, the tick state, and the
/// schedule-lock bookkeeping.
///
/// ## Design Notes
///
/// - One ready list per priority; the running task stays in its ready
///   list, and selection rotates through it via the list cursor.
/// - `ready_bits` caches which ready lists are non-empty; the highest
///   ready priority is a single bit scan (priorities are capped at 64).
/// - Two delay lists are used alternately across tick wraparounds.
/// - Stored as a `static mut` in `kernel.rs`; all access goes through
///   critical sections or ISR-serialized paths.
pub struct Scheduler {
    /// The running task. Null until the first task is created.
    pub(crate) current: *mut Tcb,

    /// Number of live tasks (including any parked for recycling).
    pub(crate) task_count: usize,

    /// One ready list per priority, tail-inserted for round-robin.
    pub(crate) ready: [List; MAX_PRIORITIES],

    /// Bit `p` set ⇔ `ready[p]` is non-empty.
    pub(crate) ready_bits: u64,

    /// Delay lists ordered by absolute wake tick; `delayed_active` indexes
    /// the one holding wake times before the next wrap.
    pub(crate) delayed: [List; 2],
    pub(crate) delayed_active: usize,

    /// Tasks woken while the scheduler was locked, awaiting the drain in
    /// [`Scheduler::unlock`]. Linked by their event items.
    pub(crate) pending_ready: List,

    /// Tasks suspended explicitly or blocked forever.
    pub(crate) suspended: List,

    /// Self-deleted tasks whose stacks the idle task still has to free.
    #[cfg(feature = "delete")]
    pub(crate) recycle: List,
    #[cfg(feature = "delete")]
    pub(crate) recycled: usize,

    /// Monotonic (wrapping) tick counter.
    pub(crate) tick_count: u32,

    /// Incremented on every tick-counter wraparound.
    pub(crate) overflow_count: i32,

    /// Wake tick of the earliest delayed task, or [`TICK_FOREVER`].
    pub(crate) next_unblock: u32,

    /// Schedule-lock nesting depth.
    pub(crate) lock_depth: usize,

    /// Ticks received while locked, replayed on unlock.
    pub(crate) pended_ticks: u32,

    /// A context switch is wanted; consumed by `switch_context`.
    pub(crate) need_reschedule: bool,

    /// Set by `start`; distinguishes NotStarted from Running/Locked.
    pub(crate) running: bool,
}

impl Scheduler {
    /// A blank context. [`Scheduler::init`] must run, in the context's
    /// final memory location, before anything else.
    pub const fn new() -> Self {
        Scheduler {
            current: core::ptr::null_mut(),
            task_count: 0,
            ready: [List::EMPTY; MAX_PRIORITIES],
            ready_bits: 0,
            delayed: [List::EMPTY; 2],
            delayed_active: 0,
            pending_ready: List::EMPTY,
            suspended: List::EMPTY,
            #[cfg(feature = "delete")]
            recycle: List::EMPTY,
            #[cfg(feature = "delete")]
            recycled: 0,
            tick_count: 0,
            overflow_count: 0,
            next_unblock: 0,
            lock_depth: 0,
            pended_ticks: 0,
            need_reschedule: false,
            running: false,
        }
    }

    /// Initialize every list and reset all counters.
    pub fn init(&mut self) {
        for list in self.ready.iter_mut() {
            list.init();
        }
        self.delayed[0].init();
        self.delayed[1].init();
        self.pending_ready.init();
        self.suspended.init();
        #[cfg(feature = "delete")]
        {
            self.recycle.init();
            self.recycled = 0;
        }
        self.current = core::ptr::null_mut();
        self.task_count = 0;
        self.ready_bits = 0;
        self.delayed_active = 0;
        self.tick_count = 0;
        self.overflow_count = 0;
        self.next_unblock = 0;
        self.lock_depth = 0;
        self.pended_ticks = 0;
        self.need_reschedule = false;
        self.running = false;
    }

    // -----------------------------------------------------------------------
    // State queries
    // -----------------------------------------------------------------------

    pub fn state(&self) -> SchedulerState {
        if !self.running {
            SchedulerState::NotStarted
        } else if self.is_locked() {
            SchedulerState::Locked
        } else {
            SchedulerState::Running
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock_depth != 0
    }

    /// Current tick count, read under the mask.
    pub fn tick_count(&self) -> u32 {
        let _guard = IntGuard::new();
        self.tick_count
    }

    /// Record that a context switch is wanted without requesting one.
    #[inline]
    pub(crate) fn set_need_reschedule(&mut self) {
        self.need_reschedule = true;
    }

    // -----------------------------------------------------------------------
    // Readiness bitmap
    // -----------------------------------------------------------------------

    #[inline]
    pub(crate) fn set_ready_priority(&mut self, priority: usize) {
        self.ready_bits |= 1u64 << priority;
    }

    /// Clear a priority's readiness bit once its ready list drained.
    #[inline]
    pub(crate) fn reset_ready_priority(&mut self, priority: usize) {
        if self.ready[priority].is_empty() {
            self.ready_bits &= !(1u64 << priority);
        }
    }

    /// Numerically highest priority with a non-empty ready list.
    ///
    /// At least one ready list is always non-empty once the scheduler has
    /// started — the idle task never blocks.
    #[inline]
    pub(crate) fn top_ready_priority(&self) -> usize {
        debug_assert!(self.ready_bits != 0);
        63 - self.ready_bits.leading_zeros() as usize
    }

    // -----------------------------------------------------------------------
    // Tick processing
    // -----------------------------------------------------------------------

    /// Advance the tick. Returns true when the caller should request a
    /// context switch. Invoked once per timer interrupt (and replayed by
    /// [`Scheduler::unlock`] for ticks that arrived while locked).
    pub fn increment_tick(&mut self) -> bool {
        let mut need_switch = false;

        if !self.is_locked() {
            let now = self.tick_count.wrapping_add(1);
            self.tick_count = now;
            trace::tick(now);

            if now == 0 {
                // Wraparound: the other delay list becomes current.
                self.switch_delay_lists();
                self.overflow_count += 1;
                self.update_next_unblock();
            }

            if now >= self.next_unblock {
                loop {
                    if self.delayed[self.delayed_active].is_empty() {
                        self.next_unblock = TICK_FOREVER;
                        break;
                    }

                    let tcb = self.delayed[self.delayed_active].head_owner() as *mut Tcb;
                    let wake_time = unsafe { (*tcb).task_item.value() };

                    if now < wake_time {
                        self.next_unblock = wake_time;
                        break;
                    }

                    unsafe {
                        list::remove(&mut (*tcb).task_item);
                        if (*tcb).event_item.is_linked() {
                            list::remove(&mut (*tcb).event_item);
                        }
                        self.ready_add(tcb);

                        if (*tcb).priority >= (*self.current).priority {
                            need_switch = true;
                        }
                    }
                }
            }

            #[cfg(feature = "time-slice")]
            if self.time_slice_due() {
                need_switch = true;
            }
        } else {
            self.pended_ticks += 1;
        }

        if self.need_reschedule {
            need_switch = true;
        }

        need_switch
    }

    /// Swap the roles of the two delay lists (tick wraparound).
    pub(crate) fn switch_delay_lists(&mut self) {
        self.delayed_active ^= 1;
    }

    /// True when another task shares the running task's priority level.
    #[cfg(feature = "time-slice")]
    pub(crate) fn time_slice_due(&self) -> bool {
        if self.current.is_null() {
            return false;
        }
        unsafe { self.ready[(*self.current).priority].len() > 1 }
    }

    /// Recompute the cached earliest wake time from the current delay
    /// list's head.
    pub(crate) fn update_next_unblock(&mut self) {
        let delayed = &self.delayed[self.delayed_active];
        self.next_unblock = if delayed.is_empty() {
            TICK_FOREVER
        } else {
            delayed.head_value()
        };
    }

    // -----------------------------------------------------------------------
    // Schedule lock
    // -----------------------------------------------------------------------

    /// Enter a schedule-locked region. Nests.
    pub fn lock(&mut self) {
        self.lock_depth += 1;
    }

    /// Leave a schedule-locked region. On the outermost unlock the pending
    /// ready pool is spliced back into the real ready lists, pended ticks
    /// are replayed, and — if any of that made a switch necessary — a
    /// context switch is requested immediately. Returns true when the
    /// switch was already requested here, so the caller need not request
    /// one itself.
    pub fn unlock(&mut self) -> bool {
        let mut already_switched = false;
        let _guard = IntGuard::new();

        self.lock_depth -= 1;

        if !self.is_locked() && self.task_count > 0 {
            let mut drained = false;
            while !self.pending_ready.is_empty() {
                let tcb = self.pending_ready.head_owner() as *mut Tcb;
                unsafe {
                    list::remove(&mut (*tcb).event_item);
                    list::remove(&mut (*tcb).task_item);
                    self.ready_add(tcb);

                    if (*tcb).priority >= (*self.current).priority {
                        self.need_reschedule = true;
                    }
                }
                drained = true;
            }
            if drained {
                self.update_next_unblock();
            }

            let mut pended = self.pended_ticks;
            while pended > 0 {
                if self.increment_tick() {
                    self.need_reschedule = true;
                }
                pended -= 1;
            }
            self.pended_ticks = 0;

            if self.need_reschedule {
                already_switched = true;
                arch::request_context_switch();
            }
        }

        already_switched
    }

    // -----------------------------------------------------------------------
    // Timeout bookkeeping
    // -----------------------------------------------------------------------

    /// Snapshot the current time into `timeout` at the start of a bounded
    /// wait (or when re-arming after a partial wait).
    pub fn timeout_record(&self, timeout: &mut Timeout) {
        timeout.overflow_count = self.overflow_count;
        timeout.entered_at = self.tick_count;
    }

    /// Check whether a bounded wait has expired, consuming elapsed ticks
    /// from `remaining` and re-arming the snapshot when it has not. Safe
    /// to call repeatedly across a retry loop.
    ///
    /// A wait of [`TICK_FOREVER`] never expires. A wrap of the tick
    /// counter since the snapshot, with the counter back at or past the
    /// entry point, means a full period elapsed — expired regardless of
    /// `remaining`.
    pub fn timeout_expired(&self, timeout: &mut Timeout, remaining: &mut u32) -> bool {
        let _guard = IntGuard::new();

        let now = self.tick_count;
        let elapsed = now.wrapping_sub(timeout.entered_at);

        if *remaining == TICK_FOREVER {
            false
        } else if self.overflow_count != timeout.overflow_count && now >= timeout.entered_at {
            true
        } else if elapsed < *remaining {
            *remaining -= elapsed;
            self.timeout_record(timeout);
            false
        } else {
            *remaining = 0;
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
