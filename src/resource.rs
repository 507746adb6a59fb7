//! # Generic Blocking-Resource Protocol
//!
//! The shared machinery behind the semaphore, the mutex, and the message
//! queue: a bounded count, a pair of priority-ordered wait lists, and a
//! pair of *lock counters* that make interrupt-context operations safe
//! against a task-context slow path.
//!
//! ## The lock counters
//!
//! A counter is either `-1` ("unlocked") or a non-negative number of
//! deferred wake credits. A slow path flips both counters to zero before
//! manipulating wait lists, and interrupt-context operations that would
//! normally wake a waiter bank a credit instead while the counters are
//! held. When the slow path releases the resource it walks the opposing
//! wait list once per accumulated credit — a post or take that raced the
//! slow path is therefore neither lost nor applied twice.
//!
//! ## The slow-path tail
//!
//! Every blocking operation is the same loop: try the fast path; on
//! failure lock the scheduler and the counters, re-check the timeout and
//! the exhaustion condition, and either block on the wait list or retry.
//! [`RawResource::block_or_retry`] implements that tail once;
//! the resources contribute only their fast paths (and the mutex its
//! priority-inheritance step, run just before blocking).

use crate::arch;
use crate::list::List;
use crate::scheduler::{Scheduler, Timeout};
use crate::sync::IntGuard;
use crate::trace;

/// Lock-counter value meaning "not locked by any slow path".
pub(crate) const LOCK_UNLOCKED: isize = -1;
/// Lock-counter value meaning "locked, no credits banked yet".
pub(crate) const LOCK_HELD: isize = 0;

/// The side of the resource an operation consumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    /// Take/receive: exhausted when the count is zero.
    Take,
    /// Post/send: exhausted when the count reached the bound.
    Post,
}

/// Result of one pass through the slow-path tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockOutcome {
    /// The task blocked on the wait list and has since been woken (or the
    /// request to switch away is pending). Retry the fast path.
    Blocked,
    /// The resource became available between the fast path and the lock
    /// acquisition. Retry the fast path.
    Retry,
    /// The timeout expired with the resource still exhausted.
    TimedOut,
}

/// Shared state of every blocking resource.
pub(crate) struct RawResource {
    /// Current count. `0 ≤ count ≤ max` at every observation point.
    pub(crate) count: usize,
    pub(crate) max: usize,

    /// Tasks blocked posting (resource full), highest priority first.
    pub(crate) wait_post: List,
    /// Tasks blocked taking (resource empty), highest priority first.
    pub(crate) wait_take: List,

    /// Deferred wake credits for posts issued while locked.
    pub(crate) post_lock: isize,
    /// Deferred wake credits for takes issued while locked.
    pub(crate) take_lock: isize,
}

impl RawResource {
    pub(crate) const fn new(max: usize, initial: usize) -> Self {
        RawResource {
            count: initial,
            max,
            wait_post: List::EMPTY,
            wait_take: List::EMPTY,
            post_lock: LOCK_UNLOCKED,
            take_lock: LOCK_UNLOCKED,
        }
    }

    /// Initialize the wait lists in place. Must run before first use, in
    /// the resource's final memory location.
    pub(crate) fn init(&mut self) {
        self.wait_post.init();
        self.wait_take.init();
        self.post_lock = LOCK_UNLOCKED;
        self.take_lock = LOCK_UNLOCKED;
    }

    /// Exhaustion test for one side. Callers hold the interrupt mask.
    pub(crate) fn is_exhausted(&self, side: Side) -> bool {
        match side {
            Side::Take => self.count == 0,
            Side::Post => self.count == self.max,
        }
    }

    /// Flip both lock counters from "unlocked" to "held". Interrupt
    /// wakeups arriving after this point are banked as credits.
    pub(crate) fn lock_waits(&mut self) {
        let _guard = IntGuard::new();
        if self.take_lock == LOCK_UNLOCKED {
            self.take_lock = LOCK_HELD;
        }
        if self.post_lock == LOCK_UNLOCKED {
            self.post_lock = LOCK_HELD;
        }
    }

    /// Release the lock counters, paying out one wake per banked credit —
    /// post credits wake takers, take credits wake posters. Must be called
    /// with the scheduler locked so the woken tasks route through the
    /// pending-ready pool.
    pub(crate) fn unlock_waits(&mut self, sched: &mut Scheduler) {
        {
            let _guard = IntGuard::new();
            let mut credits = self.post_lock;
            while credits > LOCK_HELD {
                if self.wait_take.is_empty() {
                    break;
                }
                sched.event_wake_highest(&mut self.wait_take);
                credits -= 1;
            }
            self.post_lock = LOCK_UNLOCKED;
        }

        {
            let _guard = IntGuard::new();
            let mut credits = self.take_lock;
            while credits > LOCK_HELD {
                if self.wait_post.is_empty() {
                    break;
                }
                sched.event_wake_highest(&mut self.wait_post);
                credits -= 1;
            }
            self.take_lock = LOCK_UNLOCKED;
        }
    }

    /// After an interrupt-context post succeeded: wake the highest waiter
    /// on the take side, or bank a credit when a slow path holds the
    /// counters. Returns true when the caller's ISR should request a
    /// context switch. Callers hold the interrupt mask.
    pub(crate) fn post_wake_from_isr(&mut self, sched: &mut Scheduler) -> bool {
        if self.post_lock == LOCK_UNLOCKED {
            if !self.wait_take.is_empty() {
                return sched.event_wake_highest(&mut self.wait_take);
            }
        } else {
            self.post_lock += 1;
            trace::wake_deferred();
        }
        false
    }

    /// Take-side counterpart of [`RawResource::post_wake_from_isr`].
    pub(crate) fn take_wake_from_isr(&mut self, sched: &mut Scheduler) -> bool {
        if self.take_lock == LOCK_UNLOCKED {
            if !self.wait_post.is_empty() {
                return sched.event_wake_highest(&mut self.wait_post);
            }
        } else {
            self.take_lock += 1;
            trace::wake_deferred();
        }
        false
    }

    /// The slow-path tail shared by every blocking operation. Runs under
    /// the schedule lock and the resource's lock counters; any post/take
    /// racing between the caller's failed fast path and this lock
    /// acquisition lands in the credit counters and is paid out by the
    /// unlock below.
    ///
    /// `before_block` runs, under the interrupt mask, immediately before
    /// the task joins the wait list — the mutex injects priority
    /// inheritance there.
    pub(crate) fn block_or_retry<F>(
        &mut self,
        sched: &mut Scheduler,
        side: Side,
        timeout: &mut Timeout,
        remaining: &mut u32,
        before_block: F,
    ) -> BlockOutcome
    where
        F: FnOnce(&mut Scheduler),
    {
        sched.lock();
        self.lock_waits();

        if !sched.timeout_expired(timeout, remaining) {
            let exhausted = {
                let _guard = IntGuard::new();
                self.is_exhausted(side)
            };

            if exhausted {
                {
                    let _guard = IntGuard::new();
                    before_block(sched);
                }
                let wait_list = match side {
                    Side::Take => &mut self.wait_take as *mut List,
                    Side::Post => &mut self.wait_post as *mut List,
                };
                sched.event_wait_add(wait_list, *remaining);
                self.unlock_waits(sched);
                if !sched.unlock() {
                    arch::request_context_switch();
                }
                BlockOutcome::Blocked
            } else {
                self.unlock_waits(sched);
                sched.unlock();
                BlockOutcome::Retry
            }
        } else {
            self.unlock_waits(sched);
            sched.unlock();

            let exhausted = {
                let _guard = IntGuard::new();
                self.is_exhausted(side)
            };
            if exhausted {
                BlockOutcome::TimedOut
            } else {
                BlockOutcome::Retry
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_STACK_WORDS;
    use crate::task::{TaskHandle, TaskState};
    use core::ffi::c_void;
    use core::ptr;
    use std::boxed::Box;

    extern "C" fn noop(_arg: *mut c_void) {}

    fn boxed_scheduler() -> Box<Scheduler> {
        let mut sched = Box::new(Scheduler::new());
        sched.init();
        sched
    }

    fn spawn(sched: &mut Scheduler, priority: usize, name: &str) -> TaskHandle {
        sched
            .create_task(noop, ptr::null_mut(), MIN_STACK_WORDS, priority, name)
            .expect("task creation failed")
    }

    fn boxed_resource(max: usize, initial: usize) -> Box<RawResource> {
        let mut r = Box::new(RawResource::new(max, initial));
        r.init();
        r
    }

    /// Park a task on a resource's take-side wait list.
    fn block_taker(sched: &mut Scheduler, r: &mut RawResource, t: TaskHandle, ticks: u32) {
        let previous = sched.current;
        sched.current = t.0;
        sched.event_wait_add(&mut r.wait_take, ticks);
        sched.current = previous;
    }

    #[test]
    fn test_isr_post_wakes_directly_when_unlocked() {
        let mut sched = boxed_scheduler();
        let _main = spawn(&mut sched, 4, "main");
        let t = spawn(&mut sched, 2, "taker");
        sched.running = true;
        let mut r = boxed_resource(1, 0);

        block_taker(&mut sched, &mut r, t, 100);
        assert_eq!(sched.task_state(t), TaskState::Blocked);

        let _guard = IntGuard::new();
        r.count += 1;
        r.post_wake_from_isr(&mut sched);
        drop(_guard);

        assert_eq!(sched.task_state(t), TaskState::Ready);
        assert_eq!(r.post_lock, LOCK_UNLOCKED);
    }

    #[test]
    fn test_deferred_wake_is_neither_lost_nor_doubled() {
        let mut sched = boxed_scheduler();
        let _main = spawn(&mut sched, 4, "main");
        let t = spawn(&mut sched, 2, "taker");
        sched.running = true;
        let mut r = boxed_resource(1, 0);

        block_taker(&mut sched, &mut r, t, 100);

        // A slow path holds the resource locked.
        r.lock_waits();
        assert_eq!(r.post_lock, LOCK_HELD);

        // An interrupt posts meanwhile: the wake must be banked, not
        // performed.
        {
            let _guard = IntGuard::new();
            r.count += 1;
            assert!(!r.post_wake_from_isr(&mut sched));
        }
        assert_eq!(r.post_lock, 1);
        assert_eq!(sched.task_state(t), TaskState::Blocked);

        // Releasing the resource pays out exactly one wake.
        sched.lock();
        r.unlock_waits(&mut sched);
        sched.unlock();

        assert_eq!(sched.task_state(t), TaskState::Ready);
        assert_eq!(r.post_lock, LOCK_UNLOCKED);
        assert!(r.wait_take.is_empty());
    }

    #[test]
    fn test_excess_credits_do_not_over_wake() {
        let mut sched = boxed_scheduler();
        let _main = spawn(&mut sched, 4, "main");
        let t = spawn(&mut sched, 2, "taker");
        sched.running = true;
        let mut r = boxed_resource(3, 0);

        block_taker(&mut sched, &mut r, t, 100);

        r.lock_waits();
        for _ in 0..3 {
            let _guard = IntGuard::new();
            r.count += 1;
            r.post_wake_from_isr(&mut sched);
        }
        assert_eq!(r.post_lock, 3);

        // One waiter, three credits: one wake, the rest dissolve with the
        // unlock.
        sched.lock();
        r.unlock_waits(&mut sched);
        sched.unlock();

        assert_eq!(sched.task_state(t), TaskState::Ready);
        assert_eq!(r.post_lock, LOCK_UNLOCKED);
        assert_eq!(r.take_lock, LOCK_UNLOCKED);
    }

    #[test]
    fn test_lock_waits_does_not_reset_banked_credits() {
        let mut r = boxed_resource(1, 0);
        r.lock_waits();
        r.post_lock = 2; // two banked posts
        r.lock_waits(); // nested slow path must not clobber them
        assert_eq!(r.post_lock, 2);
        assert_eq!(r.take_lock, LOCK_HELD);
    }

    #[test]
    fn test_block_or_retry_times_out_only_when_exhausted() {
        let mut sched = boxed_scheduler();
        let _main = spawn(&mut sched, 4, "main");
        sched.running = true;
        let mut r = boxed_resource(1, 0);

        let mut timeout = Timeout::new();
        let mut remaining: u32 = 5;
        sched.timeout_record(&mut timeout);

        // Expire the timeout, but make the resource available: the
        // protocol retries instead of reporting a timeout.
        sched.tick_count = 50;
        r.count = 1;
        let outcome = r.block_or_retry(&mut sched, Side::Take, &mut timeout, &mut remaining, |_| {});
        assert_eq!(outcome, BlockOutcome::Retry);

        // Exhausted and expired: timeout.
        r.count = 0;
        let mut timeout = Timeout::new();
        let mut remaining: u32 = 1;
        sched.timeout_record(&mut timeout);
        sched.tick_count = 100;
        let outcome = r.block_or_retry(&mut sched, Side::Take, &mut timeout, &mut remaining, |_| {});
        assert_eq!(outcome, BlockOutcome::TimedOut);
    }

    #[test]
    fn test_block_or_retry_blocks_and_releases_locks() {
        let mut sched = boxed_scheduler();
        let _main = spawn(&mut sched, 4, "main");
        let t = spawn(&mut sched, 2, "taker");
        sched.running = true;
        let mut r = boxed_resource(1, 0);

        sched.current = t.0;
        let mut timeout = Timeout::new();
        let mut remaining: u32 = 10;
        sched.timeout_record(&mut timeout);

        let outcome = r.block_or_retry(&mut sched, Side::Take, &mut timeout, &mut remaining, |_| {});
        assert_eq!(outcome, BlockOutcome::Blocked);

        sched.current = _main.0;
        assert_eq!(sched.task_state(t), TaskState::Blocked);
        unsafe {
            assert!(r.wait_take.contains(&(*t.0).event_item));
        }
        // Both the schedule lock and the counters are released on exit.
        assert!(!sched.is_locked());
        assert_eq!(r.post_lock, LOCK_UNLOCKED);
        assert_eq!(r.take_lock, LOCK_UNLOCKED);
    }
}
