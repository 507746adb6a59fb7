//! # Counting Semaphore
//!
//! A bounded counter over the generic blocking-resource protocol. `pend`
//! takes one count, blocking up to a timeout while the count is zero;
//! `post` returns one count and never blocks (a full semaphore refuses the
//! post). `post_from_isr` is the interrupt-context flavor, deferring its
//! wakeup through the resource's credit counter when a slow path holds the
//! semaphore locked.
//!
//! A binary semaphore is the `max == 1` special case.

use crate::arch;
use crate::kernel::{self, Error};
use crate::mem as kmem;
use crate::resource::{BlockOutcome, RawResource, Side};
use crate::scheduler::{Scheduler, SchedulerState, Timeout};
use crate::sync::IntGuard;

/// Semaphore control block. Allocated by [`create`]; referenced through
/// [`SemaphoreHandle`].
pub struct Semaphore {
    raw: RawResource,
}

impl Semaphore {
    pub(crate) const fn new(max: usize, initial: usize) -> Self {
        Semaphore {
            raw: RawResource::new(max, initial),
        }
    }

    pub(crate) fn init(&mut self) {
        self.raw.init();
    }

    /// Current count, read under the mask.
    pub(crate) fn count(&self) -> usize {
        let _guard = IntGuard::new();
        self.raw.count
    }

    /// Take one count, blocking up to `ticks` while none is available.
    pub(crate) fn pend_inner(&mut self, sched: &mut Scheduler, mut ticks: u32) -> Result<(), Error> {
        let mut timeout = Timeout::new();
        let mut entry_recorded = false;

        loop {
            {
                let _guard = IntGuard::new();

                if self.raw.count > 0 {
                    self.raw.count -= 1;

                    // A poster may be blocked on the space this take just
                    // created.
                    if !self.raw.wait_post.is_empty()
                        && sched.event_wake_highest(&mut self.raw.wait_post)
                    {
                        arch::request_context_switch();
                    }
                    return Ok(());
                }

                if ticks == 0 {
                    return Err(Error::Timeout);
                }
                if !entry_recorded {
                    sched.timeout_record(&mut timeout);
                    entry_recorded = true;
                }
            }

            match self
                .raw
                .block_or_retry(sched, Side::Take, &mut timeout, &mut ticks, |_| {})
            {
                BlockOutcome::TimedOut => return Err(Error::Timeout),
                BlockOutcome::Blocked | BlockOutcome::Retry => {}
            }
        }
    }

    /// Return one count. Never blocks; a full semaphore refuses.
    pub(crate) fn post_inner(&mut self, sched: &mut Scheduler) -> Result<(), Error> {
        let _guard = IntGuard::new();

        if self.raw.count < self.raw.max {
            self.raw.count += 1;

            if !self.raw.wait_take.is_empty() && sched.event_wake_highest(&mut self.raw.wait_take) {
                arch::request_context_switch();
            }
            Ok(())
        } else {
            Err(Error::Timeout)
        }
    }

    /// Interrupt-context post. Wakes the highest waiter directly, or banks
    /// a credit while a slow path holds the semaphore locked.
    pub(crate) fn post_from_isr_inner(&mut self, sched: &mut Scheduler) -> Result<(), Error> {
        let result;
        let mut need_switch = false;

        {
            let _guard = IntGuard::new();

            if self.raw.count < self.raw.max {
                self.raw.count += 1;
                need_switch = self.raw.post_wake_from_isr(sched);
                result = Ok(());
            } else {
                result = Err(Error::Timeout);
            }
        }

        if sched.state() == SchedulerState::Running {
            arch::request_context_switch_from_isr(need_switch);
        }
        result
    }
}

/// Opaque semaphore reference. Copyable; identity is the control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreHandle(pub(crate) *mut Semaphore);

unsafe impl Send for SemaphoreHandle {}

/// Create a counting semaphore with the given bound and initial count.
pub fn create(max: usize, initial: usize) -> Result<SemaphoreHandle, Error> {
    let sem = kmem::allocate(core::mem::size_of::<Semaphore>())
        .ok_or(Error::OutOfMemory)?
        .as_ptr() as *mut Semaphore;

    unsafe {
        core::ptr::write(sem, Semaphore::new(max, initial.min(max)));
        (*sem).init();
    }
    Ok(SemaphoreHandle(sem))
}

/// Create a binary semaphore (bound 1), initially empty or full.
pub fn create_binary(initially_available: bool) -> Result<SemaphoreHandle, Error> {
    create(1, initially_available as usize)
}

/// Delete a semaphore. No task may be blocked on it.
#[cfg(feature = "delete")]
pub fn delete(handle: SemaphoreHandle) {
    unsafe {
        kmem::deallocate(core::ptr::NonNull::new_unchecked(handle.0 as *mut u8));
    }
}

impl SemaphoreHandle {
    /// Take one count, blocking up to `ticks` (or `TICK_FOREVER`).
    pub fn pend(&self, ticks: u32) -> Result<(), Error> {
        unsafe { (*self.0).pend_inner(&mut *kernel::sched_ptr(), ticks) }
    }

    /// Return one count. Never blocks.
    pub fn post(&self) -> Result<(), Error> {
        unsafe { (*self.0).post_inner(&mut *kernel::sched_ptr()) }
    }

    /// Return one count from interrupt context. Never blocks.
    pub fn post_from_isr(&self) -> Result<(), Error> {
        unsafe { (*self.0).post_from_isr_inner(&mut *kernel::sched_ptr()) }
    }

    /// Current count.
    pub fn count(&self) -> usize {
        unsafe { (*self.0).count() }
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

    fn boxed_semaphore(max: usize, initial: usize) -> Box<Semaphore> {
        let mut sem = Box::new(Semaphore::new(max, initial));
        sem.init();
        sem
    }

    /// Park a task on the semaphore's take side.
    fn block_taker(sched: &mut Scheduler, sem: &mut Semaphore, t: TaskHandle, ticks: u32) {
        let previous = sched.current;
        sched.current = t.0;
        sched.event_wait_add(&mut sem.raw.wait_take, ticks);
        sched.current = previous;
    }

    #[test]
    fn test_counts_stay_within_bounds() {
        let mut sched = boxed_scheduler();
        let _main = spawn(&mut sched, 4, "main");
        sched.running = true;
        let mut sem = boxed_semaphore(2, 0);

        // Empty: zero-wait pend fails, count untouched.
        assert_eq!(sem.pend_inner(&mut sched, 0), Err(Error::Timeout));
        assert_eq!(sem.count(), 0);

        assert!(sem.post_inner(&mut sched).is_ok());
        assert!(sem.post_inner(&mut sched).is_ok());
        // Full: the post is refused, the bound holds.
        assert_eq!(sem.post_inner(&mut sched), Err(Error::Timeout));
        assert_eq!(sem.count(), 2);

        assert!(sem.pend_inner(&mut sched, 0).is_ok());
        assert!(sem.pend_inner(&mut sched, 0).is_ok());
        assert_eq!(sem.pend_inner(&mut sched, 0), Err(Error::Timeout));
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn test_post_wakes_highest_priority_waiter_first() {
        let mut sched = boxed_scheduler();
        let _main = spawn(&mut sched, 7, "main");
        let t3 = spawn(&mut sched, 3, "p3");
        let t6 = spawn(&mut sched, 6, "p6");
        let t5 = spawn(&mut sched, 5, "p5");
        sched.running = true;
        let mut sem = boxed_semaphore(1, 0);

        // Block priority 3, then 6, then 5 — in that order.
        block_taker(&mut sched, &mut sem, t3, 100);
        block_taker(&mut sched, &mut sem, t6, 100);
        block_taker(&mut sched, &mut sem, t5, 100);

        // A single post wakes the priority-6 task, regardless of blocking
        // order.
        assert!(sem.post_inner(&mut sched).is_ok());
        assert_eq!(sched.task_state(t6), TaskState::Ready);
        assert_eq!(sched.task_state(t5), TaskState::Blocked);
        assert_eq!(sched.task_state(t3), TaskState::Blocked);
    }

    #[test]
    fn test_isr_post_respects_bound() {
        let mut sched = boxed_scheduler();
        let _main = spawn(&mut sched, 4, "main");
        sched.running = true;
        let mut sem = boxed_semaphore(1, 1);

        assert_eq!(sem.post_from_isr_inner(&mut sched), Err(Error::Timeout));
        assert_eq!(sem.count(), 1);
    }

    #[test]
    fn test_isr_post_defers_while_slow_path_holds_lock() {
        let mut sched = boxed_scheduler();
        let _main = spawn(&mut sched, 4, "main");
        let t = spawn(&mut sched, 2, "taker");
        sched.running = true;
        let mut sem = boxed_semaphore(1, 0);

        block_taker(&mut sched, &mut sem, t, 100);

        // A task-context slow path is mid-operation.
        sem.raw.lock_waits();

        assert!(sem.post_from_isr_inner(&mut sched).is_ok());
        // The wake was banked; the waiter has not moved yet.
        assert_eq!(sched.task_state(t), TaskState::Blocked);
        assert_eq!(sem.count(), 1);

        // The slow path finishes: exactly one waiter wakes.
        sched.lock();
        sem.raw.unlock_waits(&mut sched);
        sched.unlock();
        assert_eq!(sched.task_state(t), TaskState::Ready);
    }

    #[test]
    fn test_pend_consumes_after_direct_wake() {
        let mut sched = boxed_scheduler();
        let _main = spawn(&mut sched, 4, "main");
        let t = spawn(&mut sched, 6, "taker");
        sched.running = true;
        let mut sem = boxed_semaphore(1, 0);

        block_taker(&mut sched, &mut sem, t, 100);
        assert!(sem.post_inner(&mut sched).is_ok());
        assert_eq!(sched.task_state(t), TaskState::Ready);

        // The woken task retries its fast path and takes the count.
        sched.current = t.0;
        assert!(sem.pend_inner(&mut sched, 0).is_ok());
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn test_binary_create_clamps_initial() {
        let mut sem = boxed_semaphore(1, 1);
        sem.init();
        assert_eq!(sem.count(), 1);
    }
}
