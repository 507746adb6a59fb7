//! # Priority-Inheriting Mutex
//!
//! A recursive mutex over the generic blocking-resource protocol with
//! `max = 1` and an ownership record.
//!
//! - **Recursion**: a lock request by the current holder increments a hold
//!   depth instead of blocking; the mutex only becomes available again
//!   when the depth returns to zero.
//! - **Priority inheritance**: a task blocking on a held mutex raises the
//!   holder to its own priority (the holder's base priority is kept
//!   separately). The boost unwinds fully on the final unlock. When a
//!   waiter *times out* instead of acquiring, the holder is lowered only
//!   as far as the highest-priority remaining waiter — other waiters may
//!   still justify elevation.
//!
//! Mutexes are task-context only: ownership is meaningless in an ISR, so
//! no interrupt-context variants exist.

use crate::arch;
use crate::config::{LOWEST_PRIORITY, MAX_PRIORITIES};
use crate::kernel::{self, Error};
use crate::mem as kmem;
use crate::resource::{BlockOutcome, RawResource, Side};
use crate::scheduler::{Scheduler, Timeout};
use crate::sync::IntGuard;
use crate::task::Tcb;

/// Mutex control block. Allocated by [`create`]; referenced through
/// [`MutexHandle`].
pub struct Mutex {
    raw: RawResource,

    /// Owning task while locked; null otherwise. Non-null ⇔ count == 0.
    holder: *mut Tcb,

    /// Recursive lock depth of the holder.
    depth: usize,
}

impl Mutex {
    pub(crate) const fn new() -> Self {
        Mutex {
            raw: RawResource::new(1, 1),
            holder: core::ptr::null_mut(),
            depth: 0,
        }
    }

    pub(crate) fn init(&mut self) {
        self.raw.init();
    }

    /// Priority of the highest-priority task still waiting to lock, used
    /// to bound partial disinheritance after a waiter timeout.
    fn highest_waiting_priority(&self) -> usize {
        if self.raw.wait_take.is_empty() {
            LOWEST_PRIORITY
        } else {
            MAX_PRIORITIES - self.raw.wait_take.head_value() as usize
        }
    }

    /// Lock, blocking up to `ticks` while another task holds the mutex.
    /// Re-locking by the holder nests.
    pub(crate) fn lock_inner(&mut self, sched: &mut Scheduler, mut ticks: u32) -> Result<(), Error> {
        if !self.holder.is_null() && self.holder == sched.current {
            self.depth += 1;
            return Ok(());
        }

        let mut timeout = Timeout::new();
        let mut entry_recorded = false;
        let mut inheritance_occurred = false;

        loop {
            {
                let _guard = IntGuard::new();

                if self.raw.count > 0 {
                    self.raw.count -= 1;
                    self.holder = sched.mutex_holder_grab();
                    self.depth += 1;

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

            let holder = self.holder;
            let outcome = self.raw.block_or_retry(
                sched,
                Side::Take,
                &mut timeout,
                &mut ticks,
                |sched| {
                    // About to wait on the holder: bound the inversion by
                    // boosting it to our priority.
                    if sched.priority_inherit(holder) {
                        inheritance_occurred = true;
                    }
                },
            );

            match outcome {
                BlockOutcome::TimedOut => {
                    if inheritance_occurred {
                        let _guard = IntGuard::new();
                        // Our boost no longer applies; drop the holder to
                        // the highest remaining waiter (never below its
                        // base).
                        let highest = self.highest_waiting_priority();
                        sched.priority_disinherit_after_timeout(self.holder, highest);
                    }
                    return Err(Error::Timeout);
                }
                BlockOutcome::Blocked | BlockOutcome::Retry => {}
            }
        }
    }

    /// Unlock. Only the holder may unlock, and only the final unlock of a
    /// recursive chain releases the mutex, restores any inherited
    /// priority, and wakes the highest-priority waiter.
    pub(crate) fn unlock_inner(&mut self, sched: &mut Scheduler) -> Result<(), Error> {
        if self.holder != sched.current {
            return Err(Error::NotOwner);
        }

        self.depth -= 1;
        if self.depth != 0 {
            return Ok(());
        }

        let _guard = IntGuard::new();

        let need_switch = sched.priority_disinherit(self.holder);
        self.holder = core::ptr::null_mut();
        self.raw.count += 1;

        if !self.raw.wait_take.is_empty() {
            if sched.event_wake_highest(&mut self.raw.wait_take) {
                arch::request_context_switch();
            }
        } else if need_switch {
            arch::request_context_switch();
        }
        Ok(())
    }

    /// The current holder, if any.
    pub(crate) fn holder(&self) -> *mut Tcb {
        let _guard = IntGuard::new();
        self.holder
    }
}

/// Opaque mutex reference. Copyable; identity is the control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexHandle(pub(crate) *mut Mutex);

unsafe impl Send for MutexHandle {}

/// Create an unlocked mutex.
pub fn create() -> Result<MutexHandle, Error> {
    let mutex = kmem::allocate(core::mem::size_of::<Mutex>())
        .ok_or(Error::OutOfMemory)?
        .as_ptr() as *mut Mutex;

    unsafe {
        core::ptr::write(mutex, Mutex::new());
        (*mutex).init();
    }
    Ok(MutexHandle(mutex))
}

/// Delete a mutex. It must be unlocked with no waiters.
#[cfg(feature = "delete")]
pub fn delete(handle: MutexHandle) {
    unsafe {
        kmem::deallocate(core::ptr::NonNull::new_unchecked(handle.0 as *mut u8));
    }
}

impl MutexHandle {
    /// Lock, blocking up to `ticks` (or `TICK_FOREVER`). Nests when the
    /// caller already holds the mutex.
    pub fn lock(&self, ticks: u32) -> Result<(), Error> {
        unsafe { (*self.0).lock_inner(&mut *kernel::sched_ptr(), ticks) }
    }

    /// Unlock; only the holder may call this.
    pub fn unlock(&self) -> Result<(), Error> {
        unsafe { (*self.0).unlock_inner(&mut *kernel::sched_ptr()) }
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

    fn boxed_mutex() -> Box<Mutex> {
        let mut m = Box::new(Mutex::new());
        m.init();
        m
    }

    /// Park a task on the mutex's wait list.
    fn block_waiter(sched: &mut Scheduler, m: &mut Mutex, t: TaskHandle, ticks: u32) {
        let previous = sched.current;
        sched.current = t.0;
        sched.event_wait_add(&mut m.raw.wait_take, ticks);
        sched.current = previous;
    }

    #[test]
    fn test_recursive_lock_nests() {
        let mut sched = boxed_scheduler();
        let t = spawn(&mut sched, 3, "holder");
        sched.running = true;
        let mut m = boxed_mutex();

        assert!(m.lock_inner(&mut sched, 0).is_ok());
        assert_eq!(m.holder(), t.0);

        // Locking twice does not block.
        assert!(m.lock_inner(&mut sched, 0).is_ok());
        assert_eq!(m.depth, 2);

        // One unlock is not enough to release.
        assert!(m.unlock_inner(&mut sched).is_ok());
        assert_eq!(m.holder(), t.0);
        assert_eq!(m.raw.count, 0);

        // The matching second unlock releases.
        assert!(m.unlock_inner(&mut sched).is_ok());
        assert!(m.holder().is_null());
        assert_eq!(m.raw.count, 1);
        unsafe {
            assert_eq!((*t.0).mutexes_held, 0);
        }
    }

    #[test]
    fn test_contended_zero_wait_lock_fails() {
        let mut sched = boxed_scheduler();
        let holder = spawn(&mut sched, 2, "holder");
        let other = spawn(&mut sched, 4, "other");
        sched.running = true;

        let mut m = boxed_mutex();
        sched.current = holder.0;
        assert!(m.lock_inner(&mut sched, 0).is_ok());

        sched.current = other.0;
        assert_eq!(m.lock_inner(&mut sched, 0), Err(Error::Timeout));
        assert_eq!(m.holder(), holder.0);
    }

    #[test]
    fn test_unlock_by_non_holder_is_refused() {
        let mut sched = boxed_scheduler();
        let holder = spawn(&mut sched, 2, "holder");
        let other = spawn(&mut sched, 4, "other");
        sched.running = true;

        let mut m = boxed_mutex();
        sched.current = holder.0;
        assert!(m.lock_inner(&mut sched, 0).is_ok());

        sched.current = other.0;
        assert_eq!(m.unlock_inner(&mut sched), Err(Error::NotOwner));
        assert_eq!(m.holder(), holder.0);
    }

    #[test]
    fn test_unlock_wakes_highest_priority_waiter() {
        let mut sched = boxed_scheduler();
        let holder = spawn(&mut sched, 2, "holder");
        let w3 = spawn(&mut sched, 3, "w3");
        let w6 = spawn(&mut sched, 6, "w6");
        sched.running = true;

        let mut m = boxed_mutex();
        sched.current = holder.0;
        assert!(m.lock_inner(&mut sched, 0).is_ok());

        block_waiter(&mut sched, &mut m, w3, 100);
        block_waiter(&mut sched, &mut m, w6, 100);
        sched.current = holder.0;

        assert!(m.unlock_inner(&mut sched).is_ok());
        assert_eq!(sched.task_state(w6), TaskState::Ready);
        assert_eq!(sched.task_state(w3), TaskState::Blocked);
        assert_eq!(m.raw.count, 1);
    }

    #[test]
    fn test_unlock_restores_inherited_priority() {
        let mut sched = boxed_scheduler();
        let holder = spawn(&mut sched, 2, "holder");
        let waiter = spawn(&mut sched, 6, "waiter");
        sched.running = true;

        let mut m = boxed_mutex();
        sched.current = holder.0;
        assert!(m.lock_inner(&mut sched, 0).is_ok());

        // The priority-6 waiter boosts the holder on its way into the
        // wait list.
        sched.current = waiter.0;
        {
            let _guard = IntGuard::new();
            assert!(sched.priority_inherit(m.holder));
        }
        block_waiter(&mut sched, &mut m, waiter, 100);
        unsafe {
            assert_eq!((*holder.0).priority, 6);
        }

        // Unlock: waiter woken, holder back at its base priority.
        sched.current = holder.0;
        assert!(m.unlock_inner(&mut sched).is_ok());
        unsafe {
            assert_eq!((*holder.0).priority, 2);
            assert_eq!((*holder.0).base_priority, 2);
        }
        assert_eq!(sched.task_state(waiter), TaskState::Ready);
    }

    #[test]
    fn test_highest_waiting_priority_tracks_wait_list() {
        let mut sched = boxed_scheduler();
        let holder = spawn(&mut sched, 2, "holder");
        let w4 = spawn(&mut sched, 4, "w4");
        let w5 = spawn(&mut sched, 5, "w5");
        sched.running = true;

        let mut m = boxed_mutex();
        sched.current = holder.0;
        assert!(m.lock_inner(&mut sched, 0).is_ok());

        assert_eq!(m.highest_waiting_priority(), LOWEST_PRIORITY);
        block_waiter(&mut sched, &mut m, w4, 100);
        assert_eq!(m.highest_waiting_priority(), 4);
        block_waiter(&mut sched, &mut m, w5, 100);
        assert_eq!(m.highest_waiting_priority(), 5);
    }

    #[test]
    fn test_timed_out_waiter_partially_disinherits() {
        let mut sched = boxed_scheduler();
        let holder = spawn(&mut sched, 2, "holder");
        let w6 = spawn(&mut sched, 6, "w6");
        let w4 = spawn(&mut sched, 4, "w4");
        sched.running = true;

        let mut m = boxed_mutex();
        sched.current = holder.0;
        assert!(m.lock_inner(&mut sched, 0).is_ok());

        // Priority-6 waiter boosts the holder, then a priority-4 waiter
        // queues behind it.
        sched.current = w6.0;
        {
            let _guard = IntGuard::new();
            sched.priority_inherit(m.holder);
        }
        block_waiter(&mut sched, &mut m, w4, 100);
        unsafe {
            assert_eq!((*holder.0).priority, 6);
        }

        // The priority-6 waiter times out: the holder drops only to the
        // remaining waiter's priority, not to its base.
        {
            let _guard = IntGuard::new();
            let highest = m.highest_waiting_priority();
            sched.priority_disinherit_after_timeout(m.holder, highest);
        }
        unsafe {
            assert_eq!((*holder.0).priority, 4);
            assert_eq!((*holder.0).base_priority, 2);
        }
    }
}
