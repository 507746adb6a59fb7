//! # Message Queue
//!
//! A fixed-capacity ring buffer of `Copy` elements over the generic
//! blocking-resource protocol. Senders block while the queue is full,
//! receivers while it is empty; `overwrite` never blocks and displaces
//! the front element instead (its intended use is a length-1 mailbox
//! carrying "latest value wins" state).
//!
//! The ring is read one slot behind the next message: `read_from` is
//! advanced *before* each read, which lets send-to-front simply write at
//! `read_from` and step it backwards. Interrupt-context variants mirror
//! the task-context operations but never block, banking their wakeups in
//! the resource's credit counters while a slow path holds the queue
//! locked.

use crate::arch;
use crate::kernel::{self, Error};
use crate::mem as kmem;
use crate::resource::{BlockOutcome, RawResource, Side};
use crate::scheduler::{Scheduler, SchedulerState, Timeout};
use crate::sync::IntGuard;

/// Where a send places its element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendPosition {
    Back,
    Front,
    Overwrite,
}

/// Queue control block plus ring storage. Allocated by [`create`];
/// referenced through [`QueueHandle`].
pub struct Queue<T: Copy> {
    raw: RawResource,

    /// Ring storage, `capacity` elements.
    storage: *mut T,
    capacity: usize,

    /// Next slot a send-to-back writes.
    write_to: usize,
    /// One slot *behind* the next message; advanced before each read.
    read_from: usize,
}

impl<T: Copy> Queue<T> {
    pub(crate) fn init(&mut self) {
        self.raw.init();
        self.reset_ring();
    }

    fn reset_ring(&mut self) {
        self.raw.count = 0;
        self.write_to = 0;
        self.read_from = self.capacity - 1;
    }

    /// Copy an element into the ring. Caller holds the interrupt mask and
    /// has checked for space (except for `Overwrite`).
    fn copy_in(&mut self, item: &T, position: SendPosition) {
        let mut count = self.raw.count;
        unsafe {
            match position {
                SendPosition::Back => {
                    self.storage.add(self.write_to).write(*item);
                    self.write_to = (self.write_to + 1) % self.capacity;
                }
                SendPosition::Front | SendPosition::Overwrite => {
                    self.storage.add(self.read_from).write(*item);
                    self.read_from = (self.read_from + self.capacity - 1) % self.capacity;

                    if position == SendPosition::Overwrite && count > 0 {
                        // The displaced element is simply forgotten.
                        count -= 1;
                    }
                }
            }
        }
        self.raw.count = count + 1;
    }

    /// Copy the front element out of the ring. Caller holds the interrupt
    /// mask and has checked `count > 0`.
    fn copy_out(&mut self, out: &mut T) {
        self.read_from = (self.read_from + 1) % self.capacity;
        unsafe {
            *out = self.storage.add(self.read_from).read();
        }
    }

    /// Messages currently queued, read under the mask.
    pub(crate) fn len(&self) -> usize {
        let _guard = IntGuard::new();
        self.raw.count
    }

    /// Free slots remaining, read under the mask.
    pub(crate) fn space(&self) -> usize {
        let _guard = IntGuard::new();
        self.raw.max - self.raw.count
    }

    fn send_inner(
        &mut self,
        sched: &mut Scheduler,
        item: &T,
        mut ticks: u32,
        position: SendPosition,
    ) -> Result<(), Error> {
        let mut timeout = Timeout::new();
        let mut entry_recorded = false;

        loop {
            {
                let _guard = IntGuard::new();

                if self.raw.count < self.raw.max || position == SendPosition::Overwrite {
                    self.copy_in(item, position);

                    if !self.raw.wait_take.is_empty()
                        && sched.event_wake_highest(&mut self.raw.wait_take)
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
                .block_or_retry(sched, Side::Post, &mut timeout, &mut ticks, |_| {})
            {
                BlockOutcome::TimedOut => return Err(Error::Timeout),
                BlockOutcome::Blocked | BlockOutcome::Retry => {}
            }
        }
    }

    fn receive_inner(
        &mut self,
        sched: &mut Scheduler,
        out: &mut T,
        mut ticks: u32,
        peeking: bool,
    ) -> Result<(), Error> {
        let mut timeout = Timeout::new();
        let mut entry_recorded = false;

        loop {
            {
                let _guard = IntGuard::new();

                if self.raw.count > 0 {
                    if peeking {
                        // Non-destructive: put the read cursor back and
                        // let the next reader have the same element.
                        let read_position = self.read_from;
                        self.copy_out(out);
                        self.read_from = read_position;

                        if !self.raw.wait_take.is_empty()
                            && sched.event_wake_highest(&mut self.raw.wait_take)
                        {
                            arch::request_context_switch();
                        }
                    } else {
                        self.copy_out(out);
                        self.raw.count -= 1;

                        // A sender may be blocked on the slot this receive
                        // just freed.
                        if !self.raw.wait_post.is_empty()
                            && sched.event_wake_highest(&mut self.raw.wait_post)
                        {
                            arch::request_context_switch();
                        }
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

    fn send_from_isr_inner(
        &mut self,
        sched: &mut Scheduler,
        item: &T,
        position: SendPosition,
    ) -> Result<(), Error> {
        let result;
        let mut need_switch = false;

        {
            let _guard = IntGuard::new();

            if self.raw.count < self.raw.max || position == SendPosition::Overwrite {
                self.copy_in(item, position);
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

    fn receive_from_isr_inner(&mut self, sched: &mut Scheduler, out: &mut T) -> Result<(), Error> {
        let result;
        let mut need_switch = false;

        {
            let _guard = IntGuard::new();

            if self.raw.count > 0 {
                self.copy_out(out);
                self.raw.count -= 1;
                need_switch = self.raw.take_wake_from_isr(sched);
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

    fn peek_from_isr_inner(&mut self, out: &mut T) -> Result<(), Error> {
        let _guard = IntGuard::new();

        if self.raw.count > 0 {
            let read_position = self.read_from;
            self.copy_out(out);
            self.read_from = read_position;
            Ok(())
        } else {
            Err(Error::Timeout)
        }
    }

    /// Drop all queued messages and unlock the counters. A sender blocked
    /// on a full queue is woken — its slot exists again.
    pub(crate) fn reset_inner(&mut self, sched: &mut Scheduler) {
        let _guard = IntGuard::new();

        self.reset_ring();
        self.raw.post_lock = crate::resource::LOCK_UNLOCKED;
        self.raw.take_lock = crate::resource::LOCK_UNLOCKED;

        if !self.raw.wait_post.is_empty() && sched.event_wake_highest(&mut self.raw.wait_post) {
            arch::request_context_switch();
        }
    }
}

/// Opaque queue reference. Copyable; identity is the control block.
pub struct QueueHandle<T: Copy>(pub(crate) *mut Queue<T>);

impl<T: Copy> Clone for QueueHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: Copy> Copy for QueueHandle<T> {}

unsafe impl<T: Copy> Send for QueueHandle<T> {}

/// Create a queue holding up to `capacity` elements of `T`.
pub fn create<T: Copy>(capacity: usize) -> Result<QueueHandle<T>, Error> {
    if capacity == 0 {
        return Err(Error::OutOfMemory);
    }

    let storage_layout =
        core::alloc::Layout::array::<T>(capacity).map_err(|_| Error::OutOfMemory)?;
    let storage = kmem::allocate_layout(storage_layout)
        .ok_or(Error::OutOfMemory)?
        .as_ptr() as *mut T;

    let queue = match kmem::allocate(core::mem::size_of::<Queue<T>>()) {
        Some(p) => p.as_ptr() as *mut Queue<T>,
        None => {
            #[cfg(feature = "delete")]
            unsafe {
                kmem::deallocate(core::ptr::NonNull::new_unchecked(storage as *mut u8));
            }
            return Err(Error::OutOfMemory);
        }
    };

    unsafe {
        core::ptr::write(
            queue,
            Queue {
                raw: RawResource::new(capacity, 0),
                storage,
                capacity,
                write_to: 0,
                read_from: capacity - 1,
            },
        );
        (*queue).init();
    }
    Ok(QueueHandle(queue))
}

/// Delete a queue and its storage. No task may be blocked on it.
#[cfg(feature = "delete")]
pub fn delete<T: Copy>(handle: QueueHandle<T>) {
    unsafe {
        kmem::deallocate(core::ptr::NonNull::new_unchecked(
            (*handle.0).storage as *mut u8,
        ));
        kmem::deallocate(core::ptr::NonNull::new_unchecked(handle.0 as *mut u8));
    }
}

impl<T: Copy> QueueHandle<T> {
    /// Append an element, blocking up to `ticks` while the queue is full.
    pub fn send(&self, item: &T, ticks: u32) -> Result<(), Error> {
        unsafe { (*self.0).send_inner(&mut *kernel::sched_ptr(), item, ticks, SendPosition::Back) }
    }

    /// Prepend an element (it becomes the next received), blocking up to
    /// `ticks` while the queue is full.
    pub fn send_front(&self, item: &T, ticks: u32) -> Result<(), Error> {
        unsafe { (*self.0).send_inner(&mut *kernel::sched_ptr(), item, ticks, SendPosition::Front) }
    }

    /// Write the front element, displacing it when the queue is full.
    /// Never blocks.
    pub fn overwrite(&self, item: &T) -> Result<(), Error> {
        unsafe { (*self.0).send_inner(&mut *kernel::sched_ptr(), item, 0, SendPosition::Overwrite) }
    }

    /// Remove and return the front element, blocking up to `ticks` while
    /// the queue is empty.
    pub fn receive(&self, out: &mut T, ticks: u32) -> Result<(), Error> {
        unsafe { (*self.0).receive_inner(&mut *kernel::sched_ptr(), out, ticks, false) }
    }

    /// Read the front element without removing it, blocking up to `ticks`
    /// while the queue is empty.
    pub fn peek(&self, out: &mut T, ticks: u32) -> Result<(), Error> {
        unsafe { (*self.0).receive_inner(&mut *kernel::sched_ptr(), out, ticks, true) }
    }

    /// Interrupt-context send. Never blocks.
    pub fn send_from_isr(&self, item: &T) -> Result<(), Error> {
        unsafe { (*self.0).send_from_isr_inner(&mut *kernel::sched_ptr(), item, SendPosition::Back) }
    }

    /// Interrupt-context send-to-front. Never blocks.
    pub fn send_front_from_isr(&self, item: &T) -> Result<(), Error> {
        unsafe {
            (*self.0).send_from_isr_inner(&mut *kernel::sched_ptr(), item, SendPosition::Front)
        }
    }

    /// Interrupt-context overwrite. Never blocks.
    pub fn overwrite_from_isr(&self, item: &T) -> Result<(), Error> {
        unsafe {
            (*self.0).send_from_isr_inner(&mut *kernel::sched_ptr(), item, SendPosition::Overwrite)
        }
    }

    /// Interrupt-context receive. Never blocks.
    pub fn receive_from_isr(&self, out: &mut T) -> Result<(), Error> {
        unsafe { (*self.0).receive_from_isr_inner(&mut *kernel::sched_ptr(), out) }
    }

    /// Interrupt-context peek. Never blocks.
    pub fn peek_from_isr(&self, out: &mut T) -> Result<(), Error> {
        unsafe { (*self.0).peek_from_isr_inner(out) }
    }

    /// Messages currently queued.
    pub fn len(&self) -> usize {
        unsafe { (*self.0).len() }
    }

    /// True when no messages are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free slots remaining.
    pub fn space(&self) -> usize {
        unsafe { (*self.0).space() }
    }

    /// Drop all queued messages.
    pub fn reset(&self) {
        unsafe { (*self.0).reset_inner(&mut *kernel::sched_ptr()) }
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
    use std::vec::Vec;

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

    fn boxed_queue<T: Copy + Default>(capacity: usize) -> Box<Queue<T>> {
        let mut storage = Vec::with_capacity(capacity);
        storage.resize(capacity, T::default());
        let storage = Box::leak(storage.into_boxed_slice()).as_mut_ptr();

        let mut q = Box::new(Queue {
            raw: RawResource::new(capacity, 0),
            storage,
            capacity,
            write_to: 0,
            read_from: capacity - 1,
        });
        q.init();
        q
    }

    #[test]
    fn test_fifo_order() {
        let mut sched = boxed_scheduler();
        let _main = spawn(&mut sched, 4, "main");
        sched.running = true;
        let mut q = boxed_queue::<u32>(3);

        for v in [10, 20, 30] {
            assert!(q.send_inner(&mut sched, &v, 0, SendPosition::Back).is_ok());
        }

        let mut out = 0u32;
        for expect in [10, 20, 30] {
            assert!(q.receive_inner(&mut sched, &mut out, 0, false).is_ok());
            assert_eq!(out, expect);
        }
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_ring_wraps_across_many_cycles() {
        let mut sched = boxed_scheduler();
        let _main = spawn(&mut sched, 4, "main");
        sched.running = true;
        let mut q = boxed_queue::<u32>(2);

        let mut out = 0u32;
        for v in 0..10u32 {
            assert!(q.send_inner(&mut sched, &v, 0, SendPosition::Back).is_ok());
            assert!(q.receive_inner(&mut sched, &mut out, 0, false).is_ok());
            assert_eq!(out, v);
        }
    }

    #[test]
    fn test_send_front_jumps_the_line() {
        let mut sched = boxed_scheduler();
        let _main = spawn(&mut sched, 4, "main");
        sched.running = true;
        let mut q = boxed_queue::<u32>(3);

        q.send_inner(&mut sched, &1, 0, SendPosition::Back).unwrap();
        q.send_inner(&mut sched, &2, 0, SendPosition::Back).unwrap();
        q.send_inner(&mut sched, &9, 0, SendPosition::Front).unwrap();

        let mut out = 0u32;
        for expect in [9, 1, 2] {
            q.receive_inner(&mut sched, &mut out, 0, false).unwrap();
            assert_eq!(out, expect);
        }
    }

    #[test]
    fn test_bounds_hold_under_full_and_empty() {
        let mut sched = boxed_scheduler();
        let _main = spawn(&mut sched, 4, "main");
        sched.running = true;
        let mut q = boxed_queue::<u32>(2);

        let mut out = 0u32;
        assert_eq!(
            q.receive_inner(&mut sched, &mut out, 0, false),
            Err(Error::Timeout)
        );

        assert!(q.send_inner(&mut sched, &1, 0, SendPosition::Back).is_ok());
        assert!(q.send_inner(&mut sched, &2, 0, SendPosition::Back).is_ok());
        assert_eq!(
            q.send_inner(&mut sched, &3, 0, SendPosition::Back),
            Err(Error::Timeout)
        );
        assert_eq!(q.len(), 2);
        assert_eq!(q.space(), 0);
    }

    #[test]
    fn test_overwrite_mailbox_keeps_latest() {
        let mut sched = boxed_scheduler();
        let _main = spawn(&mut sched, 4, "main");
        sched.running = true;
        let mut q = boxed_queue::<u32>(1);

        q.send_inner(&mut sched, &1, 0, SendPosition::Overwrite)
            .unwrap();
        // Full, but overwrite never blocks and never over-fills.
        q.send_inner(&mut sched, &2, 0, SendPosition::Overwrite)
            .unwrap();
        assert_eq!(q.len(), 1);

        let mut out = 0u32;
        q.receive_inner(&mut sched, &mut out, 0, false).unwrap();
        assert_eq!(out, 2);
    }

    #[test]
    fn test_peek_is_non_destructive() {
        let mut sched = boxed_scheduler();
        let _main = spawn(&mut sched, 4, "main");
        sched.running = true;
        let mut q = boxed_queue::<u32>(2);

        q.send_inner(&mut sched, &42, 0, SendPosition::Back).unwrap();

        let mut out = 0u32;
        assert!(q.receive_inner(&mut sched, &mut out, 0, true).is_ok());
        assert_eq!(out, 42);
        assert_eq!(q.len(), 1);

        // A real receive still sees the same element.
        out = 0;
        assert!(q.receive_inner(&mut sched, &mut out, 0, false).is_ok());
        assert_eq!(out, 42);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_receive_wakes_blocked_sender() {
        let mut sched = boxed_scheduler();
        let main = spawn(&mut sched, 7, "main");
        let sender = spawn(&mut sched, 3, "sender");
        sched.running = true;
        let mut q = boxed_queue::<u32>(1);

        q.send_inner(&mut sched, &5, 0, SendPosition::Back).unwrap();

        // Park the sender on the post side, as a blocking send would.
        sched.current = sender.0;
        sched.event_wait_add(&mut q.raw.wait_post, 100);
        sched.current = main.0;
        assert_eq!(sched.task_state(sender), TaskState::Blocked);

        let mut out = 0u32;
        q.receive_inner(&mut sched, &mut out, 0, false).unwrap();
        assert_eq!(sched.task_state(sender), TaskState::Ready);
    }

    #[test]
    fn test_isr_send_defers_wake_while_locked() {
        let mut sched = boxed_scheduler();
        let main = spawn(&mut sched, 7, "main");
        let receiver = spawn(&mut sched, 3, "receiver");
        sched.running = true;
        let mut q = boxed_queue::<u32>(2);

        // A receiver waits; a slow path holds the queue locked.
        sched.current = receiver.0;
        sched.event_wait_add(&mut q.raw.wait_take, 100);
        sched.current = main.0;
        q.raw.lock_waits();

        assert!(q
            .send_from_isr_inner(&mut sched, &7, SendPosition::Back)
            .is_ok());
        assert_eq!(sched.task_state(receiver), TaskState::Blocked);

        // Unlock pays the banked wake out exactly once.
        sched.lock();
        q.raw.unlock_waits(&mut sched);
        sched.unlock();
        assert_eq!(sched.task_state(receiver), TaskState::Ready);

        // The message survived the detour.
        let mut out = 0u32;
        sched.current = receiver.0;
        assert!(q.receive_inner(&mut sched, &mut out, 0, false).is_ok());
        assert_eq!(out, 7);
    }

    #[test]
    fn test_isr_receive_and_peek() {
        let mut sched = boxed_scheduler();
        let _main = spawn(&mut sched, 4, "main");
        sched.running = true;
        let mut q = boxed_queue::<u32>(2);

        let mut out = 0u32;
        assert_eq!(q.receive_from_isr_inner(&mut sched, &mut out), Err(Error::Timeout));

        q.send_from_isr_inner(&mut sched, &11, SendPosition::Back)
            .unwrap();
        q.send_from_isr_inner(&mut sched, &12, SendPosition::Back)
            .unwrap();

        assert!(q.peek_from_isr_inner(&mut out).is_ok());
        assert_eq!(out, 11);
        assert_eq!(q.len(), 2);

        assert!(q.receive_from_isr_inner(&mut sched, &mut out).is_ok());
        assert_eq!(out, 11);
        assert!(q.receive_from_isr_inner(&mut sched, &mut out).is_ok());
        assert_eq!(out, 12);
    }

    #[test]
    fn test_reset_empties_and_wakes_sender() {
        let mut sched = boxed_scheduler();
        let main = spawn(&mut sched, 7, "main");
        let sender = spawn(&mut sched, 3, "sender");
        sched.running = true;
        let mut q = boxed_queue::<u32>(1);

        q.send_inner(&mut sched, &1, 0, SendPosition::Back).unwrap();
        sched.current = sender.0;
        sched.event_wait_add(&mut q.raw.wait_post, 100);
        sched.current = main.0;

        q.reset_inner(&mut sched);
        assert_eq!(q.len(), 0);
        assert_eq!(sched.task_state(sender), TaskState::Ready);
    }
}
