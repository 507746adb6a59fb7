//! # Hosted Port Layer
//!
//! Test double used when the crate is built for anything other than a
//! bare-metal ARM target — most importantly for host-run unit tests.
//!
//! There is no real interrupt controller or context switch here. The port
//! records mask nesting and switch requests in atomics so tests can drive
//! the scheduler's bookkeeping directly and assert on the requests the
//! kernel would have made of the hardware.

use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Current mask nesting depth. Zero means "interrupts enabled".
static MASK_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// Sticky flag: a context switch was requested since the last
/// [`take_context_switch_request`].
static SWITCH_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Mask "interrupts". Returns the previous nesting depth as the token.
#[inline]
pub fn int_mask() -> usize {
    MASK_DEPTH.fetch_add(1, Ordering::SeqCst)
}

/// Balance the matching [`int_mask`]. The token is accepted for interface
/// parity but the hosted port tracks a plain depth counter, which keeps
/// the double well-behaved when the test harness runs threads in parallel.
#[inline]
pub fn int_unmask(_token: usize) {
    let prev = MASK_DEPTH.fetch_sub(1, Ordering::SeqCst);
    debug_assert!(prev > 0, "unbalanced int_unmask");
}

/// The hosted port has no interrupt context.
#[inline]
pub fn is_inside_isr() -> bool {
    false
}

/// Record that the kernel wanted a context switch.
#[inline]
pub fn request_context_switch() {
    SWITCH_REQUESTED.store(true, Ordering::SeqCst);
}

/// ISR flavor of [`request_context_switch`]; no-op when `needed` is false.
#[inline]
pub fn request_context_switch_from_isr(needed: bool) {
    if needed {
        request_context_switch();
    }
}

/// Consume and return the pending switch-request flag. Test observability
/// hook; the embedded ports have no equivalent.
pub fn take_context_switch_request() -> bool {
    SWITCH_REQUESTED.swap(false, Ordering::SeqCst)
}

/// Current mask nesting depth. Test observability hook.
pub fn mask_depth() -> usize {
    MASK_DEPTH.load(Ordering::SeqCst)
}

/// Seed a fresh task stack. The hosted port never executes task code, but
/// it reserves the same 16-word frame as the real ports so stack-bounds
/// arithmetic behaves identically.
///
/// # Safety
///
/// `top` must point one-past-the-end of a writable stack region at least
/// 16 words deep.
pub unsafe fn initialize_stack(
    top: *mut usize,
    entry: super::TaskEntry,
    arg: *mut c_void,
) -> *mut usize {
    let aligned_top = ((top as usize) & !0x07) as *mut usize;
    let frame = aligned_top.sub(16);
    for i in 0..14 {
        frame.add(i).write(0);
    }
    frame.add(8).write(arg as usize);
    frame.add(14).write(entry as usize);
    frame.add(15).write(0x0100_0000);
    frame
}

/// The hosted port cannot run tasks; reaching this is a harness bug.
pub unsafe fn start_first_task() -> ! {
    panic!("start_first_task is not available on the hosted port");
}

/// Unrecoverable kernel error. The hosted port traps via panic so tests
/// fail loudly instead of hanging.
pub fn fatal_halt() -> ! {
    panic!("kernel fatal halt");
}
