//! # Kernel Instrumentation Hooks
//!
//! Empty `#[inline]` functions called from the scheduler and resource
//! paths at the points a tracer or logic analyzer shim would want to
//! observe. They compile to nothing; a debugging build can fill any of
//! them in (breakpoint, GPIO toggle, ITM write) without touching kernel
//! code.

use crate::task::Tcb;

/// A task was created and inserted into its ready list.
#[inline(always)]
pub fn task_created(_tcb: *const Tcb) {}

/// The scheduler selected a new running task.
#[inline(always)]
pub fn task_switched_in(_tcb: *const Tcb) {}

/// The running task moved to a delay or suspended list.
#[inline(always)]
pub fn task_blocked(_tcb: *const Tcb) {}

/// A task was moved back to its ready list.
#[inline(always)]
pub fn task_readied(_tcb: *const Tcb) {}

/// The tick counter advanced.
#[inline(always)]
pub fn tick(_now: u32) {}

/// An interrupt-context wake was deferred into a resource's credit
/// counter because a slow path held the resource locked.
#[inline(always)]
pub fn wake_deferred() {}
