//! # Architecture Abstraction Layer
//!
//! Hardware boundary consumed by the kernel core. The core never assumes a
//! particular register set — only that a context switch is atomic with
//! respect to the switched task's view of its own stack, and that the
//! interrupt mask nests via opaque tokens.
//!
//! Two ports are provided:
//!
//! - [`cortex_m4`] — PendSV/SysTick based switching on ARM Cortex-M,
//!   selected when building for a bare-metal ARM target.
//! - [`hosted`] — a test double used everywhere else. It records
//!   mask/unmask nesting and context-switch requests in atomics so the
//!   kernel's logic can be driven and observed from host unit tests.
//!
//! The interface every port implements:
//!
//! | Function | Contract |
//! |----------|----------|
//! | `int_mask() -> usize` | Disable interrupts; return an opaque token for the previous state. Nestable. |
//! | `int_unmask(token)` | Restore the state captured by the matching `int_mask`. |
//! | `is_inside_isr() -> bool` | True when executing in interrupt context. |
//! | `request_context_switch()` | Pend a context switch; performed at the next opportunity. |
//! | `request_context_switch_from_isr(needed)` | ISR flavor; a no-op when `needed` is false. |
//! | `initialize_stack(top, entry, arg) -> new_top` | Seed a fresh task stack with an initial frame. |
//! | `start_first_task() -> !` | Launch the first task. Never returns. |
//! | `fatal_halt() -> !` | Unrecoverable error (stack overflow, no idle task). Never returns. |

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub mod hosted;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use cortex_m4::{
    fatal_halt, initialize_stack, int_mask, int_unmask, is_inside_isr, request_context_switch,
    request_context_switch_from_isr, start_first_task,
};

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub use hosted::{
    fatal_halt, initialize_stack, int_mask, int_unmask, is_inside_isr, request_context_switch,
    request_context_switch_from_isr, start_first_task,
};

/// Signature of a task entry function. The argument is the pointer passed
/// to `create_task`; the function must never return.
pub type TaskEntry = extern "C" fn(*mut core::ffi::c_void);
