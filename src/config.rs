//! # StratOS Configuration
//!
//! Compile-time constants governing the kernel. All limits are fixed at
//! compile time — the kernel allocates task stacks and control blocks at
//! creation time, but never resizes these tables.

/// Number of distinct task priorities. Priority 0 is the lowest (the idle
/// task runs there); `MAX_PRIORITIES - 1` is the highest. Must not exceed
/// 64 — the scheduler tracks readiness in a single `u64` bitmap.
pub const MAX_PRIORITIES: usize = 8;

/// Lowest task priority. Reserved for the idle task, but application
/// tasks may share it.
pub const LOWEST_PRIORITY: usize = 0;

/// SysTick frequency in Hz. Determines scheduler tick granularity.
/// Higher values give finer sleep/timeout precision at the cost of
/// increased interrupt overhead.
pub const TICK_HZ: u32 = 1000;

/// Minimum task stack depth in words. Applies to the idle task and is the
/// floor for application stacks; `create_task` rounds smaller requests up.
pub const MIN_STACK_WORDS: usize = 64;

/// Maximum stored length of a task name, including the terminator slot.
/// Longer names are truncated.
pub const NAME_LEN: usize = 10;

/// The tick value meaning "wait forever". Doubles as the sentinel sort key
/// of every list (the sentinel item must order after all real keys), so it
/// must be the maximum representable tick value.
pub const TICK_FOREVER: u32 = u32::MAX;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
/// Used by the Cortex-M port to derive the SysTick reload value.
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

// Feature switches (Cargo features, not constants):
//
// - `time-slice`: equal-priority tasks are rotated on every tick on which
//   more than one of them is ready.
// - `delete`: task/object deletion and the allocator's free path are
//   compiled in. Without it the kernel never releases memory.
