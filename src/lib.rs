//! # StratOS — a stratified-priority RTOS kernel
//!
//! A preemptive, priority-based real-time kernel for resource-constrained
//! microcontrollers: tick-driven timing, per-priority round-robin
//! scheduling, and a family of blocking synchronization primitives
//! (counting semaphore, recursive priority-inheriting mutex, message
//! queue) built on one shared wait/wake protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Application Tasks                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                 Kernel API (kernel.rs)                      │
//! │   init() · create_task() · start() · sleep() · signals      │
//! ├───────────────┬─────────────────────┬───────────────────────┤
//! │  Scheduler    │  Blocking resources │  Critical sections    │
//! │  scheduler.rs │  resource.rs        │  sync.rs              │
//! │  ─ ticks      │  semaphore.rs       │  ─ IntGuard           │
//! │  ─ readiness  │  mutex.rs           │  ─ critical()         │
//! │  ─ sched lock │  msgq.rs            │                       │
//! ├───────────────┴─────────────────────┴───────────────────────┤
//! │        Task Model (task.rs) · Intrusive List (list.rs)      │
//! │     TCB · state machine · wait lists · inheritance          │
//! ├─────────────────────────────────────────────────────────────┤
//! │     Allocator boundary (mem.rs) · Port layer (arch/)        │
//! │     size-tagged blocks   · PendSV/SysTick · hosted double   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Scheduling Model
//!
//! - Fixed priorities 0..`MAX_PRIORITIES` (0 = lowest, idle). The highest
//!   non-empty ready list runs; equal-priority tasks round-robin through
//!   an intrusive list cursor, rotated by the tick when time-slicing is
//!   enabled.
//! - Two execution contexts touch kernel state: task context (may block)
//!   and interrupt context (never blocks — `*_from_isr` variants fail
//!   fast or defer their wakeups through per-resource credit counters).
//! - All shared state is protected by short, bounded interrupt-masked
//!   sections; multi-step sequences are protected by the nestable
//!   schedule lock, which defers — never loses — concurrent wakeups.
//! - Tick wraparound is handled with paired delay lists swapped at each
//!   overflow, so a 32-bit tick counter never misses or duplicates a
//!   wake.
//!
//! ## Memory Model
//!
//! - `#![no_std]`; task control blocks, stacks and kernel objects are
//!   allocated through the [`mem`] boundary, backed by the application's
//!   `#[global_allocator]`.
//! - Nothing is freed unless the `delete` feature is enabled; a task that
//!   deletes itself is recycled by the idle task.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod arch;
pub mod config;
pub mod kernel;
pub mod list;
pub mod mem;
pub mod msgq;
pub mod mutex;
mod resource;
pub mod scheduler;
pub mod semaphore;
pub mod sync;
pub mod task;
pub mod trace;

pub use config::{MAX_PRIORITIES, TICK_FOREVER, TICK_HZ};
pub use kernel::Error;
pub use msgq::QueueHandle;
pub use mutex::MutexHandle;
pub use scheduler::SchedulerState;
pub use semaphore::SemaphoreHandle;
pub use task::{TaskHandle, TaskState};
