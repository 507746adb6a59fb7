//! # Cortex-M Port Layer
//!
//! Hardware-specific code for ARM Cortex-M (Thumb-2) processors.
//! Implements context switching via PendSV, SysTick timer configuration,
//! and the nestable interrupt mask.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M uses a split-stack model:
//! - **MSP** (Main Stack Pointer): used by the kernel and interrupt handlers
//! - **PSP** (Process Stack Pointer): used by tasks in Thread mode
//!
//! On exception entry the hardware automatically stacks R0–R3, R12, LR, PC,
//! and xPSR onto the process stack. The PendSV handler saves and restores
//! R4–R11 around that frame, storing the resulting PSP in the outgoing
//! task's control block (the saved stack pointer is the TCB's first
//! member, so the handler indexes it at offset 0).
//!
//! ## Interrupt Priorities
//!
//! SysTick and PendSV both run at the lowest priority (0xFF) so that a
//! context switch never preempts another ISR and the tick never interferes
//! with higher-priority interrupts.

use core::arch::asm;
use core::ffi::c_void;

use cortex_m::peripheral::syst::SystClkSource;

use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};

// ---------------------------------------------------------------------------
// Interrupt masking
// ---------------------------------------------------------------------------

/// Disable interrupts via PRIMASK and return the previous state as an
/// opaque token. Nests: only the outermost `int_unmask` re-enables.
#[inline]
pub fn int_mask() -> usize {
    let was_active = cortex_m::register::primask::read().is_active();
    cortex_m::interrupt::disable();
    was_active as usize
}

/// Restore the interrupt state captured by the matching [`int_mask`].
#[inline]
pub fn int_unmask(token: usize) {
    if token != 0 {
        unsafe { cortex_m::interrupt::enable() };
    }
}

/// True when the CPU is servicing an exception (VECTACTIVE != 0).
#[inline]
pub fn is_inside_isr() -> bool {
    !matches!(
        cortex_m::peripheral::SCB::vect_active(),
        cortex_m::peripheral::scb::VectActive::ThreadMode
    )
}

// ---------------------------------------------------------------------------
// Context switch requests
// ---------------------------------------------------------------------------

/// Pend a PendSV exception to perform a context switch.
///
/// PendSV fires at the lowest priority, so the switch happens only once no
/// other ISR is active. Sets PENDSVSET in the Interrupt Control and State
/// Register.
#[inline]
pub fn request_context_switch() {
    const ICSR: *mut u32 = 0xE000_ED04 as *mut u32;
    unsafe {
        core::ptr::write_volatile(ICSR, 1 << 28);
    }
}

/// ISR flavor of [`request_context_switch`]; no-op when `needed` is false.
#[inline]
pub fn request_context_switch_from_isr(needed: bool) {
    if needed {
        request_context_switch();
    }
}

// ---------------------------------------------------------------------------
// Fatal halt
// ---------------------------------------------------------------------------

/// Unrecoverable kernel error (stack overflow detected at switch time, or
/// no idle task at start). Masks interrupts and spins.
pub fn fatal_halt() -> ! {
    cortex_m::interrupt::disable();
    loop {
        cortex_m::asm::nop();
    }
}

// ---------------------------------------------------------------------------
// Stack initialization
// ---------------------------------------------------------------------------

/// Seed a fresh task stack with the frame PendSV expects to restore.
///
/// ## Stack Layout (top = high address, growing down)
///
/// ```text
/// [Hardware stacked frame]   <- PSP after the software frame is popped
///   xPSR  (Thumb bit set)
///   PC    (task entry point)
///   LR    (task_exit_error)
///   R12   (0)
///   R3    (0)
///   R2    (0)
///   R1    (0)
///   R0    (task argument)
/// [Software saved context]
///   R11..R4 (0)              <- returned stack pointer
/// ```
///
/// # Safety
///
/// `top` must point one-past-the-end of a writable stack region at least
/// 16 words deep, 8-byte aligned per AAPCS.
pub unsafe fn initialize_stack(
    top: *mut usize,
    entry: super::TaskEntry,
    arg: *mut c_void,
) -> *mut usize {
    // Align down to 8 bytes (AAPCS requirement).
    let aligned_top = ((top as usize) & !0x07) as *mut usize;

    // 8 hardware-stacked words + 8 software-saved words.
    let frame = aligned_top.sub(16);

    // Software-saved registers R4–R11.
    for i in 0..8 {
        frame.add(i).write(0);
    }

    // Hardware-stacked frame.
    frame.add(8).write(arg as usize); // R0 — task argument
    frame.add(9).write(0); // R1
    frame.add(10).write(0); // R2
    frame.add(11).write(0); // R3
    frame.add(12).write(0); // R12
    frame.add(13).write(task_exit_error as usize); // LR
    frame.add(14).write(entry as usize); // PC
    frame.add(15).write(0x0100_0000); // xPSR — Thumb bit

    frame
}

/// Landing pad for tasks that return from their entry function. Task
/// entries must not return; reaching this is a programming error.
extern "C" fn task_exit_error() -> ! {
    fatal_halt();
}

// ---------------------------------------------------------------------------
// Timer setup and first task launch
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `TICK_HZ` using the processor clock.
fn configure_systick(syst: &mut cortex_m::peripheral::SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Set PendSV and SysTick to the lowest interrupt priority so context
/// switches never preempt application ISRs.
fn set_handler_priorities() {
    unsafe {
        // SHPR3: bits [23:16] = PendSV priority, [31:24] = SysTick priority.
        let shpr3: *mut u32 = 0xE000_ED20 as *mut u32;
        let val = core::ptr::read_volatile(shpr3) | (0xFF << 16) | (0xFF << 24);
        core::ptr::write_volatile(shpr3, val);
    }
}

/// Start the tick source and launch the first task. **Never returns.**
///
/// Switches Thread mode to the PSP, unstacks the first task's initial
/// frame by hand and branches to its entry point with interrupts enabled.
///
/// # Safety
///
/// The kernel must have elected a current task whose stack was prepared by
/// [`initialize_stack`]. Must be called exactly once, from Thread mode.
pub unsafe fn start_first_task() -> ! {
    let mut peripherals = cortex_m::Peripherals::steal();
    configure_systick(&mut peripherals.SYST);
    set_handler_priorities();

    let psp = crate::kernel::first_task_stack();

    asm!(
        // Point PSP past the software-saved R4-R11 (8 words).
        "adds r0, #32",
        "msr psp, r0",

        // Thread mode uses PSP from here on (CONTROL.SPSEL = 1).
        "movs r0, #2",
        "msr control, r0",
        "isb",

        // Unstack the hardware frame by hand — this is not a real
        // exception return.
        "pop {{r0-r3, r12}}",
        "pop {{r4}}", // LR slot (task_exit_error; entries never return)
        "pop {{r5}}", // PC — task entry point
        "pop {{r6}}", // xPSR (discarded)

        "cpsie i",
        "bx r5",

        in("r0") psp,
        options(noreturn)
    );
}

// ---------------------------------------------------------------------------
// Exception handlers
// ---------------------------------------------------------------------------

/// PendSV exception handler — performs the context switch.
///
/// 1. Push R4–R11 onto the outgoing task's process stack
/// 2. Store the resulting PSP into the outgoing TCB (offset 0)
/// 3. Let the scheduler pick the next task
/// 4. Load the incoming TCB's saved stack pointer
/// 5. Pop R4–R11 and return; hardware restores the rest
///
/// # Safety
///
/// Invoked by the NVIC only; follows the Cortex-M exception conventions.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    core::arch::naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",
        "bl {save}",   // save_task_context(psp)
        "bl {pick}",   // returns the next task's saved SP in r0
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",
        "ldr r0, =0xFFFFFFFD",
        "bx r0",
        save = sym save_task_context,
        pick = sym pick_next_context,
    );
}

/// Store the outgoing task's stack pointer. Called from PendSV with
/// interrupts implicitly serialized by exception priority.
#[no_mangle]
unsafe extern "C" fn save_task_context(psp: *mut usize) {
    crate::kernel::save_current_stack(psp);
}

/// Run the scheduling decision and return the incoming task's saved stack
/// pointer. Called from PendSV.
#[no_mangle]
unsafe extern "C" fn pick_next_context() -> *mut usize {
    crate::kernel::switch_context();
    crate::kernel::first_task_stack()
}

/// SysTick exception handler — the kernel tick entry point.
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    crate::kernel::tick_isr();
}
