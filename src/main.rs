//! # StratOS Example Firmware
//!
//! A small three-task demo wiring the kernel together on a Cortex-M4:
//!
//! | Task | Priority | Behavior |
//! |------|----------|----------|
//! | `producer_task` | 3 | Sends a counter into a queue every 10 ticks |
//! | `consumer_task` | 4 | Blocks on the queue, folds values into a checksum |
//! | `blink_task` | 2 | Wakes on a binary semaphore posted by the producer |
//!
//! The consumer outranks the producer, so every send is consumed
//! immediately — the queue is exercised as a rendezvous, not a buffer.
//! Hooked up to real hardware the loop bodies would poke GPIOs; here they
//! only fold state so the demo stays board-agnostic.

#![cfg_attr(all(target_arch = "arm", target_os = "none"), no_std)]
#![cfg_attr(all(target_arch = "arm", target_os = "none"), no_main)]

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod firmware {
    use core::ffi::c_void;
    use core::sync::atomic::{AtomicU32, Ordering};

    use cortex_m_rt::entry;
    use panic_halt as _;

    use stratos::config::TICK_FOREVER;
    use stratos::kernel;
    use stratos::msgq::{self, QueueHandle};
    use stratos::semaphore::{self, SemaphoreHandle};

    /// Fixed-pool bump heap backing the kernel's allocator boundary.
    /// Everything this demo allocates (TCBs, stacks, kernel objects) is
    /// created before `kernel::start()` and never freed, so a bump
    /// pointer is all the heap it needs.
    mod heap {
        use core::alloc::{GlobalAlloc, Layout};
        use core::cell::UnsafeCell;
        use core::sync::atomic::{AtomicUsize, Ordering};

        const HEAP_BYTES: usize = 8 * 1024;

        #[repr(align(8))]
        struct Pool(UnsafeCell<[u8; HEAP_BYTES]>);
        unsafe impl Sync for Pool {}

        static POOL: Pool = Pool(UnsafeCell::new([0; HEAP_BYTES]));
        static NEXT: AtomicUsize = AtomicUsize::new(0);

        struct BumpHeap;

        unsafe impl GlobalAlloc for BumpHeap {
            unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
                let base = POOL.0.get() as usize;
                let mut offset = NEXT.load(Ordering::Relaxed);
                loop {
                    let start = (base + offset + layout.align() - 1) & !(layout.align() - 1);
                    let end = start + layout.size() - base;
                    if end > HEAP_BYTES {
                        return core::ptr::null_mut();
                    }
                    match NEXT.compare_exchange(
                        offset,
                        end,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => return start as *mut u8,
                        Err(seen) => offset = seen,
                    }
                }
            }

            unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {
                // Bump heaps do not reclaim.
            }
        }

        #[global_allocator]
        static HEAP: BumpHeap = BumpHeap;
    }

    static CHECKSUM: AtomicU32 = AtomicU32::new(0);

    static mut QUEUE: Option<QueueHandle<u32>> = None;
    static mut BLINK_SEM: Option<SemaphoreHandle> = None;

    extern "C" fn producer_task(_arg: *mut c_void) {
        let queue = unsafe { QUEUE.unwrap() };
        let sem = unsafe { BLINK_SEM.unwrap() };
        let mut value: u32 = 0;

        loop {
            value = value.wrapping_add(1);
            let _ = queue.send(&value, TICK_FOREVER);
            if value % 8 == 0 {
                let _ = sem.post();
            }
            kernel::sleep(10);
        }
    }

    extern "C" fn consumer_task(_arg: *mut c_void) {
        let queue = unsafe { QUEUE.unwrap() };
        let mut out: u32 = 0;

        loop {
            if queue.receive(&mut out, TICK_FOREVER).is_ok() {
                CHECKSUM.fetch_add(out, Ordering::Relaxed);
            }
        }
    }

    extern "C" fn blink_task(_arg: *mut c_void) {
        let sem = unsafe { BLINK_SEM.unwrap() };

        loop {
            if sem.pend(TICK_FOREVER).is_ok() {
                // Toggle an LED here on real hardware.
                CHECKSUM.fetch_xor(0x8000_0000, Ordering::Relaxed);
            }
        }
    }

    #[entry]
    fn main() -> ! {
        kernel::init();

        unsafe {
            QUEUE = Some(msgq::create::<u32>(4).unwrap());
            BLINK_SEM = Some(semaphore::create_binary(false).unwrap());
        }

        kernel::create_task(producer_task, core::ptr::null_mut(), 128, 3, "producer").unwrap();
        kernel::create_task(consumer_task, core::ptr::null_mut(), 128, 4, "consumer").unwrap();
        kernel::create_task(blink_task, core::ptr::null_mut(), 128, 2, "blink").unwrap();

        kernel::start()
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
fn main() {
    // The demo firmware only targets bare-metal ARM builds.
}
