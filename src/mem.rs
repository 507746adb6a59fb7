//! # Kernel Allocator Boundary
//!
//! The kernel allocates task control blocks, stacks, and kernel objects
//! through this module and nothing else. The heap itself is an external
//! collaborator: whatever `#[global_allocator]` the application registers
//! (the std allocator on hosted test builds).
//!
//! Each block carries a small header recording its full layout so that
//! [`deallocate`] needs only the pointer — the kernel frees memory from
//! contexts (idle-task recycling) where the original layout is long gone.
//! The free path compiles out entirely without the `delete` feature.

use core::alloc::Layout;
use core::mem;
use core::ptr::NonNull;

use alloc::alloc::alloc;
#[cfg(feature = "delete")]
use alloc::alloc::dealloc;

/// Header slots: total allocation size and alignment, stored immediately
/// below the payload.
const HEADER_WORDS: usize = 2;

#[inline]
fn payload_offset(align: usize) -> usize {
    align.max(HEADER_WORDS * mem::size_of::<usize>())
}

/// Allocate a block for `layout`. Returns `None` on exhaustion — the
/// caller reports allocation failure to the application; nothing panics.
pub fn allocate_layout(layout: Layout) -> Option<NonNull<u8>> {
    let align = layout.align().max(mem::align_of::<usize>());
    let offset = payload_offset(align);
    let total = layout.size().checked_add(offset)?;
    let full = Layout::from_size_align(total, align).ok()?;

    unsafe {
        let raw = alloc(full);
        if raw.is_null() {
            return None;
        }
        let payload = raw.add(offset);
        (payload as *mut usize).sub(1).write(total);
        (payload as *mut usize).sub(2).write(align);
        NonNull::new(payload)
    }
}

/// Allocate `size` bytes at the kernel's standard 8-byte alignment.
pub fn allocate(size: usize) -> Option<NonNull<u8>> {
    allocate_layout(Layout::from_size_align(size, 8).ok()?)
}

/// Return a block obtained from [`allocate`] / [`allocate_layout`].
///
/// # Safety
///
/// `ptr` must have come from this module and not have been freed already.
#[cfg(feature = "delete")]
pub unsafe fn deallocate(ptr: NonNull<u8>) {
    let payload = ptr.as_ptr();
    let total = (payload as *mut usize).sub(1).read();
    let align = (payload as *mut usize).sub(2).read();
    let raw = payload.sub(payload_offset(align));
    dealloc(raw, Layout::from_size_align_unchecked(total, align));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_aligned_and_writable() {
        let ptr = allocate(64).expect("allocation failed");
        assert_eq!(ptr.as_ptr() as usize % 8, 0);
        unsafe {
            core::ptr::write_bytes(ptr.as_ptr(), 0xA5, 64);
            assert_eq!(*ptr.as_ptr(), 0xA5);
            #[cfg(feature = "delete")]
            deallocate(ptr);
        }
    }

    #[test]
    fn test_allocate_layout_honors_large_alignment() {
        let layout = Layout::from_size_align(32, 64).unwrap();
        let ptr = allocate_layout(layout).expect("allocation failed");
        assert_eq!(ptr.as_ptr() as usize % 64, 0);
        #[cfg(feature = "delete")]
        unsafe {
            deallocate(ptr)
        };
    }

    #[cfg(feature = "delete")]
    #[test]
    fn test_round_trip_many_sizes() {
        for size in [1usize, 7, 8, 31, 128, 1024] {
            let ptr = allocate(size).expect("allocation failed");
            unsafe {
                core::ptr::write_bytes(ptr.as_ptr(), 0x5A, size);
                deallocate(ptr);
            }
        }
    }
}
