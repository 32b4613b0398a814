//! `GlobalAlloc` adapter over the kernel heap.
//!
//! Layouts the heap's natural alignment already satisfies map 1:1 onto
//! heap blocks. Stricter alignments over-allocate and stash the real block
//! address in the word right below the aligned pointer.

use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr;

use crate::memory::heap::{self, HEAP_ALIGNMENT};

pub struct KernelAllocator;

/// Slot holding the raw block address for an over-aligned allocation.
#[inline]
fn backref_slot(aligned: *mut u8) -> *mut *mut u8 {
    aligned.wrapping_sub(size_of::<*mut u8>()).cast::<*mut u8>()
}

/// Extra bytes an allocation with `align` needs on top of its size.
#[inline]
fn over_alignment_padding(align: usize) -> Option<usize> {
    (align - 1).checked_add(size_of::<*mut u8>())
}

// SAFETY:
// - All heap access goes through `heap::with_heap`, which serializes callers
//   behind the interrupt-masking heap lock.
// - Returned pointers are either null or inside a live heap block that is
//   at least `layout.size()` bytes long past the returned address.
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(1);
        if layout.align() <= HEAP_ALIGNMENT {
            return heap::malloc(size);
        }

        let Some(total) = over_alignment_padding(layout.align()).and_then(|pad| size.checked_add(pad)) else {
            return ptr::null_mut();
        };
        let raw = heap::malloc(total);
        if raw.is_null() {
            return raw;
        }

        let first_candidate = raw as usize + size_of::<*mut u8>();
        let aligned = ((first_candidate + layout.align() - 1) & !(layout.align() - 1)) as *mut u8;

        // SAFETY:
        // - `aligned - size_of::<*mut u8>()` is at or after `raw` and the
        //   padding keeps `aligned + size` inside the block.
        unsafe {
            ptr::write_unaligned(backref_slot(aligned), raw);
        }
        aligned
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.align() <= HEAP_ALIGNMENT {
            heap::free(ptr);
            return;
        }
        if ptr.is_null() {
            return;
        }

        // SAFETY:
        // - `alloc` stored the raw block address right below `ptr`.
        let raw = unsafe { ptr::read_unaligned(backref_slot(ptr)) };
        heap::free(raw);
    }
}

#[cfg(all(target_os = "none", not(test)))]
#[global_allocator]
pub static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;
