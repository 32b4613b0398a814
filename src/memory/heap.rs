//! Kernel heap manager.
//!
//! Design summary:
//! - One contiguous pool inside the kernel data segment (at most 64 KiB).
//! - Singly linked free list threaded through the free blocks themselves.
//! - First-fit allocation; oversized blocks are split and the tail keeps the
//!   original block's position in the list.
//! - Freed blocks are pushed on the front of the list.
//!
//! Notes:
//! - Block size includes the header itself.
//! - Payload pointer is always `header + BLOCK_OVERHEAD`.
//! - Adjacent free blocks are never coalesced, so long-running alloc/free
//!   cycles fragment the pool.

use core::fmt;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

use crate::config::MAX_POOL_SIZE;
use crate::sync::spinlock::SpinLock;

/// Header overlaid on the first bytes of every block.
///
/// While the block is free `next` links it into the free list; once it is
/// handed out only `size` stays meaningful.
#[repr(C)]
struct FreeBlock {
    /// Full block size in bytes (header + payload + padding).
    size: usize,
    /// Next free block, null at the end of the list.
    next: *mut FreeBlock,
}

/// Global heap payload alignment.
pub const HEAP_ALIGNMENT: usize = align_of::<FreeBlock>();

/// Header size rounded up to the alignment unit; also the smallest block.
pub const BLOCK_OVERHEAD: usize = align_up(size_of::<FreeBlock>(), HEAP_ALIGNMENT);

#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Aligns `value` up to the next `align` boundary.
#[inline]
fn align_up_checked(value: usize, align: usize) -> Option<usize> {
    let mask = align.checked_sub(1)?;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Computes the full block size for a payload request.
#[inline]
fn block_size_for(requested_size: usize) -> Option<usize> {
    align_up_checked(requested_size, HEAP_ALIGNMENT)?.checked_add(BLOCK_OVERHEAD)
}

/// Converts a block header pointer to the corresponding payload pointer.
#[inline]
fn payload_ptr(block: *mut FreeBlock) -> *mut u8 {
    block.cast::<u8>().wrapping_add(BLOCK_OVERHEAD)
}

/// Reasons [`Heap::init`] refuses a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// The pool start address is null.
    NullPool,
    /// After alignment the pool cannot hold a single block header.
    PoolTooSmall { size: usize },
    /// The pool is larger than one data segment.
    PoolTooLarge { size: usize },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NullPool => write!(f, "heap pool start is null"),
            Self::PoolTooSmall { size } => {
                write!(f, "heap pool of {} bytes cannot hold a block header", size)
            }
            Self::PoolTooLarge { size } => write!(
                f,
                "heap pool of {} bytes exceeds the {} byte segment",
                size, MAX_POOL_SIZE
            ),
        }
    }
}

/// Reasons a pointer handed to [`Heap::free`] was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    Null,
    OutsidePool,
    Misaligned,
    /// The block header already sits inside a free block.
    DoubleFree,
    /// The recovered header describes a block that does not fit the pool.
    CorruptHeader,
    /// The pointer lies inside a block instead of at its payload start.
    NotABlock,
}

impl FreeError {
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Null => "null pointer",
            Self::OutsidePool => "outside pool",
            Self::Misaligned => "misaligned pointer",
            Self::DoubleFree => "double free",
            Self::CorruptHeader => "corrupt block header",
            Self::NotABlock => "not a block start",
        }
    }
}

impl fmt::Display for FreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Snapshot of the free list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub pool_size: usize,
    pub free_bytes: usize,
    pub free_blocks: usize,
    pub largest_free_block: usize,
}

/// First-fit free-list allocator over one caller-provided pool.
pub struct Heap {
    /// Start address of the managed pool (aligned).
    pool_start: usize,
    /// End address (exclusive) of the managed pool.
    pool_end: usize,
    /// First block of the free list.
    head: *mut FreeBlock,
}

// SAFETY:
// - `head` and every `next` link point into the pool the heap was initialized
//   with; the heap is only reachable through `&mut` or the global spinlock.
unsafe impl Send for Heap {}

impl Heap {
    /// Heap with no pool; every allocation fails until [`Heap::init`].
    pub const fn empty() -> Self {
        Self {
            pool_start: 0,
            pool_end: 0,
            head: ptr::null_mut(),
        }
    }

    /// Takes ownership of `pool_start..pool_start + pool_size` as one free block.
    ///
    /// Calling it again discards all previous state. Returns the number of
    /// bytes actually managed after aligning the start.
    ///
    /// # Safety
    /// The range must be writable, unused by anything else, and stay valid for
    /// as long as this heap hands out memory from it.
    pub unsafe fn init(&mut self, pool_start: *mut u8, pool_size: usize) -> Result<usize, HeapError> {
        if pool_start.is_null() {
            return Err(HeapError::NullPool);
        }
        if pool_size > MAX_POOL_SIZE {
            return Err(HeapError::PoolTooLarge { size: pool_size });
        }

        let raw_start = pool_start as usize;
        let start = align_up_checked(raw_start, HEAP_ALIGNMENT).ok_or(HeapError::PoolTooSmall { size: pool_size })?;
        let usable = pool_size.saturating_sub(start - raw_start) & !(HEAP_ALIGNMENT - 1);
        if usable < BLOCK_OVERHEAD {
            return Err(HeapError::PoolTooSmall { size: pool_size });
        }

        let first = start as *mut FreeBlock;
        // SAFETY:
        // - `start` is aligned for `FreeBlock` and at least one header fits.
        // - The caller guarantees the pool is writable and unused.
        unsafe {
            first.write(FreeBlock {
                size: usable,
                next: ptr::null_mut(),
            });
        }

        self.pool_start = start;
        self.pool_end = start + usable;
        self.head = first;
        Ok(usable)
    }

    /// Returns whether a pool has been handed to [`Heap::init`].
    pub fn is_initialized(&self) -> bool {
        self.pool_end > self.pool_start
    }

    /// Start and exclusive end of the managed pool.
    pub fn pool_range(&self) -> (usize, usize) {
        (self.pool_start, self.pool_end)
    }

    /// Returns whether `ptr` lies inside the managed pool.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        addr >= self.pool_start && addr < self.pool_end
    }

    /// Allocates `size` bytes, first fit. `size == 0` always fails.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let needed = block_size_for(size)?;

        let mut link: *mut *mut FreeBlock = &mut self.head;
        // SAFETY:
        // - `link` points either at `self.head` or at the `next` field of a
        //   free block inside the pool.
        // - Every non-null link targets a header written by `init`, a split
        //   or `free`, so reading and rewriting it stays inside the pool.
        unsafe {
            loop {
                let block = *link;
                if block.is_null() {
                    return None;
                }

                let block_size = (*block).size;
                if block_size >= needed {
                    let remainder = block_size - needed;
                    if remainder >= BLOCK_OVERHEAD {
                        // Split: the tail takes over the block's list position.
                        let tail = (block as usize + needed) as *mut FreeBlock;
                        tail.write(FreeBlock {
                            size: remainder,
                            next: (*block).next,
                        });
                        *link = tail;
                        (*block).size = needed;
                    } else {
                        // Tail would be too small: hand out the whole block.
                        *link = (*block).next;
                    }
                    (*block).next = ptr::null_mut();
                    return NonNull::new(payload_ptr(block));
                }

                link = ptr::addr_of_mut!((*block).next);
            }
        }
    }

    /// Allocates a task stack of `size` bytes.
    ///
    /// Stacks grow downward: the initial stack top is `base + size`.
    pub fn allocate_stack(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.allocate(size)
    }

    /// Returns a block to the front of the free list.
    ///
    /// Pointers that cannot have come from [`Heap::allocate`] are rejected
    /// and the free list is left untouched.
    pub fn free(&mut self, ptr: *mut u8) -> Result<usize, FreeError> {
        if ptr.is_null() {
            return Err(FreeError::Null);
        }

        let addr = ptr as usize;
        let Some(min_payload) = self.pool_start.checked_add(BLOCK_OVERHEAD) else {
            return Err(FreeError::OutsidePool);
        };
        if !self.is_initialized() || addr < min_payload || addr >= self.pool_end {
            return Err(FreeError::OutsidePool);
        }
        if (addr - self.pool_start) % HEAP_ALIGNMENT != 0 {
            return Err(FreeError::Misaligned);
        }

        let header_addr = addr - BLOCK_OVERHEAD;
        if self.free_block_containing(header_addr).is_some() {
            return Err(FreeError::DoubleFree);
        }
        if !self.is_block_boundary(header_addr) {
            return Err(FreeError::NotABlock);
        }

        let block = header_addr as *mut FreeBlock;
        // SAFETY:
        // - `header_addr` is aligned and inside the pool, so it addresses a
        //   header-sized slot of pool memory.
        let block_size = unsafe { (*block).size };
        let fits = block_size >= BLOCK_OVERHEAD
            && header_addr
                .checked_add(block_size)
                .is_some_and(|end| end <= self.pool_end);
        if !fits {
            return Err(FreeError::CorruptHeader);
        }

        // SAFETY:
        // - `block` is a validated header of an allocated block inside the pool.
        unsafe {
            (*block).next = self.head;
        }
        self.head = block;
        Ok(block_size)
    }

    /// Walks the free list and summarizes it.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            pool_size: self.pool_end - self.pool_start,
            ..HeapStats::default()
        };
        self.for_each_free_block(|_, size| {
            stats.free_bytes += size;
            stats.free_blocks += 1;
            stats.largest_free_block = stats.largest_free_block.max(size);
        });
        stats
    }

    fn free_block_containing(&self, addr: usize) -> Option<usize> {
        let mut found = None;
        self.for_each_free_block(|start, size| {
            if found.is_none() && addr >= start && addr < start + size {
                found = Some(start);
            }
        });
        found
    }

    /// Walks the blocks that tile the pool and reports whether one starts at `addr`.
    fn is_block_boundary(&self, addr: usize) -> bool {
        let mut current = self.pool_start;
        while current < addr {
            // SAFETY:
            // - Every block header, free or allocated, lies inside the pool
            //   and records the size of its whole block.
            let size = unsafe { (*(current as *const FreeBlock)).size };
            if size < BLOCK_OVERHEAD {
                return false;
            }
            match current.checked_add(size) {
                Some(next) if next <= self.pool_end => current = next,
                _ => return false,
            }
        }
        current == addr
    }

    fn for_each_free_block(&self, mut f: impl FnMut(usize, usize)) {
        let mut current = self.head;
        while !current.is_null() {
            // SAFETY:
            // - Free-list links only ever point at headers inside the pool.
            let block = unsafe { &*current };
            f(current as usize, block.size);
            current = block.next;
        }
    }
}

/// Process-wide heap instance.
static HEAP: SpinLock<Heap> = SpinLock::new(Heap::empty());

/// Executes a closure with exclusive mutable access to the kernel heap.
pub(crate) fn with_heap<R>(f: impl FnOnce(&mut Heap) -> R) -> R {
    let mut guard = HEAP.lock();
    f(&mut guard)
}

/// Initializes the kernel heap over `pool_start..pool_start + pool_size`.
///
/// # Safety
/// See [`Heap::init`].
pub unsafe fn init(pool_start: *mut u8, pool_size: usize) -> Result<usize, HeapError> {
    // SAFETY:
    // - Forwarded caller contract.
    let result = with_heap(|heap| unsafe { heap.init(pool_start, pool_size) });
    match result {
        Ok(managed) => log::info!(
            target: "heap",
            "pool @ {:#x}, {} bytes managed",
            pool_start as usize,
            managed
        ),
        Err(err) => log::error!(target: "heap", "init rejected: {}", err),
    }
    result
}

/// Returns whether the kernel heap has been initialized.
pub fn is_initialized() -> bool {
    with_heap(|heap| heap.is_initialized())
}

/// Allocates `size` bytes and returns a pointer to the payload, or null.
pub fn malloc(size: usize) -> *mut u8 {
    match with_heap(|heap| heap.allocate(size)) {
        Some(ptr) => {
            log::trace!(target: "heap", "alloc ptr={:#x} requested={}", ptr.as_ptr() as usize, size);
            ptr.as_ptr()
        }
        None => {
            log::debug!(target: "heap", "alloc failed requested={}", size);
            ptr::null_mut()
        }
    }
}

/// Allocates a stack of `size` bytes; the stack top is `base + size`.
pub fn alloc_stack(size: usize) -> Option<NonNull<u8>> {
    let stack = with_heap(|heap| heap.allocate_stack(size));
    if stack.is_none() {
        log::debug!(target: "heap", "stack alloc failed requested={}", size);
    }
    stack
}

/// Frees a previously allocated heap pointer. Null is silently ignored.
pub fn free(ptr: *mut u8) {
    match with_heap(|heap| heap.free(ptr)) {
        Ok(block_size) => {
            log::trace!(target: "heap", "free ptr={:#x} block={}", ptr as usize, block_size);
        }
        Err(FreeError::Null) => {}
        Err(err) => {
            log::warn!(
                target: "heap",
                "free rejected ptr={:#x} reason={}",
                ptr as usize,
                err
            );
        }
    }
}

/// Current free-list statistics of the kernel heap.
pub fn stats() -> HeapStats {
    with_heap(|heap| heap.stats())
}
