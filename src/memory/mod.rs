//! Memory management: the kernel heap.

pub mod heap;
