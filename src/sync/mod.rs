//! Synchronization primitives for the single-CPU kernel.

pub mod spinlock;
