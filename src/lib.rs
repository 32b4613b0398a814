//! Lİ-DOS execution-control core.
//!
//! Cooperative scheduler, context switching, trap dispatch and the kernel
//! heap for a single-CPU 16-bit real-mode kernel. The bare-metal backend
//! lives in `arch::realmode`; everything else runs unchanged on a host
//! against [`testing::RecordingMachine`], which is how the integration tests
//! in `tests/` exercise it.

#![cfg_attr(not(test), no_std)]

pub mod allocator;
pub mod arch;
pub mod boot;
pub mod config;
pub mod logging;
pub mod memory;
pub mod panic;
pub mod scheduler;
pub mod sync;
pub mod testing;
