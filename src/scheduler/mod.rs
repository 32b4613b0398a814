//! Cooperative task scheduling.
//!
//! The task table and the round-robin policy live in `roundrobin.rs`; the
//! whole API is re-exported as `crate::scheduler::*`.

mod roundrobin;

pub use roundrobin::*;
