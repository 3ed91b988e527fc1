//! Local Host Adapters
//!
//! Implementations of the host port:
//! - Linux: the real machine
//! - Memory: an in-memory stand-in for tests

pub mod linux;
pub mod memory;

pub use linux::*;
pub use memory::*;
