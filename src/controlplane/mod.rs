//! Control Plane Module
//!
//! The acquisition orchestrator and the adapters it reaches the cloud
//! block-storage control plane through.

pub mod orchestrator;
pub mod platform;

pub use orchestrator::*;
pub use platform::*;
