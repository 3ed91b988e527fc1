//! Platform Adapters
//!
//! Provides control-plane adapters for:
//! - EC2 (EBS volumes and snapshots)
//! - Memory (in-process model of the control plane)
//!
//! plus the instance-metadata lookup that yields the [`InstanceContext`].
//!
//! [`InstanceContext`]: crate::domain::ports::InstanceContext

pub mod ec2;
pub mod memory;
pub mod metadata;

pub use ec2::*;
pub use memory::*;
pub use metadata::*;
