//! Fleet Volume Provisioner
//!
//! Gives a booting instance a persistent block volume: reuse a formatted
//! volume from a tagged pool, or create one (blank or restored from a
//! snapshot), then attach, format if needed, and mount it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           Orchestrator                               │
//! │  preconditions -> reuse loop | snapshot -> create -> attach -> mount │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                  Provisioner (VolumeOperations)                      │
//! │  ┌──────────────┐ ┌──────────────┐ ┌──────────────┐ ┌─────────────┐  │
//! │  │ TagFilter    │ │ Volume       │ │ Volume       │ │ Filesystem  │  │
//! │  │ Query        │ │ Provisioner  │ │ Attacher     │ │ / Mount     │  │
//! │  └──────┬───────┘ └──────┬───────┘ └──────┬───────┘ └──────┬──────┘  │
//! ├─────────┴────────────────┴────────────────┴────────────────┴─────────┤
//! │   ControlPlane port              │          HostSystem port          │
//! │   EC2 / in-memory                │          Linux / in-memory        │
//! └──────────────────────────────────┴───────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Orchestrator, EC2 adapter, instance metadata
//! - [`provision`]: One component per acquisition step
//! - [`host`]: Local OS adapters
//! - [`config`]: Resolved run configuration
//! - [`domain`]: Core domain types and ports
//! - [`error`]: Error types and handling

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod host;
pub mod provision;

// Re-export commonly used types
pub use config::{parse_tag, Config, Timeouts, VolumeType};

pub use controlplane::{
    Ec2ControlPlane, InMemoryControlPlane, MetadataClient, Orchestrator, Phase, RunReport,
    VolumeSource, REUSE_ATTEMPTS,
};

pub use domain::ports::{
    AttachmentRequest, ControlPlane, CreateVolumeRequest, HostSystem, InstanceContext, Snapshot,
    SnapshotState, TagQuery, Tags, Volume, VolumeOperations, VolumeOperationsRef, VolumeState,
};

pub use error::{Error, Result};

pub use host::{DeviceNodes, FakeHost, LinuxHost, LinuxHostConfig};

pub use provision::Provisioner;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
