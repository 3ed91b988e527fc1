//! Error types for the fleet volume provisioner
//!
//! One variant per failure the acquisition sequence can hit, from the
//! precondition checks through mounting, plus the ambient failures of
//! talking to the instance-metadata service and local commands.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the provisioner
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Startup Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Instance metadata lookup failed: {0}")]
    InstanceMetadata(String),

    // =========================================================================
    // Precondition Errors
    // =========================================================================
    #[error("Device already exists: {}", device.display())]
    DeviceExists { device: PathBuf },

    #[error("Mount point already mounted: {}", mount_point.display())]
    AlreadyMounted { mount_point: PathBuf },

    // =========================================================================
    // Control Plane Errors
    // =========================================================================
    #[error("Control plane call {operation} failed: {reason}")]
    ControlPlane { operation: String, reason: String },

    #[error("Query for {query} failed: {reason}")]
    Query { query: String, reason: String },

    #[error("Volume creation failed: {reason}")]
    Provisioning { reason: String },

    #[error("Volume {volume_id} was created but tagging it failed: {reason}")]
    TagApplication { volume_id: String, reason: String },

    #[error("Volume {volume_id} did not become {wanted} within {waited:?}")]
    VolumeTimeout {
        volume_id: String,
        wanted: String,
        waited: Duration,
    },

    #[error("Volume {volume_id} entered state {state} while waiting for {wanted}")]
    VolumeFailed {
        volume_id: String,
        state: String,
        wanted: String,
    },

    #[error("Attaching volume {volume_id} as {device} failed: {reason}")]
    Attach {
        volume_id: String,
        device: String,
        reason: String,
    },

    #[error("Device not found: {} (waited {waited:?})", device.display())]
    DeviceNotFound { device: PathBuf, waited: Duration },

    // =========================================================================
    // Filesystem / Mount Errors
    // =========================================================================
    #[error("Formatting {} failed: {reason}", device.display())]
    Format { device: PathBuf, reason: String },

    #[error("Volume {volume_id} was formatted but marking it failed: {reason}")]
    Tagging { volume_id: String, reason: String },

    #[error("Mounting {} at {} failed: {reason}", device.display(), mount_point.display())]
    Mount {
        device: PathBuf,
        mount_point: PathBuf,
        reason: String,
    },

    #[error("Command failed: {command} - {reason}")]
    Command { command: String, reason: String },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Metadata service connection error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable short name of the failure, used as the `kind` field of the
    /// fatal diagnostic
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::InstanceMetadata(_) | Error::Http(_) | Error::Json(_) => "instance_metadata",
            Error::DeviceExists { .. } | Error::AlreadyMounted { .. } => "precondition",
            Error::ControlPlane { .. } => "control_plane",
            Error::Query { .. } => "query",
            Error::Provisioning { .. } | Error::TagApplication { .. } => "provisioning",
            Error::VolumeTimeout { .. } => "volume_timeout",
            Error::VolumeFailed { .. } => "volume_failed",
            Error::Attach { .. } => "attach",
            Error::DeviceNotFound { .. } => "device_not_found",
            Error::Format { .. } => "format",
            Error::Tagging { .. } => "tagging",
            Error::Mount { .. } => "mount",
            Error::Command { .. } | Error::Io(_) => "host",
        }
    }

    /// Check if this error is a precondition violation
    pub fn is_precondition(&self) -> bool {
        matches!(self, Error::DeviceExists { .. } | Error::AlreadyMounted { .. })
    }

    /// Volume left behind by a two-step operation whose first step
    /// succeeded.
    ///
    /// `TagApplication` means the volume exists but may be missing its
    /// identifying tags; `Tagging` means the volume carries a filesystem
    /// but is still marked `filesystem=false`.
    pub fn leaked_volume(&self) -> Option<&str> {
        match self {
            Error::TagApplication { volume_id, .. } | Error::Tagging { volume_id, .. } => {
                Some(volume_id)
            }
            _ => None,
        }
    }
}

/// Result type alias for the provisioner
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = Error::DeviceExists {
            device: PathBuf::from("/dev/xvdb"),
        };
        assert_eq!(err.kind(), "precondition");
        assert!(err.is_precondition());

        let err = Error::VolumeTimeout {
            volume_id: "vol-1".into(),
            wanted: "available".into(),
            waited: Duration::from_secs(600),
        };
        assert_eq!(err.kind(), "volume_timeout");
        assert!(!err.is_precondition());
    }

    #[test]
    fn test_leaked_volume() {
        let err = Error::TagApplication {
            volume_id: "vol-1".into(),
            reason: "throttled".into(),
        };
        assert_eq!(err.leaked_volume(), Some("vol-1"));

        let err = Error::Tagging {
            volume_id: "vol-2".into(),
            reason: "throttled".into(),
        };
        assert_eq!(err.leaked_volume(), Some("vol-2"));

        let err = Error::Provisioning {
            reason: "quota".into(),
        };
        assert_eq!(err.leaked_volume(), None);
    }

    #[test]
    fn test_error_display() {
        let err = Error::Mount {
            device: PathBuf::from("/dev/xvdb"),
            mount_point: PathBuf::from("/data"),
            reason: "exit status 32".into(),
        };
        assert_eq!(
            err.to_string(),
            "Mounting /dev/xvdb at /data failed: exit status 32"
        );
    }
}
