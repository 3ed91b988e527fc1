//! Acquisition Orchestrator
//!
//! Drives a single run from precondition checks to a mounted volume:
//!
//! ```text
//! Init -> PreconditionsChecked -> ReuseAttempt | SnapshotRestore
//!      -> VolumeReady -> Attached -> [FilesystemReady] -> Mounted
//! ```
//!
//! Any step may end the run in `Failed`. Nothing already created or
//! attached is rolled back.

use crate::config::Config;
use crate::domain::ports::VolumeOperationsRef;
use crate::error::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Find+attach cycles before falling back to creation
pub const REUSE_ATTEMPTS: u32 = 10;

// =============================================================================
// Run Report
// =============================================================================

/// Steps of the acquisition sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    PreconditionsChecked,
    ReuseAttempt,
    SnapshotRestore,
    VolumeReady,
    Attached,
    FilesystemReady,
    Mounted,
    Failed,
}

/// Where the mounted volume came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VolumeSource {
    /// An existing formatted volume, attached on the given attempt
    Reused { attempt: u32 },
    /// A new volume, restored from a snapshot or blank
    Created { snapshot_id: Option<String> },
}

/// Outcome of a successful run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub volume_id: String,
    pub device: PathBuf,
    pub mount_point: PathBuf,
    pub source: VolumeSource,
    pub formatted: bool,
    /// Find+attach cycles made before reuse succeeded or gave up
    pub reuse_attempts: u32,
    pub phases: Vec<Phase>,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Sequences volume operations for one run
pub struct Orchestrator {
    config: Config,
    operations: VolumeOperationsRef,
    phases: Mutex<Vec<Phase>>,
}

impl Orchestrator {
    pub fn new(config: Config, operations: VolumeOperationsRef) -> Self {
        Self {
            config,
            operations,
            phases: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Phases entered so far, including `Failed` after a failed run
    pub fn phases(&self) -> Vec<Phase> {
        self.phases.lock().clone()
    }

    fn enter(&self, phase: Phase) {
        debug!("Entering phase {:?}", phase);
        self.phases.lock().push(phase);
    }

    /// Acquire, attach and mount a volume
    pub async fn run(&self) -> Result<RunReport> {
        self.phases.lock().clear();
        self.enter(Phase::Init);

        match self.acquire().await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.enter(Phase::Failed);
                Err(e)
            }
        }
    }

    async fn acquire(&self) -> Result<RunReport> {
        let ops = &self.operations;
        let device = self.config.device_path();
        let mount_point = self.config.mount_point.clone();

        ops.check_device(&device).await?;
        ops.check_mount_point(&mount_point).await?;
        self.enter(Phase::PreconditionsChecked);

        let mut reuse_attempts = 0;
        let mut snapshot_id = None;
        let mut reused = None;

        match self.config.snapshot_query() {
            None => {
                self.enter(Phase::ReuseAttempt);
                let (attempts, found) = self.reuse().await?;
                reuse_attempts = attempts;
                reused = found;
            }
            Some(query) => {
                self.enter(Phase::SnapshotRestore);
                snapshot_id = ops.find_snapshot(&query).await?;
                match &snapshot_id {
                    Some(id) => info!("Restoring from snapshot {}", id),
                    None => info!("No completed snapshot matches {}, creating a blank volume", query),
                }
            }
        }

        let (volume_id, source, formatted) = match reused {
            Some((volume_id, attempt)) => {
                self.enter(Phase::VolumeReady);
                self.enter(Phase::Attached);
                (volume_id, VolumeSource::Reused { attempt }, false)
            }
            None => {
                let request = self.config.create_request(snapshot_id.clone());
                let volume_id = ops.create_volume(&request).await?;
                ops.wait_until_volume_available(&volume_id).await?;
                self.enter(Phase::VolumeReady);

                ops.attach_volume(&self.config.attachment(&volume_id)).await?;
                self.enter(Phase::Attached);

                let formatted = snapshot_id.is_none();
                if formatted {
                    ops.make_file_system(&device, self.config.mkfs_inode_ratio, &volume_id)
                        .await?;
                    self.enter(Phase::FilesystemReady);
                }
                (volume_id, VolumeSource::Created { snapshot_id }, formatted)
            }
        };

        ops.mount_volume(&device, &mount_point).await?;
        self.enter(Phase::Mounted);
        info!(
            "Volume {} mounted at {}",
            volume_id,
            mount_point.display()
        );

        Ok(RunReport {
            volume_id,
            device,
            mount_point,
            source,
            formatted,
            reuse_attempts,
            phases: self.phases(),
        })
    }

    /// Find and attach an existing volume, at most `REUSE_ATTEMPTS` times
    ///
    /// Returns the attempts made and, on success, the volume with the
    /// attempt that attached it. A failed attach moves on to the next
    /// candidate; a failed query ends the run.
    async fn reuse(&self) -> Result<(u32, Option<(String, u32)>)> {
        let ops = &self.operations;

        for attempt in 1..=REUSE_ATTEMPTS {
            let volume_id = match ops.find_volume(&self.config.tag).await? {
                Some(id) => id,
                None => {
                    info!("No reusable volume matches {}", self.config.tag);
                    return Ok((attempt, None));
                }
            };

            info!("Attempt {}: reusing volume {}", attempt, volume_id);
            match ops.attach_volume(&self.config.attachment(&volume_id)).await {
                Ok(()) => return Ok((attempt, Some((volume_id, attempt)))),
                Err(e) => warn!("Attempt {} failed for {}: {}", attempt, volume_id, e),
            }
        }

        warn!(
            "No volume attached after {} attempts, creating a new one",
            REUSE_ATTEMPTS
        );
        Ok((REUSE_ATTEMPTS, None))
    }
}
