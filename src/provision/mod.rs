//! Provisioning Components
//!
//! One component per step of the acquisition sequence, each a unit struct
//! with associated async functions over the control-plane and host ports.
//! [`Provisioner`] binds them to concrete adapters and the instance
//! context, exposing the whole set as [`VolumeOperations`].

pub mod attacher;
pub mod filesystem;
pub mod mount;
pub mod preconditions;
pub mod provisioner;
pub mod query;
pub mod waiter;

pub use attacher::VolumeAttacher;
pub use filesystem::FilesystemInitializer;
pub use mount::MountManager;
pub use preconditions::PreconditionChecker;
pub use provisioner::VolumeProvisioner;
pub use query::TagFilterQuery;
pub use waiter::{poll_until, AvailabilityWaiter};

use crate::config::Timeouts;
use crate::domain::ports::{
    AttachmentRequest, ControlPlane, CreateVolumeRequest, HostSystem, InstanceContext, TagQuery,
    VolumeOperations,
};
use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

// =============================================================================
// Provisioner
// =============================================================================

/// Volume operations over a control plane and a host
pub struct Provisioner<C, H> {
    control_plane: Arc<C>,
    host: Arc<H>,
    context: InstanceContext,
    timeouts: Timeouts,
}

impl<C: ControlPlane, H: HostSystem> Provisioner<C, H> {
    pub fn new(
        control_plane: Arc<C>,
        host: Arc<H>,
        context: InstanceContext,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            control_plane,
            host,
            context,
            timeouts,
        }
    }

    pub fn control_plane(&self) -> &Arc<C> {
        &self.control_plane
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    pub fn context(&self) -> &InstanceContext {
        &self.context
    }
}

#[async_trait]
impl<C: ControlPlane + 'static, H: HostSystem + 'static> VolumeOperations for Provisioner<C, H> {
    async fn check_device(&self, device: &Path) -> Result<()> {
        PreconditionChecker::check_device(&*self.host, device).await
    }

    async fn check_mount_point(&self, mount_point: &Path) -> Result<()> {
        PreconditionChecker::check_mount_point(&*self.host, mount_point).await
    }

    async fn find_volume(&self, query: &TagQuery) -> Result<Option<String>> {
        TagFilterQuery::find_volume(&*self.control_plane, &self.context, query).await
    }

    async fn find_snapshot(&self, query: &TagQuery) -> Result<Option<String>> {
        TagFilterQuery::find_snapshot(&*self.control_plane, query).await
    }

    async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<String> {
        VolumeProvisioner::create_volume(&*self.control_plane, &self.context, request).await
    }

    async fn wait_until_volume_available(&self, volume_id: &str) -> Result<()> {
        AvailabilityWaiter::wait_until_volume_available(
            &*self.control_plane,
            volume_id,
            self.timeouts.volume_available,
            self.timeouts.control_plane_poll,
        )
        .await
    }

    async fn attach_volume(&self, request: &AttachmentRequest) -> Result<()> {
        VolumeAttacher::attach_volume(
            &*self.control_plane,
            &*self.host,
            &self.context,
            request,
            &self.timeouts,
        )
        .await
    }

    async fn make_file_system(&self, device: &Path, inode_ratio: u64, volume_id: &str) -> Result<()> {
        FilesystemInitializer::make_file_system(
            &*self.control_plane,
            &*self.host,
            device,
            inode_ratio,
            volume_id,
        )
        .await
    }

    async fn mount_volume(&self, device: &Path, mount_point: &Path) -> Result<()> {
        MountManager::mount_volume(&*self.host, device, mount_point).await
    }
}
