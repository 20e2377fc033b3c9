//! CSI Node service trait.
//!
//! The Node service runs on each worker node and turns a volume handle into
//! a mounted, usable filesystem (or device node) and back:
//!
//! 1. **Stage**: format and mount the attached disk at a node-global path.
//! 2. **Publish**: bind-mount the staged volume (or mount a file share)
//!    into the workload's target path.
//! 3. **Unpublish**: remove the workload mount and its target path.
//! 4. **Unstage**: unmount the node-global mount.
//!
//! Every operation is idempotent: when the requested end state is already
//! observable on the host, the call succeeds without doing anything.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeInfo, NodePublishVolumeRequest,
    NodeServiceCapability, NodeStageVolumeRequest, VolumeId, VolumeStats,
};

/// Node service: local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume at its node-global staging path.
    ///
    /// This is idempotent: calling it again for an already-staged volume
    /// should succeed without error.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume: unmount it from the staging path.
    ///
    /// This is idempotent: calling it on an already-unstaged volume should
    /// succeed without error.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume into the workload's target path.
    ///
    /// This is idempotent: calling it again for the same `target_path` should
    /// succeed without error.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume: unmount and remove the target path.
    ///
    /// This is idempotent.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Grow the filesystem of a mounted volume after its device has grown.
    async fn expand_volume(
        &self,
        req: NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse, CsiError>;

    /// Report filesystem usage of a published volume.
    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError>;

    /// Optional RPCs this node service implements.
    async fn get_capabilities(&self) -> Result<Vec<NodeServiceCapability>, CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}
