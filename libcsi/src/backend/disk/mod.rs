//! Node backend for attached disks and network file shares.
//!
//! [`DiskNode`] implements [`CsiIdentity`] and [`CsiNode`] for volumes that
//! arrive on the node either as a block device (found under the disk-by-id
//! directory by its disk identifier) or as an NFS share endpoint.
//!
//! The backend keeps no per-volume state and takes no locks.  Every call
//! re-reads the mount table and the device tree and decides from what it
//! observes, so a crashed or half-finished earlier attempt is simply picked
//! up where it left off.  The CO serialises calls per volume.
//!
//! # Paths
//!
//! ```text
//! <staging target>   node-global mount of the formatted disk (mount volumes)
//! <target>           per-workload bind mount of the staging target,
//!                    a bind-mounted device node (block volumes), or
//!                    a direct NFS mount (file shares)
//! ```

mod expand;
mod info;
mod publish;
mod stage;
mod unpublish;

use std::collections::HashMap;
use std::io::ErrorKind;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::config::NodeConfig;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::mounter::{Mounter, SystemMounter};
use crate::node::CsiNode;
use crate::types::*;

/// CSI node backend for disk-backed and file-share volumes.
pub struct DiskNode<M = SystemMounter> {
    config: NodeConfig,
    mounter: M,
}

impl DiskNode<SystemMounter> {
    /// Create a backend operating on the live host.
    pub fn new(config: NodeConfig) -> Self {
        let mounter = SystemMounter::new(&config.paths);
        Self { config, mounter }
    }
}

impl<M: Mounter> DiskNode<M> {
    /// Create a backend with a custom [`Mounter`].
    pub fn with_mounter(config: NodeConfig, mounter: M) -> Self {
        Self { config, mounter }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// The option an existing mount must carry to satisfy a request.
fn access_option(read_only: bool) -> &'static str {
    if read_only { "ro" } else { "rw" }
}

fn disk_id(publish_context: &HashMap<String, String>) -> Result<String, CsiError> {
    publish_context
        .get(ATTRIBUTE_DISK_UUID)
        .cloned()
        .ok_or_else(|| {
            CsiError::InvalidArgument(format!(
                "Attribute: {ATTRIBUTE_DISK_UUID} required in publish context"
            ))
        })
}

/// Check that `target` is a directory.
///
/// A missing target is `FailedPrecondition` when `should_exist`, and
/// `Ok(false)` otherwise.
async fn verify_target_dir(target: &str, should_exist: bool) -> Result<bool, CsiError> {
    if target.is_empty() {
        return Err(CsiError::InvalidArgument("target path required".to_owned()));
    }
    let meta = match tokio::fs::metadata(target).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            if should_exist {
                return Err(CsiError::FailedPrecondition(format!(
                    "target: {target} not pre-created"
                )));
            }
            return Ok(false);
        }
        Err(e) => {
            return Err(CsiError::Internal(format!(
                "failed to stat target {target}: {e}"
            )));
        }
    };
    if !meta.is_dir() {
        return Err(CsiError::FailedPrecondition(format!(
            "existing path: {target} is not a directory"
        )));
    }
    debug!(%target, "target path verified");
    Ok(true)
}

/// Create the directory `path` unless it exists.  Returns whether it was
/// created.
async fn make_dir(path: &str) -> Result<bool, CsiError> {
    let failed = |reason: String| {
        CsiError::Internal(format!("Unable to create target dir: {path}, err: {reason}"))
    };
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(false),
        Ok(_) => Err(failed("existing path is not a directory".to_owned())),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tokio::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o750)
                .create(path)
                .await
                .map_err(|e| failed(e.to_string()))?;
            debug!(%path, "created directory");
            Ok(true)
        }
        Err(e) => Err(failed(e.to_string())),
    }
}

/// Create the empty file `path` unless it exists.  Returns whether it was
/// created.
async fn make_file(path: &str) -> Result<bool, CsiError> {
    let failed = |reason: String| {
        CsiError::Internal(format!("Unable to create target file: {path}, err: {reason}"))
    };
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Err(failed("existing path is a directory".to_owned())),
        Ok(_) => Ok(false),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .mode(0o755)
                .open(path)
                .await
                .map_err(|e| failed(e.to_string()))?;
            debug!(%path, "created file");
            Ok(true)
        }
        Err(e) => Err(failed(e.to_string())),
    }
}

/// Remove `path`, file or empty directory.  A missing path is not an error.
async fn remove_path(path: &str) -> Result<(), CsiError> {
    let failed =
        |e: std::io::Error| CsiError::Internal(format!("Unable to remove target path: {path}, err: {e}"));
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(failed(e)),
    };
    let removed = if meta.is_dir() {
        tokio::fs::remove_dir(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match removed {
        Ok(()) => {
            debug!(%path, "removed target path");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(failed(e)),
    }
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl<M: Mounter + 'static> CsiIdentity for DiskNode<M> {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.config.plugin_name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        // Nothing works without a readable mount table.
        Ok(self.mounter.list_mounts().await.is_ok())
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        let mut caps = Vec::new();
        if self.config.online_expansion {
            caps.push(PluginCapability::VolumeExpansionOnline);
        }
        Ok(caps)
    }
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl<M: Mounter + 'static> CsiNode for DiskNode<M> {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, trace_id = %uuid::Uuid::new_v4()))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        self.stage(req).await
    }

    #[instrument(skip(self), fields(trace_id = %uuid::Uuid::new_v4()))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        self.unstage(volume_id, staging_target_path).await
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, trace_id = %uuid::Uuid::new_v4()))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        self.publish(req).await
    }

    #[instrument(skip(self), fields(trace_id = %uuid::Uuid::new_v4()))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        self.unpublish(volume_id, target_path).await
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, trace_id = %uuid::Uuid::new_v4()))]
    async fn expand_volume(
        &self,
        req: NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse, CsiError> {
        self.expand(req).await
    }

    #[instrument(skip(self))]
    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError> {
        self.volume_stats(volume_id, volume_path).await
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeServiceCapability>, CsiError> {
        Ok(vec![
            NodeServiceCapability::StageUnstageVolume,
            NodeServiceCapability::ExpandVolume,
            NodeServiceCapability::GetVolumeStats,
        ])
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(self.node_info())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn plugin_identity() {
        let h = Harness::new();
        let info = h.node.get_plugin_info().await.unwrap();
        assert_eq!(info.name, crate::config::DEFAULT_PLUGIN_NAME);
        assert!(h.node.probe().await.unwrap());
        assert!(h.node.get_plugin_capabilities().await.unwrap().is_empty());

        let online = Harness::build(|c| c.online_expansion = true);
        assert_eq!(
            online.node.get_plugin_capabilities().await.unwrap(),
            vec![PluginCapability::VolumeExpansionOnline]
        );
    }

    #[tokio::test]
    async fn node_capabilities() {
        let h = Harness::new();
        let caps = h.node.get_capabilities().await.unwrap();
        assert!(caps.contains(&NodeServiceCapability::StageUnstageVolume));
        assert!(caps.contains(&NodeServiceCapability::ExpandVolume));
        assert!(caps.contains(&NodeServiceCapability::GetVolumeStats));
    }

    #[tokio::test]
    async fn target_dir_checks() {
        let h = Harness::new();
        let dir = h.dir("staging");
        assert!(verify_target_dir(&dir, true).await.unwrap());

        let missing = h.path("missing");
        assert!(!verify_target_dir(&missing, false).await.unwrap());
        assert!(matches!(
            verify_target_dir(&missing, true).await,
            Err(CsiError::FailedPrecondition(_))
        ));
        assert!(matches!(
            verify_target_dir("", true).await,
            Err(CsiError::InvalidArgument(_))
        ));

        let file = h.path("file");
        std::fs::write(&file, b"").unwrap();
        assert!(matches!(
            verify_target_dir(&file, true).await,
            Err(CsiError::FailedPrecondition(_))
        ));
    }

    #[tokio::test]
    async fn make_and_remove_paths() {
        let h = Harness::new();
        let dir = h.path("a/b");
        assert!(make_dir(&dir).await.unwrap());
        assert!(!make_dir(&dir).await.unwrap());

        let file = h.path("a/dev");
        assert!(make_file(&file).await.unwrap());
        assert!(!make_file(&file).await.unwrap());
        assert!(make_file(&dir).await.is_err());
        assert!(make_dir(&file).await.is_err());

        remove_path(&file).await.unwrap();
        remove_path(&dir).await.unwrap();
        remove_path(&dir).await.unwrap();
        assert!(!h.exists(&file));
        assert!(!h.exists(&dir));
    }

    #[test]
    fn disk_id_is_required() {
        assert!(matches!(
            disk_id(&HashMap::new()),
            Err(CsiError::InvalidArgument(_))
        ));
    }
}
