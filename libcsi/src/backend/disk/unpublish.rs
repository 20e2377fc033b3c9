//! NodeUnpublishVolume.

use std::io::ErrorKind;

use tracing::{debug, info};

use super::{DiskNode, remove_path};
use crate::device::device_behind_mount;
use crate::error::CsiError;
use crate::mounter::Mounter;
use crate::mounts::{MountKind, classify_mount, contains_path};
use crate::types::VolumeId;

impl<M: Mounter> DiskNode<M> {
    pub(super) async fn unpublish(&self, volume_id: &VolumeId, target: &str) -> Result<(), CsiError> {
        if volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume ID required".to_owned()));
        }
        if target.is_empty() {
            return Err(CsiError::InvalidArgument("target path required".to_owned()));
        }

        // A file for block volumes, a directory otherwise.
        match tokio::fs::symlink_metadata(target).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(%target, "target path does not exist, assuming unpublish is complete");
                return Ok(());
            }
            Err(e) => {
                return Err(CsiError::Internal(format!(
                    "failed to stat target {target:?}, err: {e}"
                )));
            }
        }

        let mounts = self.mounter.list_mounts().await.map_err(|e| {
            CsiError::Internal(format!("could not retrieve existing mount points: {e}"))
        })?;
        if !contains_path(&mounts, target) {
            info!(%target, "target not present in mount points, removing leftover path");
            return remove_path(target).await;
        }

        if classify_mount(&mounts, target) == MountKind::Other {
            device_behind_mount(&mounts, target).map_err(|e| {
                CsiError::Internal(format!(
                    "error getting block device for volume: {volume_id}, err: {e}"
                ))
            })?;
        }

        self.mounter.unmount(target).await.map_err(|e| {
            CsiError::Internal(format!(
                "Error unmounting target {target:?} for volume {volume_id:?}: {e}"
            ))
        })?;
        debug!(%target, "unmounted target");
        remove_path(target).await?;
        info!(%target, "volume unpublished");
        Ok(())
    }
}
