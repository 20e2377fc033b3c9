//! NodeStageVolume / NodeUnstageVolume.

use tracing::{debug, info, warn};

use super::{DiskNode, access_option, disk_id, remove_path, verify_target_dir};
use crate::device::{Device, device_behind_mount, resolve_device, verify_volume_attached};
use crate::error::CsiError;
use crate::mounter::Mounter;
use crate::mounts::{MountKind, classify_mount, contains_path, mounts_for_device};
use crate::types::{Capability, NodeStageVolumeRequest, VolumeId};

/// Everything a filesystem stage needs, built fresh per call.
#[derive(Debug)]
struct StageParameters {
    volume_id: VolumeId,
    fs_type: String,
    staging_target: String,
    mount_flags: Vec<String>,
    read_only: bool,
}

impl<M: Mounter> DiskNode<M> {
    pub(super) async fn stage(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        if req.volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume ID required".to_owned()));
        }

        let (fs_type, mount_flags) = match req.volume_capability.capability() {
            Capability::FileShare { .. } => {
                info!("file share volumes are not staged");
                return Ok(());
            }
            Capability::Block => {
                self.attached_device(&req.publish_context)?;
                info!("block volume is attached, nothing to stage");
                return Ok(());
            }
            Capability::Mount {
                fs_type,
                mount_flags,
            } => (fs_type, mount_flags),
        };

        verify_target_dir(&req.staging_target_path, true).await?;
        let device = self.attached_device(&req.publish_context)?;

        let params = StageParameters {
            volume_id: req.volume_id,
            fs_type,
            staging_target: req.staging_target_path,
            mount_flags,
            read_only: req.volume_capability.is_read_only(),
        };
        self.stage_filesystem(&device, params).await
    }

    /// Locate the attached disk named in `publish_context`.
    pub(super) fn attached_device(
        &self,
        publish_context: &std::collections::HashMap<String, String>,
    ) -> Result<Device, CsiError> {
        let disk_id = disk_id(publish_context)?;
        let path = verify_volume_attached(&self.config.paths, &disk_id)?;
        resolve_device(&path).map_err(|e| {
            CsiError::Internal(format!(
                "error getting block device for volume: {disk_id}, err: {e}"
            ))
        })
    }

    async fn stage_filesystem(
        &self,
        device: &Device,
        mut params: StageParameters,
    ) -> Result<(), CsiError> {
        let mounts = self.mounter.list_mounts().await.map_err(|e| {
            CsiError::Internal(format!(
                "could not reliably determine existing mount status: {e}"
            ))
        })?;
        let existing = mounts_for_device(&mounts, device);

        if existing.is_empty() {
            if params.read_only {
                // Never format a volume the workload may only read.
                params.mount_flags.push("ro".to_owned());
                debug!(device = %device.full_path, target = %params.staging_target,
                    flags = ?params.mount_flags, "mounting read-only");
                self.mounter
                    .mount(
                        &device.full_path,
                        &params.staging_target,
                        &params.fs_type,
                        &params.mount_flags,
                    )
                    .await
                    .map_err(|e| stage_failed(&params, e))?;
            } else {
                debug!(device = %device.full_path, target = %params.staging_target,
                    fs_type = %params.fs_type, flags = ?params.mount_flags, "format and mount");
                self.mounter
                    .format_and_mount(
                        &device.full_path,
                        &params.staging_target,
                        &params.fs_type,
                        &params.mount_flags,
                    )
                    .await
                    .map_err(|e| stage_failed(&params, e))?;
            }
            info!(target = %params.staging_target, "device mounted");
            return Ok(());
        }

        let wanted = access_option(params.read_only);
        match existing.iter().find(|m| m.path == params.staging_target) {
            Some(m) if m.has_option(wanted) => {
                info!(target = %params.staging_target, option = wanted, "device already staged");
                Ok(())
            }
            Some(_) => Err(CsiError::AlreadyExists(format!(
                "access mode conflicts with existing mount at {:?}",
                params.staging_target
            ))),
            None => {
                warn!(device = %device.real_dev, "device is mounted outside the staging target");
                Err(CsiError::Internal(
                    "device already in use and mounted elsewhere".to_owned(),
                ))
            }
        }
    }

    pub(super) async fn unstage(
        &self,
        volume_id: &VolumeId,
        staging_target: &str,
    ) -> Result<(), CsiError> {
        if volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume ID required".to_owned()));
        }
        if staging_target.is_empty() {
            return Err(CsiError::InvalidArgument(
                "staging target path required".to_owned(),
            ));
        }

        if !verify_target_dir(staging_target, false).await? {
            info!(%staging_target, "staging target does not exist, nothing to unstage");
            return Ok(());
        }

        let mounts = self.mounter.list_mounts().await.map_err(|e| {
            CsiError::Internal(format!("could not retrieve existing mount points: {e}"))
        })?;
        if !contains_path(&mounts, staging_target) {
            info!(%staging_target, "staging target is not mounted");
            return remove_path(staging_target).await;
        }
        if classify_mount(&mounts, staging_target) == MountKind::FileShare {
            info!(%staging_target, "file share volumes are not staged");
            return Ok(());
        }

        let Some(device) = device_behind_mount(&mounts, staging_target).map_err(|e| {
            CsiError::Internal(format!(
                "error getting block device for volume: {volume_id}, err: {e}"
            ))
        })?
        else {
            info!(%staging_target, "no device behind staging target");
            return remove_path(staging_target).await;
        };

        // Anything still mounted besides the staging target means the
        // volume is published somewhere.
        let mounted = mounts_for_device(&mounts, &device);
        if mounted.len() > 1 {
            return Err(CsiError::Internal(format!(
                "volume: {volume_id} appears mounted in multiple places"
            )));
        }

        self.mounter.unmount(staging_target).await.map_err(|e| {
            CsiError::Internal(format!("error unmounting stagingTarget: {e}"))
        })?;
        debug!(%staging_target, device = %device.real_dev, "unmounted staging target");
        remove_path(staging_target).await?;
        info!(%staging_target, "volume unstaged");
        Ok(())
    }
}

fn stage_failed(params: &StageParameters, e: CsiError) -> CsiError {
    CsiError::Internal(format!(
        "error mounting volume {} at {}: {e}",
        params.volume_id, params.staging_target
    ))
}
