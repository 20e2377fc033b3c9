//! NodePublishVolume.

use tracing::{debug, info};

use super::{DiskNode, access_option, make_dir, make_file, verify_target_dir};
use crate::device::Device;
use crate::error::CsiError;
use crate::mounter::Mounter;
use crate::mounts::{MountRecord, mounts_for_device};
use crate::types::{ATTRIBUTE_NFS4_ACCESS_POINT, Capability, NodePublishVolumeRequest, VolumeId};

/// Everything a block-backed publish needs, built fresh per call.
#[derive(Debug)]
struct PublishParameters {
    volume_id: VolumeId,
    target: String,
    staging_target: String,
    disk_id: String,
    device: Device,
    read_only: bool,
}

/// Check an existing mount at the target against the requested access.
fn already_published(mount: &MountRecord, read_only: bool) -> Result<(), CsiError> {
    if mount.has_option(access_option(read_only)) {
        info!(target = %mount.path, "volume already published to target");
        Ok(())
    } else {
        Err(CsiError::AlreadyExists(
            "volume previously published with different options".to_owned(),
        ))
    }
}

impl<M: Mounter> DiskNode<M> {
    pub(super) async fn publish(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        if req.volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume ID required".to_owned()));
        }
        if req.target_path.is_empty() {
            return Err(CsiError::InvalidArgument("target path required".to_owned()));
        }

        // `None` selects the raw block branch.
        let mount_flags = match req.volume_capability.capability() {
            Capability::FileShare {
                fs_type,
                mount_flags,
            } => return self.publish_file_share(&req, &fs_type, mount_flags).await,
            Capability::Block => {
                // A read-only bind of a device node does not stop writes to
                // the device itself.
                if req.read_only {
                    return Err(CsiError::InvalidArgument(
                        "read only not supported for Block Volume".to_owned(),
                    ));
                }
                None
            }
            Capability::Mount { mount_flags, .. } => Some(mount_flags),
        };
        if req.staging_target_path.is_empty() {
            return Err(CsiError::FailedPrecondition(
                "staging target path not set".to_owned(),
            ));
        }

        let disk_id = super::disk_id(&req.publish_context)?;
        let device = self.attached_device(&req.publish_context)?;
        let params = PublishParameters {
            volume_id: req.volume_id,
            target: req.target_path,
            staging_target: req.staging_target_path,
            disk_id,
            device,
            read_only: req.read_only,
        };
        debug!(?params, "publishing disk volume");

        match mount_flags {
            Some(flags) => self.publish_mount(&params, flags).await,
            None => self.publish_block(&params).await,
        }
    }

    async fn device_mounts(&self, params: &PublishParameters) -> Result<Vec<MountRecord>, CsiError> {
        let mounts = self.mounter.list_mounts().await.map_err(|e| {
            CsiError::Internal(format!(
                "could not reliably determine existing mount status: {e}"
            ))
        })?;
        let existing = mounts_for_device(&mounts, &params.device)
            .into_iter()
            .cloned()
            .collect::<Vec<_>>();
        debug!(device = %params.device.real_dev, mounts = existing.len(), "device mounts");
        Ok(existing)
    }

    async fn publish_mount(
        &self,
        params: &PublishParameters,
        mut mount_flags: Vec<String>,
    ) -> Result<(), CsiError> {
        make_dir(&params.target).await?;
        verify_target_dir(&params.staging_target, true).await?;

        let existing = self.device_mounts(params).await?;
        if existing.is_empty() {
            return Err(CsiError::FailedPrecondition(format!(
                "Volume ID: {:?} does not appear staged to {:?}",
                params.volume_id.0, params.staging_target
            )));
        }
        if let Some(m) = existing.iter().find(|m| m.path == params.target) {
            return already_published(m, params.read_only);
        }
        if !existing.iter().any(|m| m.path == params.staging_target) {
            return Err(CsiError::Internal(format!(
                "disk {} is mounted but not at staging target {:?}",
                params.disk_id, params.staging_target
            )));
        }

        if params.read_only {
            mount_flags.push("ro".to_owned());
        }
        debug!(source = %params.staging_target, target = %params.target,
            flags = ?mount_flags, "bind mounting staging target");
        self.mounter
            .bind_mount(&params.staging_target, &params.target, &mount_flags)
            .await
            .map_err(|e| publish_failed(params, e))?;
        info!(target = %params.target, "volume published");
        Ok(())
    }

    async fn publish_block(&self, params: &PublishParameters) -> Result<(), CsiError> {
        make_file(&params.target).await?;

        let existing = self.device_mounts(params).await?;
        match existing.as_slice() {
            [] => {
                debug!(source = %params.device.full_path, target = %params.target,
                    "bind mounting device");
                self.mounter
                    .bind_mount(&params.device.full_path, &params.target, &[])
                    .await
                    .map_err(|e| publish_failed(params, e))?;
                info!(target = %params.target, "block volume published");
                Ok(())
            }
            [m] if m.path == params.target => {
                info!(target = %params.target, "block volume already published to target");
                Ok(())
            }
            [_] => Err(CsiError::Internal(
                "device already in use and mounted elsewhere".to_owned(),
            )),
            _ => Err(CsiError::AlreadyExists(
                "block volume already mounted in more than one place".to_owned(),
            )),
        }
    }

    async fn publish_file_share(
        &self,
        req: &NodePublishVolumeRequest,
        fs_type: &str,
        mut mount_flags: Vec<String>,
    ) -> Result<(), CsiError> {
        let target = &req.target_path;
        make_dir(target).await?;

        let mounts = self.mounter.list_mounts().await.map_err(|e| {
            CsiError::Internal(format!("could not retrieve existing mount points: {e}"))
        })?;
        if let Some(m) = mounts.iter().find(|m| &m.path == target) {
            return already_published(m, req.read_only);
        }

        if req.read_only {
            mount_flags.push("ro".to_owned());
        }
        if self.config.is_guest_cluster() {
            mount_flags.push("hard".to_owned());
        }
        let source = req
            .publish_context
            .get(ATTRIBUTE_NFS4_ACCESS_POINT)
            .ok_or_else(|| {
                CsiError::Internal("NFSv4 accesspoint not set in publish context".to_owned())
            })?;

        debug!(%source, %target, %fs_type, flags = ?mount_flags, "mounting file share");
        self.mounter
            .mount(source, target, fs_type, &mount_flags)
            .await
            .map_err(|e| {
                CsiError::Internal(format!(
                    "error publish volume {} to target path {target}: {e}",
                    req.volume_id
                ))
            })?;
        info!(%target, "file share published");
        Ok(())
    }
}

fn publish_failed(params: &PublishParameters, e: CsiError) -> CsiError {
    CsiError::Internal(format!(
        "error mounting volume {} at {}: {e}",
        params.volume_id, params.target
    ))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::super::testing::*;
    use crate::config::ClusterFlavor;
    use crate::error::CsiError;
    use crate::mounts::MountRecord;
    use crate::node::CsiNode;
    use crate::types::*;

    fn publish_request(
        h: &Harness,
        staging: &str,
        target: &str,
        capability: VolumeCapability,
        read_only: bool,
    ) -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: VolumeId::from("vol-1"),
            staging_target_path: staging.to_owned(),
            target_path: target.to_owned(),
            volume_capability: capability,
            publish_context: h.publish_context(),
            read_only,
        }
    }

    fn nfs_context() -> HashMap<String, String> {
        HashMap::from([(
            ATTRIBUTE_NFS4_ACCESS_POINT.to_owned(),
            "fs.example:/5231f3d8".to_owned(),
        )])
    }

    #[tokio::test]
    async fn mount_publish_binds_staging_target() {
        let h = Harness::new();
        let staging = h.dir("staging");
        h.mounter().add_mount(disk_mount(&staging, "rw"));
        let target = h.path("pods/p1/mount");

        let req = publish_request(
            &h,
            &staging,
            &target,
            mount_capability(AccessMode::ReadWriteOnce),
            true,
        );
        h.node.publish_volume(req.clone()).await.unwrap();
        assert!(h.exists(&target));

        let mounts = h.mounter().mounts();
        let published = mounts.iter().find(|m| m.path == target).unwrap();
        assert!(published.has_option("ro"));
        assert!(published.has_option("noatime"));

        // Second call finds the bind mount and does nothing.
        h.node.publish_volume(req).await.unwrap();
        assert_eq!(h.mounter().mounts().len(), 2);
    }

    #[tokio::test]
    async fn mount_publish_with_different_access_is_already_exists() {
        let h = Harness::new();
        let staging = h.dir("staging");
        let target = h.dir("target");
        h.mounter().add_mount(disk_mount(&staging, "rw"));
        h.mounter().add_mount(disk_mount(&target, "ro"));

        let req = publish_request(
            &h,
            &staging,
            &target,
            mount_capability(AccessMode::ReadWriteOnce),
            false,
        );
        assert!(matches!(
            h.node.publish_volume(req).await,
            Err(CsiError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn mount_publish_requires_staged_device() {
        let h = Harness::new();
        let staging = h.dir("staging");
        let target = h.path("target");
        let req = publish_request(
            &h,
            &staging,
            &target,
            mount_capability(AccessMode::ReadWriteOnce),
            false,
        );
        assert!(matches!(
            h.node.publish_volume(req.clone()).await,
            Err(CsiError::FailedPrecondition(_))
        ));

        let mut req = req;
        req.staging_target_path = String::new();
        assert!(matches!(
            h.node.publish_volume(req).await,
            Err(CsiError::FailedPrecondition(_))
        ));
    }

    #[tokio::test]
    async fn mount_publish_binds_even_when_published_elsewhere() {
        let h = Harness::new();
        let staging = h.dir("staging");
        h.mounter().add_mount(disk_mount(&staging, "rw"));
        h.mounter().add_mount(disk_mount("/pods/p0/mount", "rw"));
        let target = h.path("pods/p1/mount");

        let req = publish_request(
            &h,
            &staging,
            &target,
            mount_capability(AccessMode::ReadWriteOnce),
            false,
        );
        h.node.publish_volume(req).await.unwrap();

        assert!(
            h.mounter()
                .calls()
                .contains(&format!("bind {staging} {target}"))
        );
        let mounts = h.mounter().mounts();
        assert_eq!(mounts.len(), 3);
        assert!(mounts.iter().any(|m| m.path == target && m.device == REAL_DEV));
    }

    #[tokio::test]
    async fn mount_publish_with_two_foreign_mounts_is_internal() {
        let h = Harness::new();
        let staging = h.dir("staging");
        let target = h.path("target");
        h.mounter().add_mount(disk_mount("/elsewhere/a", "rw"));
        h.mounter().add_mount(disk_mount("/elsewhere/b", "rw"));

        let req = publish_request(
            &h,
            &staging,
            &target,
            mount_capability(AccessMode::ReadWriteOnce),
            false,
        );
        assert!(matches!(
            h.node.publish_volume(req).await,
            Err(CsiError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn block_publish_rejects_read_only() {
        let h = Harness::new();
        let target = h.path("dev-target");
        let mut req = publish_request(&h, "", &target, block_capability(), true);
        req.publish_context.clear();
        assert!(matches!(
            h.node.publish_volume(req).await,
            Err(CsiError::InvalidArgument(_))
        ));
        assert!(!h.exists(&target));
    }

    #[tokio::test]
    async fn block_publish_binds_device() {
        let h = Harness::new();
        let staging = h.dir("staging");
        let target = h.path("dev-target");
        let req = publish_request(&h, &staging, &target, block_capability(), false);

        h.node.publish_volume(req.clone()).await.unwrap();
        let mounts = h.mounter().mounts();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].device, "devtmpfs");
        assert_eq!(mounts[0].source, REAL_DEV);
        assert!(std::path::Path::new(&target).is_file());

        h.node.publish_volume(req).await.unwrap();
        assert_eq!(h.mounter().mounts().len(), 1);
    }

    #[tokio::test]
    async fn block_publish_conflicts() {
        let h = Harness::new();
        let staging = h.dir("staging");
        let target = h.path("dev-target");
        h.mounter().add_mount(disk_mount("/elsewhere/a", "rw"));
        let req = publish_request(&h, &staging, &target, block_capability(), false);
        assert!(matches!(
            h.node.publish_volume(req.clone()).await,
            Err(CsiError::Internal(_))
        ));

        h.mounter().add_mount(MountRecord {
            device: "udev".into(),
            path: "/elsewhere/b".into(),
            source: REAL_DEV.into(),
            fs_type: "devtmpfs".into(),
            opts: vec!["rw".into()],
        });
        assert!(matches!(
            h.node.publish_volume(req).await,
            Err(CsiError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn file_share_publish_mounts_access_point() {
        let h = Harness::build(|c| c.cluster_flavor = ClusterFlavor::Guest);
        let target = h.path("pods/p1/share");
        let mut req = publish_request(&h, "", &target, file_capability(), false);
        req.publish_context = nfs_context();

        h.node.publish_volume(req.clone()).await.unwrap();
        let mounts = h.mounter().mounts();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].fs_type, "nfs4");
        assert!(mounts[0].has_option("hard"));
        assert!(h.mounter().calls()[0].starts_with("mount fs.example:/5231f3d8 "));

        h.node.publish_volume(req.clone()).await.unwrap();
        assert_eq!(h.mounter().mounts().len(), 1);

        req.read_only = true;
        assert!(matches!(
            h.node.publish_volume(req).await,
            Err(CsiError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn file_share_publish_needs_access_point() {
        let h = Harness::new();
        let target = h.path("share");
        let mut req = publish_request(&h, "", &target, file_capability(), false);
        req.publish_context.clear();
        assert!(matches!(
            h.node.publish_volume(req).await,
            Err(CsiError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn missing_disk_id_is_invalid() {
        let h = Harness::new();
        let staging = h.dir("staging");
        let mut req = publish_request(
            &h,
            &staging,
            &h.path("target"),
            mount_capability(AccessMode::ReadWriteOnce),
            false,
        );
        req.publish_context.clear();
        assert!(matches!(
            h.node.publish_volume(req).await,
            Err(CsiError::InvalidArgument(_))
        ));
    }
}
