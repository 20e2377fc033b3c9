//! NodeExpandVolume.

use tracing::{debug, info};

use super::DiskNode;
use crate::device::{device_behind_mount, rescan_device};
use crate::error::CsiError;
use crate::mounter::Mounter;
use crate::types::{NodeExpandVolumeRequest, NodeExpandVolumeResponse};

const MIB: u64 = 1024 * 1024;

/// Round `bytes` up to a whole number of MiB, or `None` when the rounded
/// size no longer fits the response.
fn round_up_to_mib(bytes: i64) -> Option<i64> {
    let bytes = u64::try_from(bytes).ok()?;
    let rounded = bytes.div_ceil(MIB).checked_mul(MIB)?;
    i64::try_from(rounded).ok()
}

impl<M: Mounter> DiskNode<M> {
    pub(super) async fn expand(
        &self,
        req: NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse, CsiError> {
        let volume_id = &req.volume_id;
        if volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume id must be provided".to_owned(),
            ));
        }
        let Some(range) = req.capacity_range else {
            return Err(CsiError::InvalidArgument(
                "capacity range must be provided".to_owned(),
            ));
        };
        if range.required_bytes < 0 || range.limit_bytes < 0 {
            return Err(CsiError::InvalidArgument(
                "capacity ranges values cannot be negative".to_owned(),
            ));
        }
        let volume_path = req.volume_path.as_str();
        if volume_path.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume path must be provided to expand volume on node".to_owned(),
            ));
        }

        let required = range.required_bytes;
        let capacity_bytes = round_up_to_mib(required).ok_or_else(|| {
            CsiError::InvalidArgument(format!("required bytes out of range: {required}"))
        })?;

        let mounts = self.mounter.list_mounts().await.map_err(|e| {
            CsiError::Internal(format!("could not retrieve existing mount points: {e}"))
        })?;
        let device = device_behind_mount(&mounts, volume_path)
            .map_err(|e| {
                CsiError::Internal(format!(
                    "error getting block device for volume: {volume_id}, err: {e}"
                ))
            })?
            .ok_or_else(|| {
                CsiError::Internal(format!(
                    "volume {volume_id} is not mounted at the path {volume_path}"
                ))
            })?;
        debug!(%volume_path, device = %device.real_dev, "found device behind volume path");

        if self.config.online_expansion {
            let current = self.block_size(&device.real_dev).await?;
            // An attached disk grown underneath the guest keeps its old size
            // until the kernel rescans it.
            if current < required {
                debug!(current, required, "rescanning device");
                rescan_device(&self.config.paths.sys_block_dir, &device)?;
            }
        }

        self.mounter
            .resize_fs(&device.real_dev, volume_path)
            .await
            .map_err(|e| {
                CsiError::Internal(format!(
                    "error when resizing filesystem on volume {volume_id} on node: {e}"
                ))
            })?;

        let current = self.block_size(&device.real_dev).await?;
        if current < required {
            return Err(CsiError::Internal(format!(
                "requested volume size was {required}, but got volume with size {current}"
            )));
        }

        info!(device = %device.real_dev, %volume_path, capacity_bytes, "volume expanded");
        Ok(NodeExpandVolumeResponse { capacity_bytes })
    }

    async fn block_size(&self, device: &str) -> Result<i64, CsiError> {
        let bytes = self.mounter.block_size_bytes(device).await.map_err(|e| {
            CsiError::Internal(format!(
                "error when getting size of block volume at path {device}: {e}"
            ))
        })?;
        i64::try_from(bytes)
            .map_err(|_| CsiError::Internal(format!("size of {device} out of range: {bytes}")))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::node::CsiNode;
    use crate::types::{CapacityRange, VolumeId};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn expand_request(path: &str, required: i64) -> NodeExpandVolumeRequest {
        NodeExpandVolumeRequest {
            volume_id: VolumeId::from("vol-1"),
            volume_path: path.to_owned(),
            capacity_range: Some(CapacityRange {
                required_bytes: required,
                limit_bytes: 0,
            }),
        }
    }

    #[test]
    fn rounds_up_to_whole_mib() {
        let mib = MIB as i64;
        assert_eq!(round_up_to_mib(1), Some(mib));
        assert_eq!(round_up_to_mib(mib), Some(mib));
        assert_eq!(round_up_to_mib(mib + 1), Some(2 * mib));
        assert_eq!(round_up_to_mib(0), Some(0));
        assert_eq!(round_up_to_mib(i64::MAX), None);
        assert_eq!(round_up_to_mib(-1), None);
    }

    #[tokio::test]
    async fn rejects_malformed_requests() {
        let h = Harness::new();
        let mut req = expand_request("/staging", 1);
        req.capacity_range = None;
        assert!(matches!(
            h.node.expand_volume(req).await,
            Err(CsiError::InvalidArgument(_))
        ));
        assert!(matches!(
            h.node.expand_volume(expand_request("/staging", -1)).await,
            Err(CsiError::InvalidArgument(_))
        ));
        assert!(matches!(
            h.node.expand_volume(expand_request("", 1)).await,
            Err(CsiError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn oversized_request_is_invalid() {
        let h = Harness::new();
        let staging = h.dir("staging");
        h.mounter().add_mount(disk_mount(&staging, "rw"));
        let err = h
            .node
            .expand_volume(expand_request(&staging, i64::MAX))
            .await;
        assert!(matches!(err, Err(CsiError::InvalidArgument(_))));
        assert!(!h.mounter().calls().iter().any(|c| c.starts_with("resize ")));
    }

    #[tokio::test]
    async fn unmounted_path_is_internal() {
        let h = Harness::new();
        assert!(matches!(
            h.node.expand_volume(expand_request(&h.path("staging"), 1)).await,
            Err(CsiError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn resizes_and_reports_rounded_capacity() {
        let h = Harness::new();
        let staging = h.dir("staging");
        h.mounter().add_mount(disk_mount(&staging, "rw"));
        h.mounter().set_block_size(REAL_DEV, 2 * GIB);

        let resp = h
            .node
            .expand_volume(expand_request(&staging, 2 * GIB as i64 - 10))
            .await
            .unwrap();
        assert_eq!(resp.capacity_bytes, 2 * GIB as i64);
        assert!(
            h.mounter()
                .calls()
                .contains(&format!("resize {REAL_DEV} {staging}"))
        );
    }

    #[tokio::test]
    async fn device_that_did_not_grow_fails() {
        let h = Harness::new();
        let staging = h.dir("staging");
        h.mounter().add_mount(disk_mount(&staging, "rw"));
        h.mounter().set_block_size(REAL_DEV, GIB);

        let err = h
            .node
            .expand_volume(expand_request(&staging, 2 * GIB as i64))
            .await;
        assert!(matches!(err, Err(CsiError::Internal(_))));
    }

    #[tokio::test]
    async fn online_expansion_rescans_smaller_device() {
        let h = Harness::build(|c| c.online_expansion = true);
        let staging = h.dir("staging");
        h.mounter().add_mount(disk_mount(&staging, "rw"));
        h.mounter().set_block_size(REAL_DEV, GIB);
        h.mounter().grow_on_resize(REAL_DEV, 2 * GIB);

        h.node
            .expand_volume(expand_request(&staging, 2 * GIB as i64))
            .await
            .unwrap();
        let rescan = h.tmp.path().join("block/null/device/rescan");
        assert_eq!(std::fs::read(rescan).unwrap(), b"1");
    }
}
