//! NodeGetVolumeStats and NodeGetInfo.

use nix::sys::statvfs::statvfs;
use tracing::{debug, warn};

use super::DiskNode;
use crate::dmi::system_uuid;
use crate::error::CsiError;
use crate::mounter::Mounter;
use crate::types::{NodeInfo, Topology, UsageUnit, VolumeId, VolumeStats, VolumeUsage};

impl<M: Mounter> DiskNode<M> {
    pub(super) async fn volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError> {
        if volume_path.is_empty() {
            return Err(CsiError::InvalidArgument(format!(
                "received empty volume path for volume {volume_id}"
            )));
        }

        let st = statvfs(volume_path)
            .map_err(|e| CsiError::Internal(format!("statvfs {volume_path}: {e}")))?;
        let frsize = st.fragment_size() as u64;
        let blocks = st.blocks() as u64;
        let blocks_free = st.blocks_free() as u64;
        let files = st.files() as u64;
        let files_free = st.files_free() as u64;

        let bytes = VolumeUsage {
            available: st.blocks_available() as u64 * frsize,
            total: blocks * frsize,
            used: blocks.saturating_sub(blocks_free) * frsize,
            unit: UsageUnit::Bytes,
        };
        let inodes = VolumeUsage {
            available: files_free,
            total: files,
            used: files.saturating_sub(files_free),
            unit: UsageUnit::Inodes,
        };
        debug!(%volume_path, total = bytes.total, inodes = inodes.total, "volume stats");
        Ok(VolumeStats {
            usage: vec![bytes, inodes],
        })
    }

    pub(super) fn node_info(&self) -> NodeInfo {
        // Guest clusters report an empty topology; elsewhere topology is
        // owned by the control plane.
        let accessible_topology = self.config.is_guest_cluster().then(Topology::default);
        let system_uuid = match system_uuid(&self.config.paths.dmi_dir) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "could not read system uuid");
                None
            }
        };
        NodeInfo {
            node_id: self.config.node_name.clone(),
            max_volumes: self.config.max_volumes_per_node,
            accessible_topology,
            system_uuid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::config::ClusterFlavor;
    use crate::error::CsiError;
    use crate::node::CsiNode;
    use crate::types::*;

    #[tokio::test]
    async fn stats_report_bytes_and_inodes() {
        let h = Harness::new();
        let dir = h.dir("vol");
        let stats = h
            .node
            .get_volume_stats(&VolumeId::from("vol-1"), &dir)
            .await
            .unwrap();
        assert_eq!(stats.usage.len(), 2);
        assert_eq!(stats.usage[0].unit, UsageUnit::Bytes);
        assert_eq!(stats.usage[1].unit, UsageUnit::Inodes);
        assert!(stats.usage[0].total > 0);
        assert!(stats.usage[0].used <= stats.usage[0].total);
    }

    #[tokio::test]
    async fn stats_need_an_existing_path() {
        let h = Harness::new();
        let vol = VolumeId::from("vol-1");
        assert!(matches!(
            h.node.get_volume_stats(&vol, "").await,
            Err(CsiError::InvalidArgument(_))
        ));
        assert!(matches!(
            h.node.get_volume_stats(&vol, &h.path("missing")).await,
            Err(CsiError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn node_info_reports_identity() {
        let h = Harness::new();
        let info = h.node.get_info().await.unwrap();
        assert_eq!(info.node_id, "test-node");
        assert_eq!(info.max_volumes, 0);
        assert!(info.accessible_topology.is_none());
        assert_eq!(
            info.system_uuid.as_deref(),
            Some("6b8c2042-0dd1-d037-156f-435f999d94c1")
        );

        let guest = Harness::build(|c| c.cluster_flavor = ClusterFlavor::Guest);
        let info = guest.node.get_info().await.unwrap();
        assert_eq!(info.accessible_topology, Some(Topology::default()));
    }
}
