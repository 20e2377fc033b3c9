//! Core CSI types: volumes, capabilities, node requests, and topology.
//!
//! These types form the data model shared by the CSI traits, transport layer,
//! and the node backend.  They are all [`Serialize`]/[`Deserialize`] so they
//! can be transmitted over QUIC as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Publish-context key carrying the disk identifier of a block-backed volume.
pub const ATTRIBUTE_DISK_UUID: &str = "diskUUID";

/// Publish-context key carrying the network share endpoint of a file volume.
pub const ATTRIBUTE_NFS4_ACCESS_POINT: &str = "NFSv4.1";

/// Filesystem used for block-backed mount volumes when none is requested.
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Filesystem used for file-share volumes when none is requested.
pub const DEFAULT_FILE_SHARE_FS_TYPE: &str = "nfs4";

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Single-node read-write.
    ReadWriteOnce,
    /// Single-node read-only.
    ReadOnlyOnce,
    /// Multi-node read-only.
    ReadOnlyMany,
    /// Multi-node read-write.
    ReadWriteMany,
}

impl AccessMode {
    pub fn is_read_only(self) -> bool {
        matches!(self, Self::ReadOnlyOnce | Self::ReadOnlyMany)
    }

    pub fn is_multi_node(self) -> bool {
        matches!(self, Self::ReadOnlyMany | Self::ReadWriteMany)
    }
}

/// How the volume is presented to the workload, as requested by the CO.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessType {
    /// A mounted filesystem.
    Mount {
        /// Filesystem type; empty means "use the default".
        #[serde(default)]
        fs_type: String,
        /// Additional mount flags (e.g. `"noatime"`).
        #[serde(default)]
        mount_flags: Vec<String>,
    },
    /// A raw block device node.
    Block,
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Requested presentation.
    pub access_type: AccessType,
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::ReadWriteOnce,
            access_type: AccessType::Mount {
                fs_type: String::new(),
                mount_flags: Vec::new(),
            },
        }
    }
}

/// The controller branch a request runs through, derived from a
/// [`VolumeCapability`] and never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// Block-backed volume formatted and mounted as a filesystem.
    Mount {
        fs_type: String,
        mount_flags: Vec<String>,
    },
    /// Block-backed volume exposed as a raw device node.
    Block,
    /// Network file share mounted directly into the workload.
    FileShare {
        fs_type: String,
        mount_flags: Vec<String>,
    },
}

fn is_nfs(fs_type: &str) -> bool {
    matches!(fs_type.to_ascii_lowercase().as_str(), "nfs" | "nfs4")
}

impl VolumeCapability {
    /// Classify the request into one of the three node branches.
    ///
    /// A mount capability is a file share when its filesystem is NFS or when
    /// it is requested by more than one node.  An empty filesystem type is
    /// replaced by the branch default.
    pub fn capability(&self) -> Capability {
        match &self.access_type {
            AccessType::Block => Capability::Block,
            AccessType::Mount {
                fs_type,
                mount_flags,
            } => {
                if is_nfs(fs_type) || self.access_mode.is_multi_node() {
                    let fs_type = if fs_type.is_empty() {
                        DEFAULT_FILE_SHARE_FS_TYPE.to_owned()
                    } else {
                        fs_type.to_ascii_lowercase()
                    };
                    Capability::FileShare {
                        fs_type,
                        mount_flags: mount_flags.clone(),
                    }
                } else {
                    let fs_type = if fs_type.is_empty() {
                        DEFAULT_FS_TYPE.to_owned()
                    } else {
                        fs_type.to_ascii_lowercase()
                    };
                    Capability::Mount {
                        fs_type,
                        mount_flags: mount_flags.clone(),
                    }
                }
            }
        }
    }

    /// Whether the access mode only allows reading.
    pub fn is_read_only(&self) -> bool {
        self.access_mode.is_read_only()
    }
}

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    /// Topology segments, e.g. `{"topology.kubernetes.io/zone": "zone-a"}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to stage a volume at a node-global path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Global staging mount point, pre-created by the CO,
    /// e.g. `/var/lib/kubelet/plugins/kubernetes.io/csi/pv/<pv>/globalmount`.
    pub staging_target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Context produced by attach; carries [`ATTRIBUTE_DISK_UUID`].
    #[serde(default)]
    pub publish_context: HashMap<String, String>,
    /// Opaque context carried from volume creation.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to publish a staged volume into a workload-specific path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// The global staging mount point (source of the bind mount).
    #[serde(default)]
    pub staging_target_path: String,
    /// Workload target path; created by the plugin if absent.
    pub target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Context produced by attach; carries the disk identifier or the
    /// file-share endpoint.
    #[serde(default)]
    pub publish_context: HashMap<String, String>,
    /// Whether the mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Requested size bounds for an expansion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CapacityRange {
    /// Minimum acceptable size in bytes.
    pub required_bytes: i64,
    /// Maximum acceptable size in bytes; zero means unbounded.
    #[serde(default)]
    pub limit_bytes: i64,
}

/// Request to grow a mounted filesystem after its device has grown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExpandVolumeRequest {
    pub volume_id: VolumeId,
    /// Path the volume is mounted at.
    pub volume_path: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeExpandVolumeResponse {
    /// Size of the volume after expansion, rounded up to whole MiB.
    pub capacity_bytes: i64,
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UsageUnit {
    Bytes,
    Inodes,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeUsage {
    pub available: u64,
    pub total: u64,
    pub used: u64,
    pub unit: UsageUnit,
}

/// Filesystem usage for a published volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeStats {
    pub usage: Vec<VolumeUsage>,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"csi.rk8s.io"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Volumes can be grown while published.
    VolumeExpansionOnline,
}

/// Optional RPCs implemented by the Node service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeServiceCapability {
    StageUnstageVolume,
    ExpandVolume,
    GetVolumeStats,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: String,
    /// Maximum number of volumes the node can host; zero means unlimited.
    pub max_volumes: u64,
    /// Optional topology of this node.
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
    /// Hardware UUID of the node, lower-cased, when it could be read.
    #[serde(default)]
    pub system_uuid: Option<String>,
}
