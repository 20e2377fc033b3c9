//! CSI protocol messages transmitted over QUIC.
//!
//! [`CsiMessage`] is the top-level envelope for every request and response
//! exchanged between the orchestrator (client side) and the node plugin
//! (server side) over QUIC bi-directional streams.

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// Top-level message envelope for CSI over QUIC.
///
/// Each QUIC bi-stream carries exactly one request followed by one response.
/// The client sends a *request* variant and the server replies with the
/// corresponding *response* variant (or [`CsiMessage::Error`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Requests --------------------------------------------------------
    /// Make an attached volume usable at its staging path (Node).
    StageVolume(NodeStageVolumeRequest),
    /// Unstage a previously staged volume (Node).
    UnstageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },
    /// Publish a volume into a workload target path (Node).
    PublishVolume(NodePublishVolumeRequest),
    /// Unpublish a previously published volume (Node).
    UnpublishVolume {
        volume_id: VolumeId,
        target_path: String,
    },
    /// Grow the filesystem of a mounted volume (Node).
    ExpandVolume(NodeExpandVolumeRequest),
    /// Usage of a mounted volume (Node).
    GetVolumeStats {
        volume_id: VolumeId,
        volume_path: String,
    },
    /// Optional node RPCs the plugin implements (Node).
    GetNodeCapabilities,
    /// Query node info (Node).
    GetNodeInfo,

    /// Health probe (Identity).
    Probe,
    /// Query plugin info (Identity).
    GetPluginInfo,
    /// Query plugin capabilities (Identity).
    GetPluginCapabilities,

    // ----- Responses -------------------------------------------------------
    /// Plugin information.
    PluginInfoResponse(PluginInfo),
    /// Plugin capabilities.
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    /// Node information.
    NodeInfoResponse(NodeInfo),
    /// Node service capabilities.
    NodeCapabilitiesResponse(Vec<NodeServiceCapability>),
    /// Result of an expansion.
    VolumeExpanded(NodeExpandVolumeResponse),
    /// Usage of a volume.
    VolumeStatsResponse(VolumeStats),

    /// Generic success acknowledgement (no payload).
    Ok,
    /// Probe result.
    ProbeResult(bool),
    /// An error occurred.
    Error(CsiError),
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StageVolume(req) => write!(f, "StageVolume({})", req.volume_id),
            Self::UnstageVolume { volume_id, .. } => write!(f, "UnstageVolume({})", volume_id),
            Self::PublishVolume(req) => write!(f, "PublishVolume({})", req.volume_id),
            Self::UnpublishVolume { volume_id, .. } => {
                write!(f, "UnpublishVolume({})", volume_id)
            }
            Self::ExpandVolume(req) => write!(f, "ExpandVolume({})", req.volume_id),
            Self::GetVolumeStats { volume_id, .. } => write!(f, "GetVolumeStats({})", volume_id),
            Self::GetNodeCapabilities => f.write_str("GetNodeCapabilities"),
            Self::GetNodeInfo => f.write_str("GetNodeInfo"),
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::PluginInfoResponse(info) => {
                write!(f, "PluginInfo(name={})", info.name)
            }
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::NodeCapabilitiesResponse(caps) => {
                write!(f, "NodeCapabilities(count={})", caps.len())
            }
            Self::VolumeExpanded(resp) => write!(f, "VolumeExpanded({})", resp.capacity_bytes),
            Self::VolumeStatsResponse(stats) => {
                write!(f, "VolumeStats(count={})", stats.usage.len())
            }
            Self::Ok => f.write_str("Ok"),
            Self::ProbeResult(ok) => write!(f, "ProbeResult({})", ok),
            Self::Error(e) => write!(f, "Error({})", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_request_survives_the_wire() {
        let msg = CsiMessage::StageVolume(NodeStageVolumeRequest {
            volume_id: VolumeId::from("vol-1"),
            staging_target_path: "/staging".into(),
            volume_capability: VolumeCapability::default(),
            publish_context: [(ATTRIBUTE_DISK_UUID.to_owned(), "6000c29".to_owned())].into(),
            volume_context: Default::default(),
        });
        let json = serde_json::to_string(&msg).expect("serialize");
        let de: CsiMessage = serde_json::from_str(&json).expect("deserialize");
        match de {
            CsiMessage::StageVolume(req) => {
                assert_eq!(req.publish_context[ATTRIBUTE_DISK_UUID], "6000c29");
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn error_message_keeps_its_kind() {
        let msg = CsiMessage::Error(CsiError::FailedPrecondition("not staged".into()));
        let json = serde_json::to_string(&msg).expect("serialize");
        let de: CsiMessage = serde_json::from_str(&json).expect("deserialize");
        assert!(matches!(de, CsiMessage::Error(CsiError::FailedPrecondition(_))));
    }

    #[test]
    fn display_formatting() {
        assert_eq!(CsiMessage::Ok.to_string(), "Ok");
        let msg = CsiMessage::UnpublishVolume {
            volume_id: VolumeId::from("vol-1"),
            target_path: "/t".into(),
        };
        assert_eq!(msg.to_string(), "UnpublishVolume(vol-1)");
    }
}
