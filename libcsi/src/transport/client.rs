//! QUIC client used by the orchestrator to drive a node plugin.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicClientConfig;
use tracing::{debug, instrument};

use crate::error::CsiError;
use crate::message::CsiMessage;
use crate::types::*;

/// A lightweight CSI client that sends [`CsiMessage`] requests over a single
/// QUIC connection and returns the server's response.
pub struct CsiClient {
    connection: quinn::Connection,
}

/// Turn a reply into `Ok` via `pick`, errors into `Err`, and anything else
/// into a transport error.
fn expect_reply<R>(
    reply: CsiMessage,
    pick: impl FnOnce(CsiMessage) -> Result<R, CsiMessage>,
) -> Result<R, CsiError> {
    match reply {
        CsiMessage::Error(e) => Err(e),
        other => pick(other)
            .map_err(|other| CsiError::TransportError(format!("unexpected response: {other}"))),
    }
}

fn ack(reply: CsiMessage) -> Result<(), CsiError> {
    expect_reply(reply, |m| match m {
        CsiMessage::Ok => Ok(()),
        other => Err(other),
    })
}

impl CsiClient {
    /// Establish a new QUIC connection to the node plugin at `addr`.
    ///
    /// * `addr`: socket address of the remote plugin
    /// * `server_name`: TLS SNI name that must match a SAN in the server's
    ///   certificate
    /// * `tls_config`: client TLS configuration
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        tls_config: rustls::ClientConfig,
    ) -> Result<Self, CsiError> {
        let quic_client_config = QuicClientConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let client_config = quinn::ClientConfig::new(Arc::new(quic_client_config));

        let bind = if addr.is_ipv6() {
            SocketAddr::from(([0u16; 8], 0))
        } else {
            SocketAddr::from(([0, 0, 0, 0], 0))
        };
        let mut endpoint = quinn::Endpoint::client(bind).map_err(CsiError::transport)?;
        endpoint.set_default_client_config(client_config);

        let connection = endpoint
            .connect(addr, server_name)
            .map_err(CsiError::transport)?
            .await
            .map_err(CsiError::transport)?;

        debug!(%addr, %server_name, "CSI QUIC connection established");
        Ok(Self { connection })
    }

    /// Send a request and wait for the corresponding response.
    ///
    /// Each call opens a new bi-directional QUIC stream, writes the
    /// JSON-serialized request, finishes the send side, then reads the
    /// full response and deserializes it.
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        let (mut send, mut recv) = self
            .connection
            .open_bi()
            .await
            .map_err(CsiError::transport)?;

        let payload = serde_json::to_vec(msg).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;

        let buf = recv
            .read_to_end(16 * 1024 * 1024) // 16 MiB upper bound
            .await
            .map_err(CsiError::transport)?;

        let response: CsiMessage = serde_json::from_slice(&buf).map_err(CsiError::transport)?;
        debug!(%response, "CSI response received");
        Ok(response)
    }

    // ---- Node ----

    pub async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        ack(self.request(&CsiMessage::StageVolume(req)).await?)
    }

    pub async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        let msg = CsiMessage::UnstageVolume {
            volume_id: volume_id.clone(),
            staging_target_path: staging_target_path.to_owned(),
        };
        ack(self.request(&msg).await?)
    }

    pub async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        ack(self.request(&CsiMessage::PublishVolume(req)).await?)
    }

    pub async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        let msg = CsiMessage::UnpublishVolume {
            volume_id: volume_id.clone(),
            target_path: target_path.to_owned(),
        };
        ack(self.request(&msg).await?)
    }

    pub async fn expand_volume(
        &self,
        req: NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse, CsiError> {
        let reply = self.request(&CsiMessage::ExpandVolume(req)).await?;
        expect_reply(reply, |m| match m {
            CsiMessage::VolumeExpanded(resp) => Ok(resp),
            other => Err(other),
        })
    }

    pub async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError> {
        let msg = CsiMessage::GetVolumeStats {
            volume_id: volume_id.clone(),
            volume_path: volume_path.to_owned(),
        };
        expect_reply(self.request(&msg).await?, |m| match m {
            CsiMessage::VolumeStatsResponse(stats) => Ok(stats),
            other => Err(other),
        })
    }

    pub async fn get_node_capabilities(&self) -> Result<Vec<NodeServiceCapability>, CsiError> {
        expect_reply(self.request(&CsiMessage::GetNodeCapabilities).await?, |m| match m {
            CsiMessage::NodeCapabilitiesResponse(caps) => Ok(caps),
            other => Err(other),
        })
    }

    pub async fn get_node_info(&self) -> Result<NodeInfo, CsiError> {
        expect_reply(self.request(&CsiMessage::GetNodeInfo).await?, |m| match m {
            CsiMessage::NodeInfoResponse(info) => Ok(info),
            other => Err(other),
        })
    }

    // ---- Identity ----

    pub async fn probe(&self) -> Result<bool, CsiError> {
        expect_reply(self.request(&CsiMessage::Probe).await?, |m| match m {
            CsiMessage::ProbeResult(ready) => Ok(ready),
            other => Err(other),
        })
    }

    pub async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        expect_reply(self.request(&CsiMessage::GetPluginInfo).await?, |m| match m {
            CsiMessage::PluginInfoResponse(info) => Ok(info),
            other => Err(other),
        })
    }

    pub async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        expect_reply(self.request(&CsiMessage::GetPluginCapabilities).await?, |m| match m {
            CsiMessage::PluginCapabilitiesResponse(caps) => Ok(caps),
            other => Err(other),
        })
    }

    /// Close the underlying QUIC connection gracefully.
    pub fn close(&self) {
        self.connection
            .close(quinn::VarInt::from_u32(0), b"client shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replies_map_to_results() {
        assert!(ack(CsiMessage::Ok).is_ok());
        assert!(matches!(
            ack(CsiMessage::Error(CsiError::NotFound("disk".into()))),
            Err(CsiError::NotFound(_))
        ));
        assert!(matches!(
            ack(CsiMessage::ProbeResult(true)),
            Err(CsiError::TransportError(_))
        ));
    }
}
