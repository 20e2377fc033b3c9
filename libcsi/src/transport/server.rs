//! QUIC server that runs on each worker node and dispatches incoming CSI
//! requests to the plugin.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicServerConfig;
use tracing::{debug, error, info, instrument, warn};

use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;

/// A CSI server that accepts QUIC connections and dispatches
/// [`CsiMessage`] requests to a [`CsiIdentity`] + [`CsiNode`]
/// implementation.
pub struct CsiServer<T> {
    endpoint: quinn::Endpoint,
    handler: Arc<T>,
}

/// Wrap a handler result in a response message.
fn reply<R>(result: Result<R, CsiError>, wrap: impl FnOnce(R) -> CsiMessage) -> CsiMessage {
    match result {
        Ok(value) => wrap(value),
        Err(e) => {
            debug!(error = %e, code = ?e.code(), "request failed");
            CsiMessage::Error(e)
        }
    }
}

impl<T> CsiServer<T>
where
    T: CsiIdentity + CsiNode + 'static,
{
    /// Create a new server bound to `addr`.
    pub fn new(
        addr: SocketAddr,
        tls_config: rustls::ServerConfig,
        handler: Arc<T>,
    ) -> Result<Self, CsiError> {
        let quic_server_config = QuicServerConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_server_config));
        let endpoint = quinn::Endpoint::server(server_config, addr).map_err(CsiError::transport)?;
        info!(%addr, "CSI QUIC server listening");
        Ok(Self { endpoint, handler })
    }

    /// Accept connections in a loop until the endpoint is closed.
    ///
    /// Each accepted connection spawns a Tokio task, and each bi-stream
    /// within a connection is handled concurrently.
    pub async fn serve(&self) -> Result<(), CsiError> {
        while let Some(incoming) = self.endpoint.accept().await {
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        let remote = conn.remote_address();
                        debug!(%remote, "CSI connection accepted");
                        if let Err(e) = Self::handle_connection(conn, handler).await {
                            warn!(%remote, error = %e, "CSI connection error");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "CSI incoming connection failed");
                    }
                }
            });
        }
        Ok(())
    }

    /// Handle all bi-streams on a single connection.
    async fn handle_connection(conn: quinn::Connection, handler: Arc<T>) -> Result<(), CsiError> {
        loop {
            let (send, recv) = match conn.accept_bi().await {
                Ok(stream) => stream,
                Err(quinn::ConnectionError::ApplicationClosed(_)) => return Ok(()),
                Err(e) => return Err(CsiError::transport(e)),
            };

            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_stream(send, recv, &handler).await {
                    error!(error = %e, "CSI stream handler error");
                }
            });
        }
    }

    /// Process a single bi-stream: read request → dispatch → write response.
    #[instrument(skip_all)]
    async fn handle_stream(
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
        handler: &T,
    ) -> Result<(), CsiError> {
        let buf = recv
            .read_to_end(16 * 1024 * 1024)
            .await
            .map_err(CsiError::transport)?;

        let request: CsiMessage = serde_json::from_slice(&buf)
            .map_err(|e| CsiError::TransportError(format!("malformed request: {e}")))?;

        debug!(%request, "CSI request received");

        let response = dispatch(handler, request).await;

        let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;
        Ok(())
    }

    /// Return a reference to the underlying QUIC endpoint, useful for
    /// obtaining the local address or shutting down.
    pub fn endpoint(&self) -> &quinn::Endpoint {
        &self.endpoint
    }
}

/// Map a [`CsiMessage`] request to the correct trait method call and wrap
/// the result in a response [`CsiMessage`].
pub(crate) async fn dispatch<T>(handler: &T, request: CsiMessage) -> CsiMessage
where
    T: CsiIdentity + CsiNode,
{
    match request {
        // --- Identity -------------------------------------------------------
        CsiMessage::Probe => reply(handler.probe().await, CsiMessage::ProbeResult),
        CsiMessage::GetPluginInfo => {
            reply(handler.get_plugin_info().await, CsiMessage::PluginInfoResponse)
        }
        CsiMessage::GetPluginCapabilities => reply(
            handler.get_plugin_capabilities().await,
            CsiMessage::PluginCapabilitiesResponse,
        ),

        // --- Node -----------------------------------------------------------
        CsiMessage::StageVolume(req) => reply(handler.stage_volume(req).await, |()| CsiMessage::Ok),
        CsiMessage::UnstageVolume {
            volume_id,
            staging_target_path,
        } => reply(
            handler
                .unstage_volume(&volume_id, &staging_target_path)
                .await,
            |()| CsiMessage::Ok,
        ),
        CsiMessage::PublishVolume(req) => {
            reply(handler.publish_volume(req).await, |()| CsiMessage::Ok)
        }
        CsiMessage::UnpublishVolume {
            volume_id,
            target_path,
        } => reply(
            handler.unpublish_volume(&volume_id, &target_path).await,
            |()| CsiMessage::Ok,
        ),
        CsiMessage::ExpandVolume(req) => {
            reply(handler.expand_volume(req).await, CsiMessage::VolumeExpanded)
        }
        CsiMessage::GetVolumeStats {
            volume_id,
            volume_path,
        } => reply(
            handler.get_volume_stats(&volume_id, &volume_path).await,
            CsiMessage::VolumeStatsResponse,
        ),
        CsiMessage::GetNodeCapabilities => reply(
            handler.get_capabilities().await,
            CsiMessage::NodeCapabilitiesResponse,
        ),
        CsiMessage::GetNodeInfo => reply(handler.get_info().await, CsiMessage::NodeInfoResponse),

        // --- Response variants should never arrive as requests --------------
        other => {
            warn!(msg = %other, "unexpected message variant received as request");
            CsiMessage::Error(CsiError::InvalidArgument(format!(
                "unexpected message: {other}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::disk::testing::Harness;
    use crate::types::{NodeServiceCapability, VolumeId};

    #[tokio::test]
    async fn dispatches_to_the_node() {
        let h = Harness::new();

        let resp = dispatch(&h.node, CsiMessage::GetNodeCapabilities).await;
        match resp {
            CsiMessage::NodeCapabilitiesResponse(caps) => {
                assert!(caps.contains(&NodeServiceCapability::ExpandVolume));
            }
            other => panic!("unexpected {other}"),
        }

        let resp = dispatch(
            &h.node,
            CsiMessage::UnpublishVolume {
                volume_id: VolumeId::from("vol-1"),
                target_path: String::new(),
            },
        )
        .await;
        assert!(matches!(resp, CsiMessage::Error(CsiError::InvalidArgument(_))));

        assert!(matches!(
            dispatch(&h.node, CsiMessage::Probe).await,
            CsiMessage::ProbeResult(true)
        ));
    }

    #[tokio::test]
    async fn rejects_responses_sent_as_requests() {
        let h = Harness::new();
        assert!(matches!(
            dispatch(&h.node, CsiMessage::Ok).await,
            CsiMessage::Error(CsiError::InvalidArgument(_))
        ));
    }
}
