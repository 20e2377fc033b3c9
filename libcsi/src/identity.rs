//! CSI Identity service trait.
//!
//! Callers use the Identity service to learn which plugin answers on an
//! endpoint, whether it is healthy, and which optional features it offers.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{PluginCapability, PluginInfo};

/// Identity service: plugin discovery and health probing.
#[async_trait]
pub trait CsiIdentity: Send + Sync {
    /// Plugin name and version.
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError>;

    /// Liveness probe.  `Ok(false)` means reachable but not able to serve
    /// volume operations.
    async fn probe(&self) -> Result<bool, CsiError>;

    /// Optional plugin-wide features.  A plain node plugin advertises none.
    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(Vec::new())
    }
}
