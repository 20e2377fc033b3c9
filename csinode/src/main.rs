//! Node plugin daemon: serves [`DiskNode`] over the QUIC transport.

mod logging;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use libcsi::transport::CsiServer;
use libcsi::{DiskNode, NodeConfig};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::info;

use crate::logging::{ENV_LOGGER_LEVEL, LogFormat};

#[derive(Parser, Debug)]
#[command(name = "csinode", version, about = "RK8s CSI node plugin")]
struct Args {
    /// Address the QUIC endpoint listens on
    #[arg(long, env = "CSI_LISTEN", default_value = "0.0.0.0:6443")]
    listen: SocketAddr,

    /// PEM certificate chain presented to clients
    #[arg(long, value_name = "FILE")]
    cert: PathBuf,

    /// PEM private key for the certificate
    #[arg(long, value_name = "FILE")]
    key: PathBuf,

    /// Log output format; defaults to what LOGGER_LEVEL selects
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

fn load_tls(cert: &Path, key: &Path) -> Result<rustls::ServerConfig> {
    let chain = CertificateDer::pem_file_iter(cert)
        .with_context(|| format!("Failed to open certificate: {}", cert.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificate: {}", cert.display()))?;
    let key = PrivateKeyDer::from_pem_file(key)
        .with_context(|| format!("Failed to read private key: {}", key.display()))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .context("Invalid certificate or key")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let format = args.log_format.unwrap_or_else(|| {
        LogFormat::from_logger_level(std::env::var(ENV_LOGGER_LEVEL).ok().as_deref())
    });
    logging::init(format);

    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = NodeConfig::from_env().context("Failed to load node configuration")?;
    info!(
        node = %config.node_name,
        flavor = ?config.cluster_flavor,
        max_volumes = config.max_volumes_per_node,
        online_expansion = config.online_expansion,
        "starting CSI node plugin"
    );

    let tls = load_tls(&args.cert, &args.key)?;
    let node = Arc::new(DiskNode::new(config));
    let server = CsiServer::new(args.listen, tls, node).context("Failed to start QUIC server")?;
    server.serve().await.context("QUIC server stopped")?;
    Ok(())
}
