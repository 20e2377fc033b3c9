//! Node plugin configuration.
//!
//! The configuration is read once at start-up and handed to the node backend
//! at construction; nothing in the crate reads the environment afterwards.
//!
//! Environment variables:
//! - `NODE_NAME`: node identifier reported by `NodeGetInfo`. Required.
//! - `MAX_VOLUMES_PER_NODE`: optional integer in `0..=59`. `0` (the default)
//!   means no limit is advertised.
//! - `CLUSTER_FLAVOR`: `VANILLA` (default), `WORKLOAD` or `GUEST`.
//! - `ONLINE_VOLUME_EXTEND`: `true`/`1` to check the device size and rescan
//!   the device before resizing a filesystem.
//! - `CSI_PLUGIN_NAME`: plugin name reported by `GetPluginInfo`.

use std::path::PathBuf;

use crate::error::CsiError;

pub const ENV_NODE_NAME: &str = "NODE_NAME";
pub const ENV_MAX_VOLUMES_PER_NODE: &str = "MAX_VOLUMES_PER_NODE";
pub const ENV_CLUSTER_FLAVOR: &str = "CLUSTER_FLAVOR";
pub const ENV_ONLINE_VOLUME_EXTEND: &str = "ONLINE_VOLUME_EXTEND";
pub const ENV_PLUGIN_NAME: &str = "CSI_PLUGIN_NAME";

/// Upper bound for `MAX_VOLUMES_PER_NODE`.
pub const MAX_ALLOWED_BLOCK_VOLUMES_PER_NODE: u64 = 59;

pub const DEFAULT_PLUGIN_NAME: &str = "csi.rk8s.io";

/// Deployment flavour of the cluster the node belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClusterFlavor {
    #[default]
    Vanilla,
    Workload,
    /// Nested cluster; file shares are mounted `hard` and no topology is
    /// reported.
    Guest,
}

impl ClusterFlavor {
    fn parse(value: &str) -> Result<Self, CsiError> {
        match value.to_ascii_uppercase().as_str() {
            "" | "VANILLA" => Ok(Self::Vanilla),
            "WORKLOAD" => Ok(Self::Workload),
            "GUEST" | "GUEST_CLUSTER" => Ok(Self::Guest),
            other => Err(CsiError::InvalidArgument(format!(
                "{ENV_CLUSTER_FLAVOR} has unknown value {other:?}"
            ))),
        }
    }
}

/// Host locations the node backend inspects.
///
/// Production code uses [`HostPaths::default`]; tests point these at
/// temporary directories.
#[derive(Debug, Clone)]
pub struct HostPaths {
    /// Directory of stable disk symlinks.
    pub disk_by_id_dir: PathBuf,
    /// Prefix prepended to a disk identifier to form its by-id entry name.
    pub disk_id_prefix: String,
    /// Root of the per-device sysfs tree, used for rescans.
    pub sys_block_dir: PathBuf,
    /// Root of the DMI sysfs tree, used for the hardware UUID.
    pub dmi_dir: PathBuf,
    /// Live mount table.
    pub mountinfo: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            disk_by_id_dir: PathBuf::from("/dev/disk/by-id"),
            disk_id_prefix: "wwn-0x".to_owned(),
            sys_block_dir: PathBuf::from("/sys/block"),
            dmi_dir: PathBuf::from("/sys/class/dmi"),
            mountinfo: PathBuf::from("/proc/self/mountinfo"),
        }
    }
}

/// Configuration of one node plugin instance.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_name: String,
    pub max_volumes_per_node: u64,
    pub cluster_flavor: ClusterFlavor,
    pub online_expansion: bool,
    pub plugin_name: String,
    pub paths: HostPaths,
}

impl NodeConfig {
    /// Configuration with defaults for everything but the node name.
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            max_volumes_per_node: 0,
            cluster_flavor: ClusterFlavor::default(),
            online_expansion: false,
            plugin_name: DEFAULT_PLUGIN_NAME.to_owned(),
            paths: HostPaths::default(),
        }
    }

    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, CsiError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CsiError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let node_name = lookup(ENV_NODE_NAME)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| CsiError::Internal(format!("ENV {ENV_NODE_NAME} is not set")))?;

        let mut config = Self::new(node_name);

        if let Some(v) = lookup(ENV_MAX_VOLUMES_PER_NODE).filter(|v| !v.is_empty()) {
            config.max_volumes_per_node = parse_max_volumes(&v)?;
        }
        if let Some(v) = lookup(ENV_CLUSTER_FLAVOR) {
            config.cluster_flavor = ClusterFlavor::parse(&v)?;
        }
        config.online_expansion = lookup(ENV_ONLINE_VOLUME_EXTEND)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if let Some(v) = lookup(ENV_PLUGIN_NAME).filter(|v| !v.is_empty()) {
            config.plugin_name = v;
        }
        Ok(config)
    }

    pub fn is_guest_cluster(&self) -> bool {
        self.cluster_flavor == ClusterFlavor::Guest
    }
}

fn parse_max_volumes(value: &str) -> Result<u64, CsiError> {
    let parsed: i64 = value.trim().parse().map_err(|_| {
        CsiError::Internal(format!(
            "{ENV_MAX_VOLUMES_PER_NODE} set in env variable {value} is invalid"
        ))
    })?;
    if parsed < 0 {
        return Err(CsiError::Internal(format!(
            "{ENV_MAX_VOLUMES_PER_NODE} set in env variable {value} is less than 0"
        )));
    }
    let parsed = parsed as u64;
    if parsed > MAX_ALLOWED_BLOCK_VOLUMES_PER_NODE {
        return Err(CsiError::Internal(format!(
            "{ENV_MAX_VOLUMES_PER_NODE} set in env variable {value} is more than {MAX_ALLOWED_BLOCK_VOLUMES_PER_NODE}"
        )));
    }
    Ok(parsed)
}
