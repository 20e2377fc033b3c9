//! # libcsi: node-side CSI volume lifecycle for RK8s
//!
//! `libcsi` implements the node half of the [Container Storage
//! Interface][csi]: it takes a volume handle and an access mode, brings the
//! backing disk or file share into a mounted state on the worker, and takes
//! it down again.  Every operation is idempotent and derives its decisions
//! from the live mount table and device tree, so retries and crash recovery
//! need no extra bookkeeping.  Requests travel over QUIC (via [`quinn`])
//! instead of gRPC.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Requests, responses, capabilities and node info. |
//! | [`error`] | [`CsiError`] enum covering all failure modes. |
//! | [`config`] | [`NodeConfig`](config::NodeConfig) loaded from the environment. |
//! | [`device`] | Block device discovery by disk id and by mount point. |
//! | [`mounts`] | Mount table parsing and inspection. |
//! | [`mounter`] | [`Mounter`](mounter::Mounter) seam over mount, format and resize. |
//! | [`dmi`] | Node hardware UUID. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`node`] | [`CsiNode`] trait: stage, publish, unpublish, unstage, expand. |
//! | [`backend`] | [`DiskNode`](backend::disk::DiskNode), the disk and file share backend. |
//! | [`ledger`] | Idempotent operation ledger for the provisioning path. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backend;
pub mod config;
pub mod device;
pub mod dmi;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod message;
pub mod mounter;
pub mod mounts;
pub mod node;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::disk::DiskNode;
pub use config::NodeConfig;
pub use error::CsiError;
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use types::*;
