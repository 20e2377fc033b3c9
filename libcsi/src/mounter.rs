//! Host mount operations.
//!
//! [`Mounter`] is the seam between the node controllers and the host: every
//! mount-table read and every mutating OS call goes through it.
//! [`SystemMounter`] is the Linux implementation; tests substitute an
//! in-memory mount table.
//!
//! None of these calls has an internal timeout.  A format or mount that is
//! in flight when the caller gives up runs to completion.

use std::path::PathBuf;

use async_trait::async_trait;
use nix::mount::MsFlags;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::HostPaths;
use crate::error::CsiError;
use crate::mounts::{MountRecord, read_mountinfo};

#[async_trait]
pub trait Mounter: Send + Sync {
    /// Snapshot of the live mount table.
    async fn list_mounts(&self) -> Result<Vec<MountRecord>, CsiError>;

    /// Mount `source` of type `fs_type` at `target`.
    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        opts: &[String],
    ) -> Result<(), CsiError>;

    /// Bind-mount `source` (a directory or a device node) at `target`.
    async fn bind_mount(&self, source: &str, target: &str, opts: &[String])
    -> Result<(), CsiError>;

    /// Create a `fs_type` filesystem on `source` unless it already carries
    /// one, then mount it at `target`.
    async fn format_and_mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        opts: &[String],
    ) -> Result<(), CsiError>;

    async fn unmount(&self, target: &str) -> Result<(), CsiError>;

    /// Current size of a block device in bytes.
    async fn block_size_bytes(&self, device: &str) -> Result<u64, CsiError>;

    /// Grow the filesystem on `device`, mounted at `mount_path`, to fill the
    /// device.
    async fn resize_fs(&self, device: &str, mount_path: &str) -> Result<(), CsiError>;
}

/// [`Mounter`] backed by the Linux kernel and the usual userspace tools
/// (`mount`, `blkid`, `mkfs.*`, `blockdev`, `resize2fs`, `xfs_growfs`).
#[derive(Debug, Clone)]
pub struct SystemMounter {
    mountinfo: PathBuf,
}

impl SystemMounter {
    pub fn new(paths: &HostPaths) -> Self {
        Self {
            mountinfo: paths.mountinfo.clone(),
        }
    }
}

impl Default for SystemMounter {
    fn default() -> Self {
        Self::new(&HostPaths::default())
    }
}

/// Run `program` and return its stdout, failing on a non-zero exit.
async fn run(program: &str, args: &[&str]) -> Result<String, CsiError> {
    debug!(%program, ?args, "running command");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| CsiError::Internal(format!("failed to execute {program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CsiError::Internal(format!(
            "{program} failed ({}): {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Filesystem type on `device`, or `None` when it is unformatted.
async fn probe_fs_type(device: &str) -> Result<Option<String>, CsiError> {
    let output = Command::new("blkid")
        .args(["-p", "-s", "TYPE", "-o", "value", device])
        .output()
        .await
        .map_err(|e| CsiError::Internal(format!("failed to execute blkid: {e}")))?;

    match output.status.code() {
        Some(0) => {
            let fs = String::from_utf8_lossy(&output.stdout).trim().to_owned();
            Ok((!fs.is_empty()).then_some(fs))
        }
        // blkid exits with 2 when nothing was detected.
        Some(2) => Ok(None),
        _ => Err(CsiError::Internal(format!(
            "blkid {device} failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
    }
}

async fn make_fs(device: &str, fs_type: &str) -> Result<(), CsiError> {
    info!(%device, %fs_type, "formatting device");
    match fs_type {
        "ext2" | "ext3" | "ext4" => run(&format!("mkfs.{fs_type}"), &["-F", device]).await?,
        "xfs" => run("mkfs.xfs", &["-f", device]).await?,
        other => run("mkfs", &["-t", other, device]).await?,
    };
    Ok(())
}

/// Translate textual mount options into the flags a bind remount honours.
fn remount_flags(opts: &[String]) -> MsFlags {
    let mut flags = MsFlags::empty();
    for opt in opts {
        match opt.as_str() {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "bind" | "rw" | "defaults" => {}
            other => debug!(option = other, "mount option ignored for bind mount"),
        }
    }
    flags
}

#[async_trait]
impl Mounter for SystemMounter {
    async fn list_mounts(&self) -> Result<Vec<MountRecord>, CsiError> {
        read_mountinfo(&self.mountinfo).await
    }

    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        opts: &[String],
    ) -> Result<(), CsiError> {
        let joined = opts.join(",");
        let mut args = vec!["-t", fs_type];
        if !joined.is_empty() {
            args.extend(["-o", joined.as_str()]);
        }
        args.extend([source, target]);

        run("mount", &args)
            .await
            .map_err(|e| CsiError::MountFailed {
                path: target.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn bind_mount(
        &self,
        source: &str,
        target: &str,
        opts: &[String],
    ) -> Result<(), CsiError> {
        nix::mount::mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| CsiError::MountFailed {
            path: target.to_owned(),
            reason: e.to_string(),
        })?;

        // The kernel ignores per-mount flags on the initial bind; they only
        // take effect through a remount.
        let flags = remount_flags(opts);
        if !flags.is_empty() {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | flags,
                None::<&str>,
            )
            .map_err(|e| CsiError::MountFailed {
                path: target.to_owned(),
                reason: format!("remount with {opts:?}: {e}"),
            })?;
        }
        Ok(())
    }

    async fn format_and_mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        opts: &[String],
    ) -> Result<(), CsiError> {
        match probe_fs_type(source).await? {
            Some(existing) => {
                if existing != fs_type {
                    warn!(%source, %existing, requested = %fs_type,
                        "device carries a different filesystem than requested");
                }
                self.mount(source, target, fs_type, opts).await
            }
            None => {
                make_fs(source, fs_type).await?;
                self.mount(source, target, fs_type, opts).await
            }
        }
    }

    async fn unmount(&self, target: &str) -> Result<(), CsiError> {
        nix::mount::umount(target).map_err(|e| CsiError::UnmountFailed {
            path: target.to_owned(),
            reason: e.to_string(),
        })
    }

    async fn block_size_bytes(&self, device: &str) -> Result<u64, CsiError> {
        let out = run("blockdev", &["--getsize64", device]).await?;
        let trimmed = out.trim();
        trimmed.parse().map_err(|_| {
            CsiError::Internal(format!("failed to parse size {trimmed:?} of {device}"))
        })
    }

    async fn resize_fs(&self, device: &str, mount_path: &str) -> Result<(), CsiError> {
        match probe_fs_type(device).await?.as_deref() {
            Some("ext2" | "ext3" | "ext4") => {
                run("resize2fs", &[device]).await?;
            }
            Some("xfs") => {
                run("xfs_growfs", &["-d", mount_path]).await?;
            }
            Some(other) => {
                return Err(CsiError::Internal(format!(
                    "resizing {other} filesystems is not supported"
                )));
            }
            None => {
                return Err(CsiError::Internal(format!(
                    "no filesystem found on {device}"
                )));
            }
        }
        info!(%device, %mount_path, "filesystem resized");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory host used by the controller tests.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct FakeHost {
        mounts: Vec<MountRecord>,
        sizes: HashMap<String, u64>,
        grown: HashMap<String, u64>,
        calls: Vec<String>,
    }

    /// A [`Mounter`] over a mutable in-memory mount table.
    #[derive(Default)]
    pub(crate) struct FakeMounter {
        host: Mutex<FakeHost>,
    }

    fn with_access(opts: &[String]) -> Vec<String> {
        let access = if opts.iter().any(|o| o == "ro") { "ro" } else { "rw" };
        std::iter::once(access.to_owned())
            .chain(opts.iter().filter(|o| *o != "ro" && *o != "rw").cloned())
            .collect()
    }

    impl FakeMounter {
        pub(crate) fn add_mount(&self, record: MountRecord) {
            self.host.lock().unwrap().mounts.push(record);
        }

        pub(crate) fn mounts(&self) -> Vec<MountRecord> {
            self.host.lock().unwrap().mounts.clone()
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.host.lock().unwrap().calls.clone()
        }

        pub(crate) fn set_block_size(&self, device: &str, bytes: u64) {
            self.host.lock().unwrap().sizes.insert(device.to_owned(), bytes);
        }

        /// Size `device` reports once its filesystem has been resized.
        pub(crate) fn grow_on_resize(&self, device: &str, bytes: u64) {
            self.host.lock().unwrap().grown.insert(device.to_owned(), bytes);
        }
    }

    #[async_trait]
    impl Mounter for FakeMounter {
        async fn list_mounts(&self) -> Result<Vec<MountRecord>, CsiError> {
            Ok(self.mounts())
        }

        async fn mount(
            &self,
            source: &str,
            target: &str,
            fs_type: &str,
            opts: &[String],
        ) -> Result<(), CsiError> {
            let mut host = self.host.lock().unwrap();
            host.calls.push(format!("mount {source} {target}"));
            // The kernel reports the resolved device node, not the by-id link.
            let device = std::fs::canonicalize(source)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| source.to_owned());
            host.mounts.push(MountRecord {
                device,
                path: target.to_owned(),
                source: "/".to_owned(),
                fs_type: fs_type.to_owned(),
                opts: with_access(opts),
            });
            Ok(())
        }

        async fn bind_mount(
            &self,
            source: &str,
            target: &str,
            opts: &[String],
        ) -> Result<(), CsiError> {
            let mut host = self.host.lock().unwrap();
            host.calls.push(format!("bind {source} {target}"));
            let record = match host.mounts.iter().find(|m| m.path == source) {
                Some(parent) => MountRecord {
                    device: parent.device.clone(),
                    path: target.to_owned(),
                    source: parent.source.clone(),
                    fs_type: parent.fs_type.clone(),
                    opts: with_access(opts),
                },
                None => MountRecord {
                    device: "devtmpfs".to_owned(),
                    path: target.to_owned(),
                    source: std::fs::canonicalize(source)
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_else(|_| source.to_owned()),
                    fs_type: "devtmpfs".to_owned(),
                    opts: with_access(opts),
                },
            };
            host.mounts.push(record);
            Ok(())
        }

        async fn format_and_mount(
            &self,
            source: &str,
            target: &str,
            fs_type: &str,
            opts: &[String],
        ) -> Result<(), CsiError> {
            self.host
                .lock()
                .unwrap()
                .calls
                .push(format!("format {source} {fs_type}"));
            self.mount(source, target, fs_type, opts).await
        }

        async fn unmount(&self, target: &str) -> Result<(), CsiError> {
            let mut host = self.host.lock().unwrap();
            host.calls.push(format!("unmount {target}"));
            match host.mounts.iter().rposition(|m| m.path == target) {
                Some(idx) => {
                    host.mounts.remove(idx);
                    Ok(())
                }
                None => Err(CsiError::UnmountFailed {
                    path: target.to_owned(),
                    reason: "not mounted".to_owned(),
                }),
            }
        }

        async fn block_size_bytes(&self, device: &str) -> Result<u64, CsiError> {
            Ok(self.host.lock().unwrap().sizes.get(device).copied().unwrap_or(0))
        }

        async fn resize_fs(&self, device: &str, mount_path: &str) -> Result<(), CsiError> {
            let mut host = self.host.lock().unwrap();
            host.calls.push(format!("resize {device} {mount_path}"));
            if let Some(size) = host.grown.get(device).copied() {
                host.sizes.insert(device.to_owned(), size);
            }
            Ok(())
        }
    }
}
