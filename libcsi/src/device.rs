//! Block device discovery.
//!
//! Devices are looked up again on every call and never cached: device nodes
//! appear and disappear as disks are attached and detached underneath us.

use std::io::ErrorKind;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::HostPaths;
use crate::error::CsiError;
use crate::mounts::{MountRecord, is_placeholder_device};

/// A block device visible to the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Path as presented by the caller, usually a by-id symlink.
    pub full_path: String,
    /// Base name of `full_path`.
    pub name: String,
    /// `full_path` with all symlinks resolved, e.g. `/dev/sdb`.
    pub real_dev: String,
}

/// Resolve `path` to the device node behind it.
///
/// Fails with [`CsiError::NotFound`] when `path` does not exist and with
/// [`CsiError::NotBlockDevice`] when it resolves to anything but a device
/// node.
pub fn resolve_device(path: &Path) -> Result<Device, CsiError> {
    std::fs::symlink_metadata(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => CsiError::NotFound(format!("{} does not exist", path.display())),
        _ => CsiError::Internal(format!("stat {}: {e}", path.display())),
    })?;

    let real = std::fs::canonicalize(path)
        .map_err(|e| CsiError::Internal(format!("resolve {}: {e}", path.display())))?;

    let file_type = std::fs::metadata(&real)
        .map_err(|e| CsiError::Internal(format!("stat {}: {e}", real.display())))?
        .file_type();
    if !file_type.is_block_device() && !file_type.is_char_device() {
        return Err(CsiError::NotBlockDevice(path.display().to_string()));
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(Device {
        full_path: path.to_string_lossy().into_owned(),
        name,
        real_dev: real.to_string_lossy().into_owned(),
    })
}

/// Look for the by-id entry of `disk_id`.
///
/// `Ok(None)` means the disk is not attached (yet); only a failure to read
/// the directory is an error.
pub fn find_device_for_disk_id(
    paths: &HostPaths,
    disk_id: &str,
) -> Result<Option<PathBuf>, CsiError> {
    let wanted = format!("{}{}", paths.disk_id_prefix, disk_id);
    let entries = std::fs::read_dir(&paths.disk_by_id_dir)
        .map_err(|e| CsiError::Internal(format!("Error trying to read attached disks: {e}")))?;

    for entry in entries {
        let entry =
            entry.map_err(|e| CsiError::Internal(format!("Error trying to read attached disks: {e}")))?;
        if entry.file_name().to_string_lossy() == wanted {
            return Ok(Some(paths.disk_by_id_dir.join(wanted)));
        }
    }
    Ok(None)
}

/// Like [`find_device_for_disk_id`], but an absent disk is
/// [`CsiError::NotFound`].
pub fn verify_volume_attached(paths: &HostPaths, disk_id: &str) -> Result<PathBuf, CsiError> {
    match find_device_for_disk_id(paths, disk_id)? {
        Some(path) => {
            debug!(%disk_id, volume_path = %path.display(), "found disk");
            Ok(path)
        }
        None => Err(CsiError::NotFound(format!("disk: {disk_id} not attached to node"))),
    }
}

/// The device mounted at `target`, or `None` when nothing is mounted there.
///
/// `None` is not an error: idempotent unmount paths treat it as "already
/// done".
pub fn device_behind_mount(
    mounts: &[MountRecord],
    target: &str,
) -> Result<Option<Device>, CsiError> {
    let Some(record) = mounts.iter().find(|m| m.path == target) else {
        return Ok(None);
    };
    let token = if is_placeholder_device(&record.device) {
        &record.source
    } else {
        &record.device
    };
    resolve_device(Path::new(token)).map(Some)
}

/// `/sys/block/<dev>/device/rescan` for a device whose real path is
/// `/dev/<dev>`, with symlinks resolved.
pub fn device_rescan_path(sys_block_dir: &Path, device: &Device) -> Result<PathBuf, CsiError> {
    let parts: Vec<&str> = device.real_dev.split('/').collect();
    if parts.len() == 3 && parts[1].starts_with("dev") {
        let path = sys_block_dir.join(parts[2]).join("device").join("rescan");
        return std::fs::canonicalize(&path)
            .map_err(|e| CsiError::Internal(format!("resolve {}: {e}", path.display())));
    }
    Err(CsiError::Internal(format!(
        "illegal path for device {:?}",
        device.real_dev
    )))
}

/// Ask the kernel to re-read the size of `device`.
pub fn rescan_device(sys_block_dir: &Path, device: &Device) -> Result<(), CsiError> {
    let path = device_rescan_path(sys_block_dir, device)?;
    std::fs::write(&path, b"1").map_err(|e| {
        CsiError::Internal(format!(
            "error rescanning block device {:?}. {e}",
            device.real_dev
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths_in(dir: &Path) -> HostPaths {
        HostPaths {
            disk_by_id_dir: dir.join("by-id"),
            sys_block_dir: dir.join("block"),
            ..HostPaths::default()
        }
    }

    #[test]
    fn resolves_symlink_to_device_node() {
        let tmp = tempfile::tempdir().unwrap();
        let link = tmp.path().join("wwn-0xabc");
        std::os::unix::fs::symlink("/dev/null", &link).unwrap();

        let dev = resolve_device(&link).unwrap();
        assert_eq!(dev.name, "wwn-0xabc");
        assert_eq!(dev.full_path, link.to_string_lossy());
        assert_eq!(dev.real_dev, "/dev/null");
    }

    #[test]
    fn missing_path_is_not_found() {
        let res = resolve_device(Path::new("/nonexistent/device"));
        assert!(matches!(res, Err(CsiError::NotFound(_))));
    }

    #[test]
    fn regular_file_is_not_a_block_device() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            resolve_device(&file),
            Err(CsiError::NotBlockDevice(_))
        ));
    }

    #[test]
    fn dangling_symlink_fails_resolution() {
        let tmp = tempfile::tempdir().unwrap();
        let link = tmp.path().join("dangling");
        std::os::unix::fs::symlink(tmp.path().join("gone"), &link).unwrap();
        assert!(matches!(resolve_device(&link), Err(CsiError::Internal(_))));
    }

    #[test]
    fn unattached_disk_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = paths_in(tmp.path());
        std::fs::create_dir_all(&paths.disk_by_id_dir).unwrap();
        std::os::unix::fs::symlink("/dev/null", paths.disk_by_id_dir.join("wwn-0xother")).unwrap();

        assert_eq!(find_device_for_disk_id(&paths, "6000c29").unwrap(), None);
        let res = verify_volume_attached(&paths, "6000c29");
        assert!(matches!(res, Err(CsiError::NotFound(ref m)) if m.contains("6000c29")));
    }

    #[test]
    fn attached_disk_is_found_by_prefixed_name() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = paths_in(tmp.path());
        std::fs::create_dir_all(&paths.disk_by_id_dir).unwrap();
        std::os::unix::fs::symlink("/dev/null", paths.disk_by_id_dir.join("wwn-0x6000c29")).unwrap();

        let found = verify_volume_attached(&paths, "6000c29").unwrap();
        assert_eq!(found, paths.disk_by_id_dir.join("wwn-0x6000c29"));
    }

    #[test]
    fn unreadable_by_id_dir_is_internal() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = paths_in(tmp.path());
        assert!(matches!(
            find_device_for_disk_id(&paths, "x"),
            Err(CsiError::Internal(_))
        ));
    }

    #[test]
    fn nothing_mounted_means_no_device() {
        assert_eq!(device_behind_mount(&[], "/mnt/target").unwrap(), None);
    }

    #[test]
    fn placeholder_mount_resolves_through_source() {
        let mounts = vec![MountRecord {
            device: "devtmpfs".into(),
            path: "/publish/p1".into(),
            source: "/dev/null".into(),
            fs_type: "devtmpfs".into(),
            opts: vec!["rw".into()],
        }];
        let dev = device_behind_mount(&mounts, "/publish/p1").unwrap().unwrap();
        assert_eq!(dev.real_dev, "/dev/null");
    }

    #[test]
    fn rescan_path_requires_dev_shape() {
        let tmp = tempfile::tempdir().unwrap();
        let block = tmp.path().join("block");
        std::fs::create_dir_all(block.join("sdb").join("device")).unwrap();
        std::fs::write(block.join("sdb").join("device").join("rescan"), b"").unwrap();

        let dev = Device {
            full_path: "/dev/disk/by-id/wwn-0x1".into(),
            name: "wwn-0x1".into(),
            real_dev: "/dev/sdb".into(),
        };
        let path = device_rescan_path(&block, &dev).unwrap();
        assert!(path.ends_with("sdb/device/rescan"));

        rescan_device(&block, &dev).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"1");

        let nested = Device {
            real_dev: "/dev/mapper/vg-lv".into(),
            ..dev
        };
        assert!(matches!(
            device_rescan_path(&block, &nested),
            Err(CsiError::Internal(_))
        ));
    }
}
