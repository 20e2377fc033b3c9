//! Mount table inspection.
//!
//! The host mount table is re-read on every operation: the CO stages and
//! publishes volumes concurrently, so any snapshot is stale by the next call.
//! Everything here works on a snapshot returned by
//! [`crate::mounter::Mounter::list_mounts`].

use std::path::Path;

use crate::device::Device;
use crate::error::CsiError;

/// Device tokens the kernel reports for raw block device nodes that were
/// bind-mounted out of `/dev`.  The real device is then named by
/// [`MountRecord::source`].
pub const PLACEHOLDER_DEVICES: [&str; 2] = ["devtmpfs", "udev"];

pub fn is_placeholder_device(token: &str) -> bool {
    PLACEHOLDER_DEVICES.contains(&token)
}

/// One entry of the host mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    /// Mount source as reported by the kernel: a device path, a share
    /// endpoint, or a pseudo-filesystem name.
    pub device: String,
    /// Mount point.
    pub path: String,
    /// Subtree of the filesystem that is mounted.  For placeholder devices
    /// this is rebased onto `/dev` and names the device node.
    pub source: String,
    /// Filesystem type.
    pub fs_type: String,
    /// Per-mount options, in table order.
    pub opts: Vec<String>,
}

impl MountRecord {
    pub fn has_option(&self, opt: &str) -> bool {
        self.opts.iter().any(|o| o == opt)
    }

    /// Whether this entry is backed by the given device, either directly or
    /// through a placeholder entry whose source is the device.
    pub fn is_backed_by(&self, device: &Device) -> bool {
        self.device == device.real_dev
            || (is_placeholder_device(&self.device) && self.source == device.real_dev)
    }
}

/// What kind of volume is mounted at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    FileShare,
    Other,
}

/// Read and parse the mount table at `mountinfo`.
pub async fn read_mountinfo(mountinfo: &Path) -> Result<Vec<MountRecord>, CsiError> {
    let contents = tokio::fs::read_to_string(mountinfo).await.map_err(|e| {
        CsiError::Internal(format!(
            "could not retrieve existing mount points from {}: {e}",
            mountinfo.display()
        ))
    })?;
    Ok(parse_mountinfo(&contents))
}

/// Parse `/proc/<pid>/mountinfo` text.
///
/// Format per line:
/// `<id> <parent> <maj:min> <root> <mount point> <options> [optional...] - <fstype> <source> <super options>`
///
/// Malformed lines are skipped.
pub fn parse_mountinfo(text: &str) -> Vec<MountRecord> {
    text.lines().filter_map(parse_mountinfo_line).collect()
}

fn parse_mountinfo_line(line: &str) -> Option<MountRecord> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let sep = fields.iter().position(|f| *f == "-")?;
    if sep < 6 || fields.len() < sep + 3 {
        return None;
    }

    let root = unescape(fields[3]);
    let path = unescape(fields[4]);
    let opts = fields[5].split(',').map(str::to_owned).collect();
    let fs_type = fields[sep + 1].to_owned();
    let device = unescape(fields[sep + 2]);

    let source = if is_placeholder_device(&device) {
        if root == "/" {
            "/dev".to_owned()
        } else {
            format!("/dev{root}")
        }
    } else {
        root
    };

    Some(MountRecord {
        device,
        path,
        source,
        fs_type,
        opts,
    })
}

/// Decode the octal escapes (`\040` etc.) the kernel uses for whitespace and
/// backslashes in mount table fields.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            if let Ok(b) = u8::try_from(value) {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Whether anything is mounted at `path`.
pub fn contains_path(mounts: &[MountRecord], path: &str) -> bool {
    mounts.iter().any(|m| m.path == path)
}

/// Classify the mount at `path`; unmounted paths are [`MountKind::Other`].
pub fn classify_mount(mounts: &[MountRecord], path: &str) -> MountKind {
    match mounts.iter().find(|m| m.path == path) {
        Some(m) if m.fs_type == "nfs" || m.fs_type == "nfs4" => MountKind::FileShare,
        _ => MountKind::Other,
    }
}

/// All mounts backed by `device`.
pub fn mounts_for_device<'a>(mounts: &'a [MountRecord], device: &Device) -> Vec<&'a MountRecord> {
    mounts.iter().filter(|m| m.is_backed_by(device)).collect()
}
