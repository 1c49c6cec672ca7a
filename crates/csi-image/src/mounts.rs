//! Host mount table helpers.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use csi_image_common::CsiImageResult;

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Mount points listed in a `mountinfo` document.
///
/// Field 5 of each line is the mount point, with spaces, tabs, newlines and
/// backslashes escaped as octal.
pub fn parse_mountinfo(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape_octal(field)))
        .collect()
}

fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = bytes.get(i + 1..=i + 3).filter(|digits| {
            bytes[i] == b'\\' && digits.iter().all(|b| (b'0'..=b'7').contains(b))
        });
        if let Some(digits) = escaped {
            let value = digits
                .iter()
                .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
            out.push(u8::try_from(value).unwrap_or(b'?'));
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Every mount point in this process's mount table.
///
/// # Errors
///
/// Returns an error if the mount table cannot be read.
pub fn mount_table() -> CsiImageResult<HashSet<PathBuf>> {
    let content = std::fs::read_to_string(MOUNTINFO)?;
    Ok(parse_mountinfo(&content).into_iter().collect())
}

/// True if `target` appears as a mount point in this process's mount table.
///
/// # Errors
///
/// Returns an error if the mount table cannot be read.
pub fn is_mount_point(target: &Path) -> CsiImageResult<bool> {
    Ok(mount_table()?.contains(target))
}

/// Unmount `target` until nothing is mounted there anymore.
///
/// A target that is not mounted is left alone.
///
/// # Errors
///
/// Returns an error if an unmount fails.
#[cfg(target_os = "linux")]
pub fn unmount_all(target: &Path) -> CsiImageResult<()> {
    use rustix::mount::{UnmountFlags, unmount};

    while is_mount_point(target)? {
        tracing::debug!(target = %target.display(), "Unmounting filesystem");
        unmount(target, UnmountFlags::empty())
            .map_err(|e| csi_image_common::CsiImageError::Io(e.into()))?;
    }
    Ok(())
}

/// Unmounting is only supported on Linux.
///
/// # Errors
///
/// Always returns a configuration error.
#[cfg(not(target_os = "linux"))]
pub fn unmount_all(_target: &Path) -> CsiImageResult<()> {
    Err(csi_image_common::CsiImageError::Config {
        message: "unmounting requires Linux".to_string(),
    })
}
