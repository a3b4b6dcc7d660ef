//! Filesystem usage for the download directory

use serde::Serialize;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct DiskUsage {
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub percent_used: f64,
}

/// Usage of the filesystem holding `path`. Walks up to the nearest existing
/// ancestor when `path` does not exist yet.
pub fn disk_usage(path: &Path) -> io::Result<DiskUsage> {
    let mut existing = path;
    while !existing.exists() {
        existing = existing
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no existing ancestor"))?;
    }
    let c_path = CString::new(existing.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and stat is a valid out-pointer
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    let frsize = stat.f_frsize as f64;
    let total = stat.f_blocks as f64 * frsize;
    let free = stat.f_bavail as f64 * frsize;
    let used = total - stat.f_bfree as f64 * frsize;
    let percent_used = if total > 0.0 { used / total * 100.0 } else { 0.0 };

    Ok(DiskUsage {
        total_gb: round2(total / GB),
        used_gb: round2(used / GB),
        free_gb: round2(free / GB),
        percent_used: round2(percent_used),
    })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_of_missing_path_uses_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let usage = disk_usage(&dir.path().join("not/yet/created")).unwrap();
        assert!(usage.total_gb > 0.0);
        assert!(usage.free_gb <= usage.total_gb);
        assert!((0.0..=100.0).contains(&usage.percent_used));
    }
}
