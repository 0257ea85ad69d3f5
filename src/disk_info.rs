use std::ffi::CString;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::error::ProbeError;

/// Capacity and fill level of the mount holding a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total_bytes: u64,
    /// 0..=100, rounded up the way `df` reports it.
    pub used_percent: u8,
}

/// Source of disk usage figures. Failures are never fatal to the caller.
pub trait DiskUsageProbe: Send {
    fn probe(&self, path: &Path) -> Result<DiskUsage, ProbeError>;
}

/// Reads figures with statvfs(3).
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsProbe;

impl DiskUsageProbe for StatvfsProbe {
    fn probe(&self, path: &Path) -> Result<DiskUsage, ProbeError> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| ProbeError::InvalidPath(path.to_path_buf()))?;

        let mut stat = MaybeUninit::<libc::statvfs>::uninit();
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if ret != 0 {
            return Err(ProbeError::Statvfs {
                path: path.to_path_buf(),
                source: std::io::Error::last_os_error(),
            });
        }
        let stat = unsafe { stat.assume_init() };

        let block_size = stat.f_frsize as u64;
        let total = stat.f_blocks as u64 * block_size;
        let free = stat.f_bfree as u64 * block_size;
        let available = stat.f_bavail as u64 * block_size;
        let used = total.saturating_sub(free);

        Ok(DiskUsage {
            total_bytes: total,
            used_percent: used_percent(used, available),
        })
    }
}

/// Same rounding as df: used / (used + available), rounded up. Space
/// reserved for root is excluded from the denominator.
pub fn used_percent(used: u64, available: u64) -> u8 {
    let denom = used as u128 + available as u128;
    if denom == 0 {
        return 0;
    }
    let pct = (used as u128 * 100).div_ceil(denom);
    pct.min(100) as u8
}

/// Bytes to delete to bring usage back to `safe_percent`, or `None` while
/// usage is below `limit_percent`.
///
/// `target = total * (used - safe + overshoot) / 100`
pub fn quota_target(
    total_bytes: u64,
    used_percent: u8,
    limit_percent: u8,
    safe_percent: u8,
    overshoot_percent: u64,
) -> Option<u64> {
    if used_percent < limit_percent {
        return None;
    }
    let over = used_percent.saturating_sub(safe_percent) as u128 + overshoot_percent as u128;
    let bytes = total_bytes as u128 * over / 100;
    Some(bytes.min(u64::MAX as u128) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_target_matches_worked_example() {
        assert_eq!(
            quota_target(1_000_000_000, 95, 90, 80, 1),
            Some(160_000_000)
        );
    }

    #[test]
    fn quota_target_only_at_or_above_limit() {
        assert_eq!(quota_target(1_000, 89, 90, 80, 1), None);
        assert_eq!(quota_target(1_000, 0, 90, 80, 1), None);
        assert_eq!(quota_target(1_000, 90, 90, 80, 1), Some(110));
    }

    #[test]
    fn quota_target_overshoot_override() {
        assert_eq!(quota_target(1_000, 90, 90, 80, 0), Some(100));
        assert_eq!(quota_target(1_000, 90, 90, 80, 5), Some(150));
    }

    #[test]
    fn used_percent_rounds_up() {
        assert_eq!(used_percent(0, 0), 0);
        assert_eq!(used_percent(50, 50), 50);
        assert_eq!(used_percent(1, 99), 1);
        assert_eq!(used_percent(1, 199), 1);
        assert_eq!(used_percent(100, 0), 100);
        assert_eq!(used_percent(2, 998), 1);
        assert_eq!(used_percent(3, 997), 1);
    }

    #[test]
    fn statvfs_probe_reads_root() {
        let usage = StatvfsProbe.probe(Path::new("/")).unwrap();
        assert!(usage.total_bytes > 0);
        assert!(usage.used_percent <= 100);
    }

    #[test]
    fn statvfs_probe_reports_missing_path() {
        let err = StatvfsProbe
            .probe(Path::new("/definitely/not/a/real/mount/here"))
            .unwrap_err();
        assert!(matches!(err, ProbeError::Statvfs { .. }));
    }
}
