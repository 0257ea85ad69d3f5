//! Pruning of empty, date-partitioned directories.
//!
//! Only directories whose path below the job root has a purely numeric
//! segment are touched (`smtp/log/2018/05/29/03/...` qualifies,
//! `smtp/log` does not), and only once they have been idle for the grace
//! period.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::candidates::DirectoryCandidate;
use crate::utils;

/// True if any segment of `path` consists only of ASCII digits.
pub fn is_timestamp_shaped(path: &Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(seg) => {
            let seg = seg.as_encoded_bytes();
            !seg.is_empty() && seg.iter().all(u8::is_ascii_digit)
        }
        _ => false,
    })
}

/// `is_timestamp_shaped` evaluated below `root`, so digits in the root
/// itself never make a structural directory eligible.
pub fn is_timestamp_shaped_under(root: &Path, path: &Path) -> bool {
    match path.strip_prefix(root) {
        Ok(rel) => is_timestamp_shaped(rel),
        Err(_) => false,
    }
}

pub fn is_empty_dir(path: &Path) -> io::Result<bool> {
    Ok(std::fs::read_dir(path)?.next().is_none())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: usize,
    pub failed: usize,
}

/// Walks upward from each candidate removing directories while they stay
/// empty, timestamp-shaped and idle past the grace period.
pub struct DirPruner<'a> {
    root: &'a Path,
    grace_period: Duration,
    now: SystemTime,
    /// Last-write time of directories before this pass removed children
    /// from them.
    prior_writes: HashMap<PathBuf, SystemTime>,
    report: PruneReport,
}

impl<'a> DirPruner<'a> {
    pub fn new(root: &'a Path, grace_period: Duration, now: SystemTime) -> Self {
        Self {
            root,
            grace_period,
            now,
            prior_writes: HashMap::new(),
            report: PruneReport::default(),
        }
    }

    pub fn prune_all(mut self, candidates: Vec<DirectoryCandidate>) -> PruneReport {
        for candidate in candidates {
            self.prune_upward(&candidate.path);
        }
        self.report
    }

    fn prune_upward(&mut self, start: &Path) {
        let mut current = start.to_path_buf();
        while let Some(last_write) = self.eligible(&current) {
            let parent = match current.parent() {
                Some(p) => p.to_path_buf(),
                None => break,
            };
            if let Ok(meta) = std::fs::metadata(&parent) {
                if let Ok(t) = meta.modified() {
                    self.prior_writes.entry(parent.clone()).or_insert(t);
                }
            }

            let idle = self.now.duration_since(last_write).unwrap_or_default();
            let age = utils::format_age(idle);
            match std::fs::remove_dir(&current) {
                Ok(()) => {
                    self.report.removed += 1;
                    info!(path = %current.display(), age = %age, "deleted empty dir");
                }
                Err(e) => {
                    self.report.failed += 1;
                    warn!(
                        path = %current.display(),
                        age = %age,
                        error = %e,
                        "delete empty dir failed"
                    );
                    break;
                }
            }
            current = parent;
        }
    }

    /// Returns the idle reference time if `dir` may be removed right now.
    fn eligible(&self, dir: &Path) -> Option<SystemTime> {
        if dir == self.root || !dir.starts_with(self.root) {
            return None;
        }
        let meta = std::fs::symlink_metadata(dir).ok()?;
        if !meta.is_dir() {
            return None;
        }
        if !is_timestamp_shaped_under(self.root, dir) {
            return None;
        }
        match is_empty_dir(dir) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                debug!(path = %dir.display(), error = %e, "cannot read dir");
                return None;
            }
        }
        let last_write = self
            .prior_writes
            .get(dir)
            .copied()
            .or_else(|| meta.modified().ok())?;
        if is_idle(last_write, self.now, self.grace_period) {
            Some(last_write)
        } else {
            None
        }
    }
}

/// Strictly longer than the grace period.
pub fn is_idle(last_write: SystemTime, now: SystemTime, grace_period: Duration) -> bool {
    match now.duration_since(last_write) {
        Ok(idle) => idle > grace_period,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use std::fs;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn age_path(path: &Path, ago: Duration) {
        let t = SystemTime::now() - ago;
        set_file_mtime(path, FileTime::from_system_time(t)).unwrap();
    }

    /// Prune `dirs` under `root` with a one hour grace period.
    fn prune(root: &Path, dirs: &[PathBuf]) -> PruneReport {
        let now = SystemTime::now();
        let candidates = dirs
            .iter()
            .map(|path| DirectoryCandidate {
                path: path.clone(),
                last_write: now - 2 * HOUR,
            })
            .collect();
        DirPruner::new(root, HOUR, now).prune_all(candidates)
    }

    #[test]
    fn timestamp_shape() {
        assert!(is_timestamp_shaped(Path::new("/data/logs/2024/01/01/08/x")));
        assert!(is_timestamp_shaped(Path::new("2024")));
        assert!(!is_timestamp_shaped(Path::new("/data/logs")));
        assert!(!is_timestamp_shaped(Path::new("/data/logs/2024a/x")));
        assert!(!is_timestamp_shaped(Path::new("/")));
    }

    #[test]
    fn timestamp_shape_ignores_root_digits() {
        let root = Path::new("/srv/2/logs");
        assert!(!is_timestamp_shaped_under(root, Path::new("/srv/2/logs/smtp")));
        assert!(is_timestamp_shaped_under(root, Path::new("/srv/2/logs/smtp/07")));
        assert!(!is_timestamp_shaped_under(root, Path::new("/elsewhere/07")));
    }

    #[test]
    fn idle_is_strict() {
        let now = SystemTime::now();
        assert!(!is_idle(now - HOUR, now, HOUR));
        assert!(is_idle(now - HOUR - Duration::from_secs(1), now, HOUR));
        assert!(!is_idle(now + HOUR, now, HOUR));
    }

    #[test]
    fn collapses_empty_date_tree() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("logs");
        let leaf = root.join("2024/01/01/08/x");
        fs::create_dir_all(&leaf).unwrap();
        for p in [
            leaf.clone(),
            root.join("2024/01/01/08"),
            root.join("2024/01/01"),
            root.join("2024/01"),
            root.join("2024"),
        ] {
            age_path(&p, 2 * HOUR);
        }

        let report = prune(&root, &[leaf]);

        assert_eq!(report.removed, 5);
        assert!(!root.join("2024").exists());
        assert!(root.exists(), "job root is never pruned");
    }

    #[test]
    fn stops_at_first_non_empty_parent() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let day = root.join("2024/05/29");
        fs::create_dir_all(day.join("03")).unwrap();
        fs::write(day.join("keep.log"), b"x").unwrap();
        age_path(&day.join("03"), 2 * HOUR);
        age_path(&day, 2 * HOUR);

        let report = prune(&root, &[day.join("03")]);

        assert_eq!(report.removed, 1);
        assert!(!day.join("03").exists());
        assert!(day.exists());
    }

    #[test]
    fn siblings_collapse_into_parent() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let hour = root.join("2024/05/29");
        fs::create_dir_all(hour.join("01")).unwrap();
        fs::create_dir_all(hour.join("02")).unwrap();
        for p in [hour.join("01"), hour.join("02"), hour.clone()] {
            age_path(&p, 3 * HOUR);
        }

        prune(&root, &[hour.join("01"), hour.join("02")]);

        assert!(!hour.exists(), "parent emptied by this pass is pruned too");
    }

    #[test]
    fn never_prunes_recent_or_structural_dirs() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let recent = root.join("2024/06");
        let structural = root.join("smtp");
        fs::create_dir_all(&recent).unwrap();
        fs::create_dir_all(&structural).unwrap();
        age_path(&structural, 10 * HOUR);

        let report = prune(&root, &[recent.clone(), structural.clone()]);

        assert_eq!(report.removed, 0);
        assert!(recent.exists(), "idle time is re-read at prune time");
        assert!(structural.exists());
    }

    #[test]
    fn skips_dirs_refilled_since_scan() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let dir = root.join("2023/12");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("late.log"), b"x").unwrap();
        age_path(&dir, 5 * HOUR);

        let report = prune(&root, &[dir.clone()]);

        assert_eq!(report.removed, 0);
        assert!(dir.join("late.log").exists());
    }
}
