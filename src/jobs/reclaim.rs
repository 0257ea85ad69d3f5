use std::path::Path;
use std::time::{Instant, SystemTime};

use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use super::empty_dirs::{self, DirPruner};
use crate::candidates::{CandidateStore, DirectoryCandidate, FileCandidate};
use crate::config::JobConfig;
use crate::disk_info::{self, DiskUsageProbe};
use crate::error::{JobError, ScanError};
use crate::job::Job;
use crate::utils;

/// Totals over the lifetime of one reclaimer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimStats {
    pub scans: u64,
    pub files_deleted: u64,
    pub dirs_deleted: u64,
    pub bytes_freed: u64,
    pub failed_deletes: u64,
}

/// Result of one eviction pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Eviction {
    pub files: usize,
    pub bytes: u64,
}

/// Keeps one directory tree under its disk quota and retention timeout.
pub struct Reclaimer {
    name: String,
    config: JobConfig,
    store: CandidateStore,
    probe: Box<dyn DiskUsageProbe>,
    total_bytes: Option<u64>,
    stats: ReclaimStats,
}

impl Reclaimer {
    pub fn new(config: JobConfig, probe: Box<dyn DiskUsageProbe>) -> Self {
        Self {
            name: config.display_name(),
            config,
            store: CandidateStore::new(),
            probe,
            total_bytes: None,
            stats: ReclaimStats::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn store(&self) -> &CandidateStore {
        &self.store
    }

    pub fn stats(&self) -> ReclaimStats {
        self.stats
    }

    /// Rebuild the candidate store from a full walk of the root.
    ///
    /// Empty directories found on the way are pruned before returning and
    /// files end up oldest first.
    pub fn scan(&mut self) -> Result<(), ScanError> {
        let root = self.config.path.clone();
        let meta = std::fs::metadata(&root).map_err(|source| ScanError::Root {
            path: root.clone(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(ScanError::NotADirectory { path: root });
        }

        let started = Instant::now();
        let now = SystemTime::now();
        self.store.clear();
        self.stats.scans += 1;

        for entry in WalkDir::new(&root)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!(job = %self.name, error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    let path = entry.path().display();
                    debug!(job = %self.name, path = %path, error = %e, "stat failed");
                    continue;
                }
            };

            if meta.is_file() {
                self.store.push_file(FileCandidate {
                    path: entry.into_path(),
                    size: meta.len(),
                    last_activity: self.config.time_basis.read(&meta),
                });
            } else if meta.is_dir() && self.config.prune_empty_dirs {
                let last_write = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                if empty_dirs::is_idle(last_write, now, self.config.grace_period)
                    && empty_dirs::is_timestamp_shaped_under(&root, entry.path())
                    && empty_dirs::is_empty_dir(entry.path()).unwrap_or(false)
                {
                    self.store.push_dir(DirectoryCandidate {
                        path: entry.into_path(),
                        last_write,
                    });
                }
            }
        }

        self.prune_dirs(now);
        self.store.sort();

        debug!(
            job = %self.name,
            files = self.store.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "scan complete"
        );
        Ok(())
    }

    fn prune_dirs(&mut self, now: SystemTime) {
        let dirs = self.store.take_dirs();
        if dirs.is_empty() {
            return;
        }
        let report =
            DirPruner::new(&self.config.path, self.config.grace_period, now).prune_all(dirs);
        self.stats.dirs_deleted += report.removed as u64;
        self.stats.failed_deletes += report.failed as u64;
    }

    /// Delete oldest files until at least `target_bytes` have been freed or
    /// the store runs out. Failed deletions do not count toward the target.
    pub fn evict_for_quota(&mut self, target_bytes: u64) -> Eviction {
        let now = SystemTime::now();
        let mut evicted = Eviction::default();
        while evicted.bytes < target_bytes {
            let Some(candidate) = self.store.pop_front() else {
                break;
            };
            if self.delete(&candidate, now) {
                evicted.files += 1;
                evicted.bytes += candidate.size;
            }
        }
        info!(
            job = %self.name,
            target = %utils::format_size(target_bytes),
            freed = %utils::format_size(evicted.bytes),
            files = evicted.files,
            "quota eviction done"
        );
        evicted
    }

    /// Delete files idle longer than the timeout, stopping at the first one
    /// that is not; everything behind it is younger.
    ///
    /// Age is taken from the file's current timestamp, not the scan
    /// snapshot, so a file written to since the scan is kept.
    pub fn evict_for_timeout(&mut self, now: SystemTime) -> Eviction {
        let mut evicted = Eviction::default();
        let Some(timeout) = self.config.timeout else {
            return evicted;
        };
        let started = Instant::now();
        let mut next_expiry = None;

        while let Some(front) = self.store.front() {
            let meta = match std::fs::symlink_metadata(&front.path) {
                Ok(meta) => meta,
                Err(_) => {
                    if let Some(gone) = self.store.pop_front() {
                        debug!(job = %self.name, path = %gone.path.display(), "gone, dropping");
                    }
                    continue;
                }
            };
            let last_activity = self.config.time_basis.read(&meta);
            let age = now.duration_since(last_activity).unwrap_or_default();
            if age <= timeout {
                next_expiry = Some(timeout - age);
                break;
            }
            if let Some(candidate) = self.store.pop_front() {
                if self.delete(&candidate, now) {
                    evicted.files += 1;
                    evicted.bytes += candidate.size;
                }
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match next_expiry {
            Some(after) => info!(
                job = %self.name,
                files = evicted.files,
                next_expiry = %utils::format_age(after),
                elapsed_ms,
                "timeout eviction done"
            ),
            None => info!(
                job = %self.name,
                files = evicted.files,
                elapsed_ms,
                "timeout eviction done"
            ),
        }
        evicted
    }

    /// Current used percent, 0 when the probe fails.
    pub fn used_percent(&mut self) -> u8 {
        match self.probe.probe(&self.config.path) {
            Ok(usage) => {
                self.total_bytes.get_or_insert(usage.total_bytes);
                usage.used_percent
            }
            Err(e) => {
                warn!(
                    job = %self.name,
                    path = %self.config.path.display(),
                    error = %e,
                    "disk probe failed"
                );
                0
            }
        }
    }

    /// Mount capacity, probed once and then cached.
    pub fn total_bytes(&mut self) -> Option<u64> {
        if self.total_bytes.is_none() {
            self.used_percent();
        }
        self.total_bytes
    }

    /// Bytes the quota policy wants freed right now, if over the limit.
    pub fn quota_target(&mut self) -> Option<u64> {
        let used = self.used_percent();
        let total = self.total_bytes?;
        disk_info::quota_target(
            total,
            used,
            self.config.limit_percent,
            self.config.safe_percent,
            self.config.quota_overshoot_percent,
        )
    }

    /// One iteration: rescan when the store is drained, evict for quota if
    /// over the limit, then evict expired files.
    pub fn run_once(&mut self) {
        if self.store.is_empty() {
            if let Err(e) = self.scan() {
                error!(job = %self.name, error = %e, "scan failed");
            }
            if self.store.is_empty() {
                debug!(job = %self.name, "nothing to reclaim");
                return;
            }
        }

        if let Some(target) = self.quota_target() {
            self.evict_for_quota(target);
        }
        self.evict_for_timeout(SystemTime::now());
    }

    fn delete(&mut self, candidate: &FileCandidate, now: SystemTime) -> bool {
        let age = utils::format_age(candidate.age(now));
        match std::fs::remove_file(&candidate.path) {
            Ok(()) => {
                self.stats.files_deleted += 1;
                self.stats.bytes_freed += candidate.size;
                info!(
                    job = %self.name,
                    path = %candidate.path.display(),
                    size = candidate.size,
                    age = %age,
                    "deleted file"
                );
                true
            }
            Err(e) => {
                self.stats.failed_deletes += 1;
                warn!(
                    job = %self.name,
                    path = %candidate.path.display(),
                    size = candidate.size,
                    age = %age,
                    error = %e,
                    "delete file failed"
                );
                false
            }
        }
    }
}

impl Job for Reclaimer {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self) -> Result<(), JobError> {
        info!(
            job = %self.name,
            path = %self.config.path.display(),
            limit = self.config.limit_percent,
            safe = self.config.safe_percent,
            timeout = ?self.config.timeout.map(utils::format_age),
            prune_empty_dirs = self.config.prune_empty_dirs,
            "reclaimer starting"
        );
        if let Some(total) = self.total_bytes() {
            debug!(job = %self.name, total = %utils::format_size(total), "mount capacity");
        }
        Ok(())
    }

    fn step(&mut self) -> Result<(), JobError> {
        self.run_once();
        Ok(())
    }

    fn shutdown(&mut self) {
        let s = self.stats;
        info!(
            job = %self.name,
            scans = s.scans,
            files_deleted = s.files_deleted,
            dirs_deleted = s.dirs_deleted,
            freed = %utils::format_size(s.bytes_freed),
            failed = s.failed_deletes,
            "reclaimer stopped"
        );
    }
}
