use std::collections::VecDeque;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::Deserialize;

/// Which timestamp counts as a file's last activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeBasis {
    #[default]
    Modified,
    Accessed,
    Changed,
}

impl TimeBasis {
    pub fn read(self, meta: &Metadata) -> SystemTime {
        let time = match self {
            TimeBasis::Modified => meta.modified().ok(),
            TimeBasis::Accessed => meta.accessed().or_else(|_| meta.modified()).ok(),
            TimeBasis::Changed => ctime(meta),
        };
        time.unwrap_or(SystemTime::UNIX_EPOCH)
    }
}

fn ctime(meta: &Metadata) -> Option<SystemTime> {
    let secs = u64::try_from(meta.ctime()).ok()?;
    let nanos = u32::try_from(meta.ctime_nsec()).unwrap_or(0);
    SystemTime::UNIX_EPOCH.checked_add(Duration::new(secs, nanos))
}

/// A file seen during a scan. The file may change or vanish afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCandidate {
    pub path: PathBuf,
    pub size: u64,
    pub last_activity: SystemTime,
}

impl FileCandidate {
    /// Time since last activity; zero for timestamps in the future.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_activity).unwrap_or_default()
    }
}

/// An empty, timestamp-shaped directory seen during a scan. Every condition
/// is re-checked before it is actually removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryCandidate {
    pub path: PathBuf,
    pub last_write: SystemTime,
}

/// Files from one scan pass, oldest first, plus empty directories found by
/// the same pass.
///
/// Files are only taken from the front, so the order established by
/// [`CandidateStore::sort`] holds until the store is empty and rescanned.
#[derive(Debug, Default)]
pub struct CandidateStore {
    files: VecDeque<FileCandidate>,
    dirs: Vec<DirectoryCandidate>,
}

impl CandidateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_file(&mut self, candidate: FileCandidate) {
        self.files.push_back(candidate);
    }

    pub fn push_dir(&mut self, candidate: DirectoryCandidate) {
        self.dirs.push(candidate);
    }

    /// Oldest first. Stable, so equal timestamps keep walk order.
    pub fn sort(&mut self) {
        self.files
            .make_contiguous()
            .sort_by_key(|c| c.last_activity);
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn front(&self) -> Option<&FileCandidate> {
        self.files.front()
    }

    pub fn pop_front(&mut self) -> Option<FileCandidate> {
        self.files.pop_front()
    }

    pub fn files(&self) -> impl Iterator<Item = &FileCandidate> {
        self.files.iter()
    }

    /// Hands over the directory list; the store keeps none afterwards.
    pub fn take_dirs(&mut self) -> Vec<DirectoryCandidate> {
        std::mem::take(&mut self.dirs)
    }

    pub fn dir_count(&self) -> usize {
        self.dirs.len()
    }

    pub fn clear(&mut self) {
        self.files.clear();
        self.dirs.clear();
    }
}
