use std::path::PathBuf;

use thiserror::Error;

/// Problems found while loading or validating the configuration.
/// All of these are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no jobs configured")]
    NoJobs,

    #[error("job {job}: {reason}")]
    Invalid { job: String, reason: String },

    #[error("duplicate job name: {0}")]
    DuplicateName(String),
}

impl ConfigError {
    pub(crate) fn invalid(job: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            job: job.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("path contains an interior NUL byte: {0}")]
    InvalidPath(PathBuf),

    #[error("statvfs {path} failed: {source}")]
    Statvfs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("cannot walk {path}: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not a directory")]
    NotADirectory { path: PathBuf },
}

/// Failure reported by a job's `init` or `step`; ends that worker's loop.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("init failed: {0}")]
    Init(String),

    #[error("step failed: {0}")]
    Step(String),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to spawn worker thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown worker id {0}")]
    UnknownWorker(usize),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
