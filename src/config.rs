use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

use crate::candidates::TimeBasis;
use crate::error::ConfigError;

/// Empty directories must be idle this long before they are pruned.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3600);

/// Extra percent of the mount added to every quota target so the next
/// iteration does not trip the limit again on rounding.
pub const DEFAULT_QUOTA_OVERSHOOT_PERCENT: u64 = 1;

pub const DEFAULT_SLEEP: Duration = Duration::from_secs(60);

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default, rename = "job")]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Filter directive for the subscriber, e.g. "info" or "reclaimd=debug".
    pub level: Option<String>,
}

/// Settings for one reclamation job. Immutable once the job is registered.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    #[serde(default)]
    pub name: Option<String>,

    pub path: PathBuf,

    pub limit_percent: u8,

    pub safe_percent: u8,

    /// Retention; files idle longer than this are deleted. `None` disables
    /// timeout eviction.
    #[serde(default, deserialize_with = "de_opt_duration")]
    pub timeout: Option<Duration>,

    #[serde(default = "default_sleep", deserialize_with = "de_duration")]
    pub sleep: Duration,

    #[serde(default)]
    pub prune_empty_dirs: bool,

    #[serde(default)]
    pub time_basis: TimeBasis,

    #[serde(default = "default_grace_period", deserialize_with = "de_duration")]
    pub grace_period: Duration,

    #[serde(default = "default_overshoot")]
    pub quota_overshoot_percent: u64,
}

fn default_sleep() -> Duration {
    DEFAULT_SLEEP
}

fn default_grace_period() -> Duration {
    DEFAULT_GRACE_PERIOD
}

fn default_overshoot() -> u64 {
    DEFAULT_QUOTA_OVERSHOOT_PERCENT
}

impl JobConfig {
    /// A job with the default sleep, grace period and overshoot.
    pub fn new(path: impl Into<PathBuf>, limit_percent: u8, safe_percent: u8) -> Self {
        Self {
            name: None,
            path: path.into(),
            limit_percent,
            safe_percent,
            timeout: None,
            sleep: DEFAULT_SLEEP,
            prune_empty_dirs: false,
            time_basis: TimeBasis::default(),
            grace_period: DEFAULT_GRACE_PERIOD,
            quota_overshoot_percent: DEFAULT_QUOTA_OVERSHOOT_PERCENT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn with_prune_empty_dirs(mut self, prune: bool) -> Self {
        self.prune_empty_dirs = prune;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name used for the worker thread and in log events.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.path.display().to_string(),
        }
    }

    /// Reject thresholds and paths that would make the job meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let job = self.display_name();

        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::invalid(&job, "path is empty"));
        }
        if !self.path.is_absolute() {
            return Err(ConfigError::invalid(
                &job,
                format!("path {} is not absolute", self.path.display()),
            ));
        }
        if self.limit_percent > 100 {
            return Err(ConfigError::invalid(
                &job,
                format!("limit_percent {} exceeds 100", self.limit_percent),
            ));
        }
        if self.safe_percent >= self.limit_percent {
            return Err(ConfigError::invalid(
                &job,
                format!(
                    "safe_percent {} must be below limit_percent {}",
                    self.safe_percent, self.limit_percent
                ),
            ));
        }
        if self.sleep.is_zero() {
            return Err(ConfigError::invalid(&job, "sleep must be non-zero"));
        }
        Ok(())
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(text)?;
        config.assign_names();
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    fn assign_names(&mut self) {
        for (i, job) in self.jobs.iter_mut().enumerate() {
            if job.name.is_none() {
                job.name = Some(format!("job-{:02}", i + 1));
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jobs.is_empty() {
            return Err(ConfigError::NoJobs);
        }
        let mut seen = HashSet::new();
        for job in &self.jobs {
            job.validate()?;
            let name = job.display_name();
            if !seen.insert(name.clone()) {
                return Err(ConfigError::DuplicateName(name));
            }
        }
        Ok(())
    }
}

/// `--config` if given, else the per-user file when present, else /etc.
pub fn default_config_path() -> PathBuf {
    if let Some(dir) = dirs::config_dir() {
        let user = dir.join("reclaimd").join("config.toml");
        if user.exists() {
            return user;
        }
    }
    PathBuf::from("/etc/reclaimd/config.toml")
}

/// Accepts `3600` (seconds) or `"1h"`.
fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(DurationVisitor)
}

fn de_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    de_duration(deserializer).map(Some)
}

struct DurationVisitor;

impl<'de> Visitor<'de> for DurationVisitor {
    type Value = Duration;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("seconds as an integer or a duration string such as \"7d\"")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
        Ok(Duration::from_secs(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
        u64::try_from(v)
            .map(Duration::from_secs)
            .map_err(|_| E::custom(format!("negative duration: {v}")))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
        parse_duration(v).map_err(E::custom)
    }
}

/// Parse "90", "90s", "15m", "7d" and the other forms humantime accepts.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| format!("invalid duration '{s}': {e}"))
}
