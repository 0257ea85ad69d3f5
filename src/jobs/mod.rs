pub mod empty_dirs;
pub mod reclaim;

use crate::config::JobConfig;
use crate::disk_info::StatvfsProbe;
use crate::error::ConfigError;
use reclaim::Reclaimer;

/// A reclaimer for `config` backed by statvfs, after validating it.
pub fn build_reclaimer(config: JobConfig) -> Result<Reclaimer, ConfigError> {
    config.validate()?;
    Ok(Reclaimer::new(config, Box::new(StatvfsProbe)))
}

/// Validates every job before building any of them.
pub fn all_reclaimers(jobs: &[JobConfig]) -> Result<Vec<Reclaimer>, ConfigError> {
    for job in jobs {
        job.validate()?;
    }
    jobs.iter().cloned().map(build_reclaimer).collect()
}
