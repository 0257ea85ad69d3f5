use anyhow::{Context, Result};
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR1};
use signal_hook::iterator::Signals;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use reclaimd::cli::{Cli, Command};
use reclaimd::config::{self, Config};
use reclaimd::controller::Controller;
use reclaimd::jobs;
use reclaimd::utils;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let config =
        Config::load(&path).with_context(|| format!("loading config {}", path.display()))?;

    init_logging(cli.verbose, config.log.level.as_deref());
    debug!(config = %path.display(), jobs = config.jobs.len(), "config loaded");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config),
        Command::Check => check(&config),
    }
}

fn init_logging(verbose: u8, level: Option<&str>) {
    let default = match verbose {
        0 => level.unwrap_or("info"),
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(verbose >= 2)
        .with_line_number(verbose >= 3)
        .init();
}

fn run(config: Config) -> Result<()> {
    let mut signals =
        Signals::new([SIGINT, SIGTERM, SIGUSR1]).context("installing signal handlers")?;

    let mut controller = Controller::new();
    for job in config.jobs {
        let name = job.display_name();
        if let Err(e) = controller.register_worker(job) {
            controller.kill_all();
            controller.join_all();
            return Err(e).with_context(|| format!("starting job {name}"));
        }
    }
    info!(workers = controller.len(), "reclaimd running");

    for signal in signals.forever() {
        match signal {
            SIGUSR1 => {
                info!("SIGUSR1: waking all workers");
                controller.wake_all();
            }
            _ => {
                info!(signal, "shutting down");
                break;
            }
        }
    }

    controller.kill_all();
    controller.join_all();
    for (name, status) in controller.statuses() {
        debug!(worker = %name, state = %status.state, failed = status.failed, "final state");
    }
    Ok(())
}

fn check(config: &Config) -> Result<()> {
    let mut reclaimers = jobs::all_reclaimers(&config.jobs)?;
    for r in &mut reclaimers {
        let limit = r.config().limit_percent;
        let safe = r.config().safe_percent;
        let name = r.config().display_name();
        let root = r.root().display().to_string();

        let total = r.total_bytes();
        let used = r.used_percent();
        let target = r.quota_target();

        println!("{name}: {root}");
        match total {
            Some(total) => println!(
                "  mount: {} total, {}% used (limit {}%, safe {}%)",
                utils::format_size(total),
                used,
                limit,
                safe
            ),
            None => println!("  mount: usage unavailable"),
        }
        match target {
            Some(bytes) => println!("  over limit: would free {}", utils::format_size(bytes)),
            None => println!("  under limit"),
        }
        if let Some(timeout) = r.config().timeout {
            println!("  retention: {}", utils::format_age(timeout));
        }
    }
    Ok(())
}
