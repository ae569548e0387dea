//! lockfleet CLI entry point.

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::path::Path;

mod cli;

use cli::{Cli, Command};
use lockfleet::config::Config;
use lockfleet::lifecycle::{self, Lifecycle, ShutdownReport};

fn setup_logging(log_file: Option<&Path>) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create log directory")?;
        }
        let target = Box::new(
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .context("Failed to open log file")?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.log_file.as_deref()).context("Failed to setup logging")?;

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    if cli.seed.is_some() {
        config.seed = cli.seed;
    }
    config.validate().context("Invalid configuration")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Check => {
            print_config(&config);
            Ok(())
        }
        Command::Run => {
            let rt = tokio::runtime::Runtime::new()?;
            let report = rt.block_on(run(config))?;
            print_report(&report);
            Ok(())
        }
    }
}

async fn run(config: Config) -> Result<ShutdownReport> {
    info!("Starting fleet with {} worker profiles", config.workers.len());
    println!("{} Fleet running. Press Ctrl+C to stop.", "→".blue());

    let report = Lifecycle::new(config)
        .run(lifecycle::ctrl_c())
        .await
        .context("Fleet stopped with a fatal error")?;

    Ok(report)
}

fn print_config(config: &Config) {
    println!("{} Configuration is valid", "✓".green());
    println!();
    println!("  Resources ({}):", config.resource_count());
    for resource in &config.resources {
        println!("    {}", resource.cyan());
    }
    println!();
    println!("  Workers ({}):", config.workers.len());
    for w in &config.workers {
        println!(
            "    {} locks {} every {}s, {}..={}s per resource",
            w.name.cyan(),
            w.resource_count,
            w.period_secs,
            w.min_work_secs,
            w.max_work_secs
        );
    }
    println!();
    println!("  Lock timeout:   {}ms", config.coordination.lock_timeout_ms);
    println!("  Grace period:   {}s", config.shutdown.grace_period_secs);
    println!(
        "  Startup window: {} attempts over {}s",
        config.startup.max_attempts,
        lifecycle::startup_window(config).as_secs()
    );
}

fn print_report(report: &ShutdownReport) {
    println!();
    if report.drained {
        println!("{} Fleet drained cleanly", "✓".green());
    } else {
        println!("{} Grace period expired, remaining runs abandoned", "!".yellow());
    }

    let mut names: Vec<_> = report.stats.keys().collect();
    names.sort();
    for name in names {
        let s = &report.stats[name];
        println!(
            "  {:<10} fired {:>4} | completed {:>4} | overran {} | errored {} | abandoned {}",
            name.cyan(),
            s.fired,
            s.completed.to_string().green(),
            s.overran.to_string().yellow(),
            s.errored.to_string().red(),
            s.abandoned
        );
    }

    if report.locks_held > 0 {
        eprintln!("{} {} locks still held", "✗".red(), report.locks_held);
    }
}
