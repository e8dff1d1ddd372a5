use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use ruleloom_cli::commands::{self, RunOptions};
use ruleloom_cli::logging::init_logging;
use ruleloom_cli::vars::parse_key_value;
use ruleloom_config::{ConfigLoadError, RuleloomConfig};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// More logging (-d debug, -dd trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    debug: u8,

    /// Config file (default: <config dir>/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a rule file and report disabled rules
    Check {
        rules: PathBuf,

        /// Install expansions from this directory first
        #[arg(long)]
        expansions: Option<PathBuf>,
    },

    /// Fire one event of a rule file for a console player
    Run {
        rules: PathBuf,

        #[arg(short, long)]
        event: String,

        #[arg(short, long, default_value = "Steve")]
        subject: String,

        /// Context property, repeatable
        #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        vars: Vec<(String, String)>,

        /// `%placeholder%` value, repeatable
        #[arg(long = "placeholder", value_name = "NAME=VALUE", value_parser = parse_key_value)]
        placeholders: Vec<(String, String)>,

        /// Scheduler ticks to run after firing
        #[arg(long, default_value_t = 0)]
        ticks: u64,

        #[arg(long)]
        expansions: Option<PathBuf>,

        /// Seed chance rolls
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Load every expansion artifact and report the result
    Expansions {
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Keep a rule file and expansions loaded, reloading on change
    Watch {
        rules: PathBuf,

        #[arg(long)]
        expansions: Option<PathBuf>,
    },
}

/// An explicit config file must exist; the default one is optional
fn load_config(path: Option<&Path>) -> Result<RuleloomConfig> {
    match path {
        Some(path) => RuleloomConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => match RuleloomConfig::load() {
            Ok(config) => Ok(config),
            Err(ConfigLoadError::NotFound(_) | ConfigLoadError::NoConfigDir) => {
                Ok(RuleloomConfig::default())
            }
            Err(e) => Err(e).context("Failed to load config"),
        },
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    let logs = init_logging("cli", config.logging.file, cli.debug)?;

    match cli.command {
        Command::Check { rules, expansions } => {
            let summary = commands::check(&config, &rules, expansions.as_deref())?;
            for event in &summary {
                println!(
                    "{}: {} condition(s), {} action(s), {} disabled",
                    event.name, event.conditions, event.actions, event.disabled
                );
            }

            let warnings = logs.warnings().get();
            if warnings > 0 {
                warn!("{} warning(s) in {}", warnings, rules.display());
                return Ok(ExitCode::FAILURE);
            }
            println!("{} event(s) OK", summary.len());
        }

        Command::Run {
            rules,
            event,
            subject,
            vars,
            placeholders,
            ticks,
            expansions,
            seed,
        } => {
            let outcome = commands::run(
                &config,
                RunOptions {
                    rules,
                    event: event.clone(),
                    subject,
                    vars,
                    placeholders,
                    ticks,
                    expansions,
                    seed,
                    quiet: false,
                },
            )?;

            if !outcome.fired {
                println!("'{}' did not fire: conditions not met", event);
            }
            if outcome.pending > 0 {
                println!("{} scheduled task(s) still pending", outcome.pending);
            }
        }

        Command::Expansions { dir } => {
            let report = commands::list_expansions(&config, dir.as_deref())?;
            for installed in &report.installed {
                println!(
                    "{} v{} by {} ({}){}",
                    installed.type_key,
                    installed.version,
                    installed.author,
                    installed.path.display(),
                    if installed.displaced.is_some() {
                        " overrides built-in"
                    } else {
                        ""
                    }
                );
            }
            for (path, error) in &report.failed {
                println!("FAILED {}: {}", path.display(), error);
            }
            if !report.failed.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }

        Command::Watch { rules, expansions } => {
            commands::watch(&config, &rules, expansions.as_deref()).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
