//! BrandPulse CLI
//!
//! Operator tooling for the workflow core: inspect the effective retry
//! table, classify error messages and rehearse workflows against scripted
//! stage outcomes.

mod commands;
mod output;
mod scenario;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use output::OutputFormat;
use pulse_core::AppConfig;
use pulse_observability::{init_tracing, TracingConfig};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(
    name = "brandpulse",
    author = "BrandPulse Team",
    version,
    about = "BrandPulse workflow core - retry, routing and recovery tooling",
    long_about = "A command-line interface for the BrandPulse workflow core.\n\n\
                  Use this CLI to inspect retry policies, check how an error\n\
                  message is classified, and rehearse complete workflows\n\
                  against scripted stage outcomes."
)]
struct Cli {
    /// Configuration file (environment overrides still apply)
    #[arg(short, long, env = "PULSE_CONFIG")]
    config: Option<PathBuf>,

    /// Output format (text, json, yaml)
    #[arg(
        short,
        long,
        default_value = "text",
        value_parser = ["text", "json", "yaml"]
    )]
    format: String,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective retry policy per error category
    Policies,

    /// Classify an error message and show the policy it maps to
    Classify {
        /// Error message as a stage would report it
        message: String,
    },

    /// Run the orchestrator against a scripted scenario
    Simulate {
        /// Scenario file (YAML)
        scenario: PathBuf,

        /// Print the audit trail instead of the final state
        #[arg(short, long)]
        trail: bool,

        /// Skip backoff sleeps between retries
        #[arg(long)]
        instant: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<AppConfig> {
    match path {
        Some(path) => {
            let path = path.to_string_lossy();
            AppConfig::load_from_file(&path)
                .with_context(|| format!("failed to load configuration from {}", path))
        }
        None => AppConfig::load().context("failed to load configuration from environment"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let result = run(cli).await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            for cause in e.chain().skip(1) {
                eprintln!("{}: {}", "Caused by".yellow(), cause);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_ref())?;
    let format: OutputFormat = cli.format.parse().map_err(anyhow::Error::msg)?;

    let mut tracing_config = TracingConfig::from(&config.logging);
    if cli.verbose {
        tracing_config = tracing_config.with_log_level("debug");
    }
    if cli.no_color {
        tracing_config.colored_output = false;
    }
    init_tracing(&tracing_config)?;

    match cli.command {
        Commands::Policies => commands::policies::run(&config.pipeline, format),
        Commands::Classify { message } => {
            commands::classify::run(&config.pipeline, &message, format)
        }
        Commands::Simulate {
            scenario,
            trail,
            instant,
        } => commands::simulate::run(&config.pipeline, &scenario, trail, instant, format).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cli_parses_simulate() {
        let cli = Cli::try_parse_from([
            "brandpulse",
            "--format",
            "json",
            "simulate",
            "scenarios/chat.yaml",
            "--trail",
            "--instant",
        ])
        .unwrap();

        assert_eq!(cli.format, "json");
        match cli.command {
            Commands::Simulate {
                scenario,
                trail,
                instant,
            } => {
                assert_eq!(scenario, PathBuf::from("scenarios/chat.yaml"));
                assert!(trail);
                assert!(instant);
            }
            _ => panic!("expected simulate"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_format() {
        assert!(Cli::try_parse_from(["brandpulse", "--format", "xml", "policies"]).is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "pipeline:\n  parallel_threshold: 25\n  retry_policies:\n    network:\n      max_retries: 1\n      backoff: fixed\nlogging:\n  json: true"
        )
        .unwrap();

        let path = file.path().to_path_buf();
        let config = load_config(Some(&path)).unwrap();

        assert_eq!(config.pipeline.parallel_threshold, 25);
        assert_eq!(config.pipeline.retry_policies["network"].max_retries, 1);
        assert!(config.logging.json);
    }
}
