//! `dfc`: command surface over [`dice_forecast_api::ForecastApi`].
//!
//! [`run_cli`] prints whatever [`execute`] renders, so tests can drive the
//! full command set without spawning a process.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dice_forecast_api::feed::DEFAULT_FEED_TIMEOUT_MS;
use dice_forecast_api::{FeedClient, ForecastApi};
use dice_forecast_core::{EnsembleConfig, ForecastReport, Outcome, RoundInput, SignatureEntry};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "dfc")]
#[command(about = "Dice forecast CLI")]
pub struct Cli {
    #[arg(long, default_value = "./dice_forecast.sqlite3")]
    db: PathBuf,

    /// Ensemble config JSON file; stored as the active config when given.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Round {
        #[command(subcommand)]
        command: RoundCommand,
    },
    Forecast(ForecastArgs),
    Stats,
    History(HistoryArgs),
    Poll(PollArgs),
    /// Kelly stake sizing for the current forecast.
    Advice,
    Signatures {
        #[command(subcommand)]
        command: SignaturesCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum RoundCommand {
    Append(AppendArgs),
}

#[derive(Debug, Args)]
pub struct AppendArgs {
    #[arg(long)]
    round_id: u64,
    /// Three comma-separated faces, e.g. `6,5,4`.
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    dice: Vec<i64>,
    #[arg(long)]
    total: Option<i64>,
    #[arg(long)]
    outcome: Option<OutcomeArg>,
    #[arg(long)]
    md5: Option<String>,
}

#[derive(Debug, Args)]
pub struct ForecastArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Args)]
pub struct PollArgs {
    #[arg(long)]
    feed_url: String,
    #[arg(long, default_value_t = DEFAULT_FEED_TIMEOUT_MS)]
    timeout_ms: u64,
}

#[derive(Debug, Subcommand)]
pub enum SignaturesCommand {
    List(SignaturesListArgs),
}

#[derive(Debug, Args)]
pub struct SignaturesListArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutcomeArg {
    High,
    Low,
}

pub fn run_cli(cli: Cli) -> Result<()> {
    let rendered = execute(cli)?;
    println!("{rendered}");
    Ok(())
}

/// Runs one parsed command and returns its rendered output.
pub fn execute(cli: Cli) -> Result<String> {
    let config = cli.config.as_deref().map(load_config).transpose()?;
    let api = ForecastApi::open(&cli.db, config)?;

    match cli.command {
        Command::Round {
            command: RoundCommand::Append(args),
        } => {
            let report = api.ingest(&round_input(args)?)?;
            Ok(serde_json::to_string_pretty(&report)?)
        }
        Command::Forecast(args) => {
            let report = api.forecast()?;
            if args.json {
                Ok(serde_json::to_string_pretty(&report)?)
            } else {
                Ok(render_forecast(&report))
            }
        }
        Command::Stats => Ok(serde_json::to_string_pretty(&api.stats()?)?),
        Command::History(args) => Ok(serde_json::to_string_pretty(&api.history(args.limit)?)?),
        Command::Poll(args) => {
            let client = FeedClient::new(args.feed_url, args.timeout_ms);
            let report = api.poll_once(&client)?;
            Ok(serde_json::to_string_pretty(&report)?)
        }
        Command::Advice => Ok(serde_json::to_string_pretty(&api.capital_advice()?)?),
        Command::Signatures {
            command: SignaturesCommand::List(args),
        } => {
            let entries = api.signatures()?;
            if args.json {
                Ok(serde_json::to_string_pretty(&entries)?)
            } else {
                Ok(render_signatures(&entries))
            }
        }
    }
}

fn load_config(path: &std::path::Path) -> Result<EnsembleConfig> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let value: Value = serde_json::from_str(&body)
        .with_context(|| format!("config file {} is not valid JSON", path.display()))?;
    Ok(EnsembleConfig::from_json(&value)?)
}

fn round_input(args: AppendArgs) -> Result<RoundInput> {
    let dice: [i64; 3] = args
        .dice
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("--dice expects exactly three faces, got {}", args.dice.len()))?;

    Ok(RoundInput {
        round_id: args.round_id,
        outcome: args.outcome.map(|outcome| match outcome {
            OutcomeArg::High => Outcome::High,
            OutcomeArg::Low => Outcome::Low,
        }),
        dice,
        total: args.total,
        md5: args.md5,
    })
}

fn render_forecast(report: &ForecastReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "round={} next={} dice={} total={}",
        report.round_id, report.next_round_id, report.dice, report.total
    );
    let _ = writeln!(
        out,
        "forecast={} confidence={} p_high={:.4}",
        report.forecast, report.confidence, report.probability
    );
    let _ = writeln!(out, "pattern={}", report.pattern);
    let _ = writeln!(out, "{}", report.capital_advice);
    let _ = write!(out, "{}", report.rationale);
    out
}

fn render_signatures(entries: &[SignatureEntry]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<12} {:<8} {:<10} {:<9} rationale",
        "pattern", "forecast", "confidence", "origin"
    );
    let _ = write!(out, "{}", "-".repeat(72));
    for entry in entries {
        let _ = write!(
            out,
            "\n{:<12} {:<8} {:<10} {:<9} {}",
            entry.pattern,
            entry.forecast.as_str(),
            entry.confidence,
            entry.origin.as_str(),
            entry.rationale
        );
    }
    out
}
