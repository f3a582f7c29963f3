//! indexcheck - publish operator bundles and an index image, then prove the
//! published index round-trips into a local catalog

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use indexcheck_core::config::PipelineConfig;
use indexcheck_core::container::{ContainerTool, ToolClient};
use indexcheck_core::tags::{RunIdentifiers, TagGenerator};
use indexcheck_core::{Pipeline, PipelineError, PipelineFailure, PipelineReport, RunContext};

/// Log levels
#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Parser, Debug)]
#[clap(
    name = "indexcheck",
    about = "Build and push operator bundles and an index image, then verify the index round-trips",
    version
)]
struct Cli {
    /// Container tool to use: docker or podman
    #[clap(value_name = "CONTAINER_TOOL")]
    tool: Vec<String>,

    /// Pipeline configuration file (default: ./indexcheck.yaml, then the user config dir)
    #[clap(long)]
    config: Option<PathBuf>,

    /// Directory relative paths are resolved against (default: current directory)
    #[clap(long)]
    work_dir: Option<PathBuf>,

    /// Kill any container tool command running longer than this
    #[clap(long)]
    timeout_secs: Option<u64>,

    /// Keep the scratch verification database
    #[clap(long)]
    keep_database: bool,

    /// Set log level
    #[clap(long, default_value = "info")]
    log_level: LogLevel,

    /// Emit logs as JSON
    #[clap(long)]
    log_json: bool,
}

/// Initialize tracing with CLI flags
///
/// Logs always go to stderr; stdout carries only the summary table.
fn initialize_tracing(log_level: &LogLevel, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_filter_directive()));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Table row for the verified catalog
#[derive(Tabled, Debug, PartialEq)]
struct ChannelRow {
    #[tabled(rename = "Package")]
    package: String,
    #[tabled(rename = "Channel")]
    channel: String,
    #[tabled(rename = "Head")]
    head: String,
    #[tabled(rename = "Bundles")]
    bundles: String,
}

fn summary_rows(report: &PipelineReport) -> Vec<ChannelRow> {
    report
        .summary
        .packages
        .iter()
        .flat_map(|package| {
            package.channels.iter().map(move |channel| {
                let is_default = package.default_channel.as_deref() == Some(channel.name.as_str());
                let default_marker = if is_default { " (default)" } else { "" };
                ChannelRow {
                    package: package.name.clone(),
                    channel: format!("{}{}", channel.name, default_marker),
                    head: channel.head.clone(),
                    bundles: channel
                        .bundles
                        .iter()
                        .map(|b| b.version.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                }
            })
        })
        .collect()
}

fn print_report(report: &PipelineReport) {
    println!("Index image: {}", report.index_image);
    for image in &report.bundle_images {
        println!("Bundle image: {image}");
    }

    let table = Table::new(summary_rows(report))
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()))
        .to_string();
    println!("{table}");
}

/// 2 for bad usage, 1 for anything else
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<PipelineError>() {
        Some(e) if e.is_usage() => 2,
        _ => 1,
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Validated before anything touches the container tool
    let tool = ContainerTool::from_args(cli.tool.as_slice())?;

    let work_dir = match cli.work_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to determine current directory")?,
    };
    let (mut config, source) = PipelineConfig::discover(cli.config.as_deref(), &work_dir)?;
    info!("Using configuration from {}", source);

    if let Some(secs) = cli.timeout_secs {
        config.command_timeout_secs = Some(secs);
    }
    if cli.keep_database {
        config.keep_database = true;
    }
    let config = config.rooted_at(&work_dir);

    let mut generator = TagGenerator::from_clock();
    let identifiers =
        RunIdentifiers::generate(&mut generator, config.bundle_paths.len(), config.tag_length);
    info!(
        "Run tags: bundles {:?}, index {}",
        identifiers.bundle_tags(),
        identifiers.index_tag()
    );

    let client = Arc::new(ToolClient::new(tool).with_timeout(config.command_timeout()));
    let ctx = RunContext::new(config, tool, identifiers)?;

    let mut pipeline = Pipeline::new(client, &ctx.config);
    let report = pipeline.run(&ctx).await?;

    print_report(&report);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    initialize_tracing(&cli.log_level, cli.log_json);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // Stage failures were already logged by the pipeline
            if err.downcast_ref::<PipelineFailure>().is_none() {
                eprintln!("Error: {err:#}");
            }
            ExitCode::from(exit_code(&err))
        }
    }
}
