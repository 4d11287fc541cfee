// src/main.rs

use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod pipeline;
mod sys;

use crate::config::{PipelineConfig, PublishArgs};
use crate::pipeline::{publish_manifest, ScanPipeline};
use crate::sys::backend::AmbientContext;
use crate::sys::shutdown::{listen_for_signals, shutdown_channel};

#[derive(Parser)]
#[command(name = "scan-relay", version, about = "Run a containerized code scan in CI, retain its report, and optionally publish it")]
struct Cli {
    /// Log output format
    #[arg(long, env = "SCAN_RELAY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve the CI job, scan, retain the report, optionally publish it
    Run(PipelineConfig),
    /// Publish a report retained by an earlier `run` for one lease
    Publish(PublishArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scan_relay=info,scanner=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().with_current_span(false).init(),
        LogFormat::Pretty => builder.with_target(true).init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match dispatch(cli.command).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %format!("{:#}", e), "scan-relay failed");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(command: Command) -> anyhow::Result<u8> {
    // ==============================================================================
    // 1. Signals & Environment
    // ==============================================================================
    let (sender, token) = shutdown_channel();
    tokio::spawn(listen_for_signals(sender));
    let ambient = AmbientContext::from_process();

    // ==============================================================================
    // 2. Dispatch
    // ==============================================================================
    match command {
        Command::Run(config) => {
            info!(version = env!("CARGO_PKG_VERSION"), "⚙️ scan-relay starting");
            match ScanPipeline::new(config).run(&ambient, token).await {
                Ok(summary) => {
                    if let Some(e) = &summary.tunnel_error {
                        warn!(error = %e, "Report was retained but not published");
                    }
                    Ok(summary.exit_code())
                }
                Err(e) => {
                    error!(error = %e, exit_code = e.exit_code(), "Run aborted");
                    Ok(e.exit_code())
                }
            }
        }
        Command::Publish(args) => {
            let url = publish_manifest(&args, &ambient, token)
                .await
                .with_context(|| format!("publishing {}", args.manifest.display()))?;
            info!(url = %url, "Publish lease ended");
            Ok(0)
        }
    }
}
