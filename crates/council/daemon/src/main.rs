//! councild - run and inspect council workflows
//!
//! Subcommands:
//! - `run`: submit one workflow against a scripted provider
//! - `roles`: print the validated role table
//! - `replay`: rebuild workflows from an audit file and snapshots
//! - `verify-audit`: check the audit hash chain

use anyhow::Context;
use clap::{Parser, Subcommand};
use council_daemon::commands;
use council_daemon::DaemonConfig;
use council_types::WorkflowId;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Council daemon CLI
#[derive(Parser)]
#[command(name = "councild")]
#[command(about = "Role-gated task orchestration", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "COUNCIL_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (overrides the configuration file)
    #[arg(long, global = true, env = "COUNCIL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, global = true, env = "COUNCIL_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one workflow to completion
    Run {
        /// Request payload as JSON, or @path to a JSON file
        #[arg(short, long, default_value = "null")]
        payload: String,

        /// Script file answering provider calls
        #[arg(short, long)]
        script: Option<PathBuf>,
    },

    /// Show the configured roles
    Roles,

    /// Rebuild workflows from persisted state
    Replay {
        /// Audit file (JSON lines)
        #[arg(short, long)]
        audit: PathBuf,

        /// Snapshot directory
        #[arg(short, long)]
        snapshots: Option<PathBuf>,

        /// Only this workflow
        #[arg(short, long)]
        workflow: Option<String>,

        /// Include the full state, not just the summary
        #[arg(long)]
        full: bool,
    },

    /// Verify the audit hash chain
    VerifyAudit {
        /// Audit file (JSON lines)
        #[arg(short, long)]
        audit: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = DaemonConfig::load(cli.config.as_deref()).context("loading configuration")?;

    // Initialize tracing; logs go to stderr so stdout stays machine-readable
    let level = cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    if cli.json || config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    match cli.command {
        Command::Run { payload, script } => {
            let payload = commands::parse_payload(&payload).await?;
            let script = match script {
                Some(path) => commands::load_script(&path)
                    .await
                    .with_context(|| format!("loading script {}", path.display()))?,
                None => Default::default(),
            };

            let report = commands::run_workflow(&config, payload, script).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.succeeded() {
                std::process::exit(1);
            }
        }
        Command::Roles => {
            let roles = commands::roles(&config)?;
            println!("{}", serde_json::to_string_pretty(&roles)?);
        }
        Command::Replay {
            audit,
            snapshots,
            workflow,
            full,
        } => {
            let workflow = workflow.map(WorkflowId::new);
            let replayed =
                commands::replay(&config, &audit, snapshots.as_deref(), workflow.as_ref(), full).await?;
            println!("{}", serde_json::to_string_pretty(&replayed)?);
        }
        Command::VerifyAudit { audit } => {
            let check = commands::verify_audit(&audit)
                .await
                .with_context(|| format!("reading {}", audit.display()))?;
            println!("{}", serde_json::to_string_pretty(&check)?);
            if !check.valid {
                std::process::exit(2);
            }
        }
    }

    Ok(())
}
