//! Callflow CLI - Command-line interface for invoking workflows
//!
//! Provides subcommands for describing a workflow, writing call settings,
//! and running a workflow once per row of a JSON table.

use anyhow::{Context, Result, anyhow, bail};
use callflow::invoker::{CallSettings, DataTable, ProgressListener};
use callflow::runtime::cancel::CancelToken;
use callflow::runtime::process::ManifestLoader;
use callflow::runtime::resolver::ResolveContext;
use callflow::runtime::scheduler::TokioScheduler;
use callflow::runtime::storage;
use callflow::{CallRuntime, RuntimeConfig};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "callflow")]
#[command(about = "Invoke packaged workflows once per input row", long_about = None)]
struct Cli {
    /// Workspace root for absolute and callflow://workspace references
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Runtime configuration file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the declared parameters of a workflow
    Describe {
        /// Workflow reference
        workflow: String,
    },

    /// Write a call settings file
    Bind {
        /// Settings file to write
        #[arg(short, long)]
        settings: PathBuf,

        /// Workflow reference
        #[arg(long)]
        workflow: String,

        /// Static binding, as NAME=JSON
        #[arg(long = "static", value_name = "NAME=JSON")]
        statics: Vec<String>,

        /// Per-row binding, as NAME=FIELD
        #[arg(long = "column", value_name = "NAME=FIELD")]
        columns: Vec<String>,
    },

    /// Run a workflow once per row of a JSON table
    Invoke {
        /// Call settings file
        #[arg(short, long)]
        settings: PathBuf,

        /// Input table (JSON)
        #[arg(short, long)]
        input: PathBuf,

        /// Output table file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write the effective runtime configuration
    Config {
        /// Destination file
        path: PathBuf,
    },
}

struct LogProgress;

impl ProgressListener for LogProgress {
    fn on_row(&self, index: usize, total: usize, key: &str) {
        info!(row = %key, "processing row {} of {}", index + 1, total);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => storage::load_config(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => RuntimeConfig::default(),
    }
    .with_env_overrides();

    match cli.command {
        Commands::Describe { workflow } => {
            let runtime = start_runtime(config);
            let context = resolve_context(&cli.workspace)?;
            let signature = {
                let runtime = runtime.clone();
                tokio::task::spawn_blocking(move || {
                    runtime.describe(&workflow, &context, &CancelToken::new())
                })
                .await??
            };
            runtime.shutdown();
            println!("{}", serde_json::to_string_pretty(&signature)?);
        }

        Commands::Bind {
            settings,
            workflow,
            statics,
            columns,
        } => {
            let mut call = CallSettings::new(workflow);
            for entry in &statics {
                let (name, json) = split_pair(entry)?;
                let value: Value = serde_json::from_str(json)
                    .with_context(|| format!("invalid JSON for parameter '{name}'"))?;
                call.binding.bind_static(name, value);
            }
            for entry in &columns {
                let (name, field) = split_pair(entry)?;
                call.binding.bind_column(name, field);
            }
            call.save_to(&settings)
                .with_context(|| format!("failed to write {}", settings.display()))?;
            println!("Wrote settings to {}", settings.display());
        }

        Commands::Invoke {
            settings,
            input,
            output,
        } => {
            let tree = CallSettings::read_tree(&settings)
                .with_context(|| format!("failed to read {}", settings.display()))?;
            let call = CallSettings::load(&tree)
                .with_context(|| format!("invalid settings in {}", settings.display()))?;
            let table: DataTable = serde_json::from_slice(
                &storage::read_file(&input)
                    .with_context(|| format!("failed to read {}", input.display()))?,
            )
            .with_context(|| format!("invalid input table {}", input.display()))?;

            let runtime = start_runtime(config);
            let context = resolve_context(&cli.workspace)?;
            let cancel = CancelToken::new();
            let interrupt = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("interrupt received, cancelling after the current row");
                        cancel.cancel();
                    }
                })
            };

            let result = runtime
                .clone()
                .invoke_detached(call, context, table, cancel, Arc::new(LogProgress))
                .await;
            interrupt.abort();
            runtime.shutdown();
            let result = result?;

            let json = serde_json::to_vec_pretty(&result.table)?;
            match output {
                Some(path) => storage::write_atomic(&path, &json)
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => println!("{}", String::from_utf8_lossy(&json)),
            }
            eprintln!(
                "{} rows, {} failed{}",
                result.table.row_count(),
                result.failed_rows,
                if result.cancelled { ", cancelled" } else { "" }
            );
        }

        Commands::Config { path } => {
            storage::write_config(&path, &config)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Wrote configuration to {}", path.display());
        }
    }

    Ok(())
}

fn start_runtime(config: RuntimeConfig) -> Arc<CallRuntime> {
    Arc::new(CallRuntime::new(
        config,
        Arc::new(ManifestLoader::new()),
        Arc::new(TokioScheduler::new(tokio::runtime::Handle::current())),
    ))
}

fn resolve_context(workspace: &Path) -> Result<ResolveContext> {
    let root = workspace
        .canonicalize()
        .with_context(|| format!("workspace {} not found", workspace.display()))?;
    let current = std::env::current_dir().context("cannot read current directory")?;
    Ok(ResolveContext::new(root, current))
}

fn split_pair(entry: &str) -> Result<(&str, &str)> {
    let (name, value) = entry
        .split_once('=')
        .ok_or_else(|| anyhow!("expected NAME=VALUE, got '{entry}'"))?;
    if name.trim().is_empty() {
        bail!("empty parameter name in '{entry}'");
    }
    Ok((name.trim(), value))
}
