//! Freightline CLI.
//!
//! Runs promotion documents against the built-in step runners, persisting
//! the checkpoint between engine invocations.

mod config;
mod document;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::CtlConfig;
use document::PromotionDocument;
use freightline::step::resolve_aliases;
use freightline::template::Functions;
use freightline::{
    runners, Engine, PromotionCheckpoint, PromotionResult, PromotionStatus, TemplateEngine,
};

#[derive(Parser)]
#[command(name = "freightctl")]
#[command(version, about = "Freightline promotion runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a promotion until it leaves the running phase
    ///
    /// Examples:
    ///     freightctl promote ./promotion.yaml
    ///     freightctl promote ./promotion.yaml --checkpoint ./state.json --once
    #[command(verbatim_doc_comment)]
    Promote {
        /// Promotion document (YAML)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Checkpoint file, read on start and rewritten after every invocation
        #[arg(short, long)]
        checkpoint: Option<PathBuf>,

        /// Invoke the engine once instead of requeueing while running
        #[arg(long)]
        once: bool,

        /// Working directory for steps (default: a fresh temporary directory)
        #[arg(short, long)]
        work_dir: Option<PathBuf>,

        /// Print the final result as JSON
        #[arg(short, long)]
        json: bool,

        /// Seconds between invocations (overrides FREIGHTCTL_REQUEUE_INTERVAL_SECS)
        #[arg(long)]
        requeue_interval: Option<u64>,

        /// Maximum invocations (overrides FREIGHTCTL_MAX_INVOCATIONS)
        #[arg(long)]
        max_invocations: Option<u32>,
    },

    /// Check step aliases and kinds without running anything
    Validate {
        /// Promotion document (YAML)
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Evaluate a template and print the resulting JSON value
    Eval {
        /// Template, e.g. '${{ vars.replicas + 1 }}'
        #[arg(value_name = "TEMPLATE")]
        template: String,

        /// Expression environment as a JSON object
        #[arg(short, long, value_name = "JSON")]
        env: Option<String>,
    },
}

struct PromoteArgs {
    file: PathBuf,
    checkpoint: Option<PathBuf>,
    once: bool,
    work_dir: Option<PathBuf>,
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let mut config = CtlConfig::from_env()?;
    init_tracing(&config);

    let cli = Cli::parse();

    match cli.command {
        Commands::Promote {
            file,
            checkpoint,
            once,
            work_dir,
            json,
            requeue_interval,
            max_invocations,
        } => {
            if let Some(secs) = requeue_interval {
                config.requeue_interval_secs = secs;
            }
            if let Some(max) = max_invocations {
                config.max_invocations = max;
            }
            let args = PromoteArgs {
                file,
                checkpoint,
                once,
                work_dir,
                json,
            };
            let result = promote(&config, &args).await?;
            if result.status != PromotionStatus::Succeeded {
                std::process::exit(1);
            }
        }
        Commands::Validate { file } => validate(&file)?,
        Commands::Eval { template, env } => eval(&template, env.as_deref())?,
    }

    Ok(())
}

fn init_tracing(config: &CtlConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,freightline=debug,freightctl=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if config.json_logs() {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn promote(config: &CtlConfig, args: &PromoteArgs) -> Result<PromotionResult> {
    let document = PromotionDocument::load(&args.file)?;
    let mut ctx = document.to_context();
    if let Some(dir) = &args.work_dir {
        ctx.work_dir = Some(dir.clone());
    }

    if let Some(path) = args.checkpoint.as_deref().filter(|p| p.exists()) {
        let checkpoint = read_checkpoint(path)?;
        tracing::info!(
            path = %path.display(),
            current_step = checkpoint.current_step,
            "Resuming from checkpoint"
        );
        checkpoint.apply(&mut ctx);
    }

    let engine = Engine::new(Arc::new(runners::create_default_registry()));

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            token.cancel();
        }
    });

    let max_invocations = if args.once {
        1
    } else {
        config.max_invocations.max(1)
    };
    let mut work_dir_guard = WorkDirGuard::new(config.keep_work_dir);
    let mut invocation = 0;

    let result = loop {
        invocation += 1;
        tracing::info!(
            promotion = %ctx.promotion,
            invocation,
            start = ctx.start_from_step,
            "Invoking promotion engine"
        );

        let result = engine
            .promote(&cancel, ctx.clone(), &document.steps)
            .await
            .context("Promotion could not be started")?;

        // Later invocations reuse the directory the engine created.
        if result.work_dir_created {
            ctx.work_dir = Some(result.work_dir.clone());
            work_dir_guard.set(result.work_dir.clone());
        }

        let checkpoint = PromotionCheckpoint::from_result(&result);
        if let Some(path) = &args.checkpoint {
            write_checkpoint(path, &checkpoint)?;
        }

        if !result.is_running() || invocation >= max_invocations || cancel.is_cancelled() {
            break result;
        }

        tracing::info!(
            current_step = result.current_step,
            message = result.message.as_deref().unwrap_or(""),
            "Promotion still running, requeueing"
        );
        tokio::select! {
            _ = tokio::time::sleep(config.requeue_interval()) => {}
            _ = cancel.cancelled() => {}
        }
        checkpoint.apply(&mut ctx);
    };

    drop(work_dir_guard);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }

    Ok(result)
}

/// Removes the work directory the engine created once the command is done
/// with it, including when it bails out with an error.
struct WorkDirGuard {
    path: Option<PathBuf>,
    keep: bool,
}

impl WorkDirGuard {
    fn new(keep: bool) -> Self {
        Self { path: None, keep }
    }

    fn set(&mut self, path: PathBuf) {
        self.path = Some(path);
    }
}

impl Drop for WorkDirGuard {
    fn drop(&mut self) {
        let Some(dir) = self.path.take() else {
            return;
        };
        if self.keep {
            tracing::info!(path = %dir.display(), "Keeping work directory");
        } else if let Err(e) = std::fs::remove_dir_all(&dir) {
            tracing::warn!(path = %dir.display(), error = %e, "Failed to remove work directory");
        }
    }
}

fn print_summary(result: &PromotionResult) {
    println!("Promotion {}", result.status);
    if let Some(message) = &result.message {
        println!("  {}", message);
    }
    println!();
    println!("{:<4} {:<28} {:<10} {:<7} MESSAGE", "#", "ALIAS", "STATUS", "ERRORS");
    for (index, record) in result.step_execution_metadata.iter().enumerate() {
        println!(
            "{:<4} {:<28} {:<10} {:<7} {}",
            index,
            record.alias,
            record.status.to_string(),
            record.error_count,
            record.message.as_deref().unwrap_or("")
        );
    }
    for check in &result.health_checks {
        println!("health check requested: {}", check.uses);
    }
}

fn read_checkpoint(path: &Path) -> Result<PromotionCheckpoint> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;
    PromotionCheckpoint::from_json(&content)
        .with_context(|| format!("Failed to parse checkpoint: {}", path.display()))
}

fn write_checkpoint(path: &Path, checkpoint: &PromotionCheckpoint) -> Result<()> {
    let content = checkpoint.to_json()?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write checkpoint: {}", path.display()))
}

fn validate(file: &Path) -> Result<()> {
    let document = PromotionDocument::load(file)?;
    let registry = runners::create_default_registry();

    let aliases = resolve_aliases(&document.steps)?;
    let unknown: Vec<&str> = document
        .steps
        .iter()
        .map(|s| s.kind.as_str())
        .filter(|kind| !registry.has(kind))
        .collect();
    if !unknown.is_empty() {
        anyhow::bail!(
            "Unknown step kinds: {} (available: {})",
            unknown.join(", "),
            registry.list().join(", ")
        );
    }

    for (step, alias) in document.steps.iter().zip(&aliases) {
        println!("{:<28} {}", alias, step.kind);
    }
    println!("{} step(s) OK", aliases.len());
    Ok(())
}

fn eval(template: &str, env: Option<&str>) -> Result<()> {
    let env = match env {
        Some(json) => match serde_json::from_str(json).context("Failed to parse --env JSON")? {
            serde_json::Value::Object(map) => map,
            other => anyhow::bail!("--env must be a JSON object, got {}", other),
        },
        None => serde_json::Map::new(),
    };

    let value = TemplateEngine::new().evaluate_template(template, &env, &Functions::default())?;
    println!("{}", serde_json::to_string(&value)?);
    Ok(())
}
