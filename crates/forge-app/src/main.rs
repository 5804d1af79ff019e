//! Forge - turn plain-language requests into front-end project files.
//!
//! Classifies each request, runs the matching multi-stage pipeline against a
//! completion service and writes the changed files back into the project.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use forge_adapters::{ArtifactStore, Config, DirArtifactStore, FileRulesStore};
use forge_core::pipeline::all_pipelines;
use forge_core::{classify, pipeline_for, ArtifactMap, ProgressEvent};
use forge_engine::llm::{CompletionClient, Usage};
use forge_engine::{ErrorKind, Orchestrator, OrchestratorSettings, RunError, RunResult};
use serde_json::{json, Value};
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "forge",
    about = "Generate and edit front-end projects from plain-language requests",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a request against a project directory
    Run {
        message: String,

        /// Project directory (defaults to current directory)
        #[arg(long, default_value = ".")]
        dir: PathBuf,

        /// Run every stage but leave the project untouched
        #[arg(long)]
        dry_run: bool,
    },
    /// Show which pipeline a request would take
    Classify {
        message: String,

        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
    /// List the registered pipelines
    Pipelines,
    /// Remember a project rule that is sent along with every request
    Rule { text: String },
    /// Show the saved settings, or update them when flags are given
    Config {
        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        endpoint: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    match args.command {
        Command::Run {
            message,
            dir,
            dry_run,
        } => run(&message, &dir, dry_run).await,
        Command::Classify { message, dir } => classify_request(&message, &dir),
        Command::Pipelines => {
            list_pipelines();
            Ok(())
        }
        Command::Rule { text } => add_rule(&text),
        Command::Config { model, endpoint } => configure(model, endpoint),
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("FORGE_LOG")
                .unwrap_or_else(|_| "forge=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn load_project(dir: &Path) -> Result<(DirArtifactStore, ArtifactMap)> {
    let store = DirArtifactStore::new(dir);
    let artifacts = store
        .load_all()
        .with_context(|| format!("Failed to read project at {}", dir.display()))?;
    Ok((store, artifacts))
}

fn print_progress(event: &ProgressEvent) {
    eprintln!("  [{}] {}", event.kind, event.message);
}

async fn run(message: &str, dir: &Path, dry_run: bool) -> Result<()> {
    let config = Config::load();
    if !config.has_api_key() {
        eprintln!("  ! No API key found. Set FORGE_API_KEY, OPENROUTER_API_KEY or OPENAI_API_KEY.");
    }

    let (store, existing) = load_project(dir)?;
    let client = CompletionClient::from_config(&config)?;
    let rules = config.rules_location().map(FileRulesStore::open);

    let mut orchestrator = Orchestrator::new(client, OrchestratorSettings::from_config(&config));
    if let Some(rules) = &rules {
        orchestrator = orchestrator.with_rules(Box::new(rules.clone()));
    }

    let mut result = orchestrator.run(message, existing, print_progress).await;

    let mut written = 0;
    if result.success && !dry_run {
        match store.save_all(&result.changed()) {
            Ok(count) => written = count,
            Err(err) => {
                result.success = false;
                result.error = Some(RunError {
                    kind: ErrorKind::Storage,
                    stage: None,
                    artifact: Some(err.artifact().to_string()),
                    message: err.to_string(),
                });
            }
        }
    }

    if let Some(mut rules) = rules {
        if let Err(err) =
            rules.record_history(message, result.metadata.intent.category, result.success)
        {
            warn!(error = %err, "failed to record request history");
        }
    }

    println!("{}", serde_json::to_string_pretty(&summary(&result, written))?);

    match &result.error {
        Some(error) if !result.success => anyhow::bail!("{}", error.message),
        _ => Ok(()),
    }
}

/// Run result without artifact bodies.
fn summary(result: &RunResult, written: usize) -> Value {
    json!({
        "success": result.success,
        "run_id": result.metadata.run_id,
        "intent": result.metadata.intent,
        "pipeline": result.metadata.pipeline,
        "rerouted_from": result.metadata.rerouted_from,
        "stages": result.metadata.stages,
        "changed_artifacts": result.changed_artifacts,
        "written": written,
        "explanation": result.explanation,
        "warnings": result.warnings,
        "consistency": result.consistency,
        "error": result.error,
        "tokens": {
            "estimated": result.metadata.estimated_tokens,
            "actual": result.metadata.actual_tokens,
            "cache_hits": result.metadata.cache_hits,
        },
        "cost_usd": result.metadata.usage.as_ref().map(Usage::cost),
    })
}

fn classify_request(message: &str, dir: &Path) -> Result<()> {
    let (_, existing) = load_project(dir)?;
    let intent = classify(message, !existing.is_empty());
    let pipeline = pipeline_for(intent.category);
    let out = json!({
        "intent": intent,
        "stages": pipeline.stages,
        "description": pipeline.description,
        "existing_artifacts": existing.len(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn list_pipelines() {
    for pipeline in all_pipelines() {
        let stages: Vec<&str> = pipeline.stages.iter().map(|s| s.label()).collect();
        println!(
            "{:<13} {:<32} ~{:>6} tokens  {}",
            pipeline.intent.label(),
            stages.join(" -> "),
            pipeline.estimated_token_budget,
            pipeline.description
        );
    }
}

fn add_rule(text: &str) -> Result<()> {
    let config = Config::load();
    let path = config
        .rules_location()
        .context("Could not determine config directory")?;
    let mut rules = FileRulesStore::open(path);
    rules.add_rule(text)?;
    println!("  + Saved rule to {}", rules.path().display());
    Ok(())
}

/// Works on the saved file only; `FORGE_MODEL`/`FORGE_ENDPOINT` are not
/// written back.
fn configure(model: Option<String>, endpoint: Option<String>) -> Result<()> {
    let mut config = Config::config_path()
        .map(|path| Config::load_from(&path))
        .unwrap_or_default();

    if model.is_none() && endpoint.is_none() {
        println!("{}", serde_json::to_string_pretty(&config)?);
        println!("  ({})", Config::config_location());
        return Ok(());
    }

    if let Some(model) = model {
        config.model = model;
    }
    if let Some(endpoint) = endpoint {
        config.endpoint = endpoint;
    }
    config.save()?;
    println!("  + Saved settings to {}", Config::config_location());
    Ok(())
}
