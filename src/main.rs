//! replay-runner - normalize, inspect and dry-run captured browser recordings.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use browser_replay::engine::{ActionDispatch, ReplayEngine, RunOptions, TimingMode};
use browser_replay::models::{Action, Recording, SelectorWithMetadata};
use browser_replay::normalize::normalize;
use browser_replay::progress::{ProgressBus, ProgressEvent};
use browser_replay::resolve::{ElementHandle, PageQuery, PageQueryError};
use browser_replay::RunStatus;

#[derive(Parser)]
#[command(name = "replay-runner")]
#[command(about = "Replay captured browser recordings with live progress reporting")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output JSON (for agent consumption)
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize a recording into canonical, causally-ordered form
    Normalize {
        /// Recording JSON file
        file: PathBuf,

        /// Write the canonical recording here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Summarize a recording's actions and selector strategies
    Inspect {
        /// Recording JSON file
        file: PathBuf,
    },

    /// Execute a recording against an in-memory page model (dry run)
    Run {
        /// Recording JSON file
        file: PathBuf,

        /// JSON page model describing the elements the dry run can resolve
        #[arg(long)]
        page_model: Option<PathBuf>,

        /// Timing mode: realistic, fast or instant
        #[arg(long, default_value = "instant")]
        timing: String,

        /// Speed multiplier for recorded gaps (2.0 = twice as fast)
        #[arg(long, default_value_t = 1.0)]
        speed: f64,

        /// Keep executing after an action fails
        #[arg(long)]
        continue_on_error: bool,

        /// Per-action timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,

        /// Run ID (defaults to a fresh UUID)
        #[arg(long)]
        run_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "browser_replay=info".to_string()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Normalize { file, output } => cmd_normalize(&file, output.as_deref(), cli.json),
        Commands::Inspect { file } => cmd_inspect(&file, cli.json),
        Commands::Run {
            file,
            page_model,
            timing,
            speed,
            continue_on_error,
            timeout,
            run_id,
        } => {
            cmd_run(
                &file,
                page_model.as_deref(),
                &timing,
                speed,
                continue_on_error,
                timeout,
                run_id,
                cli.json,
            )
            .await
        }
    }
}

fn load_recording(path: &Path) -> Result<Recording> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read recording file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Recording {} is not a valid recording document", path.display()))
}

fn cmd_normalize(file: &Path, output: Option<&Path>, json: bool) -> Result<()> {
    let recording = load_recording(file)?;
    let normalized = normalize(recording);

    for anomaly in &normalized.anomalies {
        eprintln!(
            "warning: residual anomaly: {}",
            serde_json::to_string(anomaly)?
        );
    }
    if !json {
        if normalized.relocated.is_empty() {
            eprintln!("normalized {} actions", normalized.recording.actions.len());
        } else {
            eprintln!(
                "normalized {} actions ({} relocated by sequence repair: {})",
                normalized.recording.actions.len(),
                normalized.relocated.len(),
                normalized.relocated.join(", ")
            );
        }
    }

    let canonical = serde_json::to_string_pretty(&normalized.recording)?;
    match output {
        Some(path) => std::fs::write(path, canonical)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => println!("{canonical}"),
    }
    Ok(())
}

fn cmd_inspect(file: &Path, json: bool) -> Result<()> {
    let recording = load_recording(file)?;

    if json {
        let summary: Vec<serde_json::Value> = recording
            .actions
            .iter()
            .map(|action| {
                let c = action.common();
                serde_json::json!({
                    "id": c.id,
                    "type": action.kind(),
                    "timestamp": c.timestamp,
                    "optional": action.is_skippable(),
                    "strategies": c.selectors.iter()
                        .map(|s| s.strategy.as_str())
                        .collect::<Vec<_>>(),
                    "hasContentSignature": c.content_signature.is_some(),
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "id": recording.id,
                "testName": recording.test_name,
                "url": recording.url,
                "actions": summary,
            }))?
        );
        return Ok(());
    }

    println!("{} ({})", recording.test_name, recording.id);
    println!("url: {}", recording.url);
    println!("actions: {}", recording.actions.len());
    for action in &recording.actions {
        let c = action.common();
        let strategies: Vec<&str> = c.selectors.iter().map(|s| s.strategy.as_str()).collect();
        let mut extras = Vec::new();
        if !strategies.is_empty() {
            extras.push(format!("strategies: {}", strategies.join(",")));
        }
        if c.selector.is_some() {
            extras.push("legacy selector".to_string());
        }
        if c.content_signature.is_some() {
            extras.push("content-signature".to_string());
        }
        if action.is_skippable() {
            extras.push("optional".to_string());
        }
        println!(
            "  {:>8}ms  {:<16} {}  {}",
            c.timestamp,
            action.kind(),
            c.id,
            extras.join("; ")
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_run(
    file: &Path,
    page_model: Option<&Path>,
    timing: &str,
    speed: f64,
    continue_on_error: bool,
    timeout: u64,
    run_id: Option<String>,
    json: bool,
) -> Result<()> {
    let recording = load_recording(file)?;
    let normalized = normalize(recording);

    let page = match page_model {
        Some(path) => PageModel::load(path)?,
        None => PageModel::default(),
    };

    let timing_mode = match timing {
        "realistic" => TimingMode::Realistic,
        "fast" => TimingMode::Fast,
        "instant" => TimingMode::Instant,
        other => anyhow::bail!("Unknown timing mode '{other}' (realistic, fast, instant)"),
    };

    let mut options = RunOptions {
        timing_mode,
        speed_multiplier: speed,
        continue_on_error,
        timeout: Duration::from_secs(timeout),
        ..RunOptions::default()
    };
    if let Some(id) = run_id {
        options.run_id = id;
    }

    let bus = Arc::new(ProgressBus::new());
    let _observer = bus.subscribe_with(
        &options.run_id,
        move |event| print_event(&event, json),
        || {},
    );

    let engine = ReplayEngine::new(page, DryRunDispatch, Arc::clone(&bus));
    let result = engine
        .execute(&normalized.recording, &options)
        .await
        .context("Run aborted by engine fault")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!(
            "\n{:?}: {}/{} executed, {} failed, {} skipped in {}ms",
            result.status,
            result.actions_executed,
            result.actions_total,
            result.actions_failed,
            result.skipped_actions.len(),
            result.duration_ms
        );
        for error in &result.errors {
            println!("  {} {}: {}", error.action_type, error.action_id, error.error);
        }
    }

    if result.status != RunStatus::Success {
        std::process::exit(1);
    }
    Ok(())
}

fn print_event(event: &ProgressEvent, json: bool) {
    if json {
        if let Ok(payload) = event.to_payload() {
            println!("{payload}");
        }
        return;
    }
    match event {
        ProgressEvent::RunStarted {
            test_name,
            actions_total,
            ..
        } => println!("run started: {test_name} ({actions_total} actions)"),
        ProgressEvent::ActionStarted { action, .. } => {
            println!(
                "[{}/{}] {} {} ...",
                action.index + 1,
                action.total,
                action.action_type,
                action.action_id
            );
        }
        ProgressEvent::ActionSuccess {
            action,
            duration_ms,
            selector,
            ..
        } => {
            let via = selector
                .as_deref()
                .map(|s| format!(" via {s}"))
                .unwrap_or_default();
            println!(
                "[{}/{}] ok{via} ({duration_ms}ms)",
                action.index + 1,
                action.total
            );
        }
        ProgressEvent::ActionFailed {
            action,
            error,
            duration_ms,
            ..
        } => {
            println!(
                "[{}/{}] FAILED: {error} ({duration_ms}ms)",
                action.index + 1,
                action.total
            );
        }
        ProgressEvent::ActionSkipped { action, reason, .. } => {
            println!(
                "[{}/{}] skipped: {reason}",
                action.index + 1,
                action.total
            );
        }
        ProgressEvent::RunCompleted { status, .. } => {
            println!("run completed: {status:?}");
        }
        ProgressEvent::RunError { error, .. } => {
            println!("run error: {error}");
        }
    }
}

/// In-memory page model backing dry runs: selector values and element types
/// mapped to the elements they resolve to.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageModel {
    /// Selector value -> matching elements
    #[serde(default)]
    elements: HashMap<String, Vec<ElementHandle>>,
    /// Element type -> structural candidates for signature fallback
    #[serde(default)]
    structural: HashMap<String, Vec<ElementHandle>>,
}

impl PageModel {
    fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read page model {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Page model {} is not valid", path.display()))
    }
}

#[async_trait]
impl PageQuery for PageModel {
    async fn query(
        &self,
        candidate: &SelectorWithMetadata,
    ) -> Result<Vec<ElementHandle>, PageQueryError> {
        Ok(self
            .elements
            .get(&candidate.value)
            .cloned()
            .unwrap_or_default())
    }

    async fn query_structural(
        &self,
        element_type: &str,
        _list_container: Option<&str>,
    ) -> Result<Vec<ElementHandle>, PageQueryError> {
        Ok(self
            .structural
            .get(element_type)
            .cloned()
            .unwrap_or_default())
    }
}

/// Dispatch capability for dry runs: performs nothing, logs everything.
struct DryRunDispatch;

#[async_trait]
impl ActionDispatch for DryRunDispatch {
    async fn dispatch(
        &self,
        action: &Action,
        target: Option<&ElementHandle>,
    ) -> anyhow::Result<()> {
        tracing::info!(
            action = action.id(),
            kind = action.kind(),
            target = target.map(|t| t.handle.as_str()).unwrap_or("-"),
            "dry-run dispatch"
        );
        Ok(())
    }
}
