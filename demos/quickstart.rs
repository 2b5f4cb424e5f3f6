//! Replay Quickstart Example
//!
//! Builds a small recording in code, replays it against an in-memory page,
//! and prints the live progress stream.
//!
//! # Running
//! ```bash
//! cargo run --example quickstart
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use browser_replay::engine::{ActionDispatch, ReplayEngine, RunOptions, TimingMode};
use browser_replay::models::{
    Action, ActionCommon, Recording, SelectorWithMetadata, Viewport,
};
use browser_replay::normalize::normalize;
use browser_replay::progress::ProgressBus;
use browser_replay::resolve::{ElementHandle, PageQuery, PageQueryError};

/// Minimal in-memory page: selector value -> elements.
struct DemoPage {
    elements: HashMap<String, Vec<ElementHandle>>,
}

#[async_trait]
impl PageQuery for DemoPage {
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
        _element_type: &str,
        _list_container: Option<&str>,
    ) -> Result<Vec<ElementHandle>, PageQueryError> {
        Ok(vec![])
    }
}

/// Dispatch that prints instead of driving a browser.
struct PrintingDispatch;

#[async_trait]
impl ActionDispatch for PrintingDispatch {
    async fn dispatch(
        &self,
        action: &Action,
        target: Option<&ElementHandle>,
    ) -> anyhow::Result<()> {
        println!(
            "   -> dispatching {} {} (target: {})",
            action.kind(),
            action.id(),
            target.map(|t| t.handle.as_str()).unwrap_or("none")
        );
        Ok(())
    }
}

fn action(id: &str, timestamp: i64, selector: &str) -> ActionCommon {
    ActionCommon {
        id: id.to_string(),
        timestamp,
        completed_at: None,
        url: "https://example.com".to_string(),
        frame_id: None,
        frame_url: None,
        frame_selector: None,
        context: None,
        is_optional: false,
        skip_if_not_found: false,
        reason: None,
        selector: Some(selector.to_string()),
        selectors: vec![],
        content_signature: None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("Browser Replay Quickstart");
    println!("=========================\n");

    // Step 1: a recording as the recorder would capture it.
    let recording = Recording {
        id: "rec_demo".to_string(),
        version: "2".to_string(),
        test_name: "login flow".to_string(),
        url: "https://example.com".to_string(),
        start_time: 0,
        end_time: None,
        viewport: Viewport {
            width: 1280,
            height: 800,
        },
        user_agent: "demo".to_string(),
        actions: vec![
            Action::Input {
                common: action("act_001", 0, "form#login > input.email"),
                value: "jane@example.com".to_string(),
            },
            Action::Click {
                common: action("act_002", 400, "form#login > button[type=\"submit\"]"),
                button: None,
                text: Some("Sign in".to_string()),
            },
        ],
    };

    // Step 2: normalize into canonical order.
    let normalized = normalize(recording);
    println!(
        "1. Normalized {} actions\n",
        normalized.recording.actions.len()
    );

    // Step 3: subscribe to live progress and replay.
    let mut elements = HashMap::new();
    for selector in ["form#login > input.email", "form#login > button[type=\"submit\"]"] {
        elements.insert(
            selector.to_string(),
            vec![ElementHandle {
                handle: format!("@{selector}"),
                text: String::new(),
                attributes: HashMap::new(),
            }],
        );
    }

    let bus = Arc::new(ProgressBus::new());
    let options = RunOptions {
        timing_mode: TimingMode::Instant,
        run_id: "demo-run".to_string(),
        ..RunOptions::default()
    };

    let _observer = bus.subscribe_with(
        &options.run_id,
        |event| println!("   event: {}", event.to_payload().unwrap_or_default()),
        || println!("   (stream closed)"),
    );

    println!("2. Replaying...");
    let engine = ReplayEngine::new(DemoPage { elements }, PrintingDispatch, Arc::clone(&bus));
    let result = engine.execute(&normalized.recording, &options).await?;

    println!(
        "\n3. Done: {:?} - {}/{} actions in {}ms",
        result.status, result.actions_executed, result.actions_total, result.duration_ms
    );

    Ok(())
}
