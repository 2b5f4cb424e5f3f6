//! End-to-end replay tests: raw recording JSON through normalization and
//! execution, with the page and dispatch capabilities mocked the way a
//! browser-automation collaborator would implement them.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use browser_replay::engine::{ActionDispatch, ReplayEngine, RunOptions, TimingMode};
use browser_replay::models::{Action, SelectorWithMetadata};
use browser_replay::normalize::normalize;
use browser_replay::progress::{ProgressBus, ProgressEvent};
use browser_replay::resolve::{ElementHandle, PageQuery, PageQueryError};
use browser_replay::RunStatus;

/// Page fixture: selector values and element types mapped to elements.
#[derive(Default)]
struct ScriptedPage {
    elements: HashMap<String, Vec<ElementHandle>>,
    structural: Vec<ElementHandle>,
}

impl ScriptedPage {
    fn insert(&mut self, selector: &str, handles: &[&str]) {
        self.elements.insert(
            selector.to_string(),
            handles
                .iter()
                .map(|h| ElementHandle {
                    handle: h.to_string(),
                    text: String::new(),
                    attributes: HashMap::new(),
                })
                .collect(),
        );
    }
}

#[async_trait]
impl PageQuery for ScriptedPage {
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
        Ok(self.structural.clone())
    }
}

/// Dispatch fixture recording the order actions were performed in. The log
/// handle is shared so tests keep a view after the fixture moves into the
/// engine.
#[derive(Default, Clone)]
struct RecordingDispatch {
    performed: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

#[async_trait]
impl ActionDispatch for RecordingDispatch {
    async fn dispatch(
        &self,
        action: &Action,
        target: Option<&ElementHandle>,
    ) -> anyhow::Result<()> {
        self.performed
            .lock()
            .unwrap()
            .push((action.id().to_string(), target.map(|t| t.handle.clone())));
        Ok(())
    }
}

/// A checkout-flow recording as the recorder actually serializes it: array
/// out of order, absolute epoch timestamps, the email input flushed after
/// the submit click, and an optional cookie banner.
const CHECKOUT_RECORDING: &str = r##"{
    "id": "rec_checkout",
    "version": "2",
    "testName": "checkout happy path",
    "url": "https://shop.test",
    "startTime": 1700000000000,
    "viewport": {"width": 1440, "height": 900},
    "userAgent": "recorder/2.4",
    "actions": [
        {
            "type": "click",
            "id": "act_004",
            "timestamp": 1700000004000,
            "url": "https://shop.test/cart",
            "text": "Submit order",
            "selector": "form#order > button[type=\"submit\"]"
        },
        {
            "type": "navigation",
            "id": "act_001",
            "timestamp": 1700000000000,
            "url": "https://shop.test",
            "toUrl": "https://shop.test/cart"
        },
        {
            "type": "input",
            "id": "act_005",
            "timestamp": 1700000004200,
            "url": "https://shop.test/cart",
            "value": "jane@example.com",
            "selector": "form#order > input.email"
        },
        {
            "type": "click",
            "id": "act_002",
            "timestamp": 1700000001000,
            "url": "https://shop.test/cart",
            "isOptional": true,
            "reason": "cookie banner does not always appear",
            "selectors": [
                {"strategy": "css", "value": ".cookie-accept", "priority": 1, "confidence": 90}
            ]
        },
        {
            "type": "click",
            "id": "act_003",
            "timestamp": 1700000002000,
            "url": "https://shop.test/cart",
            "selectors": [
                {"strategy": "id", "value": "#qty-up", "priority": 1, "confidence": 95},
                {"strategy": "css", "value": ".qty .up", "priority": 2, "confidence": 60}
            ]
        }
    ]
}"##;

fn scripted_checkout_page() -> ScriptedPage {
    let mut page = ScriptedPage::default();
    page.insert("form#order > button[type=\"submit\"]", &["@submit"]);
    page.insert("form#order > input.email", &["@email"]);
    page.insert("#qty-up", &["@qty"]);
    // No .cookie-accept on this page: the optional action must skip.
    page
}

async fn drain(sub: &mut browser_replay::ProgressSubscription) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Some(event) = sub.next_event().await {
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}

#[tokio::test]
async fn test_checkout_recording_replays_in_causal_order() {
    let recording: browser_replay::Recording =
        serde_json::from_str(CHECKOUT_RECORDING).expect("recording parses");
    let normalized = normalize(recording);

    // Normalization rebased timestamps and moved the trailing email input
    // back in front of its submit.
    let ids: Vec<&str> = normalized
        .recording
        .actions
        .iter()
        .map(|a| a.id())
        .collect();
    assert_eq!(ids, vec!["act_001", "act_002", "act_003", "act_005", "act_004"]);
    assert_eq!(normalized.recording.actions[0].timestamp(), 0);
    assert_eq!(normalized.relocated, vec!["act_005".to_string()]);

    let bus = Arc::new(ProgressBus::new());
    let mut sub = bus.subscribe("run-checkout");
    let dispatch = RecordingDispatch::default();
    let performed = Arc::clone(&dispatch.performed);
    let engine = ReplayEngine::new(scripted_checkout_page(), dispatch, Arc::clone(&bus));

    let options = RunOptions {
        timing_mode: TimingMode::Instant,
        run_id: "run-checkout".to_string(),
        ..RunOptions::default()
    };
    let result = engine
        .execute(&normalized.recording, &options)
        .await
        .expect("no engine fault");

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.actions_total, 5);
    assert_eq!(result.actions_executed, 4);
    assert_eq!(result.actions_failed, 0);
    assert_eq!(result.skipped_actions, vec!["act_002".to_string()]);

    // Dispatch saw the repaired order: email input before the submit click.
    assert_eq!(
        performed.lock().unwrap().clone(),
        vec![
            ("act_001".to_string(), None),
            ("act_003".to_string(), Some("@qty".to_string())),
            ("act_005".to_string(), Some("@email".to_string())),
            ("act_004".to_string(), Some("@submit".to_string())),
        ]
    );

    // Event stream mirrors the run: started first, one terminal event, and
    // per-action terminal events matching the counters.
    let events = drain(&mut sub).await;
    assert!(matches!(events.first(), Some(ProgressEvent::RunStarted { .. })));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    let action_terminal = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                ProgressEvent::ActionSuccess { .. }
                    | ProgressEvent::ActionFailed { .. }
                    | ProgressEvent::ActionSkipped { .. }
            )
        })
        .count();
    assert_eq!(
        action_terminal,
        result.actions_executed + result.actions_failed + result.skipped_actions.len()
    );
    match events.last() {
        Some(ProgressEvent::RunCompleted {
            status,
            actions_executed,
            actions_skipped,
            ..
        }) => {
            assert_eq!(*status, RunStatus::Success);
            assert_eq!(*actions_executed, 4);
            assert_eq!(*actions_skipped, 1);
        }
        other => panic!("expected run:completed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_recording_reports_errors_and_exit_state() {
    let recording: browser_replay::Recording =
        serde_json::from_str(CHECKOUT_RECORDING).expect("recording parses");
    let normalized = normalize(recording);

    // Page without the submit button: the final required action fails.
    let mut page = scripted_checkout_page();
    page.elements.remove("form#order > button[type=\"submit\"]");

    let bus = Arc::new(ProgressBus::new());
    let engine = ReplayEngine::new(page, RecordingDispatch::default(), Arc::clone(&bus));
    let options = RunOptions {
        timing_mode: TimingMode::Instant,
        continue_on_error: true,
        run_id: "run-fail".to_string(),
        ..RunOptions::default()
    };
    let result = engine
        .execute(&normalized.recording, &options)
        .await
        .expect("no engine fault");

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.actions_failed, 1);
    assert_eq!(result.errors[0].action_id, "act_004");
    assert!(result.errors[0].error.contains("no strategy matched"));
}

#[tokio::test]
async fn test_concurrent_runs_do_not_cross_talk() {
    let bus = Arc::new(ProgressBus::new());

    let mut sub_a = bus.subscribe("run-a");
    let mut sub_b = bus.subscribe("run-b");

    let make_engine = |bus: &Arc<ProgressBus>| {
        let mut page = ScriptedPage::default();
        page.insert("#go", &["@go"]);
        ReplayEngine::new(page, RecordingDispatch::default(), Arc::clone(bus))
    };

    let recording: browser_replay::Recording = serde_json::from_str(
        r##"{
            "id": "rec_tiny", "version": "2", "testName": "tiny",
            "url": "https://a.test", "startTime": 0,
            "viewport": {"width": 800, "height": 600}, "userAgent": "r",
            "actions": [
                {"type": "click", "id": "act_001", "timestamp": 0,
                 "url": "https://a.test", "selector": "#go"}
            ]
        }"##,
    )
    .unwrap();

    let engine_a = make_engine(&bus);
    let engine_b = make_engine(&bus);
    let opts = |id: &str| RunOptions {
        timing_mode: TimingMode::Instant,
        run_id: id.to_string(),
        ..RunOptions::default()
    };

    let opts_a = opts("run-a");
    let opts_b = opts("run-b");
    let (ra, rb) = tokio::join!(
        engine_a.execute(&recording, &opts_a),
        engine_b.execute(&recording, &opts_b),
    );
    assert_eq!(ra.unwrap().status, RunStatus::Success);
    assert_eq!(rb.unwrap().status, RunStatus::Success);

    let events_a = drain(&mut sub_a).await;
    let events_b = drain(&mut sub_b).await;
    assert!(events_a.iter().all(|e| e.run_id() == "run-a"));
    assert!(events_b.iter().all(|e| e.run_id() == "run-b"));
}
