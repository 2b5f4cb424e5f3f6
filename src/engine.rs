//! Run state machine: executes a normalized recording against the page
//! capabilities and streams lifecycle events.
//!
//! A run is strictly sequential: one action at a time, matching the causal
//! dependency of real browser interactions. Concurrent runs are independent
//! state machines sharing nothing but the progress bus. Every suspension
//! point (timing delay, page query, dispatch await) observes the run's
//! cancellation token, so an abort is never stuck behind a sleep.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::models::{Action, Recording};
use crate::progress::{ActionRef, EventMeta, ProgressBus, ProgressEvent, ProgressPublisher};
use crate::resolve::{self, ElementHandle, PageQuery, Resolution};

/// Upper bound for a single step in `fast` timing mode.
const FAST_MODE_DELAY_CAP: Duration = Duration::from_millis(250);

/// Timestamp inversions up to this size are sequence-repair artifacts from
/// normalization (matching its look-back window) and are executed as ordered.
const REPAIR_ARTIFACT_WINDOW_MS: i64 = 5_000;

/// Performs recorded inputs against the live page. Owned by the
/// browser-automation collaborator; the engine never drives the browser
/// directly.
#[async_trait]
pub trait ActionDispatch: Send + Sync {
    /// Perform one action. `target` is present whenever resolution produced
    /// an element for it.
    async fn dispatch(
        &self,
        action: &Action,
        target: Option<&ElementHandle>,
    ) -> anyhow::Result<()>;

    /// Capture a screenshot for the given action, returning its path.
    /// Drivers without capture support keep the default.
    async fn capture_screenshot(
        &self,
        run_id: &str,
        action_id: &str,
    ) -> anyhow::Result<Option<PathBuf>> {
        let _ = (run_id, action_id);
        Ok(None)
    }

    /// Fetch the recorded video artifact once the run finished, if any.
    async fn collect_video(&self, run_id: &str) -> anyhow::Result<Option<PathBuf>> {
        let _ = run_id;
        Ok(None)
    }
}

/// Pacing of the gaps between actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimingMode {
    /// Recorded gaps, scaled by the speed multiplier
    Realistic,
    /// Recorded gaps, capped to keep runs quick
    Fast,
    /// No delays at all
    Instant,
}

/// When to ask the dispatch capability for screenshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScreenshotMode {
    OnFailure,
    Always,
    Never,
}

/// Per-run configuration.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Browser channel requested from the driver (driver-defined names)
    pub browser: Option<String>,
    pub headless: bool,
    /// Ask the driver to record video for this run
    pub video: bool,
    pub screenshot_mode: ScreenshotMode,
    /// Budget for one action's resolution plus dispatch
    pub timeout: Duration,
    pub enable_timing: bool,
    pub timing_mode: TimingMode,
    /// Divides recorded gaps; 2.0 replays twice as fast
    pub speed_multiplier: f64,
    /// Hard ceiling on any single inter-action delay
    pub max_action_delay: Duration,
    pub continue_on_error: bool,
    pub abort: CancellationToken,
    pub run_id: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            browser: None,
            headless: true,
            video: false,
            screenshot_mode: ScreenshotMode::OnFailure,
            timeout: Duration::from_secs(30),
            enable_timing: true,
            timing_mode: TimingMode::Fast,
            speed_multiplier: 1.0,
            max_action_delay: Duration::from_secs(5),
            continue_on_error: false,
            abort: CancellationToken::new(),
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
    /// Cancelled mid-action after earlier successes
    Partial,
    Cancelled,
}

/// One action's failure, as carried in the run result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionError {
    pub action_id: String,
    pub action_type: String,
    pub index: usize,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<PathBuf>,
}

/// Outcome of one run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub status: RunStatus,
    pub duration_ms: u64,
    pub actions_total: usize,
    pub actions_executed: usize,
    pub actions_failed: usize,
    pub errors: Vec<ActionError>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped_actions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub screenshots: Vec<PathBuf>,
}

/// Replays a recording against the injected page capabilities.
pub struct ReplayEngine<P, D> {
    page: P,
    dispatch: D,
    bus: Arc<ProgressBus>,
}

/// What happened to one action inside the per-action boundary.
enum ActionOutcome {
    Success { selector: Option<String> },
    Skipped { reason: String },
    Failed { error: String },
    Aborted,
}

impl<P: PageQuery, D: ActionDispatch> ReplayEngine<P, D> {
    pub fn new(page: P, dispatch: D, bus: Arc<ProgressBus>) -> Self {
        Self {
            page,
            dispatch,
            bus,
        }
    }

    /// Execute a recording to a terminal state.
    ///
    /// Per-action problems (resolution failures, dispatch errors, timeouts)
    /// land in the returned [`RunResult`]; only engine-level faults (invalid
    /// options, progress transport failures) are returned as `Err`, after a
    /// `run:error` event.
    pub async fn execute(
        &self,
        recording: &Recording,
        options: &RunOptions,
    ) -> anyhow::Result<RunResult> {
        let publisher = self.bus.publisher(&options.run_id);

        if let Err(fault) = validate_options(options) {
            return self.engine_fault(&publisher, fault).await;
        }

        // Defensive re-sort: the single source of truth for execution order,
        // independent of input array order. Inversions within the repair
        // window are deliberate normalizer artifacts (inputs moved back in
        // front of their submit) and must survive; anything larger means the
        // sequence never went through normalization, so timestamps win.
        let mut actions: Vec<Action> = recording.actions.clone();
        let max_inversion = actions
            .windows(2)
            .map(|w| (w[0].timestamp() - w[1].timestamp()).max(0))
            .max()
            .unwrap_or(0);
        if max_inversion > REPAIR_ARTIFACT_WINDOW_MS {
            tracing::warn!(
                run_id = options.run_id.as_str(),
                max_inversion,
                "unordered action sequence; re-sorting by timestamp"
            );
            actions.sort_by_key(|a| a.timestamp());
        }
        let total = actions.len();

        tracing::info!(
            run_id = options.run_id.as_str(),
            test = recording.test_name.as_str(),
            total,
            "run started"
        );
        if let Err(e) = publisher.publish(ProgressEvent::RunStarted {
            meta: EventMeta::now(&options.run_id),
            test_name: recording.test_name.clone(),
            actions_total: total,
        }) {
            return self.engine_fault(&publisher, e.into()).await;
        }

        let run_started = Instant::now();
        let mut executed = 0usize;
        let mut errors: Vec<ActionError> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();
        let mut screenshots: Vec<PathBuf> = Vec::new();
        let mut status: Option<RunStatus> = None;
        let mut prev_timestamp: Option<i64> = None;

        for (index, action) in actions.iter().enumerate() {
            if options.abort.is_cancelled() {
                status = Some(RunStatus::Cancelled);
                break;
            }

            let delay = inter_action_delay(prev_timestamp, action.timestamp(), options);
            prev_timestamp = Some(action.timestamp());
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = options.abort.cancelled() => {
                        status = Some(RunStatus::Cancelled);
                        break;
                    }
                }
            }

            let action_ref = ActionRef {
                action_id: action.id().to_string(),
                action_type: action.kind().to_string(),
                index,
                total,
            };
            if let Err(e) = publisher.publish(ProgressEvent::ActionStarted {
                meta: EventMeta::now(&options.run_id),
                action: action_ref.clone(),
            }) {
                return self.engine_fault(&publisher, e.into()).await;
            }

            let action_started = Instant::now();
            let outcome = self.run_action(action, options).await;
            let duration_ms = action_started.elapsed().as_millis() as u64;

            let publish_result = match outcome {
                ActionOutcome::Success { selector } => {
                    executed += 1;
                    if options.screenshot_mode == ScreenshotMode::Always {
                        if let Ok(Some(path)) = self
                            .dispatch
                            .capture_screenshot(&options.run_id, action.id())
                            .await
                        {
                            screenshots.push(path);
                        }
                    }
                    publisher.publish(ProgressEvent::ActionSuccess {
                        meta: EventMeta::now(&options.run_id),
                        action: action_ref,
                        duration_ms,
                        selector,
                    })
                }
                ActionOutcome::Skipped { reason } => {
                    skipped.push(action.id().to_string());
                    tracing::debug!(
                        run_id = options.run_id.as_str(),
                        action = action.id(),
                        reason = reason.as_str(),
                        "action skipped"
                    );
                    publisher.publish(ProgressEvent::ActionSkipped {
                        meta: EventMeta::now(&options.run_id),
                        action: action_ref,
                        reason,
                    })
                }
                ActionOutcome::Failed { error } => {
                    let screenshot = if options.screenshot_mode != ScreenshotMode::Never {
                        match self
                            .dispatch
                            .capture_screenshot(&options.run_id, action.id())
                            .await
                        {
                            Ok(path) => {
                                if let Some(p) = &path {
                                    screenshots.push(p.clone());
                                }
                                path
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "screenshot capture failed");
                                None
                            }
                        }
                    } else {
                        None
                    };
                    tracing::warn!(
                        run_id = options.run_id.as_str(),
                        action = action.id(),
                        error = error.as_str(),
                        "action failed"
                    );
                    errors.push(ActionError {
                        action_id: action.id().to_string(),
                        action_type: action.kind().to_string(),
                        index,
                        error: error.clone(),
                        screenshot,
                    });
                    let published = publisher.publish(ProgressEvent::ActionFailed {
                        meta: EventMeta::now(&options.run_id),
                        action: action_ref,
                        duration_ms,
                        error,
                    });
                    if published.is_ok() && !options.continue_on_error {
                        // Remaining actions are not attempted; they are
                        // neither executed nor skipped.
                        status = Some(RunStatus::Failed);
                    }
                    published
                }
                ActionOutcome::Aborted => {
                    status = Some(if executed > 0 {
                        RunStatus::Partial
                    } else {
                        RunStatus::Cancelled
                    });
                    Ok(())
                }
            };

            if let Err(e) = publish_result {
                return self.engine_fault(&publisher, e.into()).await;
            }
            if status.is_some() {
                break;
            }
        }

        let status = status.unwrap_or(if errors.is_empty() {
            RunStatus::Success
        } else {
            RunStatus::Failed
        });
        let duration_ms = run_started.elapsed().as_millis() as u64;

        let video = if options.video {
            self.dispatch
                .collect_video(&options.run_id)
                .await
                .unwrap_or_default()
        } else {
            None
        };

        if let Err(e) = publisher.publish(ProgressEvent::RunCompleted {
            meta: EventMeta::now(&options.run_id),
            status,
            duration_ms,
            actions_executed: executed,
            actions_failed: errors.len(),
            actions_skipped: skipped.len(),
        }) {
            return self.engine_fault(&publisher, e.into()).await;
        }

        tracing::info!(
            run_id = options.run_id.as_str(),
            ?status,
            executed,
            failed = errors.len(),
            skipped = skipped.len(),
            duration_ms,
            "run finished"
        );

        Ok(RunResult {
            status,
            duration_ms,
            actions_total: total,
            actions_executed: executed,
            actions_failed: errors.len(),
            errors,
            skipped_actions: skipped,
            video,
            screenshots,
        })
    }

    /// One action inside its failure boundary: resolve, dispatch, and keep
    /// every problem local. Bounded by the per-action timeout and the run's
    /// cancellation token.
    async fn run_action(&self, action: &Action, options: &RunOptions) -> ActionOutcome {
        let work = self.resolve_and_dispatch(action);

        tokio::select! {
            result = tokio::time::timeout(options.timeout, work) => match result {
                Ok(outcome) => outcome,
                Err(_) => ActionOutcome::Failed {
                    error: format!(
                        "action timed out after {}ms",
                        options.timeout.as_millis()
                    ),
                },
            },
            _ = options.abort.cancelled() => ActionOutcome::Aborted,
        }
    }

    async fn resolve_and_dispatch(&self, action: &Action) -> ActionOutcome {
        let mut selector = None;
        let mut target = None;

        if action.wants_resolution() {
            match resolve::resolve(action, &self.page).await {
                Ok(Resolution::Match(matched)) => {
                    if matched.low_confidence {
                        tracing::debug!(
                            action = action.id(),
                            selector = matched.selector.as_str(),
                            "proceeding on low-confidence match"
                        );
                    }
                    selector = Some(matched.selector);
                    target = Some(matched.element);
                }
                Ok(Resolution::Skip { reason }) => return ActionOutcome::Skipped { reason },
                Ok(Resolution::Failure(failure)) => {
                    return ActionOutcome::Failed {
                        error: failure.to_string(),
                    }
                }
                Err(e) => {
                    return ActionOutcome::Failed {
                        error: format!("page query failed: {e}"),
                    }
                }
            }
        }

        match self.dispatch.dispatch(action, target.as_ref()).await {
            Ok(()) => ActionOutcome::Success { selector },
            Err(e) => ActionOutcome::Failed {
                error: format!("dispatch failed: {e:#}"),
            },
        }
    }

    /// Terminal path for faults outside the per-action boundary.
    async fn engine_fault(
        &self,
        publisher: &ProgressPublisher,
        fault: anyhow::Error,
    ) -> anyhow::Result<RunResult> {
        tracing::error!(
            run_id = publisher.run_id(),
            error = %fault,
            "engine fault"
        );
        let _ = publisher.publish(ProgressEvent::RunError {
            meta: EventMeta::now(publisher.run_id()),
            error: format!("{fault:#}"),
        });
        Err(fault)
    }
}

fn validate_options(options: &RunOptions) -> anyhow::Result<()> {
    if options.run_id.is_empty() {
        anyhow::bail!("run_id must not be empty");
    }
    if !(options.speed_multiplier.is_finite() && options.speed_multiplier > 0.0) {
        anyhow::bail!(
            "speed_multiplier must be a positive finite number, got {}",
            options.speed_multiplier
        );
    }
    if options.timeout.is_zero() {
        anyhow::bail!("timeout must be non-zero");
    }
    Ok(())
}

/// Delay before an action, derived from recorded timestamp gaps.
fn inter_action_delay(prev: Option<i64>, current: i64, options: &RunOptions) -> Duration {
    if !options.enable_timing || options.timing_mode == TimingMode::Instant {
        return Duration::ZERO;
    }
    let prev = match prev {
        Some(prev) => prev,
        None => return Duration::ZERO,
    };
    let gap_ms = (current - prev).max(0) as f64 / options.speed_multiplier;
    let mut delay = Duration::from_millis(gap_ms as u64);
    if options.timing_mode == TimingMode::Fast {
        delay = delay.min(FAST_MODE_DELAY_CAP);
    }
    delay.min(options.max_action_delay)
}
