//! Recording normalization: canonical ordering, relative timestamps, and
//! repair of obvious sequencing defects.
//!
//! `normalize` is total, deterministic and idempotent. It never rejects a
//! structurally valid recording; anything it cannot confidently repair is
//! reported as a non-fatal [`NormalizationAnomaly`] and left to the replay
//! engine's defensive sort.

use serde::Serialize;
use std::collections::HashSet;

use crate::models::{Action, Recording, SelectorStrategy};

/// Timestamps above this look like absolute epoch milliseconds rather than
/// elapsed offsets.
const EPOCH_MS_THRESHOLD: i64 = 1_000_000_000_000;

/// Maximum timestamp distance for the input-after-submit repair.
const REPAIR_WINDOW_MS: i64 = 5_000;

/// Maximum number of preceding actions examined per input action.
const REPAIR_LOOKBACK: usize = 5;

/// A normalized recording plus the diagnostics produced along the way.
#[derive(Debug, Clone)]
pub struct NormalizedRecording {
    pub recording: Recording,
    /// IDs of input actions relocated by sequence repair
    pub relocated: Vec<String>,
    /// Residual defects left for the engine's defensive sort
    pub anomalies: Vec<NormalizationAnomaly>,
}

/// Non-fatal defect detected after repair. Diagnostic only; never aborts a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum NormalizationAnomaly {
    /// A later-positioned action carries an earlier timestamp than its
    /// predecessor.
    #[serde(rename_all = "camelCase")]
    TimestampInversion {
        index: usize,
        action_id: String,
        timestamp: i64,
        previous_timestamp: i64,
    },
}

/// Normalize a raw recording into canonical, causally-ordered form.
///
/// Ordering is restored from recorder-assigned ID ordinals, timestamps are
/// rebased to zero when the recorder emitted absolute epoch values, and
/// input actions captured after their form's submit are relocated back in
/// front of it. Only `actions` order and timestamps change.
pub fn normalize(mut recording: Recording) -> NormalizedRecording {
    sort_by_id_ordinal(&mut recording.actions);
    rebase_timestamps(&mut recording.actions);
    let relocated = repair_input_after_submit(&mut recording.actions);
    let anomalies = detect_residual_inversions(&recording.actions);

    for anomaly in &anomalies {
        let NormalizationAnomaly::TimestampInversion {
            index, action_id, ..
        } = anomaly;
        tracing::warn!(
            index = *index,
            action_id = action_id.as_str(),
            "residual timestamp inversion after repair"
        );
    }

    NormalizedRecording {
        recording,
        relocated,
        anomalies,
    }
}

/// Stable sort by the numeric suffix of the action ID. Actions without a
/// parseable ordinal keep their relative position ahead of numbered ones.
fn sort_by_id_ordinal(actions: &mut [Action]) {
    actions.sort_by_key(|a| a.id_ordinal());
}

/// Rebase absolute epoch-millisecond timestamps to zero-based offsets.
fn rebase_timestamps(actions: &mut [Action]) {
    let base = match actions.first() {
        Some(first) if first.timestamp() > EPOCH_MS_THRESHOLD => first.timestamp(),
        _ => return,
    };
    for action in actions.iter_mut() {
        let c = action.common_mut();
        c.timestamp -= base;
        if let Some(done) = c.completed_at.as_mut() {
            *done -= base;
        }
    }
    tracing::debug!(base, "rebased absolute timestamps to relative offsets");
}

/// Relocate `input` actions that trail a submit-like action on the same
/// logical form back in front of it. Restarts the scan after each move and
/// runs to a fixed point, bounded by a quadratic pass cap.
fn repair_input_after_submit(actions: &mut Vec<Action>) -> Vec<String> {
    let mut relocated = Vec::new();
    let max_passes = actions.len().saturating_mul(actions.len()) + 1;

    for _ in 0..max_passes {
        match find_trailing_input(actions) {
            Some((input_idx, submit_idx)) => {
                let id = actions[input_idx].id().to_string();
                tracing::debug!(
                    input = id.as_str(),
                    submit = actions[submit_idx].id(),
                    "relocating input recorded after its form submit"
                );
                let input = actions.remove(input_idx);
                actions.insert(submit_idx, input);
                relocated.push(id);
            }
            None => break,
        }
    }

    relocated
}

/// Find the first `input` action positioned after a submit-like action on the
/// same form, looking back over at most [`REPAIR_LOOKBACK`] actions within
/// [`REPAIR_WINDOW_MS`]. Returns `(input_index, submit_index)`.
fn find_trailing_input(actions: &[Action]) -> Option<(usize, usize)> {
    for (i, action) in actions.iter().enumerate() {
        if !matches!(action, Action::Input { .. }) {
            continue;
        }
        let lookback_start = i.saturating_sub(REPAIR_LOOKBACK);
        for j in (lookback_start..i).rev() {
            let candidate = &actions[j];
            if !is_submit_like(candidate) {
                continue;
            }
            if (action.timestamp() - candidate.timestamp()).abs() > REPAIR_WINDOW_MS {
                continue;
            }
            if same_form(action, candidate) {
                return Some((i, j));
            }
        }
    }
    None
}

/// Report any remaining case where a later action has an earlier timestamp.
fn detect_residual_inversions(actions: &[Action]) -> Vec<NormalizationAnomaly> {
    actions
        .windows(2)
        .enumerate()
        .filter(|(_, pair)| pair[1].timestamp() < pair[0].timestamp())
        .map(|(i, pair)| NormalizationAnomaly::TimestampInversion {
            index: i + 1,
            action_id: pair[1].id().to_string(),
            timestamp: pair[1].timestamp(),
            previous_timestamp: pair[0].timestamp(),
        })
        .collect()
}

/// Explicit submit, or a click recognized as a submit control by selector or
/// text heuristics.
fn is_submit_like(action: &Action) -> bool {
    match action {
        Action::Submit { .. } => true,
        Action::Click { text, .. } => {
            let selector_hit = primary_css(action)
                .map(|css| css.contains("button") || css.contains("[type=\"submit\"]"))
                .unwrap_or(false);
            let text_hit = text.as_deref().map_or(false, |t| {
                let t = t.to_lowercase();
                ["submit", "calculate", "send", "save"]
                    .iter()
                    .any(|kw| t.contains(kw))
            });
            selector_hit || text_hit
        }
        _ => false,
    }
}

/// Two actions operate on the same logical form when their selectors carry the
/// same `form#id`/`form.class` token, or share a parent-selector segment when
/// no explicit form token exists.
fn same_form(a: &Action, b: &Action) -> bool {
    let css_a = primary_css(a);
    let css_b = primary_css(b);
    let (css_a, css_b) = match (css_a, css_b) {
        (Some(a), Some(b)) => (a, b),
        _ => return false,
    };

    match (form_token(css_a), form_token(css_b)) {
        (Some(ta), Some(tb)) => ta == tb,
        _ => {
            let pa = parent_segments(css_a);
            let pb = parent_segments(css_b);
            !pa.is_disjoint(&pb)
        }
    }
}

/// Best CSS selector string for heuristic matching: the legacy field first,
/// then the highest-priority css/id candidate.
fn primary_css(action: &Action) -> Option<&str> {
    let c = action.common();
    if let Some(sel) = c.selector.as_deref() {
        return Some(sel);
    }
    c.selectors
        .iter()
        .filter(|s| matches!(s.strategy, SelectorStrategy::Css | SelectorStrategy::Id))
        .min_by_key(|s| s.priority)
        .map(|s| s.value.as_str())
}

/// Extract a `form#id` or `form.class` token from a CSS selector.
fn form_token(css: &str) -> Option<String> {
    let start = css.find("form#").or_else(|| css.find("form."))?;
    let token: String = css[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '#' | '.' | '-' | '_'))
        .collect();
    if token.len() > "form#".len() {
        Some(token)
    } else {
        None
    }
}

/// Interior segments of a `a > b > c` selector chain (the shared-parent part).
fn parent_segments(css: &str) -> HashSet<String> {
    let parts: Vec<&str> = css.split('>').map(str::trim).collect();
    if parts.len() < 2 {
        return HashSet::new();
    }
    parts[..parts.len() - 1]
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
