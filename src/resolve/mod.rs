//! Selector resolution against a live page.
//!
//! Each action carries an ordered list of selector candidates; resolution
//! walks them as a ranked strategy chain and short-circuits on the first
//! unambiguous match. When every strategy fails, the recorded content
//! signature drives a structural fallback (see [`signature`]).
//!
//! Resolution is read-only. Expected non-resolution (nothing matched, target
//! legitimately gone) is a value, not an error; only transport faults from
//! the page capability propagate as `Err`.

pub mod signature;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::models::{Action, SelectorStrategy, SelectorWithMetadata};
use self::signature::SignatureMatch;

/// A live element located on the page.
///
/// `handle` is the driver's opaque reference; text and attributes are the
/// descriptive snapshot the driver captured at query time, used for context
/// narrowing and fingerprint scoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementHandle {
    /// Driver-owned element reference (e.g. a backend node id)
    pub handle: String,
    /// Visible text content
    #[serde(default)]
    pub text: String,
    /// Attributes relevant to matching (alt, src, href, class, aria-label...)
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// Read-only page query capability owned by the browser-automation collaborator.
#[async_trait]
pub trait PageQuery: Send + Sync {
    /// All live elements matching one selector candidate.
    async fn query(
        &self,
        candidate: &SelectorWithMetadata,
    ) -> Result<Vec<ElementHandle>, PageQueryError>;

    /// Elements of a given type, optionally scoped to a container selector.
    /// Backs the content-signature structural fallback.
    async fn query_structural(
        &self,
        element_type: &str,
        list_container: Option<&str>,
    ) -> Result<Vec<ElementHandle>, PageQueryError>;
}

/// Faults from the page capability. These are transport-level problems, not
/// "element not found" outcomes.
#[derive(Debug, Error)]
pub enum PageQueryError {
    #[error("page transport failure: {0}")]
    Transport(String),
    #[error("invalid selector `{0}`")]
    InvalidSelector(String),
}

/// Outcome of resolving one action's target.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// A target was located.
    Match(ResolvedElement),
    /// The action is optional and its target is legitimately absent.
    Skip { reason: String },
    /// A required target could not be located.
    Failure(ResolutionFailure),
}

/// A located target plus how it was found.
#[derive(Debug, Clone)]
pub struct ResolvedElement {
    pub element: ElementHandle,
    /// Strategy that matched; `None` for the content-signature fallback
    pub strategy: Option<SelectorStrategy>,
    /// Human-readable description of the winning selector, for progress events
    pub selector: String,
    /// Set when an ambiguous match was settled by index rather than evidence
    pub low_confidence: bool,
}

/// Structured failure carrying everything that was attempted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionFailure {
    pub action_id: String,
    /// Descriptions of each strategy tried, in order
    pub attempted: Vec<String>,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    NoMatch,
    Ambiguous,
}

impl std::fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self.reason {
            FailureReason::NoMatch => "no strategy matched",
            FailureReason::Ambiguous => "match remained ambiguous",
        };
        write!(
            f,
            "{} for action {} (attempted: {})",
            reason,
            self.action_id,
            self.attempted.join(", ")
        )
    }
}

/// Resolve an action's target element against the live page.
///
/// Walks selector candidates by priority (confidence breaking ties),
/// short-circuiting on the first unambiguous match, then falls back to the
/// content signature. Optional actions degrade to [`Resolution::Skip`]
/// instead of failing.
pub async fn resolve(action: &Action, page: &dyn PageQuery) -> Result<Resolution, PageQueryError> {
    let mut candidates = candidate_list(action);
    candidates.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(b.confidence.cmp(&a.confidence))
    });

    let mut attempted = Vec::new();

    for candidate in &candidates {
        let label = describe(candidate);
        let elements = page.query(candidate).await?;
        tracing::debug!(
            action = action.id(),
            selector = label.as_str(),
            matches = elements.len(),
            "strategy probe"
        );

        match elements.len() {
            0 => attempted.push(label),
            1 => {
                return Ok(Resolution::Match(ResolvedElement {
                    element: elements.into_iter().next().unwrap(),
                    strategy: Some(candidate.strategy),
                    selector: label,
                    low_confidence: false,
                }));
            }
            _ => {
                let narrowed = narrow_ambiguous(action, candidate, elements);
                return Ok(Resolution::Match(ResolvedElement {
                    element: narrowed.element,
                    strategy: Some(candidate.strategy),
                    selector: label,
                    low_confidence: narrowed.low_confidence,
                }));
            }
        }
    }

    // Every selector strategy came up empty; try the structural fallback.
    if let Some(sig) = &action.common().content_signature {
        attempted.push("content-signature".to_string());
        let elements = page
            .query_structural(&sig.element_type, sig.list_container.as_deref())
            .await?;

        match signature::best_match(sig, &elements) {
            SignatureMatch::Match { index, score } => {
                tracing::debug!(
                    action = action.id(),
                    score,
                    "content-signature fallback matched"
                );
                return Ok(Resolution::Match(ResolvedElement {
                    element: elements[index].clone(),
                    strategy: None,
                    selector: "content-signature".to_string(),
                    low_confidence: score < sig.content_fingerprint.field_count(),
                }));
            }
            SignatureMatch::Ambiguous { tied, .. } => {
                tracing::debug!(
                    action = action.id(),
                    tied,
                    "content-signature fallback ambiguous"
                );
                return Ok(unresolved(action, attempted, FailureReason::Ambiguous));
            }
            SignatureMatch::NoMatch => {}
        }
    }

    Ok(unresolved(action, attempted, FailureReason::NoMatch))
}

/// Skip for optional actions, structured failure otherwise.
fn unresolved(action: &Action, attempted: Vec<String>, reason: FailureReason) -> Resolution {
    if action.is_skippable() {
        let reason = action
            .common()
            .reason
            .clone()
            .unwrap_or_else(|| "optional action target not found".to_string());
        Resolution::Skip { reason }
    } else {
        Resolution::Failure(ResolutionFailure {
            action_id: action.id().to_string(),
            attempted,
            reason,
        })
    }
}

/// The candidate list: recorded multi-strategy selectors, or the legacy
/// single selector promoted to a priority-1 CSS candidate.
fn candidate_list(action: &Action) -> Vec<SelectorWithMetadata> {
    let c = action.common();
    if !c.selectors.is_empty() {
        return c.selectors.clone();
    }
    c.selector
        .as_deref()
        .map(|s| vec![SelectorWithMetadata::from_legacy_css(s)])
        .unwrap_or_default()
}

struct Narrowed {
    element: ElementHandle,
    low_confidence: bool,
}

/// Settle a multi-match: context scoping hint first, recorded position hints
/// next, lowest index (flagged low-confidence) last.
fn narrow_ambiguous(
    action: &Action,
    candidate: &SelectorWithMetadata,
    elements: Vec<ElementHandle>,
) -> Narrowed {
    let hint = candidate
        .context
        .as_deref()
        .or(action.common().context.as_deref());

    let scoped: Vec<&ElementHandle> = match hint {
        Some(hint) => {
            let scoped: Vec<&ElementHandle> = elements
                .iter()
                .filter(|el| element_mentions(el, hint))
                .collect();
            if scoped.is_empty() {
                elements.iter().collect()
            } else {
                scoped
            }
        }
        None => elements.iter().collect(),
    };

    if scoped.len() == 1 {
        return Narrowed {
            element: scoped[0].clone(),
            low_confidence: false,
        };
    }

    let position = action
        .common()
        .content_signature
        .as_ref()
        .and_then(|sig| {
            sig.visual_hints
                .as_ref()
                .and_then(|h| h.position)
                .or(sig.fallback_position)
        });

    if let Some(pos) = position {
        if pos < scoped.len() {
            return Narrowed {
                element: scoped[pos].clone(),
                low_confidence: false,
            };
        }
    }

    tracing::debug!(
        action = action.id(),
        remaining = scoped.len(),
        "ambiguous match settled by lowest index"
    );
    Narrowed {
        element: scoped[0].clone(),
        low_confidence: true,
    }
}

/// Whether an element's text or attributes mention a scoping hint.
fn element_mentions(element: &ElementHandle, hint: &str) -> bool {
    let hint = hint.to_lowercase();
    element.text.to_lowercase().contains(&hint)
        || element
            .attributes
            .values()
            .any(|v| v.to_lowercase().contains(&hint))
}

fn describe(candidate: &SelectorWithMetadata) -> String {
    format!("{}:{}", candidate.strategy.as_str(), candidate.value)
}
