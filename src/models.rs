//! Data models for captured browser recordings.
//!
//! A [`Recording`] is the unit of replay: page context plus an ordered list of
//! [`Action`]s. Actions are a closed tagged union discriminated by `type` on
//! the wire; every variant carries the same [`ActionCommon`] envelope with
//! selector candidates and optional structural fallback data.

use serde::{Deserialize, Serialize};

/// Viewport dimensions captured at record time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// A captured sequence of user interactions with timing and page context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recording {
    /// Recording ID assigned by the recorder
    pub id: String,
    /// Recorder format version
    pub version: String,
    /// Human-readable test name
    pub test_name: String,
    /// URL the recording starts on
    pub url: String,
    /// Epoch-millisecond capture start
    pub start_time: i64,
    /// Epoch-millisecond capture end (absent for truncated captures)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    pub viewport: Viewport,
    pub user_agent: String,
    /// Captured actions; canonical order only after normalization
    pub actions: Vec<Action>,
}

/// One captured interaction, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Action {
    Click {
        #[serde(flatten)]
        common: ActionCommon,
        /// Mouse button, if the recorder captured it
        #[serde(default, skip_serializing_if = "Option::is_none")]
        button: Option<String>,
        /// Visible text of the clicked element
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Input {
        #[serde(flatten)]
        common: ActionCommon,
        value: String,
    },
    Select {
        #[serde(flatten)]
        common: ActionCommon,
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selected_label: Option<String>,
    },
    Navigation {
        #[serde(flatten)]
        common: ActionCommon,
        /// Destination URL; falls back to `common.url` when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_url: Option<String>,
    },
    Hover {
        #[serde(flatten)]
        common: ActionCommon,
    },
    Scroll {
        #[serde(flatten)]
        common: ActionCommon,
        #[serde(default)]
        x: i64,
        #[serde(default)]
        y: i64,
    },
    Keypress {
        #[serde(flatten)]
        common: ActionCommon,
        key: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        modifiers: Vec<String>,
    },
    Submit {
        #[serde(flatten)]
        common: ActionCommon,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        form_selector: Option<String>,
    },
    Checkpoint {
        #[serde(flatten)]
        common: ActionCommon,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_text: Option<String>,
    },
    ModalLifecycle {
        #[serde(flatten)]
        common: ActionCommon,
        phase: ModalPhase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        modal_selector: Option<String>,
    },
}

/// Modal open/close marker carried by `modal-lifecycle` actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModalPhase {
    Opened,
    Closed,
}

/// Fields shared by every action variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionCommon {
    /// Recorder-assigned ID; numeric suffix is monotonic with true occurrence
    pub id: String,
    /// Milliseconds; relative to recording start after normalization
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    /// Page URL at the time the action was captured
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_selector: Option<String>,
    /// Navigation-intent hint used by the resolver to scope ambiguous matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub is_optional: bool,
    #[serde(default)]
    pub skip_if_not_found: bool,
    /// Recorder's note on why the action may legitimately not resolve
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Legacy single CSS selector from older recorder versions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Ordered multi-strategy selector candidates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selectors: Vec<SelectorWithMetadata>,
    /// Last-resort structural fingerprint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_signature: Option<ContentSignature>,
}

/// One method of locating a DOM element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectorStrategy {
    Id,
    Css,
    Xpath,
    Text,
    TestId,
    Aria,
    Name,
}

impl SelectorStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Css => "css",
            Self::Xpath => "xpath",
            Self::Text => "text",
            Self::TestId => "test-id",
            Self::Aria => "aria",
            Self::Name => "name",
        }
    }
}

/// A selector candidate with resolution metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorWithMetadata {
    pub strategy: SelectorStrategy,
    pub value: String,
    /// Scoping hint, e.g. restrict matches to a named modal or container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// 1 = highest; total order within one action's candidate list
    pub priority: u32,
    /// 0-100, advisory; breaks priority ties
    pub confidence: u32,
}

impl SelectorWithMetadata {
    /// Candidate synthesized from a legacy single `selector` field.
    pub fn from_legacy_css(value: impl Into<String>) -> Self {
        Self {
            strategy: SelectorStrategy::Css,
            value: value.into(),
            context: None,
            priority: 1,
            confidence: 100,
        }
    }
}

/// Structural fallback description used when every selector strategy fails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSignature {
    /// Element tag or role to search for (e.g. "a", "button", "div")
    pub element_type: String,
    /// Optional container selector scoping the structural search
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_container: Option<String>,
    #[serde(default)]
    pub content_fingerprint: ContentFingerprint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual_hints: Option<VisualHints>,
    /// Zero-based index used as the final tie-break among scored candidates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_position: Option<usize>,
}

/// Text fragments fingerprinting the recorded element's content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentFingerprint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subheading: Option<String>,
    /// Image alt text or source fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Link href fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<String>,
}

impl ContentFingerprint {
    /// Number of populated fingerprint fields.
    pub fn field_count(&self) -> usize {
        [
            &self.heading,
            &self.subheading,
            &self.image,
            &self.link,
            &self.price,
            &self.rating,
        ]
        .iter()
        .filter(|f| f.is_some())
        .count()
    }
}

/// Positional hints recorded alongside the content fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualHints {
    /// Zero-based position among sibling matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    /// Text expected near the element
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub near_text: Option<String>,
}

impl Action {
    /// Shared envelope for any variant.
    pub fn common(&self) -> &ActionCommon {
        match self {
            Action::Click { common, .. }
            | Action::Input { common, .. }
            | Action::Select { common, .. }
            | Action::Navigation { common, .. }
            | Action::Hover { common }
            | Action::Scroll { common, .. }
            | Action::Keypress { common, .. }
            | Action::Submit { common, .. }
            | Action::Checkpoint { common, .. }
            | Action::ModalLifecycle { common, .. } => common,
        }
    }

    pub fn common_mut(&mut self) -> &mut ActionCommon {
        match self {
            Action::Click { common, .. }
            | Action::Input { common, .. }
            | Action::Select { common, .. }
            | Action::Navigation { common, .. }
            | Action::Hover { common }
            | Action::Scroll { common, .. }
            | Action::Keypress { common, .. }
            | Action::Submit { common, .. }
            | Action::Checkpoint { common, .. }
            | Action::ModalLifecycle { common, .. } => common,
        }
    }

    pub fn id(&self) -> &str {
        &self.common().id
    }

    pub fn timestamp(&self) -> i64 {
        self.common().timestamp
    }

    /// Wire-format discriminant, matching the serde tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Click { .. } => "click",
            Action::Input { .. } => "input",
            Action::Select { .. } => "select",
            Action::Navigation { .. } => "navigation",
            Action::Hover { .. } => "hover",
            Action::Scroll { .. } => "scroll",
            Action::Keypress { .. } => "keypress",
            Action::Submit { .. } => "submit",
            Action::Checkpoint { .. } => "checkpoint",
            Action::ModalLifecycle { .. } => "modal-lifecycle",
        }
    }

    /// Numeric suffix of the recorder-assigned ID (e.g. `act_017` -> 17).
    ///
    /// Recorder IDs are guaranteed monotonic with true chronological
    /// occurrence even when the serialized array order is not.
    pub fn id_ordinal(&self) -> Option<u64> {
        let id = self.id();
        let suffix_len = id.chars().rev().take_while(|c| c.is_ascii_digit()).count();
        if suffix_len == 0 {
            return None;
        }
        id[id.len() - suffix_len..].parse().ok()
    }

    /// Whether an unresolved target downgrades to a skip instead of a failure.
    pub fn is_skippable(&self) -> bool {
        let c = self.common();
        c.is_optional || c.skip_if_not_found
    }

    /// Whether this variant cannot execute without a resolved element.
    pub fn requires_target(&self) -> bool {
        matches!(
            self,
            Action::Click { .. }
                | Action::Input { .. }
                | Action::Select { .. }
                | Action::Hover { .. }
                | Action::Submit { .. }
        )
    }

    /// Whether the resolver should be consulted for this action.
    ///
    /// Scroll, checkpoint and modal markers resolve opportunistically when
    /// candidates are present; navigation and keypress never target elements.
    pub fn wants_resolution(&self) -> bool {
        if self.requires_target() {
            return true;
        }
        match self {
            Action::Scroll { common, .. }
            | Action::Checkpoint { common, .. }
            | Action::ModalLifecycle { common, .. } => {
                common.selector.is_some() || !common.selectors.is_empty()
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn common(id: &str) -> ActionCommon {
        ActionCommon {
            id: id.to_string(),
            timestamp: 0,
            completed_at: None,
            url: "https://example.com".to_string(),
            frame_id: None,
            frame_url: None,
            frame_selector: None,
            context: None,
            is_optional: false,
            skip_if_not_found: false,
            reason: None,
            selector: None,
            selectors: vec![],
            content_signature: None,
        }
    }

    #[test]
    fn test_action_tag_round_trip() {
        let action = Action::Click {
            common: common("act_001"),
            button: None,
            text: Some("Submit".to_string()),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "click");
        assert_eq!(json["id"], "act_001");

        let back: Action = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), "click");
    }

    #[test]
    fn test_modal_lifecycle_tag() {
        let action = Action::ModalLifecycle {
            common: common("act_002"),
            phase: ModalPhase::Opened,
            modal_selector: Some("#checkout-modal".to_string()),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "modal-lifecycle");
        assert_eq!(json["phase"], "opened");
    }

    #[test]
    fn test_id_ordinal() {
        let mut a = Action::Hover {
            common: common("act_017"),
        };
        assert_eq!(a.id_ordinal(), Some(17));

        a.common_mut().id = "42".to_string();
        assert_eq!(a.id_ordinal(), Some(42));

        a.common_mut().id = "action".to_string();
        assert_eq!(a.id_ordinal(), None);
    }

    #[test]
    fn test_strategy_wire_names() {
        assert_eq!(
            serde_json::to_value(SelectorStrategy::TestId).unwrap(),
            "test-id"
        );
        assert_eq!(
            serde_json::to_value(SelectorStrategy::Xpath).unwrap(),
            "xpath"
        );
    }

    #[test]
    fn test_fingerprint_field_count() {
        let fp = ContentFingerprint {
            heading: Some("Blue Widget".to_string()),
            price: Some("$19.99".to_string()),
            ..Default::default()
        };
        assert_eq!(fp.field_count(), 2);
        assert_eq!(ContentFingerprint::default().field_count(), 0);
    }

    #[test]
    fn test_requires_target() {
        let click = Action::Click {
            common: common("act_001"),
            button: None,
            text: None,
        };
        assert!(click.requires_target());

        let nav = Action::Navigation {
            common: common("act_002"),
            to_url: None,
        };
        assert!(!nav.requires_target());
        assert!(!nav.wants_resolution());

        let mut scroll_common = common("act_003");
        scroll_common.selectors = vec![SelectorWithMetadata::from_legacy_css("#feed")];
        let scroll = Action::Scroll {
            common: scroll_common,
            x: 0,
            y: 400,
        };
        assert!(!scroll.requires_target());
        assert!(scroll.wants_resolution());
    }

    #[test]
    fn test_recording_deserializes_minimal_action_fields() {
        let json = r#"{
            "id": "rec_1",
            "version": "2",
            "testName": "checkout",
            "url": "https://shop.test/cart",
            "startTime": 1700000000000,
            "viewport": {"width": 1280, "height": 800},
            "userAgent": "recorder/2.0",
            "actions": [
                {"type": "input", "id": "act_001", "timestamp": 100,
                 "url": "https://shop.test/cart", "value": "jane@example.com"}
            ]
        }"#;
        let rec: Recording = serde_json::from_str(json).unwrap();
        assert_eq!(rec.actions.len(), 1);
        let c = rec.actions[0].common();
        assert!(!c.is_optional);
        assert!(c.selectors.is_empty());
        assert!(c.content_signature.is_none());
    }
}
