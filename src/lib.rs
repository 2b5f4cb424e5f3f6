//! Replay core for captured browser interaction recordings.
//!
//! The pipeline: a raw recording JSON document is [`normalize`]d into a
//! canonical, causally-ordered action sequence, then the [`ReplayEngine`]
//! executes it action by action, resolving each target through the
//! prioritized selector chain in [`resolve`], performing it through the
//! injected [`ActionDispatch`] capability, and streaming lifecycle events
//! over the per-run [`progress`] channel.
//!
//! The crate owns no browser: page queries and input dispatch are trait
//! seams implemented by the browser-automation collaborator, which keeps the
//! core a pure in-memory transform and execution engine.

pub mod engine;
pub mod models;
pub mod normalize;
pub mod progress;
pub mod resolve;

pub use engine::{
    ActionDispatch, ActionError, ReplayEngine, RunOptions, RunResult, RunStatus, ScreenshotMode,
    TimingMode,
};
pub use models::{Action, Recording, SelectorStrategy, SelectorWithMetadata};
pub use normalize::{normalize, NormalizationAnomaly, NormalizedRecording};
pub use progress::{ProgressBus, ProgressEvent, ProgressSubscription};
pub use resolve::{ElementHandle, PageQuery, Resolution};
