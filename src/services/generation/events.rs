//! Generation Event Emission
//!
//! Typed events published by the lifecycle manager to the rest of the
//! application. The emitter wraps a broadcast channel and is handed to the
//! managers explicitly (no ambient singleton), so tests and callers own the
//! subscription lifecycle.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use super::phase::ExecutionPhase;

/// Distinct, non-generic failure kinds surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Readiness precondition failed; no process was spawned
    EnvironmentNotReady,
    /// The OS could not start the process (e.g. executable missing)
    SpawnFailure,
    /// Non-zero exit with no recognized signature
    GenericExit,
    /// Process succeeded but the promised result artifact is missing
    ResultMissing,
    /// Process succeeded but the result artifact would not parse
    ResultUnparsable,
}

/// One published generation event, tagged with its task key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationEvent {
    /// Logical task identity this event belongs to
    pub task_key: String,
    /// The event payload
    #[serde(flatten)]
    pub kind: GenerationEventKind,
}

/// Event payloads published over the generation channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEventKind {
    /// One raw output line from the process
    LogLine { line: String },

    /// Phase/progress cursor moved
    #[serde(rename_all = "camelCase")]
    ProgressUpdate {
        phase: ExecutionPhase,
        percent: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sub_item: Option<String>,
    },

    /// One generation sub-type finished and its artifact loaded
    SubtypeComplete {
        subtype: String,
        count: u32,
        payload: serde_json::Value,
    },

    /// One generation sub-type failed (marker seen or artifact unreadable)
    SubtypeFailed { subtype: String, reason: String },

    /// The whole task completed and the result artifact loaded
    Completed { result: serde_json::Value },

    /// The task failed; `kind` distinguishes the failure taxonomy
    Failed { kind: FailureKind, reason: String },

    /// The task was explicitly stopped by the caller
    Stopped,

    /// Exit output matched a rate-limit signature
    RateLimited { detail: String },
}

/// Broadcast emitter for generation events.
///
/// Emission never fails the caller: an event with no subscribers is dropped
/// with a debug log, mirroring fire-and-forget UI emission.
#[derive(Clone)]
pub struct GenerationEventEmitter {
    tx: broadcast::Sender<GenerationEvent>,
}

impl GenerationEventEmitter {
    /// Create an emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.tx.subscribe()
    }

    /// Emit one event for a task.
    pub fn emit(&self, task_key: &str, kind: GenerationEventKind) {
        let event = GenerationEvent {
            task_key: task_key.to_string(),
            kind,
        };
        if self.tx.send(event).is_err() {
            debug!(task_key, "dropping generation event: no subscribers");
        }
    }
}

impl Default for GenerationEventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
