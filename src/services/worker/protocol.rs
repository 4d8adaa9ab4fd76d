//! Monitor Worker Wire Protocol
//!
//! Line-delimited JSON over the worker's stdin/stdout. Commands go down as
//! one JSON object per line; events come back prefixed with a tag so
//! protocol traffic can share stdout with ordinary diagnostics.

use serde::{Deserialize, Serialize};

/// Prefix marking a protocol event on the worker's stdout.
pub const MONITOR_EVENT_TAG: &str = "MONITOR_EVENT:";

/// Commands written to the worker's stdin, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Begin tracking a task
    #[serde(rename_all = "camelCase")]
    AddTask {
        task_key: String,
        spec: serde_json::Value,
    },

    /// Stop tracking a task
    #[serde(rename_all = "camelCase")]
    RemoveTask { task_key: String },

    /// Re-evaluate a tracked task immediately
    #[serde(rename_all = "camelCase")]
    RefreshTask { task_key: String },

    /// Liveness probe
    Ping,

    /// Request graceful shutdown
    Stop,
}

/// Events decoded from tagged worker stdout lines.
///
/// Unknown event types decode as `Unknown` so a newer worker never breaks an
/// older host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Fresh status for a tracked task
    #[serde(rename_all = "camelCase")]
    StatusUpdate {
        task_key: String,
        payload: serde_json::Value,
    },

    /// Worker finished initializing and will accept commands
    Started,

    /// Worker acknowledged a stop command and is shutting down
    Stopping,

    /// Liveness response
    Pong,

    /// Unrecognized event type (forward compatibility)
    #[serde(other)]
    Unknown,
}

/// Decode one stdout line into a protocol event.
///
/// Returns `None` for untagged lines (ordinary diagnostics) and for tagged
/// lines whose JSON does not decode.
pub fn parse_event_line(line: &str) -> Option<WorkerEvent> {
    let rest = line.trim_start().strip_prefix(MONITOR_EVENT_TAG)?;
    serde_json::from_str(rest.trim()).ok()
}

/// Encode one command as a stdin line (newline included).
pub fn encode_command_line(command: &WorkerCommand) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(command)?;
    line.push('\n');
    Ok(line)
}
