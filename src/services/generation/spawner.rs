//! Parallel CLI Spawner
//!
//! Fans out one short-lived agent CLI process per generation sub-type, each
//! with its own timeout and cancellation, and aggregates the results in
//! input order. A stuck slot only ever costs its own slot: the batch
//! resolves once every slot has resolved.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Output signatures for a rate-limited run.
const RATE_LIMIT_SIGNATURES: &[&str] = &[
    "rate limit",
    "rate_limit",
    "429",
    "usage limit",
    "quota exceeded",
];

/// Output signatures for an authentication failure.
const AUTH_SIGNATURES: &[&str] = &[
    "authentication failed",
    "authentication_error",
    "invalid api key",
    "unauthorized",
    "oauth token has expired",
];

/// Configuration for the spawner itself.
#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    /// Agent CLI program
    pub program: String,
    /// Arguments placed before the instruction payload
    pub base_args: Vec<String>,
    /// Per-slot ceiling; on expiry only that slot's process is killed
    pub timeout: Duration,
    /// Instruction payload bound (characters) passed as one argument
    pub max_instruction_len: usize,
    /// Captured output bound (bytes, trailing)
    pub output_limit: usize,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            base_args: vec!["-p".to_string()],
            timeout: Duration::from_secs(300),
            max_instruction_len: 8_000,
            output_limit: 16 * 1024,
        }
    }
}

/// One generation sub-type to run in a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CliRunConfig {
    /// Sub-type identifier (e.g. "security_hardening")
    pub subtype: String,
    /// Instruction payload for the agent
    pub instructions: String,
    /// Per-run model override
    #[serde(default)]
    pub model: Option<String>,
    /// Per-run item cap
    #[serde(default)]
    pub max_items: Option<u32>,
}

/// Result of one slot in a parallel batch. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CliSpawnResult {
    /// Sub-type this slot ran
    pub subtype: String,
    /// Whether a structured payload was extracted from a clean exit
    pub success: bool,
    /// Decoded structured payload on success
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    /// Error message on failure
    #[serde(default)]
    pub error: Option<String>,
    /// Output matched a rate-limit signature
    #[serde(default)]
    pub rate_limited: bool,
    /// Output matched an authentication-failure signature
    #[serde(default)]
    pub auth_failed: bool,
    /// The slot's own timer expired
    #[serde(default)]
    pub timed_out: bool,
    /// Raw captured output (bounded)
    pub raw_output: String,
}

impl CliSpawnResult {
    fn failure(subtype: &str, error: impl Into<String>, raw_output: String) -> Self {
        Self {
            subtype: subtype.to_string(),
            success: false,
            payload: None,
            error: Some(error.into()),
            rate_limited: false,
            auth_failed: false,
            timed_out: false,
            raw_output,
        }
    }
}

enum SlotExit {
    Exited(Option<i32>),
    Killed,
    TimedOut,
}

/// Spawns N independent agent CLI processes concurrently.
///
/// Explicitly constructed and owned by the caller; batch state lives in an
/// active-slot map keyed by sub-type for targeted kills.
#[derive(Clone)]
pub struct CliSpawner {
    config: SpawnerConfig,
    active: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CliSpawner {
    /// Create a new spawner.
    pub fn new(config: SpawnerConfig) -> Self {
        Self {
            config,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Run one process per config concurrently and collect results in input
    /// order. Resolves only once every slot resolved; a slot timing out or
    /// being killed never blocks the others.
    ///
    /// Spawning a sub-type that is already in flight is unsupported; callers
    /// kill the existing batch first.
    pub async fn spawn_all(&self, configs: Vec<CliRunConfig>) -> Vec<CliSpawnResult> {
        let mut tokens = Vec::with_capacity(configs.len());
        {
            let mut active = self.active.write().await;
            for config in &configs {
                if active.contains_key(&config.subtype) {
                    warn!(subtype = %config.subtype, "sub-type already in flight; kill the batch first");
                }
                let token = CancellationToken::new();
                active.insert(config.subtype.clone(), token.clone());
                tokens.push(token);
            }
        }

        let slots = configs
            .into_iter()
            .zip(tokens)
            .map(|(config, token)| self.run_slot(config, token));
        let results = futures::future::join_all(slots).await;

        {
            let mut active = self.active.write().await;
            for result in &results {
                active.remove(&result.subtype);
            }
        }
        results
    }

    /// Kill every in-flight slot.
    pub async fn kill_all(&self) {
        let active = self.active.read().await;
        for (subtype, token) in active.iter() {
            debug!(subtype = %subtype, "killing slot");
            token.cancel();
        }
    }

    /// Kill a single in-flight slot. Returns false when no such slot exists.
    pub async fn kill_one(&self, subtype: &str) -> bool {
        let active = self.active.read().await;
        match active.get(subtype) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Sub-types currently in flight.
    pub async fn active_subtypes(&self) -> Vec<String> {
        self.active.read().await.keys().cloned().collect()
    }

    async fn run_slot(&self, config: CliRunConfig, token: CancellationToken) -> CliSpawnResult {
        let instructions = truncate_chars(&config.instructions, self.config.max_instruction_len);

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.base_args);
        cmd.arg(instructions);
        if let Some(ref model) = config.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(max_items) = config.max_items {
            cmd.arg("--max-items").arg(max_items.to_string());
        }
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return CliSpawnResult::failure(
                    &config.subtype,
                    format!("failed to spawn {}: {}", self.config.program, e),
                    String::new(),
                );
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let output_limit = self.config.output_limit;
        let capture = tokio::spawn(capture_output(stdout, stderr, output_limit));

        // Normal exit drops the timer future, so a reused slot can never be
        // hit by a stray late kill.
        let exit = tokio::select! {
            status = child.wait() => {
                SlotExit::Exited(status.ok().and_then(|s| s.code()))
            }
            _ = token.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                SlotExit::Killed
            }
            _ = tokio::time::sleep(self.config.timeout) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                SlotExit::TimedOut
            }
        };

        let raw_output = capture.await.unwrap_or_default();
        classify_slot(&config.subtype, exit, raw_output, self.config.timeout)
    }
}

fn classify_slot(
    subtype: &str,
    exit: SlotExit,
    raw_output: String,
    timeout: Duration,
) -> CliSpawnResult {
    match exit {
        SlotExit::Killed => CliSpawnResult::failure(subtype, "cancelled", raw_output),
        SlotExit::TimedOut => CliSpawnResult {
            timed_out: true,
            ..CliSpawnResult::failure(
                subtype,
                format!("timed out after {}s", timeout.as_secs()),
                raw_output,
            )
        },
        SlotExit::Exited(code) => classify_exit(subtype, code, raw_output),
    }
}

/// Exit classification, in priority order: rate-limit signature → auth
/// signature → non-zero exit → payload extraction → success.
fn classify_exit(subtype: &str, code: Option<i32>, raw_output: String) -> CliSpawnResult {
    let lowered = raw_output.to_lowercase();

    if let Some(sig) = RATE_LIMIT_SIGNATURES.iter().find(|s| lowered.contains(**s)) {
        return CliSpawnResult {
            rate_limited: true,
            ..CliSpawnResult::failure(subtype, format!("rate limited ({})", sig), raw_output)
        };
    }
    if let Some(sig) = AUTH_SIGNATURES.iter().find(|s| lowered.contains(**s)) {
        return CliSpawnResult {
            auth_failed: true,
            ..CliSpawnResult::failure(subtype, format!("authentication failed ({})", sig), raw_output)
        };
    }
    match code {
        Some(0) => match extract_json_block(&raw_output) {
            Some(payload) => CliSpawnResult {
                subtype: subtype.to_string(),
                success: true,
                payload: Some(payload),
                error: None,
                rate_limited: false,
                auth_failed: false,
                timed_out: false,
                raw_output,
            },
            None => CliSpawnResult::failure(
                subtype,
                "exited cleanly but output contained no structured payload",
                raw_output,
            ),
        },
        Some(code) => {
            CliSpawnResult::failure(subtype, format!("exited with code {}", code), raw_output)
        }
        None => CliSpawnResult::failure(subtype, "terminated by signal", raw_output),
    }
}

async fn capture_output(
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
    limit: usize,
) -> String {
    let (out, err) = tokio::join!(
        read_stream_tail(stdout, limit),
        read_stream_tail(stderr, limit)
    );

    let mut combined = out;
    if !err.is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&err);
    }
    trim_to_tail(&mut combined, limit);
    combined
}

/// Drain a stream keeping only the trailing `limit` bytes, so a slot that
/// floods its output never holds more than the bound in memory.
async fn read_stream_tail<R>(reader: Option<R>, limit: usize) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut tail = String::new();
    let Some(mut reader) = reader else {
        return tail;
    };
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.push_str(&String::from_utf8_lossy(&chunk[..n]));
                trim_to_tail(&mut tail, limit);
            }
        }
    }
    tail
}

fn trim_to_tail(buf: &mut String, limit: usize) {
    if buf.len() > limit {
        let mut cut = buf.len() - limit;
        while !buf.is_char_boundary(cut) {
            cut += 1;
        }
        buf.drain(..cut);
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Locate and decode the outermost balanced JSON block in free-form text.
///
/// Agent output wraps the payload in prose; candidate blocks are tried in
/// order of their opening bracket and the first that parses wins.
pub fn extract_json_block(text: &str) -> Option<serde_json::Value> {
    for (start, c) in text.char_indices() {
        if c != '{' && c != '[' {
            continue;
        }
        if let Some(end) = find_balanced_end(text, start) {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text[start..end]) {
                return Some(value);
            }
        }
    }
    None
}

fn find_balanced_end(text: &str, start: usize) -> Option<usize> {
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + i + c.len_utf8());
                }
                if depth < 0 {
                    return None;
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Payload extraction
    // ========================================================================

    #[test]
    fn test_extract_plain_object() {
        let value = extract_json_block(r#"{"ideas": [1, 2]}"#).unwrap();
        assert_eq!(value["ideas"][1], 2);
    }

    #[test]
    fn test_extract_with_surrounding_prose() {
        let text = "Here are the results you asked for:\n{\"count\": 3}\nLet me know!";
        let value = extract_json_block(text).unwrap();
        assert_eq!(value["count"], 3);
    }

    #[test]
    fn test_extract_nested_and_strings_with_braces() {
        let text = r#"note {"a": {"b": "contains } and {"}, "c": [1, {"d": 2}]} trailing"#;
        let value = extract_json_block(text).unwrap();
        assert_eq!(value["c"][1]["d"], 2);
    }

    #[test]
    fn test_extract_skips_non_json_braces() {
        let text = "set {x} then output [\"ok\", \"done\"]";
        let value = extract_json_block(text).unwrap();
        assert_eq!(value[0], "ok");
    }

    #[test]
    fn test_extract_none_without_payload() {
        assert!(extract_json_block("no structured output here").is_none());
        assert!(extract_json_block("{unterminated").is_none());
    }

    #[test]
    fn test_extract_escaped_quotes() {
        let text = r#"{"msg": "she said \"hi\" {loudly}"}"#;
        let value = extract_json_block(text).unwrap();
        assert!(value["msg"].as_str().unwrap().contains("loudly"));
    }

    // ========================================================================
    // Classification
    // ========================================================================

    fn exited(code: i32) -> SlotExit {
        SlotExit::Exited(Some(code))
    }

    #[test]
    fn test_classify_rate_limit_beats_exit_code() {
        let result = classify_slot(
            "ux",
            exited(1),
            "Error: usage limit reached".to_string(),
            Duration::from_secs(300),
        );
        assert!(result.rate_limited);
        assert!(!result.success);
        assert!(!result.auth_failed);
    }

    #[test]
    fn test_classify_auth_failure() {
        let result = classify_slot(
            "ux",
            exited(1),
            "fatal: invalid API key provided".to_string(),
            Duration::from_secs(300),
        );
        assert!(result.auth_failed);
        assert!(!result.rate_limited);
    }

    #[test]
    fn test_classify_nonzero_exit() {
        let result = classify_slot(
            "ux",
            exited(2),
            "something broke".to_string(),
            Duration::from_secs(300),
        );
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("code 2"));
    }

    #[test]
    fn test_classify_success_with_payload() {
        let result = classify_slot(
            "ux",
            exited(0),
            "done! {\"items\": []}".to_string(),
            Duration::from_secs(300),
        );
        assert!(result.success);
        assert!(result.payload.is_some());
    }

    #[test]
    fn test_classify_clean_exit_without_payload() {
        let result = classify_slot(
            "ux",
            exited(0),
            "all finished, nothing structured".to_string(),
            Duration::from_secs(300),
        );
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("no structured payload"));
    }

    #[test]
    fn test_classify_timeout() {
        let result = classify_slot(
            "ux",
            SlotExit::TimedOut,
            String::new(),
            Duration::from_secs(300),
        );
        assert!(result.timed_out);
        assert!(result.error.as_deref().unwrap().contains("timed out"));
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("ab", 10), "ab");
        // Multi-byte safety
        assert_eq!(truncate_chars("héllo", 2), "hé");
    }

    #[test]
    fn test_trim_to_tail_bounds_incrementally() {
        let mut tail = String::new();
        for i in 0..1000 {
            tail.push_str(&format!("chunk {}\n", i));
            trim_to_tail(&mut tail, 64);
            assert!(tail.len() <= 64);
        }
        assert!(tail.contains("chunk 999"));
        assert!(!tail.contains("chunk 0\n"));
    }

    #[test]
    fn test_trim_to_tail_respects_char_boundaries() {
        let mut tail = String::from("héllo wörld ünïcode ");
        trim_to_tail(&mut tail, 7);
        assert!(tail.len() <= 7);
        let _ = tail.chars().count();
    }

    #[test]
    fn test_spawner_config_defaults() {
        let config = SpawnerConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert_eq!(config.program, "claude");
    }
}
