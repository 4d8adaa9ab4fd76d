//! Generation Lifecycle Manager
//!
//! Owns at most one external generation process per logical task key. Pipes
//! process output through the phase parser, publishes typed events, and
//! resolves kill/exit races with per-spawn tokens: a token minted at spawn
//! time is recorded in a concurrent killed-set when a caller stops the task,
//! and the exit handler consults that set to tell an intentional stop from a
//! natural exit or a superseded process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::generation::{GenerationStartRequest, WorkflowKind};
use crate::utils::error::AppResult;

use super::events::{FailureKind, GenerationEventEmitter, GenerationEventKind};
use super::executor::{RunnerExecutor, RunnerProcess};
use super::phase::PhaseCursor;
use super::phase_parser;

/// Structured marker: one generation sub-type finished, artifact on disk.
pub const TYPE_COMPLETE_TAG: &str = "TYPE_COMPLETE:";
/// Structured marker: one generation sub-type failed inside the runner.
pub const TYPE_FAILED_TAG: &str = "TYPE_FAILED:";

/// Rolling output tail kept for exit classification.
const OUTPUT_TAIL_LIMIT: usize = 10 * 1024;
/// Trailing output excerpt attached to failure events.
const FAILURE_EXCERPT_LEN: usize = 400;

/// Output signatures that mark a rate-limited exit.
const RATE_LIMIT_SIGNATURES: &[&str] = &[
    "rate limit",
    "rate_limit",
    "429",
    "usage limit",
    "quota exceeded",
];

/// One live process under a task key.
#[derive(Debug)]
pub struct ProcessRecord {
    /// Logical task identity
    pub task_key: String,
    /// Token minted for this spawn attempt
    pub spawn_token: Uuid,
    /// Workload kind the process runs
    pub workflow: WorkflowKind,
    /// Working path, needed again at completion to read artifacts
    pub work_path: PathBuf,
    /// Spawn timestamp
    pub started_at: DateTime<Utc>,
    /// OS process id
    pub pid: u32,
    /// Cancellation handle delivering the kill signal to the monitor task
    kill: CancellationToken,
}

/// Manages the lifecycle of generation processes, one per task key.
#[derive(Clone)]
pub struct GenerationLifecycleManager {
    executor: RunnerExecutor,
    emitter: GenerationEventEmitter,
    records: Arc<RwLock<HashMap<String, ProcessRecord>>>,
    /// Spawn tokens of processes killed on purpose. Keyed by token, not task
    /// key: a task key is reused across spawns, a token never is.
    killed_tokens: Arc<DashSet<Uuid>>,
}

impl GenerationLifecycleManager {
    /// Create a new lifecycle manager.
    pub fn new(executor: RunnerExecutor, emitter: GenerationEventEmitter) -> Self {
        Self {
            executor,
            emitter,
            records: Arc::new(RwLock::new(HashMap::new())),
            killed_tokens: Arc::new(DashSet::new()),
        }
    }

    /// Start a generation process for a task key.
    ///
    /// A process already running under the key is killed first, making
    /// restart idempotent. All failures surface as published events; the
    /// returned result only reflects request plumbing, never workload
    /// outcome.
    pub async fn start(&self, request: GenerationStartRequest) -> AppResult<()> {
        if let Err(e) = self.executor.readiness() {
            warn!(task_key = %request.task_key, error = %e, "runtime environment not ready");
            self.emitter.emit(
                &request.task_key,
                GenerationEventKind::Failed {
                    kind: FailureKind::EnvironmentNotReady,
                    reason: e.to_string(),
                },
            );
            return Ok(());
        }

        // Kill any existing process for this key before spawning; marking the
        // token first closes the race against its exit handler.
        {
            let mut records = self.records.write().await;
            if let Some(old) = records.remove(&request.task_key) {
                info!(task_key = %request.task_key, pid = old.pid, "replacing running process");
                self.killed_tokens.insert(old.spawn_token);
                old.kill.cancel();
            }
        }

        let mut process = match self.executor.spawn(&request) {
            Ok(process) => process,
            Err(e) => {
                self.emitter.emit(
                    &request.task_key,
                    GenerationEventKind::Failed {
                        kind: FailureKind::SpawnFailure,
                        reason: e.to_string(),
                    },
                );
                return Ok(());
            }
        };

        let spawn_token = Uuid::new_v4();
        let kill = CancellationToken::new();
        let record = ProcessRecord {
            task_key: request.task_key.clone(),
            spawn_token,
            workflow: request.workflow,
            work_path: request.work_path.clone(),
            started_at: Utc::now(),
            pid: process.pid(),
            kill: kill.clone(),
        };
        info!(task_key = %request.task_key, pid = record.pid, workflow = %record.workflow, "spawned generation process");
        self.records.write().await.insert(request.task_key.clone(), record);

        // Interleaving policy: stdout and stderr feed one channel and are
        // consumed in read-arrival order; within a single stream, line order
        // is preserved.
        let (line_tx, line_rx) = mpsc::channel::<String>(256);
        if let Some(stdout) = process.take_stdout() {
            spawn_line_reader(stdout, line_tx.clone());
        }
        if let Some(stderr) = process.take_stderr() {
            spawn_line_reader(stderr, line_tx.clone());
        }
        drop(line_tx);

        let manager = self.clone();
        tokio::spawn(async move {
            manager
                .monitor(process, line_rx, kill, request, spawn_token)
                .await;
        });

        Ok(())
    }

    /// Stop the process for a task key. Idempotent; returns false when no
    /// process exists. The spawn token is marked killed before the signal is
    /// sent so the exit handler cannot misread the exit as a failure.
    pub async fn stop(&self, task_key: &str) -> bool {
        let record = self.records.write().await.remove(task_key);
        match record {
            Some(record) => {
                info!(task_key, pid = record.pid, "stopping generation process");
                self.killed_tokens.insert(record.spawn_token);
                record.kill.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether a process is currently tracked for the task key.
    pub async fn is_running(&self, task_key: &str) -> bool {
        self.records.read().await.contains_key(task_key)
    }

    /// The workload kind of the running process, if any.
    pub async fn workflow_kind_of(&self, task_key: &str) -> Option<WorkflowKind> {
        self.records.read().await.get(task_key).map(|r| r.workflow)
    }

    /// Task keys with a live process.
    pub async fn active_task_keys(&self) -> Vec<String> {
        self.records.read().await.keys().cloned().collect()
    }

    /// Monitor task: owns the process exclusively, drains the merged line
    /// stream, then classifies the exit.
    async fn monitor(
        &self,
        mut process: RunnerProcess,
        mut line_rx: mpsc::Receiver<String>,
        kill: CancellationToken,
        request: GenerationStartRequest,
        spawn_token: Uuid,
    ) {
        let mut cursor = PhaseCursor::new(request.expected_sub_items);
        let mut tail = OutputTail::new(OUTPUT_TAIL_LIMIT);
        let mut kill_requested = false;

        loop {
            tokio::select! {
                maybe_line = line_rx.recv() => match maybe_line {
                    Some(line) => {
                        self.handle_line(&request, &mut cursor, &mut tail, &line).await;
                    }
                    None => break,
                },
                _ = kill.cancelled(), if !kill_requested => {
                    kill_requested = true;
                    process.start_kill();
                }
            }
        }

        let exit_code = process.wait().await.ok().flatten();
        self.handle_exit(&request, spawn_token, exit_code, &tail).await;
    }

    async fn handle_line(
        &self,
        request: &GenerationStartRequest,
        cursor: &mut PhaseCursor,
        tail: &mut OutputTail,
        line: &str,
    ) {
        tail.push_line(line);
        if line.trim().is_empty() {
            return;
        }

        self.emitter.emit(
            &request.task_key,
            GenerationEventKind::LogLine {
                line: line.to_string(),
            },
        );

        // Sub-type completion markers are recognized independently of the
        // phase parser and side-load the per-subtype artifact.
        if let Some((subtype, count)) = parse_type_complete(line) {
            self.handle_subtype_complete(request, cursor, &subtype, count).await;
            return;
        }
        if let Some(subtype) = parse_type_failed(line) {
            self.emitter.emit(
                &request.task_key,
                GenerationEventKind::SubtypeFailed {
                    subtype,
                    reason: "runner reported sub-type failure".to_string(),
                },
            );
            return;
        }

        if let Some(transition) = phase_parser::parse_line(line, cursor.phase, request.workflow) {
            cursor.apply(&transition);
            self.emitter.emit(
                &request.task_key,
                GenerationEventKind::ProgressUpdate {
                    phase: cursor.phase,
                    percent: cursor.overall(),
                    message: transition.message.clone(),
                    sub_item: cursor.sub_item.clone(),
                },
            );
        }
    }

    async fn handle_subtype_complete(
        &self,
        request: &GenerationStartRequest,
        cursor: &mut PhaseCursor,
        subtype: &str,
        count: u32,
    ) {
        let artifact_path = request
            .work_path
            .join(".ideaforge")
            .join("ideas")
            .join(format!("{}.json", subtype));

        match tokio::fs::read_to_string(&artifact_path).await {
            Ok(content) => match serde_json::from_str::<serde_json::Value>(&content) {
                Ok(payload) => {
                    cursor.mark_sub_item_complete(subtype);
                    self.emitter.emit(
                        &request.task_key,
                        GenerationEventKind::SubtypeComplete {
                            subtype: subtype.to_string(),
                            count,
                            payload,
                        },
                    );
                    self.emitter.emit(
                        &request.task_key,
                        GenerationEventKind::ProgressUpdate {
                            phase: cursor.phase,
                            percent: cursor.overall(),
                            message: None,
                            sub_item: Some(subtype.to_string()),
                        },
                    );
                }
                Err(e) => {
                    self.emitter.emit(
                        &request.task_key,
                        GenerationEventKind::SubtypeFailed {
                            subtype: subtype.to_string(),
                            reason: format!("artifact unreadable: {}", e),
                        },
                    );
                }
            },
            Err(e) => {
                self.emitter.emit(
                    &request.task_key,
                    GenerationEventKind::SubtypeFailed {
                        subtype: subtype.to_string(),
                        reason: format!(
                            "artifact missing at {}: {}",
                            artifact_path.display(),
                            e
                        ),
                    },
                );
            }
        }
    }

    /// Exit classification. The killed-set consultation must come first:
    /// consuming the token is what distinguishes an intentional stop, and a
    /// token is consumed exactly once.
    async fn handle_exit(
        &self,
        request: &GenerationStartRequest,
        spawn_token: Uuid,
        exit_code: Option<i32>,
        tail: &OutputTail,
    ) {
        if self.killed_tokens.remove(&spawn_token).is_some() {
            info!(task_key = %request.task_key, "process exited after explicit stop");
            self.emitter.emit(&request.task_key, GenerationEventKind::Stopped);
            return;
        }

        {
            let mut records = self.records.write().await;
            match records.get(&request.task_key) {
                Some(record) if record.spawn_token == spawn_token => {
                    records.remove(&request.task_key);
                }
                _ => {
                    // A newer spawn owns this key; this exit is stale.
                    debug!(task_key = %request.task_key, "ignoring exit of superseded process");
                    return;
                }
            }
        }

        match exit_code {
            Some(0) => self.load_final_result(request).await,
            code => {
                if let Some(detail) = rate_limit_detail(tail.as_str()) {
                    self.emitter.emit(
                        &request.task_key,
                        GenerationEventKind::RateLimited { detail },
                    );
                } else {
                    let code_desc = code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string());
                    self.emitter.emit(
                        &request.task_key,
                        GenerationEventKind::Failed {
                            kind: FailureKind::GenericExit,
                            reason: format!(
                                "runner exited ({}): {}",
                                code_desc,
                                tail.excerpt(FAILURE_EXCERPT_LEN)
                            ),
                        },
                    );
                }
            }
        }
    }

    /// Zero exit: the promised result artifact must exist and parse. The two
    /// ways it can disappoint are reported as distinct kinds so callers never
    /// conflate them with total failure.
    async fn load_final_result(&self, request: &GenerationStartRequest) {
        let result_path = request.work_path.join(".ideaforge").join("result.json");
        match tokio::fs::read_to_string(&result_path).await {
            Ok(content) => match serde_json::from_str::<serde_json::Value>(&content) {
                Ok(result) => {
                    self.emitter.emit(
                        &request.task_key,
                        GenerationEventKind::Completed { result },
                    );
                }
                Err(e) => {
                    self.emitter.emit(
                        &request.task_key,
                        GenerationEventKind::Failed {
                            kind: FailureKind::ResultUnparsable,
                            reason: format!("result artifact would not parse: {}", e),
                        },
                    );
                }
            },
            Err(e) => {
                self.emitter.emit(
                    &request.task_key,
                    GenerationEventKind::Failed {
                        kind: FailureKind::ResultMissing,
                        reason: format!("result artifact missing at {}: {}", result_path.display(), e),
                    },
                );
            }
        }
    }
}

fn spawn_line_reader<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

/// Decode a `TYPE_COMPLETE:<subtype>:<count>` marker.
fn parse_type_complete(line: &str) -> Option<(String, u32)> {
    let idx = line.find(TYPE_COMPLETE_TAG)?;
    let payload = &line[idx + TYPE_COMPLETE_TAG.len()..];
    let (subtype, count) = payload.trim().split_once(':')?;
    let count: u32 = count.trim().parse().ok()?;
    if subtype.is_empty() {
        return None;
    }
    Some((subtype.to_string(), count))
}

/// Decode a `TYPE_FAILED:<subtype>` marker.
fn parse_type_failed(line: &str) -> Option<String> {
    let idx = line.find(TYPE_FAILED_TAG)?;
    let subtype = line[idx + TYPE_FAILED_TAG.len()..].trim();
    if subtype.is_empty() {
        return None;
    }
    Some(subtype.to_string())
}

/// Scan trailing output for a rate-limit signature.
fn rate_limit_detail(tail: &str) -> Option<String> {
    let lowered = tail.to_lowercase();
    let signature = RATE_LIMIT_SIGNATURES
        .iter()
        .find(|s| lowered.contains(**s))?;
    let line = tail
        .lines()
        .rev()
        .find(|l| l.to_lowercase().contains(*signature))
        .unwrap_or(*signature);
    Some(line.trim().to_string())
}

/// Bounded rolling buffer over the last N bytes of process output.
struct OutputTail {
    buf: String,
    limit: usize,
}

impl OutputTail {
    fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
        }
    }

    fn push_line(&mut self, line: &str) {
        self.buf.push_str(line);
        self.buf.push('\n');
        if self.buf.len() > self.limit {
            let mut cut = self.buf.len() - self.limit;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
        }
    }

    fn as_str(&self) -> &str {
        &self.buf
    }

    fn excerpt(&self, max_len: usize) -> &str {
        if self.buf.len() <= max_len {
            return self.buf.trim_end();
        }
        let mut start = self.buf.len() - max_len;
        while !self.buf.is_char_boundary(start) {
            start += 1;
        }
        self.buf[start..].trim_end()
    }
}
