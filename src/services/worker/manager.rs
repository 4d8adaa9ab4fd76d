//! Monitor Worker Manager
//!
//! Owns the single long-lived monitoring worker process. The manager keeps
//! an ordered registry of tracked tasks that survives worker restarts: on
//! every start the registry is replayed into the fresh worker, so the
//! process is disposable state and the registry is the durable state.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{encode_command_line, parse_event_line, WorkerCommand, WorkerEvent};
use crate::utils::error::{AppError, AppResult};

/// How long a graceful stop waits before escalating to a kill.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Configuration for the worker executable.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Program to invoke
    pub program: String,
    /// Arguments passed to the worker
    pub args: Vec<String>,
    /// Grace period between the stop command and a forced kill
    pub stop_grace: Duration,
}

impl WorkerConfig {
    /// Create a config for a worker program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stop_grace: STOP_GRACE,
        }
    }

    /// Set the worker arguments.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

/// Observable lifecycle state of the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Notifications published by the manager to its subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerNotification {
    /// Fresh status for a tracked task, relayed from the worker
    #[serde(rename_all = "camelCase")]
    StatusUpdate {
        task_key: String,
        payload: serde_json::Value,
    },

    /// Worker reported ready; the tracked-task registry has been replayed
    WorkerStarted,

    /// Worker exited after a requested stop
    WorkerStopped,

    /// Worker exited without being asked to
    UnsolicitedStop { code: Option<i32> },

    /// Worker answered a liveness probe
    Pong,
}

/// One entry in the tracked-task registry.
#[derive(Debug, Clone)]
struct TrackedTask {
    task_key: String,
    spec: serde_json::Value,
}

/// Live handles for a running worker.
struct WorkerHandle {
    command_tx: mpsc::Sender<WorkerCommand>,
    kill: CancellationToken,
    exited: CancellationToken,
}

/// Manager for the persistent monitoring worker.
#[derive(Clone)]
pub struct MonitorWorkerManager {
    config: WorkerConfig,
    state: Arc<RwLock<WorkerState>>,
    registry: Arc<RwLock<Vec<TrackedTask>>>,
    handle: Arc<RwLock<Option<WorkerHandle>>>,
    notify_tx: broadcast::Sender<WorkerNotification>,
}

impl MonitorWorkerManager {
    /// Create a new manager. No process is spawned until `start`.
    pub fn new(config: WorkerConfig) -> Self {
        let (notify_tx, _) = broadcast::channel(256);
        Self {
            config,
            state: Arc::new(RwLock::new(WorkerState::Stopped)),
            registry: Arc::new(RwLock::new(Vec::new())),
            handle: Arc::new(RwLock::new(None)),
            notify_tx,
        }
    }

    /// Subscribe to worker notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerNotification> {
        self.notify_tx.subscribe()
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    /// Keys of all tracked tasks, in registration order.
    pub async fn tracked_task_keys(&self) -> Vec<String> {
        self.registry
            .read()
            .await
            .iter()
            .map(|t| t.task_key.clone())
            .collect()
    }

    /// Start the worker process.
    ///
    /// At most one worker runs at a time; starting while one is active is an
    /// error. Once the worker reports ready, every registry entry is
    /// replayed as an add-task command.
    pub async fn start(&self) -> AppResult<()> {
        {
            let mut state = self.state.write().await;
            if *state != WorkerState::Stopped {
                return Err(AppError::validation(format!(
                    "Worker is already {:?}",
                    *state
                )));
            }
            *state = WorkerState::Starting;
        }

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                *self.state.write().await = WorkerState::Stopped;
                return Err(AppError::command(format!(
                    "Failed to spawn monitor worker: {}",
                    e
                )));
            }
        };

        info!(program = %self.config.program, pid = ?child.id(), "monitor worker spawned");

        let stdin = match child.stdin.take() {
            Some(stdin) => stdin,
            None => {
                let _ = child.start_kill();
                *self.state.write().await = WorkerState::Stopped;
                return Err(AppError::internal("Worker stdin was not captured"));
            }
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (command_tx, mut command_rx) = mpsc::channel::<WorkerCommand>(64);
        let kill = CancellationToken::new();
        let exited = CancellationToken::new();

        // The handle must be in place before the reader task runs: the
        // worker's ready event triggers the registry replay through it.
        *self.handle.write().await = Some(WorkerHandle {
            command_tx: command_tx.clone(),
            kill: kill.clone(),
            exited: exited.clone(),
        });

        // Writer task: serializes commands onto the worker's stdin.
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(command) = command_rx.recv().await {
                let line = match encode_command_line(&command) {
                    Ok(line) => line,
                    Err(e) => {
                        error!("failed to encode worker command: {}", e);
                        continue;
                    }
                };
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    warn!("worker stdin closed: {}", e);
                    break;
                }
            }
        });

        // Reader task: decodes tagged events, logs everything else.
        if let Some(stdout) = stdout {
            let manager = self.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match parse_event_line(&line) {
                        Some(event) => manager.handle_event(event).await,
                        None => {
                            if !line.trim().is_empty() {
                                debug!(line = %line, "worker diagnostic");
                            }
                        }
                    }
                }
            });
        }

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        warn!(line = %line, "worker stderr");
                    }
                }
            });
        }

        // Exit watcher: owns the child, applies kills, classifies the exit.
        {
            let manager = self.clone();
            let kill = kill.clone();
            let exited = exited.clone();
            tokio::spawn(async move {
                let mut kill_requested = false;
                let code = loop {
                    tokio::select! {
                        status = child.wait() => {
                            break status.ok().and_then(|s| s.code());
                        }
                        _ = kill.cancelled(), if !kill_requested => {
                            kill_requested = true;
                            let _ = child.start_kill();
                        }
                    }
                };
                manager.handle_worker_exit(code).await;
                exited.cancel();
            });
        }

        Ok(())
    }

    /// Gracefully stop the worker.
    ///
    /// Sends the stop command, waits out the grace period, then kills the
    /// process if it has not exited. Returns false if no worker was running.
    pub async fn stop(&self) -> AppResult<bool> {
        // Claim the handle and flip to Stopping under one lock, so a natural
        // exit racing this call either wins outright (handle gone, nothing to
        // do) or is observed by the watcher after the transition.
        let (command_tx, kill, exited) = {
            let handle = self.handle.write().await;
            match handle.as_ref() {
                Some(h) => {
                    *self.state.write().await = WorkerState::Stopping;
                    (h.command_tx.clone(), h.kill.clone(), h.exited.clone())
                }
                None => return Ok(false),
            }
        };

        if command_tx.send(WorkerCommand::Stop).await.is_err() {
            // Stdin already closed; escalate straight to a kill.
            kill.cancel();
        }

        if tokio::time::timeout(self.config.stop_grace, exited.cancelled())
            .await
            .is_err()
        {
            warn!("worker ignored stop command; killing");
            kill.cancel();
            exited.cancelled().await;
        }

        // The watcher may have classified the exit before the Stopping
        // transition landed; the machine must still come to rest.
        {
            let mut state = self.state.write().await;
            if *state == WorkerState::Stopping {
                *state = WorkerState::Stopped;
            }
        }
        Ok(true)
    }

    /// Track a task and, when the worker is running, start monitoring it
    /// immediately. Re-adding a key replaces its spec in place.
    pub async fn add_task(&self, task_key: &str, spec: serde_json::Value) -> AppResult<()> {
        {
            let mut registry = self.registry.write().await;
            match registry.iter_mut().find(|t| t.task_key == task_key) {
                Some(existing) => existing.spec = spec.clone(),
                None => registry.push(TrackedTask {
                    task_key: task_key.to_string(),
                    spec: spec.clone(),
                }),
            }
        }
        self.send_if_running(WorkerCommand::AddTask {
            task_key: task_key.to_string(),
            spec,
        })
        .await;
        Ok(())
    }

    /// Stop tracking a task. Returns false if the key was not tracked.
    pub async fn remove_task(&self, task_key: &str) -> AppResult<bool> {
        let removed = {
            let mut registry = self.registry.write().await;
            let before = registry.len();
            registry.retain(|t| t.task_key != task_key);
            registry.len() < before
        };
        if removed {
            self.send_if_running(WorkerCommand::RemoveTask {
                task_key: task_key.to_string(),
            })
            .await;
        }
        Ok(removed)
    }

    /// Ask the worker to re-evaluate one tracked task now.
    pub async fn refresh_task(&self, task_key: &str) -> AppResult<()> {
        if !self
            .registry
            .read()
            .await
            .iter()
            .any(|t| t.task_key == task_key)
        {
            return Err(AppError::not_found(format!(
                "Task is not tracked: {}",
                task_key
            )));
        }
        self.send_command(WorkerCommand::RefreshTask {
            task_key: task_key.to_string(),
        })
        .await
    }

    /// Send a liveness probe. The pong arrives as a notification.
    pub async fn ping(&self) -> AppResult<()> {
        self.send_command(WorkerCommand::Ping).await
    }

    async fn send_command(&self, command: WorkerCommand) -> AppResult<()> {
        let state = *self.state.read().await;
        if state != WorkerState::Running {
            return Err(AppError::validation(format!(
                "Worker is not running (state: {:?})",
                state
            )));
        }
        let tx = {
            let handle = self.handle.read().await;
            handle
                .as_ref()
                .map(|h| h.command_tx.clone())
                .ok_or_else(|| AppError::internal("Worker handle missing while running"))?
        };
        tx.send(command)
            .await
            .map_err(|_| AppError::command("Worker stdin is closed"))
    }

    async fn send_if_running(&self, command: WorkerCommand) {
        if let Err(e) = self.send_command(command).await {
            debug!("command deferred to next worker start: {}", e);
        }
    }

    async fn handle_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Started => {
                *self.state.write().await = WorkerState::Running;
                self.replay_registry().await;
                self.notify(WorkerNotification::WorkerStarted);
            }
            WorkerEvent::StatusUpdate { task_key, payload } => {
                self.notify(WorkerNotification::StatusUpdate { task_key, payload });
            }
            WorkerEvent::Pong => {
                self.notify(WorkerNotification::Pong);
            }
            WorkerEvent::Stopping => {
                debug!("worker acknowledged stop");
            }
            WorkerEvent::Unknown => {
                debug!("ignoring unknown worker event");
            }
        }
    }

    async fn replay_registry(&self) {
        let tasks: Vec<TrackedTask> = self.registry.read().await.clone();
        if tasks.is_empty() {
            return;
        }
        info!(count = tasks.len(), "replaying tracked tasks into worker");
        let tx = {
            let handle = self.handle.read().await;
            match handle.as_ref() {
                Some(h) => h.command_tx.clone(),
                None => return,
            }
        };
        for task in tasks {
            let command = WorkerCommand::AddTask {
                task_key: task.task_key,
                spec: task.spec,
            };
            if tx.send(command).await.is_err() {
                warn!("worker stdin closed during registry replay");
                return;
            }
        }
    }

    async fn handle_worker_exit(&self, code: Option<i32>) {
        let was_stopping = {
            let state = self.state.read().await;
            *state == WorkerState::Stopping
        };
        *self.state.write().await = WorkerState::Stopped;
        *self.handle.write().await = None;

        if was_stopping {
            info!(code = ?code, "monitor worker stopped");
            self.notify(WorkerNotification::WorkerStopped);
        } else {
            warn!(code = ?code, "monitor worker exited unexpectedly");
            self.notify(WorkerNotification::UnsolicitedStop { code });
        }
    }

    fn notify(&self, notification: WorkerNotification) {
        if self.notify_tx.send(notification).is_err() {
            debug!("dropping worker notification: no subscribers");
        }
    }
}
