//! Generation Runner Executor
//!
//! Spawns the external generation processes (scripted backend runner or the
//! agent CLI) with an explicit working directory and a fully materialized
//! environment map. Arguments are passed as a flat list, never through a
//! shell.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::models::generation::GenerationStartRequest;
use crate::models::settings::{ProjectSettings, CREDENTIAL_VARS};
use crate::utils::error::{AppError, AppResult};

/// Overrides the manager always applies, after every other layer, so runner
/// output stays machine-parseable regardless of user configuration.
const FIXED_ENV_OVERRIDES: &[(&str, &str)] = &[
    ("IDEAFORGE_STRUCTURED_EVENTS", "1"),
    ("FORCE_COLOR", "0"),
    ("NO_UPDATE_NOTIFIER", "1"),
];

/// Configuration for the runner executable.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Program to invoke (e.g. "node", or the agent CLI binary)
    pub program: String,
    /// Script passed as the first argument, for script-driven runners
    pub script: Option<PathBuf>,
    /// Directory of the bundled runtime, prepended to PATH when set
    pub bundled_runtime_dir: Option<PathBuf>,
}

impl RunnerConfig {
    /// Create a config for a bare program invocation.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            script: None,
            bundled_runtime_dir: None,
        }
    }

    /// Set the runner script passed as the first argument.
    pub fn with_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.script = Some(script.into());
        self
    }

    /// Set the bundled runtime directory.
    pub fn with_bundled_runtime(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bundled_runtime_dir = Some(dir.into());
        self
    }
}

/// Handle to a running generation process.
pub struct RunnerProcess {
    child: Child,
    pid: u32,
}

impl RunnerProcess {
    /// Get the process ID.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Take the stdout handle (can only be called once).
    pub fn take_stdout(&mut self) -> Option<tokio::process::ChildStdout> {
        self.child.stdout.take()
    }

    /// Take the stderr handle (can only be called once).
    pub fn take_stderr(&mut self) -> Option<tokio::process::ChildStderr> {
        self.child.stderr.take()
    }

    /// Deliver a kill signal without waiting for exit.
    pub fn start_kill(&mut self) {
        let _ = self.child.start_kill();
    }

    /// Wait for the process to exit and return the exit code, if any.
    pub async fn wait(&mut self) -> AppResult<Option<i32>> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| AppError::command(format!("Failed to wait for process: {}", e)))?;
        Ok(status.code())
    }
}

impl Drop for RunnerProcess {
    fn drop(&mut self) {
        // Prevent zombies if the handle is dropped while still running
        let _ = self.child.start_kill();
    }
}

/// Build the fully materialized process environment.
///
/// Layering, in increasing precedence: ambient system environment → bundled
/// runtime → project config file variables → auth-mode credential clearing →
/// active credential profile → active API profile → fixed overrides.
pub fn build_process_env(
    settings: &ProjectSettings,
    bundled_runtime_dir: Option<&Path>,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();

    if let Some(dir) = bundled_runtime_dir {
        let dir_str = dir.to_string_lossy().to_string();
        let path = match env.get("PATH") {
            Some(existing) => format!("{}{}{}", dir_str, path_separator(), existing),
            None => dir_str.clone(),
        };
        env.insert("PATH".to_string(), path);
        env.insert("IDEAFORGE_BUNDLED_RUNTIME".to_string(), dir_str);
    }

    env.extend(settings.env.clone());

    if settings.auth_mode.clears_credential_vars() {
        for var in CREDENTIAL_VARS {
            env.remove(*var);
        }
    }

    env.extend(settings.active_profile_env());
    env.extend(settings.active_api_profile_env());

    for (key, value) in FIXED_ENV_OVERRIDES {
        env.insert((*key).to_string(), (*value).to_string());
    }

    env
}

fn path_separator() -> char {
    if cfg!(windows) {
        ';'
    } else {
        ':'
    }
}

/// Generation runner executor.
#[derive(Debug, Clone)]
pub struct RunnerExecutor {
    config: RunnerConfig,
}

impl RunnerExecutor {
    /// Create a new executor.
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Readiness check for the external runtime environment.
    ///
    /// Verifies the runner script and bundled runtime exist before any spawn
    /// is attempted; failures name the missing prerequisite.
    pub fn readiness(&self) -> AppResult<()> {
        if let Some(ref script) = self.config.script {
            if !script.exists() {
                return Err(AppError::not_found(format!(
                    "Runner script not found: {}",
                    script.display()
                )));
            }
        }
        if let Some(ref dir) = self.config.bundled_runtime_dir {
            if !dir.is_dir() {
                return Err(AppError::not_found(format!(
                    "Bundled runtime directory not found: {}",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Spawn a generation process for a start request.
    ///
    /// The environment is rebuilt from scratch on every spawn so settings
    /// edits take effect on restart.
    pub fn spawn(&self, request: &GenerationStartRequest) -> AppResult<RunnerProcess> {
        let settings = ProjectSettings::load_or_default(&request.work_path);
        let env = build_process_env(&settings, self.config.bundled_runtime_dir.as_deref());

        let mut cmd = Command::new(&self.config.program);
        if let Some(ref script) = self.config.script {
            cmd.arg(script);
        }
        cmd.args(&request.args);
        cmd.current_dir(&request.work_path);
        cmd.env_clear();
        cmd.envs(&env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::command(format!(
                    "Runner executable not found: {}",
                    self.config.program
                ))
            } else {
                AppError::command(format!("Failed to spawn runner: {}", e))
            }
        })?;

        let pid = child.id().unwrap_or(0);
        Ok(RunnerProcess { child, pid })
    }
}
