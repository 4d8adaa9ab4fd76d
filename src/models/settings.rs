//! Project Settings
//!
//! Per-project configuration consumed when materializing the environment for
//! spawned generation processes. Loaded from `.ideaforge/settings.json` in
//! the project root, with serde defaults for every field so a partial file
//! is always usable.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::utils::error::{AppError, AppResult};

/// Credential variables that must be stripped when an alternate auth mode is
/// active, so a stale API key never shadows subscription credentials.
pub const CREDENTIAL_VARS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "ANTHROPIC_AUTH_TOKEN",
    "OPENAI_API_KEY",
];

/// How the spawned agent authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Direct API key from the environment or active profile
    #[default]
    ApiKey,
    /// Subscription (OAuth) login managed by the agent CLI itself
    Subscription,
}

impl AuthMode {
    /// Whether ambient credential variables must be cleared before layering
    /// profile variables on top.
    pub fn clears_credential_vars(&self) -> bool {
        matches!(self, AuthMode::Subscription)
    }
}

/// A named set of credential variables (one provider account).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CredentialProfile {
    /// Environment variables contributed by this profile
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// A named API endpoint/model selection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiProfile {
    /// Override base URL for the provider API
    #[serde(default)]
    pub base_url: Option<String>,
    /// Model identifier passed through to the runner
    #[serde(default)]
    pub model: Option<String>,
    /// Additional environment variables for this endpoint
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ApiProfile {
    /// Materialize this profile as environment variables.
    pub fn to_env(&self) -> HashMap<String, String> {
        let mut env = self.env.clone();
        if let Some(ref base_url) = self.base_url {
            env.insert("ANTHROPIC_BASE_URL".to_string(), base_url.clone());
        }
        if let Some(ref model) = self.model {
            env.insert("IDEAFORGE_MODEL".to_string(), model.clone());
        }
        env
    }
}

/// Project-level settings file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSettings {
    /// Free-form environment variables from the project config file
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Active authentication mode
    #[serde(default)]
    pub auth_mode: AuthMode,
    /// Named credential profiles
    #[serde(default)]
    pub profiles: HashMap<String, CredentialProfile>,
    /// Which credential profile is active (if any)
    #[serde(default)]
    pub active_profile: Option<String>,
    /// Named API endpoint profiles
    #[serde(default)]
    pub api_profiles: HashMap<String, ApiProfile>,
    /// Which API profile is active (if any)
    #[serde(default)]
    pub active_api_profile: Option<String>,
}

impl ProjectSettings {
    /// Load settings from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(AppError::Io)?;
        let settings = serde_json::from_str(&content)?;
        Ok(settings)
    }

    /// Load `.ideaforge/settings.json` from the project root, or defaults.
    pub fn load_or_default(project_root: impl AsRef<Path>) -> Self {
        let path = project_root.as_ref().join(".ideaforge").join("settings.json");
        if path.exists() {
            Self::from_file(&path).unwrap_or_default()
        } else {
            Self::default()
        }
    }

    /// Environment variables from the active credential profile, if any.
    pub fn active_profile_env(&self) -> HashMap<String, String> {
        self.active_profile
            .as_deref()
            .and_then(|name| self.profiles.get(name))
            .map(|p| p.env.clone())
            .unwrap_or_default()
    }

    /// Environment variables from the active API profile, if any.
    pub fn active_api_profile_env(&self) -> HashMap<String, String> {
        self.active_api_profile
            .as_deref()
            .and_then(|name| self.api_profiles.get(name))
            .map(|p| p.to_env())
            .unwrap_or_default()
    }
}
