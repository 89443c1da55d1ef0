//! Engine configuration parsing, validation, and credential loading.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Environment variable the credential override is injected as.
pub const CREDENTIAL_ENV_VAR: &str = "ANTHROPIC_API_KEY";

/// Smallest frame limit accepted by validation.
const MIN_LINE_BYTES: usize = 1024;

/// Timeout values for queries, control requests, and shutdown.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Per-request window for the terminal result; 0 means no timeout.
    #[serde(default = "default_request_seconds")]
    pub request_seconds: u64,
    /// Window for a control-protocol reply.
    #[serde(default = "default_control_seconds")]
    pub control_seconds: u64,
    /// Grace period between SIGTERM and a hard kill on stop.
    #[serde(default = "default_stop_grace_millis")]
    pub stop_grace_millis: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_seconds: default_request_seconds(),
            control_seconds: default_control_seconds(),
            stop_grace_millis: default_stop_grace_millis(),
        }
    }
}

impl TimeoutConfig {
    /// Request timeout as a [`Duration`], `None` when disabled.
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_seconds > 0).then(|| Duration::from_secs(self.request_seconds))
    }

    /// Control reply timeout.
    #[must_use]
    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_seconds)
    }

    /// Stop grace period.
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_millis)
    }
}

fn default_request_seconds() -> u64 {
    600
}

fn default_control_seconds() -> u64 {
    30
}

fn default_stop_grace_millis() -> u64 {
    2000
}

/// Request registry behavior.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Maximum number of requests waiting for admission.
    #[serde(default = "default_max_queued_requests")]
    pub max_queued_requests: usize,
    /// Keep intermediate messages for blocking queries.
    #[serde(default)]
    pub verbose: bool,
    /// Restart a disconnected engine on the next submission.
    #[serde(default = "default_true")]
    pub reconnect: bool,
    /// Whether the engine speaks the control protocol.
    #[serde(default = "default_true")]
    pub control_protocol: bool,
    /// Largest accepted inbound line.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_queued_requests: default_max_queued_requests(),
            verbose: false,
            reconnect: true,
            control_protocol: true,
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

fn default_max_queued_requests() -> usize {
    64
}

fn default_true() -> bool {
    true
}

fn default_max_line_bytes() -> usize {
    8 * 1024 * 1024
}

/// Tool-use audit settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AuditConfig {
    /// Correlate tool invocations with their results.
    #[serde(default)]
    pub enabled: bool,
    /// Directory for daily JSONL audit files.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Capacity of the audit dispatch queue.
    #[serde(default = "default_audit_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: None,
            queue_capacity: default_audit_queue_capacity(),
        }
    }
}

fn default_audit_queue_capacity() -> usize {
    256
}

fn default_executable() -> String {
    "claude".into()
}

fn default_args() -> Vec<String> {
    [
        "--output-format",
        "stream-json",
        "--input-format",
        "stream-json",
        "--verbose",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

/// Engine configuration parsed from `conduit.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Engine executable (name resolved via `PATH`, or a path).
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Arguments passed to the engine.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Working directory of the engine process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// User environment overrides.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Inherit the full system environment instead of the allowlist.
    #[serde(default = "default_true")]
    pub inherit_env: bool,
    /// Explicit credential, injected as [`CREDENTIAL_ENV_VAR`].
    #[serde(default)]
    pub credential: Option<String>,
    /// Timeout configuration.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Registry configuration.
    #[serde(default)]
    pub session: SessionConfig,
    /// Audit configuration.
    #[serde(default)]
    pub audit: AuditConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            args: default_args(),
            working_dir: None,
            env: HashMap::new(),
            inherit_env: true,
            credential: None,
            timeouts: TimeoutConfig::default(),
            session: SessionConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Fill an empty credential from [`CREDENTIAL_ENV_VAR`].
    ///
    /// A missing variable is not an error: the engine may carry its own login.
    pub fn load_credential_from_env(&mut self) {
        if self.credential.as_deref().is_some_and(|c| !c.is_empty()) {
            return;
        }
        match env::var(CREDENTIAL_ENV_VAR) {
            Ok(value) if !value.is_empty() => self.credential = Some(value),
            Ok(_) => warn!(key = CREDENTIAL_ENV_VAR, "credential env var is empty"),
            Err(_) => self.credential = None,
        }
    }

    /// Check invariants and canonicalize the working directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the offending field.
    pub fn validate(&mut self) -> Result<()> {
        if self.executable.trim().is_empty() {
            return Err(AppError::Config("executable must not be empty".into()));
        }

        if self.session.max_queued_requests == 0 {
            return Err(AppError::Config(
                "session.max_queued_requests must be greater than zero".into(),
            ));
        }

        if self.session.max_line_bytes < MIN_LINE_BYTES {
            return Err(AppError::Config(format!(
                "session.max_line_bytes must be at least {MIN_LINE_BYTES}"
            )));
        }

        if self.timeouts.control_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.control_seconds must be greater than zero".into(),
            ));
        }

        if self.audit.queue_capacity == 0 {
            return Err(AppError::Config(
                "audit.queue_capacity must be greater than zero".into(),
            ));
        }

        if let Some(dir) = &self.working_dir {
            let canonical = dir
                .canonicalize()
                .map_err(|err| AppError::Config(format!("working_dir invalid: {err}")))?;
            self.working_dir = Some(canonical);
        }

        Ok(())
    }
}
