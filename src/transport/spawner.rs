//! Engine process spawner.
//!
//! Spawns the engine with:
//! - `kill_on_drop(true)` so processes are cleaned up automatically.
//! - `env_clear()` followed by a fully resolved environment, so the child sees
//!   exactly what [`build_environment`] computed.
//! - piped stdin, stdout, and stderr.
//!
//! Environment precedence, lowest first: system environment (or the
//! [`ALLOWED_ENV_VARS`] subset when inheritance is off), user overrides,
//! runtime markers, explicit credential.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, CREDENTIAL_ENV_VAR};
use crate::{AppError, Result};

/// Environment variables inherited when `inherit_env` is off.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "TMPDIR",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Marker telling the engine which client drives it.
pub const ENTRYPOINT_ENV_VAR: &str = "CLAUDE_CODE_ENTRYPOINT";

/// Value of [`ENTRYPOINT_ENV_VAR`].
pub const ENTRYPOINT_VALUE: &str = "sdk-rs";

/// Marker carrying this crate's version.
pub const VERSION_ENV_VAR: &str = "CONDUIT_VERSION";

/// Number of stderr lines kept for diagnostics.
pub const STDERR_TAIL_LINES: usize = 20;

/// Everything needed to launch one engine process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnConfig {
    /// Engine executable.
    pub executable: String,
    /// Engine arguments.
    pub args: Vec<String>,
    /// Working directory; inherited when `None`.
    pub working_dir: Option<PathBuf>,
    /// Fully resolved child environment.
    pub env: BTreeMap<String, String>,
}

impl SpawnConfig {
    /// Resolve a spawn configuration from engine configuration and the
    /// current process environment.
    #[must_use]
    pub fn from_engine_config(config: &EngineConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
            env: build_environment(
                std::env::vars(),
                config.inherit_env,
                &config.env,
                config.credential.as_deref(),
            ),
        }
    }
}

/// Compute the child environment.
///
/// Later layers win: `system` < `overrides` < runtime markers < `credential`.
/// With `inherit` off only [`ALLOWED_ENV_VARS`] survive from `system`.
pub fn build_environment(
    system: impl IntoIterator<Item = (String, String)>,
    inherit: bool,
    overrides: &HashMap<String, String>,
    credential: Option<&str>,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = system
        .into_iter()
        .filter(|(key, _)| inherit || ALLOWED_ENV_VARS.contains(&key.as_str()))
        .collect();

    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

    env.insert(ENTRYPOINT_ENV_VAR.to_owned(), ENTRYPOINT_VALUE.to_owned());
    env.insert(
        VERSION_ENV_VAR.to_owned(),
        env!("CARGO_PKG_VERSION").to_owned(),
    );

    if let Some(credential) = credential.filter(|c| !c.is_empty()) {
        env.insert(CREDENTIAL_ENV_VAR.to_owned(), credential.to_owned());
    }

    env
}

/// Stdio handles of a freshly spawned engine.
#[derive(Debug)]
pub struct EngineProcess {
    /// Child process handle; killed on drop.
    pub child: Child,
    /// Engine stdin.
    pub stdin: ChildStdin,
    /// Engine stdout.
    pub stdout: ChildStdout,
    /// Engine stderr.
    pub stderr: ChildStderr,
}

/// Spawn the engine process.
///
/// # Errors
///
/// - `AppError::Startup("failed to spawn engine: …")`: OS spawn failure.
/// - `AppError::Startup("failed to capture …")`: a pipe was not created.
pub fn spawn_engine(config: &SpawnConfig) -> Result<EngineProcess> {
    let mut cmd = Command::new(&config.executable);
    cmd.args(&config.args);

    cmd.env_clear();
    cmd.envs(&config.env);

    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }

    cmd.stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| {
        AppError::Startup(format!(
            "failed to spawn engine `{}`: {err}",
            config.executable
        ))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Startup("failed to capture engine stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Startup("failed to capture engine stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Startup("failed to capture engine stderr".into()))?;

    info!(
        executable = %config.executable,
        pid = child.id(),
        "engine process spawned"
    );

    Ok(EngineProcess {
        child,
        stdin,
        stdout,
        stderr,
    })
}

/// Shared bounded tail of recent stderr lines.
pub type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// Read engine stderr line by line, logging each line and keeping the last
/// [`STDERR_TAIL_LINES`] in `tail`. Returns at EOF or on a read error.
pub async fn drain_stderr<R>(stderr: R, tail: StderrTail)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(line = %line, "engine stderr");
                let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(err) => {
                debug!(%err, "engine stderr read failed");
                break;
            }
        }
    }
}

/// Describe an exit status as `(code, reason)`.
#[must_use]
pub fn describe_exit(status: ExitStatus) -> (Option<i32>, String) {
    let code = status.code();
    let reason = code.map_or_else(
        || "process terminated by signal".to_owned(),
        |c| format!("process exited with code {c}"),
    );
    (code, reason)
}

/// Wait up to `grace` for the child to exit on its own, killing it otherwise.
///
/// Returns the exit status when one could be collected.
pub async fn reap(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(err)) => {
            warn!(%err, "error waiting for engine process");
            None
        }
        Err(_elapsed) => {
            warn!(?grace, "engine did not exit within grace period, killing");
            child.kill().await.ok();
            child.wait().await.ok()
        }
    }
}

/// Ask the child to terminate (SIGTERM on unix), then [`reap`] it.
pub async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
            if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                debug!(%err, pid, "SIGTERM delivery failed");
            }
        }
    }
    #[cfg(not(unix))]
    {
        child.start_kill().ok();
    }

    reap(child, grace).await
}
