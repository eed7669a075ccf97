use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::backend::{BackendKind, MultiplexerBackend};
use crate::config::MuxConfig;
use crate::error::{MuxError, Result};
use crate::exec::{CommandOutput, HostExecutor};
use crate::layout::{LayoutSpec, TabSpec};

/// Exit status shells use for "command not found".
const SHELL_NOT_FOUND: i32 = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Absent,
    Launching,
    /// Seen in the backend's session list on the last query.
    Present,
    /// Present, but not every tab's command was running on the last check.
    Degraded,
}

impl SessionState {
    /// Presence combined with how many of `total_tabs` commands are running.
    pub fn from_health(present: bool, running_tabs: usize, total_tabs: usize) -> Self {
        match present {
            false => SessionState::Absent,
            true if running_tabs >= total_tabs => SessionState::Present,
            true => SessionState::Degraded,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, SessionState::Present | SessionState::Degraded)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Absent => write!(f, "absent"),
            SessionState::Launching => write!(f, "launching"),
            SessionState::Present => write!(f, "present"),
            SessionState::Degraded => write!(f, "degraded"),
        }
    }
}

/// Result of a start or kill. Failures are reported here, not raised.
#[derive(Debug)]
pub struct Outcome {
    pub session_name: String,
    pub success: bool,
    pub message: String,
    pub error: Option<MuxError>,
}

pub type LaunchOutcome = Outcome;
pub type KillOutcome = Outcome;

impl Outcome {
    fn ok(session_name: &str, message: impl Into<String>) -> Self {
        Self {
            session_name: session_name.to_string(),
            success: true,
            message: message.into(),
            error: None,
        }
    }

    fn failed(session_name: &str, error: MuxError) -> Self {
        Self {
            session_name: session_name.to_string(),
            success: false,
            message: error.to_string(),
            error: Some(error),
        }
    }
}

/// Poll and command budgets for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    pub poll_timeout: Duration,
    pub poll_interval: Duration,
    pub command_timeout: Duration,
}

impl From<&MuxConfig> for SessionTiming {
    fn from(config: &MuxConfig) -> Self {
        Self {
            poll_timeout: config.poll_timeout,
            poll_interval: config.poll_interval,
            command_timeout: config.command_timeout,
        }
    }
}

/// Lifecycle of one named session against one backend on one host.
pub struct SessionManager {
    layout: LayoutSpec,
    artifact_path: PathBuf,
    backend: &'static dyn MultiplexerBackend,
    executor: Arc<dyn HostExecutor>,
    timing: SessionTiming,
    state: SessionState,
}

impl SessionManager {
    /// `artifact_path` is where the artifact lives on the executor's host.
    pub fn new(
        layout: LayoutSpec,
        artifact_path: impl Into<PathBuf>,
        backend: BackendKind,
        executor: Arc<dyn HostExecutor>,
        timing: SessionTiming,
    ) -> Self {
        Self {
            layout,
            artifact_path: artifact_path.into(),
            backend: backend.backend(),
            executor,
            timing,
            state: SessionState::Absent,
        }
    }

    pub fn session_name(&self) -> &str {
        self.layout.session_name()
    }

    pub fn layout(&self) -> &LayoutSpec {
        &self.layout
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    pub fn set_artifact_path(&mut self, path: impl Into<PathBuf>) {
        self.artifact_path = path.into();
    }

    /// Replace the tab map, keeping the session name.
    pub fn set_tabs(&mut self, tabs: Vec<TabSpec>) {
        self.layout = LayoutSpec::with_tabs(self.layout.session_name(), tabs);
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn backend(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn host_label(&self) -> String {
        self.executor.host_label()
    }

    /// Recreate the session from its artifact and wait for it to appear.
    ///
    /// The backend command is spawned detached; only the existence poll blocks,
    /// bounded by the poll timeout.
    pub async fn start(&mut self) -> LaunchOutcome {
        let name = self.session_name().to_string();
        self.state = SessionState::Launching;

        let delete = self.backend.delete_command(&self.layout);
        if let Err(e) = self.executor.run(&delete, self.timing.command_timeout).await {
            tracing::debug!(session = %name, error = %e, "pre-launch delete failed, continuing");
        }

        let executable = self.backend.executable();
        if !self.executor.has_executable(executable).await {
            self.state = SessionState::Absent;
            tracing::warn!(session = %name, executable, host = %self.host_label(), "backend executable not found");
            return Outcome::failed(&name, MuxError::ExecutableNotFound(executable.to_string()));
        }

        let start = self.backend.start_command(&name, &self.artifact_path);
        tracing::info!(session = %name, backend = %self.backend.kind(), host = %self.host_label(), "launching session");
        if let Err(e) = self.executor.spawn_detached(&start).await {
            self.state = SessionState::Absent;
            return Outcome::failed(&name, e);
        }

        match self.wait_for_presence().await {
            Ok(true) => {
                self.state = SessionState::Present;
                tracing::info!(session = %name, "session is up");
                Outcome::ok(&name, format!("Session '{name}' started"))
            }
            Ok(false) => {
                self.state = SessionState::Absent;
                tracing::warn!(session = %name, "session did not appear before the poll timeout");
                Outcome::failed(
                    &name,
                    MuxError::Timeout {
                        command: format!("waiting for session '{name}'"),
                        after: self.timing.poll_timeout,
                    },
                )
            }
            Err(e) => {
                self.state = SessionState::Absent;
                Outcome::failed(&name, e)
            }
        }
    }

    /// Poll the session list until the session shows up or the budget runs out.
    /// Transient query failures are retried; a missing backend binary is not.
    async fn wait_for_presence(&self) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + self.timing.poll_timeout;
        loop {
            match self.exists().await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e @ MuxError::ExecutableNotFound(_)) => return Err(e),
                Err(e) => tracing::debug!(session = self.session_name(), error = %e, "poll failed"),
            }
            if tokio::time::Instant::now() + self.timing.poll_interval > deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.timing.poll_interval).await;
        }
    }

    pub async fn kill(&mut self) -> KillOutcome {
        let name = self.session_name().to_string();
        let delete = self.backend.delete_command(&self.layout);
        match self.executor.run(&delete, self.timing.command_timeout).await {
            Ok(output) if output.success() => {
                self.state = SessionState::Absent;
                tracing::info!(session = %name, "session killed");
                Outcome::ok(&name, format!("Session '{name}' killed"))
            }
            Ok(output) => Outcome::failed(&name, self.command_error(&delete, output)),
            Err(e) => Outcome::failed(&name, e),
        }
    }

    /// Active session identifiers on the host.
    pub async fn list_all(&self) -> Result<Vec<String>> {
        let command = self.backend.list_sessions_command();
        let output = self.executor.run(&command, self.timing.command_timeout).await?;
        match self.backend.parse_session_list(&output) {
            Some(sessions) => Ok(sessions),
            None => Err(self.command_error(&command, output)),
        }
    }

    pub async fn exists(&self) -> Result<bool> {
        let listed = self.list_all().await?;
        Ok(self.backend.session_present(&self.layout, &listed))
    }

    /// Query the backend and update the tracked state.
    pub async fn refresh(&mut self) -> Result<bool> {
        let present = self.exists().await?;
        self.state = if present {
            SessionState::Present
        } else {
            SessionState::Absent
        };
        Ok(present)
    }

    /// [`refresh`](Self::refresh), then grade a present session by how many
    /// of its tabs have a running command.
    pub async fn refresh_health(&mut self, running_tabs: usize) -> Result<SessionState> {
        let present = self.exists().await?;
        self.state = SessionState::from_health(present, running_tabs, self.layout.len());
        Ok(self.state)
    }

    /// What an operator types to attach. Runs nothing.
    pub fn attach_command(&self) -> String {
        self.executor
            .interactive_command(&self.backend.attach_command(self.session_name()))
    }

    fn command_error(&self, command: &str, output: CommandOutput) -> MuxError {
        if output.exit_code == SHELL_NOT_FOUND {
            return MuxError::ExecutableNotFound(self.backend.executable().to_string());
        }
        MuxError::CommandFailed {
            command: command.to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        }
    }
}
