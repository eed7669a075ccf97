use std::fmt::Write as _;

use serde::Serialize;

use crate::backend::BackendKind;
use crate::process::{ProcessMonitor, TabState, TabStatus};
use crate::session::SessionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SessionSummary {
    pub running_count: usize,
    pub total_count: usize,
    pub session_healthy: bool,
}

/// Existence check plus per-tab process status for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatusRecord {
    pub session_name: String,
    pub backend: BackendKind,
    pub host: String,
    /// The backend answered its session-list query.
    pub backend_running: bool,
    pub session_exists: bool,
    /// Why the session query failed, if it did.
    pub session_error: Option<String>,
    /// In layout order.
    pub tabs: Vec<TabStatus>,
    pub summary: SessionSummary,
}

impl SessionStatusRecord {
    pub fn tab(&self, name: &str) -> Option<&TabStatus> {
        self.tabs.iter().find(|t| t.tab_name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct GlobalSummary {
    pub total_sessions: usize,
    pub healthy_sessions: usize,
    pub unhealthy_sessions: usize,
    pub total_commands: usize,
    pub running_commands: usize,
    pub stopped_commands: usize,
    pub all_sessions_healthy: bool,
    pub all_commands_running: bool,
}

impl GlobalSummary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a SessionStatusRecord>) -> Self {
        let mut global = GlobalSummary::default();
        for record in records {
            let s = record.summary;
            global.total_sessions += 1;
            if s.session_healthy {
                global.healthy_sessions += 1;
            }
            global.total_commands += s.total_count;
            global.running_commands += s.running_count;
        }
        global.unhealthy_sessions = global.total_sessions - global.healthy_sessions;
        global.stopped_commands = global.total_commands - global.running_commands;
        global.all_sessions_healthy = global.healthy_sessions == global.total_sessions;
        global.all_commands_running = global.running_commands == global.total_commands;
        global
    }

    /// One-line digest used between full reports.
    pub fn digest(&self) -> String {
        format!(
            "{}/{} sessions healthy, {}/{} commands running",
            self.healthy_sessions, self.total_sessions, self.running_commands, self.total_commands
        )
    }
}

/// Composes a session's existence with its process monitor.
#[derive(Clone)]
pub struct StatusReporter {
    monitor: ProcessMonitor,
}

impl StatusReporter {
    pub fn new(monitor: ProcessMonitor) -> Self {
        Self { monitor }
    }

    pub fn monitor(&self) -> &ProcessMonitor {
        &self.monitor
    }

    pub async fn report(&self, session: &SessionManager) -> SessionStatusRecord {
        let (backend_running, session_exists, session_error) = match session.exists().await {
            Ok(present) => (true, present, None),
            Err(e) => {
                tracing::warn!(session = session.session_name(), error = %e, "session query failed");
                (false, false, Some(e.to_string()))
            }
        };
        let tabs = self.monitor.check_all(session.layout()).await;
        let summary = SessionSummary {
            running_count: tabs.iter().filter(|t| t.is_running()).count(),
            total_count: tabs.len(),
            session_healthy: session_exists,
        };
        SessionStatusRecord {
            session_name: session.session_name().to_string(),
            backend: session.backend(),
            host: session.host_label(),
            backend_running,
            session_exists,
            session_error,
            tabs,
            summary,
        }
    }
}

fn tab_line(out: &mut String, tab: &TabStatus, name_width: usize) {
    let (marker, label) = match &tab.state {
        TabState::Running => ("[+]", "running"),
        TabState::NotRunning => ("[-]", "stopped"),
        TabState::Error(_) => ("[!]", "error"),
    };
    let _ = write!(
        out,
        "  {marker} {:<name_width$}  {label:<7}  {}",
        tab.tab_name, tab.command
    );
    match &tab.state {
        TabState::Error(reason) => {
            let _ = write!(out, "  ({reason})");
        }
        TabState::Running => {
            let pids: Vec<String> = tab.matches.iter().map(|m| m.pid.to_string()).collect();
            let _ = write!(out, "  (pid {})", pids.join(", "));
        }
        TabState::NotRunning => {}
    }
    out.push('\n');
}

/// Human-readable report. Tabs appear in layout order.
pub fn render(record: &SessionStatusRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Session {} [{} @ {}]",
        record.session_name, record.backend, record.host
    );
    let presence = match (&record.session_error, record.session_exists) {
        (Some(reason), _) => format!("unknown ({reason})"),
        (None, true) => "present".to_string(),
        (None, false) => "absent".to_string(),
    };
    let _ = writeln!(out, "  session:  {presence}");
    let _ = writeln!(
        out,
        "  commands: {}/{} running",
        record.summary.running_count, record.summary.total_count
    );
    let width = record
        .tabs
        .iter()
        .map(|t| t.tab_name.chars().count())
        .max()
        .unwrap_or(0);
    for tab in &record.tabs {
        tab_line(&mut out, tab, width);
    }
    out
}

/// `ci: present, 1/2 running`
pub fn render_digest(record: &SessionStatusRecord) -> String {
    format!(
        "{}: {}, {}/{} running",
        record.session_name,
        if record.session_exists { "present" } else { "absent" },
        record.summary.running_count,
        record.summary.total_count
    )
}
