use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::exec::CommandOutput;
use crate::layout::LayoutSpec;

mod windows_terminal;
mod zellij;

pub use windows_terminal::WindowsTerminalBackend;
pub use zellij::ZellijBackend;

/// Which multiplexer realizes a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Declarative pane/tab layout file (KDL).
    Zellij,
    /// One composed `wt` command line wrapped in launcher scripts.
    WindowsTerminal,
}

impl BackendKind {
    pub fn id(&self) -> &'static str {
        match self {
            BackendKind::Zellij => "zellij",
            BackendKind::WindowsTerminal => "windows-terminal",
        }
    }

    pub fn all() -> &'static [BackendKind] {
        &[BackendKind::Zellij, BackendKind::WindowsTerminal]
    }

    pub fn backend(&self) -> &'static dyn MultiplexerBackend {
        backend_for(*self)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "zellij" => Ok(BackendKind::Zellij),
            "windows-terminal" | "wt" => Ok(BackendKind::WindowsTerminal),
            _ => Err(anyhow::anyhow!(
                "Unknown backend: {s}. Use 'zellij' or 'windows-terminal'."
            )),
        }
    }
}

/// One file of a generated artifact, primary file first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    pub extension: &'static str,
    pub contents: String,
}

/// A tab recovered from a rendered layout body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedTab {
    pub name: String,
    pub cwd: String,
    pub program: String,
}

/// Everything backend-specific: layout syntax and the CLI of the multiplexer.
///
/// Session managers, monitors and managers only ever talk to a backend through
/// this trait, so per-backend string logic lives in exactly one file.
pub trait MultiplexerBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Binary that must exist on the target host.
    fn executable(&self) -> &'static str;

    /// Prefix for artifact file names.
    fn file_stem(&self) -> &'static str;

    /// Native layout body for `layout`, with `~` expanded against `home`.
    fn render(&self, layout: &LayoutSpec, home: Option<&Path>) -> String;

    /// Files written for a rendered body, primary file first.
    fn artifact_files(&self, session_name: &str, body: &str) -> Vec<ArtifactFile>;

    /// Recover the ordered tabs from a rendered body.
    fn parse_rendered(&self, body: &str) -> Vec<RenderedTab>;

    /// Create the session from an artifact without attaching a terminal to it.
    fn start_command(&self, session_name: &str, artifact: &Path) -> String;

    /// Remove `layout`'s session. Must target every session `session_present` accepts.
    fn delete_command(&self, layout: &LayoutSpec) -> String;

    fn list_sessions_command(&self) -> String;

    /// Active session identifiers, or `None` when the output signals a backend failure.
    fn parse_session_list(&self, output: &CommandOutput) -> Option<Vec<String>>;

    /// Whether `layout`'s session shows up in a parsed session list.
    fn session_present(&self, layout: &LayoutSpec, listed: &[String]) -> bool {
        listed.iter().any(|s| s == layout.session_name())
    }

    fn attach_command(&self, session_name: &str) -> String;

    fn supports_remote(&self) -> bool {
        false
    }
}

static ZELLIJ_BACKEND: ZellijBackend = ZellijBackend;
static WINDOWS_TERMINAL_BACKEND: WindowsTerminalBackend = WindowsTerminalBackend;

pub fn backend_for(kind: BackendKind) -> &'static dyn MultiplexerBackend {
    match kind {
        BackendKind::Zellij => &ZELLIJ_BACKEND,
        BackendKind::WindowsTerminal => &WINDOWS_TERMINAL_BACKEND,
    }
}

/// Keep session names filesystem friendly inside artifact file names.
pub(crate) fn file_safe(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}
