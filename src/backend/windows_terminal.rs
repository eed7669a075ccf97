//! Windows Terminal backend.
//!
//! Windows Terminal has no layout file format, so a layout becomes one `wt`
//! command line: the first tab opens the window and every later tab is
//! appended with `; new-tab`. The line is wrapped in a PowerShell launcher
//! (primary) and a batch file with the same command.

use std::path::Path;

use super::{ArtifactFile, BackendKind, MultiplexerBackend, RenderedTab};
use crate::exec::CommandOutput;
use crate::layout::LayoutSpec;
use crate::shell::{expand_home, split_command, wt_escape};

const LIST_TITLES: &str = "Get-Process WindowsTerminal -ErrorAction SilentlyContinue | \
Where-Object { $_.MainWindowTitle } | Select-Object -ExpandProperty MainWindowTitle | ConvertTo-Json";

#[derive(Debug, Default)]
pub struct WindowsTerminalBackend;

fn tab_args(name: &str, cwd: &str, command: &str) -> String {
    let (program, args) = split_command(command);
    let mut parts = vec![
        "-d".to_string(),
        wt_escape(cwd),
        "--title".to_string(),
        wt_escape(name),
        wt_escape(&program),
    ];
    parts.extend(args.iter().map(|a| wt_escape(a)));
    parts.join(" ")
}

/// `(token, was_quoted)` pairs of a wt command line.
fn wt_tokens(line: &str) -> Vec<(String, bool)> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else {
            break;
        };
        let mut token = String::new();
        if first == '"' {
            chars.next();
            while let Some(c) = chars.next() {
                if c == '"' {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        token.push('"');
                    } else {
                        break;
                    }
                } else {
                    token.push(c);
                }
            }
            tokens.push((token, true));
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
            tokens.push((token, false));
        }
    }
    tokens
}

fn rendered_tab(segment: &[(String, bool)]) -> RenderedTab {
    let mut tab = RenderedTab {
        name: String::new(),
        cwd: String::new(),
        program: String::new(),
    };
    let mut iter = segment.iter().map(|(t, _)| t.as_str());
    while let Some(token) = iter.next() {
        match token {
            "new-tab" => {}
            "-w" => {
                iter.next();
            }
            "-d" => tab.cwd = iter.next().unwrap_or_default().to_string(),
            "--title" => tab.name = iter.next().unwrap_or_default().to_string(),
            program => {
                tab.program = program.to_string();
                break;
            }
        }
    }
    tab
}

/// A literal `-clike` pattern for `value`, usable inside a single-quoted
/// PowerShell string. `"` cannot survive the outer `-Command "..."` quoting,
/// so it becomes the one-character wildcard.
fn ps_like_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' | '?' | '[' | ']' | '`' => {
                out.push('`');
                out.push(c);
            }
            '\'' => out.push_str("''"),
            '"' => out.push('?'),
            _ => out.push(c),
        }
    }
    out
}

impl MultiplexerBackend for WindowsTerminalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::WindowsTerminal
    }

    fn executable(&self) -> &'static str {
        "wt"
    }

    fn file_stem(&self) -> &'static str {
        "wt_layout"
    }

    fn render(&self, layout: &LayoutSpec, home: Option<&Path>) -> String {
        let tabs: Vec<String> = layout
            .tabs()
            .iter()
            .map(|tab| tab_args(&tab.name, &expand_home(&tab.cwd, home), &tab.command))
            .collect();
        format!(
            "wt -w {} {}",
            wt_escape(layout.session_name()),
            tabs.join(" ; new-tab ")
        )
    }

    fn artifact_files(&self, session_name: &str, body: &str) -> Vec<ArtifactFile> {
        // PowerShell would split on `;` itself, so hand the rest of the line to wt verbatim.
        let ps_line = match body.strip_prefix("wt ") {
            Some(rest) => format!("wt --% {rest}"),
            None => body.to_string(),
        };
        vec![
            ArtifactFile {
                extension: "ps1",
                contents: format!("# Windows Terminal layout for {session_name}\n{ps_line}\n"),
            },
            ArtifactFile {
                extension: "bat",
                contents: format!(
                    "@echo off\nREM Windows Terminal layout for {session_name}\n{body}\n"
                ),
            },
        ]
    }

    fn parse_rendered(&self, body: &str) -> Vec<RenderedTab> {
        let Some(line) = body
            .lines()
            .map(str::trim)
            .find(|l| l.starts_with("wt ") || *l == "wt")
        else {
            return Vec::new();
        };
        let line = line.trim_start_matches("wt").trim_start();
        let line = line.strip_prefix("--%").unwrap_or(line);

        wt_tokens(line)
            .split(|(token, quoted)| !quoted && token == ";")
            .filter(|segment| !segment.is_empty())
            .map(rendered_tab)
            .collect()
    }

    fn start_command(&self, _session_name: &str, artifact: &Path) -> String {
        format!(
            "powershell -NoProfile -ExecutionPolicy Bypass -File \"{}\"",
            artifact.display()
        )
    }

    /// Stops every window `session_present` would count: titles containing
    /// the session name, or equal to one of its tab names.
    fn delete_command(&self, layout: &LayoutSpec) -> String {
        let mut clauses = vec![format!(
            "$_.MainWindowTitle -clike '*{}*'",
            ps_like_literal(layout.session_name())
        )];
        clauses.extend(
            layout
                .tabs()
                .iter()
                .map(|t| format!("$_.MainWindowTitle -clike '{}'", ps_like_literal(&t.name))),
        );
        format!(
            "powershell -NoProfile -Command \"Get-Process WindowsTerminal -ErrorAction SilentlyContinue | \
Where-Object {{ {} }} | Stop-Process -Force\"",
            clauses.join(" -or ")
        )
    }

    fn list_sessions_command(&self) -> String {
        format!("powershell -NoProfile -Command \"{LIST_TITLES}\"")
    }

    fn parse_session_list(&self, output: &CommandOutput) -> Option<Vec<String>> {
        let stdout = output.stdout.trim();
        if stdout.is_empty() {
            // No terminal window open: Get-Process reports nothing.
            return (output.success() || output.stderr.trim().is_empty()).then(Vec::new);
        }
        match serde_json::from_str::<serde_json::Value>(stdout).ok()? {
            serde_json::Value::String(title) => Some(vec![title]),
            serde_json::Value::Array(titles) => Some(
                titles
                    .into_iter()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// A window's title is either the window name or its active tab's title.
    fn session_present(&self, layout: &LayoutSpec, listed: &[String]) -> bool {
        listed.iter().any(|title| {
            title.contains(layout.session_name())
                || layout.tabs().iter().any(|t| t.name == *title)
        })
    }

    fn attach_command(&self, session_name: &str) -> String {
        format!("wt -w {}", wt_escape(session_name))
    }
}
