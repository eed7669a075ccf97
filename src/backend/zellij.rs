//! Zellij backend.
//!
//! A layout is a KDL document with one `tab` node per tab. Sessions are
//! created in the background with `attach --create-background`, so launching
//! never needs a terminal.

use std::path::Path;

use super::{ArtifactFile, BackendKind, MultiplexerBackend, RenderedTab};
use crate::exec::CommandOutput;
use crate::layout::LayoutSpec;
use crate::shell::{expand_home, kdl_quote, sh_quote, split_command};

const LAYOUT_HEADER: &str = r#"layout {
    default_tab_template {
        // the default zellij tab-bar and status bar plugins
        pane size=1 borderless=true {
            plugin location="zellij:compact-bar"
        }
        children
    }
"#;

const NO_SESSIONS_MARKER: &str = "No active zellij sessions";

#[derive(Debug, Default)]
pub struct ZellijBackend;

fn tab_block(name: &str, cwd: &str, command: &str) -> String {
    let (program, args) = split_command(command);
    let mut block = format!(
        "  tab name={} cwd={} {{\n    pane command={} {{\n",
        kdl_quote(name),
        kdl_quote(cwd),
        kdl_quote(&program)
    );
    if !args.is_empty() {
        let quoted: Vec<String> = args.iter().map(|a| kdl_quote(a)).collect();
        block.push_str(&format!("      args {}\n", quoted.join(" ")));
    }
    block.push_str("    }\n  }\n");
    block
}

/// Read a KDL string literal at the start of `input`; returns the value and the rest.
fn read_kdl_string(input: &str) -> Option<(String, &str)> {
    let mut chars = input.char_indices();
    if chars.next()?.1 != '"' {
        return None;
    }
    let mut value = String::new();
    let mut escaped = false;
    for (i, c) in chars {
        if escaped {
            value.push(match c {
                'n' => '\n',
                't' => '\t',
                other => other,
            });
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return Some((value, &input[i + 1..]));
        } else {
            value.push(c);
        }
    }
    None
}

/// `key="value"` properties of a node line, in order.
fn node_props(line: &str) -> Vec<(String, String)> {
    let mut props = Vec::new();
    let mut rest = line;
    while let Some(eq) = rest.find("=\"") {
        let key = rest[..eq]
            .rsplit(|c: char| c.is_whitespace())
            .next()
            .unwrap_or_default()
            .to_string();
        match read_kdl_string(&rest[eq + 1..]) {
            Some((value, tail)) => {
                props.push((key, value));
                rest = tail;
            }
            None => break,
        }
    }
    props
}

fn prop<'a>(props: &'a [(String, String)], key: &str) -> Option<&'a str> {
    props
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Strip ANSI color sequences that older zellij versions emit in listings.
fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            if chars.peek() == Some(&'[') {
                chars.next();
                for next in chars.by_ref() {
                    if next.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

impl MultiplexerBackend for ZellijBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Zellij
    }

    fn executable(&self) -> &'static str {
        "zellij"
    }

    fn file_stem(&self) -> &'static str {
        "zellij_layout"
    }

    fn render(&self, layout: &LayoutSpec, home: Option<&Path>) -> String {
        let mut body = String::from(LAYOUT_HEADER);
        for tab in layout.tabs() {
            body.push('\n');
            body.push_str(&tab_block(&tab.name, &expand_home(&tab.cwd, home), &tab.command));
        }
        body.push_str("\n}\n");
        body
    }

    fn artifact_files(&self, _session_name: &str, body: &str) -> Vec<ArtifactFile> {
        vec![ArtifactFile {
            extension: "kdl",
            contents: body.to_string(),
        }]
    }

    fn parse_rendered(&self, body: &str) -> Vec<RenderedTab> {
        let mut tabs: Vec<RenderedTab> = Vec::new();
        for line in body.lines().map(str::trim_start) {
            if line.starts_with("tab ") {
                let props = node_props(line);
                tabs.push(RenderedTab {
                    name: prop(&props, "name").unwrap_or_default().to_string(),
                    cwd: prop(&props, "cwd").unwrap_or_default().to_string(),
                    program: String::new(),
                });
            } else if line.starts_with("pane command=") {
                if let Some(tab) = tabs.last_mut() {
                    let props = node_props(line);
                    tab.program = prop(&props, "command").unwrap_or_default().to_string();
                }
            }
        }
        tabs
    }

    fn start_command(&self, session_name: &str, artifact: &Path) -> String {
        format!(
            "zellij --layout {} attach --create-background {}",
            sh_quote(&artifact.to_string_lossy()),
            sh_quote(session_name)
        )
    }

    fn delete_command(&self, layout: &LayoutSpec) -> String {
        format!(
            "zellij delete-session --force {}",
            sh_quote(layout.session_name())
        )
    }

    fn list_sessions_command(&self) -> String {
        "zellij list-sessions --no-formatting".to_string()
    }

    fn parse_session_list(&self, output: &CommandOutput) -> Option<Vec<String>> {
        if !output.success() {
            let empty = output.stderr.contains(NO_SESSIONS_MARKER)
                || output.stdout.contains(NO_SESSIONS_MARKER);
            return empty.then(Vec::new);
        }
        let sessions = output
            .stdout
            .lines()
            .map(strip_ansi)
            .filter(|line| !line.contains("EXITED"))
            .filter_map(|line| line.split_whitespace().next().map(str::to_string))
            .collect();
        Some(sessions)
    }

    fn attach_command(&self, session_name: &str) -> String {
        format!("zellij attach {}", sh_quote(session_name))
    }

    fn supports_remote(&self) -> bool {
        true
    }
}
