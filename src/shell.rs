use std::path::Path;

use rand::Rng;

const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Split a command into its program token and argument tokens.
///
/// Uses POSIX shell-word rules so quoted substrings stay one token. Input with
/// unbalanced quotes falls back to whitespace splitting.
pub fn split_command(command: &str) -> (String, Vec<String>) {
    let parts = match shell_words::split(command) {
        Ok(parts) => parts,
        Err(e) => {
            tracing::debug!(command, error = %e, "falling back to whitespace split");
            command.split_whitespace().map(str::to_string).collect()
        }
    };
    let mut iter = parts.into_iter();
    let program = iter.next().unwrap_or_default();
    (program, iter.collect())
}

/// Final path component of a program token: `/usr/bin/make` → `make`.
pub fn program_name(program: &str) -> &str {
    program
        .rsplit(|c: char| c == '/' || c == '\\')
        .find(|s| !s.is_empty())
        .unwrap_or(program)
}

/// Expand a leading `~` or `~/` against `home`. Other paths pass through.
pub fn expand_home(path: &str, home: Option<&Path>) -> String {
    let Some(home) = home else {
        return path.to_string();
    };
    let home = home.to_string_lossy();
    let home = home.trim_end_matches(|c: char| c == '/' || c == '\\');
    if path == "~" {
        home.to_string()
    } else if let Some(rest) = path.strip_prefix("~/") {
        format!("{home}/{rest}")
    } else {
        path.to_string()
    }
}

/// Quote a value as a KDL string literal.
pub fn kdl_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Escape a token for a Windows Terminal command line.
///
/// Embedded quotes are doubled; tokens containing whitespace or `;`, `&`, `|`
/// are wrapped in quotes.
pub fn wt_escape(value: &str) -> String {
    let doubled = value.replace('"', "\"\"");
    let needs_quotes = doubled
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, ';' | '&' | '|'));
    if needs_quotes {
        format!("\"{doubled}\"")
    } else {
        doubled
    }
}

/// Quote a value for a POSIX shell.
pub fn sh_quote(value: &str) -> String {
    shell_words::quote(value).into_owned()
}

/// 8-char lowercase alphanumeric suffix used to keep artifact names unique.
pub fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
        .collect()
}
