//! Heuristic "is this tab's command still running" checks.
//!
//! Tabs are matched against a snapshot of the host's process table by
//! command line. The launched programs never report back, so ambiguity is
//! surfaced (every match is returned) rather than resolved.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

use crate::error::{MuxError, Result};
use crate::exec::HostExecutor;
use crate::layout::{LayoutSpec, TabSpec};
use crate::shell::{expand_home, program_name, split_command};

/// Arguments this short (`-f`, `-j`) say little about which process is which.
const SHORT_ARG_LEN: usize = 2;

const PS_FIELDS: &str = "pid=,lstart=,stat=,args=";
const LSTART_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// One row of a process table snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub cmdline: String,
    pub status: String,
    /// Seconds since the epoch, when the lister can tell.
    pub start_time: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessMatch {
    pub tab_name: String,
    pub pid: u32,
    pub process_name: String,
    pub command_line: String,
    pub status: String,
    /// Re-checked after the listing: still present with the same start time.
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum TabState {
    Running,
    NotRunning,
    /// The process table could not be read.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TabStatus {
    pub tab_name: String,
    pub command: String,
    pub cwd: String,
    #[serde(flatten)]
    pub state: TabState,
    pub matches: Vec<ProcessMatch>,
}

impl TabStatus {
    pub fn is_running(&self) -> bool {
        self.state == TabState::Running
    }
}

/// Source of process table snapshots for one host.
#[async_trait::async_trait]
pub trait ProcessLister: Send + Sync {
    async fn list(&self) -> Result<Vec<ProcessEntry>>;

    async fn lookup(&self, pid: u32) -> Result<Option<ProcessEntry>>;

    /// Pid of the process doing the listing, never a match.
    fn own_pid(&self) -> Option<u32> {
        None
    }

    /// Command-line fragment of the listing command itself, never a match.
    fn introspection_marker(&self) -> Option<&str> {
        None
    }
}

/// Process table of this machine via sysinfo.
#[derive(Debug, Clone)]
pub struct LocalProcessLister {
    timeout: Duration,
}

impl LocalProcessLister {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn snapshot(&self, which: Option<u32>) -> Result<Vec<ProcessEntry>> {
        let task = tokio::task::spawn_blocking(move || read_sysinfo(which));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(entries)) => Ok(entries),
            Ok(Err(e)) => Err(MuxError::Io(std::io::Error::other(e))),
            Err(_) => Err(MuxError::Timeout {
                command: "process table refresh".to_string(),
                after: self.timeout,
            }),
        }
    }
}

fn read_sysinfo(which: Option<u32>) -> Vec<ProcessEntry> {
    let refresh = ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always);
    let mut system = System::new();
    let pids: Vec<Pid> = which.into_iter().map(Pid::from_u32).collect();
    let target = if pids.is_empty() {
        ProcessesToUpdate::All
    } else {
        ProcessesToUpdate::Some(&pids)
    };
    system.refresh_processes_specifics(target, true, refresh);

    system
        .processes()
        .iter()
        .map(|(pid, process)| {
            let cmdline = process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ");
            ProcessEntry {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().into_owned(),
                cmdline,
                status: process.status().to_string(),
                start_time: (process.start_time() > 0).then(|| process.start_time()),
            }
        })
        .collect()
}

#[async_trait::async_trait]
impl ProcessLister for LocalProcessLister {
    async fn list(&self) -> Result<Vec<ProcessEntry>> {
        self.snapshot(None).await
    }

    async fn lookup(&self, pid: u32) -> Result<Option<ProcessEntry>> {
        let entries = self.snapshot(Some(pid)).await?;
        Ok(entries.into_iter().find(|e| e.pid == pid))
    }

    fn own_pid(&self) -> Option<u32> {
        Some(std::process::id())
    }
}

/// Process table of a remote host, read with one `ps` call per snapshot.
#[derive(Clone)]
pub struct RemoteProcessLister {
    executor: Arc<dyn HostExecutor>,
    timeout: Duration,
}

impl RemoteProcessLister {
    pub fn new(executor: Arc<dyn HostExecutor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }
}

/// Split off `n` whitespace-separated fields; the remainder keeps its spacing.
fn take_fields(line: &str, n: usize) -> Option<(Vec<&str>, &str)> {
    let mut fields = Vec::with_capacity(n);
    let mut rest = line.trim_start();
    for _ in 0..n {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        if end == 0 {
            return None;
        }
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    Some((fields, rest))
}

/// Parse one `ps -o pid=,lstart=,stat=,args=` row.
///
/// `comm` is left out of the listing: it may contain spaces, which would make
/// the row ambiguous. The name is the base name of the first `args` word.
pub fn parse_ps_line(line: &str) -> Option<ProcessEntry> {
    // pid, five lstart words, stat
    let (fields, args) = take_fields(line, 7)?;
    let args = args.trim_end();
    let pid = fields[0].parse::<u32>().ok()?;
    let lstart = fields[1..6].join(" ");
    let start_time = chrono::NaiveDateTime::parse_from_str(&lstart, LSTART_FORMAT)
        .ok()
        .and_then(|t| u64::try_from(t.and_utc().timestamp()).ok());
    Some(ProcessEntry {
        pid,
        name: args
            .split_whitespace()
            .next()
            .map(|program| program_name(program).to_string())
            .unwrap_or_default(),
        cmdline: args.to_string(),
        status: fields[6].to_string(),
        start_time,
    })
}

#[async_trait::async_trait]
impl ProcessLister for RemoteProcessLister {
    async fn list(&self) -> Result<Vec<ProcessEntry>> {
        let command = format!("LC_ALL=C ps -eo {PS_FIELDS}");
        let output = self.executor.run(&command, self.timeout).await?;
        if !output.success() {
            return Err(MuxError::Transport(format!(
                "{}: ps exited with {}: {}",
                self.executor.host_label(),
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout.lines().filter_map(parse_ps_line).collect())
    }

    async fn lookup(&self, pid: u32) -> Result<Option<ProcessEntry>> {
        let command = format!("LC_ALL=C ps -o {PS_FIELDS} -p {pid}");
        let output = self.executor.run(&command, self.timeout).await?;
        // ps exits 1 when the pid is gone.
        Ok(output
            .stdout
            .lines()
            .filter_map(parse_ps_line)
            .find(|e| e.pid == pid))
    }

    fn introspection_marker(&self) -> Option<&str> {
        Some(PS_FIELDS)
    }
}

/// What a tab's command looks like in a process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabPattern {
    program_token: String,
    program_name: String,
    /// Each argument with its `~`-expanded spelling.
    args: Vec<Vec<String>>,
}

impl TabPattern {
    pub fn new(command: &str, home: Option<&Path>) -> Self {
        let (program_token, args) = split_command(command);
        let program_name = program_name(&program_token).to_string();
        let significant: Vec<&String> = if args.iter().any(|a| a.len() > SHORT_ARG_LEN) {
            args.iter().filter(|a| a.len() > SHORT_ARG_LEN).collect()
        } else {
            args.iter().collect()
        };
        let args = significant
            .into_iter()
            .map(|arg| {
                let mut spellings = vec![arg.clone()];
                let expanded = expand_home(arg, home);
                if expanded != *arg {
                    spellings.push(expanded);
                }
                spellings
            })
            .collect();
        Self {
            program_token,
            program_name,
            args,
        }
    }

    /// Program identity (name equality or token substring) AND, when the
    /// command has arguments, at least one of them in the command line.
    pub fn matches(&self, entry: &ProcessEntry) -> bool {
        let cmdline = entry.cmdline.as_str();
        if cmdline.trim().is_empty() || self.program_name.is_empty() {
            return false;
        }
        if !cmdline.contains(&self.program_name) {
            return false;
        }
        let named = entry.name == self.program_name
            || entry.name == self.program_token
            || cmdline.contains(&self.program_token);
        if !named {
            return false;
        }
        self.args.is_empty()
            || self
                .args
                .iter()
                .any(|spellings| spellings.iter().any(|s| cmdline.contains(s.as_str())))
    }
}

/// Candidate processes for `tab` in a snapshot.
pub fn find_matches(
    tab: &TabSpec,
    entries: &[ProcessEntry],
    home: Option<&Path>,
    own_pid: Option<u32>,
    marker: Option<&str>,
) -> Vec<ProcessMatch> {
    let pattern = TabPattern::new(&tab.command, home);
    entries
        .iter()
        .filter(|e| Some(e.pid) != own_pid)
        .filter(|e| marker.map_or(true, |m| !e.cmdline.contains(m)))
        .filter(|e| pattern.matches(e))
        .map(|e| ProcessMatch {
            tab_name: tab.name.clone(),
            pid: e.pid,
            process_name: e.name.clone(),
            command_line: e.cmdline.clone(),
            status: e.status.clone(),
            verified: false,
        })
        .collect()
}

/// Decides per tab whether a matching process is alive on one host.
#[derive(Clone)]
pub struct ProcessMonitor {
    lister: Arc<dyn ProcessLister>,
    home: Option<PathBuf>,
    verify: bool,
}

impl ProcessMonitor {
    pub fn new(lister: Arc<dyn ProcessLister>, home: Option<PathBuf>) -> Self {
        Self {
            lister,
            home,
            verify: false,
        }
    }

    /// Re-check every match after listing and drop the ones that vanished.
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn verifies(&self) -> bool {
        self.verify
    }

    /// Still enumerable, and with the same start time if both are known.
    pub async fn verify_alive(&self, pid: u32, start_time: Option<u64>) -> Result<bool> {
        let Some(entry) = self.lister.lookup(pid).await? else {
            return Ok(false);
        };
        Ok(match (start_time, entry.start_time) {
            (Some(listed), Some(now)) => listed == now,
            _ => true,
        })
    }

    pub async fn check_one(&self, tab_name: &str, layout: &LayoutSpec) -> Result<TabStatus> {
        let tab = layout
            .tab(tab_name)
            .ok_or_else(|| MuxError::UnknownTab(tab_name.to_string()))?;
        let statuses = match self.lister.list().await {
            Ok(entries) => self.statuses(std::slice::from_ref(tab), &entries).await,
            Err(e) => vec![failed(tab, &e)],
        };
        Ok(statuses.into_iter().next().unwrap_or_else(|| not_running(tab)))
    }

    /// One snapshot, every tab in layout order.
    pub async fn check_all(&self, layout: &LayoutSpec) -> Vec<TabStatus> {
        match self.lister.list().await {
            Ok(entries) => self.statuses(layout.tabs(), &entries).await,
            Err(e) => {
                tracing::warn!(session = layout.session_name(), error = %e, "process listing failed");
                layout.tabs().iter().map(|tab| failed(tab, &e)).collect()
            }
        }
    }

    async fn statuses(&self, tabs: &[TabSpec], entries: &[ProcessEntry]) -> Vec<TabStatus> {
        let mut statuses = Vec::with_capacity(tabs.len());
        for tab in tabs {
            let mut matches = find_matches(
                tab,
                entries,
                self.home.as_deref(),
                self.lister.own_pid(),
                self.lister.introspection_marker(),
            );
            if self.verify {
                matches = self.verified(matches, entries).await;
            }
            tracing::debug!(tab = %tab.name, matches = matches.len(), "tab checked");
            statuses.push(TabStatus {
                tab_name: tab.name.clone(),
                command: tab.command.clone(),
                cwd: tab.cwd.clone(),
                state: if matches.is_empty() {
                    TabState::NotRunning
                } else {
                    TabState::Running
                },
                matches,
            });
        }
        statuses
    }

    async fn verified(&self, matches: Vec<ProcessMatch>, entries: &[ProcessEntry]) -> Vec<ProcessMatch> {
        let mut kept = Vec::with_capacity(matches.len());
        for mut m in matches {
            let listed_start = entries.iter().find(|e| e.pid == m.pid).and_then(|e| e.start_time);
            match self.verify_alive(m.pid, listed_start).await {
                Ok(true) => {
                    m.verified = true;
                    kept.push(m);
                }
                Ok(false) => {
                    tracing::debug!(pid = m.pid, tab = %m.tab_name, "match vanished before verification");
                }
                // Could not re-check: keep the match, unverified.
                Err(_) => kept.push(m),
            }
        }
        kept
    }
}

fn not_running(tab: &TabSpec) -> TabStatus {
    TabStatus {
        tab_name: tab.name.clone(),
        command: tab.command.clone(),
        cwd: tab.cwd.clone(),
        state: TabState::NotRunning,
        matches: Vec::new(),
    }
}

fn failed(tab: &TabSpec, error: &MuxError) -> TabStatus {
    TabStatus {
        state: TabState::Error(error.to_string()),
        ..not_running(tab)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{entry, FakeLister};
    use super::*;
    use crate::exec::testing::{Reply, ScriptedExecutor};

    fn ci_layout() -> LayoutSpec {
        LayoutSpec::from_triples(
            "ci",
            [("build", "~/proj", "make"), ("watch", "~/proj", "tail -f log")],
        )
    }

    fn monitor(lister: FakeLister) -> ProcessMonitor {
        ProcessMonitor::new(Arc::new(lister), Some(PathBuf::from("/home/ops")))
    }

    // ── matching rule ────────────────────────────────────────────────

    #[test]
    fn bare_program_matches_with_any_args() {
        let pattern = TabPattern::new("make", None);
        assert!(pattern.matches(&entry(1, "make -j4")));
        assert!(pattern.matches(&entry(2, "/usr/bin/make")));
        assert!(!pattern.matches(&entry(3, "ninja -C build")));
    }

    #[test]
    fn name_alone_is_not_enough_when_args_exist() {
        let pattern = TabPattern::new("python serve.py --port 8000", None);
        assert!(pattern.matches(&entry(1, "/usr/bin/python3 serve.py --port 8000")));
        assert!(!pattern.matches(&entry(2, "python worker.py")));
    }

    #[test]
    fn one_significant_arg_suffices() {
        let pattern = TabPattern::new("tail -f app.log", None);
        assert!(pattern.matches(&entry(1, "tail -F app.log")));
        assert!(!pattern.matches(&entry(2, "tail -f other.txt")));
    }

    #[test]
    fn short_args_count_when_nothing_longer_exists() {
        let pattern = TabPattern::new("ls -l -a", None);
        assert!(pattern.matches(&entry(1, "ls -l")));
        assert!(!pattern.matches(&entry(2, "ls")));

        let pattern = TabPattern::new("tail -f log", None);
        assert!(pattern.matches(&entry(3, "tail -n 5 log")));
        assert!(!pattern.matches(&entry(4, "tail -f out")));
    }

    #[test]
    fn tilde_args_match_expanded_paths() {
        let home = PathBuf::from("/home/ops");
        let pattern = TabPattern::new("python ~/bots/run.py", Some(home.as_path()));
        assert!(pattern.matches(&entry(1, "python /home/ops/bots/run.py")));
    }

    #[test]
    fn empty_cmdline_never_matches() {
        let pattern = TabPattern::new("make", None);
        let mut kernel = entry(3, "");
        kernel.name = "make".to_string();
        assert!(!pattern.matches(&kernel));
    }

    #[test]
    fn own_pid_and_introspection_are_excluded() {
        let tab = TabSpec::new("ps", "/", "ps -eo pid=,lstart=,stat=,args=");
        let entries = vec![entry(7, "ps -eo pid=,lstart=,stat=,args=")];
        assert!(find_matches(&tab, &entries, None, None, Some(PS_FIELDS)).is_empty());
        assert!(find_matches(&tab, &entries, None, Some(7), None).is_empty());
        assert_eq!(find_matches(&tab, &entries, None, None, None).len(), 1);
    }

    #[test]
    fn all_ambiguous_matches_are_returned() {
        let tab = TabSpec::new("w", "/", "htop");
        let entries = vec![entry(1, "htop"), entry(2, "htop -d 10"), entry(3, "top")];
        let pids: Vec<u32> = find_matches(&tab, &entries, None, None, None)
            .iter()
            .map(|m| m.pid)
            .collect();
        assert_eq!(pids, vec![1, 2]);
    }

    // ── monitor ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn check_all_reports_build_running_and_watch_stopped() {
        let lister = FakeLister::with_cmdlines(&["make -j4", "bash", "sshd: ops@pts/0"]);
        let statuses = monitor(lister).check_all(&ci_layout()).await;
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].tab_name, "build");
        assert!(statuses[0].is_running());
        assert_eq!(statuses[0].matches.len(), 1);
        assert_eq!(statuses[0].matches[0].command_line, "make -j4");
        assert_eq!(statuses[1].tab_name, "watch");
        assert_eq!(statuses[1].state, TabState::NotRunning);
        assert!(statuses[1].matches.is_empty());
    }

    #[tokio::test]
    async fn check_all_lists_once() {
        let lister = Arc::new(FakeLister::with_cmdlines(&["make"]));
        let monitor = ProcessMonitor::new(lister.clone(), None);
        monitor.check_all(&ci_layout()).await;
        assert_eq!(lister.list_calls(), 1);
    }

    #[tokio::test]
    async fn listing_failure_marks_every_tab_as_error() {
        let statuses = monitor(FakeLister::failing()).check_all(&ci_layout()).await;
        assert!(statuses
            .iter()
            .all(|s| matches!(&s.state, TabState::Error(msg) if msg.contains("timed out"))));
    }

    #[tokio::test]
    async fn check_one_unknown_tab() {
        let err = monitor(FakeLister::default())
            .check_one("deploy", &ci_layout())
            .await
            .unwrap_err();
        assert!(matches!(err, MuxError::UnknownTab(name) if name == "deploy"));
    }

    #[tokio::test]
    async fn check_one_known_tab() {
        let status = monitor(FakeLister::with_cmdlines(&["tail -f log"]))
            .check_one("watch", &ci_layout())
            .await
            .unwrap();
        assert!(status.is_running());
        assert_eq!(status.cwd, "~/proj");
    }

    #[tokio::test]
    async fn verification_drops_vanished_pids() {
        let mut lister = FakeLister::with_cmdlines(&["make -j4", "make install"]);
        lister.gone = vec![100];
        let statuses = monitor(lister)
            .with_verification(true)
            .check_all(&ci_layout())
            .await;
        let build = &statuses[0];
        assert_eq!(build.matches.len(), 1);
        assert_eq!(build.matches[0].pid, 101);
        assert!(build.matches[0].verified);
    }

    #[tokio::test]
    async fn verify_alive_compares_start_times() {
        let monitor = monitor(FakeLister::with_cmdlines(&["make"]));
        assert!(monitor.verify_alive(100, Some(1_700_000_100)).await.unwrap());
        assert!(!monitor.verify_alive(100, Some(42)).await.unwrap());
        assert!(!monitor.verify_alive(999, None).await.unwrap());
    }

    // ── remote lister ───────────────────────────────────────────────

    #[test]
    fn parses_ps_rows() {
        let row = "  4242 Wed Oct 14 09:12:01 2026 S+   tail -f  /var/log/app.log";
        let entry = parse_ps_line(row).unwrap();
        assert_eq!(entry.pid, 4242);
        assert_eq!(entry.name, "tail");
        assert_eq!(entry.status, "S+");
        assert_eq!(entry.cmdline, "tail -f  /var/log/app.log");
        assert!(entry.start_time.is_some());
        assert!(parse_ps_line("garbage").is_none());
    }

    #[test]
    fn ps_rows_keep_the_full_command_line() {
        // The thread name of this process is "Web Content"; only argv is listed.
        let row = "  4242 Wed Oct 14 09:12:01 2026 Sl   /usr/lib/firefox/firefox -contentproc 12";
        let entry = parse_ps_line(row).unwrap();
        assert_eq!(entry.name, "firefox");
        assert_eq!(entry.cmdline, "/usr/lib/firefox/firefox -contentproc 12");
        assert_eq!(entry.status, "Sl");

        let kernel = parse_ps_line("    2 Wed Oct 14 08:00:00 2026 S    [kthreadd]").unwrap();
        assert_eq!(kernel.name, "[kthreadd]");
        assert!(!PS_FIELDS.contains("comm"));
    }

    #[tokio::test]
    async fn remote_listing_is_one_batched_call() {
        let exec = Arc::new(ScriptedExecutor::new().remote().on(
            "ps -eo",
            vec![Reply::ok(
                "    1 Wed Oct 14 08:00:00 2026 Ss   /sbin/init\n\
                 \x20 900 Wed Oct 14 09:00:00 2026 S    make -j4\n\
                 \x20 901 Wed Oct 14 09:00:05 2026 R    ps -eo pid=,lstart=,stat=,args=\n",
            )],
        ));
        let lister = Arc::new(RemoteProcessLister::new(exec.clone(), Duration::from_secs(15)));
        let monitor = ProcessMonitor::new(lister, Some(PathBuf::from("/home/ops")));
        let statuses = monitor.check_all(&ci_layout()).await;
        assert!(statuses[0].is_running());
        assert_eq!(statuses[0].matches[0].pid, 900);
        assert_eq!(exec.calls_matching("ps -eo"), 1);
    }

    #[tokio::test]
    async fn remote_ps_failure_is_an_error_state() {
        let exec = Arc::new(
            ScriptedExecutor::new()
                .remote()
                .on("ps -eo", vec![Reply::Transport("connection refused".to_string())]),
        );
        let monitor = ProcessMonitor::new(
            Arc::new(RemoteProcessLister::new(exec, Duration::from_secs(15))),
            None,
        );
        let statuses = monitor.check_all(&ci_layout()).await;
        assert!(statuses.iter().all(|s| matches!(s.state, TabState::Error(_))));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn matches_always_contain_the_program(
                program in "[a-z]{1,6}",
                args in proptest::collection::vec("[a-z0-9-]{1,5}", 0..3),
                cmdlines in proptest::collection::vec("[a-z0-9 -]{0,24}", 0..8),
            ) {
                let mut words = vec![program.clone()];
                words.extend(args);
                let tab = TabSpec::new("t", "/", shell_words::join(&words));
                let entries: Vec<ProcessEntry> = cmdlines
                    .iter()
                    .enumerate()
                    .map(|(i, c)| entry(i as u32, c))
                    .collect();
                for m in find_matches(&tab, &entries, None, None, None) {
                    prop_assert!(m.command_line.contains(&program));
                }
            }
        }
    }
}
