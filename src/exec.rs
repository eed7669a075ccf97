use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::{MuxError, Result};
use crate::shell::sh_quote;

/// ssh reserves exit status 255 for its own failures.
const SSH_TRANSPORT_EXIT: i32 = 255;

/// Captured result of one external command. A non-zero exit is data, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn from_output(output: std::process::Output) -> Self {
        Self {
            // Killed by a signal: no code, report as generic failure.
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// The one seam through which session managers and listers touch a host.
#[async_trait::async_trait]
pub trait HostExecutor: Send + Sync {
    /// Run a shell command and capture its output.
    ///
    /// Fails with `Timeout` past `timeout` and with `Transport` when the host
    /// cannot be reached. A non-zero exit is reported in the output.
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput>;

    /// Start a command without waiting for it.
    async fn spawn_detached(&self, command: &str) -> Result<()>;

    async fn has_executable(&self, name: &str) -> bool;

    /// Copy a local file to `dest` on the host, creating parent directories.
    async fn upload(&self, local: &Path, dest: &str, timeout: Duration) -> Result<()>;

    async fn home_dir(&self) -> Option<PathBuf>;

    fn host_label(&self) -> String;

    /// Command an operator types locally to run `command` on this host with a terminal.
    fn interactive_command(&self, command: &str) -> String {
        command.to_string()
    }

    fn is_remote(&self) -> bool {
        false
    }
}

fn shell_command(command: &str) -> Command {
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C");
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c");
        c
    };
    cmd.arg(command);
    cmd
}

/// Run a Command with a timeout. The child is killed if the timeout fires.
async fn output_with_timeout(
    cmd: &mut Command,
    label: &str,
    timeout: Duration,
) -> Result<std::io::Result<std::process::Output>> {
    cmd.kill_on_drop(true);
    tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| MuxError::Timeout {
            command: label.to_string(),
            after: timeout,
        })
}

fn detach(cmd: &mut Command) {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    cmd.process_group(0);
}

/// Runs commands on this machine through the platform shell.
#[derive(Debug, Default, Clone)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl HostExecutor for LocalExecutor {
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        tracing::debug!(command, "running local command");
        let output = output_with_timeout(&mut shell_command(command), command, timeout).await?;
        Ok(CommandOutput::from_output(output?))
    }

    /// Fire-and-forget: the child is reaped in the background so it never
    /// becomes a zombie, and is never awaited by the caller.
    async fn spawn_detached(&self, command: &str) -> Result<()> {
        let mut cmd = shell_command(command);
        detach(&mut cmd);
        let mut child = cmd.spawn()?;
        tracing::debug!(command, pid = child.id(), "spawned detached command");
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(())
    }

    async fn has_executable(&self, name: &str) -> bool {
        which::which(name).is_ok()
    }

    async fn upload(&self, local: &Path, dest: &str, _timeout: Duration) -> Result<()> {
        let dest = PathBuf::from(dest);
        if dest == local {
            return Ok(());
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, &dest).await?;
        Ok(())
    }

    async fn home_dir(&self) -> Option<PathBuf> {
        dirs::home_dir()
    }

    fn host_label(&self) -> String {
        "localhost".to_string()
    }
}

/// Runs commands on one remote host over the system `ssh` client.
///
/// Every call opens a fresh connection; no channel is reused.
#[derive(Debug, Clone)]
pub struct RemoteExecutor {
    host: String,
    connect_timeout: Duration,
}

impl RemoteExecutor {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn ssh(&self) -> Command {
        let mut cmd = Command::new("ssh");
        let connect = format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1));
        cmd.args(["-o", "BatchMode=yes", "-o"])
            .arg(connect)
            .arg(&self.host);
        cmd
    }

    fn transport_error(&self, detail: impl std::fmt::Display) -> MuxError {
        MuxError::Transport(format!("{}: {}", self.host, detail))
    }
}

#[async_trait::async_trait]
impl HostExecutor for RemoteExecutor {
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        tracing::debug!(host = %self.host, command, "running remote command");
        let mut cmd = self.ssh();
        cmd.arg(command);
        let output = output_with_timeout(&mut cmd, command, timeout)
            .await?
            .map_err(|e| self.transport_error(format!("failed to start ssh: {e}")))?;
        let output = CommandOutput::from_output(output);
        if output.exit_code == SSH_TRANSPORT_EXIT {
            return Err(self.transport_error(output.stderr.trim()));
        }
        Ok(output)
    }

    async fn spawn_detached(&self, command: &str) -> Result<()> {
        let wrapped = format!("nohup sh -c {} >/dev/null 2>&1 &", sh_quote(command));
        let output = self.run(&wrapped, self.connect_timeout * 2).await?;
        if !output.success() {
            return Err(self.transport_error(format!(
                "detached launch exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn has_executable(&self, name: &str) -> bool {
        let probe = format!("command -v {} >/dev/null 2>&1", sh_quote(name));
        match self.run(&probe, self.connect_timeout * 2).await {
            Ok(output) => output.success(),
            Err(e) => {
                tracing::warn!(host = %self.host, executable = name, error = %e, "executable probe failed");
                false
            }
        }
    }

    async fn upload(&self, local: &Path, dest: &str, timeout: Duration) -> Result<()> {
        if let Some((dir, _)) = dest.rsplit_once('/') {
            if !dir.is_empty() {
                self.run(&format!("mkdir -p {}", sh_quote(dir)), timeout).await?;
            }
        }
        let target = format!("{}:{}", self.host, dest);
        let mut cmd = Command::new("scp");
        cmd.args(["-q", "-o", "BatchMode=yes"]).arg(local).arg(&target);
        let label = format!("scp {} {}", local.display(), target);
        let output = output_with_timeout(&mut cmd, &label, timeout)
            .await?
            .map_err(|e| self.transport_error(format!("failed to start scp: {e}")))?;
        if !output.status.success() {
            return Err(self.transport_error(format!(
                "upload to {dest} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        tracing::debug!(host = %self.host, dest, "uploaded artifact");
        Ok(())
    }

    async fn home_dir(&self) -> Option<PathBuf> {
        match self.run("printf %s \"$HOME\"", self.connect_timeout * 2).await {
            Ok(output) if output.success() && !output.stdout.trim().is_empty() => {
                Some(PathBuf::from(output.stdout.trim()))
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(host = %self.host, error = %e, "could not query remote home");
                None
            }
        }
    }

    fn host_label(&self) -> String {
        self.host.clone()
    }

    fn interactive_command(&self, command: &str) -> String {
        format!("ssh -t {} {}", sh_quote(&self.host), sh_quote(command))
    }

    fn is_remote(&self) -> bool {
        true
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted executor for tests: replies are chosen by substring match on the command.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub enum Reply {
        Output(CommandOutput),
        Timeout,
        Transport(String),
    }

    impl Reply {
        pub fn ok(stdout: &str) -> Self {
            Reply::Output(CommandOutput {
                exit_code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            })
        }

        pub fn fail(exit_code: i32, stderr: &str) -> Self {
            Reply::Output(CommandOutput {
                exit_code,
                stdout: String::new(),
                stderr: stderr.to_string(),
            })
        }
    }

    #[derive(Default)]
    pub struct ScriptedExecutor {
        rules: Mutex<Vec<(String, VecDeque<Reply>)>>,
        executables: Vec<String>,
        home: Option<PathBuf>,
        remote: bool,
        calls: Mutex<Vec<String>>,
        spawned: Mutex<Vec<String>>,
        uploads: Mutex<Vec<(PathBuf, String)>>,
    }

    impl ScriptedExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_executable(mut self, name: &str) -> Self {
            self.executables.push(name.to_string());
            self
        }

        pub fn with_home(mut self, home: &str) -> Self {
            self.home = Some(PathBuf::from(home));
            self
        }

        pub fn remote(mut self) -> Self {
            self.remote = true;
            self
        }

        /// Queue replies for commands containing `pattern`; the last reply repeats.
        pub fn on(self, pattern: &str, replies: Vec<Reply>) -> Self {
            self.rules
                .lock()
                .expect("rules lock poisoned")
                .push((pattern.to_string(), replies.into()));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock poisoned").clone()
        }

        pub fn calls_matching(&self, pattern: &str) -> usize {
            self.calls().iter().filter(|c| c.contains(pattern)).count()
        }

        pub fn spawned(&self) -> Vec<String> {
            self.spawned.lock().expect("spawned lock poisoned").clone()
        }

        pub fn uploads(&self) -> Vec<(PathBuf, String)> {
            self.uploads.lock().expect("uploads lock poisoned").clone()
        }

        fn reply_for(&self, command: &str) -> Reply {
            let mut rules = self.rules.lock().expect("rules lock poisoned");
            for (pattern, replies) in rules.iter_mut() {
                if command.contains(pattern.as_str()) {
                    return if replies.len() > 1 {
                        replies.pop_front().unwrap_or_else(|| Reply::ok(""))
                    } else {
                        replies.front().cloned().unwrap_or_else(|| Reply::ok(""))
                    };
                }
            }
            Reply::ok("")
        }
    }

    #[async_trait::async_trait]
    impl HostExecutor for ScriptedExecutor {
        async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
            self.calls
                .lock()
                .expect("calls lock poisoned")
                .push(command.to_string());
            match self.reply_for(command) {
                Reply::Output(output) => Ok(output),
                Reply::Timeout => Err(MuxError::Timeout {
                    command: command.to_string(),
                    after: timeout,
                }),
                Reply::Transport(reason) => Err(MuxError::Transport(reason)),
            }
        }

        async fn spawn_detached(&self, command: &str) -> Result<()> {
            self.spawned
                .lock()
                .expect("spawned lock poisoned")
                .push(command.to_string());
            Ok(())
        }

        async fn has_executable(&self, name: &str) -> bool {
            self.executables.iter().any(|e| e == name)
        }

        async fn upload(&self, local: &Path, dest: &str, _timeout: Duration) -> Result<()> {
            self.uploads
                .lock()
                .expect("uploads lock poisoned")
                .push((local.to_path_buf(), dest.to_string()));
            Ok(())
        }

        async fn home_dir(&self) -> Option<PathBuf> {
            self.home.clone()
        }

        fn host_label(&self) -> String {
            if self.remote {
                "build-box".to_string()
            } else {
                "localhost".to_string()
            }
        }

        fn interactive_command(&self, command: &str) -> String {
            if self.remote {
                format!("ssh -t build-box {}", sh_quote(command))
            } else {
                command.to_string()
            }
        }

        fn is_remote(&self) -> bool {
            self.remote
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn local_run_captures_output_and_exit_code() {
        let exec = LocalExecutor::new();
        let out = exec
            .run("printf hello; echo oops >&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert!(!out.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn local_run_times_out() {
        let exec = LocalExecutor::new();
        let err = exec
            .run("sleep 5", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, MuxError::Timeout { .. }), "got {err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn local_spawn_detached_returns_immediately() {
        let exec = LocalExecutor::new();
        let started = std::time::Instant::now();
        exec.spawn_detached("sleep 2").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn local_has_executable() {
        let exec = LocalExecutor::new();
        assert!(exec.has_executable("sh").await);
        assert!(!exec.has_executable("definitely-not-a-real-binary-42").await);
    }

    #[tokio::test]
    async fn local_upload_copies_into_new_directory() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("layout.kdl");
        std::fs::write(&src, "layout {}\n").unwrap();
        let dest = dir.path().join("nested/out/layout.kdl");

        LocalExecutor::new()
            .upload(&src, &dest.to_string_lossy(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "layout {}\n");
    }

    #[test]
    fn remote_interactive_command_wraps_in_ssh() {
        let exec = RemoteExecutor::new("ops@build-box");
        assert_eq!(
            exec.interactive_command("zellij attach ci"),
            "ssh -t ops@build-box 'zellij attach ci'"
        );
        assert!(exec.is_remote());
        assert_eq!(exec.host_label(), "ops@build-box");
    }

    #[tokio::test]
    async fn scripted_replies_advance_then_stick() {
        use testing::{Reply, ScriptedExecutor};

        let exec = ScriptedExecutor::new().on(
            "list-sessions",
            vec![Reply::ok(""), Reply::ok("ci [Created 1s ago]\n")],
        );
        let t = Duration::from_secs(1);
        assert_eq!(exec.run("zellij list-sessions", t).await.unwrap().stdout, "");
        for _ in 0..2 {
            let out = exec.run("zellij list-sessions", t).await.unwrap();
            assert!(out.stdout.starts_with("ci"));
        }
        assert_eq!(exec.calls_matching("list-sessions"), 3);
    }
}
