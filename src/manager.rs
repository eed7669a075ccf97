//! Orchestration of many sessions that share one layouts map.
//!
//! A [`Manager`] owns one `(SessionManager, StatusReporter)` pair per session,
//! all pointed at the same host. Batch operations run sequentially in layout
//! order and report per-session results; only construction, lookup and
//! persistence fail fast.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::backend::BackendKind;
use crate::config::MuxConfig;
use crate::error::{MuxError, Result};
use crate::exec::{HostExecutor, LocalExecutor, RemoteExecutor};
use crate::generator::{GeneratedArtifact, LayoutGenerator};
use crate::layout::{LayoutSpec, SessionLayouts};
use crate::persist::{self, ManagerMetadata, ManagerState, ManagerType, SessionRecord};
use crate::process::{LocalProcessLister, ProcessLister, ProcessMonitor, RemoteProcessLister};
use crate::session::{KillOutcome, LaunchOutcome, SessionManager, SessionTiming};
use crate::shell::sh_quote;
use crate::status::{self, GlobalSummary, SessionStatusRecord, StatusReporter};

/// `listActive` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveSession {
    pub session_name: String,
    pub is_active: bool,
    pub tab_count: usize,
    pub tabs: Vec<String>,
}

/// How a monitoring loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorRun {
    pub cycles: usize,
    /// Stopped because nothing was running any more.
    pub all_stopped: bool,
}

struct Managed {
    session: SessionManager,
    reporter: StatusReporter,
    artifact: GeneratedArtifact,
}

pub struct Manager {
    prefix: String,
    backend: BackendKind,
    layouts: SessionLayouts,
    sessions: Vec<Managed>,
    executor: Arc<dyn HostExecutor>,
    config: MuxConfig,
    created_at: DateTime<Utc>,
}

/// `prefix_name`, or just `name` without a prefix.
pub fn full_session_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}_{name}")
    }
}

impl Manager {
    /// Sessions on this machine.
    pub async fn local(
        layouts: SessionLayouts,
        prefix: &str,
        backend: BackendKind,
        config: MuxConfig,
    ) -> Result<Self> {
        let lister = Arc::new(LocalProcessLister::new(config.listing_timeout));
        Self::with_host(layouts, prefix, backend, config, Arc::new(LocalExecutor::new()), lister).await
    }

    /// Sessions on `host`, reached over ssh.
    pub async fn remote(
        host: &str,
        layouts: SessionLayouts,
        prefix: &str,
        backend: BackendKind,
        config: MuxConfig,
    ) -> Result<Self> {
        let executor: Arc<dyn HostExecutor> = Arc::new(RemoteExecutor::new(host));
        let lister = Arc::new(RemoteProcessLister::new(executor.clone(), config.listing_timeout));
        Self::with_host(layouts, prefix, backend, config, executor, lister).await
    }

    /// Build every session's artifact up front. Nothing is kept if any step fails.
    pub async fn with_host(
        layouts: SessionLayouts,
        prefix: &str,
        backend: BackendKind,
        config: MuxConfig,
        executor: Arc<dyn HostExecutor>,
        lister: Arc<dyn ProcessLister>,
    ) -> Result<Self> {
        if executor.is_remote() && !backend.backend().supports_remote() {
            return Err(MuxError::UnsupportedBackend {
                backend: backend.id(),
                reason: "on a remote host",
            });
        }
        if layouts.is_empty() {
            return Err(MuxError::Validation(
                "at least one session layout is required".to_string(),
            ));
        }
        for layout in layouts.iter() {
            layout.validate()?;
        }

        let home = executor.home_dir().await;
        let generator = LayoutGenerator::new(backend, &config.artifact_root, home.clone());
        let monitor = ProcessMonitor::new(lister, home.clone()).with_verification(true);
        let timing = SessionTiming::from(&config);

        let mut sessions: Vec<Managed> = Vec::with_capacity(layouts.len());
        for layout in layouts.iter() {
            let full = layout.renamed(full_session_name(prefix, layout.session_name()));
            match Self::prepare(&generator, &executor, &config, home.as_ref(), &full).await {
                Ok((artifact, launch_path)) => sessions.push(Managed {
                    session: SessionManager::new(full, launch_path, backend, executor.clone(), timing),
                    reporter: StatusReporter::new(monitor.clone()),
                    artifact,
                }),
                Err(e) => {
                    for managed in &sessions {
                        remove_artifact(&managed.artifact).await;
                    }
                    return Err(e);
                }
            }
        }

        tracing::info!(
            sessions = sessions.len(),
            backend = %backend,
            host = %executor.host_label(),
            "manager ready"
        );
        Ok(Self {
            prefix: prefix.to_string(),
            backend,
            layouts,
            sessions,
            executor,
            config,
            created_at: Utc::now(),
        })
    }

    /// Generate one artifact and, for remote hosts, upload it. Returns the
    /// artifact and the path the backend should launch from.
    async fn prepare(
        generator: &LayoutGenerator,
        executor: &Arc<dyn HostExecutor>,
        config: &MuxConfig,
        home: Option<&PathBuf>,
        layout: &LayoutSpec,
    ) -> Result<(GeneratedArtifact, PathBuf)> {
        let artifact = generator.generate(layout).await?;
        if !executor.is_remote() {
            let path = artifact.path.clone();
            return Ok((artifact, path));
        }

        let remote_dir = match home {
            Some(home) => format!(
                "{}/{}",
                home.to_string_lossy().trim_end_matches('/'),
                config.remote_artifact_dir
            ),
            None => config.remote_artifact_dir.clone(),
        };
        let mut launch = None;
        for local in std::iter::once(&artifact.path).chain(artifact.companions.iter()) {
            let file_name = local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let dest = format!("{remote_dir}/{file_name}");
            let uploaded = executor.upload(local, &dest, config.command_timeout).await;
            if let Err(e) = uploaded {
                remove_artifact(&artifact).await;
                return Err(e);
            }
            launch.get_or_insert(dest);
        }
        Ok((artifact, PathBuf::from(launch.unwrap_or_default())))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn layouts(&self) -> &SessionLayouts {
        &self.layouts
    }

    pub fn is_remote(&self) -> bool {
        self.executor.is_remote()
    }

    pub fn host_label(&self) -> String {
        self.executor.host_label()
    }

    pub fn session_names(&self) -> Vec<String> {
        self.sessions
            .iter()
            .map(|m| m.session.session_name().to_string())
            .collect()
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &GeneratedArtifact> {
        self.sessions.iter().map(|m| &m.artifact)
    }

    pub fn session(&self, name: &str) -> Result<&SessionManager> {
        self.find(name).map(|m| &m.session)
    }

    /// Accepts the full name or the un-prefixed one.
    fn find(&self, name: &str) -> Result<&Managed> {
        let full = full_session_name(&self.prefix, name);
        self.sessions
            .iter()
            .find(|m| m.session.session_name() == name || m.session.session_name() == full)
            .ok_or_else(|| MuxError::UnknownSession(name.to_string()))
    }

    /// One launch after another, in layout order. A failure does not stop the rest.
    pub async fn start_all(&mut self) -> Vec<LaunchOutcome> {
        let mut outcomes = Vec::with_capacity(self.sessions.len());
        for managed in &mut self.sessions {
            outcomes.push(managed.session.start().await);
        }
        outcomes
    }

    pub async fn kill_all(&mut self) -> Vec<KillOutcome> {
        let mut outcomes = Vec::with_capacity(self.sessions.len());
        for managed in &mut self.sessions {
            outcomes.push(managed.session.kill().await);
        }
        outcomes
    }

    /// Attach command for one session, or one line per session.
    pub fn attach_command(&self, session: Option<&str>) -> Result<String> {
        match session {
            Some(name) => Ok(self.find(name)?.session.attach_command()),
            None => Ok(self
                .sessions
                .iter()
                .map(|m| m.session.attach_command())
                .collect::<Vec<_>>()
                .join("\n")),
        }
    }

    pub async fn status(&self, session: &str) -> Result<SessionStatusRecord> {
        let managed = self.find(session)?;
        Ok(managed.reporter.report(&managed.session).await)
    }

    pub async fn status_all(&self) -> Vec<SessionStatusRecord> {
        let mut records = Vec::with_capacity(self.sessions.len());
        for managed in &self.sessions {
            records.push(managed.reporter.report(&managed.session).await);
        }
        records
    }

    pub async fn global_summary(&self) -> GlobalSummary {
        GlobalSummary::from_records(&self.status_all().await)
    }

    /// Global summary followed by one section per session.
    pub async fn render_report(&self) -> String {
        let records = self.status_all().await;
        render_records(&records)
    }

    pub async fn list_active(&self) -> Vec<ActiveSession> {
        let mut rows = Vec::with_capacity(self.sessions.len());
        for managed in &self.sessions {
            let session = &managed.session;
            let is_active = match session.exists().await {
                Ok(present) => present,
                Err(e) => {
                    tracing::debug!(session = session.session_name(), error = %e, "session query failed");
                    false
                }
            };
            rows.push(ActiveSession {
                session_name: session.session_name().to_string(),
                is_active,
                tab_count: session.layout().len(),
                tabs: session.layout().tab_names().into_iter().map(str::to_string).collect(),
            });
        }
        rows
    }

    /// Refresh status every `interval` until cancelled or until nothing runs.
    ///
    /// Even cycles write the full report, odd cycles a one-line digest.
    /// Cancellation is only observed at the start of a cycle.
    pub async fn run_monitoring_loop<W: std::io::Write + Send>(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
        out: &mut W,
    ) -> Result<MonitorRun> {
        let mut cycle = 0usize;
        loop {
            if *shutdown.borrow() {
                tracing::info!(cycles = cycle, "monitoring cancelled");
                return Ok(MonitorRun {
                    cycles: cycle,
                    all_stopped: false,
                });
            }

            let records = self.status_all().await;
            let global = GlobalSummary::from_records(&records);
            if cycle % 2 == 0 {
                writeln!(out, "== cycle {cycle} ==")?;
                write!(out, "{}", render_records(&records))?;
            } else {
                writeln!(out, "cycle {cycle}: {}", global.digest())?;
            }
            out.flush()?;

            if global.running_commands == 0 {
                tracing::info!(cycle, "no commands running, monitoring stops");
                return Ok(MonitorRun {
                    cycles: cycle + 1,
                    all_stopped: true,
                });
            }
            cycle += 1;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Sender gone: nobody can cancel any more, keep the cadence.
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        }
    }

    /// Persist under `id`, or a fresh 8-character id. Returns the id used.
    pub async fn save(&self, id: Option<&str>) -> Result<String> {
        let id = id.map(str::to_string).unwrap_or_else(persist::new_session_id);
        let state = ManagerState {
            layouts: self.layouts.clone(),
            metadata: ManagerMetadata {
                session_name_prefix: self.prefix.clone(),
                created_at: self.created_at.to_rfc3339(),
                num_managers: self.sessions.len(),
                sessions: self.session_names(),
                manager_type: if self.is_remote() {
                    ManagerType::Remote
                } else {
                    ManagerType::Local
                },
                backend: self.backend,
                remote_host: self.is_remote().then(|| self.host_label()),
            },
            sessions: self
                .sessions
                .iter()
                .map(|m| SessionRecord {
                    session_name: m.session.session_name().to_string(),
                    tab_config: m.session.layout().tabs().to_vec(),
                    artifact_path: m.session.artifact_path().to_string_lossy().into_owned(),
                })
                .collect(),
        };
        persist::save_state(&self.config.persistence_root, &id, &state).await?;
        Ok(id)
    }

    /// Rebuild a saved manager against the host recorded in its metadata.
    pub async fn load(id: &str, config: MuxConfig) -> Result<Self> {
        let state = persist::load_state(&config.persistence_root, id).await?;
        let executor: Arc<dyn HostExecutor> = match (&state.metadata.manager_type, &state.metadata.remote_host) {
            (ManagerType::Remote, Some(host)) => Arc::new(RemoteExecutor::new(host.clone())),
            (ManagerType::Remote, None) => {
                return Err(MuxError::persistence(
                    persist::state_dir(&config.persistence_root, id),
                    "remote manager without a recorded host",
                ))
            }
            (ManagerType::Local, _) => Arc::new(LocalExecutor::new()),
        };
        let lister: Arc<dyn ProcessLister> = if executor.is_remote() {
            Arc::new(RemoteProcessLister::new(executor.clone(), config.listing_timeout))
        } else {
            Arc::new(LocalProcessLister::new(config.listing_timeout))
        };
        Self::restore(state, config, executor, lister).await
    }

    /// Regenerate artifacts from saved state, then overlay the saved
    /// per-session records.
    pub async fn restore(
        state: ManagerState,
        config: MuxConfig,
        executor: Arc<dyn HostExecutor>,
        lister: Arc<dyn ProcessLister>,
    ) -> Result<Self> {
        let ManagerState {
            layouts,
            metadata,
            sessions: records,
        } = state;
        let mut manager = Self::with_host(
            layouts,
            &metadata.session_name_prefix,
            metadata.backend,
            config,
            executor,
            lister,
        )
        .await?;
        if let Ok(created) = DateTime::parse_from_rfc3339(&metadata.created_at) {
            manager.created_at = created.with_timezone(&Utc);
        }

        for record in records {
            let Some(index) = manager
                .sessions
                .iter()
                .position(|m| m.session.session_name() == record.session_name)
            else {
                tracing::warn!(session = %record.session_name, "saved session no longer in layouts, skipped");
                continue;
            };

            if !record.tab_config.is_empty()
                && record.tab_config.as_slice() != manager.sessions[index].session.layout().tabs()
            {
                let overlay = LayoutSpec::with_tabs(record.session_name.as_str(), record.tab_config.clone());
                match overlay.validate() {
                    Ok(()) => manager.sessions[index].session.set_tabs(record.tab_config),
                    Err(e) => tracing::warn!(
                        session = %record.session_name,
                        error = %e,
                        "saved tab map is invalid, keeping the layouts map"
                    ),
                }
            }

            let saved = PathBuf::from(&record.artifact_path);
            if manager.artifact_available(&saved).await {
                manager.sessions[index].session.set_artifact_path(saved);
            } else {
                tracing::warn!(
                    session = %record.session_name,
                    saved = %saved.display(),
                    fresh = %manager.sessions[index].session.artifact_path().display(),
                    "saved artifact is gone, using the regenerated one"
                );
            }
        }
        Ok(manager)
    }

    /// Whether `path` exists on the executor's host. Remote hosts get one `test -f`.
    async fn artifact_available(&self, path: &std::path::Path) -> bool {
        if path.as_os_str().is_empty() {
            return false;
        }
        if !self.is_remote() {
            return tokio::fs::try_exists(path).await.unwrap_or(false);
        }
        let check = format!("test -f {}", sh_quote(&path.to_string_lossy()));
        match self.executor.run(&check, self.config.command_timeout).await {
            Ok(output) => output.success(),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "remote artifact check failed");
                false
            }
        }
    }

    pub async fn list_saved(config: &MuxConfig) -> Result<Vec<String>> {
        persist::list_saved(&config.persistence_root).await
    }

    pub async fn delete(config: &MuxConfig, id: &str) -> Result<bool> {
        persist::delete_saved(&config.persistence_root, id).await
    }
}

fn render_records(records: &[SessionStatusRecord]) -> String {
    let global = GlobalSummary::from_records(records);
    let mut out = String::new();
    let _ = writeln!(out, "Sessions: {}/{} healthy", global.healthy_sessions, global.total_sessions);
    let _ = writeln!(out, "Commands: {}/{} running", global.running_commands, global.total_commands);
    for record in records {
        out.push('\n');
        out.push_str(&status::render(record));
    }
    out
}

async fn remove_artifact(artifact: &GeneratedArtifact) {
    for path in std::iter::once(&artifact.path).chain(artifact.companions.iter()) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            tracing::debug!(path = %path.display(), error = %e, "could not remove artifact");
        }
    }
}
