use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::{file_safe, BackendKind};
use crate::error::{MuxError, Result};
use crate::layout::{SessionLayouts, TabSpec};

pub const LAYOUTS_FILE: &str = "session2tabs.json";
pub const METADATA_FILE: &str = "metadata.json";
pub const SESSIONS_DIR: &str = "managers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerType {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerMetadata {
    pub session_name_prefix: String,
    /// RFC 3339 timestamp.
    pub created_at: String,
    pub num_managers: usize,
    /// Full session names, in start order.
    pub sessions: Vec<String>,
    pub manager_type: ManagerType,
    pub backend: BackendKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
}

/// What one session manager looked like when saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_name: String,
    #[serde(with = "crate::layout::tab_map")]
    pub tab_config: Vec<TabSpec>,
    pub artifact_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerState {
    /// Keyed by the un-prefixed session name.
    pub layouts: SessionLayouts,
    pub metadata: ManagerMetadata,
    pub sessions: Vec<SessionRecord>,
}

/// 8 hex characters.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn check_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(MuxError::Validation(format!("invalid saved session id: {id:?}")))
    }
}

pub fn state_dir(root: &Path, id: &str) -> PathBuf {
    root.join(id)
}

fn record_file_name(index: usize, session_name: &str) -> String {
    format!("manager_{index}_{}.json", file_safe(session_name))
}

/// Index encoded in a `manager_<i>_<name>.json` file name.
fn record_index(file_name: &str) -> Option<usize> {
    let rest = file_name.strip_prefix("manager_")?;
    let (index, _) = rest.split_once('_')?;
    index.parse().ok()
}

/// Write JSON through a temp file and rename so readers never see a torn file.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(value)?;
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let tmp_name = format!(
        ".{}.{}.{}.tmp",
        path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed),
    );
    let tmp_path = path.with_file_name(tmp_name);
    tokio::fs::write(&tmp_path, json).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| MuxError::persistence(path, format!("cannot read file: {e}")))?;
    serde_json::from_str(&contents)
        .map_err(|e| MuxError::persistence(path, format!("malformed JSON: {e}")))
}

/// Write the three artifacts under `<root>/<id>/`. Returns the directory.
pub async fn save_state(root: &Path, id: &str, state: &ManagerState) -> Result<PathBuf> {
    check_id(id)?;
    let dir = state_dir(root, id);
    write_json(&dir.join(LAYOUTS_FILE), &state.layouts).await?;
    write_json(&dir.join(METADATA_FILE), &state.metadata).await?;

    let sessions_dir = dir.join(SESSIONS_DIR);
    // Drop records of an earlier save under the same id.
    if tokio::fs::try_exists(&sessions_dir).await? {
        tokio::fs::remove_dir_all(&sessions_dir).await?;
    }
    for (index, record) in state.sessions.iter().enumerate() {
        let path = sessions_dir.join(record_file_name(index, &record.session_name));
        write_json(&path, record).await?;
    }
    tracing::info!(id, path = %dir.display(), sessions = state.sessions.len(), "manager state saved");
    Ok(dir)
}

pub async fn load_state(root: &Path, id: &str) -> Result<ManagerState> {
    check_id(id)?;
    let dir = state_dir(root, id);
    if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
        return Err(MuxError::persistence(&dir, "saved session directory not found"));
    }
    let layouts: SessionLayouts = read_json(&dir.join(LAYOUTS_FILE)).await?;
    let metadata: ManagerMetadata = read_json(&dir.join(METADATA_FILE)).await?;

    let mut indexed = Vec::new();
    let sessions_dir = dir.join(SESSIONS_DIR);
    if let Ok(mut entries) = tokio::fs::read_dir(&sessions_dir).await {
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(index) = record_index(&name) {
                match read_json::<SessionRecord>(&entry.path()).await {
                    Ok(record) => indexed.push((index, record)),
                    Err(e) => {
                        tracing::warn!(id, file = %name, error = %e, "skipping unreadable session record")
                    }
                }
            }
        }
    }
    indexed.sort_by_key(|(index, _)| *index);

    tracing::debug!(id, sessions = indexed.len(), "manager state loaded");
    Ok(ManagerState {
        layouts,
        metadata,
        sessions: indexed.into_iter().map(|(_, r)| r).collect(),
    })
}

/// Saved ids under `root`, sorted.
pub async fn list_saved(root: &Path) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() && entry.path().join(METADATA_FILE).exists() {
            ids.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    ids.sort();
    Ok(ids)
}

/// Remove a saved id. Returns false when it did not exist.
pub async fn delete_saved(root: &Path, id: &str) -> Result<bool> {
    check_id(id)?;
    let dir = state_dir(root, id);
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => {
            tracing::info!(id, "saved manager deleted");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LayoutSpec;

    fn state() -> ManagerState {
        let layouts: SessionLayouts = [
            LayoutSpec::from_triples("ci", [("build", "~/proj", "make"), ("watch", "~/proj", "tail -f log")]),
            LayoutSpec::from_triples("ops", [("top", "/", "htop")]),
        ]
        .into_iter()
        .collect();
        let sessions = layouts
            .iter()
            .map(|l| SessionRecord {
                session_name: format!("team_{}", l.session_name()),
                tab_config: l.tabs().to_vec(),
                artifact_path: format!("/tmp/layouts/zellij_layout_team_{}_x.kdl", l.session_name()),
            })
            .collect();
        ManagerState {
            metadata: ManagerMetadata {
                session_name_prefix: "team".to_string(),
                created_at: "2026-10-14T09:00:00+00:00".to_string(),
                num_managers: 2,
                sessions: vec!["team_ci".to_string(), "team_ops".to_string()],
                manager_type: ManagerType::Local,
                backend: BackendKind::Zellij,
                remote_host: None,
            },
            layouts,
            sessions,
        }
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let saved = save_state(dir.path(), "abcd1234", &state()).await.unwrap();
        assert!(saved.join(LAYOUTS_FILE).exists());
        assert!(saved.join("managers/manager_0_team_ci.json").exists());
        assert!(saved.join("managers/manager_1_team_ops.json").exists());

        let loaded = load_state(dir.path(), "abcd1234").await.unwrap();
        assert_eq!(loaded, state());
    }

    #[tokio::test]
    async fn files_use_the_documented_shape() {
        let dir = tempfile::tempdir().unwrap();
        let saved = save_state(dir.path(), "abcd1234", &state()).await.unwrap();

        let meta: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(saved.join(METADATA_FILE)).unwrap()).unwrap();
        assert_eq!(meta["sessionNamePrefix"], "team");
        assert_eq!(meta["numManagers"], 2);
        assert_eq!(meta["managerType"], "local");
        assert!(meta.get("remoteHost").is_none());

        let record: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(saved.join("managers/manager_0_team_ci.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(record["sessionName"], "team_ci");
        assert_eq!(record["tabConfig"]["watch"][1], "tail -f log");
        assert!(record["artifactPath"].as_str().unwrap().ends_with(".kdl"));
    }

    #[tokio::test]
    async fn resaving_drops_stale_records() {
        let dir = tempfile::tempdir().unwrap();
        save_state(dir.path(), "abcd1234", &state()).await.unwrap();
        let mut smaller = state();
        smaller.sessions.truncate(1);
        save_state(dir.path(), "abcd1234", &smaller).await.unwrap();
        let loaded = load_state(dir.path(), "abcd1234").await.unwrap();
        assert_eq!(loaded.sessions.len(), 1);
    }

    #[tokio::test]
    async fn unreadable_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let saved = save_state(dir.path(), "abcd1234", &state()).await.unwrap();
        std::fs::write(saved.join("managers/manager_1_team_ops.json"), "{nope").unwrap();

        let loaded = load_state(dir.path(), "abcd1234").await.unwrap();
        assert_eq!(loaded.sessions.len(), 1);
        assert_eq!(loaded.sessions[0].session_name, "team_ci");
        assert_eq!(loaded.layouts, state().layouts);
    }

    #[tokio::test]
    async fn missing_id_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_state(dir.path(), "deadbeef").await.unwrap_err();
        assert!(matches!(err, MuxError::Persistence { .. }));
    }

    #[tokio::test]
    async fn missing_metadata_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let saved = save_state(dir.path(), "abcd1234", &state()).await.unwrap();
        std::fs::remove_file(saved.join(METADATA_FILE)).unwrap();
        let err = load_state(dir.path(), "abcd1234").await.unwrap_err();
        assert!(err.to_string().contains("metadata.json"), "{err}");
    }

    #[tokio::test]
    async fn list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_saved(&dir.path().join("absent")).await.unwrap().is_empty());
        save_state(dir.path(), "bbbb2222", &state()).await.unwrap();
        save_state(dir.path(), "aaaa1111", &state()).await.unwrap();
        std::fs::create_dir(dir.path().join("not-a-save")).unwrap();
        assert_eq!(list_saved(dir.path()).await.unwrap(), vec!["aaaa1111", "bbbb2222"]);

        assert!(delete_saved(dir.path(), "aaaa1111").await.unwrap());
        assert!(!delete_saved(dir.path(), "aaaa1111").await.unwrap());
        assert_eq!(list_saved(dir.path()).await.unwrap(), vec!["bbbb2222"]);
    }

    #[tokio::test]
    async fn ids_cannot_escape_the_root() {
        let dir = tempfile::tempdir().unwrap();
        for id in ["../x", "", "a/b"] {
            let err = delete_saved(dir.path(), id).await.unwrap_err();
            assert!(matches!(err, MuxError::Validation(_)), "{id:?}");
        }
    }

    #[test]
    fn session_ids_are_eight_hex_chars() {
        let id = new_session_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(record_index("manager_12_team_ci.json"), Some(12));
        assert_eq!(record_index("notes.json"), None);
    }
}
