use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::backend::{file_safe, BackendKind, MultiplexerBackend};
use crate::error::Result;
use crate::layout::LayoutSpec;
use crate::shell::random_suffix;

/// Files written for one session launch. Never rewritten after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedArtifact {
    pub session_name: String,
    pub backend: BackendKind,
    /// File handed to the backend's start command.
    pub path: PathBuf,
    /// Additional launcher files with the same command (Windows Terminal `.bat`).
    pub companions: Vec<PathBuf>,
    /// Hex sha256 of the primary file contents.
    pub content_hash: String,
    pub suffix: String,
}

/// `<stem>_<session>_<suffix>.<ext>`
pub fn artifact_file_name(
    backend: &dyn MultiplexerBackend,
    session_name: &str,
    suffix: &str,
    extension: &str,
) -> String {
    format!(
        "{}_{}_{}.{}",
        backend.file_stem(),
        file_safe(session_name),
        suffix,
        extension
    )
}

/// Turns layouts into backend-native artifacts.
#[derive(Clone)]
pub struct LayoutGenerator {
    backend: &'static dyn MultiplexerBackend,
    artifact_root: PathBuf,
    home: Option<PathBuf>,
}

impl LayoutGenerator {
    /// `home` is the directory `~` expands to on the host that runs the layout.
    pub fn new(kind: BackendKind, artifact_root: impl Into<PathBuf>, home: Option<PathBuf>) -> Self {
        Self {
            backend: kind.backend(),
            artifact_root: artifact_root.into(),
            home,
        }
    }

    pub fn backend(&self) -> &'static dyn MultiplexerBackend {
        self.backend
    }

    pub fn artifact_root(&self) -> &Path {
        &self.artifact_root
    }

    /// Exactly the primary file contents `generate` would write, without touching disk.
    pub fn preview(&self, layout: &LayoutSpec) -> Result<String> {
        layout.validate()?;
        let body = self.backend.render(layout, self.home.as_deref());
        Ok(self
            .backend
            .artifact_files(layout.session_name(), &body)
            .into_iter()
            .next()
            .map(|f| f.contents)
            .unwrap_or(body))
    }

    /// Validate, render and write a freshly suffixed artifact.
    pub async fn generate(&self, layout: &LayoutSpec) -> Result<GeneratedArtifact> {
        layout.validate()?;
        let body = self.backend.render(layout, self.home.as_deref());
        let files = self.backend.artifact_files(layout.session_name(), &body);
        let suffix = random_suffix();

        tokio::fs::create_dir_all(&self.artifact_root).await?;
        let mut paths = Vec::with_capacity(files.len());
        for file in &files {
            let name = artifact_file_name(self.backend, layout.session_name(), &suffix, file.extension);
            let path = self.artifact_root.join(name);
            write_new(&path, &file.contents).await?;
            paths.push(path);
        }

        let primary = files.first().map(|f| f.contents.as_str()).unwrap_or_default();
        let content_hash = hex::encode(Sha256::digest(primary.as_bytes()));
        let mut paths = paths.into_iter();
        let path = paths.next().unwrap_or_default();

        tracing::info!(
            session = layout.session_name(),
            backend = %self.backend.kind(),
            path = %path.display(),
            tabs = layout.len(),
            "layout artifact written"
        );

        Ok(GeneratedArtifact {
            session_name: layout.session_name().to_string(),
            backend: self.backend.kind(),
            path,
            companions: paths.collect(),
            content_hash,
            suffix,
        })
    }
}

/// Create `path`, failing if it already exists so a file in use is never overwritten.
async fn write_new(path: &Path, contents: &str) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(contents.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
