//! Per-run artifact namespace.
//!
//! Every component that persists something receives a [`RunContext`]
//! instead of reaching for a shared output directory. Artifacts are
//! written wholesale; a re-run overwrites them.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::ArtifactError;

/// Files a run may produce inside its artifact directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    ImpactReport,
    Plan,
    Diff,
    BaselineLog,
    AlternateLog,
    Iterations,
    Evidence,
}

impl ArtifactKind {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::ImpactReport => "impact.json",
            Self::Plan => "plan.json",
            Self::Diff => "diff.patch",
            Self::BaselineLog => "test_baseline.log",
            Self::AlternateLog => "test_alternate.log",
            Self::Iterations => "iterations.json",
            Self::Evidence => "EVIDENCE.md",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    project_root: PathBuf,
    artifacts_dir: PathBuf,
}

impl RunContext {
    /// `artifacts_dir` is resolved against `project_root` when relative.
    pub fn new(project_root: impl Into<PathBuf>, artifacts_dir: impl AsRef<Path>) -> Self {
        let project_root = project_root.into();
        let artifacts_dir = project_root.join(artifacts_dir);
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            project_root,
            artifacts_dir,
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    pub fn artifact_path(&self, kind: ArtifactKind) -> PathBuf {
        self.artifacts_dir.join(kind.file_name())
    }

    /// Directory holding the single backup slot of each patched file.
    pub fn backup_dir(&self) -> PathBuf {
        self.artifacts_dir.join("backup")
    }

    /// Path relative to the project root, `/`-separated.
    pub fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.project_root).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn write_text(&self, kind: ArtifactKind, content: &str) -> Result<PathBuf, ArtifactError> {
        let path = self.artifact_path(kind);
        std::fs::create_dir_all(&self.artifacts_dir).map_err(|source| ArtifactError::Write {
            path: self.artifacts_dir.clone(),
            source,
        })?;
        std::fs::write(&path, content).map_err(|source| ArtifactError::Write {
            path: path.clone(),
            source,
        })?;
        debug!(artifact = kind.file_name(), bytes = content.len(), "Wrote artifact");
        Ok(path)
    }

    pub fn write_json<T: Serialize>(
        &self,
        kind: ArtifactKind,
        value: &T,
    ) -> Result<PathBuf, ArtifactError> {
        let text = serde_json::to_string_pretty(value)?;
        self.write_text(kind, &text)
    }
}
