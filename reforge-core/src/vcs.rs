//! Version-control collaborator.
//!
//! Repository discovery and branch names come from `gix`; working-tree
//! status and branch creation shell out to the `git` binary.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::VcsError;

/// What the orchestrator needs from version control.
pub trait VersionControl: Send + Sync + std::fmt::Debug {
    /// True when the working tree has no staged, unstaged or untracked changes.
    fn is_clean(&self) -> Result<bool, VcsError>;

    /// Short name of the checked-out branch, `None` on a detached HEAD.
    fn current_branch(&self) -> Result<Option<String>, VcsError>;

    /// Create `name` from HEAD and check it out.
    fn create_branch(&self, name: &str) -> Result<(), VcsError>;
}

/// Git repository rooted at (or above) a project directory.
#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
}

impl GitCli {
    /// Locate the repository containing `path`.
    pub fn discover(path: &Path) -> Result<Self, VcsError> {
        let repo = gix::discover(path)
            .map_err(|e| VcsError::NotARepository(format!("{}: {e}", path.display())))?;
        debug!(git_dir = %repo.git_dir().display(), "Discovered repository");
        Ok(Self {
            root: path.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn git(&self, args: &[&str]) -> Result<String, VcsError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()?;
        if !output.status.success() {
            return Err(VcsError::Command {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl VersionControl for GitCli {
    fn is_clean(&self) -> Result<bool, VcsError> {
        let status = self.git(&["status", "--porcelain"])?;
        Ok(status.trim().is_empty())
    }

    fn current_branch(&self) -> Result<Option<String>, VcsError> {
        let repo =
            gix::discover(&self.root).map_err(|e| VcsError::NotARepository(e.to_string()))?;
        let head = repo
            .head_name()
            .map_err(|e| VcsError::NotARepository(e.to_string()))?;
        Ok(head.map(|name| name.shorten().to_string()))
    }

    fn create_branch(&self, name: &str) -> Result<(), VcsError> {
        self.git(&["checkout", "-b", name])?;
        debug!(branch = name, "Created branch");
        Ok(())
    }
}

/// Branch name for a run: `<prefix><symbol>-<yyyymmdd-hhmmss>`.
pub fn branch_name(prefix: &str, symbol: &str, at: chrono::DateTime<chrono::Utc>) -> String {
    format!("{prefix}{symbol}-{}", at.format("%Y%m%d-%H%M%S"))
}
