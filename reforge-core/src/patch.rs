//! Staged, validated, atomic replacement of the target implementation.
//!
//! Each target file owns exactly one backup slot under the run's artifact
//! directory. Taking a backup overwrites the slot; nothing accumulates.

use std::path::{Path, PathBuf};

use similar::TextDiff;
use tracing::{debug, info, warn};

use crate::config::BackupRetention;
use crate::context::{ArtifactKind, RunContext};
use crate::error::PatchError;
use crate::syntax::validate_python;

#[derive(Debug)]
pub struct PatchApplier<'a> {
    ctx: &'a RunContext,
}

impl<'a> PatchApplier<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self { ctx }
    }

    /// The single backup slot for `file`.
    pub fn backup_slot(&self, file: &Path) -> PathBuf {
        let flat = self.ctx.relative(file).replace('/', "__");
        self.ctx.backup_dir().join(format!("{flat}.bak"))
    }

    pub fn has_backup(&self, file: &Path) -> bool {
        self.backup_slot(file).is_file()
    }

    /// Validate `new_code`, optionally back up the current file, then swap
    /// the new content in atomically. Invalid code is never written. When
    /// the write fails after a backup was taken, the backup is restored
    /// before the error is returned.
    pub fn apply(&self, file: &Path, new_code: &str, backup: bool) -> Result<(), PatchError> {
        validate_python(new_code)?;

        if backup {
            self.take_backup(file)?;
        }

        if let Err(source) = write_atomic(file, new_code) {
            let restored = backup && self.restore(file).is_ok();
            warn!(file = %file.display(), error = %source, restored, "Patch write failed");
            return Err(PatchError::Write {
                path: file.to_path_buf(),
                restored,
                source,
            });
        }

        info!(file = %file.display(), bytes = new_code.len(), backup, "Patch applied");
        Ok(())
    }

    fn take_backup(&self, file: &Path) -> Result<(), PatchError> {
        let slot = self.backup_slot(file);
        let backup_err = |e: std::io::Error| PatchError::Backup {
            path: slot.clone(),
            message: e.to_string(),
        };
        std::fs::create_dir_all(self.ctx.backup_dir()).map_err(backup_err)?;
        std::fs::copy(file, &slot).map_err(backup_err)?;
        debug!(slot = %slot.display(), "Backup slot written");
        Ok(())
    }

    /// Copy the backup slot back over `file`. Falls back to an in-place
    /// write when the atomic swap itself is what failed.
    pub fn restore(&self, file: &Path) -> Result<(), PatchError> {
        let slot = self.backup_slot(file);
        let content = std::fs::read(&slot).map_err(|e| PatchError::Backup {
            path: slot.clone(),
            message: format!("cannot read backup: {e}"),
        })?;
        if let Err(e) = write_atomic(file, &content) {
            debug!(error = %e, "Atomic restore failed, writing in place");
            std::fs::write(file, &content).map_err(|source| PatchError::Write {
                path: file.to_path_buf(),
                restored: false,
                source,
            })?;
        }
        info!(file = %file.display(), "Restored from backup slot");
        Ok(())
    }

    /// Apply the retention policy to the slot after a converged run.
    pub fn retain(&self, file: &Path, retention: BackupRetention) -> Result<(), PatchError> {
        match retention {
            BackupRetention::Keep => Ok(()),
            BackupRetention::DiscardOnSuccess => {
                let slot = self.backup_slot(file);
                match std::fs::remove_file(&slot) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(PatchError::Backup {
                        path: slot,
                        message: e.to_string(),
                    }),
                }
            }
        }
    }

    /// Persist the unified diff between `original` and `new` as the run's
    /// diff artifact.
    pub fn save_diff(
        &self,
        file: &Path,
        original: &str,
        new: &str,
    ) -> crate::error::Result<PathBuf> {
        let label = self.ctx.relative(file);
        let diff = unified_diff(&label, original, new);
        Ok(self.ctx.write_text(ArtifactKind::Diff, &diff)?)
    }
}

/// Unified diff with `a/` and `b/` headers and three lines of context.
pub fn unified_diff(label: &str, original: &str, new: &str) -> String {
    TextDiff::from_lines(original, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{label}"), &format!("b/{label}"))
        .to_string()
}

/// Write to a sibling temp file, then rename over `path`.
fn write_atomic(path: &Path, content: impl AsRef<[u8]>) -> std::io::Result<()> {
    let name = path
        .file_name()
        .map_or_else(|| "target".into(), |n| n.to_string_lossy().into_owned());
    let tmp = path.with_file_name(format!(".{name}.reforge.tmp"));
    std::fs::write(&tmp, content)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}
