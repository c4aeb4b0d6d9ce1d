//! Per-call scratch directories for data handed across the process boundary.
//!
//! Every generator or comparator call gets its own uniquely named directory
//! under a shared root. The directory and everything in it is removed when
//! the [`CallScope`] drops, whichever way the call exits.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const SCOPE_PREFIX: &str = "recall-call-";

/// Root under which call scopes are created.
#[derive(Debug, Clone)]
pub struct ScratchRoot {
    base: PathBuf,
}

impl ScratchRoot {
    /// Use `base` as the root, creating it (mode 0700) if needed.
    pub fn new(base: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base = base.into();
        std::fs::create_dir_all(&base)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&base, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self { base })
    }

    pub fn path(&self) -> &Path {
        &self.base
    }

    /// Acquire a fresh scope for one call. `label` only aids debugging.
    pub fn scope(&self, label: &str) -> std::io::Result<CallScope> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{SCOPE_PREFIX}{label}-"))
            .tempdir_in(&self.base)?;
        tracing::trace!(dir = %dir.path().display(), "call scope acquired");
        Ok(CallScope { dir })
    }

    /// Remove scopes left behind by a process that died mid-call.
    ///
    /// Only safe while no calls are in flight under this root; the daemon
    /// runs it once at startup. Returns the number of scopes removed.
    pub fn sweep_stale(&self) -> std::io::Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.base)? {
            let entry = entry?;
            let is_scope = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(SCOPE_PREFIX));
            if is_scope && entry.file_type()?.is_dir() {
                match std::fs::remove_dir_all(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(err) => tracing::warn!(
                        path = %entry.path().display(),
                        error = %err,
                        "failed to remove stale call scope"
                    ),
                }
            }
        }
        Ok(removed)
    }
}

/// A call's private directory. Removed on drop.
#[derive(Debug)]
pub struct CallScope {
    dir: TempDir,
}

impl CallScope {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `bytes` to `name` inside the scope and return its path.
    pub fn write(&self, name: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
        let path = self.dir.path().join(name);
        let mut file = File::create(&path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(path)
    }

    /// Create an empty file inside the scope, e.g. to capture a child's output.
    pub fn create(&self, name: &str) -> std::io::Result<(PathBuf, File)> {
        let path = self.dir.path().join(name);
        let file = File::create(&path)?;
        Ok((path, file))
    }
}
