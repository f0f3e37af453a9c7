//! Run-state directory (sockets, pid files, per-guest state).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

/// Directory name under `$HOME` used when no run directory is configured.
pub const DEFAULT_RUN_DIR_NAME: &str = ".kestrel";

#[derive(Error, Debug)]
pub enum RunDirError {
    #[error("Failed to create run directory {}: {source}", .path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to resolve run directory {}: {source}", .path.display())]
    Resolve {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} exists but is not a directory", .path.display())]
    NotADirectory { path: PathBuf },

    #[error("No run directory configured and $HOME is unset")]
    NoHome,
}

/// A created, canonicalized directory for run-time state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDir {
    path: PathBuf,
}

impl RunDir {
    /// Create `path` (and its parents) if missing and resolve it to an
    /// absolute path without symlinks.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, RunDirError> {
        let path = path.as_ref();
        fs::create_dir_all(path).map_err(|source| RunDirError::Create {
            path: path.to_path_buf(),
            source,
        })?;

        let resolved = fs::canonicalize(path).map_err(|source| RunDirError::Resolve {
            path: path.to_path_buf(),
            source,
        })?;
        if !resolved.is_dir() {
            return Err(RunDirError::NotADirectory { path: resolved });
        }

        debug!("Run directory: {}", resolved.display());
        Ok(Self { path: resolved })
    }

    /// `$HOME/.kestrel`, created if missing.
    pub fn in_home() -> Result<Self, RunDirError> {
        let home = std::env::var_os("HOME").ok_or(RunDirError::NoHome)?;
        Self::create(Path::new(&home).join(DEFAULT_RUN_DIR_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of `name` inside the run directory.
    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }
}
