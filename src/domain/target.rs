//! Named pipe targets.

use std::fmt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Filesystem path of a pre-existing named pipe.
///
/// The pipe is provisioned externally; the relay never creates or removes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipeTarget {
    path: PathBuf,
}

impl PipeTarget {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the path currently exists and is a FIFO
    pub fn is_fifo(&self) -> bool {
        std::fs::metadata(&self.path)
            .map(|meta| meta.file_type().is_fifo())
            .unwrap_or(false)
    }
}

impl fmt::Display for PipeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl From<PathBuf> for PipeTarget {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

impl From<&Path> for PipeTarget {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}
