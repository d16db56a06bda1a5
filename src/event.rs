//! Normalized directory change events.

use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

/// The kind of change a [`DirEvent`](DirEvent) describes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum DirEventKind {
    Added,
    /// Also reported for a watched directory that is deleted; it is dropped from the watch set
    /// on the next change to it.
    Removed,
    Modified,
    /// First half of a correlated rename. Always immediately followed by a
    /// [`RenamedNewName`](DirEventKind::RenamedNewName).
    RenamedOldName,
    RenamedNewName,
    /// The backend lost track of what happened below `path`.
    ///
    /// Consumers should re-enumerate the directory instead of trusting incremental state.
    RecursiveRescan,
}

impl Display for DirEventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Added => "ADDED",
            Self::Removed => "REMOVED",
            Self::Modified => "MODIFIED",
            Self::RenamedOldName => "RENAMED (OLD NAME)",
            Self::RenamedNewName => "RENAMED (NEW NAME)",
            Self::RecursiveRescan => "RESCAN DIR",
        })
    }
}

/// A change observed in a watched directory.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct DirEvent {
    /// Absolute path of the affected entry.
    pub path: PathBuf,
    pub kind: DirEventKind,
}

impl DirEvent {
    pub fn new(path: impl Into<PathBuf>, kind: DirEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    pub fn added(path: impl Into<PathBuf>) -> Self {
        Self::new(path, DirEventKind::Added)
    }

    pub fn removed(path: impl Into<PathBuf>) -> Self {
        Self::new(path, DirEventKind::Removed)
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self::new(path, DirEventKind::Modified)
    }

    pub fn renamed_old_name(path: impl Into<PathBuf>) -> Self {
        Self::new(path, DirEventKind::RenamedOldName)
    }

    pub fn renamed_new_name(path: impl Into<PathBuf>) -> Self {
        Self::new(path, DirEventKind::RenamedNewName)
    }

    pub fn rescan(path: impl Into<PathBuf>) -> Self {
        Self::new(path, DirEventKind::RecursiveRescan)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Display for DirEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {:?}", self.kind, self.path)
    }
}
