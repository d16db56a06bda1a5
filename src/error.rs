//! Error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The path given to [`add_directory`](crate::Watcher::add_directory) does not name an
    /// existing directory.
    #[error("not an existing directory: {path:?}")]
    Path {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The native notification mechanism could not be set up.
    #[error("unable to initialize backend{}", .path.as_ref().map(|p| format!(" for {:?}", p)).unwrap_or_default())]
    Backend {
        path: Option<PathBuf>,
        #[source]
        source: io::Error,
    },
    /// The event queue has been closed, usually because the watcher was dropped.
    #[error("operation aborted")]
    Aborted,
    /// Another consumer of the same kind is already waiting on this watcher.
    #[error("another request is already pending on this watcher")]
    Busy,
    /// `async_pop` was called on a watcher built without a reactor.
    #[error("no reactor bound to this watcher")]
    NoReactor,
}

impl Error {
    pub(crate) fn backend(source: io::Error) -> Self {
        Self::Backend { path: None, source }
    }

    pub(crate) fn backend_at(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Backend {
            path: Some(path.into()),
            source,
        }
    }

    /// The OS error code carried by a [`Path`](Error::Path) or [`Backend`](Error::Backend) error.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Path { source, .. } | Self::Backend { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    pub const fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn must_expose_os_error_code() {
        let err = Error::backend_at("/nowhere", io::Error::from_raw_os_error(2));
        assert_eq!(err.raw_os_error(), Some(2));
        assert_eq!(err.to_string(), "unable to initialize backend for \"/nowhere\"");
        assert_eq!(Error::Aborted.raw_os_error(), None);
        assert!(Error::Aborted.is_aborted());
    }
}
