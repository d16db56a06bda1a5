//! Platform notification backends.
//!
//! Every backend turns a native mechanism into [`DirEvent`](crate::DirEvent)s pushed into an
//! [`EventQueue`](EventQueue). The one matching the target is exported as
//! [`PlatformBackend`](PlatformBackend).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;
use crate::queue::EventQueue;

pub(crate) mod rename;

#[cfg(target_os = "macos")]
mod fsevent;
#[cfg(any(target_os = "linux", target_os = "android"))]
mod inotify;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
mod portable;

#[cfg(target_os = "macos")]
pub use self::fsevent::FsEventBackend as PlatformBackend;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use self::inotify::InotifyBackend as PlatformBackend;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
pub use self::portable::PortableBackend as PlatformBackend;

#[cfg(test)]
pub(crate) static TEST_RUNNING_WORKER_COUNT: std::sync::atomic::AtomicUsize =
    std::sync::atomic::AtomicUsize::new(0);

/// A native notification mechanism.
pub trait Backend: Send {
    /// Begin delivering events for exactly `paths` into `queue`.
    ///
    /// An empty `paths` is valid and creates no native resources.
    ///
    /// # Errors
    /// Return [`Error::Backend`](crate::Error::Backend) when the native mechanism can't be set up.
    fn start(&mut self, paths: &[PathBuf], queue: &Arc<EventQueue>) -> Result<()>;

    /// Halt delivery and release native resources.
    ///
    /// Once this returns no further event from the previous `start` reaches the queue. Calling
    /// it multiple times, or without a successful `start`, has no effect.
    fn stop(&mut self);
}

/// The longest of `roots` containing `path`, or the parent of `path` if none does.
pub(crate) fn nearest_watched_ancestor(roots: &[PathBuf], path: &Path) -> PathBuf {
    roots
        .iter()
        .filter(|root| path.starts_with(root))
        .max_by_key(|root| root.components().count())
        .cloned()
        .unwrap_or_else(|| path.parent().unwrap_or(path).to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn must_pick_deepest_watched_root() {
        let roots = vec![PathBuf::from("/a"), PathBuf::from("/a/b"), PathBuf::from("/c")];
        assert_eq!(
            nearest_watched_ancestor(&roots, Path::new("/a/b/x/y")),
            PathBuf::from("/a/b")
        );
        assert_eq!(
            nearest_watched_ancestor(&roots, Path::new("/a/bb")),
            PathBuf::from("/a")
        );
        assert_eq!(
            nearest_watched_ancestor(&roots, Path::new("/elsewhere/f")),
            PathBuf::from("/elsewhere")
        );
    }
}
