//! The watcher: watch set management and the synchronous interface.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::backend::{Backend, PlatformBackend};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::DirEvent;
use crate::queue::EventQueue;

/// Builder for a [`Watcher`](Watcher).
#[derive(Debug, Default)]
pub struct WatcherBuilder {
    config: Config,
    reactor: Option<Handle>,
}

impl WatcherBuilder {
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn latency(mut self, latency: Duration) -> Self {
        self.config.latency = latency;
        self
    }

    /// Bind [`async_pop`](Watcher::async_pop) completions to `reactor`.
    ///
    /// Completions run as tasks spawned on this runtime. With a current-thread runtime they run
    /// on whichever thread drives it.
    #[must_use]
    pub fn reactor(mut self, reactor: Handle) -> Self {
        self.reactor = Some(reactor);
        self
    }

    pub fn build(self) -> Watcher {
        Watcher {
            queue: Arc::new(EventQueue::new()),
            watch_set: Mutex::new(WatchSet::new(PlatformBackend::new(&self.config))),
            reactor: self.reactor,
            async_slot: Arc::new(AtomicBool::new(false)),
        }
    }
}

struct WatchSet<B = PlatformBackend> {
    dirs: HashSet<PathBuf>,
    backend: B,
}

impl<B: Backend> WatchSet<B> {
    fn new(backend: B) -> Self {
        Self {
            dirs: HashSet::new(),
            backend,
        }
    }

    fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.dirs.iter().cloned().collect();
        paths.sort();
        paths
    }

    /// Forget directories that no longer exist, so they can't fail the next start.
    fn prune(&mut self) {
        self.dirs.retain(|dir| {
            let alive = dir.is_dir();
            if !alive {
                warn!("Directory {:?} vanished, no longer watching it", dir);
            }
            alive
        });
    }

    fn restart(&mut self, queue: &Arc<EventQueue>) -> Result<()> {
        // The old native handle must be fully quiesced before the new one starts.
        self.backend.stop();
        self.prune();
        let paths = self.paths();
        self.backend.start(&paths, queue)
    }

    /// Returns `false` if `dir` was already watched.
    fn add(&mut self, dir: PathBuf, queue: &Arc<EventQueue>) -> Result<bool> {
        if !self.dirs.insert(dir.clone()) {
            return Ok(false);
        }
        if let Err(e) = self.restart(queue) {
            self.dirs.remove(&dir);
            if let Err(restore) = self.restart(queue) {
                error!("Unable to restore previous watch set: {}", restore);
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Returns `false` if `dir` wasn't watched.
    fn remove(&mut self, dir: &Path, queue: &Arc<EventQueue>) -> bool {
        if !self.dirs.remove(dir) {
            return false;
        }
        if let Err(e) = self.restart(queue) {
            error!("Unable to restart backend after removing {:?}: {}", dir, e);
        }
        true
    }
}

fn canonical_directory(path: &Path) -> Result<PathBuf> {
    let canonical = path.canonicalize().map_err(|source| Error::Path {
        path: path.to_path_buf(),
        source,
    })?;
    if !canonical.is_dir() {
        return Err(Error::Path {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
        });
    }
    Ok(canonical)
}

/// Best effort for paths that may no longer exist.
fn absolute(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
}

/// Watches a dynamic set of directories and queues their changes.
///
/// Events are retrieved either by blocking with [`pop`](Watcher::pop) or asynchronously with
/// [`async_pop`](Watcher::async_pop), [`next_event`](Watcher::next_event) and
/// [`events`](Watcher::events).
///
/// Dropping the watcher closes its queue, so every waiter, blocked or pending, receives
/// [`Error::Aborted`](Error::Aborted). It then stops the backend and joins its thread.
pub struct Watcher {
    pub(crate) queue: Arc<EventQueue>,
    watch_set: Mutex<WatchSet>,
    pub(crate) reactor: Option<Handle>,
    pub(crate) async_slot: Arc<AtomicBool>,
}

impl Watcher {
    /// A watcher for synchronous use, with the default [`Config`](Config).
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> WatcherBuilder {
        WatcherBuilder::default()
    }

    /// Start watching `path`.
    ///
    /// Adding a directory that is already watched has no effect.
    ///
    /// # Errors
    /// - [`Error::Path`](Error::Path) if `path` is not an existing directory. Nothing changes.
    /// - [`Error::Backend`](Error::Backend) if the backend can't be restarted with `path`.
    ///   Previously watched directories stay watched.
    ///
    /// Watched directories that were deleted in the meantime are dropped from the watch set.
    pub fn add_directory(&self, path: impl AsRef<Path>) -> Result<()> {
        let dir = canonical_directory(path.as_ref())?;
        if self.watch_set.lock().add(dir.clone(), &self.queue)? {
            debug!("Watching {:?}", dir);
        }
        Ok(())
    }

    /// Stop watching `path`. Unknown paths are ignored.
    ///
    /// Events already queued for `path` stay deliverable, and waiters are not woken.
    pub fn remove_directory(&self, path: impl AsRef<Path>) {
        let dir = absolute(path.as_ref());
        if self.watch_set.lock().remove(&dir, &self.queue) {
            debug!("Stopped watching {:?}", dir);
        }
    }

    /// The currently watched directories, in canonical form.
    ///
    /// Directories deleted since they were added are no longer listed.
    pub fn directories(&self) -> Vec<PathBuf> {
        let mut watch_set = self.watch_set.lock();
        watch_set.prune();
        watch_set.paths()
    }

    /// Block until the next event.
    ///
    /// # Errors
    /// [`Error::Aborted`](Error::Aborted) once the watcher is closed and every queued event has
    /// been consumed. [`Error::Busy`](Error::Busy) if another thread is already blocked here.
    pub fn pop(&self) -> Result<DirEvent> {
        self.queue.pop_blocking()
    }

    /// Take the next event if one is queued.
    pub fn try_pop(&self) -> Option<Result<DirEvent>> {
        self.queue.try_pop()
    }

    /// A handle for consuming events from another thread.
    pub fn receiver(&self) -> EventReceiver {
        EventReceiver {
            queue: Arc::clone(&self.queue),
        }
    }

    /// Close the event queue.
    ///
    /// Directories stay watched but new events are discarded; waiters drain what is queued and
    /// then receive [`Error::Aborted`](Error::Aborted).
    pub fn close(&self) {
        self.queue.close();
    }
}

impl Default for Watcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.queue.close();
        self.watch_set.get_mut().backend.stop();
    }
}

/// Consumer side of a [`Watcher`](Watcher) that can be moved to another thread.
///
/// It doesn't keep the watcher alive: once the watcher is dropped, [`pop`](EventReceiver::pop)
/// drains the remaining events and then fails with [`Error::Aborted`](Error::Aborted).
#[derive(Clone)]
pub struct EventReceiver {
    queue: Arc<EventQueue>,
}

impl EventReceiver {
    /// See [`Watcher::pop`](Watcher::pop).
    ///
    /// # Errors
    /// Same as [`Watcher::pop`](Watcher::pop).
    pub fn pop(&self) -> Result<DirEvent> {
        self.queue.pop_blocking()
    }

    pub fn try_pop(&self) -> Option<Result<DirEvent>> {
        self.queue.try_pop()
    }
}
