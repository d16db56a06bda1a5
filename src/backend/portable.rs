//! Backend for targets without a dedicated native binding (Windows, the BSDs, ...).
//!
//! Delegates to the platform watcher chosen by the `notify` crate (`ReadDirectoryChangesW`,
//! kqueue, ...) and normalizes its events. A ticker thread settles rename halves whose partner
//! did not show up within the configured latency.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, trace};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::Mutex;

use crate::backend::rename::RenamePairer;
use crate::backend::{nearest_watched_ancestor, Backend};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::DirEvent;
use crate::queue::EventQueue;

fn into_io_error(e: notify::Error) -> io::Error {
    match e.kind {
        notify::ErrorKind::Io(e) => e,
        notify::ErrorKind::PathNotFound | notify::ErrorKind::WatchNotFound => {
            io::Error::from(io::ErrorKind::NotFound)
        }
        other => io::Error::new(io::ErrorKind::Other, format!("{:?}", other)),
    }
}

/// `None` once the session is stopped, so late callbacks from the native watcher are dropped.
type Sink = Arc<Mutex<Option<Normalizer>>>;

struct Session {
    watcher: RecommendedWatcher,
    sink: Sink,
    running: Arc<AtomicBool>,
    ticker: thread::JoinHandle<()>,
}

impl Session {
    fn stop(self) {
        drop(self.watcher);
        if let Some(mut normalizer) = self.sink.lock().take() {
            normalizer.settle();
        }

        self.running.store(false, Ordering::Release);
        self.ticker.thread().unpark();
        if self.ticker.join().is_err() {
            error!("Rename ticker panicked");
        }
    }
}

pub struct PortableBackend {
    latency: Duration,
    session: Option<Session>,
}

impl PortableBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            latency: config.latency,
            session: None,
        }
    }
}

impl Backend for PortableBackend {
    fn start(&mut self, paths: &[PathBuf], queue: &Arc<EventQueue>) -> Result<()> {
        self.stop();
        if paths.is_empty() {
            return Ok(());
        }

        let sink: Sink = Arc::new(Mutex::new(Some(Normalizer::new(
            paths.to_vec(),
            Arc::clone(queue),
        ))));

        let handler_sink = Arc::clone(&sink);
        let mut watcher = RecommendedWatcher::new(
            move |event: notify::Result<notify::Event>| match event {
                Ok(event) => {
                    if let Some(normalizer) = handler_sink.lock().as_mut() {
                        normalizer.handle(event);
                    }
                }
                Err(e) => error!("Notify watcher error: {}", e),
            },
            notify::Config::default(),
        )
        .map_err(|e| Error::backend(into_io_error(e)))?;

        for path in paths {
            watcher
                .watch(path, RecursiveMode::NonRecursive)
                .map_err(|e| Error::backend_at(path, into_io_error(e)))?;
        }

        let running = Arc::new(AtomicBool::new(true));
        let ticker = {
            let sink = Arc::clone(&sink);
            let running = Arc::clone(&running);
            let latency = self.latency;
            #[cfg(test)]
            crate::backend::TEST_RUNNING_WORKER_COUNT.fetch_add(1, Ordering::SeqCst);
            thread::Builder::new()
                .name("dir-monitor-ticker".into())
                .spawn(move || {
                    while running.load(Ordering::Acquire) {
                        thread::park_timeout(latency);
                        if let Some(normalizer) = sink.lock().as_mut() {
                            normalizer.settle_expired(latency);
                        }
                    }

                    #[cfg(test)]
                    crate::backend::TEST_RUNNING_WORKER_COUNT.fetch_sub(1, Ordering::SeqCst);
                })
                .map_err(|e| {
                    #[cfg(test)]
                    crate::backend::TEST_RUNNING_WORKER_COUNT.fetch_sub(1, Ordering::SeqCst);
                    Error::backend(e)
                })?
        };

        debug!("Watching {} director(ies) with notify", paths.len());
        self.session = Some(Session {
            watcher,
            sink,
            running,
            ticker,
        });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.stop();
        }
    }
}

impl Drop for PortableBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Normalizer {
    roots: Vec<PathBuf>,
    queue: Arc<EventQueue>,
    pairer: RenamePairer<Option<usize>>,
    pending_since: Option<Instant>,
}

impl Normalizer {
    fn new(roots: Vec<PathBuf>, queue: Arc<EventQueue>) -> Self {
        Self {
            roots,
            queue,
            pairer: RenamePairer::default(),
            pending_since: None,
        }
    }

    fn ancestor(&self, path: &Path) -> PathBuf {
        nearest_watched_ancestor(&self.roots, path)
    }

    fn settle(&mut self) {
        self.pairer.settle(&self.queue);
        self.pending_since = None;
    }

    fn settle_expired(&mut self, latency: Duration) {
        if self.pending_since.map_or(false, |since| since.elapsed() >= latency) {
            self.settle();
        }
    }

    fn handle(&mut self, event: notify::Event) {
        trace!("{:?}", event);
        let tracker = event.attrs.tracker();

        if event.need_rescan() {
            self.settle();
            let targets: Vec<_> = match event.paths.first() {
                Some(path) => vec![self.ancestor(path)],
                None => self.roots.clone(),
            };
            for target in targets {
                self.queue.push(DirEvent::rescan(target));
            }
            return;
        }

        match event.kind {
            EventKind::Modify(ModifyKind::Name(mode)) => {
                let mut paths = event.paths.into_iter();
                match (mode, paths.next(), paths.next()) {
                    (RenameMode::Both, Some(from), Some(to)) => {
                        self.settle();
                        self.queue.push(DirEvent::renamed_old_name(from));
                        self.queue.push(DirEvent::renamed_new_name(to));
                    }
                    (RenameMode::From, Some(from), _) => {
                        let ancestor = self.ancestor(&from);
                        self.pairer.old_name(tracker, from, ancestor, &self.queue);
                    }
                    (RenameMode::To, Some(to), _) => {
                        let ancestor = self.ancestor(&to);
                        self.pairer.new_name(tracker, to, ancestor, &self.queue);
                    }
                    (_, Some(path), _) => {
                        let ancestor = self.ancestor(&path);
                        self.pairer.either(tracker, path, ancestor, &self.queue);
                    }
                    (_, None, _) => {}
                }
                self.pending_since = if self.pairer.is_pending() {
                    self.pending_since.or_else(|| Some(Instant::now()))
                } else {
                    None
                };
            }
            EventKind::Create(_) => {
                self.settle();
                for path in event.paths {
                    self.queue.push(DirEvent::added(path));
                }
            }
            EventKind::Remove(_) => {
                self.settle();
                for path in event.paths {
                    self.queue.push(DirEvent::removed(path));
                }
            }
            // Metadata-only changes are outside the common vocabulary.
            EventKind::Modify(ModifyKind::Metadata(_)) => {}
            EventKind::Modify(_) => {
                self.settle();
                for path in event.paths {
                    self.queue.push(DirEvent::modified(path));
                }
            }
            EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use notify::event::{CreateKind, DataChange, RemoveKind};

    use super::*;

    fn drain(queue: &EventQueue) -> Vec<DirEvent> {
        std::iter::from_fn(|| queue.try_pop().and_then(Result::ok)).collect()
    }

    #[test]
    fn must_normalize_notify_events() {
        let queue = Arc::new(EventQueue::new());
        let mut n = Normalizer::new(vec!["/w".into()], Arc::clone(&queue));
        n.handle(notify::Event::new(EventKind::Create(CreateKind::File)).add_path("/w/a".into()));
        n.handle(
            notify::Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
                .add_path("/w/a".into()),
        );
        n.handle(
            notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
                .add_path("/w/a".into()),
        );
        n.handle(
            notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
                .add_path("/w/b".into()),
        );
        n.handle(notify::Event::new(EventKind::Remove(RemoveKind::File)).add_path("/w/b".into()));

        assert_eq!(
            drain(&queue),
            [
                DirEvent::added("/w/a"),
                DirEvent::modified("/w/a"),
                DirEvent::renamed_old_name("/w/a"),
                DirEvent::renamed_new_name("/w/b"),
                DirEvent::removed("/w/b"),
            ]
        );
    }

    #[test]
    fn must_settle_expired_rename_half() {
        let queue = Arc::new(EventQueue::new());
        let mut n = Normalizer::new(vec!["/w".into()], Arc::clone(&queue));
        n.handle(
            notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
                .add_path("/w/a".into()),
        );
        n.settle_expired(Duration::ZERO);

        assert_eq!(drain(&queue), [DirEvent::rescan("/w")]);
    }
}
