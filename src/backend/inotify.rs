//! inotify backend for Linux and Android.
//!
//! Each `start` creates a fresh inotify instance with one non-recursive watch per directory and a
//! worker thread polling it. The worker also polls the read end of a pipe; `stop` writes a byte
//! into it and joins the thread, so no event from the old instance is pushed afterwards.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use log::{debug, error, warn};

use crate::backend::rename::RenamePairer;
use crate::backend::Backend;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::DirEvent;
use crate::queue::EventQueue;

const EVENT_BUFFER_SIZE: usize = 4096;

fn watch_mask() -> WatchMask {
    WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::MODIFY
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::DELETE_SELF
        | WatchMask::MOVE_SELF
        | WatchMask::ONLYDIR
        | WatchMask::EXCL_UNLINK
}

fn wake_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [-1; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    // Safety:
    // - `pipe2` succeeded, so both descriptors are open and owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// An owned permission to stop the worker thread of a running inotify instance.
struct Worker {
    waker: OwnedFd,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn stop(self) {
        let byte = 1_u8;
        // A full pipe already means a wake-up is pending, so the result is irrelevant.
        let _ = unsafe { libc::write(self.waker.as_raw_fd(), (&byte as *const u8).cast(), 1) };

        // Wait for the thread to shut down.
        if self.thread.join().is_err() {
            error!("inotify worker panicked");
        }
    }
}

pub struct InotifyBackend {
    latency: Duration,
    worker: Option<Worker>,
}

impl InotifyBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            latency: config.latency,
            worker: None,
        }
    }
}

impl Backend for InotifyBackend {
    fn start(&mut self, paths: &[PathBuf], queue: &Arc<EventQueue>) -> Result<()> {
        self.stop();
        if paths.is_empty() {
            return Ok(());
        }

        let inotify = Inotify::init().map_err(Error::backend)?;
        let mut watches = inotify.watches();
        let mut roots = HashMap::with_capacity(paths.len());
        for path in paths {
            let wd = watches
                .add(path, watch_mask())
                .map_err(|e| Error::backend_at(path, e))?;
            roots.insert(wd, path.clone());
        }

        let (wake, waker) = wake_pipe().map_err(Error::backend)?;
        let session = Session {
            inotify,
            wake,
            roots,
            latency: self.latency,
            normalizer: Normalizer::new(paths.to_vec(), Arc::clone(queue)),
        };

        // Counted before spawning so it is visible once `start` returns.
        #[cfg(test)]
        crate::backend::TEST_RUNNING_WORKER_COUNT
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let thread = thread::Builder::new()
            .name("dir-monitor-inotify".into())
            .spawn(move || session.run())
            .map_err(|e| {
                #[cfg(test)]
                crate::backend::TEST_RUNNING_WORKER_COUNT
                    .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                Error::backend(e)
            })?;

        debug!("Watching {} director(ies) with inotify", paths.len());
        self.worker = Some(Worker { waker, thread });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }
}

impl Drop for InotifyBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Wake {
    Readable,
    Timeout,
    Stop,
}

struct Session {
    inotify: Inotify,
    wake: OwnedFd,
    roots: HashMap<WatchDescriptor, PathBuf>,
    latency: Duration,
    normalizer: Normalizer,
}

impl Session {
    fn run(mut self) {
        let mut buffer = [0_u8; EVENT_BUFFER_SIZE];
        loop {
            // Only wait for a bounded time while a rename half is waiting for its partner.
            let timeout = if self.normalizer.pairer.is_pending() {
                Some(self.latency)
            } else {
                None
            };
            match self.wait(timeout) {
                Ok(Wake::Readable) => {
                    if let Err(e) = self.read(&mut buffer) {
                        error!("Unable to read inotify events: {}", e);
                        break;
                    }
                }
                Ok(Wake::Timeout) => self.normalizer.pairer.settle(&self.normalizer.queue),
                Ok(Wake::Stop) => break,
                Err(e) => {
                    error!("Unable to poll inotify: {}", e);
                    break;
                }
            }
        }

        // Deliver whatever the kernel still holds for this instance.
        while matches!(self.wait(Some(Duration::ZERO)), Ok(Wake::Readable)) {
            if self.read(&mut buffer).is_err() {
                break;
            }
        }
        self.normalizer.pairer.settle(&self.normalizer.queue);

        #[cfg(test)]
        crate::backend::TEST_RUNNING_WORKER_COUNT
            .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn wait(&self, timeout: Option<Duration>) -> io::Result<Wake> {
        let timeout_ms = timeout.map_or(-1, |t| {
            libc::c_int::try_from(t.as_millis()).unwrap_or(libc::c_int::MAX)
        });
        let mut fds = [
            libc::pollfd {
                fd: self.inotify.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.wake.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        // A zero timeout is used while draining on shutdown; the wake pipe is ignored then.
        let nfds = if timeout == Some(Duration::ZERO) { 1 } else { 2 };
        loop {
            let ready = unsafe { libc::poll(fds.as_mut_ptr(), nfds, timeout_ms) };
            if ready == -1 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }
            if ready == 0 {
                return Ok(Wake::Timeout);
            }
            break;
        }
        if fds[1].revents != 0 {
            Ok(Wake::Stop)
        } else if fds[0].revents & libc::POLLIN != 0 {
            Ok(Wake::Readable)
        } else {
            Ok(Wake::Timeout)
        }
    }

    fn read(&mut self, buffer: &mut [u8]) -> io::Result<()> {
        let events = match self.inotify.read_events(buffer) {
            Ok(events) => events,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut count = 0_usize;
        for event in events {
            count += 1;
            let root = self.roots.get(&event.wd).cloned();
            self.normalizer
                .handle(root, event.mask, event.cookie, event.name);
        }
        debug!("Received {} event(s)", count);
        Ok(())
    }
}

/// Translates raw inotify records into [`DirEvent`](DirEvent)s.
struct Normalizer {
    watched: Vec<PathBuf>,
    queue: Arc<EventQueue>,
    pairer: RenamePairer<u32>,
}

impl Normalizer {
    fn new(watched: Vec<PathBuf>, queue: Arc<EventQueue>) -> Self {
        Self {
            watched,
            queue,
            pairer: RenamePairer::default(),
        }
    }

    /// `root` is the watched directory the record's descriptor belongs to, if it is still known.
    fn handle(&mut self, root: Option<PathBuf>, mask: EventMask, cookie: u32, name: Option<&OsStr>) {
        let queue = &*self.queue;

        if mask.contains(EventMask::Q_OVERFLOW) {
            warn!("inotify queue overflowed, requesting rescan");
            self.pairer.settle(queue);
            for root in &self.watched {
                queue.push(DirEvent::rescan(root.clone()));
            }
            return;
        }
        // Emitted when a watch goes away.
        if mask.contains(EventMask::IGNORED) {
            return;
        }
        let Some(root) = root else {
            return;
        };

        if mask.contains(EventMask::DELETE_SELF) {
            self.pairer.settle(queue);
            queue.push(DirEvent::removed(root));
            return;
        }
        if mask.contains(EventMask::MOVE_SELF) {
            self.pairer.settle(queue);
            queue.push(DirEvent::rescan(root));
            return;
        }
        let Some(name) = name.filter(|name| !name.is_empty()) else {
            return;
        };
        let path = root.join(name);

        if mask.contains(EventMask::MOVED_FROM) {
            self.pairer.old_name(cookie, path, root, queue);
        } else if mask.contains(EventMask::MOVED_TO) {
            self.pairer.new_name(cookie, path, root, queue);
        } else {
            self.pairer.settle(queue);
            if mask.contains(EventMask::CREATE) {
                queue.push(DirEvent::added(path));
            } else if mask.contains(EventMask::DELETE) {
                queue.push(DirEvent::removed(path));
            } else if mask.contains(EventMask::MODIFY) {
                queue.push(DirEvent::modified(path));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::Ordering;

    use tempfile::tempdir;

    use super::*;
    use crate::backend::TEST_RUNNING_WORKER_COUNT;
    use crate::tests::TEST_PARALLEL_LOCK;

    fn drain(queue: &EventQueue) -> Vec<DirEvent> {
        std::iter::from_fn(|| queue.try_pop().and_then(Result::ok)).collect()
    }

    fn normalizer() -> (Normalizer, Arc<EventQueue>) {
        let queue = Arc::new(EventQueue::new());
        (
            Normalizer::new(vec!["/w".into(), "/v".into()], Arc::clone(&queue)),
            queue,
        )
    }

    #[test]
    fn must_normalize_basic_records() {
        let (mut n, queue) = normalizer();
        let root = Some(PathBuf::from("/w"));
        n.handle(root.clone(), EventMask::CREATE, 0, Some(OsStr::new("a")));
        n.handle(root.clone(), EventMask::MODIFY, 0, Some(OsStr::new("a")));
        n.handle(root.clone(), EventMask::MOVED_FROM, 9, Some(OsStr::new("a")));
        n.handle(root.clone(), EventMask::MOVED_TO, 9, Some(OsStr::new("b")));
        n.handle(root, EventMask::DELETE, 0, Some(OsStr::new("b")));

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
    fn must_filter_bookkeeping_records() {
        let (mut n, queue) = normalizer();
        n.handle(Some("/w".into()), EventMask::IGNORED, 0, None);
        n.handle(None, EventMask::CREATE, 0, Some(OsStr::new("stale")));
        n.handle(Some("/w".into()), EventMask::CREATE, 0, None);
        assert!(queue.is_empty());
    }

    #[test]
    fn must_rescan_on_overflow_and_moves_out() {
        let (mut n, queue) = normalizer();
        n.handle(Some("/w".into()), EventMask::MOVED_FROM, 3, Some(OsStr::new("gone")));
        n.handle(Some("/w".into()), EventMask::CREATE, 0, Some(OsStr::new("c")));
        n.handle(None, EventMask::Q_OVERFLOW, 0, None);

        assert_eq!(
            drain(&queue),
            [
                DirEvent::rescan("/w"),
                DirEvent::added("/w/c"),
                DirEvent::rescan("/w"),
                DirEvent::rescan("/v"),
            ]
        );
    }

    #[test]
    fn must_report_start_failure_synchronously() {
        let _guard = TEST_PARALLEL_LOCK.lock();
        let dir = tempdir().expect("to be created");
        let missing = dir.path().join("missing");
        let queue = Arc::new(EventQueue::new());

        let mut backend = InotifyBackend::new(&Config::default());
        let err = backend
            .start(&[missing], &queue)
            .expect_err("start to fail");
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        assert_eq!(TEST_RUNNING_WORKER_COUNT.load(Ordering::SeqCst), 0);
        backend.stop();
    }

    #[test]
    fn must_restart_and_join_worker() {
        let _guard = TEST_PARALLEL_LOCK.lock();
        let first = tempdir().expect("to be created");
        let second = tempdir().expect("to be created");
        let first_path = first.path().canonicalize().expect("to succeed");
        let second_path = second.path().canonicalize().expect("to succeed");
        let queue = Arc::new(EventQueue::new());

        let mut backend = InotifyBackend::new(&Config::default());
        backend.stop();
        backend
            .start(&[first_path.clone()], &queue)
            .expect("to start");
        assert_eq!(TEST_RUNNING_WORKER_COUNT.load(Ordering::SeqCst), 1);

        backend
            .start(&[second_path.clone()], &queue)
            .expect("to restart");
        assert_eq!(TEST_RUNNING_WORKER_COUNT.load(Ordering::SeqCst), 1);

        fs::write(first_path.join("ignored"), b"").expect("to be created");
        fs::write(second_path.join("seen"), b"").expect("to be created");
        backend.stop();
        backend.stop();
        assert_eq!(TEST_RUNNING_WORKER_COUNT.load(Ordering::SeqCst), 0);

        let events = drain(&queue);
        assert_eq!(events.first(), Some(&DirEvent::added(second_path.join("seen"))));
        assert!(events.iter().all(|e| e.path.starts_with(&second_path)));
    }
}
