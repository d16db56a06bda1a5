//! `FSEvents` backend for macOS.
//!
//! Each `start` creates an event stream for the whole path list and schedules it on the run loop
//! of a dedicated thread. `FSEvents` watches recursively and batches notifications for up to
//! [`Config::latency`](crate::Config::latency) before invoking the callback.
#![allow(clippy::non_send_fields_in_send_ty, clippy::module_name_repetitions)]

use std::ffi::{c_void, CStr, OsStr};
use std::io;
use std::os::raw::c_char;
use std::os::unix::ffi::OsStrExt;
use std::panic::catch_unwind;
use std::path::PathBuf;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use core_foundation::runloop::{kCFRunLoopDefaultMode, CFRunLoop};
use log::{debug, error, trace};
use parking_lot::Mutex;

use self::ffi::{
    impl_release_callback, kFSEventStreamCreateFlagFileEvents, kFSEventStreamEventIdSinceNow,
    path_array, FSEventStream, FSEventStreamContext, FSEventStreamEventFlags,
    FSEventStreamEventId, FSEventStreamRef,
};
pub use self::flags::StreamFlags;
use self::observer::wait_until_idle;
use crate::backend::rename::RenamePairer;
use crate::backend::{nearest_watched_ancestor, Backend};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::DirEvent;
use crate::queue::EventQueue;

mod ffi;
mod flags;
mod observer;

/// Owns the run loop thread of the current event stream.
pub struct FsEventBackend {
    latency: Duration,
    runloop: Option<(CFRunLoop, thread::JoinHandle<()>)>,
}

// Safety:
// - According to the Apple documentation, it's safe to move `CFRef`s across threads.
//   https://developer.apple.com/library/archive/documentation/Cocoa/Conceptual/Multithreading/ThreadSafetySummary/ThreadSafetySummary.html
unsafe impl Send for FsEventBackend {}

impl FsEventBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            latency: config.latency,
            runloop: None,
        }
    }
}

struct SendWrapper<T>(T);

unsafe impl<T> Send for SendWrapper<T> {}

impl<T> SendWrapper<T> {
    const unsafe fn new(t: T) -> Self {
        Self(t)
    }
}

pub(crate) struct StreamContextInfo {
    normalizer: Arc<Mutex<Normalizer>>,
}

impl_release_callback!(release_context, StreamContextInfo);

impl Backend for FsEventBackend {
    fn start(&mut self, paths: &[PathBuf], queue: &Arc<EventQueue>) -> Result<()> {
        self.stop();
        if paths.is_empty() {
            return Ok(());
        }

        let normalizer = Arc::new(Mutex::new(Normalizer::new(
            paths.to_vec(),
            Arc::clone(queue),
        )));

        // Converted before the context exists, so a bad path can't leak it.
        let cf_paths = path_array(paths).map_err(Error::backend)?;

        // The context is owned by the stream and freed by `release_context` when the stream is
        // released.
        let stream_context = FSEventStreamContext::new(
            StreamContextInfo {
                normalizer: Arc::clone(&normalizer),
            },
            release_context,
        );
        let mut stream = match FSEventStream::new(
            callback,
            &stream_context,
            &cf_paths,
            kFSEventStreamEventIdSinceNow,
            self.latency,
            kFSEventStreamCreateFlagFileEvents,
        ) {
            Ok(stream) => stream,
            Err(e) => {
                // No stream took ownership of the context.
                release_context(stream_context.info);
                return Err(Error::backend(e));
            }
        };

        // channel to pass runloop around
        let (runloop_tx, runloop_rx) = channel();

        let thread_handle = thread::Builder::new()
            .name("dir-monitor-fsevents".into())
            .spawn(move || {
                #[cfg(test)]
                crate::backend::TEST_RUNNING_WORKER_COUNT
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

                let current_runloop = CFRunLoop::get_current();

                stream.schedule(&current_runloop, unsafe { kCFRunLoopDefaultMode });
                let started = stream.start();

                // Safety:
                // - According to the Apple documentation, it's safe to move `CFRef`s across threads.
                //   https://developer.apple.com/library/archive/documentation/Cocoa/Conceptual/Multithreading/ThreadSafetySummary/ThreadSafetySummary.html
                let _ = runloop_tx.send((started, unsafe { SendWrapper::new(current_runloop) }));

                if started {
                    // the calling to CFRunLoopRun will be terminated by CFRunLoopStop call in stop()
                    CFRunLoop::run_current();
                    // Hand over whatever is still held back by the latency window.
                    stream.flush_sync();
                    stream.stop();
                }
                stream.invalidate();
                normalizer.lock().finish_batch();

                #[cfg(test)]
                crate::backend::TEST_RUNNING_WORKER_COUNT
                    .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            })
            .map_err(Error::backend)?;

        let thread_died = || {
            Error::backend(io::Error::new(
                io::ErrorKind::Other,
                "FSEvents run loop thread exited",
            ))
        };
        let (started, runloop) = runloop_rx.recv().map_err(|_| thread_died())?;
        if !started {
            let _ = thread_handle.join();
            return Err(Error::backend(io::Error::new(
                io::ErrorKind::Other,
                "FSEventStreamStart failed",
            )));
        }

        debug!("Watching {} director(ies) with FSEvents", paths.len());
        self.runloop = Some((runloop.0, thread_handle));
        Ok(())
    }

    /// Stop the event stream and terminate its backing `RunLoop`.
    fn stop(&mut self) {
        if let Some((runloop, thread_handle)) = self.runloop.take() {
            wait_until_idle(&runloop);
            runloop.stop();

            // Wait for the thread to shut down.
            if thread_handle.join().is_err() {
                error!("FSEvents run loop thread panicked");
            }
        }
    }
}

impl Drop for FsEventBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

extern "C" fn callback(
    stream_ref: FSEventStreamRef,
    info: *mut c_void,
    num_events: usize,                           // size_t numEvents
    event_paths: *mut c_void,                    // void *eventPaths
    event_flags: *const FSEventStreamEventFlags, // const FSEventStreamEventFlags eventFlags[]
    event_ids: *const FSEventStreamEventId,      // const FSEventStreamEventId eventIds[]
) {
    drop(catch_unwind(move || {
        callback_impl(
            stream_ref,
            info,
            num_events,
            event_paths,
            event_flags,
            event_ids,
        );
    }));
}

fn callback_impl(
    _stream_ref: FSEventStreamRef,
    info: *mut c_void,
    num_events: usize,                           // size_t numEvents
    event_paths: *mut c_void,                    // void *eventPaths
    event_flags: *const FSEventStreamEventFlags, // const FSEventStreamEventFlags eventFlags[]
    _event_ids: *const FSEventStreamEventId,     // const FSEventStreamEventId eventIds[]
) {
    debug!("Received {} event(s)", num_events);

    let info = info as *const StreamContextInfo;
    let mut normalizer = unsafe { &(*info).normalizer }.lock();
    let paths = event_paths as *const *const c_char;

    for idx in 0..num_events {
        let path = PathBuf::from(
            OsStr::from_bytes(unsafe { CStr::from_ptr(*paths.add(idx)) }.to_bytes())
                .to_os_string(),
        );
        let raw_flags = unsafe { *event_flags.add(idx) };
        normalizer.handle(path, StreamFlags::from_bits_truncate(raw_flags));
    }
    normalizer.finish_batch();
}

/// Translates `FSEvents` records into [`DirEvent`](DirEvent)s.
///
/// `FSEvents` coalesces everything that happened to one path inside the latency window into a
/// single record, so one record may expand into several events. They are emitted in the order
/// create, modify, rename, remove.
pub(crate) struct Normalizer {
    roots: Vec<PathBuf>,
    queue: Arc<EventQueue>,
    pairer: RenamePairer<()>,
}

impl Normalizer {
    fn new(roots: Vec<PathBuf>, queue: Arc<EventQueue>) -> Self {
        Self {
            roots,
            queue,
            pairer: RenamePairer::default(),
        }
    }

    fn handle(&mut self, path: PathBuf, flags: StreamFlags) {
        trace!("{:?}: {}", path, flags);
        let queue = &*self.queue;

        // Marker emitted by the service itself, not a filesystem change.
        if flags.contains(StreamFlags::HISTORY_DONE) {
            return;
        }
        if !flags.contains(StreamFlags::ITEM_RENAMED) {
            self.pairer.settle(queue);
        }
        if flags.intersects(StreamFlags::NEEDS_RESCAN) {
            let target = if flags.contains(StreamFlags::MUST_SCAN_SUBDIRS)
                && self.roots.iter().any(|root| path.starts_with(root))
            {
                path
            } else {
                nearest_watched_ancestor(&self.roots, &path)
            };
            queue.push(DirEvent::rescan(target));
            return;
        }
        // Of the records for a watched directory itself, only its removal is reported.
        if self.roots.contains(&path) {
            if flags.contains(StreamFlags::ITEM_REMOVED) && !path.exists() {
                queue.push(DirEvent::removed(path));
            }
            return;
        }

        if flags.contains(StreamFlags::ITEM_CREATED) {
            queue.push(DirEvent::added(path.clone()));
        }
        if flags.contains(StreamFlags::ITEM_MODIFIED) {
            queue.push(DirEvent::modified(path.clone()));
        }
        if flags.contains(StreamFlags::ITEM_RENAMED) {
            let ancestor = nearest_watched_ancestor(&self.roots, &path);
            self.pairer.either((), path.clone(), ancestor, queue);
        }
        if flags.contains(StreamFlags::ITEM_REMOVED) {
            queue.push(DirEvent::removed(path));
        }
    }

    /// Rename halves are only correlated within one callback batch.
    fn finish_batch(&mut self) {
        self.pairer.settle(&self.queue);
    }
}
