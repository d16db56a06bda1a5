//! Cross-platform directory change notifications.
//!
//! A [`Watcher`](Watcher) watches a dynamic set of directories and reports what happens inside
//! them as [`DirEvent`](DirEvent)s, one of
//! - [`Added`](DirEventKind::Added), [`Removed`](DirEventKind::Removed) and
//!   [`Modified`](DirEventKind::Modified),
//! - [`RenamedOldName`](DirEventKind::RenamedOldName) immediately followed by
//!   [`RenamedNewName`](DirEventKind::RenamedNewName) for a rename,
//! - [`RecursiveRescan`](DirEventKind::RecursiveRescan) when the backend lost track of a subtree
//!   and the consumer should rescan it.
//!
//! ## Backends
//!
//! - macOS: [`FSEvents`](https://developer.apple.com/documentation/coreservices/file_system_events),
//!   driven by a run loop thread.
//! - Linux and Android: `inotify`, read by a worker thread.
//! - Everything else: the platform watcher picked by [`notify`](https://github.com/notify-rs/notify).
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use dir_monitor::{DirEventKind, Watcher};
//!
//! let dir = tempfile::tempdir().expect("to be created");
//! let watcher = Watcher::builder()
//!     .latency(Duration::from_millis(50))
//!     .build();
//! watcher.add_directory(dir.path()).expect("to be watched");
//!
//! std::fs::create_dir(dir.path().join("child")).expect("to be created");
//! # let dir_path = dir.path().canonicalize().expect("to succeed");
//!
//! let event = watcher.pop().expect("an event");
//! assert_eq!(event.kind, DirEventKind::Added);
//! # assert_eq!(event.path, dir_path.join("child"));
//! ```
//!
//! ## Asynchronous use
//!
//! Bind a [`tokio`](https://github.com/tokio-rs/tokio) runtime with
//! [`WatcherBuilder::reactor`](WatcherBuilder::reactor) to use the callback based
//! [`Watcher::async_pop`](Watcher::async_pop), or await
//! [`Watcher::next_event`](Watcher::next_event) and [`Watcher::events`](Watcher::events) from any
//! executor.
//!
//! ## License
//!
//! This project is licensed under MIT License.

pub mod backend;
mod config;
mod error;
mod event;
mod queue;
mod reactor;
#[cfg(test)]
mod tests;
mod watcher;

pub use crate::config::{Config, DEFAULT_LATENCY};
pub use crate::error::{Error, Result};
pub use crate::event::{DirEvent, DirEventKind};
pub use crate::queue::EventQueue;
pub use crate::watcher::{EventReceiver, Watcher, WatcherBuilder};
