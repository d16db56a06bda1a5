//! Correlation of rename halves.
//!
//! Native APIs report a rename as two separate notifications. A half is held back until its
//! partner arrives; a half that can't be matched degrades into a rescan of the nearest watched
//! ancestor.

use std::path::PathBuf;

use log::debug;

use crate::event::DirEvent;
use crate::queue::EventQueue;

struct Half<K> {
    key: K,
    path: PathBuf,
    ancestor: PathBuf,
}

/// Pairs rename halves by a native correlation key (an inotify cookie, a tracker id, ...).
pub(crate) struct RenamePairer<K> {
    pending: Option<Half<K>>,
}

impl<K> Default for RenamePairer<K> {
    fn default() -> Self {
        Self { pending: None }
    }
}

impl<K: PartialEq> RenamePairer<K> {
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Hold the old-name half until its partner shows up.
    pub fn old_name(&mut self, key: K, path: PathBuf, ancestor: PathBuf, queue: &EventQueue) {
        self.settle(queue);
        self.pending = Some(Half {
            key,
            path,
            ancestor,
        });
    }

    /// Complete the pending half, or give up on both.
    pub fn new_name(&mut self, key: K, path: PathBuf, ancestor: PathBuf, queue: &EventQueue) {
        match self.pending.take() {
            Some(old) if old.key == key => {
                queue.push(DirEvent::renamed_old_name(old.path));
                queue.push(DirEvent::renamed_new_name(path));
            }
            Some(old) => {
                debug!("Uncorrelated rename halves {:?} and {:?}", old.path, path);
                queue.push(DirEvent::rescan(old.ancestor.clone()));
                if old.ancestor != ancestor {
                    queue.push(DirEvent::rescan(ancestor));
                }
            }
            None => {
                debug!("Rename target {:?} has no source", path);
                queue.push(DirEvent::rescan(ancestor));
            }
        }
    }

    /// For APIs that don't say which half a notification is: the first one seen is the old name.
    pub fn either(&mut self, key: K, path: PathBuf, ancestor: PathBuf, queue: &EventQueue) {
        if self.is_pending() {
            self.new_name(key, path, ancestor, queue);
        } else {
            self.old_name(key, path, ancestor, queue);
        }
    }

    /// Give up on a pending half.
    pub fn settle(&mut self, queue: &EventQueue) {
        if let Some(old) = self.pending.take() {
            debug!("Rename source {:?} has no target", old.path);
            queue.push(DirEvent::rescan(old.ancestor));
        }
    }
}
