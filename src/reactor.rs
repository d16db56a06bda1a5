//! Asynchronous consumption of watcher events.
//!
//! A watcher holds a single asynchronous request slot shared by
//! [`async_pop`](Watcher::async_pop), [`next_event`](Watcher::next_event) and
//! [`events`](Watcher::events). Backend threads never call into consumers; they only push into
//! the queue, which the reactor drains from its own thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_core::Stream;
use futures_util::stream;
use log::trace;

use crate::error::{Error, Result};
use crate::event::DirEvent;
use crate::watcher::Watcher;

/// Holds the asynchronous request slot until dropped.
struct SlotGuard(Arc<AtomicBool>);

impl SlotGuard {
    fn acquire(slot: &Arc<AtomicBool>) -> Result<Self> {
        if slot.swap(true, Ordering::AcqRel) {
            return Err(Error::Busy);
        }
        Ok(Self(Arc::clone(slot)))
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Watcher {
    /// Invoke `callback` with the next event, on the reactor this watcher was built with.
    ///
    /// Returns immediately. The callback runs exactly once: with the next event, or with
    /// [`Error::Aborted`](Error::Aborted) if the watcher is dropped first. The request slot is
    /// released before the callback runs, so the callback may issue the next request.
    ///
    /// If the reactor itself shuts down before the request resolves, the callback is dropped
    /// without being called.
    ///
    /// # Errors
    /// - [`Error::NoReactor`](Error::NoReactor) if the watcher was built without a reactor.
    /// - [`Error::Busy`](Error::Busy) if a request is already pending. The pending request is
    ///   left untouched.
    pub fn async_pop<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(Result<DirEvent>) + Send + 'static,
    {
        let reactor = self.reactor.as_ref().ok_or(Error::NoReactor)?;
        let slot = SlotGuard::acquire(&self.async_slot)?;
        let queue = Arc::clone(&self.queue);

        reactor.spawn(async move {
            let result = queue.pop_async().await;
            drop(slot);
            trace!("Dispatching async request: {:?}", result);
            callback(result);
        });
        Ok(())
    }

    /// Wait for the next event.
    ///
    /// Works on any executor; no reactor needs to be bound. Dropping the future releases the
    /// request slot.
    ///
    /// # Errors
    /// [`Error::Aborted`](Error::Aborted) once the queue is closed and drained,
    /// [`Error::Busy`](Error::Busy) if another asynchronous request is pending.
    pub async fn next_event(&self) -> Result<DirEvent> {
        let _slot = SlotGuard::acquire(&self.async_slot)?;
        self.queue.pop_async().await
    }

    /// A stream of events that ends once the watcher is closed and drained.
    ///
    /// The stream also ends immediately if another asynchronous request is pending.
    pub fn events(&self) -> impl Stream<Item = DirEvent> + '_ {
        stream::unfold(self, |watcher| async move {
            watcher.next_event().await.ok().map(|event| (event, watcher))
        })
    }
}
