//! FIFO handoff between backend threads and consumers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use log::trace;
use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::event::DirEvent;

#[derive(Debug, Default)]
struct State {
    events: VecDeque<DirEvent>,
    closed: bool,
}

/// A closable event queue.
///
/// Producers may push from any thread. One blocking consumer and one async consumer may wait at
/// the same time. Once closed, pushes are discarded and waiters drain what is left before
/// getting [`Error::Aborted`](Error::Aborted).
#[derive(Debug, Default)]
pub struct EventQueue {
    state: Mutex<State>,
    available: Condvar,
    notify: Notify,
    blocking_waiter: AtomicBool,
}

/// Releases the blocking consumer slot on every exit path.
struct WaiterGuard<'a>(&'a AtomicBool);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `event` and wake a waiting consumer.
    ///
    /// Returns `false` if the queue is closed and the event was discarded.
    pub fn push(&self, event: DirEvent) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                trace!("Discarding event pushed after close: {}", event);
                return false;
            }
            state.events.push_back(event);
        }
        self.available.notify_one();
        self.notify.notify_one();
        true
    }

    /// Block until an event is available or the queue is closed.
    ///
    /// # Errors
    /// [`Error::Aborted`](Error::Aborted) once the queue is closed and drained,
    /// [`Error::Busy`](Error::Busy) if another thread is already blocked here.
    pub fn pop_blocking(&self) -> Result<DirEvent> {
        if self.blocking_waiter.swap(true, Ordering::AcqRel) {
            return Err(Error::Busy);
        }
        let _guard = WaiterGuard(&self.blocking_waiter);

        let mut state = self.state.lock();
        loop {
            if let Some(event) = state.events.pop_front() {
                return Ok(event);
            }
            if state.closed {
                return Err(Error::Aborted);
            }
            self.available.wait(&mut state);
        }
    }

    /// Wait asynchronously until an event is available or the queue is closed.
    ///
    /// Only one task may await this at a time; the slot is enforced by the caller.
    ///
    /// # Errors
    /// [`Error::Aborted`](Error::Aborted) once the queue is closed and drained.
    pub async fn pop_async(&self) -> Result<DirEvent> {
        loop {
            // `notify_one` stores a permit when nobody is waiting, so a push racing with the
            // check below still wakes us.
            let notified = self.notify.notified();
            if let Some(result) = self.try_pop() {
                return result;
            }
            notified.await;
        }
    }

    /// Take the oldest event without waiting.
    ///
    /// `None` means the queue is open and empty.
    pub fn try_pop(&self) -> Option<Result<DirEvent>> {
        let mut state = self.state.lock();
        match state.events.pop_front() {
            Some(event) => Some(Ok(event)),
            None if state.closed => Some(Err(Error::Aborted)),
            None => None,
        }
    }

    /// Close the queue and wake every waiter. Calling it again has no effect.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.available.notify_all();
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn must_preserve_arrival_order() {
        let queue = EventQueue::new();
        assert!(queue.push(DirEvent::added("/d/a")));
        assert!(queue.push(DirEvent::modified("/d/a")));
        assert!(queue.push(DirEvent::removed("/d/a")));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop_blocking().unwrap(), DirEvent::added("/d/a"));
        assert_eq!(queue.pop_blocking().unwrap(), DirEvent::modified("/d/a"));
        assert_eq!(queue.pop_blocking().unwrap(), DirEvent::removed("/d/a"));
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn must_drain_before_aborting() {
        let queue = EventQueue::new();
        queue.push(DirEvent::added("/d/a"));
        queue.close();
        queue.close();

        assert!(!queue.push(DirEvent::added("/d/b")));
        assert_eq!(queue.pop_blocking().unwrap(), DirEvent::added("/d/a"));
        assert!(queue.pop_blocking().unwrap_err().is_aborted());
        assert!(queue.pop_blocking().unwrap_err().is_aborted());
    }

    #[test]
    fn must_wake_blocked_consumer_on_push() {
        let queue = Arc::new(EventQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_blocking())
        };

        thread::sleep(Duration::from_millis(50));
        queue.push(DirEvent::removed("/d/a"));

        let event = consumer.join().expect("to join").expect("an event");
        assert_eq!(event, DirEvent::removed("/d/a"));
    }

    #[test]
    fn must_abort_blocked_consumer_on_close() {
        let queue = Arc::new(EventQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_blocking())
        };

        thread::sleep(Duration::from_millis(50));
        queue.close();

        assert!(consumer.join().expect("to join").unwrap_err().is_aborted());
    }

    #[test]
    fn must_reject_second_blocking_consumer() {
        let queue = Arc::new(EventQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_blocking())
        };

        // Wait for the first consumer to take the slot.
        while !queue.blocking_waiter.load(Ordering::Acquire) {
            thread::yield_now();
        }
        assert!(matches!(queue.pop_blocking(), Err(Error::Busy)));

        queue.close();
        assert!(consumer.join().expect("to join").unwrap_err().is_aborted());
        // The slot is free again.
        assert!(queue.pop_blocking().unwrap_err().is_aborted());
    }

    #[tokio::test]
    async fn must_resolve_async_waiter() {
        let queue = Arc::new(EventQueue::new());
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                queue.push(DirEvent::added("/d/a"));
                queue.close();
            })
        };

        assert_eq!(queue.pop_async().await.unwrap(), DirEvent::added("/d/a"));
        assert!(queue.pop_async().await.unwrap_err().is_aborted());
        producer.join().expect("to join");
    }
}
