// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity FIFO between the tailers and the batch sender.
//!
//! This is the single point of backpressure in the pipeline:
//!
//! ```text
//!   tailer A ──try_put──┐
//!   tailer B ──try_put──┼──> [ e1 e2 e3 ... eC ] ──take──> BatchSender
//!   tailer C ──try_put──┘         (capacity C)
//! ```
//!
//! - [`EventBuffer::try_put`] never waits. When the buffer already holds `C`
//!   events the new event is rejected and counted as dropped, so under
//!   sustained overload the newest lines are lost instead of memory growing
//!   or file reads stalling.
//! - [`EventBuffer::take`] waits until an event is available, or returns
//!   `None` once the buffer is closed and drained.
//! - [`EventBuffer::close`] stops new puts; queued events stay retrievable.
//!
//! All state sits behind one internal mutex that is never held across an
//! await point. Handles are cheap to clone and share the same queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::debug;

use crate::event::LogEvent;

/// Non-blocking destination for captured events.
///
/// Returns `false` when the event was not accepted; the caller treats that
/// as a drop, never as an error to retry.
pub trait EventSink: Send + Sync {
    fn try_put(&self, event: LogEvent) -> bool;
}

#[derive(Debug)]
struct State {
    queue: VecDeque<LogEvent>,
    closed: bool,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    capacity: usize,
    available: Notify,
    dropped: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct EventBuffer {
    inner: Arc<Inner>,
}

impl EventBuffer {
    /// Creates a buffer holding at most `capacity` events (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        EventBuffer {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::with_capacity(capacity),
                    closed: false,
                }),
                capacity,
                available: Notify::new(),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // The critical sections cannot panic midway, so a poisoned lock still
        // guards a consistent queue.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues `event` unless the buffer is full or closed.
    pub fn try_put(&self, event: LogEvent) -> bool {
        {
            let mut state = self.state();
            if state.closed || state.queue.len() >= self.inner.capacity {
                drop(state);
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            state.queue.push_back(event);
        }
        self.inner.available.notify_one();
        true
    }

    /// Removes the oldest event, waiting until one is available.
    ///
    /// Returns `None` once the buffer is closed and every queued event has
    /// been taken. Cancel safe: dropping the future never loses an event.
    pub async fn take(&self) -> Option<LogEvent> {
        loop {
            let notified = self.inner.available.notified();
            {
                let mut state = self.state();
                if let Some(event) = state.queue.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stops accepting new events. Idempotent.
    pub fn close(&self) {
        let remaining = {
            let mut state = self.state();
            state.closed = true;
            state.queue.len()
        };
        debug!("BUFFER | Closed with {} events left to drain", remaining);
        self.inner.available.notify_waiters();
        // Covers a consumer that checked the state but has not parked yet.
        self.inner.available.notify_one();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Total number of rejected puts since creation.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for EventBuffer {
    fn try_put(&self, event: LogEvent) -> bool {
        EventBuffer::try_put(self, event)
    }
}
