// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Groups buffered events into batches and hands them to the transport.
//!
//! A batch is flushed when it reaches `batch_size` events, when the flush
//! interval elapses with a non-empty batch, or when the buffer is closed and
//! drained. Flushes are awaited inline, so at most one batch is in flight
//! and batches reach the backend in the order they were assembled.
//! Undeliverable batches go to the [`OverflowStore`].

use std::mem;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::buffer::EventBuffer;
use crate::event::Batch;
use crate::overflow::OverflowStore;
use crate::transport::{DeliveryError, Transport};

/// Counters reported when the sender stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Flushes handed to the transport.
    pub batches: u64,
    /// Events the backend accepted.
    pub delivered: u64,
    /// Events written to the overflow store.
    pub overflowed: u64,
    /// Events neither delivered nor persisted.
    pub lost: u64,
}

pub struct BatchSender<T> {
    buffer: EventBuffer,
    transport: T,
    overflow: Option<OverflowStore>,
    batch_size: usize,
    flush_interval: Duration,
    stats: BatchStats,
}

impl<T: Transport> BatchSender<T> {
    #[must_use]
    pub fn new(
        buffer: EventBuffer,
        transport: T,
        overflow: Option<OverflowStore>,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Self {
        BatchSender {
            buffer,
            transport,
            overflow,
            batch_size: batch_size.max(1),
            flush_interval,
            stats: BatchStats::default(),
        }
    }

    /// Runs until the buffer is closed and drained, then flushes what is
    /// left and returns the final counters.
    pub async fn run(mut self) -> BatchStats {
        let mut batch: Batch = Vec::with_capacity(self.batch_size);
        let mut ticker = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                next = self.buffer.take() => match next {
                    Some(event) => {
                        batch.push(event);
                        if batch.len() >= self.batch_size {
                            let full = mem::replace(&mut batch, Vec::with_capacity(self.batch_size));
                            self.flush(full).await;
                            ticker.reset();
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            self.flush(mem::take(&mut batch)).await;
                        }
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        let due = mem::replace(&mut batch, Vec::with_capacity(self.batch_size));
                        self.flush(due).await;
                    }
                }
            }
        }

        info!(
            "BATCHER | Stopped: {} batches, {} delivered, {} overflowed, {} lost",
            self.stats.batches, self.stats.delivered, self.stats.overflowed, self.stats.lost
        );
        self.stats
    }

    async fn flush(&mut self, batch: Batch) {
        let count = batch.len();
        self.stats.batches += 1;
        debug!("BATCHER | Flushing batch of {} events", count);

        match self.transport.send(batch).await {
            Ok(()) => self.stats.delivered += count as u64,
            Err(DeliveryError { batch, failure }) => {
                if failure.is_terminal() {
                    warn!(
                        "BATCHER | Batch of {} events rejected, routing to overflow store: {}",
                        count, failure
                    );
                } else {
                    warn!(
                        "BATCHER | Delivery failed for batch of {} events, routing to overflow store: {}",
                        count, failure
                    );
                }
                self.store_overflow(&batch);
            }
        }
    }

    fn store_overflow(&mut self, batch: &Batch) {
        let Some(store) = &self.overflow else {
            error!(
                "BATCHER | No overflow store available, {} undeliverable events lost",
                batch.len()
            );
            self.stats.lost += batch.len() as u64;
            return;
        };

        match store.persist(batch) {
            Ok(ids) => {
                self.stats.overflowed += ids.len() as u64;
                info!("BATCHER | Persisted {} events to overflow store", ids.len());
            }
            Err(e) => {
                let lost = e.total - e.persisted;
                error!("BATCHER | Storage error: {} undeliverable events lost: {}", lost, e);
                self.stats.overflowed += e.persisted as u64;
                self.stats.lost += lost as u64;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LogEvent;
    use crate::host::SystemInfo;
    use crate::transport::DeliveryFailure;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tokio::time::sleep;
    use tracing_test::traced_test;

    #[derive(Clone, Default)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<Vec<String>>>>,
        fail_with: Option<DeliveryFailure>,
    }

    impl RecordingTransport {
        fn failing(failure: DeliveryFailure) -> Self {
            RecordingTransport {
                fail_with: Some(failure),
                ..Default::default()
            }
        }

        fn sent(&self) -> Vec<Vec<String>> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, batch: Batch) -> Result<(), DeliveryError> {
            let lines = batch.iter().map(|e| e.raw_log().to_string()).collect();
            self.sent.lock().unwrap().push(lines);
            match &self.fail_with {
                Some(failure) => Err(DeliveryError {
                    batch,
                    failure: failure.clone(),
                }),
                None => Ok(()),
            }
        }
    }

    fn event(line: &str) -> LogEvent {
        let info = SystemInfo {
            hostname: "test-host".to_string(),
            os_family: "linux".to_string(),
            os_version: "x86_64".to_string(),
            agent_version: "0.1.0".to_string(),
            tags: Vec::new(),
        };
        LogEvent::new(line, "app", Path::new("/tmp/app.log"), &info)
    }

    fn fill(buffer: &EventBuffer, prefix: &str, n: usize) {
        for i in 0..n {
            assert!(buffer.try_put(event(&format!("{prefix}{i}"))));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_triggered_flush() {
        let buffer = EventBuffer::new(100);
        let transport = RecordingTransport::default();
        let sender = BatchSender::new(
            buffer.clone(),
            transport.clone(),
            None,
            10,
            Duration::from_secs(5),
        );
        fill(&buffer, "e", 10);

        let handle = tokio::spawn(sender.run());
        sleep(Duration::from_millis(100)).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), 10);

        buffer.close();
        let stats = handle.await.unwrap();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.delivered, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_triggered_flush() {
        let buffer = EventBuffer::new(100);
        let transport = RecordingTransport::default();
        let sender = BatchSender::new(
            buffer.clone(),
            transport.clone(),
            None,
            10,
            Duration::from_secs(2),
        );
        let handle = tokio::spawn(sender.run());
        fill(&buffer, "e", 3);

        sleep(Duration::from_millis(1900)).await;
        assert!(transport.sent().is_empty());

        sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.sent(), vec![vec!["e0", "e1", "e2"]]);

        // Nothing new: later ticks are no-ops.
        sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.sent().len(), 1);

        buffer.close();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_remainder_in_order() {
        let buffer = EventBuffer::new(100);
        let transport = RecordingTransport::default();
        let sender = BatchSender::new(
            buffer.clone(),
            transport.clone(),
            None,
            10,
            Duration::from_secs(60),
        );
        fill(&buffer, "e", 25);
        buffer.close();

        let stats = sender.run().await;

        let sent = transport.sent();
        let sizes: Vec<usize> = sent.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        let flat: Vec<String> = sent.into_iter().flatten().collect();
        let expected: Vec<String> = (0..25).map(|i| format!("e{i}")).collect();
        assert_eq!(flat, expected);
        assert_eq!(stats.delivered, 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_buffer_close_sends_nothing() {
        let buffer = EventBuffer::new(10);
        let transport = RecordingTransport::default();
        let sender = BatchSender::new(
            buffer.clone(),
            transport.clone(),
            None,
            10,
            Duration::from_secs(1),
        );
        let handle = tokio::spawn(sender.run());

        sleep(Duration::from_secs(5)).await;
        buffer.close();

        assert_eq!(handle.await.unwrap(), BatchStats::default());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_batch_goes_to_overflow_store() {
        let buffer = EventBuffer::new(100);
        let store = OverflowStore::open_ephemeral().unwrap();
        let transport = RecordingTransport::failing(DeliveryFailure::Exhausted {
            attempts: 4,
            last: "HTTP 503: unavailable".to_string(),
        });
        let sender = BatchSender::new(
            buffer.clone(),
            transport,
            Some(store.clone()),
            4,
            Duration::from_secs(5),
        );
        fill(&buffer, "e", 6);
        buffer.close();

        let stats = sender.run().await;

        assert_eq!(stats.batches, 2);
        assert_eq!(stats.overflowed, 6);
        assert_eq!(stats.delivered, 0);
        let persisted: Vec<String> = store
            .records()
            .unwrap()
            .into_iter()
            .map(|(_, e)| e.raw_log().to_string())
            .collect();
        assert_eq!(persisted, vec!["e0", "e1", "e2", "e3", "e4", "e5"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_batch_goes_to_overflow_store() {
        let buffer = EventBuffer::new(10);
        let store = OverflowStore::open_ephemeral().unwrap();
        let transport = RecordingTransport::failing(DeliveryFailure::Rejected {
            status: 400,
            body: "bad request".to_string(),
        });
        let sender = BatchSender::new(
            buffer.clone(),
            transport,
            Some(store.clone()),
            10,
            Duration::from_secs(5),
        );
        fill(&buffer, "e", 2);
        buffer.close();

        let stats = sender.run().await;

        assert_eq!(stats.overflowed, 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_overflow_write_failure_counts_lost() {
        let buffer = EventBuffer::new(10);
        let store = OverflowStore::open_ephemeral().unwrap();
        store.corrupt_sequence();
        let transport = RecordingTransport::failing(DeliveryFailure::Exhausted {
            attempts: 4,
            last: "HTTP 503: unavailable".to_string(),
        });
        let sender = BatchSender::new(
            buffer.clone(),
            transport,
            Some(store.clone()),
            10,
            Duration::from_secs(5),
        );
        fill(&buffer, "e", 3);
        buffer.close();

        let stats = sender.run().await;

        assert_eq!(stats.lost, 3);
        assert_eq!(stats.overflowed, 0);
        assert!(store.is_empty());
        assert!(logs_contain("Storage error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_without_store_counts_lost() {
        let buffer = EventBuffer::new(10);
        let transport = RecordingTransport::failing(DeliveryFailure::Exhausted {
            attempts: 1,
            last: "timeout".to_string(),
        });
        let sender = BatchSender::new(buffer.clone(), transport, None, 10, Duration::from_secs(5));
        fill(&buffer, "e", 3);
        buffer.close();

        let stats = sender.run().await;

        assert_eq!(stats.lost, 3);
        assert_eq!(stats.overflowed, 0);
    }
}
