// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent lifecycle: wires the pipeline together and tears it down in order.
//!
//! Startup:
//!
//! 1. open the overflow store
//! 2. replay overflow records when `agent.replay_overflow` is set
//! 3. spawn the batch sender
//! 4. backfill existing lines when `agent.backfill_lines > 0`
//! 5. spawn one tailer per configured file
//!
//! Shutdown runs the reverse: tailers are cancelled and awaited, the buffer
//! is closed, the sender drains it and finishes its last flush, and only
//! then is the overflow store flushed and released.

use std::future::{self, Future};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batcher::{BatchSender, BatchStats};
use crate::buffer::EventBuffer;
use crate::config::{Config, ConfigError};
use crate::constants::{DEFAULT_BACKOFF_UNIT, POLL_DELAY, REOPEN_DELAY};
use crate::event::Batch;
use crate::host::SystemInfo;
use crate::overflow::{OverflowError, OverflowStore};
use crate::tailer::{read_existing, FileTailer};
use crate::transport::{RetryPolicy, RetryTransport, Transport};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Overflow store error: {0}")]
    Overflow(#[from] OverflowError),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("Agent already started")]
    AlreadyStarted,
}

/// Why [`Agent::wait_for_shutdown`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / Ctrl+C.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// [`AgentHandle::shutdown`] was called.
    Requested,
}

/// Cloneable handle for requesting shutdown from elsewhere.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    shutdown_token: CancellationToken,
}

impl AgentHandle {
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }
}

/// Final counters logged and returned by [`Agent::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    pub batches: BatchStats,
    /// Lines rejected by the full buffer.
    pub dropped: u64,
    /// Overflow records replayed at startup.
    pub replayed: usize,
}

pub struct Agent {
    config: Config,
    system_info: Arc<SystemInfo>,
    buffer: EventBuffer,
    overflow: Option<OverflowStore>,
    shutdown_token: CancellationToken,
    tailer_token: CancellationToken,
    tailers: Vec<JoinHandle<()>>,
    sender: Option<JoinHandle<BatchStats>>,
    backoff_unit: Duration,
    reopen_delay: Duration,
    poll_delay: Duration,
    replayed: usize,
}

impl Agent {
    /// Builds an agent that reports the local host identity, with the
    /// configured metadata overrides applied.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let system_info = SystemInfo::collect().with_overrides(&config.metadata);
        Self::with_system_info(config, system_info)
    }

    #[must_use]
    pub fn with_system_info(config: Config, system_info: SystemInfo) -> Self {
        let buffer = EventBuffer::new(config.agent.buffer_size);
        let shutdown_token = CancellationToken::new();
        let tailer_token = shutdown_token.child_token();
        Agent {
            config,
            system_info: Arc::new(system_info),
            buffer,
            overflow: None,
            shutdown_token,
            tailer_token,
            tailers: Vec::new(),
            sender: None,
            backoff_unit: DEFAULT_BACKOFF_UNIT,
            reopen_delay: REOPEN_DELAY,
            poll_delay: POLL_DELAY,
            replayed: 0,
        }
    }

    /// Overrides the retry backoff unit (`attempt² * unit`).
    #[must_use]
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Overrides the tailer reopen and poll delays.
    #[must_use]
    pub fn with_tailer_delays(mut self, reopen_delay: Duration, poll_delay: Duration) -> Self {
        self.reopen_delay = reopen_delay;
        self.poll_delay = poll_delay;
        self
    }

    #[must_use]
    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            shutdown_token: self.shutdown_token.clone(),
        }
    }

    #[must_use]
    pub fn system_info(&self) -> &SystemInfo {
        &self.system_info
    }

    /// Opens the store and spawns the pipeline tasks.
    pub async fn start(&mut self) -> Result<(), AgentError> {
        if self.sender.is_some() {
            return Err(AgentError::AlreadyStarted);
        }
        let tuning = &self.config.agent;

        let store = OverflowStore::open(&self.config.overflow_path)?;
        info!(
            "AGENT | Overflow store at {} ({} records pending)",
            self.config.overflow_path.display(),
            store.len()
        );

        let transport = RetryTransport::new(
            &self.config.backend_url,
            tuning.request_timeout,
            RetryPolicy {
                max_retries: tuning.max_retries,
                backoff_unit: self.backoff_unit,
            },
        )?;

        if tuning.replay_overflow {
            self.replayed = replay_overflow(&store, &transport, tuning.batch_size).await;
        }

        let sender = BatchSender::new(
            self.buffer.clone(),
            transport,
            Some(store.clone()),
            tuning.batch_size,
            tuning.flush_interval,
        );
        self.sender = Some(tokio::spawn(sender.run()));
        self.overflow = Some(store);

        if tuning.backfill_lines > 0 {
            for file in &self.config.log_files {
                match read_existing(
                    &file.path,
                    &file.source_type,
                    &self.system_info,
                    &self.buffer,
                    tuning.backfill_lines,
                )
                .await
                {
                    Ok(count) => info!(
                        "AGENT | Backfilled {} lines from {}",
                        count,
                        file.path.display()
                    ),
                    Err(e) => warn!("AGENT | Backfill skipped: {}", e),
                }
            }
        }

        for file in &self.config.log_files {
            let tailer = FileTailer::new(
                file.path.clone(),
                file.source_type.clone(),
                Arc::clone(&self.system_info),
                self.buffer.clone(),
                self.tailer_token.child_token(),
            )
            .with_delays(self.reopen_delay, self.poll_delay);
            self.tailers.push(tokio::spawn(tailer.run()));
        }

        info!(
            "AGENT | Started: {} log files -> {} (batch size {}, flush interval {:?})",
            self.config.log_files.len(),
            self.config.backend_url,
            tuning.batch_size,
            tuning.flush_interval
        );
        Ok(())
    }

    /// Waits for SIGINT, SIGTERM, or [`AgentHandle::shutdown`].
    ///
    /// A signal whose handler cannot be installed is logged and ignored, so
    /// the other sources still end the wait.
    pub async fn wait_for_shutdown(&self) -> ShutdownReason {
        tokio::select! {
            () = self.shutdown_token.cancelled() => ShutdownReason::Requested,
            () = listen("SIGTERM", terminate_signal()) => {
                info!("AGENT | Received SIGTERM, shutting down");
                ShutdownReason::Terminate
            }
            () = listen("SIGINT", tokio::signal::ctrl_c()) => {
                info!("AGENT | Received SIGINT, shutting down");
                ShutdownReason::Interrupt
            }
        }
    }

    /// Stops the pipeline in dependency order and returns the final counters.
    pub async fn shutdown(mut self) -> ShutdownSummary {
        info!("AGENT | Shutting down");
        self.shutdown_token.cancel();

        for handle in self.tailers.drain(..) {
            if let Err(e) = handle.await {
                error!("AGENT | Tailer task failed: {}", e);
            }
        }
        debug!("AGENT | All tailers stopped");

        self.buffer.close();

        let batches = match self.sender.take() {
            Some(handle) => match handle.await {
                Ok(stats) => stats,
                Err(e) => {
                    error!("AGENT | Batch sender task failed: {}", e);
                    BatchStats::default()
                }
            },
            None => BatchStats::default(),
        };

        if let Some(store) = self.overflow.take() {
            if let Err(e) = store.flush() {
                error!("AGENT | Failed to flush overflow store: {}", e);
            }
        }

        let summary = ShutdownSummary {
            batches,
            dropped: self.buffer.dropped(),
            replayed: self.replayed,
        };
        info!(
            "AGENT | Shutdown complete: {} delivered, {} overflowed, {} lost, {} dropped at buffer",
            summary.batches.delivered,
            summary.batches.overflowed,
            summary.batches.lost,
            summary.dropped
        );
        summary
    }
}

/// Resolves when `signal` fires. Never resolves if listening failed.
async fn listen<F>(name: &str, signal: F)
where
    F: Future<Output = io::Result<()>>,
{
    if let Err(e) = signal.await {
        error!("AGENT | Failed to listen for {}, ignoring it: {}", name, e);
        future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn terminate_signal() -> io::Result<()> {
    future::pending().await
}

/// Re-sends persisted overflow records in key order, `chunk_size` at a time.
///
/// The store is read one chunk at a time. Each delivered chunk is removed.
/// Records that no longer decode are logged and left in place. The first
/// failed send stops the replay and the remaining records are kept for a
/// later run. Storage errors are logged and also stop the replay. Returns
/// the number of records delivered.
pub async fn replay_overflow<T: Transport>(
    store: &OverflowStore,
    transport: &T,
    chunk_size: usize,
) -> usize {
    let pending = store.len();
    if pending == 0 {
        return 0;
    }
    info!("AGENT | Replaying up to {} overflow records", pending);

    let mut replayed = 0;
    let mut cursor = 0;
    loop {
        let chunk = match store.chunk_after(cursor, chunk_size.max(1)) {
            Ok(chunk) => chunk,
            Err(e) => {
                error!("AGENT | Overflow replay stopped, failed to read store: {}", e);
                break;
            }
        };
        let Some(last) = chunk.last else {
            break;
        };
        cursor = last;

        for seq in &chunk.undecodable {
            error!("AGENT | Skipping undecodable overflow record {}", seq);
        }
        if chunk.records.is_empty() {
            continue;
        }

        let ids: Vec<u64> = chunk.records.iter().map(|(seq, _)| *seq).collect();
        let batch: Batch = chunk.records.into_iter().map(|(_, event)| event).collect();
        if let Err(e) = transport.send(batch).await {
            warn!(
                "AGENT | Overflow replay stopped, {} records kept: {}",
                store.len(),
                e.failure
            );
            break;
        }
        replayed += ids.len();
        if let Err(e) = ids.iter().try_for_each(|seq| store.remove(*seq).map(|_| ())) {
            error!(
                "AGENT | Overflow replay stopped, failed to remove delivered records: {}",
                e
            );
            break;
        }
    }

    if let Err(e) = store.flush() {
        error!("AGENT | Failed to flush overflow store after replay: {}", e);
    }
    info!("AGENT | Replayed {} overflow records", replayed);
    replayed
}
