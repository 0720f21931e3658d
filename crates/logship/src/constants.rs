// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Defaults and fixed timings shared across the pipeline.
//!
//! Tuning values (`DEFAULT_*`) can be overridden through configuration. The
//! tailer delays and the bucket names are fixed.

use std::time::Duration;

/// Events per batch before a size-triggered flush.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Maximum time a non-empty batch waits before a time-triggered flush.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Retries after the first delivery attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Informational only; the actual backoff is `attempt²` seconds.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Capacity of the [`crate::buffer::EventBuffer`].
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Per-request HTTP timeout, independent of the retry backoff.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Unit of the quadratic backoff: attempt `n` sleeps `n² * unit`.
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// Default location of the overflow store.
pub const DEFAULT_OVERFLOW_PATH: &str = "agent-buffer.db";

/// Delay before re-opening a file that could not be opened.
pub const REOPEN_DELAY: Duration = Duration::from_secs(5);

/// Delay between reads when no new data is available.
pub const POLL_DELAY: Duration = Duration::from_secs(1);

/// Bucket holding sequence-keyed overflow records.
pub const EVENTS_BUCKET: &str = "events";

/// Bucket holding the persisted sequence counter.
pub(crate) const SEQUENCE_BUCKET: &str = "__sequence";
