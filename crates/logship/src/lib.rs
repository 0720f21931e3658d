// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # logship
//!
//! Host-resident log shipping: tails local log files and forwards every
//! captured line to a remote ingestion backend, staying non-blocking when the
//! backend is slow, unreachable, or rejecting requests.
//!
//! ## Pipeline
//!
//! ```text
//!   ┌────────────┐   try_put    ┌─────────────┐   take    ┌─────────────┐
//!   │ FileTailer │ ───────────> │ EventBuffer │ ────────> │ BatchSender │
//!   │ (per file) │  (drop when  │  (bounded)  │           │             │
//!   └────────────┘     full)    └─────────────┘           └──────┬──────┘
//!                                                                │ send(batch)
//!                                                                v
//!                                   ┌───────────────┐  failed  ┌───────────────┐
//!                                   │ OverflowStore │ <─────── │ RetryTransport│
//!                                   │    (sled)     │          │   (reqwest)   │
//!                                   └───────────────┘          └───────────────┘
//! ```
//!
//! - [`tailer`]: follows file growth, survives rotation/truncation/absence
//! - [`buffer`]: fixed-capacity FIFO, the single point of backpressure
//! - [`batcher`]: size/time-triggered batching, one batch in flight
//! - [`transport`]: HTTP delivery with quadratic backoff
//! - [`overflow`]: restart-durable store for undeliverable batches
//! - [`agent`]: startup wiring and ordered shutdown

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

/// Startup wiring, optional overflow replay, and shutdown sequencing
pub mod agent;

/// Size/time-triggered batching loop
pub mod batcher;

/// Bounded FIFO handoff between tailers and the batch sender
pub mod buffer;

/// Configuration loading - YAML files, environment variables, and defaults
pub mod config;

/// Pipeline-wide constants
pub mod constants;

/// Log event data model and wire format
pub mod event;

/// Host identity snapshot
pub mod host;

/// Tracing formatter
pub mod logger;

/// Durable overflow store for batches that could not be delivered
pub mod overflow;

/// File following and bounded backfill
pub mod tailer;

/// Retrying HTTP delivery of batches
pub mod transport;

/// Agent version reported in every event's metadata.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
