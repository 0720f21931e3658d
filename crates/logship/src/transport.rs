// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batch delivery over HTTP with bounded retries and quadratic backoff.
//!
//! # Wire protocol
//!
//! - more than one event: `POST {backend_url}/batch` with a JSON array
//! - exactly one event: `POST {backend_url}` with a single JSON object
//!
//! # Retry policy
//!
//! ```text
//!   attempt 0 ──> 2xx ─────────────────────────────> Ok
//!      │     ──> 4xx ─────────────────────────────> Err(Rejected)     (terminal)
//!      │     ──> 5xx / network error / timeout
//!      v
//!   sleep 1² ──> attempt 1 ──> ... ──> sleep n² ──> attempt n = max_retries
//!                                                     │
//!                                                     v
//!                                               Err(Exhausted)
//! ```
//!
//! A failed call hands the batch back inside [`DeliveryError`]; the caller
//! decides where undeliverable events go.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::constants::{DEFAULT_BACKOFF_UNIT, DEFAULT_MAX_RETRIES};
use crate::event::Batch;

/// Why a batch could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    /// The backend answered 4xx. Never retried.
    #[error("rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    /// Every attempt ended in a 5xx, network error, or timeout.
    #[error("max retries exceeded after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
    /// The batch could not be serialized.
    #[error("failed to encode payload: {0}")]
    Encode(String),
}

impl DeliveryFailure {
    /// `true` when retrying later is pointless.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryFailure::Exhausted { .. })
    }
}

/// Returned when delivery fails; gives the batch back to the caller.
#[derive(Debug, Error)]
#[error("failed to deliver batch of {} events: {failure}", .batch.len())]
pub struct DeliveryError {
    pub batch: Batch,
    pub failure: DeliveryFailure,
}

/// Delivers one batch at a time.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, batch: Batch) -> Result<(), DeliveryError>;
}

/// Attempt budget and backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    /// Attempt `n` is preceded by a sleep of `n² * backoff_unit`.
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_unit: DEFAULT_BACKOFF_UNIT,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        RetryPolicy {
            max_retries,
            ..Default::default()
        }
    }

    /// Delay before `attempt` (attempt 0 is immediate).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(attempt.saturating_mul(attempt))
    }

    /// Every delay the policy can produce, in order.
    #[must_use]
    pub fn delays(&self) -> Vec<Duration> {
        (1..=self.max_retries).map(|a| self.backoff(a)).collect()
    }
}

/// [`Transport`] posting JSON to the ingestion backend.
#[derive(Debug, Clone)]
pub struct RetryTransport {
    client: reqwest::Client,
    single_url: String,
    batch_url: String,
    policy: RetryPolicy,
}

impl RetryTransport {
    /// Builds a transport whose HTTP client enforces `request_timeout` on
    /// every request, independent of the retry backoff.
    pub fn new(
        backend_url: &str,
        request_timeout: Duration,
        policy: RetryPolicy,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        let base = backend_url.trim_end_matches('/');
        Ok(RetryTransport {
            client,
            single_url: base.to_string(),
            batch_url: format!("{base}/batch"),
            policy,
        })
    }

    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    async fn post_with_retry(&self, url: &str, payload: Vec<u8>) -> Result<(), DeliveryFailure> {
        let mut last = String::new();

        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                let backoff = self.policy.backoff(attempt);
                info!(
                    "TRANSPORT | Retry attempt {}/{} after {:?}",
                    attempt, self.policy.max_retries, backoff
                );
                tokio::time::sleep(backoff).await;
            }

            let resp = self
                .client
                .post(url)
                .header(CONTENT_TYPE, "application/json")
                .body(payload.clone())
                .send()
                .await;

            match resp {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    let body = resp.text().await.unwrap_or_default();
                    if status.is_client_error() {
                        warn!(
                            "TRANSPORT | Backend rejected payload with HTTP {}, not retrying: {}",
                            status.as_u16(),
                            body
                        );
                        return Err(DeliveryFailure::Rejected {
                            status: status.as_u16(),
                            body,
                        });
                    }
                    debug!("TRANSPORT | Attempt {} got HTTP {}", attempt, status.as_u16());
                    last = format!("HTTP {}: {}", status.as_u16(), body);
                }
                Err(e) => {
                    debug!("TRANSPORT | Attempt {} failed: {}", attempt, e);
                    last = format!("HTTP request failed: {e}");
                }
            }
        }

        Err(DeliveryFailure::Exhausted {
            attempts: self.policy.max_retries + 1,
            last,
        })
    }
}

#[async_trait]
impl Transport for RetryTransport {
    async fn send(&self, batch: Batch) -> Result<(), DeliveryError> {
        let encoded = match batch.as_slice() {
            [] => return Ok(()),
            [single] => serde_json::to_vec(single).map(|p| (self.single_url.as_str(), p)),
            many => serde_json::to_vec(many).map(|p| (self.batch_url.as_str(), p)),
        };

        let (url, payload) = match encoded {
            Ok(encoded) => encoded,
            Err(e) => {
                return Err(DeliveryError {
                    batch,
                    failure: DeliveryFailure::Encode(e.to_string()),
                })
            }
        };

        match self.post_with_retry(url, payload).await {
            Ok(()) => {
                debug!("TRANSPORT | Successfully sent batch of {} logs", batch.len());
                Ok(())
            }
            Err(failure) => Err(DeliveryError { batch, failure }),
        }
    }
}
