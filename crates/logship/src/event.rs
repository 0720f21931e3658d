// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The unit of work flowing through the pipeline.
//!
//! A [`LogEvent`] serializes to exactly the JSON object the backend expects:
//!
//! ```json
//! {
//!   "raw_log": "GET /health 200",
//!   "source_type": "nginx",
//!   "metadata": {
//!     "hostname": "web-1",
//!     "os_family": "linux",
//!     "os_version": "x86_64",
//!     "agent_version": "0.1.0",
//!     "source_file": "/var/log/nginx/access.log",
//!     "tags": ["prod"]
//!   },
//!   "timestamp": "2025-01-01T12:00:00Z"
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::host::SystemInfo;

/// An ordered group of events delivered together.
pub type Batch = Vec<LogEvent>;

/// Metadata snapshot attached to every event.
///
/// Copied from [`SystemInfo`] when the event is built, so events never share
/// mutable state with each other or with the host snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub hostname: String,
    pub os_family: String,
    pub os_version: String,
    pub agent_version: String,
    pub source_file: String,
    pub tags: Vec<String>,
}

/// A single captured log line.
///
/// Fields are private: once built, the line, its classification and its
/// metadata cannot change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    raw_log: String,
    source_type: String,
    metadata: EventMetadata,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

impl LogEvent {
    /// Builds an event stamped with the current time.
    #[must_use]
    pub fn new(
        raw_log: impl Into<String>,
        source_type: impl Into<String>,
        source_file: &Path,
        system_info: &SystemInfo,
    ) -> Self {
        Self::with_timestamp(
            raw_log,
            source_type,
            source_file,
            system_info,
            OffsetDateTime::now_utc(),
        )
    }

    #[must_use]
    pub fn with_timestamp(
        raw_log: impl Into<String>,
        source_type: impl Into<String>,
        source_file: &Path,
        system_info: &SystemInfo,
        timestamp: OffsetDateTime,
    ) -> Self {
        LogEvent {
            raw_log: raw_log.into(),
            source_type: source_type.into(),
            metadata: EventMetadata {
                hostname: system_info.hostname.clone(),
                os_family: system_info.os_family.clone(),
                os_version: system_info.os_version.clone(),
                agent_version: system_info.agent_version.clone(),
                source_file: source_file.display().to_string(),
                tags: system_info.tags.clone(),
            },
            timestamp,
        }
    }

    #[must_use]
    pub fn raw_log(&self) -> &str {
        &self.raw_log
    }

    #[must_use]
    pub fn source_type(&self) -> &str {
        &self.source_type
    }

    #[must_use]
    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }
}
