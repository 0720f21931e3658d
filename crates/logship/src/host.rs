// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host identity collected once at startup.

use std::env;

use tracing::warn;

use crate::config::MetadataOverrides;
use crate::AGENT_VERSION;

/// Read-only snapshot of the host the agent runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    pub hostname: String,
    pub os_family: String,
    pub os_version: String,
    pub agent_version: String,
    pub tags: Vec<String>,
}

impl SystemInfo {
    /// Collects the host identity.
    ///
    /// `os_version` carries the CPU architecture, which is the most stable
    /// identifier available without shelling out.
    #[must_use]
    pub fn collect() -> Self {
        SystemInfo {
            hostname: get_hostname(),
            os_family: env::consts::OS.to_string(),
            os_version: env::consts::ARCH.to_string(),
            agent_version: AGENT_VERSION.to_string(),
            tags: Vec::new(),
        }
    }

    /// Applies the non-empty overrides from configuration.
    #[must_use]
    pub fn with_overrides(mut self, overrides: &MetadataOverrides) -> Self {
        if let Some(hostname) = overrides.hostname.as_deref().filter(|h| !h.is_empty()) {
            self.hostname = hostname.to_string();
        }
        if let Some(os_family) = overrides.os_family.as_deref().filter(|o| !o.is_empty()) {
            self.os_family = os_family.to_string();
        }
        if !overrides.tags.is_empty() {
            self.tags.clone_from(&overrides.tags);
        }
        self
    }
}

/// Resolves the hostname.
///
/// Order: `LOGSHIP_HOSTNAME`, `HOSTNAME`, `gethostname(2)`, then `"unknown"`.
#[must_use]
pub fn get_hostname() -> String {
    for var in ["LOGSHIP_HOSTNAME", "HOSTNAME"] {
        if let Ok(hostname) = env::var(var) {
            if !hostname.is_empty() {
                return hostname;
            }
        }
    }

    match nix::unistd::gethostname() {
        Ok(hostname) => {
            if let Some(hostname) = hostname.to_str().filter(|h| !h.is_empty()) {
                return hostname.to_string();
            }
        }
        Err(e) => warn!("AGENT | Failed to get system hostname: {}", e),
    }

    warn!("AGENT | Could not determine hostname, using 'unknown'");
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_fills_every_field() {
        let info = SystemInfo::collect();
        assert!(!info.hostname.is_empty());
        assert_eq!(info.os_family, env::consts::OS);
        assert_eq!(info.os_version, env::consts::ARCH);
        assert_eq!(info.agent_version, AGENT_VERSION);
        assert!(info.tags.is_empty());
    }

    #[test]
    fn test_overrides_replace_non_empty_values() {
        let overrides = MetadataOverrides {
            hostname: Some("edge-7".to_string()),
            os_family: Some("freebsd".to_string()),
            tags: vec!["dc:ams".to_string()],
        };

        let info = SystemInfo::collect().with_overrides(&overrides);

        assert_eq!(info.hostname, "edge-7");
        assert_eq!(info.os_family, "freebsd");
        assert_eq!(info.tags, vec!["dc:ams"]);
    }

    #[test]
    fn test_empty_overrides_keep_collected_values() {
        let collected = SystemInfo::collect();
        let overrides = MetadataOverrides {
            hostname: Some(String::new()),
            os_family: None,
            tags: Vec::new(),
        };

        let info = collected.clone().with_overrides(&overrides);

        assert_eq!(info, collected);
    }
}
