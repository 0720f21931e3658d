// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use logship::agent::Agent;
use logship::config::{log_level::LogLevel, Config};
use logship::logger::Formatter;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";

#[tokio::main]
pub async fn main() -> ExitCode {
    let config_path = env::var("LOGSHIP_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let loaded = Config::load(&config_path);
    let log_level = loaded
        .as_ref()
        .map(|config| config.log_level)
        .unwrap_or_default();
    init_logging(log_level);

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("AGENT | Failed to load {}: {}", config_path.display(), e);
            return ExitCode::FAILURE;
        }
    };
    info!(
        "AGENT | Loaded configuration from {} ({} log files)",
        config_path.display(),
        config.log_files.len()
    );

    let mut agent = Agent::new(config);
    if let Err(e) = agent.start().await {
        error!("AGENT | Failed to start: {}", e);
        return ExitCode::FAILURE;
    }

    let reason = agent.wait_for_shutdown().await;
    debug!("AGENT | Shutdown reason: {:?}", reason);
    agent.shutdown().await;

    ExitCode::SUCCESS
}

fn init_logging(level: LogLevel) {
    let env_filter = format!("h2=off,hyper=off,rustls=off,{level}");
    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .event_format(Formatter)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("LOGSHIP | ERROR | failed to install log subscriber: {e}");
    }
    debug!("AGENT | Logging subsystem enabled");
}
