// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::io::{self, Write};
use std::process::ExitCode;

use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use logpull::constants::DEFAULT_PIPELINE_CAPACITY;
use logpull::{Config, LogEntry, LogpullTarget, TargetStatus};

const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var("DD_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_writer(io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error creating logpull configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let target = match LogpullTarget::new(config) {
        Ok(t) => t,
        Err(e) => {
            error!("Error starting logpull target: {e}");
            return ExitCode::FAILURE;
        }
    };
    let metrics = target.metrics();

    let (tx, rx) = mpsc::channel(DEFAULT_PIPELINE_CAPACITY);
    let writer = tokio::task::spawn_blocking(move || write_entries(rx));
    let handle = target.start(tx);
    let mut status = handle.subscribe();

    let mut metrics_interval = interval(METRICS_LOG_INTERVAL);
    metrics_interval.tick().await; // discard first tick, which is instantaneous

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("Shutdown signal received, stopping logpull target");
                break;
            }
            changed = status.wait_for(TargetStatus::is_finished) => {
                if changed.is_err() {
                    error!("Logpull target status channel closed");
                }
                break;
            }
            _ = metrics_interval.tick() => {
                let snapshot = metrics.snapshot();
                info!(
                    entries = snapshot.entries_total,
                    last_requested_end = snapshot.last_requested_end_timestamp,
                    windows = snapshot.windows_total,
                    duplicates = snapshot.duplicates_total,
                    requeues = snapshot.window_requeues_total,
                    "logpull progress"
                );
            }
        }
    }

    let result = handle.stop().await;
    if let Err(e) = writer.await {
        error!("Entry writer task failed: {e}");
    }
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Logpull target stopped with error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Writes one JSON object per entry to stdout until the channel closes.
fn write_entries(mut rx: mpsc::Receiver<LogEntry>) {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    while let Some(entry) = rx.blocking_recv() {
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize entry: {e}");
                continue;
            }
        };
        if let Err(e) = writeln!(out, "{line}") {
            error!("Failed to write entry to stdout: {e}");
            return;
        }
    }
    let _ = out.flush();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
