// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use crate::checkpoint::CheckpointError;
use crate::config::ConfigError;
use crate::forwarder::ForwardError;
use crate::record::ParseError;
use crate::window::TimeWindow;

/// Failure of a single page request.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("rate limited by the api")]
    RateLimited { retry_after: Option<Duration> },
    #[error("api server error: status {0}")]
    Server(u16),
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("api rejected request: status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(#[from] ParseError),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<FetchError> },
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Rate limiting, server errors, timeouts and transport failures may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::RateLimited { .. }
                | FetchError::Server(_)
                | FetchError::Timeout
                | FetchError::Transport(_)
        )
    }

    pub(crate) fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

/// Errors that stop the engine. None of them let the checkpoint move past the failing window.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("window {window} failed permanently: {source}")]
    WindowFailed {
        window: TimeWindow,
        #[source]
        source: FetchError,
    },
    #[error("window {window} still failing after {attempts} attempts: {source}")]
    WindowExhausted {
        window: TimeWindow,
        attempts: u32,
        #[source]
        source: FetchError,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("forward error: {0}")]
    Forward(#[from] ForwardError),
    #[error("worker task failed: {0}")]
    Worker(String),
}

/// Errors that prevent a target from starting.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}
