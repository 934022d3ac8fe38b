// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Limits and defaults for the Cloudflare Logpull API.

use std::time::Duration;

/// Base URL of the Cloudflare v4 API.
pub const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Path template appended to the API base. `{zone_id}` is substituted.
pub const LOGS_RECEIVED_PATH: &str = "/zones/{zone_id}/logs/received";

/// Response header carrying the continuation cursor for the current window.
pub const NEXT_CURSOR_HEADER: &str = "x-logpull-next-cursor";

/// Field holding the provider-assigned record identifier.
pub const RECORD_ID_FIELD: &str = "RayID";

/// Field holding the record timestamp.
pub const RECORD_TIMESTAMP_FIELD: &str = "EdgeStartTimestamp";

/// Prefix of the key the checkpoint is stored under in the positions file.
pub const POSITION_KEY_PREFIX: &str = "cloudflare-";

/// Shortest window the API accepts.
pub const MIN_WINDOW: Duration = Duration::from_secs(1);

/// Longest window the API accepts.
pub const MAX_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Oldest data the API retains. Bounds the initial lookback and the safety lag.
pub const MAX_LOOKBACK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Longest configurable backoff or poll interval.
pub const MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

pub const DEFAULT_WINDOW_SIZE: Duration = Duration::from_secs(60);
pub const DEFAULT_OVERLAP: Duration = Duration::from_secs(5);
pub const DEFAULT_SAFETY_LAG: Duration = Duration::from_secs(60);
pub const DEFAULT_INITIAL_LOOKBACK: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_WORKERS: usize = 3;
pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 4;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Retries of a single page request before the window attempt is failed.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Attempts of a whole window before the engine halts.
pub const DEFAULT_MAX_WINDOW_ATTEMPTS: u32 = 3;

pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Capacity of the channel between the forwarder and the downstream pipeline.
pub const DEFAULT_PIPELINE_CAPACITY: usize = 1_024;

/// Metric name of the forwarded entries counter.
pub const ENTRIES_METRIC: &str = "loki_source_cloudflare_target_entries_total";

/// Metric name of the last requested window end gauge.
pub const LAST_END_METRIC: &str = "loki_source_cloudflare_target_last_requested_end_timestamp";
