// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::*;
use crate::record::FieldsType;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_base: String,
    pub api_token: String,
    pub zone_id: String,
    pub fields_type: FieldsType,
    pub additional_fields: Vec<String>,
    /// Static labels attached to every forwarded entry.
    pub labels: BTreeMap<String, String>,
    /// Nominal length of a pull window.
    pub window_size: Duration,
    /// How far each window reaches back into its predecessor.
    pub overlap: Duration,
    /// Distance kept from wall-clock now; the API serves recent data late.
    pub safety_lag: Duration,
    /// Where to start when no checkpoint exists.
    pub initial_lookback: Duration,
    pub min_window: Duration,
    pub max_window: Duration,
    pub workers: usize,
    pub requests_per_second: u32,
    pub request_burst: u32,
    pub request_timeout: Duration,
    /// Retries of one page request after its first attempt.
    pub max_retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Attempts of a whole window before the engine halts.
    pub max_window_attempts: u32,
    /// Idle time between scheduler polls once caught up.
    pub poll_interval: Duration,
    pub positions_path: Option<PathBuf>,
    pub https_proxy: Option<String>,
}

impl Config {
    /// Builds a configuration with defaults for everything but the credentials.
    pub fn new(zone_id: impl Into<String>, api_token: impl Into<String>) -> Self {
        Config {
            api_base: DEFAULT_API_BASE.to_string(),
            api_token: api_token.into(),
            zone_id: zone_id.into(),
            fields_type: FieldsType::Default,
            additional_fields: Vec::new(),
            labels: BTreeMap::new(),
            window_size: DEFAULT_WINDOW_SIZE,
            overlap: DEFAULT_OVERLAP,
            safety_lag: DEFAULT_SAFETY_LAG,
            initial_lookback: DEFAULT_INITIAL_LOOKBACK,
            min_window: MIN_WINDOW,
            max_window: MAX_WINDOW,
            workers: DEFAULT_WORKERS,
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            request_burst: DEFAULT_REQUESTS_PER_SECOND,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            min_backoff: DEFAULT_MIN_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            max_window_attempts: DEFAULT_MAX_WINDOW_ATTEMPTS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            positions_path: None,
            https_proxy: None,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(env::vars())
    }

    /// Reads `LOGPULL_*` variables from the given iterator and validates the result.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: BTreeMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        let get = |name: &str| vars.get(name).map(|v| v.trim().to_string());

        let api_token = get("LOGPULL_API_TOKEN").ok_or(ConfigError::Missing("LOGPULL_API_TOKEN"))?;
        let zone_id = get("LOGPULL_ZONE_ID").ok_or(ConfigError::Missing("LOGPULL_ZONE_ID"))?;
        let mut config = Config::new(zone_id, api_token);

        if let Some(url) = get("LOGPULL_API_URL") {
            config.api_base = url.trim_end_matches('/').to_string();
        }
        if let Some(fields_type) = get("LOGPULL_FIELDS_TYPE") {
            config.fields_type = fields_type
                .parse()
                .map_err(|reason| ConfigError::InvalidValue {
                    name: "LOGPULL_FIELDS_TYPE",
                    reason,
                })?;
        }
        if let Some(fields) = get("LOGPULL_ADDITIONAL_FIELDS") {
            config.additional_fields = fields
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(labels) = get("LOGPULL_LABELS") {
            config.labels = parse_labels(&labels);
        }

        let durations: [(&'static str, &mut Duration); 8] = [
            ("LOGPULL_WINDOW_SIZE", &mut config.window_size),
            ("LOGPULL_OVERLAP", &mut config.overlap),
            ("LOGPULL_SAFETY_LAG", &mut config.safety_lag),
            ("LOGPULL_INITIAL_LOOKBACK", &mut config.initial_lookback),
            ("LOGPULL_REQUEST_TIMEOUT", &mut config.request_timeout),
            ("LOGPULL_MIN_BACKOFF", &mut config.min_backoff),
            ("LOGPULL_MAX_BACKOFF", &mut config.max_backoff),
            ("LOGPULL_POLL_INTERVAL", &mut config.poll_interval),
        ];
        for (name, slot) in durations {
            if let Some(raw) = vars.get(name) {
                *slot = parse_duration(raw).map_err(|reason| ConfigError::InvalidValue { name, reason })?;
            }
        }

        if let Some(raw) = get("LOGPULL_WORKERS") {
            config.workers = parse_number("LOGPULL_WORKERS", &raw)?;
        }
        if let Some(raw) = get("LOGPULL_REQUESTS_PER_SECOND") {
            config.requests_per_second = parse_number("LOGPULL_REQUESTS_PER_SECOND", &raw)?;
            config.request_burst = config.requests_per_second;
        }
        if let Some(raw) = get("LOGPULL_REQUEST_BURST") {
            config.request_burst = parse_number("LOGPULL_REQUEST_BURST", &raw)?;
        }
        if let Some(raw) = get("LOGPULL_MAX_RETRIES") {
            config.max_retries = parse_number("LOGPULL_MAX_RETRIES", &raw)?;
        }
        if let Some(raw) = get("LOGPULL_MAX_WINDOW_ATTEMPTS") {
            config.max_window_attempts = parse_number("LOGPULL_MAX_WINDOW_ATTEMPTS", &raw)?;
        }

        config.positions_path = get("LOGPULL_POSITIONS_FILE").map(PathBuf::from);
        config.https_proxy = get("DD_PROXY_HTTPS").or_else(|| get("HTTPS_PROXY"));

        config.validate()?;
        Ok(config)
    }

    /// Rejects combinations the API or the engine cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.zone_id.is_empty() {
            return Err(ConfigError::Invalid("zone id must not be empty".into()));
        }
        if self.api_token.is_empty() {
            return Err(ConfigError::Invalid("api token must not be empty".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.requests_per_second == 0 || self.request_burst == 0 {
            return Err(ConfigError::Invalid(
                "request rate and burst must be at least 1".into(),
            ));
        }
        if self.max_window_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max window attempts must be at least 1".into(),
            ));
        }
        if self.window_size.subsec_nanos() != 0 || self.overlap.subsec_nanos() != 0 {
            return Err(ConfigError::Invalid(
                "window size and overlap must be whole seconds".into(),
            ));
        }
        if self.min_window.is_zero() || self.min_window > self.max_window {
            return Err(ConfigError::Invalid(format!(
                "api window bounds {:?}..{:?} are empty",
                self.min_window, self.max_window
            )));
        }
        if self.window_size < self.min_window {
            return Err(ConfigError::Invalid(format!(
                "window size {:?} is below the api minimum {:?}",
                self.window_size, self.min_window
            )));
        }
        if self.max_window > MAX_LOOKBACK {
            return Err(ConfigError::Invalid(format!(
                "api maximum window {:?} exceeds the retention of {:?}",
                self.max_window, MAX_LOOKBACK
            )));
        }
        let fits = self
            .window_size
            .checked_add(self.overlap)
            .is_some_and(|reach| reach <= self.max_window);
        if !fits {
            return Err(ConfigError::Invalid(format!(
                "window size {:?} plus overlap {:?} exceeds the api maximum {:?}",
                self.window_size, self.overlap, self.max_window
            )));
        }
        if self.initial_lookback > MAX_LOOKBACK || self.safety_lag > MAX_LOOKBACK {
            return Err(ConfigError::Invalid(format!(
                "initial lookback {:?} and safety lag {:?} must not exceed {:?}",
                self.initial_lookback, self.safety_lag, MAX_LOOKBACK
            )));
        }
        if self.max_backoff > MAX_DELAY || self.poll_interval > MAX_DELAY {
            return Err(ConfigError::Invalid(format!(
                "max backoff {:?} and poll interval {:?} must not exceed {:?}",
                self.max_backoff, self.poll_interval, MAX_DELAY
            )));
        }
        if self.overlap >= self.window_size {
            return Err(ConfigError::Invalid(
                "overlap must be shorter than the window size".into(),
            ));
        }
        if self.min_backoff > self.max_backoff {
            return Err(ConfigError::Invalid(
                "min backoff must not exceed max backoff".into(),
            ));
        }
        Ok(())
    }

    /// Key the checkpoint is stored under in the positions file.
    pub fn position_key(&self) -> String {
        format!("{POSITION_KEY_PREFIX}{}", self.zone_id)
    }

    /// Labels attached to every forwarded entry: the static labels plus `zone_id`.
    pub fn entry_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert("zone_id".to_string(), self.zone_id.clone());
        labels
    }
}

/// Parses `key:value` pairs separated by spaces or commas. Malformed pairs are skipped.
pub fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    raw.replace(',', " ")
        .split_whitespace()
        .filter_map(|kv| {
            let (k, v) = kv.split_once(':')?;
            if k.is_empty() || v.is_empty() {
                return None;
            }
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

/// Accepts humantime strings (`30s`, `5m`, `1h 30m`) or bare seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(raw).map_err(|e| e.to_string())
}

fn parse_number<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
        name,
        reason: e.to_string(),
    })
}
