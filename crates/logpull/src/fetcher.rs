// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Page fetching against the Logpull API.
//!
//! [`PageFetcher::fetch`] performs exactly one request and never retries.
//! [`fetch_window`] layers the shared request budget, the retry state machine
//! and pagination on top of it; that is what a worker runs for one window.

use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use fnv::FnvBuildHasher;
use hashbrown::HashSet;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::config::Config;
use crate::constants::{LOGS_RECEIVED_PATH, NEXT_CURSOR_HEADER};
use crate::errors::FetchError;
use crate::rate_limit::RequestBudget;
use crate::record::{field_list, parse_ndjson, ParseError, RawRecord};
use crate::retry::{run_with_retry, RetryPolicy};
use crate::window::TimeWindow;

/// Longest response body kept in a rejection error.
const MAX_ERROR_BODY: usize = 512;

/// One page of a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub window: TimeWindow,
    pub records: Vec<RawRecord>,
    /// More pages remain when present.
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Requests a single page of `window`, continuing from `cursor` when given.
    async fn fetch(
        &self,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<FetchResult, FetchError>;
}

/// HTTP client for `GET /zones/{zone_id}/logs/received`.
#[derive(Debug, Clone)]
pub struct LogpullClient {
    client: reqwest::Client,
    url: String,
    api_token: String,
    fields: String,
}

impl LogpullClient {
    pub fn new(config: &Config) -> Result<Self, reqwest::Error> {
        let client = build_client(config.https_proxy.as_deref(), config.request_timeout)?;
        let url = format!(
            "{}{}",
            config.api_base,
            LOGS_RECEIVED_PATH.replace("{zone_id}", &config.zone_id)
        );
        Ok(LogpullClient {
            client,
            url,
            api_token: config.api_token.clone(),
            fields: field_list(config.fields_type, &config.additional_fields).join(","),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn fields(&self) -> &str {
        &self.fields
    }
}

#[async_trait]
impl PageFetcher for LogpullClient {
    async fn fetch(
        &self,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<FetchResult, FetchError> {
        let mut query = vec![
            ("start", window.start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("end", window.end.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("fields", self.fields.clone()),
            ("timestamps", "unixnano".to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        trace!(url = %self.url, %window, cursor = ?cursor, "logpull request");

        let response = self
            .client
            .get(&self.url)
            .bearer_auth(&self.api_token)
            .query(&query)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, body));
        }

        let next_cursor = response
            .headers()
            .get(NEXT_CURSOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from);
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::from_reqwest(&e))?;
        let records = parse_ndjson(&body)?;

        debug!(
            %window,
            records = records.len(),
            has_more = next_cursor.is_some(),
            "logpull page received"
        );
        Ok(FetchResult {
            window: *window,
            records,
            next_cursor,
        })
    }
}

/// Maps a non-success status to the fetch error taxonomy.
fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: String) -> FetchError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return FetchError::RateLimited { retry_after };
    }
    if status.is_server_error() {
        return FetchError::Server(status.as_u16());
    }
    if status == StatusCode::FORBIDDEN || status == StatusCode::UNAUTHORIZED {
        error!("Logpull request was denied: please verify that the API token can read zone logs");
    }
    let mut body = body;
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    FetchError::Rejected {
        status: status.as_u16(),
        body,
    }
}

fn build_client(proxy: Option<&str>, timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    builder.build()
}

/// Pulls every page of `window`, in order.
///
/// Each request first takes a slot from the shared budget, and each page is
/// retried per `policy`. A window only completes once the API stops returning
/// a continuation cursor.
pub async fn fetch_window(
    fetcher: &dyn PageFetcher,
    budget: &RequestBudget,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    window: TimeWindow,
) -> Result<Vec<RawRecord>, FetchError> {
    let mut records = Vec::new();
    let mut cursor: Option<String> = None;
    let mut seen: HashSet<String, FnvBuildHasher> = HashSet::default();
    let mut pages = 0usize;

    loop {
        let window_ref = &window;
        let cursor_ref = cursor.as_deref();
        let page = run_with_retry(policy, cancel, || async move {
            if !budget.acquire_or_cancel(cancel).await {
                return Err(FetchError::Cancelled);
            }
            fetcher.fetch(window_ref, cursor_ref).await
        })
        .await?;
        pages += 1;
        records.extend(page.records);

        // A cursor handed out twice for one window would page forever.
        match page.next_cursor {
            Some(next) if !seen.insert(next.clone()) => {
                return Err(ParseError::RepeatedCursor(next).into());
            }
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    debug!(%window, pages, records = records.len(), "window fetched");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use std::sync::Mutex;

    fn window() -> TimeWindow {
        TimeWindow {
            seq: 0,
            start: DateTime::from_timestamp(0, 0).expect("valid timestamp"),
            end: DateTime::from_timestamp(60, 0).expect("valid timestamp"),
        }
    }

    fn record(id: &str) -> RawRecord {
        RawRecord::new(
            id,
            DateTime::from_timestamp(1, 0).expect("valid timestamp"),
            format!("{{\"RayID\":\"{id}\"}}"),
        )
    }

    /// Serves scripted responses in order and records the cursors it was called with.
    struct Scripted {
        responses: Mutex<Vec<Result<(Vec<RawRecord>, Option<String>), FetchError>>>,
        cursors: Mutex<Vec<Option<String>>>,
    }

    impl Scripted {
        fn new(mut responses: Vec<Result<(Vec<RawRecord>, Option<String>), FetchError>>) -> Self {
            responses.reverse();
            Scripted {
                responses: Mutex::new(responses),
                cursors: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageFetcher for Scripted {
        async fn fetch(
            &self,
            window: &TimeWindow,
            cursor: Option<&str>,
        ) -> Result<FetchResult, FetchError> {
            self.cursors
                .lock()
                .expect("lock poisoned")
                .push(cursor.map(String::from));
            let next = self
                .responses
                .lock()
                .expect("lock poisoned")
                .pop()
                .expect("unexpected fetch");
            next.map(|(records, next_cursor)| FetchResult {
                window: *window,
                records,
                next_cursor,
            })
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn follows_cursors_until_exhausted() {
        let fetcher = Scripted::new(vec![
            Ok((vec![record("a")], Some("c1".into()))),
            Err(FetchError::Server(502)),
            Ok((vec![record("b"), record("c")], Some("c2".into()))),
            Ok((vec![], None)),
        ]);
        let budget = RequestBudget::new(1000, 1000);
        let records = fetch_window(
            &fetcher,
            &budget,
            &policy(),
            &CancellationToken::new(),
            window(),
        )
        .await
        .expect("window should be fetched");

        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(
            *fetcher.cursors.lock().expect("lock poisoned"),
            vec![None, Some("c1".into()), Some("c1".into()), Some("c2".into())]
        );
    }

    #[tokio::test]
    async fn repeated_cursor_is_malformed() {
        let fetcher = Scripted::new(vec![
            Ok((vec![], Some("same".into()))),
            Ok((vec![], Some("same".into()))),
        ]);
        let budget = RequestBudget::new(1000, 1000);
        let err = fetch_window(
            &fetcher,
            &budget,
            &policy(),
            &CancellationToken::new(),
            window(),
        )
        .await
        .unwrap_err();
        assert_eq!(
            err,
            FetchError::Malformed(ParseError::RepeatedCursor("same".into()))
        );
    }

    #[tokio::test]
    async fn cursor_cycle_is_malformed() {
        let fetcher = Scripted::new(vec![
            Ok((vec![record("a")], Some("a".into()))),
            Ok((vec![record("b")], Some("b".into()))),
            Ok((vec![record("c")], Some("a".into()))),
        ]);
        let budget = RequestBudget::new(1000, 1000);
        let err = fetch_window(
            &fetcher,
            &budget,
            &policy(),
            &CancellationToken::new(),
            window(),
        )
        .await
        .unwrap_err();
        assert_eq!(
            err,
            FetchError::Malformed(ParseError::RepeatedCursor("a".into()))
        );
        assert_eq!(fetcher.cursors.lock().expect("lock poisoned").len(), 3);
    }

    #[tokio::test]
    async fn permanent_page_error_fails_window() {
        let fetcher = Scripted::new(vec![
            Ok((vec![record("a")], Some("c1".into()))),
            Err(FetchError::Rejected {
                status: 400,
                body: "bad cursor".into(),
            }),
        ]);
        let budget = RequestBudget::new(1000, 1000);
        let err = fetch_window(
            &fetcher,
            &budget,
            &policy(),
            &CancellationToken::new(),
            window(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FetchError::Rejected { status: 400, .. }));
    }

    #[test]
    fn classify() {
        assert_eq!(
            classify_status(
                StatusCode::TOO_MANY_REQUESTS,
                Some(Duration::from_secs(3)),
                String::new()
            ),
            FetchError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, None, String::new()),
            FetchError::Server(502)
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, None, "no zone".into()),
            FetchError::Rejected {
                status: 404,
                body: "no zone".into()
            }
        );
        match classify_status(StatusCode::BAD_REQUEST, None, "é".repeat(400)) {
            FetchError::Rejected { body, .. } => assert!(body.len() <= MAX_ERROR_BODY),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn client_url_and_fields() {
        let mut config = Config::new("zone-1", "token");
        config.api_base = "http://localhost:1234".into();
        config.fields_type = crate::record::FieldsType::Custom;
        config.additional_fields = vec!["ClientIP".into()];
        let client = LogpullClient::new(&config).expect("client should build");
        assert_eq!(client.url(), "http://localhost:1234/zones/zone-1/logs/received");
        assert_eq!(client.fields(), "ClientIP,RayID,EdgeStartTimestamp");
    }
}
