// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Records as fetched from the API and entries as handed to the pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::constants::{RECORD_ID_FIELD, RECORD_TIMESTAMP_FIELD};

/// One log record as returned by the API. Never mutated after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// The NDJSON line the record was parsed from.
    pub payload: Arc<str>,
}

impl RawRecord {
    pub fn new(id: impl Into<String>, timestamp: DateTime<Utc>, payload: impl Into<Arc<str>>) -> Self {
        RawRecord {
            id: id.into(),
            timestamp,
            payload: payload.into(),
        }
    }
}

/// A record normalized into the shape the downstream pipeline expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub line: String,
    pub labels: BTreeMap<String, String>,
}

impl LogEntry {
    pub fn from_record(record: &RawRecord, labels: &BTreeMap<String, String>) -> Self {
        LogEntry {
            timestamp: record.timestamp,
            line: record.payload.to_string(),
            labels: labels.clone(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: invalid JSON: {reason}")]
    InvalidJson { line: usize, reason: String },
    #[error("line {line}: missing or invalid field {field}")]
    MissingField { line: usize, field: &'static str },
    #[error("continuation cursor {0} returned twice")]
    RepeatedCursor(String),
}

/// Parses a newline-delimited JSON body into records, preserving order.
///
/// Blank lines are skipped. Any other line that is not an object carrying a
/// `RayID` and an `EdgeStartTimestamp` fails the whole page.
pub fn parse_ndjson(body: &str) -> Result<Vec<RawRecord>, ParseError> {
    let mut records = Vec::new();
    for (idx, raw_line) in body.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        let line_no = idx + 1;
        let value: Value = serde_json::from_str(line).map_err(|e| ParseError::InvalidJson {
            line: line_no,
            reason: e.to_string(),
        })?;

        let id = value
            .get(RECORD_ID_FIELD)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or(ParseError::MissingField {
                line: line_no,
                field: RECORD_ID_FIELD,
            })?;
        let timestamp = value
            .get(RECORD_TIMESTAMP_FIELD)
            .and_then(parse_timestamp)
            .ok_or(ParseError::MissingField {
                line: line_no,
                field: RECORD_TIMESTAMP_FIELD,
            })?;

        records.push(RawRecord::new(id, timestamp, line));
    }
    Ok(records)
}

// Logpull returns unix nanoseconds with `timestamps=unixnano`, RFC 3339 otherwise.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().map(DateTime::from_timestamp_nanos),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        _ => None,
    }
}

/// Which set of Logpull fields to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldsType {
    #[default]
    Default,
    Minimal,
    Extended,
    All,
    /// Only the configured additional fields.
    Custom,
}

impl std::str::FromStr for FieldsType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" | "" => Ok(FieldsType::Default),
            "minimal" => Ok(FieldsType::Minimal),
            "extended" => Ok(FieldsType::Extended),
            "all" => Ok(FieldsType::All),
            "custom" => Ok(FieldsType::Custom),
            other => Err(format!("unknown fields type '{other}'")),
        }
    }
}

const DEFAULT_FIELDS: &[&str] = &[
    "ClientIP",
    "ClientRequestHost",
    "ClientRequestMethod",
    "ClientRequestURI",
    "EdgeEndTimestamp",
    "EdgeResponseBytes",
    "EdgeRequestHost",
    "EdgeResponseStatus",
    "EdgeStartTimestamp",
    "RayID",
];

const MINIMAL_FIELDS: &[&str] = &[
    "ZoneID",
    "ClientSSLProtocol",
    "ClientRequestProtocol",
    "ClientRequestPath",
    "ClientRequestUserAgent",
    "ClientRequestReferer",
    "EdgeColoCode",
    "ClientCountry",
    "CacheCacheStatus",
    "CacheResponseStatus",
    "EdgeResponseContentType",
];

const EXTENDED_FIELDS: &[&str] = &[
    "ClientASN",
    "ClientSSLCipher",
    "ClientRequestBytes",
    "ClientSrcPort",
    "ClientXRequestedWith",
    "EdgePathingOp",
    "EdgePathingSrc",
    "EdgePathingStatus",
    "EdgeRateLimitAction",
    "EdgeRateLimitID",
    "EdgeServerIP",
    "OriginIP",
    "OriginResponseStatus",
    "OriginSSLProtocol",
    "OriginResponseTime",
    "ParentRayID",
    "SecurityLevel",
    "WAFAction",
    "WAFProfile",
    "WAFRuleID",
    "WAFRuleMessage",
    "WorkerCPUTime",
    "WorkerStatus",
    "WorkerSubrequest",
];

const ALL_FIELDS: &[&str] = &[
    "BotScore",
    "BotScoreSrc",
    "ClientRequestScheme",
    "ClientTCPRTTMs",
    "ClientMTLSAuthStatus",
    "EdgeCFConnectingO2O",
    "EdgeRequestHeaders",
    "EdgeResponseCompressionRatio",
    "EdgeTimeToFirstByteMs",
    "OriginDNSResponseTimeMs",
    "OriginRequestHeaderSendDurationMs",
    "OriginTCPHandshakeDurationMs",
    "OriginTLSHandshakeDurationMs",
    "SmartRouteColoID",
    "UpperTierColoID",
];

/// Returns the field list for `fields_type` with `additional` appended.
///
/// Duplicates are dropped keeping first occurrence. The identifier and
/// timestamp fields are always included since dedup and ordering need them.
pub fn field_list(fields_type: FieldsType, additional: &[String]) -> Vec<String> {
    let base: Vec<&[&str]> = match fields_type {
        FieldsType::Default => vec![DEFAULT_FIELDS],
        FieldsType::Minimal => vec![DEFAULT_FIELDS, MINIMAL_FIELDS],
        FieldsType::Extended => vec![DEFAULT_FIELDS, MINIMAL_FIELDS, EXTENDED_FIELDS],
        FieldsType::All => vec![DEFAULT_FIELDS, MINIMAL_FIELDS, EXTENDED_FIELDS, ALL_FIELDS],
        FieldsType::Custom => vec![],
    };

    let mut fields: Vec<String> = Vec::new();
    let candidates = base
        .into_iter()
        .flat_map(|set| set.iter().map(|f| (*f).to_string()))
        .chain(additional.iter().map(|f| f.trim().to_string()))
        .chain([RECORD_ID_FIELD.to_string(), RECORD_TIMESTAMP_FIELD.to_string()]);
    for field in candidates {
        if !field.is_empty() && !fields.contains(&field) {
            fields.push(field);
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unixnano_and_rfc3339_timestamps() {
        let body = concat!(
            "{\"RayID\":\"a1\",\"EdgeStartTimestamp\":1700000000000000000}\n",
            "\n",
            "{\"RayID\":\"b2\",\"EdgeStartTimestamp\":\"2023-11-14T22:13:21Z\"}\n",
        );
        let records = parse_ndjson(body).expect("failed to parse");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "a1");
        assert_eq!(records[0].timestamp.timestamp(), 1_700_000_000);
        assert_eq!(records[1].id, "b2");
        assert_eq!(records[1].timestamp.timestamp(), 1_700_000_001);
        assert_eq!(
            &*records[1].payload,
            "{\"RayID\":\"b2\",\"EdgeStartTimestamp\":\"2023-11-14T22:13:21Z\"}"
        );
    }

    #[test]
    fn rejects_records_without_identifier() {
        let body = "{\"EdgeStartTimestamp\":1}\n";
        assert_eq!(
            parse_ndjson(body),
            Err(ParseError::MissingField {
                line: 1,
                field: RECORD_ID_FIELD
            })
        );
    }

    #[test]
    fn rejects_invalid_json() {
        let body = "{\"RayID\":\"a\",\"EdgeStartTimestamp\":1}\nnot json\n";
        assert!(matches!(
            parse_ndjson(body),
            Err(ParseError::InvalidJson { line: 2, .. })
        ));
    }

    #[test]
    fn empty_body_is_an_empty_page() {
        assert_eq!(parse_ndjson(""), Ok(vec![]));
    }

    #[test]
    fn field_list_dedups_and_keeps_required_fields() {
        let fields = field_list(
            FieldsType::Custom,
            &["ClientIP".to_string(), "ClientIP".to_string(), " ".to_string()],
        );
        assert_eq!(fields, vec!["ClientIP", "RayID", "EdgeStartTimestamp"]);

        let default = field_list(FieldsType::Default, &["ZoneID".to_string()]);
        assert_eq!(default.len(), DEFAULT_FIELDS.len() + 1);
        assert_eq!(default.last().map(String::as_str), Some("ZoneID"));

        let all = field_list(FieldsType::All, &[]);
        assert!(all.len() > field_list(FieldsType::Extended, &[]).len());
    }

    #[test]
    fn fields_type_from_str() {
        assert_eq!("Extended".parse::<FieldsType>(), Ok(FieldsType::Extended));
        assert_eq!("".parse::<FieldsType>(), Ok(FieldsType::Default));
        assert!("everything".parse::<FieldsType>().is_err());
    }

    #[test]
    fn entry_keeps_payload_and_labels() {
        let record = RawRecord::new("id", DateTime::from_timestamp_nanos(5), "{\"RayID\":\"id\"}");
        let labels = BTreeMap::from([("zone_id".to_string(), "z".to_string())]);
        let entry = LogEntry::from_record(&record, &labels);
        assert_eq!(entry.line, "{\"RayID\":\"id\"}");
        assert_eq!(entry.labels, labels);
        assert_eq!(entry.timestamp, record.timestamp);
    }
}
