// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hands retired records to the downstream pipeline.
//!
//! The pipeline intake is a bounded channel. When it is full, `forward`
//! waits, which stalls retirement and with it the checkpoint.

use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::record::{LogEntry, RawRecord};

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum ForwardError {
    #[error("downstream pipeline closed")]
    PipelineClosed,
    #[error("forward cancelled after {sent} entries")]
    Cancelled { sent: usize },
}

#[derive(Debug, Clone)]
pub struct Forwarder {
    sink: mpsc::Sender<LogEntry>,
    labels: BTreeMap<String, String>,
}

impl Forwarder {
    pub fn new(sink: mpsc::Sender<LogEntry>, labels: BTreeMap<String, String>) -> Self {
        Forwarder { sink, labels }
    }

    /// Normalizes and sends `records` in order, waiting for room in the pipeline.
    ///
    /// On cancellation the records already sent stay sent; the caller must
    /// not treat the batch as delivered.
    pub async fn forward(
        &self,
        records: &[RawRecord],
        cancel: &CancellationToken,
    ) -> Result<usize, ForwardError> {
        for (sent, record) in records.iter().enumerate() {
            let entry = LogEntry::from_record(record, &self.labels);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ForwardError::Cancelled { sent }),
                res = self.sink.send(entry) => {
                    res.map_err(|_| ForwardError::PipelineClosed)?;
                }
            }
        }
        trace!(entries = records.len(), "forwarded batch");
        Ok(records.len())
    }
}
