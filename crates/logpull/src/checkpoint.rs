// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable record of the last window end confirmed by the downstream.
//!
//! The positions file is a small JSON document shared by every target that
//! points at it:
//!
//! ```json
//! {"positions": {"cloudflare-<zone id>": 1700000000000000000}}
//! ```
//!
//! Values are unix nanoseconds. Each update rewrites the whole document to a
//! sibling temp file, syncs it and renames it over the original.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("positions file error: {0}")]
    Io(#[from] io::Error),
    #[error("positions file is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("checkpoint {0} is outside the representable range")]
    OutOfRange(DateTime<Utc>),
    #[error("checkpoint store lock poisoned")]
    Poisoned,
}

/// Where the engine resumes from and records its progress.
pub trait CheckpointStore: Send + Sync {
    /// Reads the last confirmed end. Called once before the first window is issued.
    fn load(&self) -> Result<Option<DateTime<Utc>>, CheckpointError>;

    /// Persists `end` if it is past the stored value. Returns whether it moved.
    ///
    /// The value is durable once this returns `Ok`.
    fn advance(&self, end: DateTime<Utc>) -> Result<bool, CheckpointError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Positions {
    #[serde(default)]
    positions: BTreeMap<String, i64>,
}

/// Checkpoint persisted under one key of a JSON positions file.
#[derive(Debug)]
pub struct PositionsFile {
    path: PathBuf,
    key: String,
    state: Mutex<Positions>,
}

impl PositionsFile {
    /// Opens `path`, creating nothing until the first advance.
    pub fn open(path: impl Into<PathBuf>, key: impl Into<String>) -> Result<Self, CheckpointError> {
        let path = path.into();
        let state = read_positions(&path)?;
        Ok(PositionsFile {
            path,
            key: key.into(),
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointStore for PositionsFile {
    fn load(&self) -> Result<Option<DateTime<Utc>>, CheckpointError> {
        let state = self.state.lock().map_err(|_| CheckpointError::Poisoned)?;
        Ok(state
            .positions
            .get(&self.key)
            .map(|nanos| DateTime::from_timestamp_nanos(*nanos)))
    }

    fn advance(&self, end: DateTime<Utc>) -> Result<bool, CheckpointError> {
        let nanos = end
            .timestamp_nanos_opt()
            .ok_or(CheckpointError::OutOfRange(end))?;
        let mut state = self.state.lock().map_err(|_| CheckpointError::Poisoned)?;
        if let Some(current) = state.positions.get(&self.key) {
            if *current >= nanos {
                debug!(key = %self.key, %end, "ignoring checkpoint that does not advance");
                return Ok(false);
            }
        }

        let previous = state.positions.insert(self.key.clone(), nanos);
        if let Err(e) = write_atomically(&self.path, &state) {
            // Keep memory in line with disk so a retry rewrites the old value.
            match previous {
                Some(old) => state.positions.insert(self.key.clone(), old),
                None => state.positions.remove(&self.key),
            };
            return Err(e);
        }
        Ok(true)
    }
}

fn read_positions(path: &Path) -> Result<Positions, CheckpointError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no positions file yet");
            return Ok(Positions::default());
        }
        Err(e) => return Err(e.into()),
    };
    if raw.trim().is_empty() {
        warn!(path = %path.display(), "positions file is empty");
        return Ok(Positions::default());
    }
    Ok(serde_json::from_str(&raw)?)
}

fn write_atomically(path: &Path, positions: &Positions) -> Result<(), CheckpointError> {
    let bytes = serde_json::to_vec(positions)?;
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;

    #[cfg(unix)]
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

/// Checkpoint kept in memory only. Progress is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryCheckpoint {
    value: Mutex<Option<DateTime<Utc>>>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(value: DateTime<Utc>) -> Self {
        MemoryCheckpoint {
            value: Mutex::new(Some(value)),
        }
    }
}

impl CheckpointStore for MemoryCheckpoint {
    fn load(&self) -> Result<Option<DateTime<Utc>>, CheckpointError> {
        Ok(*self.value.lock().map_err(|_| CheckpointError::Poisoned)?)
    }

    fn advance(&self, end: DateTime<Utc>) -> Result<bool, CheckpointError> {
        let mut value = self.value.lock().map_err(|_| CheckpointError::Poisoned)?;
        if value.is_some_and(|current| current >= end) {
            return Ok(false);
        }
        *value = Some(end);
        Ok(true)
    }
}
