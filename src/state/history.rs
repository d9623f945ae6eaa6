//! Append-only iteration history and persisted duration samples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::orchestration::estimator::{DurationEntry, DurationEstimator};
use crate::report::IterationRecord;
use crate::{mlog_debug, mlog_warn, Result};

/// One line of `history.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub run_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub record: IterationRecord,
}

/// JSON-lines log of every iteration of every run.
#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, run_id: Uuid, record: &IterationRecord) -> Result<()> {
        let entry = HistoryEntry {
            run_id,
            recorded_at: Utc::now(),
            record: record.clone(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// The last `limit` entries, oldest first. Unparseable lines are skipped.
    pub fn read(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(&self.path)?);
        let mut entries = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => mlog_warn!("history: skipping line {}: {}", index + 1, e),
            }
        }
        if let Some(limit) = limit {
            let skip = entries.len().saturating_sub(limit);
            entries.drain(..skip);
        }
        Ok(entries)
    }
}

/// The estimator's samples between runs.
#[derive(Debug, Clone)]
pub struct DurationStore {
    path: PathBuf,
}

impl DurationStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the estimator. A missing or corrupt file gives an empty one.
    pub fn load(&self) -> DurationEstimator {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return DurationEstimator::new(),
        };
        match serde_json::from_str::<Vec<DurationEntry>>(&content) {
            Ok(entries) => {
                mlog_debug!("durations: loaded {} classes", entries.len());
                DurationEstimator::from_entries(entries)
            }
            Err(e) => {
                mlog_warn!("durations: ignoring {}: {}", self.path.display(), e);
                DurationEstimator::new()
            }
        }
    }

    pub fn save(&self, estimator: &DurationEstimator) -> Result<()> {
        let json = serde_json::to_string_pretty(&estimator.entries())?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}
