//! StateDir - the on-disk home of a project's run state.

use std::fs;
use std::path::{Path, PathBuf};

use crate::log::LOG_FILE;
use crate::state::{DurationStore, HistoryLog};
use crate::{mlog_debug, Result};

pub const HISTORY_FILE: &str = "history.jsonl";
pub const DURATIONS_FILE: &str = "durations.json";

/// Paths inside the state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDir {
    path: PathBuf,
}

impl StateDir {
    /// Open the state directory, creating it if needed.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn open(path: &Path) -> Result<Self> {
        mlog_debug!("StateDir::open path={}", path.display());
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// A handle that does not touch the filesystem, for reading only.
    pub fn at(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn history(&self) -> HistoryLog {
        HistoryLog::new(self.path.join(HISTORY_FILE))
    }

    pub fn durations(&self) -> DurationStore {
        DurationStore::new(self.path.join(DURATIONS_FILE))
    }

    pub fn log_path(&self) -> PathBuf {
        self.path.join(LOG_FILE)
    }
}
