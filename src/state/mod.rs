//! Persisted run state.
//!
//! Everything mend remembers between runs lives in one directory (by
//! default `<root>/.mend/`): the iteration history, the duration estimator's
//! samples and the debug log.

mod history;
mod manager;

pub use history::{DurationStore, HistoryEntry, HistoryLog};
pub use manager::StateDir;
