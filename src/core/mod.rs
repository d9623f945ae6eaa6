//! Core domain models for mend.
//!
//! Tasks, their results, and the dependency graph the scheduler keeps
//! between them.

pub mod dag;
pub mod task;

pub use dag::DependencyGraph;
pub use task::{Priority, Task, TaskId, TaskResult, TaskStatus, TaskType};
