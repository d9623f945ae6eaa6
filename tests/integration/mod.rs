//! Integration test suite for mend.
//!
//! These tests exercise the scheduler, the worker pool and the convergence
//! loop together against temporary project trees.
//!
//! # Test Categories
//!
//! - `scheduler_properties`: Batch invariants under randomized workloads
//! - `parallel_dispatch`: Bounded parallelism and budgets on a paused clock
//! - `convergence`: Full fix, scan and verify runs and their outcomes
//!
//! # CI Compatibility
//!
//! Every tool is replaced by a scripted runner, so no external programs are
//! spawned.

mod fixtures;

mod convergence;
mod parallel_dispatch;
mod scheduler_properties;
