//! Dependency graph for queued tasks.
//!
//! Edges run prerequisite → dependent. Besides the petgraph graph used for
//! diagnostics, the graph keeps a blocked-by index keyed by blocking id so a
//! dependent is promoted exactly when its last blocker completes, instead of
//! being re-examined on every scheduling pass.

use crate::core::task::TaskId;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// The scheduler's dependency graph.
pub struct DependencyGraph {
    /// Prerequisite → dependent edges over every id ever mentioned.
    graph: DiGraph<TaskId, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    nodes: HashMap<TaskId, NodeIndex>,
    /// Blocking id → dependents still waiting on it.
    waiters: HashMap<TaskId, Vec<TaskId>>,
    /// Dependent → prerequisites not yet completed.
    unmet: HashMap<TaskId, HashSet<TaskId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            nodes: HashMap::new(),
            waiters: HashMap::new(),
            unmet: HashMap::new(),
        }
    }

    fn node(&mut self, id: TaskId) -> NodeIndex {
        if let Some(&index) = self.nodes.get(&id) {
            return index;
        }
        let index = self.graph.add_node(id);
        self.nodes.insert(id, index);
        index
    }

    /// Register a task and its prerequisites.
    ///
    /// `is_completed` tells which prerequisites are already done. Returns
    /// `true` when the task is immediately ready.
    pub fn register<F>(&mut self, id: TaskId, dependencies: &[TaskId], is_completed: F) -> bool
    where
        F: Fn(TaskId) -> bool,
    {
        let dependent = self.node(id);
        let mut unmet = HashSet::new();
        for &dep in dependencies {
            let prerequisite = self.node(dep);
            if self.graph.find_edge(prerequisite, dependent).is_none() {
                self.graph.add_edge(prerequisite, dependent, ());
            }
            if !is_completed(dep) && unmet.insert(dep) {
                self.waiters.entry(dep).or_default().push(id);
            }
        }

        if unmet.is_empty() {
            true
        } else {
            self.unmet.insert(id, unmet);
            false
        }
    }

    /// Record that `id` completed and return the dependents it unblocked.
    pub fn complete(&mut self, id: TaskId) -> Vec<TaskId> {
        let Some(waiting) = self.waiters.remove(&id) else {
            return Vec::new();
        };

        let mut released = Vec::new();
        for dependent in waiting {
            if let Some(unmet) = self.unmet.get_mut(&dependent) {
                unmet.remove(&id);
                if unmet.is_empty() {
                    self.unmet.remove(&dependent);
                    released.push(dependent);
                }
            }
        }
        released
    }

    /// Make every dependent still waiting on `from` wait on `to` instead.
    ///
    /// Used when a failed task is retried: the retry takes the failed
    /// attempt's place in the chain. Returns the dependents moved.
    pub fn hand_over(&mut self, from: TaskId, to: TaskId) -> Vec<TaskId> {
        let Some(waiting) = self.waiters.remove(&from) else {
            return Vec::new();
        };
        let prerequisite = self.node(to);
        for &dependent in &waiting {
            if let Some(unmet) = self.unmet.get_mut(&dependent) {
                unmet.remove(&from);
                unmet.insert(to);
            }
            let dependent = self.node(dependent);
            if self.graph.find_edge(prerequisite, dependent).is_none() {
                self.graph.add_edge(prerequisite, dependent, ());
            }
        }
        self.waiters.entry(to).or_default().extend(waiting.iter().copied());
        waiting
    }

    /// Prerequisites `id` is still waiting on, sorted.
    pub fn waiting_on(&self, id: TaskId) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .unmet
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn is_blocked(&self, id: TaskId) -> bool {
        self.unmet.contains_key(&id)
    }

    /// Number of tasks currently blocked.
    pub fn blocked_count(&self) -> usize {
        self.unmet.len()
    }

    /// Number of edges registered so far.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Dependency cycles among blocked tasks.
    ///
    /// The scheduler never rejects a cycle; this only explains why tasks
    /// never leave the queue. Each cycle is sorted by id.
    pub fn cycles(&self) -> Vec<Vec<TaskId>> {
        let mut cycles: Vec<Vec<TaskId>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .first()
                        .map(|&n| self.graph.find_edge(n, n).is_some())
                        .unwrap_or(false)
            })
            .map(|component| {
                let mut ids: Vec<TaskId> = component
                    .into_iter()
                    .filter_map(|n| self.graph.node_weight(n).copied())
                    .collect();
                ids.sort();
                ids
            })
            .filter(|ids| ids.iter().any(|id| self.is_blocked(*id)))
            .collect();
        cycles.sort();
        cycles
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("nodes", &self.graph.node_count())
            .field("dependencies", &self.dependency_count())
            .field("blocked", &self.blocked_count())
            .finish()
    }
}
