//! Dependency graph over build tasks.
//!
//! Nodes are task ids in an arena; edges are id sets kept in both
//! directions. Adding a dependency always adds the reciprocal dependant
//! edge, and repeated edges collapse.

use crate::core::TaskId;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

#[derive(Debug, Default, Clone)]
struct Node {
    dependencies: BTreeSet<TaskId>,
    dependants: BTreeSet<TaskId>,
}

/// An arena of task ids with bidirectional dependency edges.
///
/// Cycles are not rejected; a task on a cycle never becomes ready.
#[derive(Debug, Default, Clone)]
pub struct TaskGraph {
    nodes: HashMap<TaskId, Node>,
    order: Vec<TaskId>,
}

impl TaskGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task. Returns false if it was already present.
    pub fn add_task(&mut self, id: TaskId) -> bool {
        if self.nodes.contains_key(&id) {
            return false;
        }
        self.nodes.insert(id, Node::default());
        self.order.push(id);
        true
    }

    /// Records that `task` depends on `dependency`.
    ///
    /// Returns false if either task is unknown, the edge is a self-loop, or
    /// the edge already exists.
    pub fn add_dependency(&mut self, task: TaskId, dependency: TaskId) -> bool {
        if task == dependency
            || !self.nodes.contains_key(&task)
            || !self.nodes.contains_key(&dependency)
        {
            return false;
        }
        let added = self
            .nodes
            .get_mut(&task)
            .is_some_and(|node| node.dependencies.insert(dependency));
        if let Some(node) = self.nodes.get_mut(&dependency) {
            node.dependants.insert(task);
        }
        added
    }

    /// Removes a task and every edge touching it.
    pub fn remove_task(&mut self, id: TaskId) -> bool {
        let Some(node) = self.nodes.remove(&id) else {
            return false;
        };
        for dependency in &node.dependencies {
            if let Some(other) = self.nodes.get_mut(dependency) {
                other.dependants.remove(&id);
            }
        }
        for dependant in &node.dependants {
            if let Some(other) = self.nodes.get_mut(dependant) {
                other.dependencies.remove(&id);
            }
        }
        self.order.retain(|other| *other != id);
        true
    }

    /// Whether the task is in the graph.
    #[must_use]
    pub fn contains(&self, id: TaskId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Tasks `id` depends on, ascending.
    #[must_use]
    pub fn dependencies(&self, id: TaskId) -> Vec<TaskId> {
        self.nodes
            .get(&id)
            .map(|node| node.dependencies.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Tasks depending on `id`, ascending.
    #[must_use]
    pub fn dependants(&self, id: TaskId) -> Vec<TaskId> {
        self.nodes
            .get(&id)
            .map(|node| node.dependants.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Tasks without dependencies, in insertion order.
    #[must_use]
    pub fn roots(&self) -> Vec<TaskId> {
        self.order
            .iter()
            .copied()
            .filter(|id| {
                self.nodes
                    .get(id)
                    .is_some_and(|node| node.dependencies.is_empty())
            })
            .collect()
    }

    /// Every task reachable through dependant edges, each listed once, in
    /// breadth-first order.
    #[must_use]
    pub fn transitive_dependants(&self, id: TaskId) -> Vec<TaskId> {
        let mut seen = HashSet::from([id]);
        let mut queue = VecDeque::from(self.dependants(id));
        let mut result = Vec::new();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next) {
                continue;
            }
            result.push(next);
            queue.extend(self.dependants(next));
        }
        result
    }

    /// Orders `ids` so every task comes after its dependencies. Edges leaving
    /// `ids` and edges closing a cycle are ignored.
    #[must_use]
    pub fn topological_order(&self, ids: &[TaskId]) -> Vec<TaskId> {
        let scope: HashSet<TaskId> = ids.iter().copied().collect();
        let mut visited = HashSet::new();
        let mut in_progress = HashSet::new();
        let mut result = Vec::with_capacity(ids.len());
        // Each frame holds a task, its dependencies and the next one to visit.
        let mut stack: Vec<(TaskId, Vec<TaskId>, usize)> = Vec::new();
        for &start in ids {
            if visited.contains(&start) || !in_progress.insert(start) {
                continue;
            }
            stack.push((start, self.dependencies(start), 0));
            while let Some((id, dependencies, next)) = stack.last_mut() {
                if let Some(&dependency) = dependencies.get(*next) {
                    *next += 1;
                    if scope.contains(&dependency)
                        && !visited.contains(&dependency)
                        && in_progress.insert(dependency)
                    {
                        stack.push((dependency, self.dependencies(dependency), 0));
                    }
                } else {
                    let id = *id;
                    stack.pop();
                    in_progress.remove(&id);
                    visited.insert(id);
                    result.push(id);
                }
            }
        }
        result
    }
}
