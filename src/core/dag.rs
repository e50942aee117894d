//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! Nodes are bound tasks. An edge `a -> b` means `b` consumes at least one
//! path that `a` produces; the edge remembers which paths.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::collections::HashMap;

/// A data dependency: the paths flowing along one edge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataDependency {
    pub paths: Vec<String>,
}

/// The bound task graph.
pub struct TaskGraph {
    graph: DiGraph<Task, DataDependency>,
    task_index: HashMap<TaskId, NodeIndex>,
    /// Topological order, filled in by `seal`.
    order: Vec<NodeIndex>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Add a task. Task identities must be unique.
    pub fn add_task(&mut self, task: Task) -> Result<NodeIndex> {
        if self.task_index.contains_key(&task.id) {
            return Err(Error::Validation(format!(
                "Task {} is bound twice",
                task.id
            )));
        }
        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        self.order.clear();
        Ok(index)
    }

    /// Record that `to` consumes `path` produced by `from`.
    ///
    /// Several paths between the same pair share one edge.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId, path: &str) -> Result<()> {
        let from_index = self.index_of(from)?;
        let to_index = self.index_of(to)?;

        match self.graph.find_edge(from_index, to_index) {
            Some(edge) => {
                if let Some(dep) = self.graph.edge_weight_mut(edge) {
                    dep.paths.push(path.to_string());
                }
            }
            None => {
                self.graph.add_edge(
                    from_index,
                    to_index,
                    DataDependency {
                        paths: vec![path.to_string()],
                    },
                );
            }
        }
        self.order.clear();
        Ok(())
    }

    /// Check for cycles and fix the topological order.
    pub fn seal(&mut self) -> Result<()> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let task = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.id.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Error::CyclicGraph { task }
        })?;
        self.order = sorted;
        Ok(())
    }

    fn index_of(&self, id: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::Validation(format!("Task {} not found in DAG", id)))
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        let index = *self.task_index.get(id)?;
        self.graph.node_weight_mut(index)
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&a), Some(&b)) => self.graph.find_edge(a, b).is_some(),
            _ => false,
        }
    }

    pub fn get_dependency(&self, from: &TaskId, to: &TaskId) -> Option<&DataDependency> {
        let edge = self
            .graph
            .find_edge(*self.task_index.get(from)?, *self.task_index.get(to)?)?;
        self.graph.edge_weight(edge)
    }

    /// Direct upstream tasks of `id`.
    pub fn dependencies(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct downstream tasks of `id`.
    pub fn dependents(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every task transitively downstream of `id`, excluding `id` itself.
    pub fn descendants(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut dfs = Dfs::new(&self.graph, start);
        let mut found = Vec::new();
        while let Some(index) = dfs.next(&self.graph) {
            if index != start {
                if let Some(task) = self.graph.node_weight(index) {
                    found.push(task.id.clone());
                }
            }
        }
        found.sort();
        found
    }

    /// Tasks in dependency order. Requires a sealed graph.
    pub fn topological_order(&self) -> Vec<&Task> {
        self.order
            .iter()
            .filter_map(|&index| self.graph.node_weight(index))
            .collect()
    }

    /// Task ids in dependency order. Requires a sealed graph.
    pub fn topological_ids(&self) -> Vec<TaskId> {
        self.topological_order()
            .into_iter()
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn is_sealed(&self) -> bool {
        self.order.len() == self.graph.node_count()
    }

    pub fn all_tasks(&self) -> Vec<&Task> {
        self.graph.node_weights().collect()
    }

    /// Tasks bound from one rule, ordered by binding.
    pub fn tasks_for_rule(&self, rule: &str) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .graph
            .node_weights()
            .filter(|t| t.id.rule == rule)
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
