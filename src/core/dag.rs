//! Task dependency graph.
//!
//! [`DependencyGraph`] stores tasks as petgraph nodes with an edge from
//! each dependency to its dependent. Acyclicity is checked once, at
//! build time, with Kahn's in-degree reduction.

use crate::core::task::{Priority, Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};

/// The task dependency graph.
pub struct DependencyGraph {
    /// The underlying directed graph. Edge `a -> b` means `b` depends on `a`.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    /// Build the graph from a task set.
    ///
    /// # Errors
    /// - `Validation` for duplicate ids or dependencies on unknown tasks
    /// - `CycleDetected` listing every task Kahn's reduction could not
    ///   process; each task on a cycle is among them
    pub fn build(tasks: impl IntoIterator<Item = Task>) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut task_index = HashMap::new();

        for task in tasks {
            if task_index.contains_key(&task.id) {
                return Err(Error::Validation(format!("duplicate task id {}", task.id)));
            }
            let id = task.id.clone();
            let index = graph.add_node(task);
            task_index.insert(id, index);
        }

        let mut edges = Vec::new();
        for index in graph.node_indices() {
            let task = &graph[index];
            for dep in &task.depends_on {
                let dep_index = task_index.get(dep).ok_or_else(|| {
                    Error::Validation(format!(
                        "task {} depends on unknown task {}",
                        task.id, dep
                    ))
                })?;
                edges.push((*dep_index, index));
            }
        }
        for (from, to) in edges {
            graph.add_edge(from, to, ());
        }

        let dag = Self { graph, task_index };
        dag.kahn_order().map_err(|remaining| {
            tracing::error!(count = remaining.len(), "dependency cycle detected");
            Error::CycleDetected { remaining }
        })?;

        tracing::debug!(
            tasks = dag.len(),
            edges = dag.graph.edge_count(),
            "dependency graph built"
        );
        Ok(dag)
    }

    /// Kahn's algorithm with a max-heap keyed on (priority, reverse id).
    ///
    /// Returns unprocessed task ids (sorted) if the graph has a cycle.
    fn kahn_order(&self) -> std::result::Result<Vec<NodeIndex>, Vec<TaskId>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|i| (i, self.graph.neighbors_directed(i, Direction::Incoming).count()))
            .collect();

        let mut heap: BinaryHeap<(Priority, Reverse<TaskId>)> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(i, _)| self.heap_key(*i))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some((_, Reverse(id))) = heap.pop() {
            let index = self.task_index[&id];
            order.push(index);
            for next in self.graph.neighbors_directed(index, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&next) {
                    *degree -= 1;
                    if *degree == 0 {
                        heap.push(self.heap_key(next));
                    }
                }
            }
        }

        if order.len() == self.graph.node_count() {
            Ok(order)
        } else {
            let mut remaining: Vec<TaskId> = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(i, _)| self.graph[i].id.clone())
                .collect();
            remaining.sort();
            Err(remaining)
        }
    }

    fn heap_key(&self, index: NodeIndex) -> (Priority, Reverse<TaskId>) {
        let task = &self.graph[index];
        (task.priority, Reverse(task.id.clone()))
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        match self.task_index.get(id) {
            Some(&index) => self.graph.node_weight_mut(index),
            None => None,
        }
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    /// Direct dependencies of a task.
    pub fn dependencies(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of a task.
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

    /// Every task reachable from `id` along dependent edges, sorted.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(index) = queue.pop_front() {
            for next in self.graph.neighbors_directed(index, Direction::Outgoing) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        let mut ids: Vec<TaskId> = seen.into_iter().map(|i| self.graph[i].id.clone()).collect();
        ids.sort();
        ids
    }

    /// Pending tasks whose whole dependency set is in `completed`.
    pub fn ready_tasks<'a>(&'a self, completed: &HashSet<TaskId>) -> Vec<&'a Task> {
        let mut ready: Vec<&Task> = self
            .graph
            .node_weights()
            .filter(|task| task.status == TaskStatus::Pending)
            .filter(|task| task.depends_on.iter().all(|dep| completed.contains(dep)))
            .collect();
        ready.sort_by(|a, b| a.id.cmp(&b.id));
        ready
    }

    /// Tasks in dependency order.
    ///
    /// Among tasks whose dependencies are all placed, higher priority goes
    /// first, then ascending id.
    pub fn topological_order(&self) -> Vec<&Task> {
        // Acyclicity was established in `build`.
        self.kahn_order()
            .unwrap_or_default()
            .into_iter()
            .map(|i| &self.graph[i])
            .collect()
    }

    /// Longest dependency chain, root first.
    ///
    /// Ties between equally long chains go to the lexically smaller ids.
    pub fn critical_path(&self) -> Vec<TaskId> {
        self.longest_chain(&HashSet::new())
    }

    /// Length of the longest chain of tasks not yet in `completed`.
    pub fn remaining_depth(&self, completed: &HashSet<TaskId>) -> usize {
        self.longest_chain(completed).len()
    }

    fn longest_chain(&self, skip: &HashSet<TaskId>) -> Vec<TaskId> {
        let order = self.kahn_order().unwrap_or_default();
        let mut length: HashMap<NodeIndex, usize> = HashMap::new();
        let mut previous: HashMap<NodeIndex, NodeIndex> = HashMap::new();

        for &index in &order {
            if skip.contains(&self.graph[index].id) {
                continue;
            }
            let best = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .filter_map(|p| length.get(&p).map(|len| (p, *len)))
                .max_by(|(pa, la), (pb, lb)| {
                    la.cmp(lb).then_with(|| self.graph[*pb].id.cmp(&self.graph[*pa].id))
                });
            match best {
                Some((p, len)) => {
                    length.insert(index, len + 1);
                    previous.insert(index, p);
                }
                None => {
                    length.insert(index, 1);
                }
            }
        }

        let end = length.iter().max_by(|(ia, la), (ib, lb)| {
            la.cmp(lb).then_with(|| self.graph[**ib].id.cmp(&self.graph[**ia].id))
        });
        let Some((&end, _)) = end else {
            return Vec::new();
        };

        let mut chain = vec![self.graph[end].id.clone()];
        let mut cursor = end;
        while let Some(&p) = previous.get(&cursor) {
            chain.push(self.graph[p].id.clone());
            cursor = p;
        }
        chain.reverse();
        chain
    }

    /// Status snapshot of every task, sorted by id.
    pub fn statuses(&self) -> Vec<(TaskId, TaskStatus)> {
        let mut out: Vec<(TaskId, TaskStatus)> = self
            .graph
            .node_weights()
            .map(|t| (t.id.clone(), t.status.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}

/// Incrementally maintained ready set.
///
/// Completing a task only re-checks its direct dependents.
#[derive(Debug, Clone, Default)]
pub struct ReadySet {
    ready: BTreeSet<TaskId>,
    /// Unsatisfied dependency count per not-yet-ready task.
    waiting: HashMap<TaskId, usize>,
}

impl ReadySet {
    /// Seed from the graph's current statuses.
    pub fn new(graph: &DependencyGraph) -> Self {
        let completed: HashSet<&TaskId> = graph
            .tasks()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| &t.id)
            .collect();

        let mut set = Self::default();
        for task in graph.tasks() {
            if !task.can_start() {
                continue;
            }
            let unmet = task
                .depends_on
                .iter()
                .filter(|d| !completed.contains(d))
                .count();
            if unmet == 0 {
                set.ready.insert(task.id.clone());
            } else {
                set.waiting.insert(task.id.clone(), unmet);
            }
        }
        set
    }

    /// Record that `id` completed and return the tasks that just became ready.
    pub fn complete(&mut self, graph: &DependencyGraph, id: &TaskId) -> Vec<TaskId> {
        self.ready.remove(id);
        let mut newly_ready = Vec::new();
        for dependent in graph.dependents(id) {
            if let Some(unmet) = self.waiting.get_mut(&dependent.id) {
                *unmet = unmet.saturating_sub(1);
                if *unmet == 0 {
                    self.waiting.remove(&dependent.id);
                    if dependent.can_start() {
                        self.ready.insert(dependent.id.clone());
                        newly_ready.push(dependent.id.clone());
                    }
                }
            }
        }
        newly_ready.sort();
        newly_ready
    }

    /// Drop a task that will never run.
    pub fn remove(&mut self, id: &TaskId) {
        self.ready.remove(id);
        self.waiting.remove(id);
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.ready.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskId> {
        self.ready.iter()
    }

    pub fn len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }
}
