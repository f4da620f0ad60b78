//! Task dependency graph for one execution iteration.
//!
//! The graph is immutable in shape once built: tasks and edges come from a
//! validated plan, and only task state changes afterwards. Validation
//! rejects unknown dependency ids and cycles at construction; a cycle is a
//! fatal planning error, never silently broken.

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// The task dependency graph.
///
/// Uses petgraph's DiGraph with tasks as node weights. An edge from A to B
/// means A must complete before B can start.
pub struct TaskGraph {
    /// The underlying directed graph.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    /// Build a graph from a set of tasks carrying their dependency lists.
    ///
    /// # Errors
    /// Returns an error if:
    /// - Two tasks share an id
    /// - A task depends on an id not present in the set
    /// - The dependencies form a cycle (the diagnostic names the task ids
    ///   on the cycle)
    pub fn build(tasks: Vec<Task>) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut task_index = HashMap::new();

        for task in tasks {
            if task_index.contains_key(&task.id) {
                return Err(Error::Validation(format!(
                    "Duplicate task id in graph: {}",
                    task.id
                )));
            }
            let id = task.id.clone();
            let index = graph.add_node(task);
            task_index.insert(id, index);
        }

        // Edges derived from each task's dependency list: dep -> dependent.
        let nodes: Vec<NodeIndex> = graph.node_indices().collect();
        for index in nodes {
            let (id, deps) = {
                let task = &graph[index];
                (task.id.clone(), task.dependencies.clone())
            };
            for dep in deps {
                let dep_index = task_index.get(&dep).ok_or_else(|| {
                    Error::Validation(format!(
                        "Task {} depends on unknown task {}",
                        id, dep
                    ))
                })?;
                if *dep_index == index {
                    return Err(Error::Validation(format!(
                        "Task {} depends on itself",
                        id
                    )));
                }
                graph.add_edge(*dep_index, index, ());
            }
        }

        let built = Self { graph, task_index };
        if let Some(cycle) = built.find_cycle() {
            let path = cycle
                .iter()
                .map(TaskId::as_str)
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(Error::Planning(format!("dependency cycle: {}", path)));
        }
        Ok(built)
    }

    /// Depth-first search tracking the recursion stack.
    ///
    /// Returns the task ids on a cycle (closed: first id repeated at the
    /// end) if one exists.
    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut stack: Vec<NodeIndex> = Vec::new();
        let mut on_stack: HashSet<NodeIndex> = HashSet::new();

        for start in self.graph.node_indices() {
            if visited.contains(&start) {
                continue;
            }
            if let Some(cycle) = self.visit(start, &mut visited, &mut stack, &mut on_stack) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit(
        &self,
        node: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        stack: &mut Vec<NodeIndex>,
        on_stack: &mut HashSet<NodeIndex>,
    ) -> Option<Vec<TaskId>> {
        visited.insert(node);
        stack.push(node);
        on_stack.insert(node);

        for next in self
            .graph
            .neighbors_directed(node, petgraph::Direction::Outgoing)
        {
            if on_stack.contains(&next) {
                // Back-edge: the cycle is the stack from `next` onwards.
                let pos = stack.iter().position(|&n| n == next).unwrap_or(0);
                let mut cycle: Vec<TaskId> =
                    stack[pos..].iter().map(|&n| self.graph[n].id.clone()).collect();
                cycle.push(self.graph[next].id.clone());
                return Some(cycle);
            }
            if !visited.contains(&next) {
                if let Some(cycle) = self.visit(next, visited, stack, on_stack) {
                    return Some(cycle);
                }
            }
        }

        stack.pop();
        on_stack.remove(&node);
        None
    }

    /// Get a reference to a task by its id.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get a mutable reference to a task by its id.
    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        if let Some(&index) = self.task_index.get(id) {
            self.graph.node_weight_mut(index)
        } else {
            None
        }
    }

    /// Check if the graph contains a task.
    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Get the number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependency edges in the graph.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All tasks in the graph.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.graph.node_weights().collect()
    }

    /// All tasks the given task depends on (predecessors).
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<&Task> {
        if let Some(&index) = self.task_index.get(id) {
            self.graph
                .neighbors_directed(index, petgraph::Direction::Incoming)
                .filter_map(|neighbor| self.graph.node_weight(neighbor))
                .collect()
        } else {
            Vec::new()
        }
    }

    /// All tasks that directly depend on the given task (successors).
    pub fn dependents_of(&self, id: &TaskId) -> Vec<&Task> {
        if let Some(&index) = self.task_index.get(id) {
            self.graph
                .neighbors_directed(index, petgraph::Direction::Outgoing)
                .filter_map(|neighbor| self.graph.node_weight(neighbor))
                .collect()
        } else {
            Vec::new()
        }
    }

    /// All tasks reachable from the given task through dependency edges.
    ///
    /// Used to cascade a Blocked status when a dependency permanently fails.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let mut result = Vec::new();
        let mut seen = HashSet::new();
        let Some(&start) = self.task_index.get(id) else {
            return result;
        };
        let mut queue = vec![start];
        while let Some(node) = queue.pop() {
            for next in self
                .graph
                .neighbors_directed(node, petgraph::Direction::Outgoing)
            {
                if seen.insert(next) {
                    result.push(self.graph[next].id.clone());
                    queue.push(next);
                }
            }
        }
        result
    }

    // ========== Scheduling queries ==========

    /// Ids of completed tasks.
    pub fn completed_ids(&self) -> HashSet<TaskId> {
        self.graph
            .node_weights()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.clone())
            .collect()
    }

    /// All tasks ready to dispatch: startable with every dependency Completed.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        let completed = self.completed_ids();
        self.graph
            .node_weights()
            .filter(|task| task.can_start())
            .filter(|task| task.dependencies.iter().all(|dep| completed.contains(dep)))
            .collect()
    }

    /// Check whether every task is in a terminal state.
    pub fn all_settled(&self) -> bool {
        self.graph.node_weights().all(Task::is_terminal)
    }

    /// Tasks currently startable or running (the live remainder).
    pub fn unsettled_tasks(&self) -> Vec<&Task> {
        self.graph
            .node_weights()
            .filter(|t| !t.is_terminal())
            .collect()
    }

    /// Count of tasks with the given terminal disposition.
    pub fn count_completed(&self) -> usize {
        self.graph
            .node_weights()
            .filter(|t| t.status == TaskStatus::Completed)
            .count()
    }

    /// Ids of currently blocked tasks.
    pub fn blocked_ids(&self) -> Vec<TaskId> {
        self.graph
            .node_weights()
            .filter(|t| matches!(t.status, TaskStatus::Blocked { .. }))
            .map(|t| t.id.clone())
            .collect()
    }

    // ========== Derived reporting ==========

    /// Group unsettled tasks into waves by dependency depth.
    ///
    /// Wave k is the set of remaining tasks whose longest dependency chain
    /// through other remaining tasks has length k. Purely derived, used
    /// only for progress display and speedup estimates; dispatch never
    /// waits on a wave boundary.
    pub fn waves(&self) -> Vec<Vec<TaskId>> {
        let mut satisfied = self.completed_ids();
        let mut remaining: Vec<&Task> = self
            .graph
            .node_weights()
            .filter(|t| !t.is_terminal())
            .collect();
        let mut waves = Vec::new();

        while !remaining.is_empty() {
            let wave: Vec<TaskId> = remaining
                .iter()
                .filter(|t| t.dependencies.iter().all(|dep| satisfied.contains(dep)))
                .map(|t| t.id.clone())
                .collect();

            // Tasks behind failed or blocked dependencies never become
            // satisfiable; stop rather than loop.
            if wave.is_empty() {
                break;
            }

            for id in &wave {
                satisfied.insert(id.clone());
            }
            remaining.retain(|t| !wave.contains(&t.id));
            waves.push(wave);
        }

        waves
    }

    /// Consume the graph, returning the tasks for persistence.
    pub fn into_tasks(self) -> Vec<Task> {
        let (nodes, _) = self.graph.into_nodes_edges();
        nodes.into_iter().map(|n| n.weight).collect()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.graph.node_count())
            .field("edges", &self.graph.edge_count())
            .finish()
    }
}
