//! Workflow data model: tasks, their states, and the dependency graph.
//!
//! A workflow is a named DAG of tasks, each of which invokes one intent
//! through the intent router.  The graph is checked up front by
//! [`Workflow::graph`]; nothing runs if it is empty, cyclic, or refers to
//! unknown tasks.

use std::collections::{HashMap, HashSet, VecDeque};

use opsgate_kernel::Params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, WorkflowError};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Lifecycle of a task inside one workflow run.
///
/// ```text
/// Pending ─┬─> Ready ──> Running ─┬─> Completed
///          └─> Blocked ─┘         ├─> Failed
///                                 └─> AwaitingConfirmation ─┬─> Completed
///                                                           ├─> Failed
///                                                           └─> Skipped
/// ```
///
/// Any task that has not been dispatched may also go straight to
/// `Skipped`.  No state is ever revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    /// Waiting for at least one predecessor to complete.
    Blocked,
    /// Every predecessor completed; queued for a worker.
    Ready,
    Running,
    /// Held at a confirmation checkpoint.
    AwaitingConfirmation,
    Completed,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Blocked => "blocked",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        use TaskState::*;
        match self {
            Pending => matches!(next, Blocked | Ready | Skipped),
            Blocked => matches!(next, Ready | Skipped),
            Ready => matches!(next, Running | Skipped),
            Running => matches!(next, AwaitingConfirmation | Completed | Failed),
            AwaitingConfirmation => matches!(next, Completed | Failed | Skipped),
            Completed | Failed | Skipped => false,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall outcome of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    /// Every task completed.
    Completed,
    /// Some tasks completed, others failed or were skipped.
    PartialFailure,
    /// No task completed.
    Failed,
    /// Cancelled externally while running.
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::PartialFailure => "partial_failure",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One intent invocation within a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub intent: String,
    #[serde(default)]
    pub parameters: Params,
    /// Ids of tasks that must complete before this one may run.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub state: TaskState,
}

impl Task {
    pub fn new(id: impl Into<String>, intent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            intent: intent.into(),
            parameters: Params::new(),
            depends_on: Vec::new(),
            state: TaskState::Pending,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn after<I, S>(mut self, predecessors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(predecessors.into_iter().map(Into::into));
        self
    }
}

fn generated_id() -> String {
    Uuid::now_v7().to_string()
}

/// A named DAG of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "generated_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub tasks: Vec<Task>,
    /// `None` until the workflow has been executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkflowStatus>,
}

impl Workflow {
    /// Create a new workflow with a generated id.
    pub fn new(name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            id: generated_id(),
            name: name.into(),
            tasks,
            status: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Validate the task graph and index it for scheduling.
    pub fn graph(&self) -> Result<TaskGraph> {
        TaskGraph::build(&self.tasks)
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Index-based view of a validated workflow graph.
///
/// Task indexes follow declaration order in [`Workflow::tasks`].
#[derive(Debug, Clone)]
pub struct TaskGraph {
    predecessors: Vec<Vec<usize>>,
    successors: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl TaskGraph {
    fn build(tasks: &[Task]) -> Result<Self> {
        if tasks.is_empty() {
            return Err(WorkflowError::invalid_graph("workflow has no tasks"));
        }

        let mut index: HashMap<&str, usize> = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if task.id.trim().is_empty() {
                return Err(WorkflowError::invalid_graph(format!(
                    "task #{} has an empty id",
                    i + 1
                )));
            }
            if task.intent.trim().is_empty() {
                return Err(WorkflowError::invalid_graph(format!(
                    "task `{}` has an empty intent",
                    task.id
                )));
            }
            if index.insert(task.id.as_str(), i).is_some() {
                return Err(WorkflowError::invalid_graph(format!(
                    "duplicate task id `{}`",
                    task.id
                )));
            }
        }

        let mut predecessors = vec![Vec::new(); tasks.len()];
        let mut successors = vec![Vec::new(); tasks.len()];
        for (i, task) in tasks.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &task.depends_on {
                let Some(&p) = index.get(dep.as_str()) else {
                    return Err(WorkflowError::invalid_graph(format!(
                        "task `{}` depends on unknown task `{dep}`",
                        task.id
                    )));
                };
                if p == i {
                    return Err(WorkflowError::invalid_graph(format!(
                        "task `{}` depends on itself",
                        task.id
                    )));
                }
                if seen.insert(p) {
                    predecessors[i].push(p);
                    successors[p].push(i);
                }
            }
        }

        // Kahn's algorithm: whatever is left unvisited sits on a cycle.
        let mut in_degree: Vec<usize> = predecessors.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..tasks.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(tasks.len());
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &s in &successors[i] {
                in_degree[s] -= 1;
                if in_degree[s] == 0 {
                    queue.push_back(s);
                }
            }
        }
        if order.len() != tasks.len() {
            let cyclic: Vec<&str> = (0..tasks.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| tasks[i].id.as_str())
                .collect();
            return Err(WorkflowError::invalid_graph(format!(
                "dependency cycle among tasks [{}]",
                cyclic.join(", ")
            )));
        }

        Ok(Self {
            predecessors,
            successors,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.predecessors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predecessors.is_empty()
    }

    pub fn predecessors(&self, task: usize) -> &[usize] {
        &self.predecessors[task]
    }

    pub fn successors(&self, task: usize) -> &[usize] {
        &self.successors[task]
    }

    /// A topological order of the tasks.
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    /// Every task reachable from `task` through dependency edges, excluding
    /// `task` itself.
    pub fn transitive_dependents(&self, task: usize) -> Vec<usize> {
        let mut seen = vec![false; self.len()];
        let mut stack: Vec<usize> = self.successors[task].clone();
        let mut out = Vec::new();
        while let Some(i) = stack.pop() {
            if seen[i] {
                continue;
            }
            seen[i] = true;
            out.push(i);
            stack.extend_from_slice(&self.successors[i]);
        }
        out.sort_unstable();
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
