//! Context Assembler: everything a model invocation needs to know about a
//! task, gathered from the store in one place.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tf_core::store::{StoreError, TaskFilter, TaskStore};
use tf_core::types::{Task, TaskStatus, TaskType, TaskUpdate};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),
}

pub type Result<T> = std::result::Result<T, ContextError>;

/// One-line view of a related task. Never expanded further.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: Uuid,
    pub title: String,
    pub status: TaskStatus,
    pub task_type: Option<TaskType>,
    pub progress: u8,
    pub result: Option<String>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            title: task.title.clone(),
            status: task.status,
            task_type: task.task_type,
            progress: task.progress,
            result: task.result.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task: Task,
    pub entries: BTreeMap<String, String>,
    /// Oldest first.
    pub updates: Vec<TaskUpdate>,
    /// The delegating parent, or the owning project for phase tasks.
    pub parent: Option<TaskSummary>,
    pub subtasks: Vec<TaskSummary>,
    /// Prerequisite tasks, whose results feed this one.
    pub dependencies: Vec<TaskSummary>,
    /// Other tasks of the same project that are not prerequisites.
    /// Empty outside a project.
    pub siblings: Vec<TaskSummary>,
}

impl TaskContext {
    /// The most recent `n` updates, oldest first.
    pub fn recent_updates(&self, n: usize) -> &[TaskUpdate] {
        let start = self.updates.len().saturating_sub(n);
        &self.updates[start..]
    }
}

pub struct ContextAssembler {
    store: Arc<dyn TaskStore>,
}

impl ContextAssembler {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub async fn assemble(&self, task_id: Uuid) -> Result<TaskContext> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(ContextError::TaskNotFound(task_id))?;

        let entries = self.store.get_context(task_id).await?;
        let updates = self.store.list_updates(task_id).await?;

        let parent_id = task.parent_task_id.or(task.project_id);
        let parent = match parent_id {
            Some(id) => self.store.get_task(id).await?.as_ref().map(TaskSummary::from),
            None => None,
        };

        let subtasks = self
            .store
            .list_tasks(&TaskFilter::new().parent(task_id))
            .await?
            .iter()
            .map(TaskSummary::from)
            .collect();

        let mut dependencies = Vec::with_capacity(task.dependencies.len());
        for dep in &task.dependencies {
            // a dangling edge is skipped here; claim already refuses it
            if let Some(t) = self.store.get_task(*dep).await? {
                dependencies.push(TaskSummary::from(&t));
            }
        }

        let siblings = match task.project_id {
            Some(project_id) => self
                .store
                .list_tasks(&TaskFilter::new().project(project_id))
                .await?
                .iter()
                .filter(|t| t.id != task.id && !t.is_project())
                .filter(|t| !task.dependencies.contains(&t.id))
                .map(TaskSummary::from)
                .collect(),
            None => Vec::new(),
        };

        Ok(TaskContext {
            task,
            entries,
            updates,
            parent,
            subtasks,
            dependencies,
            siblings,
        })
    }
}
