//! The narrow persistence interface the orchestrator is written against.
//!
//! Every mutation that touches both a task and an agent row (claim, finish,
//! release) is a single atomic store operation so that concurrent loops can
//! never double-assign a task or let `current_workload` drift.

use std::collections::BTreeMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::types::{
    Agent, AgentStatus, AgentType, ContextEntry, ProjectSnapshot, Task, TaskStatus, TaskType,
    TaskUpdate,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),
    #[error("agent not found: {0}")]
    AgentNotFound(Uuid),
    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("task {task_id} is not owned by agent {agent_id}")]
    NotOwner { task_id: Uuid, agent_id: Uuid },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Query filter
// ---------------------------------------------------------------------------

/// Conjunctive filter over tasks. Unset fields do not constrain.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub project_id: Option<Uuid>,
    pub parent_task_id: Option<Uuid>,
    pub assigned_to: Option<Uuid>,
    /// Only tasks with no assignee.
    pub unassigned_only: bool,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    pub fn project(mut self, project_id: Uuid) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn parent(mut self, parent_task_id: Uuid) -> Self {
        self.parent_task_id = Some(parent_task_id);
        self
    }

    pub fn assigned_to(mut self, agent_id: Uuid) -> Self {
        self.assigned_to = Some(agent_id);
        self
    }

    pub fn unassigned(mut self) -> Self {
        self.unassigned_only = true;
        self
    }
}

/// Outcome of [`TaskStore::claim_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Task is no longer pending/unassigned (someone else got it, or it is done).
    NotClaimable,
    /// At least one dependency is not done yet.
    DependenciesUnmet,
    /// The agent is at `max_workload`.
    AgentAtCapacity,
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed)
    }
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

/// CRUD, filtered queries and the atomic conditional updates the
/// orchestrator relies on. Results are listed by priority (desc) then
/// creation time (asc) unless stated otherwise.
#[async_trait]
pub trait TaskStore: Send + Sync {
    // -- tasks --

    async fn insert_task(&self, task: &Task) -> Result<()>;

    /// Insert every task or none of them.
    async fn insert_tasks(&self, tasks: &[Task]) -> Result<()>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>>;

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    /// Atomically claim a task for an agent: succeeds only if the task is
    /// still claimable and unassigned, every dependency is done and the agent
    /// has spare capacity. Increments the agent's workload in the same
    /// transaction.
    async fn claim_task(&self, task_id: Uuid, agent_id: Uuid) -> Result<ClaimOutcome>;

    /// Insert `task` already claimed by `agent_id` (`in_progress`, workload
    /// bumped). Nothing is written unless the claim succeeds.
    async fn insert_claimed(&self, task: &Task, agent_id: Uuid) -> Result<ClaimOutcome>;

    /// `in_progress -> completed|failed` for a task owned by `agent_id`:
    /// stores `result`, sets progress (100 on success, 0 on failure),
    /// `completed_at`, and releases the owner's workload slot in the same
    /// transaction. Fails with [`StoreError::NotOwner`] once the task has
    /// been released or handed to another agent.
    async fn finish_task(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        status: TaskStatus,
        result: &str,
    ) -> Result<Task> {
        self.finish_and_spawn(task_id, agent_id, status, result, &[])
            .await
    }

    /// [`TaskStore::finish_task`] that also inserts `spawn` in the same
    /// transaction, so follow-up work is visible the moment its source is.
    async fn finish_and_spawn(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        status: TaskStatus,
        result: &str,
        spawn: &[Task],
    ) -> Result<Task>;

    /// `in_progress -> pending` with `assigned_to = null`, releasing the
    /// former owner's workload slot in the same transaction. Returns the
    /// former owner.
    async fn release_task(&self, task_id: Uuid) -> Result<Option<Uuid>>;

    /// Validated status change for transitions that do not touch workload
    /// (`completed -> archived`, `failed -> pending`, `pending <-> unassigned`).
    async fn transition_task(&self, task_id: Uuid, status: TaskStatus) -> Result<()>;

    async fn set_progress(&self, task_id: Uuid, progress: u8) -> Result<()>;

    async fn project_snapshot(&self, project_id: Uuid) -> Result<ProjectSnapshot>;

    // -- agents --

    /// Idempotent by `(name, agent_type)`: returns the stored agent when one
    /// already exists, otherwise inserts `agent`.
    async fn register_agent(&self, agent: &Agent) -> Result<Agent>;

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>>;

    async fn list_agents(&self) -> Result<Vec<Agent>>;

    async fn set_agent_status(&self, id: Uuid, status: AgentStatus) -> Result<()>;

    async fn find_agent(&self, name: &str, agent_type: AgentType) -> Result<Option<Agent>>;

    // -- context entries --

    /// Last write wins per `(task_id, key)`.
    async fn set_context(&self, task_id: Uuid, key: &str, value: &str) -> Result<()>;

    async fn get_context(&self, task_id: Uuid) -> Result<BTreeMap<String, String>>;

    async fn list_context_entries(&self, task_id: Uuid) -> Result<Vec<ContextEntry>>;

    // -- updates --

    /// Append an update and mark the task as active (`updated_at = now`).
    async fn append_update(&self, update: &TaskUpdate) -> Result<()>;

    /// All updates for a task, oldest first.
    async fn list_updates(&self, task_id: Uuid) -> Result<Vec<TaskUpdate>>;
}
