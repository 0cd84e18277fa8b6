use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Archived,
    Unassigned,
}

impl TaskStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::Pending, TaskStatus::Unassigned)
                | (TaskStatus::Unassigned, TaskStatus::Pending)
                | (TaskStatus::Unassigned, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                // stall recovery
                | (TaskStatus::InProgress, TaskStatus::Pending)
                | (TaskStatus::Completed, TaskStatus::Archived)
                // manual retry
                | (TaskStatus::Failed, TaskStatus::Pending)
        )
    }

    /// A task in this status may be claimed by an agent.
    pub fn is_claimable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Unassigned)
    }

    /// Satisfies a dependency edge. Archived tasks are completed tasks the
    /// controller has already propagated.
    pub fn is_done(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Archived)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Archived => "archived",
            TaskStatus::Unassigned => "unassigned",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Project,
    Design,
    Development,
    Testing,
    Review,
    Documentation,
    Deployment,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Project => "project",
            TaskType::Design => "design",
            TaskType::Development => "development",
            TaskType::Testing => "testing",
            TaskType::Review => "review",
            TaskType::Documentation => "documentation",
            TaskType::Deployment => "deployment",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub task_type: Option<TaskType>,
    pub required_skills: BTreeSet<String>,
    pub priority: i32,
    /// Tasks that must be done before this one may be claimed.
    pub dependencies: Vec<Uuid>,
    pub project_id: Option<Uuid>,
    pub parent_task_id: Option<Uuid>,
    pub assigned_to: Option<Uuid>,
    pub progress: u8,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Free-form annotations (phase key, effort estimate, ...). Never read
    /// by scheduling.
    pub metadata: Option<serde_json::Value>,
}

impl Task {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            task_type: None,
            required_skills: BTreeSet::new(),
            priority: 0,
            dependencies: Vec::new(),
            project_id: None,
            parent_task_id: None,
            assigned_to: None,
            progress: 0,
            result: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            metadata: None,
        }
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Uuid>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn in_project(mut self, project_id: Uuid) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn with_parent(mut self, parent_task_id: Uuid) -> Self {
        self.parent_task_id = Some(parent_task_id);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_project(&self) -> bool {
        self.task_type == Some(TaskType::Project)
    }
}

// ---------------------------------------------------------------------------
// Agent-related enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Controller,
    Designer,
    Developer,
    Tester,
    Reviewer,
    /// No fixed pipeline position; runs the generic self-selecting loop.
    Generalist,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Controller => "controller",
            AgentRole::Designer => "designer",
            AgentRole::Developer => "developer",
            AgentRole::Tester => "tester",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Generalist => "generalist",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Controller,
    Worker,
    Coding,
    Standard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Running,
    Busy,
    Stopped,
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub role: AgentRole,
    pub skills: BTreeSet<String>,
    pub model: String,
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub current_workload: u32,
    pub max_workload: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        role: AgentRole,
        agent_type: AgentType,
        model: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            role,
            skills: BTreeSet::new(),
            model: model.into(),
            agent_type,
            status: AgentStatus::Idle,
            current_workload: 0,
            max_workload: 5,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_workload(mut self, max_workload: u32) -> Self {
        self.max_workload = max_workload;
        self
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn has_capacity(&self) -> bool {
        self.current_workload < self.max_workload
    }
}

// ---------------------------------------------------------------------------
// ContextEntry
// ---------------------------------------------------------------------------

/// A named, overwritable note attached to a task. Unique per `(task_id, key)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub task_id: Uuid,
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// TaskUpdate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateLevel {
    Info,
    Warning,
    Error,
}

/// Append-only activity line on a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub id: Uuid,
    pub task_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub content: String,
    pub level: UpdateLevel,
    pub created_at: DateTime<Utc>,
}

impl TaskUpdate {
    pub fn new(
        task_id: Uuid,
        agent_id: Option<Uuid>,
        level: UpdateLevel,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            agent_id,
            content: content.into(),
            level,
            created_at: Utc::now(),
        }
    }

    pub fn info(task_id: Uuid, agent_id: Option<Uuid>, content: impl Into<String>) -> Self {
        Self::new(task_id, agent_id, UpdateLevel::Info, content)
    }

    pub fn warning(task_id: Uuid, agent_id: Option<Uuid>, content: impl Into<String>) -> Self {
        Self::new(task_id, agent_id, UpdateLevel::Warning, content)
    }

    pub fn error(task_id: Uuid, agent_id: Option<Uuid>, content: impl Into<String>) -> Self {
        Self::new(task_id, agent_id, UpdateLevel::Error, content)
    }
}

// ---------------------------------------------------------------------------
// ProjectSnapshot
// ---------------------------------------------------------------------------

/// Per-status counts of the non-project tasks scoped to a project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub project_id: Uuid,
    pub total: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub archived: u64,
    pub unassigned: u64,
    pub timestamp: DateTime<Utc>,
}

impl ProjectSnapshot {
    /// Every child is completed or archived (and there is at least one).
    pub fn is_finished(&self) -> bool {
        self.total > 0 && self.completed + self.archived == self.total
    }
}
