//! Controller Loop.
//!
//! Every cycle runs five sweeps over the store, each isolated from the
//! others' failures:
//!
//! 1. decompose newly claimed projects into the phase template,
//! 2. propagate completed tasks to their pending siblings and archive them,
//! 3. release tasks stalled on agents that are no longer running,
//! 4. re-offer pending tasks whose dependencies are done,
//! 5. close projects whose children are all done.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tf_core::config::ModelsConfig;
use tf_core::store::{StoreError, TaskFilter, TaskStore};
use tf_core::types::{Agent, AgentStatus, Task, TaskStatus, TaskType, TaskUpdate};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::assignment::{AssignmentEngine, AssignmentError};
use crate::phases::build_phase_tasks;
use crate::registry::RunFlag;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("assignment error: {0}")]
    Assignment(#[from] AssignmentError),
    #[error("project {0} could not be claimed by the controller")]
    ProjectNotClaimed(Uuid),
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),
}

pub type Result<T> = std::result::Result<T, ControllerError>;

pub const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_secs(3600);

// ---------------------------------------------------------------------------
// CycleReport
// ---------------------------------------------------------------------------

/// What one controller cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub projects_decomposed: usize,
    pub phase_tasks_created: usize,
    pub propagated: usize,
    pub archived: usize,
    pub stalls_released: usize,
    pub progress_requests: usize,
    pub retried: usize,
    pub projects_completed: usize,
    /// Names of sweeps that aborted with an error.
    pub failed_sweeps: Vec<String>,
}

impl CycleReport {
    /// Nothing changed and nothing failed.
    pub fn is_idle(&self) -> bool {
        let changes = self.projects_decomposed
            + self.propagated
            + self.archived
            + self.stalls_released
            + self.progress_requests
            + self.retried
            + self.projects_completed;
        changes == 0 && self.failed_sweeps.is_empty()
    }
}

enum StallAction {
    Released,
    Pinged,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct Controller {
    agent: Agent,
    store: Arc<dyn TaskStore>,
    engine: AssignmentEngine,
    staleness_window: Duration,
    interval: Duration,
}

impl Controller {
    pub fn new(agent: Agent, store: Arc<dyn TaskStore>, models: ModelsConfig) -> Self {
        Self {
            engine: AssignmentEngine::new(store.clone(), models),
            agent,
            store,
            staleness_window: DEFAULT_STALENESS_WINDOW,
            interval: Duration::from_secs(30),
        }
    }

    pub fn with_staleness_window(mut self, window: Duration) -> Self {
        self.staleness_window = window;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn engine(&self) -> &AssignmentEngine {
        &self.engine
    }

    pub async fn run(self, flag: RunFlag) {
        info!(
            agent = %self.agent.name,
            interval_secs = self.interval.as_secs(),
            "controller loop started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = flag.stopped() => break,
            }
            if !flag.is_running() {
                break;
            }
            let report = self.run_cycle().await;
            if !report.is_idle() {
                info!(?report, "controller cycle");
            }
            self.log_snapshots().await;
        }
        info!(agent = %self.agent.name, "controller loop stopped");
    }

    /// Run all sweeps once. Never fails: a sweep error is logged and
    /// recorded in the report.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        match self.decompose_projects().await {
            Ok((projects, tasks)) => {
                report.projects_decomposed = projects;
                report.phase_tasks_created = tasks;
            }
            Err(e) => self.sweep_failed(&mut report, "decompose", &e),
        }
        match self.propagate_dependencies().await {
            Ok((propagated, archived)) => {
                report.propagated = propagated;
                report.archived = archived;
            }
            Err(e) => self.sweep_failed(&mut report, "propagate", &e),
        }
        match self.detect_stalls().await {
            Ok((released, pinged)) => {
                report.stalls_released = released;
                report.progress_requests = pinged;
            }
            Err(e) => self.sweep_failed(&mut report, "stalls", &e),
        }
        match self.retry_pending().await {
            Ok(n) => report.retried = n,
            Err(e) => self.sweep_failed(&mut report, "retry", &e),
        }
        match self.complete_projects().await {
            Ok(n) => report.projects_completed = n,
            Err(e) => self.sweep_failed(&mut report, "complete", &e),
        }
        report
    }

    fn sweep_failed(&self, report: &mut CycleReport, sweep: &str, e: &ControllerError) {
        error!(sweep = sweep, error = %e, "controller sweep failed");
        report.failed_sweeps.push(sweep.to_string());
    }

    // -- project intake --

    /// Create a project task and claim it for the controller so the next
    /// cycle decomposes it.
    pub async fn submit_project<I, S>(
        &self,
        title: impl Into<String>,
        description: impl Into<String>,
        skills: I,
        priority: i32,
    ) -> Result<Task>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let project = Task::new(title, description)
            .with_type(TaskType::Project)
            .with_skills(skills)
            .with_priority(priority);
        if !self
            .store
            .insert_claimed(&project, self.agent.id)
            .await?
            .is_claimed()
        {
            return Err(ControllerError::ProjectNotClaimed(project.id));
        }
        self.store
            .append_update(&TaskUpdate::info(
                project.id,
                Some(self.agent.id),
                "Project submitted",
            ))
            .await?;
        info!(project_id = %project.id, title = %project.title, "project submitted");

        self.store
            .get_task(project.id)
            .await?
            .ok_or(ControllerError::TaskNotFound(project.id))
    }

    /// Move a failed task back to `pending`. Failures are never retried
    /// automatically.
    pub async fn retry_task(&self, task_id: Uuid) -> Result<()> {
        self.store.transition_task(task_id, TaskStatus::Pending).await?;
        self.store
            .append_update(&TaskUpdate::info(task_id, Some(self.agent.id), "Retry requested"))
            .await?;
        info!(task_id = %task_id, "task queued for retry");
        Ok(())
    }

    // -- sweep 1: decomposition --

    /// Returns `(projects decomposed, tasks created)`.
    pub async fn decompose_projects(&self) -> Result<(usize, usize)> {
        let filter = TaskFilter::new()
            .status(TaskStatus::InProgress)
            .task_type(TaskType::Project)
            .assigned_to(self.agent.id);
        let projects = self.store.list_tasks(&filter).await?;

        let mut decomposed = 0;
        let mut created = 0;
        for project in projects {
            match self.decompose(&project).await {
                Ok(Some(n)) => {
                    decomposed += 1;
                    created += n;
                }
                Ok(None) => {}
                Err(e) => warn!(project_id = %project.id, error = %e, "decomposition failed"),
            }
        }
        Ok((decomposed, created))
    }

    async fn decompose(&self, project: &Task) -> Result<Option<usize>> {
        let existing = self
            .store
            .list_tasks(&TaskFilter::new().project(project.id).task_type(TaskType::Design))
            .await?;
        if !existing.is_empty() {
            return Ok(None);
        }

        let tasks = build_phase_tasks(project);
        self.store.insert_tasks(&tasks).await?;
        self.store
            .append_update(&TaskUpdate::info(
                project.id,
                Some(self.agent.id),
                format!("Decomposed into {} phase tasks", tasks.len()),
            ))
            .await?;
        info!(project_id = %project.id, tasks = tasks.len(), "project decomposed");

        for root in tasks.iter().filter(|t| t.dependencies.is_empty()) {
            if let Err(e) = self.engine.assign(root.id).await {
                warn!(task_id = %root.id, error = %e, "initial assignment failed");
            }
        }
        Ok(Some(tasks.len()))
    }

    // -- sweep 2: dependency propagation --

    /// Returns `(tasks assigned, tasks archived)`.
    pub async fn propagate_dependencies(&self) -> Result<(usize, usize)> {
        let completed = self
            .store
            .list_tasks(&TaskFilter::new().status(TaskStatus::Completed))
            .await?;

        let mut assigned = 0;
        let mut archived = 0;
        for task in completed {
            let Some(project_id) = task.project_id else {
                continue;
            };
            match self.propagate(&task, project_id).await {
                Ok(n) => {
                    assigned += n;
                    archived += 1;
                }
                Err(e) => warn!(task_id = %task.id, error = %e, "propagation failed"),
            }
        }
        Ok((assigned, archived))
    }

    async fn propagate(&self, completed: &Task, project_id: Uuid) -> Result<usize> {
        let siblings = self
            .store
            .list_tasks(&TaskFilter::new().project(project_id))
            .await?;
        let status: HashMap<Uuid, TaskStatus> = siblings.iter().map(|t| (t.id, t.status)).collect();

        let mut assigned = 0;
        for sibling in siblings.iter().filter(|t| {
            t.status == TaskStatus::Pending && t.assigned_to.is_none() && !t.is_project()
        }) {
            let ready = sibling
                .dependencies
                .iter()
                .all(|d| status.get(d).is_some_and(|s| s.is_done()));
            if ready && self.engine.assign(sibling.id).await?.is_some() {
                assigned += 1;
            }
        }

        self.store
            .transition_task(completed.id, TaskStatus::Archived)
            .await?;
        debug!(task_id = %completed.id, assigned, "completed task propagated and archived");
        Ok(assigned)
    }

    // -- sweep 3: stall detection --

    /// Returns `(tasks released, progress reports requested)`.
    pub async fn detect_stalls(&self) -> Result<(usize, usize)> {
        let window = chrono::Duration::from_std(self.staleness_window)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let cutoff = Utc::now() - window;

        let in_progress = self
            .store
            .list_tasks(&TaskFilter::new().status(TaskStatus::InProgress))
            .await?;

        let mut released = 0;
        let mut pinged = 0;
        for task in in_progress
            .iter()
            .filter(|t| !t.is_project() && t.updated_at < cutoff)
        {
            match self.handle_stall(task).await {
                Ok(StallAction::Released) => released += 1,
                Ok(StallAction::Pinged) => pinged += 1,
                Err(e) => warn!(task_id = %task.id, error = %e, "stall check failed"),
            }
        }
        Ok((released, pinged))
    }

    async fn handle_stall(&self, task: &Task) -> Result<StallAction> {
        let owner = match task.assigned_to {
            Some(id) => self.store.get_agent(id).await?,
            None => None,
        };
        match owner {
            Some(agent) if agent.status == AgentStatus::Running => {
                self.store
                    .append_update(&TaskUpdate::info(
                        task.id,
                        Some(self.agent.id),
                        format!(
                            "Progress report requested from {}: no activity since {}",
                            agent.name,
                            task.updated_at.format("%Y-%m-%d %H:%M")
                        ),
                    ))
                    .await?;
                Ok(StallAction::Pinged)
            }
            owner => {
                let name = owner.map_or_else(|| "unknown agent".to_string(), |a| a.name);
                self.store.release_task(task.id).await?;
                self.store
                    .append_update(&TaskUpdate::warning(
                        task.id,
                        Some(self.agent.id),
                        format!("Stalled on {name}; returned to pending"),
                    ))
                    .await?;
                warn!(task_id = %task.id, agent = %name, "stalled task released");
                Ok(StallAction::Released)
            }
        }
    }

    // -- sweep 4: pending retry --

    /// Offer pending phase tasks with satisfied dependencies to the
    /// assignment engine again.
    pub async fn retry_pending(&self) -> Result<usize> {
        let pending = self
            .store
            .list_tasks(&TaskFilter::new().status(TaskStatus::Pending).unassigned())
            .await?;

        let mut done_cache: HashMap<Uuid, bool> = HashMap::new();
        let mut assigned = 0;
        for task in pending
            .iter()
            .filter(|t| t.task_type.is_some() && !t.is_project())
        {
            match self.dependencies_done(task, &mut done_cache).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "dependency lookup failed");
                    continue;
                }
            }
            match self.engine.assign(task.id).await {
                Ok(Some(_)) => assigned += 1,
                Ok(None) => {}
                Err(e) => warn!(task_id = %task.id, error = %e, "retry assignment failed"),
            }
        }
        Ok(assigned)
    }

    async fn dependencies_done(
        &self,
        task: &Task,
        cache: &mut HashMap<Uuid, bool>,
    ) -> Result<bool> {
        for dep in &task.dependencies {
            let done = match cache.get(dep) {
                Some(done) => *done,
                None => {
                    let done = self
                        .store
                        .get_task(*dep)
                        .await?
                        .is_some_and(|t| t.status.is_done());
                    cache.insert(*dep, done);
                    done
                }
            };
            if !done {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // -- sweep 5: project completion --

    pub async fn complete_projects(&self) -> Result<usize> {
        let projects = self
            .store
            .list_tasks(
                &TaskFilter::new()
                    .status(TaskStatus::InProgress)
                    .task_type(TaskType::Project),
            )
            .await?;

        let mut closed = 0;
        for project in projects {
            match self.close_if_finished(&project).await {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(e) => warn!(project_id = %project.id, error = %e, "project closure failed"),
            }
        }
        Ok(closed)
    }

    async fn close_if_finished(&self, project: &Task) -> Result<bool> {
        let snapshot = self.store.project_snapshot(project.id).await?;
        if !snapshot.is_finished() {
            return Ok(false);
        }
        let owner = project.assigned_to.unwrap_or(self.agent.id);
        let summary = format!("All {} phase tasks completed", snapshot.total);
        self.store
            .finish_task(project.id, owner, TaskStatus::Completed, &summary)
            .await?;
        self.store
            .append_update(&TaskUpdate::info(project.id, Some(self.agent.id), summary))
            .await?;
        info!(project_id = %project.id, title = %project.title, "project completed");
        Ok(true)
    }

    async fn log_snapshots(&self) {
        let filter = TaskFilter::new()
            .status(TaskStatus::InProgress)
            .task_type(TaskType::Project);
        let projects = match self.store.list_tasks(&filter).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "could not list projects for snapshot");
                return;
            }
        };
        for project in projects {
            match self.store.project_snapshot(project.id).await {
                Ok(s) => info!(
                    project_id = %project.id,
                    total = s.total,
                    pending = s.pending,
                    in_progress = s.in_progress,
                    completed = s.completed + s.archived,
                    failed = s.failed,
                    "project progress"
                ),
                Err(e) => warn!(project_id = %project.id, error = %e, "snapshot failed"),
            }
        }
    }
}
