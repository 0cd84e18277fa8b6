//! Worker Loop: one per pipeline agent (designer, developer, tester,
//! reviewer). Each cycle picks up the agent's in-progress task, asks the
//! model for the role's deliverable, stores the artifacts and hands off to
//! the next phase.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tf_core::store::{StoreError, TaskFilter, TaskStore};
use tf_core::types::{Agent, Task, TaskStatus, TaskUpdate};
use tf_intelligence::{
    collect_stream, complete_prompt, stream_prompt, LlmConfig, LlmError, LlmProvider,
};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifacts::{extract_artifacts, phase_name, summarize, ArtifactError, ArtifactSink};
use crate::context::{ContextAssembler, ContextError};
use crate::phases::{follow_up_task, is_follow_up_of};
use crate::prompts::{worker_prompt, PromptSettings};
use crate::registry::RunFlag;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("context error: {0}")]
    Context(#[from] ContextError),
    #[error("completion failed: {0}")]
    Llm(#[from] LlmError),
    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

pub const STARTED_PROGRESS: u8 = 25;
pub const INVOKING_PROGRESS: u8 = 50;

// ---------------------------------------------------------------------------
// WorkerLoop
// ---------------------------------------------------------------------------

pub struct WorkerLoop {
    agent: Agent,
    store: Arc<dyn TaskStore>,
    llm: Arc<dyn LlmProvider>,
    llm_config: LlmConfig,
    assembler: ContextAssembler,
    sink: ArtifactSink,
    prompts: PromptSettings,
    interval: Duration,
    streaming: bool,
}

impl WorkerLoop {
    pub fn new(agent: Agent, store: Arc<dyn TaskStore>, llm: Arc<dyn LlmProvider>) -> Self {
        let llm_config = LlmConfig {
            model: agent.model.clone(),
            ..LlmConfig::default()
        };
        Self {
            assembler: ContextAssembler::new(store.clone()),
            sink: ArtifactSink::new(store.clone(), None),
            agent,
            store,
            llm,
            llm_config,
            prompts: PromptSettings::default(),
            interval: Duration::from_secs(10),
            streaming: false,
        }
    }

    pub fn with_llm_config(mut self, config: LlmConfig) -> Self {
        self.llm_config = config;
        self
    }

    pub fn with_prompt_settings(mut self, prompts: PromptSettings) -> Self {
        self.prompts = prompts;
        self
    }

    /// Also write artifacts as files under `workspace`.
    pub fn with_workspace(mut self, workspace: Option<PathBuf>) -> Self {
        self.sink = ArtifactSink::new(self.store.clone(), workspace);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Use the streaming completion call instead of the single-shot one.
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Poll until `flag` is stopped. A failed cycle is logged and the next
    /// one runs on schedule.
    pub async fn run(self, flag: RunFlag) {
        info!(agent = %self.agent.name, role = %self.agent.role, "worker loop started");
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
            match self.run_cycle().await {
                Ok(Some(task_id)) => {
                    debug!(agent = %self.agent.name, task_id = %task_id, "cycle processed task")
                }
                Ok(None) => {}
                Err(e) => error!(agent = %self.agent.name, error = %e, "worker cycle failed"),
            }
        }
        info!(agent = %self.agent.name, "worker loop stopped");
    }

    /// One cycle: process the agent's oldest highest-priority in-progress
    /// task, if any.
    pub async fn run_cycle(&self) -> Result<Option<Uuid>> {
        let filter = TaskFilter::new()
            .status(TaskStatus::InProgress)
            .assigned_to(self.agent.id);
        let Some(task) = self.store.list_tasks(&filter).await?.into_iter().next() else {
            return Ok(None);
        };
        self.process(task).await.map(Some)
    }

    /// Drive one task to `completed` or `failed`.
    pub async fn process(&self, task: Task) -> Result<Uuid> {
        let task_id = task.id;
        info!(
            agent = %self.agent.name,
            task_id = %task_id,
            title = %task.title,
            "processing task"
        );

        self.store.set_progress(task_id, STARTED_PROGRESS).await?;
        self.store
            .append_update(&TaskUpdate::info(
                task_id,
                Some(self.agent.id),
                format!("Started by {} ({})", self.agent.name, self.agent.role),
            ))
            .await?;

        if let Err(e) = self.execute(task_id).await {
            self.record_failure(task_id, &e).await;
            return Err(e);
        }
        Ok(task_id)
    }

    async fn execute(&self, task_id: Uuid) -> Result<Task> {
        let ctx = self.assembler.assemble(task_id).await?;
        let (system, user) = worker_prompt(self.agent.role, &ctx, &self.prompts);

        self.store.set_progress(task_id, INVOKING_PROGRESS).await?;
        let response = self.invoke(&system, &user).await?;

        let phase = phase_name(self.agent.role);
        let artifacts = extract_artifacts(phase, &response);
        self.sink.save(&ctx.task, &artifacts).await?;

        let summary = summarize(self.agent.role, &response);
        let mut done = ctx.task.clone();
        done.status = TaskStatus::Completed;
        done.result = Some(summary.clone());
        let follow_up = self.follow_up_for(&done).await?;

        let finished = self
            .store
            .finish_and_spawn(
                task_id,
                self.agent.id,
                TaskStatus::Completed,
                &summary,
                follow_up.as_slice(),
            )
            .await?;
        self.store
            .append_update(&TaskUpdate::info(
                task_id,
                Some(self.agent.id),
                format!("Completed with {} artifact(s)", artifacts.len()),
            ))
            .await?;
        info!(
            task_id = %task_id,
            agent = %self.agent.name,
            artifacts = artifacts.len(),
            "task completed"
        );

        if let Some(next) = follow_up {
            let next_type = next.task_type.map(|t| t.as_str()).unwrap_or("task");
            self.store
                .append_update(&TaskUpdate::info(
                    task_id,
                    Some(self.agent.id),
                    format!("Spawned {next_type} task '{}'", next.title),
                ))
                .await?;
            info!(
                task_id = %task_id,
                follow_up = %next.id,
                task_type = next_type,
                "pipeline handoff"
            );
        }
        Ok(finished)
    }

    async fn invoke(&self, system: &str, user: &str) -> Result<String> {
        let text = if self.streaming {
            let stream = stream_prompt(self.llm.as_ref(), system, user, &self.llm_config).await?;
            collect_stream(stream).await?
        } else {
            complete_prompt(self.llm.as_ref(), system, user, &self.llm_config).await?
        };
        Ok(text)
    }

    /// Mark the task failed. Errors here are only logged: the task may
    /// already have been released by the stall sweep.
    async fn record_failure(&self, task_id: Uuid, cause: &WorkerError) {
        error!(task_id = %task_id, agent = %self.agent.name, error = %cause, "task failed");
        let message = format!("Error: {cause}");
        match self
            .store
            .finish_task(task_id, self.agent.id, TaskStatus::Failed, &message)
            .await
        {
            Ok(_) => {}
            Err(StoreError::NotOwner { .. }) => {
                warn!(
                    task_id = %task_id,
                    agent = %self.agent.name,
                    "task no longer owned; failure not recorded"
                );
                return;
            }
            Err(e) => warn!(task_id = %task_id, error = %e, "could not mark task failed"),
        }
        if let Err(e) = self
            .store
            .append_update(&TaskUpdate::error(task_id, Some(self.agent.id), message))
            .await
        {
            warn!(task_id = %task_id, error = %e, "could not record failure update");
        }
    }

    /// The next phase's task for `completed`, if one is due. Delegated
    /// subtasks and untyped tasks never hand off; a source gets at most one
    /// follow-up.
    pub async fn follow_up_for(&self, completed: &Task) -> Result<Option<Task>> {
        if completed.task_type.is_none()
            || completed.is_project()
            || completed.parent_task_id.is_some()
        {
            return Ok(None);
        }
        let Some(next) = follow_up_task(completed, self.agent.role) else {
            return Ok(None);
        };
        let Some(next_type) = next.task_type else {
            return Ok(None);
        };

        let mut filter = TaskFilter::new().task_type(next_type);
        if let Some(project_id) = completed.project_id {
            filter = filter.project(project_id);
        }
        let existing = self.store.list_tasks(&filter).await?;
        if let Some(dup) = existing.iter().find(|t| is_follow_up_of(t, completed.id)) {
            debug!(task_id = %completed.id, follow_up = %dup.id, "follow-up already exists");
            return Ok(None);
        }
        Ok(Some(next))
    }
}
