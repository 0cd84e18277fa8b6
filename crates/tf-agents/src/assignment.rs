//! Assignment Engine: pick exactly one worker for a task and claim it.

use std::sync::Arc;

use tf_core::config::ModelsConfig;
use tf_core::store::{ClaimOutcome, StoreError, TaskStore};
use tf_core::types::{Agent, AgentStatus, AgentType, Task, TaskUpdate};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AssignmentError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),
}

pub type Result<T> = std::result::Result<T, AssignmentError>;

pub const SKILL_WEIGHT: f64 = 0.7;
pub const WORKLOAD_WEIGHT: f64 = 0.3;

/// Update text recorded when nobody can take a task.
pub const NO_AGENT_AVAILABLE: &str = "No agent available for assignment; task stays pending";

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// `|required ∩ agent| / |required|`, or 1.0 when nothing is required.
pub fn skill_score(task: &Task, agent: &Agent) -> f64 {
    if task.required_skills.is_empty() {
        return 1.0;
    }
    let matched = task
        .required_skills
        .iter()
        .filter(|s| agent.skills.contains(*s))
        .count();
    matched as f64 / task.required_skills.len() as f64
}

/// `1 - current/max`; an agent with no capacity at all scores 0.
pub fn workload_score(agent: &Agent) -> f64 {
    if agent.max_workload == 0 {
        return 0.0;
    }
    1.0 - f64::from(agent.current_workload) / f64::from(agent.max_workload)
}

pub fn combined_score(task: &Task, agent: &Agent) -> f64 {
    SKILL_WEIGHT * skill_score(task, agent) + WORKLOAD_WEIGHT * workload_score(agent)
}

/// Whether `agent` may be considered at all.
pub fn is_candidate(agent: &Agent, required_model: Option<&str>) -> bool {
    agent.agent_type == AgentType::Worker
        && agent.status == AgentStatus::Running
        && agent.has_capacity()
        && required_model.map_or(true, |m| agent.model == m)
}

/// Candidates ordered best first. Ties keep pool order, so the first-seen
/// agent wins a tie.
pub fn rank_candidates<'a>(
    task: &Task,
    pool: &'a [Agent],
    required_model: Option<&str>,
) -> Vec<(&'a Agent, f64)> {
    let mut ranked: Vec<(&Agent, f64)> = pool
        .iter()
        .filter(|a| is_candidate(a, required_model))
        .map(|a| (a, combined_score(task, a)))
        .collect();
    // stable sort: equal scores stay in first-seen order
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
}

/// The single best candidate, if any.
pub fn select_agent<'a>(
    task: &Task,
    pool: &'a [Agent],
    required_model: Option<&str>,
) -> Option<&'a Agent> {
    rank_candidates(task, pool, required_model)
        .first()
        .map(|(agent, _)| *agent)
}

// ---------------------------------------------------------------------------
// AssignmentEngine
// ---------------------------------------------------------------------------

pub struct AssignmentEngine {
    store: Arc<dyn TaskStore>,
    models: ModelsConfig,
}

impl AssignmentEngine {
    pub fn new(store: Arc<dyn TaskStore>, models: ModelsConfig) -> Self {
        Self { store, models }
    }

    pub fn required_model(&self, task: &Task) -> Option<&str> {
        task.task_type.and_then(|t| self.models.required_model(t))
    }

    /// Assign `task_id` to the best available worker.
    ///
    /// Re-running against a task that is already assigned returns its
    /// current owner without touching anything. If the best candidate lost
    /// capacity between the read and the claim, the next one is tried.
    pub async fn assign(&self, task_id: Uuid) -> Result<Option<Uuid>> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(AssignmentError::TaskNotFound(task_id))?;

        if !task.status.is_claimable() || task.assigned_to.is_some() {
            debug!(task_id = %task_id, status = %task.status, "task not assignable; skipping");
            return Ok(task.assigned_to);
        }

        let pool = self.store.list_agents().await?;
        let required_model = self.required_model(&task);
        let ranked = rank_candidates(&task, &pool, required_model);

        if ranked.is_empty() {
            self.note_unavailable(&task, required_model).await?;
            return Ok(None);
        }

        for (agent, score) in ranked {
            match self.store.claim_task(task_id, agent.id).await? {
                ClaimOutcome::Claimed => {
                    info!(
                        task_id = %task_id,
                        agent = %agent.name,
                        score = score,
                        "task assigned"
                    );
                    self.store
                        .append_update(&TaskUpdate::info(
                            task_id,
                            Some(agent.id),
                            format!("Assigned to {} (score {:.2})", agent.name, score),
                        ))
                        .await?;
                    return Ok(Some(agent.id));
                }
                ClaimOutcome::AgentAtCapacity => {
                    debug!(
                        task_id = %task_id,
                        agent = %agent.name,
                        "candidate at capacity; trying next"
                    );
                }
                ClaimOutcome::DependenciesUnmet => {
                    debug!(task_id = %task_id, "dependencies not done; leaving pending");
                    return Ok(None);
                }
                ClaimOutcome::NotClaimable => {
                    debug!(task_id = %task_id, "task claimed elsewhere");
                    return Ok(None);
                }
            }
        }

        self.note_unavailable(&task, required_model).await?;
        Ok(None)
    }

    /// Record the "no agent" update, once per streak of failed attempts.
    async fn note_unavailable(&self, task: &Task, required_model: Option<&str>) -> Result<()> {
        let updates = self.store.list_updates(task.id).await?;
        if updates.last().is_some_and(|u| u.content == NO_AGENT_AVAILABLE) {
            return Ok(());
        }
        info!(
            task_id = %task.id,
            required_model = required_model.unwrap_or("any"),
            "no agent available"
        );
        self.store
            .append_update(&TaskUpdate::info(task.id, None, NO_AGENT_AVAILABLE))
            .await?;
        Ok(())
    }
}
