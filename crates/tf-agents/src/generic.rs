//! Generic Agent Loop: for agents without a fixed pipeline role.
//!
//! Each cycle either continues one of the agent's own in-progress tasks
//! (once its delegated subtasks have settled) or claims the best matching
//! pending task. The model ends every reply with a JSON directive:
//! `complete`, `delegate` or `context`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use serde::{Deserialize, Serialize};
use tf_core::store::{StoreError, TaskFilter, TaskStore};
use tf_core::types::{Agent, AgentStatus, AgentType, Task, TaskStatus, TaskUpdate};
use tf_intelligence::{complete_prompt, LlmConfig, LlmError, LlmProvider};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifacts::{
    extract_artifacts, extract_code_blocks, phase_name, ArtifactError, ArtifactSink,
};
use crate::context::{ContextAssembler, ContextError};
use crate::prompts::{
    generic_prompt, truncate, PromptMode, PromptSettings, CONTEXT_VALUE_LIMIT,
};
use crate::registry::RunFlag;

#[derive(Debug, Error)]
pub enum GenericError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("context error: {0}")]
    Context(#[from] ContextError),
    #[error("completion failed: {0}")]
    Llm(#[from] LlmError),
    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),
}

pub type Result<T> = std::result::Result<T, GenericError>;

/// Context key holding the number of model turns spent on a task.
pub const TURNS_KEY: &str = "_turns";

const CONTEXT_PROGRESS_STEP: u8 = 10;
const MAX_OPEN_PROGRESS: u8 = 90;

// ---------------------------------------------------------------------------
// Directives
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Directive {
    Complete {
        #[serde(default)]
        result: String,
    },
    Delegate {
        agent: String,
        title: String,
        #[serde(default)]
        description: String,
    },
    Context {
        key: String,
        value: String,
    },
}

/// The last directive in `response`: a ```json block first, then any bare
/// JSON object.
pub fn parse_directive(response: &str) -> Option<Directive> {
    let fenced = extract_code_blocks(response)
        .into_iter()
        .rev()
        .filter(|b| b.language.as_deref().map_or(true, |l| l.eq_ignore_ascii_case("json")))
        .find_map(|b| serde_json::from_str::<Directive>(b.content.trim()).ok());
    if fenced.is_some() {
        return fenced;
    }

    response
        .match_indices('{')
        .map(|(i, _)| i)
        .rev()
        .find_map(|i| {
            serde_json::Deserializer::from_str(&response[i..])
                .into_iter::<Directive>()
                .next()
                .and_then(|r| r.ok())
        })
}

/// Resolve a delegate by exact name, then role, then fuzzy name or role.
/// The requesting agent, controllers and stopped agents are never chosen.
pub fn resolve_delegate<'a>(
    query: &str,
    agents: &'a [Agent],
    requester: Uuid,
) -> Option<&'a Agent> {
    let query = query.trim();
    if query.is_empty() {
        return None;
    }
    let pool: Vec<&Agent> = agents
        .iter()
        .filter(|a| {
            a.id != requester
                && a.agent_type != AgentType::Controller
                && a.status != AgentStatus::Stopped
        })
        .collect();

    if let Some(a) = pool.iter().find(|a| a.name.eq_ignore_ascii_case(query)) {
        return Some(*a);
    }
    if let Some(a) = pool.iter().find(|a| a.role.as_str().eq_ignore_ascii_case(query)) {
        return Some(*a);
    }

    let matcher = SkimMatcherV2::default().ignore_case();
    pool.iter()
        .filter_map(|a| {
            let by_name = matcher.fuzzy_match(&a.name, query);
            let by_role = matcher.fuzzy_match(a.role.as_str(), query);
            by_name.max(by_role).map(|score| (*a, score))
        })
        // first-seen wins on equal scores
        .fold(None, |best: Option<(&Agent, i64)>, (a, score)| match best {
            Some((_, s)) if s >= score => best,
            _ => Some((a, score)),
        })
        .map(|(a, _)| a)
}

fn skills_match(task: &Task, agent: &Agent) -> bool {
    task.required_skills.is_empty() || task.required_skills.iter().any(|s| agent.skills.contains(s))
}

// ---------------------------------------------------------------------------
// GenericAgentLoop
// ---------------------------------------------------------------------------

pub struct GenericAgentLoop {
    agent: Agent,
    store: Arc<dyn TaskStore>,
    llm: Arc<dyn LlmProvider>,
    llm_config: LlmConfig,
    assembler: ContextAssembler,
    sink: ArtifactSink,
    prompts: PromptSettings,
    interval: Duration,
    max_turns: u32,
}

impl GenericAgentLoop {
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
            max_turns: 10,
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

    pub fn with_workspace(mut self, workspace: Option<PathBuf>) -> Self {
        self.sink = ArtifactSink::new(self.store.clone(), workspace);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub async fn run(self, flag: RunFlag) {
        info!(agent = %self.agent.name, "generic agent loop started");
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
                Err(e) => error!(agent = %self.agent.name, error = %e, "generic cycle failed"),
            }
        }
        info!(agent = %self.agent.name, "generic agent loop stopped");
    }

    /// One turn on one task: a ready own task first, else a newly claimed
    /// pending one.
    pub async fn run_cycle(&self) -> Result<Option<Uuid>> {
        if let Some(task) = self.next_own_task().await? {
            let mode = if task.progress == 0 {
                PromptMode::Start
            } else {
                PromptMode::Continue
            };
            self.process(&task, mode).await?;
            return Ok(Some(task.id));
        }

        if let Some(task) = self.claim_next().await? {
            self.process(&task, PromptMode::Start).await?;
            return Ok(Some(task.id));
        }
        Ok(None)
    }

    /// An in-progress task owned by this agent with no open subtasks.
    async fn next_own_task(&self) -> Result<Option<Task>> {
        let own = self
            .store
            .list_tasks(
                &TaskFilter::new()
                    .status(TaskStatus::InProgress)
                    .assigned_to(self.agent.id),
            )
            .await?;
        for task in own {
            let subtasks = self
                .store
                .list_tasks(&TaskFilter::new().parent(task.id))
                .await?;
            let settled = subtasks
                .iter()
                .all(|s| s.status.is_done() || s.status == TaskStatus::Failed);
            if settled {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    /// Claim the highest-priority pending task this agent can do.
    async fn claim_next(&self) -> Result<Option<Task>> {
        let pending = self
            .store
            .list_tasks(&TaskFilter::new().status(TaskStatus::Pending).unassigned())
            .await?;

        for task in pending
            .into_iter()
            .filter(|t| !t.is_project() && skills_match(t, &self.agent))
        {
            let mut ready = true;
            for dep in &task.dependencies {
                let done = self
                    .store
                    .get_task(*dep)
                    .await?
                    .is_some_and(|d| d.status.is_done());
                if !done {
                    ready = false;
                    break;
                }
            }
            if !ready {
                continue;
            }

            if self.store.claim_task(task.id, self.agent.id).await?.is_claimed() {
                self.store
                    .append_update(&TaskUpdate::info(
                        task.id,
                        Some(self.agent.id),
                        format!("Claimed by {}", self.agent.name),
                    ))
                    .await?;
                info!(agent = %self.agent.name, task_id = %task.id, "task claimed");
                return Ok(self.store.get_task(task.id).await?);
            }
        }
        Ok(None)
    }

    async fn turns_taken(&self, task_id: Uuid) -> Result<u32> {
        let entries = self.store.get_context(task_id).await?;
        Ok(entries
            .get(TURNS_KEY)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// One model turn on `task`, then apply the directive.
    pub async fn process(&self, task: &Task, mode: PromptMode) -> Result<()> {
        let turns = self.turns_taken(task.id).await? + 1;
        if turns > self.max_turns {
            let message = format!("Error: no completion after {} turns", self.max_turns);
            self.fail(task.id, &message).await?;
            return Ok(());
        }
        self.store
            .set_context(task.id, TURNS_KEY, &turns.to_string())
            .await?;
        if task.progress == 0 {
            self.store.set_progress(task.id, 25).await?;
        }

        let ctx = self.assembler.assemble(task.id).await?;
        let (system, user) = generic_prompt(&self.agent, &ctx, mode, &self.prompts);
        let response = match complete_prompt(self.llm.as_ref(), &system, &user, &self.llm_config)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                self.fail(task.id, &format!("Error: {e}")).await?;
                return Err(e.into());
            }
        };
        self.store
            .append_update(&TaskUpdate::info(
                task.id,
                Some(self.agent.id),
                truncate(&response, CONTEXT_VALUE_LIMIT),
            ))
            .await?;

        let directive = parse_directive(&response).unwrap_or_else(|| {
            debug!(task_id = %task.id, "no directive in response; treating as complete");
            Directive::Complete {
                result: response.clone(),
            }
        });

        match directive {
            Directive::Complete { result } => {
                let result = if result.trim().is_empty() {
                    response.clone()
                } else {
                    result
                };
                self.complete(&ctx.task, &response, &result).await
            }
            Directive::Delegate {
                agent,
                title,
                description,
            } => self.delegate(&ctx.task, &agent, title, description).await,
            Directive::Context { key, value } => {
                self.store.set_context(task.id, &key, &value).await?;
                let progress = ctx
                    .task
                    .progress
                    .saturating_add(CONTEXT_PROGRESS_STEP)
                    .min(MAX_OPEN_PROGRESS);
                self.store.set_progress(task.id, progress).await?;
                debug!(task_id = %task.id, key = %key, "context saved");
                Ok(())
            }
        }
    }

    async fn complete(&self, task: &Task, response: &str, result: &str) -> Result<()> {
        let artifacts = extract_artifacts(phase_name(self.agent.role), response);
        if let Err(e) = self.sink.save(task, &artifacts).await {
            self.fail(task.id, &format!("Error: {e}")).await?;
            return Err(e.into());
        }
        self.store
            .finish_task(task.id, self.agent.id, TaskStatus::Completed, result)
            .await?;
        info!(agent = %self.agent.name, task_id = %task.id, "task completed");
        Ok(())
    }

    async fn delegate(
        &self,
        task: &Task,
        query: &str,
        title: String,
        description: String,
    ) -> Result<()> {
        let agents = self.store.list_agents().await?;
        let Some(target) = resolve_delegate(query, &agents, self.agent.id) else {
            warn!(task_id = %task.id, query = %query, "delegate not found");
            self.store
                .append_update(&TaskUpdate::warning(
                    task.id,
                    Some(self.agent.id),
                    format!("No agent matches '{query}'; delegation skipped"),
                ))
                .await?;
            return Ok(());
        };

        let mut subtask = Task::new(title, description)
            .with_priority(task.priority)
            .with_parent(task.id);
        if let Some(project_id) = task.project_id {
            subtask = subtask.in_project(project_id);
        }
        self.store.insert_task(&subtask).await?;

        let claimed = self.store.claim_task(subtask.id, target.id).await?.is_claimed();
        let note = if claimed {
            format!("Delegated '{}' to {}", subtask.title, target.name)
        } else {
            format!(
                "Created '{}' for {}, who is at capacity; left pending",
                subtask.title, target.name
            )
        };
        self.store
            .append_update(&TaskUpdate::info(task.id, Some(self.agent.id), note))
            .await?;
        info!(
            task_id = %task.id,
            subtask_id = %subtask.id,
            delegate = %target.name,
            claimed,
            "subtask delegated"
        );
        Ok(())
    }

    async fn fail(&self, task_id: Uuid, message: &str) -> Result<()> {
        error!(agent = %self.agent.name, task_id = %task_id, error = %message, "task failed");
        self.store
            .finish_task(task_id, self.agent.id, TaskStatus::Failed, message)
            .await?;
        self.store
            .append_update(&TaskUpdate::error(task_id, Some(self.agent.id), message))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tf_core::types::AgentRole;

    fn agent(name: &str, role: AgentRole, agent_type: AgentType) -> Agent {
        Agent::new(name, role, agent_type, "m").with_status(AgentStatus::Running)
    }

    #[test]
    fn parses_fenced_directive() {
        let text = "Done.\n\n```json\n{\"action\": \"complete\", \"result\": \"all good\"}\n```";
        assert_eq!(
            parse_directive(text),
            Some(Directive::Complete {
                result: "all good".into()
            })
        );
    }

    #[test]
    fn parses_bare_directive() {
        let text = "Saving a note {\"action\": \"context\", \"key\": \"plan\", \"value\": \"step 1\"} ok";
        assert_eq!(
            parse_directive(text),
            Some(Directive::Context {
                key: "plan".into(),
                value: "step 1".into()
            })
        );
    }

    #[test]
    fn delegate_description_defaults() {
        let text = "{\"action\": \"delegate\", \"agent\": \"dev\", \"title\": \"Write it\"}";
        assert_eq!(
            parse_directive(text),
            Some(Directive::Delegate {
                agent: "dev".into(),
                title: "Write it".into(),
                description: String::new()
            })
        );
    }

    #[test]
    fn no_directive() {
        assert_eq!(parse_directive("plain prose, {not json}"), None);
        assert_eq!(parse_directive("{\"action\": \"dance\"}"), None);
    }

    #[test]
    fn delegate_resolution_order() {
        let me = agent("generalist", AgentRole::Generalist, AgentType::Standard);
        let agents = vec![
            me.clone(),
            agent("alice", AgentRole::Developer, AgentType::Worker),
            agent("bob", AgentRole::Tester, AgentType::Worker),
            agent("boss", AgentRole::Controller, AgentType::Controller),
        ];

        assert_eq!(resolve_delegate("ALICE", &agents, me.id).unwrap().name, "alice");
        assert_eq!(resolve_delegate("tester", &agents, me.id).unwrap().name, "bob");
        assert_eq!(resolve_delegate("dev", &agents, me.id).unwrap().name, "alice");
        assert!(resolve_delegate("generalist", &agents, me.id).is_none());
        assert!(resolve_delegate("boss", &agents, me.id).is_none());
        assert!(resolve_delegate("zzz", &agents, me.id).is_none());
    }

    #[test]
    fn stopped_agents_are_skipped() {
        let me = agent("me", AgentRole::Generalist, AgentType::Standard);
        let mut gone = agent("writer", AgentRole::Designer, AgentType::Worker);
        gone.status = AgentStatus::Stopped;
        assert!(resolve_delegate("writer", &[me.clone(), gone], me.id).is_none());
    }
}
