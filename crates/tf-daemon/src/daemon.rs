use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tf_agents::controller::Controller;
use tf_agents::generic::GenericAgentLoop;
use tf_agents::prompts::PromptSettings;
use tf_agents::registry::{LoopKind, LoopRegistry, RunFlag};
use tf_agents::worker::WorkerLoop;
use tf_core::config::{AgentSpec, Config};
use tf_core::sqlite::SqliteStore;
use tf_core::store::TaskStore;
use tf_core::types::{Agent, AgentRole, AgentStatus, AgentType};
use tf_intelligence::{provider_from_settings, LlmConfig, LlmProvider};
use tracing::{error, info, warn};

/// Loop cadences, taken from `[orchestrator]`.
#[derive(Debug, Clone)]
pub struct DaemonIntervals {
    pub controller: Duration,
    pub worker: Duration,
    pub generic: Duration,
}

impl DaemonIntervals {
    pub fn from_config(config: &Config) -> Self {
        let orch = &config.orchestrator;
        Self {
            controller: Duration::from_secs(orch.controller_interval_secs),
            worker: Duration::from_secs(orch.worker_interval_secs),
            generic: Duration::from_secs(orch.generic_interval_secs),
        }
    }
}

/// The taskforge background daemon.
///
/// Registers the agents declared in config, spawns one loop per agent and
/// supervises them through a [`LoopRegistry`]. Shuts down gracefully when
/// the handle from [`Daemon::shutdown_handle`] is stopped (e.g. via ctrl-c).
pub struct Daemon {
    config: Config,
    store: Arc<dyn TaskStore>,
    llm: Arc<dyn LlmProvider>,
    intervals: DaemonIntervals,
    registry: LoopRegistry,
    agents: Vec<Agent>,
    shutdown: RunFlag,
}

impl Daemon {
    /// Create a daemon from already-built parts.
    pub fn with_parts(
        config: Config,
        store: Arc<dyn TaskStore>,
        llm: Arc<dyn LlmProvider>,
    ) -> Self {
        let intervals = DaemonIntervals::from_config(&config);
        Self {
            config,
            store,
            llm,
            intervals,
            registry: LoopRegistry::new(),
            agents: Vec::new(),
            shutdown: RunFlag::new(),
        }
    }

    /// Create a daemon, opening (or creating) the store and building the
    /// completion provider from config.
    pub async fn new(config: Config) -> Result<Self> {
        let path = PathBuf::from(&config.store.path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let store = SqliteStore::new(&path)
            .await
            .context("failed to open task store")?;
        let llm = provider_from_settings(&config.llm).context("failed to build LLM provider")?;
        info!(provider = ?config.llm.provider, "completion provider ready");
        Ok(Self::with_parts(config, Arc::new(store), llm))
    }

    /// Override the loop cadences from config.
    pub fn set_intervals(&mut self, intervals: DaemonIntervals) {
        self.intervals = intervals;
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> RunFlag {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Agents registered by the last [`Daemon::start`].
    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn loop_names(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn is_running(&self, loop_name: &str) -> bool {
        self.registry.is_running(loop_name)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Register the declared agents, mark them running and spawn their loops.
    pub async fn start(&mut self) -> Result<()> {
        if self.config.agents.is_empty() {
            warn!("no agents declared; nothing will be scheduled");
        }
        let mut agents = Vec::with_capacity(self.config.agents.len());
        for spec in &self.config.agents {
            let agent = self
                .store
                .register_agent(&agent_from_spec(spec))
                .await
                .with_context(|| format!("failed to register agent {}", spec.name))?;
            self.store
                .set_agent_status(agent.id, AgentStatus::Running)
                .await
                .with_context(|| format!("failed to mark agent {} running", agent.name))?;
            agents.push(Agent {
                status: AgentStatus::Running,
                ..agent
            });
        }

        for agent in &agents {
            self.spawn_loop(agent.clone());
        }
        info!(
            agents = agents.len(),
            loops = self.registry.len(),
            controller_secs = self.intervals.controller.as_secs(),
            worker_secs = self.intervals.worker.as_secs(),
            generic_secs = self.intervals.generic.as_secs(),
            "daemon started"
        );
        self.agents = agents;
        Ok(())
    }

    /// Stop every loop, wait for them to exit and mark the agents stopped.
    pub async fn stop(&mut self) -> Result<()> {
        self.registry.stop_all();
        self.registry.join_all().await;
        for agent in &self.agents {
            if let Err(e) = self
                .store
                .set_agent_status(agent.id, AgentStatus::Stopped)
                .await
            {
                error!(agent = %agent.name, error = %e, "failed to mark agent stopped");
            }
        }
        info!(agents = self.agents.len(), "daemon stopped");
        self.agents.clear();
        Ok(())
    }

    /// Start, block until the shutdown handle is stopped, then stop.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        self.shutdown.stopped().await;
        info!("shutdown requested");
        self.stop().await
    }

    fn spawn_loop(&mut self, agent: Agent) {
        let orch = &self.config.orchestrator;
        let workspace = orch.workspace_dir.as_ref().map(PathBuf::from);
        let prompts = PromptSettings::from(orch);
        let llm_config = LlmConfig::from_settings(&self.config.llm, agent.model.clone());
        let kind = loop_kind(&agent);
        let name = loop_name(kind, &agent);

        let spawned = match kind {
            LoopKind::Controller => {
                let models = self.config.models.clone();
                let controller = Controller::new(agent, self.store.clone(), models)
                    .with_staleness_window(Duration::from_secs(orch.staleness_window_secs))
                    .with_interval(self.intervals.controller);
                self.registry
                    .spawn(name.clone(), kind, move |flag| controller.run(flag))
            }
            LoopKind::Worker => {
                let worker = WorkerLoop::new(agent, self.store.clone(), self.llm.clone())
                    .with_llm_config(llm_config)
                    .with_prompt_settings(prompts)
                    .with_workspace(workspace)
                    .with_interval(self.intervals.worker);
                self.registry
                    .spawn(name.clone(), kind, move |flag| worker.run(flag))
            }
            LoopKind::Generic => {
                let generic = GenericAgentLoop::new(agent, self.store.clone(), self.llm.clone())
                    .with_llm_config(llm_config)
                    .with_prompt_settings(prompts)
                    .with_workspace(workspace)
                    .with_interval(self.intervals.generic)
                    .with_max_turns(orch.generic_max_turns);
                self.registry
                    .spawn(name.clone(), kind, move |flag| generic.run(flag))
            }
        };
        if let Err(e) = spawned {
            warn!(name = %name, error = %e, "loop not spawned");
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn agent_from_spec(spec: &AgentSpec) -> Agent {
    Agent::new(spec.name.clone(), spec.role, spec.agent_type, spec.model.clone())
        .with_skills(spec.skills.iter().cloned())
        .with_max_workload(spec.max_workload)
}

/// Pipeline roles on worker agents get the phase worker loop; everything
/// else that is not a controller self-selects work.
pub fn loop_kind(agent: &Agent) -> LoopKind {
    match (agent.agent_type, agent.role) {
        (AgentType::Controller, _) => LoopKind::Controller,
        (
            AgentType::Worker,
            AgentRole::Designer | AgentRole::Developer | AgentRole::Tester | AgentRole::Reviewer,
        ) => LoopKind::Worker,
        _ => LoopKind::Generic,
    }
}

pub fn loop_name(kind: LoopKind, agent: &Agent) -> String {
    let prefix = match kind {
        LoopKind::Controller => "controller",
        LoopKind::Worker => "worker",
        LoopKind::Generic => "generic",
    };
    format!("{prefix}:{}", agent.name)
}
