use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{AgentRole, AgentType, TaskType};

/// Top-level configuration loaded from `~/.taskforge/config.toml`.
///
/// **Security**: this struct never stores API keys. The completion service
/// credential is read at runtime from the environment variable named by
/// [`LlmSettings::api_key_env`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            store: StoreConfig::default(),
            llm: LlmSettings::default(),
            orchestrator: OrchestratorConfig::default(),
            models: ModelsConfig::default(),
            agents: default_agents(),
        }
    }
}

impl Config {
    /// Load config from `~/.taskforge/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.orchestrator.validate()?;
        for agent in &self.agents {
            if agent.max_workload == 0 {
                return Err(ConfigError::Validation(format!(
                    "agents.{}.max_workload must be greater than zero",
                    agent.name
                )));
            }
            if agent.name.trim().is_empty() {
                return Err(ConfigError::Validation("agents.name must not be empty".into()));
            }
        }
        if !self.agents.is_empty()
            && !self
                .agents
                .iter()
                .any(|a| a.agent_type == AgentType::Controller)
        {
            return Err(ConfigError::Validation(
                "agents must declare at least one controller".into(),
            ));
        }
        match self.general.log_format.as_str() {
            "pretty" | "json" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "general.log_format must be `pretty` or `json`, got `{other}`"
            ))),
        }
    }

    /// Expand a leading `~/` in the store path against `home`.
    pub fn expand_store_path(&mut self, home: &str) {
        if self.store.path.starts_with("~/") {
            self.store.path = self.store.path.replacen('~', home, 1);
        }
    }

    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taskforge")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_project_name() -> String {
    "taskforge".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "~/.taskforge/tasks.db".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProviderKind {
    Anthropic,
    Openai,
    /// OpenAI-compatible local inference server.
    Local,
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_provider")]
    pub provider: LlmProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Transport-level timeout; expiry surfaces as a task failure.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: None,
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

fn default_provider() -> LlmProviderKind {
    LlmProviderKind::Anthropic
}
fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_temperature() -> f32 {
    0.7
}
fn default_llm_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_controller_interval")]
    pub controller_interval_secs: u64,
    #[serde(default = "default_worker_interval")]
    pub worker_interval_secs: u64,
    #[serde(default = "default_worker_interval")]
    pub generic_interval_secs: u64,
    /// An in-progress task with no activity for this long is stalled.
    #[serde(default = "default_staleness_window")]
    pub staleness_window_secs: u64,
    /// Updates embedded in a "start" prompt.
    #[serde(default = "default_start_updates")]
    pub start_update_window: usize,
    /// Updates embedded in a "continue" prompt.
    #[serde(default = "default_continue_updates")]
    pub continue_update_window: usize,
    #[serde(default = "default_update_truncate")]
    pub update_truncate_chars: usize,
    #[serde(default = "default_generic_max_turns")]
    pub generic_max_turns: u32,
    /// When set, extracted artifacts are also written below this directory.
    #[serde(default)]
    pub workspace_dir: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            controller_interval_secs: default_controller_interval(),
            worker_interval_secs: default_worker_interval(),
            generic_interval_secs: default_worker_interval(),
            staleness_window_secs: default_staleness_window(),
            start_update_window: default_start_updates(),
            continue_update_window: default_continue_updates(),
            update_truncate_chars: default_update_truncate(),
            generic_max_turns: default_generic_max_turns(),
            workspace_dir: None,
        }
    }
}

impl OrchestratorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("controller_interval_secs", self.controller_interval_secs),
            ("worker_interval_secs", self.worker_interval_secs),
            ("generic_interval_secs", self.generic_interval_secs),
            ("staleness_window_secs", self.staleness_window_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "orchestrator.{name} must be greater than zero"
                )));
            }
        }
        if self.generic_max_turns == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.generic_max_turns must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_controller_interval() -> u64 {
    30
}
fn default_worker_interval() -> u64 {
    10
}
fn default_staleness_window() -> u64 {
    3600
}
fn default_start_updates() -> usize {
    5
}
fn default_continue_updates() -> usize {
    10
}
fn default_update_truncate() -> usize {
    300
}
fn default_generic_max_turns() -> u32 {
    10
}

/// The `task_type -> required_model` table consumed by assignment.
/// A `None` entry means any model may take the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default = "default_reasoning_model")]
    pub design: Option<String>,
    #[serde(default = "default_code_model")]
    pub development: Option<String>,
    #[serde(default = "default_code_model")]
    pub testing: Option<String>,
    #[serde(default = "default_reasoning_model")]
    pub review: Option<String>,
    #[serde(default)]
    pub documentation: Option<String>,
    #[serde(default)]
    pub deployment: Option<String>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            project: None,
            design: default_reasoning_model(),
            development: default_code_model(),
            testing: default_code_model(),
            review: default_reasoning_model(),
            documentation: None,
            deployment: None,
        }
    }
}

impl ModelsConfig {
    pub fn required_model(&self, task_type: TaskType) -> Option<&str> {
        let entry = match task_type {
            TaskType::Project => &self.project,
            TaskType::Design => &self.design,
            TaskType::Development => &self.development,
            TaskType::Testing => &self.testing,
            TaskType::Review => &self.review,
            TaskType::Documentation => &self.documentation,
            TaskType::Deployment => &self.deployment,
        };
        entry.as_deref()
    }
}

pub const DEFAULT_REASONING_MODEL: &str = "claude-opus-4-20250514";
pub const DEFAULT_CODE_MODEL: &str = "claude-sonnet-4-20250514";

fn default_reasoning_model() -> Option<String> {
    Some(DEFAULT_REASONING_MODEL.into())
}
fn default_code_model() -> Option<String> {
    Some(DEFAULT_CODE_MODEL.into())
}

/// An agent declared in config and registered (idempotently) at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub role: AgentRole,
    pub agent_type: AgentType,
    #[serde(default)]
    pub skills: Vec<String>,
    pub model: String,
    #[serde(default = "default_max_workload")]
    pub max_workload: u32,
}

fn default_max_workload() -> u32 {
    5
}

fn spec(
    name: &str,
    role: AgentRole,
    agent_type: AgentType,
    model: &str,
    skills: &[&str],
    max_workload: u32,
) -> AgentSpec {
    AgentSpec {
        name: name.into(),
        role,
        agent_type,
        skills: skills.iter().map(|s| s.to_string()).collect(),
        model: model.into(),
        max_workload,
    }
}

fn default_agents() -> Vec<AgentSpec> {
    vec![
        spec(
            "controller",
            AgentRole::Controller,
            AgentType::Controller,
            DEFAULT_REASONING_MODEL,
            &[],
            100,
        ),
        spec(
            "designer",
            AgentRole::Designer,
            AgentType::Worker,
            DEFAULT_REASONING_MODEL,
            &["requirements", "architecture", "design", "ui", "ux", "database", "api"],
            5,
        ),
        spec(
            "developer",
            AgentRole::Developer,
            AgentType::Worker,
            DEFAULT_CODE_MODEL,
            &["coding", "backend", "frontend", "integration", "python"],
            5,
        ),
        spec(
            "tester",
            AgentRole::Tester,
            AgentType::Worker,
            DEFAULT_CODE_MODEL,
            &["testing", "qa", "test_planning"],
            5,
        ),
        spec(
            "reviewer",
            AgentRole::Reviewer,
            AgentType::Worker,
            DEFAULT_REASONING_MODEL,
            &["review", "code_quality", "documentation", "deployment"],
            5,
        ),
        spec(
            "generalist",
            AgentRole::Generalist,
            AgentType::Standard,
            DEFAULT_CODE_MODEL,
            &["documentation", "writing", "research"],
            3,
        ),
    ]
}
