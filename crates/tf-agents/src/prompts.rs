//! Prompt templates for the worker roles and the generic agent.
//!
//! Templates are plain text with `{variable}` placeholders expanded at
//! runtime: `{title}`, `{description}`, `{context}`, `{agent}`, `{skills}`.
//! Each worker role asks for a different set of output sections; the
//! summary heading it asks for is what [`crate::artifacts::summarize`] later
//! looks for.

use std::collections::HashMap;
use std::fmt::Write as _;

use tf_core::config::OrchestratorConfig;
use tf_core::types::{Agent, AgentRole};

use crate::context::{TaskContext, TaskSummary};

/// Cap on each context-entry value embedded in a prompt.
pub const CONTEXT_VALUE_LIMIT: usize = 2000;
/// Cap on each related-task result embedded in a prompt.
pub const RELATED_RESULT_LIMIT: usize = 1000;

// ---------------------------------------------------------------------------
// Modes and settings
// ---------------------------------------------------------------------------

/// `Start` embeds a short update window, `Continue` a longer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    Start,
    Continue,
}

#[derive(Debug, Clone, Copy)]
pub struct PromptSettings {
    pub start_updates: usize,
    pub continue_updates: usize,
    pub truncate_chars: usize,
}

impl PromptSettings {
    pub fn window(&self, mode: PromptMode) -> usize {
        match mode {
            PromptMode::Start => self.start_updates,
            PromptMode::Continue => self.continue_updates,
        }
    }
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for PromptSettings {
    fn from(cfg: &OrchestratorConfig) -> Self {
        Self {
            start_updates: cfg.start_update_window,
            continue_updates: cfg.continue_update_window,
            truncate_chars: cfg.update_truncate_chars,
        }
    }
}

/// Char-boundary-safe truncation with a trailing ellipsis.
pub fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

// ---------------------------------------------------------------------------
// PromptTemplate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub system: &'static str,
    pub template: &'static str,
}

impl PromptTemplate {
    /// Expand `{key}` placeholders in one left-to-right pass over the
    /// template. Substituted values are never scanned again, and unknown
    /// placeholders are left as-is.
    pub fn render(&self, vars: &HashMap<&str, String>) -> String {
        let mut output = String::with_capacity(self.template.len());
        let mut rest = self.template;
        while let Some(open) = rest.find('{') {
            output.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let value = after
                .find('}')
                .and_then(|close| vars.get(&after[..close]).map(|v| (close, v)));
            match value {
                Some((close, value)) => {
                    output.push_str(value);
                    rest = &after[close + 1..];
                }
                None => {
                    output.push('{');
                    rest = after;
                }
            }
        }
        output.push_str(rest);
        output
    }
}

const DESIGNER_SYSTEM: &str = "You are a senior software architect. You turn requirements \
into clear, buildable designs and you state trade-offs explicitly.";

const DESIGNER_TEMPLATE: &str = "\
# Design task: {title}

{description}

{context}

Produce the design with these sections:

## Architecture Overview
A short summary of the chosen architecture.

## Components
Each component, its responsibility and its interfaces.

## Data Model
Entities and relationships. Use fenced code blocks for schemas.

## API Design
Endpoints or module interfaces. Use fenced code blocks for definitions.

## Implementation Notes
Constraints and risks the developer needs to know.
";

const DEVELOPER_SYSTEM: &str = "You are an experienced software engineer. You write \
complete, working code and explain how to run it.";

const DEVELOPER_TEMPLATE: &str = "\
# Development task: {title}

{description}

{context}

Respond with these sections:

## Implementation Summary
What you built and how it fits the design.

## Code
Every file as a fenced code block tagged with its language.

## Setup Instructions
How to build and run the code.
";

const TESTER_SYSTEM: &str = "You are a meticulous QA engineer. You design tests that find \
real defects and report them precisely.";

const TESTER_TEMPLATE: &str = "\
# Testing task: {title}

{description}

{context}

Respond with these sections:

## Test Summary
Overall assessment and pass/fail status.

## Test Cases
Each case with inputs and expected results.

## Test Code
Automated tests as fenced code blocks tagged with their language.

## Issues Found
Defects with severity and reproduction steps.
";

const REVIEWER_SYSTEM: &str = "You are a principal engineer doing a final review. You are \
direct about problems and concrete about fixes.";

const REVIEWER_TEMPLATE: &str = "\
# Review task: {title}

{description}

{context}

Respond with these sections:

## Review Summary
Overall verdict in a few sentences.

## Strengths
What is done well.

## Issues
Problems ordered by severity.

## Recommendations
Concrete follow-up changes.
";

const GENERAL_SYSTEM: &str = "You are a capable generalist engineer working as part of a \
team of agents.";

const GENERAL_TEMPLATE: &str = "\
# Task: {title}

{description}

{context}

Complete the task and report the result.
";

const GENERIC_SYSTEM: &str = "You are {agent}, an autonomous agent in a team of agents. \
Your skills: {skills}.

Work on the task you are given. End every reply with exactly one JSON directive \
in a ```json fenced block, chosen from:

{\"action\": \"complete\", \"result\": \"<final result>\"}
{\"action\": \"delegate\", \"agent\": \"<agent name or role>\", \"title\": \"<subtask title>\", \"description\": \"<subtask description>\"}
{\"action\": \"context\", \"key\": \"<note name>\", \"value\": \"<note text>\"}

Use `delegate` to hand part of the work to another agent; you will be \
resumed when the subtask is done. Use `context` to save an intermediate \
note and continue on your next turn. Use `complete` when the task is done.";

const GENERIC_TEMPLATE: &str = "\
# Task: {title}

{description}

{context}

{instruction}
";

/// The built-in template for a worker role.
pub fn template_for(role: AgentRole) -> PromptTemplate {
    match role {
        AgentRole::Designer => PromptTemplate {
            system: DESIGNER_SYSTEM,
            template: DESIGNER_TEMPLATE,
        },
        AgentRole::Developer => PromptTemplate {
            system: DEVELOPER_SYSTEM,
            template: DEVELOPER_TEMPLATE,
        },
        AgentRole::Tester => PromptTemplate {
            system: TESTER_SYSTEM,
            template: TESTER_TEMPLATE,
        },
        AgentRole::Reviewer => PromptTemplate {
            system: REVIEWER_SYSTEM,
            template: REVIEWER_TEMPLATE,
        },
        AgentRole::Controller | AgentRole::Generalist => PromptTemplate {
            system: GENERAL_SYSTEM,
            template: GENERAL_TEMPLATE,
        },
    }
}

// ---------------------------------------------------------------------------
// Context rendering
// ---------------------------------------------------------------------------

fn render_related(out: &mut String, heading: &str, items: &[TaskSummary]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out, "## {heading}");
    for item in items {
        let _ = write!(out, "- {} [{}", item.title, item.status);
        if let Some(t) = item.task_type {
            let _ = write!(out, ", {t}");
        }
        let _ = writeln!(out, ", {}%]", item.progress);
        if let Some(result) = item.result.as_deref().filter(|r| !r.is_empty()) {
            let _ = writeln!(out, "  Result: {}", truncate(result, RELATED_RESULT_LIMIT));
        }
    }
    out.push('\n');
}

/// One line per sibling, no results.
fn render_siblings(out: &mut String, siblings: &[TaskSummary]) {
    if siblings.is_empty() {
        return;
    }
    out.push_str("## Other Project Tasks\n");
    for sibling in siblings {
        let _ = writeln!(out, "- {} [{}]", sibling.title, sibling.status);
    }
    out.push('\n');
}

/// Render the context block embedded in every prompt.
pub fn render_context(ctx: &TaskContext, mode: PromptMode, settings: &PromptSettings) -> String {
    let mut out = String::new();

    if let Some(parent) = &ctx.parent {
        render_related(&mut out, "Parent", std::slice::from_ref(parent));
    }
    render_related(&mut out, "Prerequisites", &ctx.dependencies);
    render_related(&mut out, "Subtasks", &ctx.subtasks);
    render_siblings(&mut out, &ctx.siblings);

    if !ctx.entries.is_empty() {
        out.push_str("## Notes\n");
        for (key, value) in &ctx.entries {
            let _ = writeln!(out, "### {key}\n{}", truncate(value, CONTEXT_VALUE_LIMIT));
        }
        out.push('\n');
    }

    let recent = ctx.recent_updates(settings.window(mode));
    if !recent.is_empty() {
        out.push_str("## Recent Activity\n");
        for update in recent {
            let _ = writeln!(
                out,
                "- [{}] {}",
                update.created_at.format("%Y-%m-%d %H:%M"),
                truncate(&update.content, settings.truncate_chars)
            );
        }
    }

    out.trim_end().to_string()
}

/// `(system, user)` prompts for a worker role.
pub fn worker_prompt(
    role: AgentRole,
    ctx: &TaskContext,
    settings: &PromptSettings,
) -> (String, String) {
    let template = template_for(role);
    let mut vars = HashMap::new();
    vars.insert("title", ctx.task.title.clone());
    vars.insert("description", ctx.task.description.clone());
    vars.insert("context", render_context(ctx, PromptMode::Start, settings));
    (template.system.to_string(), template.render(&vars))
}

/// `(system, user)` prompts for the generic agent loop.
pub fn generic_prompt(
    agent: &Agent,
    ctx: &TaskContext,
    mode: PromptMode,
    settings: &PromptSettings,
) -> (String, String) {
    let skills = if agent.skills.is_empty() {
        "general".to_string()
    } else {
        agent.skills.iter().cloned().collect::<Vec<_>>().join(", ")
    };
    let system = PromptTemplate {
        system: "",
        template: GENERIC_SYSTEM,
    };
    let mut system_vars = HashMap::new();
    system_vars.insert("agent", agent.name.clone());
    system_vars.insert("skills", skills);

    let instruction = match mode {
        PromptMode::Start => "Start working on this task.",
        PromptMode::Continue => {
            "Continue working on this task from where you left off, using the \
             subtask results and notes above."
        }
    };
    let user = PromptTemplate {
        system: "",
        template: GENERIC_TEMPLATE,
    };
    let mut vars = HashMap::new();
    vars.insert("title", ctx.task.title.clone());
    vars.insert("description", ctx.task.description.clone());
    vars.insert("context", render_context(ctx, mode, settings));
    vars.insert("instruction", instruction.to_string());

    (system.render(&system_vars), user.render(&vars))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tf_core::types::{AgentType, Task, TaskUpdate};

    fn ctx_with_updates(n: usize) -> TaskContext {
        let task = Task::new("Build API", "REST endpoints");
        let updates = (0..n)
            .map(|i| TaskUpdate::info(task.id, None, format!("update-{i:02}")))
            .collect();
        TaskContext {
            task,
            entries: BTreeMap::new(),
            updates,
            parent: None,
            subtasks: Vec::new(),
            dependencies: Vec::new(),
            siblings: Vec::new(),
        }
    }

    #[test]
    fn truncate_is_char_safe() {
        assert_eq!(truncate("héllo wörld", 5), "héllo...");
        assert_eq!(truncate("short", 10), "short");
    }

    #[test]
    fn start_and_continue_windows() {
        let ctx = ctx_with_updates(12);
        let settings = PromptSettings::default();

        let start = render_context(&ctx, PromptMode::Start, &settings);
        assert!(start.contains("update-11"));
        assert!(start.contains("update-07"));
        assert!(!start.contains("update-06"));

        let cont = render_context(&ctx, PromptMode::Continue, &settings);
        assert!(cont.contains("update-02"));
        assert!(!cont.contains("update-01"));
    }

    #[test]
    fn siblings_render_one_line_each() {
        let mut ctx = ctx_with_updates(0);
        let mut sibling = Task::new("Write docs", "");
        sibling.result = Some("long result text".into());
        ctx.siblings.push(TaskSummary::from(&sibling));
        let out = render_context(&ctx, PromptMode::Start, &PromptSettings::default());
        assert!(out.contains("## Other Project Tasks\n- Write docs [pending]"));
        assert!(!out.contains("long result text"));
    }

    #[test]
    fn long_updates_are_truncated() {
        let mut ctx = ctx_with_updates(0);
        ctx.updates
            .push(TaskUpdate::info(ctx.task.id, None, "x".repeat(1000)));
        let settings = PromptSettings {
            truncate_chars: 20,
            ..PromptSettings::default()
        };
        let out = render_context(&ctx, PromptMode::Start, &settings);
        assert!(out.contains(&format!("{}...", "x".repeat(20))));
        assert!(!out.contains(&"x".repeat(21)));
    }

    #[test]
    fn role_templates_ask_for_summary_heading() {
        let ctx = ctx_with_updates(0);
        let settings = PromptSettings::default();
        let (_, designer) = worker_prompt(AgentRole::Designer, &ctx, &settings);
        assert!(designer.contains("## Architecture Overview"));
        assert!(designer.contains("Build API"));
        let (_, tester) = worker_prompt(AgentRole::Tester, &ctx, &settings);
        assert!(tester.contains("## Test Summary"));
        assert!(!tester.contains("{context}"));
    }

    #[test]
    fn braces_in_task_text_survive_rendering() {
        let mut ctx = ctx_with_updates(0);
        ctx.task.description = r#"print(f"{title}") and {context}"#.to_string();
        let settings = PromptSettings::default();
        for role in [AgentRole::Designer, AgentRole::Developer] {
            let (_, prompt) = worker_prompt(role, &ctx, &settings);
            assert!(prompt.contains(r#"print(f"{title}") and {context}"#), "{role:?}");
        }

        let template = PromptTemplate {
            system: "",
            template: "{a} {missing} {b",
        };
        let vars = HashMap::from([("a", "{b}".to_string()), ("b", "x".to_string())]);
        assert_eq!(template.render(&vars), "{b} {missing} {b");
    }

    #[test]
    fn generic_prompt_lists_directives() {
        let ctx = ctx_with_updates(0);
        let agent = Agent::new("helper", AgentRole::Generalist, AgentType::Standard, "m")
            .with_skills(["writing"]);
        let (system, user) =
            generic_prompt(&agent, &ctx, PromptMode::Continue, &PromptSettings::default());
        assert!(system.contains("helper"));
        assert!(system.contains("writing"));
        assert!(system.contains("\"action\": \"delegate\""));
        assert!(user.contains("Continue working"));
    }
}
