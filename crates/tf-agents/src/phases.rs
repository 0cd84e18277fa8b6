//! The fixed phase template a project is decomposed into, and the
//! role-to-role pipeline that spawns follow-up work when a worker finishes.
//!
//! Dependency edges are declared between stable [`PhaseKey`]s rather than
//! display titles. Building the template is two-pass: every node gets its id
//! first, then edges are resolved through the key → id map.

use std::collections::HashMap;

use tf_core::types::{AgentRole, Task, TaskType};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Phase template
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseKey {
    RequirementsAnalysis,
    ArchitectureDesign,
    UiUxDesign,
    DatabaseSchemaDesign,
    ApiDesign,
    TestPlanDesign,
    BackendImplementation,
    FrontendImplementation,
    IntegrationImplementation,
    UnitTesting,
    IntegrationTesting,
    UserAcceptanceTesting,
    TechnicalDocumentation,
    UserDocumentation,
    DeploymentPlanning,
}

impl PhaseKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKey::RequirementsAnalysis => "requirements_analysis",
            PhaseKey::ArchitectureDesign => "architecture_design",
            PhaseKey::UiUxDesign => "ui_ux_design",
            PhaseKey::DatabaseSchemaDesign => "database_schema_design",
            PhaseKey::ApiDesign => "api_design",
            PhaseKey::TestPlanDesign => "test_plan_design",
            PhaseKey::BackendImplementation => "backend_implementation",
            PhaseKey::FrontendImplementation => "frontend_implementation",
            PhaseKey::IntegrationImplementation => "integration_implementation",
            PhaseKey::UnitTesting => "unit_testing",
            PhaseKey::IntegrationTesting => "integration_testing",
            PhaseKey::UserAcceptanceTesting => "user_acceptance_testing",
            PhaseKey::TechnicalDocumentation => "technical_documentation",
            PhaseKey::UserDocumentation => "user_documentation",
            PhaseKey::DeploymentPlanning => "deployment_planning",
        }
    }
}

/// One node of the decomposition template.
#[derive(Debug, Clone, Copy)]
pub struct PhaseNode {
    pub key: PhaseKey,
    pub title: &'static str,
    pub task_type: TaskType,
    pub skills: &'static [&'static str],
    /// Informational only; never read by scheduling.
    pub estimated_effort: &'static str,
    pub depends_on: &'static [PhaseKey],
}

use PhaseKey::*;

/// Ordered so that every node appears after all of its dependencies.
pub const PHASE_TEMPLATE: &[PhaseNode] = &[
    PhaseNode {
        key: RequirementsAnalysis,
        title: "Requirements Analysis",
        task_type: TaskType::Design,
        skills: &["requirements", "analysis"],
        estimated_effort: "medium",
        depends_on: &[],
    },
    PhaseNode {
        key: ArchitectureDesign,
        title: "Architecture Design",
        task_type: TaskType::Design,
        skills: &["architecture", "design"],
        estimated_effort: "high",
        depends_on: &[RequirementsAnalysis],
    },
    PhaseNode {
        key: UiUxDesign,
        title: "UI/UX Design",
        task_type: TaskType::Design,
        skills: &["ui", "ux", "design"],
        estimated_effort: "medium",
        depends_on: &[RequirementsAnalysis],
    },
    PhaseNode {
        key: DatabaseSchemaDesign,
        title: "Database Schema Design",
        task_type: TaskType::Design,
        skills: &["database", "design"],
        estimated_effort: "medium",
        depends_on: &[ArchitectureDesign],
    },
    PhaseNode {
        key: ApiDesign,
        title: "API Design",
        task_type: TaskType::Design,
        skills: &["api", "design"],
        estimated_effort: "medium",
        depends_on: &[ArchitectureDesign],
    },
    PhaseNode {
        key: TestPlanDesign,
        title: "Test Plan Design",
        task_type: TaskType::Design,
        skills: &["testing", "test_planning"],
        estimated_effort: "medium",
        depends_on: &[DatabaseSchemaDesign, ApiDesign, UiUxDesign],
    },
    PhaseNode {
        key: BackendImplementation,
        title: "Backend Implementation",
        task_type: TaskType::Development,
        skills: &["coding", "backend"],
        estimated_effort: "high",
        depends_on: &[DatabaseSchemaDesign, ApiDesign],
    },
    PhaseNode {
        key: FrontendImplementation,
        title: "Frontend Implementation",
        task_type: TaskType::Development,
        skills: &["coding", "frontend"],
        estimated_effort: "high",
        depends_on: &[UiUxDesign, ApiDesign],
    },
    PhaseNode {
        key: IntegrationImplementation,
        title: "Integration Implementation",
        task_type: TaskType::Development,
        skills: &["coding", "integration"],
        estimated_effort: "medium",
        depends_on: &[BackendImplementation, FrontendImplementation],
    },
    PhaseNode {
        key: UnitTesting,
        title: "Unit Testing",
        task_type: TaskType::Testing,
        skills: &["testing", "qa"],
        estimated_effort: "medium",
        depends_on: &[BackendImplementation, FrontendImplementation, TestPlanDesign],
    },
    PhaseNode {
        key: IntegrationTesting,
        title: "Integration Testing",
        task_type: TaskType::Testing,
        skills: &["testing", "qa", "integration"],
        estimated_effort: "medium",
        depends_on: &[IntegrationImplementation, TestPlanDesign],
    },
    PhaseNode {
        key: UserAcceptanceTesting,
        title: "User Acceptance Testing",
        task_type: TaskType::Testing,
        skills: &["testing", "qa"],
        estimated_effort: "medium",
        depends_on: &[UnitTesting, IntegrationTesting],
    },
    PhaseNode {
        key: TechnicalDocumentation,
        title: "Technical Documentation",
        task_type: TaskType::Documentation,
        skills: &["documentation", "writing"],
        estimated_effort: "low",
        depends_on: &[UserAcceptanceTesting],
    },
    PhaseNode {
        key: UserDocumentation,
        title: "User Documentation",
        task_type: TaskType::Documentation,
        skills: &["documentation", "writing"],
        estimated_effort: "low",
        depends_on: &[UserAcceptanceTesting],
    },
    PhaseNode {
        key: DeploymentPlanning,
        title: "Deployment Planning",
        task_type: TaskType::Deployment,
        skills: &["deployment", "devops"],
        estimated_effort: "medium",
        depends_on: &[TechnicalDocumentation, UserDocumentation],
    },
];

/// Materialise [`PHASE_TEMPLATE`] as tasks scoped to `project`.
///
/// The returned tasks are in template order, which is a valid insertion
/// order (dependencies first). Priority is inherited from the project.
pub fn build_phase_tasks(project: &Task) -> Vec<Task> {
    // Pass 1: allocate ids.
    let ids: HashMap<PhaseKey, Uuid> = PHASE_TEMPLATE
        .iter()
        .map(|node| (node.key, Uuid::new_v4()))
        .collect();

    // Pass 2: resolve edges through the key map.
    PHASE_TEMPLATE
        .iter()
        .map(|node| {
            let dependencies = node
                .depends_on
                .iter()
                .filter_map(|dep| ids.get(dep).copied())
                .collect();
            let mut task = Task::new(
                node.title,
                format!(
                    "{} for project '{}'.\n\n{}",
                    node.title, project.title, project.description
                ),
            )
            .with_type(node.task_type)
            .with_skills(node.skills.iter().copied())
            .with_priority(project.priority)
            .with_dependencies(dependencies)
            .in_project(project.id)
            .with_metadata(serde_json::json!({
                "phase": node.key.as_str(),
                "estimated_effort": node.estimated_effort,
            }));
            if let Some(id) = ids.get(&node.key) {
                task.id = *id;
            }
            task
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Phase pipeline
// ---------------------------------------------------------------------------

/// What a finished worker hands off to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStep {
    pub task_type: TaskType,
    pub skills: &'static [&'static str],
    pub title_prefix: &'static str,
    pub instruction: &'static str,
}

/// `Designer → Development → Testing → Review → (end)`.
pub fn next_step(role: AgentRole) -> Option<PipelineStep> {
    match role {
        AgentRole::Designer => Some(PipelineStep {
            task_type: TaskType::Development,
            skills: &["coding"],
            title_prefix: "Implement",
            instruction: "Implement the design below.",
        }),
        AgentRole::Developer => Some(PipelineStep {
            task_type: TaskType::Testing,
            skills: &["testing", "qa"],
            title_prefix: "Test",
            instruction: "Test the implementation below.",
        }),
        AgentRole::Tester => Some(PipelineStep {
            task_type: TaskType::Review,
            skills: &["review", "code_quality"],
            title_prefix: "Review",
            instruction: "Review the implementation and test results below.",
        }),
        AgentRole::Reviewer | AgentRole::Controller | AgentRole::Generalist => None,
    }
}

/// Metadata key that ties a spawned task to its source.
pub const SPAWNED_FROM: &str = "spawned_from";

/// Build the follow-up task for `source` completed by an agent in `role`.
/// The follow-up depends on its source and embeds the source's result.
pub fn follow_up_task(source: &Task, role: AgentRole) -> Option<Task> {
    let step = next_step(role)?;
    let result = source.result.as_deref().unwrap_or_default();
    let description = format!(
        "{}\n\nSource task: {}\n\nPrevious phase result:\n{}",
        step.instruction, source.title, result
    );

    let mut task = Task::new(format!("{}: {}", step.title_prefix, source.title), description)
        .with_type(step.task_type)
        .with_skills(step.skills.iter().copied())
        .with_priority(source.priority)
        .with_dependencies(vec![source.id])
        .with_metadata(serde_json::json!({
            SPAWNED_FROM: source.id.to_string(),
            "phase": step.task_type.as_str(),
        }));
    if let Some(project_id) = source.project_id {
        task = task.in_project(project_id);
    }
    Some(task)
}

/// Whether `task` was spawned as the follow-up of `source_id`.
pub fn is_follow_up_of(task: &Task, source_id: Uuid) -> bool {
    task.metadata
        .as_ref()
        .and_then(|m| m.get(SPAWNED_FROM))
        .and_then(|v| v.as_str())
        .is_some_and(|s| s == source_id.to_string())
}
