use tf_core::types::*;
use uuid::Uuid;

#[test]
fn task_defaults() {
    let task = Task::new("Write parser", "tokenize and parse");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.progress, 0);
    assert!(task.assigned_to.is_none());
    assert!(task.dependencies.is_empty());
    assert!(task.completed_at.is_none());
    assert!(!task.is_project());
}

#[test]
fn task_builders() {
    let project = Uuid::new_v4();
    let dep = Uuid::new_v4();
    let task = Task::new("Backend", "")
        .with_type(TaskType::Development)
        .with_skills(["coding", "backend"])
        .with_priority(7)
        .with_dependencies(vec![dep])
        .in_project(project);

    assert_eq!(task.task_type, Some(TaskType::Development));
    assert!(task.required_skills.contains("backend"));
    assert_eq!(task.priority, 7);
    assert_eq!(task.dependencies, vec![dep]);
    assert_eq!(task.project_id, Some(project));
}

#[test]
fn status_transitions() {
    use TaskStatus::*;
    assert!(Pending.can_transition_to(&InProgress));
    assert!(Unassigned.can_transition_to(&InProgress));
    assert!(InProgress.can_transition_to(&Completed));
    assert!(InProgress.can_transition_to(&Failed));
    assert!(InProgress.can_transition_to(&Pending));
    assert!(Completed.can_transition_to(&Archived));
    assert!(Failed.can_transition_to(&Pending));

    assert!(!Completed.can_transition_to(&InProgress));
    assert!(!Archived.can_transition_to(&Pending));
    assert!(!Pending.can_transition_to(&Completed));
    assert!(!Failed.can_transition_to(&Completed));
}

#[test]
fn done_and_claimable() {
    assert!(TaskStatus::Completed.is_done());
    assert!(TaskStatus::Archived.is_done());
    assert!(!TaskStatus::Failed.is_done());
    assert!(TaskStatus::Pending.is_claimable());
    assert!(TaskStatus::Unassigned.is_claimable());
    assert!(!TaskStatus::InProgress.is_claimable());
}

#[test]
fn status_serializes_snake_case() {
    let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
    assert_eq!(json, "\"in_progress\"");
    assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
    assert_eq!(TaskType::Documentation.to_string(), "documentation");
}

#[test]
fn agent_capacity() {
    let mut agent = Agent::new("dev", AgentRole::Developer, AgentType::Worker, "m")
        .with_max_workload(2);
    assert!(agent.has_capacity());
    agent.current_workload = 2;
    assert!(!agent.has_capacity());
}

#[test]
fn snapshot_finished_requires_children() {
    let empty = ProjectSnapshot::default();
    assert!(!empty.is_finished());

    let done = ProjectSnapshot {
        total: 3,
        completed: 1,
        archived: 2,
        ..ProjectSnapshot::default()
    };
    assert!(done.is_finished());

    let failed = ProjectSnapshot {
        total: 2,
        completed: 1,
        failed: 1,
        ..ProjectSnapshot::default()
    };
    assert!(!failed.is_finished());
}

#[test]
fn update_levels() {
    let task = Uuid::new_v4();
    assert_eq!(TaskUpdate::info(task, None, "x").level, UpdateLevel::Info);
    assert_eq!(TaskUpdate::warning(task, None, "x").level, UpdateLevel::Warning);
    assert_eq!(TaskUpdate::error(task, None, "x").level, UpdateLevel::Error);
}
