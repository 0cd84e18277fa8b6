//! End-to-end: a project driven to completion by the controller and one
//! worker per pipeline role, cycles stepped by hand.

use std::sync::Arc;

use tf_agents::controller::Controller;
use tf_agents::worker::WorkerLoop;
use tf_core::config::ModelsConfig;
use tf_core::sqlite::SqliteStore;
use tf_core::store::{TaskFilter, TaskStore};
use tf_core::types::*;
use tf_intelligence::MockProvider;

fn models() -> ModelsConfig {
    ModelsConfig {
        project: None,
        design: Some("design-model".into()),
        development: Some("dev-model".into()),
        testing: Some("test-model".into()),
        review: Some("review-model".into()),
        documentation: Some("design-model".into()),
        deployment: Some("design-model".into()),
    }
}

#[tokio::test]
async fn project_runs_to_completion() {
    let store: Arc<dyn TaskStore> =
        Arc::new(SqliteStore::new_in_memory().await.expect("in-memory store"));
    let llm = Arc::new(MockProvider::new());

    let controller = store
        .register_agent(
            &Agent::new("controller", AgentRole::Controller, AgentType::Controller, "design-model")
                .with_max_workload(100)
                .with_status(AgentStatus::Running),
        )
        .await
        .unwrap();
    let ctl = Controller::new(controller.clone(), store.clone(), models());

    let mut workers = Vec::new();
    for (name, role, model) in [
        ("designer", AgentRole::Designer, "design-model"),
        ("developer", AgentRole::Developer, "dev-model"),
        ("tester", AgentRole::Tester, "test-model"),
        ("reviewer", AgentRole::Reviewer, "review-model"),
    ] {
        let agent = store
            .register_agent(
                &Agent::new(name, role, AgentType::Worker, model).with_status(AgentStatus::Running),
            )
            .await
            .unwrap();
        workers.push(WorkerLoop::new(agent, store.clone(), llm.clone()));
    }

    let project = ctl
        .submit_project("Shop", "an online shop", ["design"], 1)
        .await
        .unwrap();

    let mut finished = false;
    for _ in 0..100 {
        let report = ctl.run_cycle().await;
        assert!(report.failed_sweeps.is_empty(), "{report:?}");
        if report.projects_completed == 1 {
            finished = true;
            break;
        }
        for worker in &workers {
            while worker.run_cycle().await.unwrap().is_some() {}
        }
    }
    assert!(finished, "project never completed");

    let project = store.get_task(project.id).await.unwrap().unwrap();
    assert_eq!(project.status, TaskStatus::Completed);

    let children = store
        .list_tasks(&TaskFilter::new().project(project.id))
        .await
        .unwrap();
    assert!(children.len() > 15);
    assert!(children.iter().all(|t| t.status.is_done()));

    // every review follow-up was produced by a tester, and nothing follows a review
    let reviews = children
        .iter()
        .filter(|t| t.task_type == Some(TaskType::Review))
        .count();
    let tests = children
        .iter()
        .filter(|t| t.task_type == Some(TaskType::Testing))
        .count();
    assert_eq!(reviews, tests);

    for agent in store.list_agents().await.unwrap() {
        assert_eq!(agent.current_workload, 0, "{}", agent.name);
    }
}
