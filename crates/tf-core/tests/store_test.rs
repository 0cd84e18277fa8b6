use chrono::{Duration, Utc};
use tf_core::sqlite::SqliteStore;
use tf_core::store::{ClaimOutcome, StoreError, TaskFilter, TaskStore};
use tf_core::types::*;

async fn store() -> SqliteStore {
    SqliteStore::new_in_memory().await.expect("in-memory store")
}

async fn worker(store: &SqliteStore, name: &str, max: u32) -> Agent {
    let agent = Agent::new(name, AgentRole::Developer, AgentType::Worker, "m")
        .with_status(AgentStatus::Running)
        .with_max_workload(max);
    store.register_agent(&agent).await.expect("register agent")
}

#[tokio::test]
async fn task_insert_and_get() {
    let db = store().await;
    let task = Task::new("store test", "desc")
        .with_type(TaskType::Design)
        .with_skills(["design"])
        .with_metadata(serde_json::json!({"phase": "req"}));
    db.insert_task(&task).await.unwrap();

    let fetched = db.get_task(task.id).await.unwrap().expect("task should exist");
    assert_eq!(fetched.title, "store test");
    assert_eq!(fetched.task_type, Some(TaskType::Design));
    assert!(fetched.required_skills.contains("design"));
    assert_eq!(fetched.metadata.unwrap()["phase"], "req");
    assert_eq!(fetched.status, TaskStatus::Pending);
}

#[tokio::test]
async fn missing_task_is_none() {
    let db = store().await;
    assert!(db.get_task(uuid::Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn batch_insert_is_all_or_nothing() {
    let db = store().await;
    let a = Task::new("a", "");
    let b = Task::new("b", "");
    db.insert_tasks(&[a.clone(), b.clone()]).await.unwrap();
    assert_eq!(db.list_tasks(&TaskFilter::new()).await.unwrap().len(), 2);

    // duplicate primary key in the middle of the batch
    let c = Task::new("c", "");
    let err = db.insert_tasks(&[c.clone(), a.clone()]).await;
    assert!(err.is_err());
    assert!(db.get_task(c.id).await.unwrap().is_none());
}

#[tokio::test]
async fn list_orders_by_priority_then_age() {
    let db = store().await;
    let low = Task::new("low", "").with_priority(1);
    let mut old_high = Task::new("old-high", "").with_priority(5);
    old_high.created_at = Utc::now() - Duration::seconds(60);
    let new_high = Task::new("new-high", "").with_priority(5);
    for t in [&low, &new_high, &old_high] {
        db.insert_task(t).await.unwrap();
    }

    let titles: Vec<String> = db
        .list_tasks(&TaskFilter::new())
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.title)
        .collect();
    assert_eq!(titles, vec!["old-high", "new-high", "low"]);
}

#[tokio::test]
async fn list_filters_combine() {
    let db = store().await;
    let project = Task::new("p", "").with_type(TaskType::Project);
    db.insert_task(&project).await.unwrap();
    let a = Task::new("a", "").in_project(project.id).with_type(TaskType::Testing);
    let b = Task::new("b", "").in_project(project.id).with_type(TaskType::Design);
    let c = Task::new("c", "").with_type(TaskType::Testing);
    for t in [&a, &b, &c] {
        db.insert_task(t).await.unwrap();
    }

    let hits = db
        .list_tasks(&TaskFilter::new().project(project.id).task_type(TaskType::Testing))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, a.id);
}

#[tokio::test]
async fn claim_is_exclusive() {
    let db = store().await;
    let first = worker(&db, "dev-1", 5).await;
    let second = worker(&db, "dev-2", 5).await;
    let task = Task::new("t", "");
    db.insert_task(&task).await.unwrap();

    assert_eq!(db.claim_task(task.id, first.id).await.unwrap(), ClaimOutcome::Claimed);
    assert_eq!(
        db.claim_task(task.id, second.id).await.unwrap(),
        ClaimOutcome::NotClaimable
    );

    let claimed = db.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(claimed.status, TaskStatus::InProgress);
    assert_eq!(claimed.assigned_to, Some(first.id));
    assert_eq!(db.get_agent(first.id).await.unwrap().unwrap().current_workload, 1);
    assert_eq!(db.get_agent(second.id).await.unwrap().unwrap().current_workload, 0);
}

#[tokio::test]
async fn concurrent_claims_have_one_winner() {
    let db = std::sync::Arc::new(store().await);
    let task = Task::new("contested", "");
    db.insert_task(&task).await.unwrap();

    let mut agents = Vec::new();
    for i in 0..4 {
        agents.push(worker(&db, &format!("dev-{i}"), 5).await);
    }

    let mut handles = Vec::new();
    for agent in &agents {
        let db = db.clone();
        let (task_id, agent_id) = (task.id, agent.id);
        handles.push(tokio::spawn(async move { db.claim_task(task_id, agent_id).await }));
    }
    let mut winners = 0;
    for h in handles {
        if h.await.unwrap().unwrap().is_claimed() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let total: u32 = db
        .list_agents()
        .await
        .unwrap()
        .iter()
        .map(|a| a.current_workload)
        .sum();
    assert_eq!(total, 1);
}

#[tokio::test]
async fn claim_respects_dependencies() {
    let db = store().await;
    let agent = worker(&db, "dev", 5).await;
    let dep = Task::new("dep", "");
    let task = Task::new("after", "").with_dependencies(vec![dep.id]);
    db.insert_task(&dep).await.unwrap();
    db.insert_task(&task).await.unwrap();

    assert_eq!(
        db.claim_task(task.id, agent.id).await.unwrap(),
        ClaimOutcome::DependenciesUnmet
    );
    assert_eq!(db.get_agent(agent.id).await.unwrap().unwrap().current_workload, 0);

    assert!(db.claim_task(dep.id, agent.id).await.unwrap().is_claimed());
    db.finish_task(dep.id, agent.id, TaskStatus::Completed, "ok").await.unwrap();
    assert!(db.claim_task(task.id, agent.id).await.unwrap().is_claimed());
}

#[tokio::test]
async fn archived_dependency_counts_as_done() {
    let db = store().await;
    let agent = worker(&db, "dev", 5).await;
    let dep = Task::new("dep", "");
    db.insert_task(&dep).await.unwrap();
    db.claim_task(dep.id, agent.id).await.unwrap();
    db.finish_task(dep.id, agent.id, TaskStatus::Completed, "ok").await.unwrap();
    db.transition_task(dep.id, TaskStatus::Archived).await.unwrap();

    let task = Task::new("after", "").with_dependencies(vec![dep.id]);
    db.insert_task(&task).await.unwrap();
    assert!(db.claim_task(task.id, agent.id).await.unwrap().is_claimed());
}

#[tokio::test]
async fn claim_respects_capacity() {
    let db = store().await;
    let agent = worker(&db, "dev", 1).await;
    let a = Task::new("a", "");
    let b = Task::new("b", "");
    db.insert_task(&a).await.unwrap();
    db.insert_task(&b).await.unwrap();

    assert!(db.claim_task(a.id, agent.id).await.unwrap().is_claimed());
    assert_eq!(
        db.claim_task(b.id, agent.id).await.unwrap(),
        ClaimOutcome::AgentAtCapacity
    );
    let b_after = db.get_task(b.id).await.unwrap().unwrap();
    assert_eq!(b_after.status, TaskStatus::Pending);
    assert!(b_after.assigned_to.is_none());
}

#[tokio::test]
async fn finish_releases_workload() {
    let db = store().await;
    let agent = worker(&db, "dev", 5).await;
    let task = Task::new("t", "");
    db.insert_task(&task).await.unwrap();
    db.claim_task(task.id, agent.id).await.unwrap();

    let done = db
        .finish_task(task.id, agent.id, TaskStatus::Completed, "all good")
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.progress, 100);
    assert_eq!(done.result.as_deref(), Some("all good"));
    assert!(done.completed_at.is_some());
    assert_eq!(db.get_agent(agent.id).await.unwrap().unwrap().current_workload, 0);
}

#[tokio::test]
async fn failed_task_records_error() {
    let db = store().await;
    let agent = worker(&db, "dev", 5).await;
    let task = Task::new("t", "");
    db.insert_task(&task).await.unwrap();
    db.claim_task(task.id, agent.id).await.unwrap();

    let failed = db
        .finish_task(task.id, agent.id, TaskStatus::Failed, "Error: boom")
        .await
        .unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.result.as_deref(), Some("Error: boom"));
    assert!(failed.completed_at.is_none());

    db.transition_task(task.id, TaskStatus::Pending).await.unwrap();
    assert_eq!(
        db.get_task(task.id).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );
}

#[tokio::test]
async fn finish_requires_in_progress() {
    let db = store().await;
    let task = Task::new("t", "");
    db.insert_task(&task).await.unwrap();
    let err = db
        .finish_task(task.id, uuid::Uuid::new_v4(), TaskStatus::Completed, "x")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }));
}

#[tokio::test]
async fn finish_by_former_owner_is_rejected() {
    let db = store().await;
    let a = worker(&db, "a", 5).await;
    let b = worker(&db, "b", 5).await;
    let task = Task::new("t", "");
    db.insert_task(&task).await.unwrap();
    db.claim_task(task.id, a.id).await.unwrap();
    db.release_task(task.id).await.unwrap();
    db.claim_task(task.id, b.id).await.unwrap();

    let err = db
        .finish_task(task.id, a.id, TaskStatus::Completed, "from a")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotOwner { agent_id, .. } if agent_id == a.id));

    let task = db.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.assigned_to, Some(b.id));
    assert!(task.result.is_none());
    assert_eq!(db.get_agent(a.id).await.unwrap().unwrap().current_workload, 0);
    assert_eq!(db.get_agent(b.id).await.unwrap().unwrap().current_workload, 1);
}

#[tokio::test]
async fn finish_and_spawn_inserts_with_completion() {
    let db = store().await;
    let agent = worker(&db, "dev", 5).await;
    let task = Task::new("t", "");
    db.insert_task(&task).await.unwrap();
    db.claim_task(task.id, agent.id).await.unwrap();

    let next = Task::new("next", "").with_dependencies(vec![task.id]);
    db.finish_and_spawn(task.id, agent.id, TaskStatus::Completed, "ok", &[next.clone()])
        .await
        .unwrap();
    assert_eq!(
        db.get_task(next.id).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );

    // a rejected finish writes nothing
    let other = Task::new("other", "");
    let err = db
        .finish_and_spawn(task.id, agent.id, TaskStatus::Completed, "again", &[other.clone()])
        .await;
    assert!(err.is_err());
    assert!(db.get_task(other.id).await.unwrap().is_none());
}

#[tokio::test]
async fn insert_claimed_writes_nothing_at_capacity() {
    let db = store().await;
    let agent = worker(&db, "ctl", 1).await;
    let first = Task::new("first", "").with_type(TaskType::Project);
    let second = Task::new("second", "").with_type(TaskType::Project);

    assert!(db.insert_claimed(&first, agent.id).await.unwrap().is_claimed());
    let stored = db.get_task(first.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::InProgress);
    assert_eq!(stored.assigned_to, Some(agent.id));

    assert_eq!(
        db.insert_claimed(&second, agent.id).await.unwrap(),
        ClaimOutcome::AgentAtCapacity
    );
    assert!(db.get_task(second.id).await.unwrap().is_none());
    assert_eq!(db.get_agent(agent.id).await.unwrap().unwrap().current_workload, 1);
}

#[tokio::test]
async fn release_returns_owner() {
    let db = store().await;
    let agent = worker(&db, "dev", 5).await;
    let task = Task::new("t", "");
    db.insert_task(&task).await.unwrap();
    db.claim_task(task.id, agent.id).await.unwrap();
    db.set_progress(task.id, 40).await.unwrap();

    let owner = db.release_task(task.id).await.unwrap();
    assert_eq!(owner, Some(agent.id));
    let released = db.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(released.status, TaskStatus::Pending);
    assert!(released.assigned_to.is_none());
    assert_eq!(released.progress, 0);
    assert_eq!(db.get_agent(agent.id).await.unwrap().unwrap().current_workload, 0);
}

#[tokio::test]
async fn transition_rejects_workload_moves() {
    let db = store().await;
    let task = Task::new("t", "");
    db.insert_task(&task).await.unwrap();

    let err = db
        .transition_task(task.id, TaskStatus::InProgress)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }));

    let err = db
        .transition_task(task.id, TaskStatus::Archived)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }));

    db.transition_task(task.id, TaskStatus::Unassigned).await.unwrap();
    assert_eq!(
        db.get_task(task.id).await.unwrap().unwrap().status,
        TaskStatus::Unassigned
    );
}

#[tokio::test]
async fn register_agent_is_idempotent() {
    let db = store().await;
    let first = worker(&db, "dev", 5).await;
    let again = Agent::new("dev", AgentRole::Developer, AgentType::Worker, "other-model");
    let stored = db.register_agent(&again).await.unwrap();
    assert_eq!(stored.id, first.id);
    assert_eq!(stored.model, "m");
    assert_eq!(db.list_agents().await.unwrap().len(), 1);

    // same name, different type is a different agent
    let standard = Agent::new("dev", AgentRole::Generalist, AgentType::Standard, "m");
    db.register_agent(&standard).await.unwrap();
    assert_eq!(db.list_agents().await.unwrap().len(), 2);
    assert!(db.find_agent("dev", AgentType::Standard).await.unwrap().is_some());
}

#[tokio::test]
async fn agent_status_update() {
    let db = store().await;
    let agent = worker(&db, "dev", 5).await;
    db.set_agent_status(agent.id, AgentStatus::Stopped).await.unwrap();
    assert_eq!(
        db.get_agent(agent.id).await.unwrap().unwrap().status,
        AgentStatus::Stopped
    );
    let err = db
        .set_agent_status(uuid::Uuid::new_v4(), AgentStatus::Idle)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AgentNotFound(_)));
}

#[tokio::test]
async fn context_last_write_wins() {
    let db = store().await;
    let task = Task::new("t", "");
    db.insert_task(&task).await.unwrap();
    db.set_context(task.id, "design_summary", "v1").await.unwrap();
    db.set_context(task.id, "design_summary", "v2").await.unwrap();
    db.set_context(task.id, "notes", "n").await.unwrap();

    let ctx = db.get_context(task.id).await.unwrap();
    assert_eq!(ctx.len(), 2);
    assert_eq!(ctx["design_summary"], "v2");
}

#[tokio::test]
async fn updates_append_in_order_and_touch_task() {
    let db = store().await;
    let mut task = Task::new("t", "");
    task.updated_at = Utc::now() - Duration::hours(2);
    db.insert_task(&task).await.unwrap();

    db.append_update(&TaskUpdate::info(task.id, None, "first")).await.unwrap();
    db.append_update(&TaskUpdate::warning(task.id, None, "second")).await.unwrap();

    let updates = db.list_updates(task.id).await.unwrap();
    let contents: Vec<&str> = updates.iter().map(|u| u.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "second"]);
    assert_eq!(updates[1].level, UpdateLevel::Warning);

    let touched = db.get_task(task.id).await.unwrap().unwrap();
    assert!(touched.updated_at > Utc::now() - Duration::minutes(1));
}

#[tokio::test]
async fn update_for_missing_task_errors() {
    let db = store().await;
    let err = db
        .append_update(&TaskUpdate::info(uuid::Uuid::new_v4(), None, "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::TaskNotFound(_)));
}

#[tokio::test]
async fn snapshot_counts_non_project_children() {
    let db = store().await;
    let agent = worker(&db, "dev", 5).await;
    let project = Task::new("p", "").with_type(TaskType::Project);
    db.insert_task(&project).await.unwrap();
    let a = Task::new("a", "").in_project(project.id);
    let b = Task::new("b", "").in_project(project.id);
    db.insert_task(&a).await.unwrap();
    db.insert_task(&b).await.unwrap();
    db.claim_task(a.id, agent.id).await.unwrap();
    db.finish_task(a.id, agent.id, TaskStatus::Completed, "ok").await.unwrap();

    let snap = db.project_snapshot(project.id).await.unwrap();
    assert_eq!(snap.total, 2);
    assert_eq!(snap.completed, 1);
    assert_eq!(snap.pending, 1);
    assert!(!snap.is_finished());
}

#[tokio::test]
async fn file_backed_store_persists() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tasks.db");
    let task = Task::new("durable", "");
    {
        let db = SqliteStore::new(&path).await.expect("open");
        db.insert_task(&task).await.unwrap();
    }
    let db = SqliteStore::new(&path).await.expect("reopen");
    assert!(db.get_task(task.id).await.unwrap().is_some());
}
