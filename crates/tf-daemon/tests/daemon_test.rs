use std::time::Duration;

use tf_core::config::{Config, LlmProviderKind};
use tf_core::store::TaskFilter;
use tf_core::types::*;
use tf_daemon::daemon::{Daemon, DaemonIntervals};

fn config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.store.path = dir.path().join("tasks.db").display().to_string();
    config.llm.provider = LlmProviderKind::Mock;
    config
}

fn fast() -> DaemonIntervals {
    DaemonIntervals {
        controller: Duration::from_millis(20),
        worker: Duration::from_millis(20),
        generic: Duration::from_millis(20),
    }
}

#[tokio::test]
async fn start_marks_agents_running_and_stop_marks_them_stopped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut daemon = Daemon::new(config(&dir)).await.expect("daemon");
    daemon.set_intervals(fast());
    daemon.start().await.unwrap();

    let declared = daemon.config().agents.len();
    assert_eq!(daemon.agents().len(), declared);
    assert_eq!(daemon.loop_names().len(), declared);
    assert!(daemon.is_running("controller:controller"));
    assert!(daemon.is_running("worker:designer"));
    assert!(daemon.is_running("generic:generalist"));

    let store = daemon.store().clone();
    for agent in store.list_agents().await.unwrap() {
        assert_eq!(agent.status, AgentStatus::Running, "{}", agent.name);
    }

    daemon.stop().await.unwrap();
    assert!(daemon.loop_names().is_empty());
    for agent in store.list_agents().await.unwrap() {
        assert_eq!(agent.status, AgentStatus::Stopped, "{}", agent.name);
    }
}

#[tokio::test]
async fn restart_reuses_registered_agents() {
    let dir = tempfile::tempdir().expect("tempdir");

    let mut first = Daemon::new(config(&dir)).await.expect("daemon");
    first.start().await.unwrap();
    let ids: Vec<_> = first.agents().iter().map(|a| a.id).collect();
    first.stop().await.unwrap();
    drop(first);

    let mut second = Daemon::new(config(&dir)).await.expect("daemon");
    second.start().await.unwrap();
    let again: Vec<_> = second.agents().iter().map(|a| a.id).collect();
    assert_eq!(ids, again);
    assert_eq!(second.store().list_agents().await.unwrap().len(), ids.len());
    second.stop().await.unwrap();
}

#[tokio::test]
async fn running_daemon_decomposes_submitted_project() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut daemon = Daemon::new(config(&dir)).await.expect("daemon");
    daemon.set_intervals(fast());
    daemon.start().await.unwrap();

    let store = daemon.store().clone();
    let controller = store
        .find_agent("controller", AgentType::Controller)
        .await
        .unwrap()
        .expect("controller registered");
    let project = Task::new("Shop", "an online shop").with_type(TaskType::Project);
    store.insert_task(&project).await.unwrap();
    assert!(store.claim_task(project.id, controller.id).await.unwrap().is_claimed());

    let mut children = Vec::new();
    for _ in 0..100 {
        children = store
            .list_tasks(&TaskFilter::new().project(project.id))
            .await
            .unwrap();
        if children.len() >= 15 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(children.len() >= 15, "got {} children", children.len());

    daemon.stop().await.unwrap();
}

#[tokio::test]
async fn shutdown_handle_ends_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut daemon = Daemon::new(config(&dir)).await.expect("daemon");
    daemon.set_intervals(fast());
    let shutdown = daemon.shutdown_handle();

    let run = tokio::spawn(async move {
        daemon.run().await.map(|_| daemon)
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.stop();

    let daemon = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run returns after shutdown")
        .expect("join")
        .expect("run ok");
    for agent in daemon.store().list_agents().await.unwrap() {
        assert_eq!(agent.status, AgentStatus::Stopped);
    }
}
