use depsync_core::ecosystem::InstallTarget;
use depsync_core::protocol::EcosystemOp;
use depsync_core::tasks::TIMEOUT_ERROR;
use depsync_core::{
    CoordinatorConfig, CoreError, Ecosystem, InstallCommand, Message, OperationCode, TargetMode,
    TaskAction, TaskStatus,
};
use depsync_devkit::fakes::FakeCall;
use depsync_devkit::{wait_until, ClusterHarness, FakeManager};
use std::time::Duration;
use uuid::Uuid;

const SETTLE: Duration = Duration::from_secs(5);

fn install(names: &[&str]) -> InstallCommand {
    InstallCommand {
        names: names.iter().map(|n| n.to_string()).collect(),
        ..Default::default()
    }
}

fn status_of(h: &ClusterHarness, id: Uuid) -> Option<TaskStatus> {
    h.tasks.get(id).map(|t| t.status)
}

#[tokio::test]
async fn test_install_on_two_nodes_finishes_both_tasks() {
    let h = ClusterHarness::start(&["w1", "w2"], CoordinatorConfig::default())
        .await
        .unwrap();

    let report = h.coordinator.install(install(&["requests"])).await.unwrap();
    assert_eq!(report.tasks.len(), 2);
    assert!(report.failures.is_empty());
    assert!(report
        .tasks
        .iter()
        .all(|t| t.action == TaskAction::Install && t.names == vec!["requests".to_string()]));

    let ids: Vec<Uuid> = report.tasks.iter().map(|t| t.id).collect();
    assert!(
        wait_until(SETTLE, || ids.iter().all(|id| status_of(&h, *id) == Some(TaskStatus::Finished))).await,
        "tasks never finished"
    );
    // follow-up Save from each node
    assert!(
        wait_until(SETTLE, || {
            h.dependencies_of("w1") == vec!["requests"] && h.dependencies_of("w2") == vec!["requests"]
        })
        .await
    );

    // a fresh round reports the same state
    let round = h.coordinator.update().await.unwrap();
    assert_eq!(round.completed.len(), 2);
    assert_eq!(h.dependencies_of("w1"), vec!["requests"]);
    assert_eq!(h.dependencies_of("w2"), vec!["requests"]);
    assert_eq!(
        h.store.dependencies.count(|d| d.name == "requests"),
        2,
        "one row per node"
    );

    let calls = h.manager("w1").unwrap().calls();
    let FakeCall::Install { plan } = &calls[0] else {
        panic!("expected an install call first, got {calls:?}");
    };
    assert_eq!(plan.command, "pip");
    assert!(!plan.upgrade);
    assert_eq!(plan.target, InstallTarget::Names(vec!["requests".into()]));
}

#[tokio::test]
async fn test_install_output_reaches_task_logs() {
    let mut h = ClusterHarness::start(&[], CoordinatorConfig::default()).await.unwrap();
    h.add_agent("w1", FakeManager::new(Ecosystem::Python).with_output_lines(12))
        .await
        .unwrap();

    let report = h.coordinator.install(install(&["flask"])).await.unwrap();
    let task_id = report.tasks[0].id;
    // 12 stdout + 1 stderr lines: one full batch of 10, then the remaining 3
    assert!(wait_until(SETTLE, || h.tasks.logs(task_id).len() == 2).await);
    let total: usize = h
        .tasks
        .logs(task_id)
        .iter()
        .map(|l| l.content.lines().count())
        .sum();
    assert_eq!(total, 13);
}

#[tokio::test]
async fn test_update_round_saves_every_node() {
    let mut h = ClusterHarness::start(&[], CoordinatorConfig::default()).await.unwrap();
    h.add_agent("w1", FakeManager::new(Ecosystem::Python).with_installed(&["a", "b"]))
        .await
        .unwrap();
    h.add_agent("w2", FakeManager::new(Ecosystem::Python).with_installed(&["c"]))
        .await
        .unwrap();

    let report = h.coordinator.update().await.unwrap();
    let mut completed = report.completed.clone();
    completed.sort();
    assert_eq!(completed, vec!["w1", "w2"]);
    assert!(report.timed_out.is_empty() && report.failed.is_empty());
    // save signals only after the rows are written
    assert_eq!(h.dependencies_of("w1"), vec!["a", "b"]);
    assert_eq!(h.dependencies_of("w2"), vec!["c"]);
    assert_eq!(
        h.manager("w1").unwrap().calls(),
        vec![FakeCall::List { command: "pip".into() }]
    );
}

#[tokio::test]
async fn test_silent_node_blocks_round_without_deadline() {
    let mut h = ClusterHarness::start(&["w1"], CoordinatorConfig::default()).await.unwrap();
    h.add_silent_node("ghost").await.unwrap();

    let blocked = tokio::time::timeout(Duration::from_millis(300), h.coordinator.update()).await;
    assert!(blocked.is_err(), "round should wait for the silent node");
}

#[tokio::test]
async fn test_silent_node_times_out_with_deadline() {
    let config = CoordinatorConfig {
        round_timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    };
    let mut h = ClusterHarness::start(&["w1"], config).await.unwrap();
    h.add_silent_node("ghost").await.unwrap();

    let report = h.coordinator.update().await.unwrap();
    assert_eq!(report.completed, vec!["w1"]);
    assert_eq!(report.timed_out, vec!["ghost"]);
}

#[tokio::test]
async fn test_uninstall_then_install_keeps_rows_exact() {
    let mut h = ClusterHarness::start(&[], CoordinatorConfig::default()).await.unwrap();
    h.add_agent("w1", FakeManager::new(Ecosystem::Python).with_installed(&["a", "b", "c"]))
        .await
        .unwrap();
    h.coordinator.update().await.unwrap();
    assert_eq!(h.dependencies_of("w1"), vec!["a", "b", "c"]);

    let report = h.coordinator.uninstall(&["b".to_string()]).await.unwrap();
    assert_eq!(report.tasks.len(), 1);
    assert_eq!(report.tasks[0].action, TaskAction::Uninstall);
    assert!(wait_until(SETTLE, || h.dependencies_of("w1") == vec!["a", "c"]).await);

    h.coordinator.install(install(&["d", "a"])).await.unwrap();
    assert!(wait_until(SETTLE, || h.dependencies_of("w1") == vec!["a", "c", "d"]).await);
}

#[tokio::test]
async fn test_uninstall_skips_nodes_without_the_package() {
    let mut h = ClusterHarness::start(&[], CoordinatorConfig::default()).await.unwrap();
    h.add_agent("w1", FakeManager::new(Ecosystem::Python).with_installed(&["a"]))
        .await
        .unwrap();
    h.add_agent("w2", FakeManager::new(Ecosystem::Python).with_installed(&["b"]))
        .await
        .unwrap();
    h.coordinator.update().await.unwrap();

    let report = h.coordinator.uninstall(&["a".to_string()]).await.unwrap();
    assert_eq!(report.tasks.len(), 1);
    assert_eq!(report.tasks[0].node_id, h.nodes.by_key("w1").unwrap().id);
}

#[tokio::test]
async fn test_unreachable_node_fails_only_its_task() {
    let h = ClusterHarness::start(&["w1"], CoordinatorConfig::default()).await.unwrap();
    h.add_unreachable_node("gone").unwrap();

    let report = h.coordinator.install(install(&["requests"])).await.unwrap();
    assert_eq!(report.tasks.len(), 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].node, "gone");

    let gone = h.nodes.by_key("gone").unwrap();
    let failed = report.tasks.iter().find(|t| t.node_id == gone.id).unwrap();
    assert_eq!(failed.status, TaskStatus::Error);
    assert!(failed.error.is_some());

    let ok = report.tasks.iter().find(|t| t.node_id != gone.id).unwrap();
    assert!(wait_until(SETTLE, || status_of(&h, ok.id) == Some(TaskStatus::Finished)).await);
}

#[tokio::test]
async fn test_selected_mode_targets_only_chosen_nodes() {
    let h = ClusterHarness::start(&["w1", "w2"], CoordinatorConfig::default())
        .await
        .unwrap();
    let w2 = h.nodes.by_key("w2").unwrap();

    let report = h
        .coordinator
        .install(InstallCommand {
            names: vec!["numpy".into()],
            mode: TargetMode::Selected,
            node_ids: vec![w2.id],
            upgrade: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(report.tasks.len(), 1);
    assert_eq!(report.tasks[0].node_id, w2.id);
    assert!(wait_until(SETTLE, || h.dependencies_of("w2") == vec!["numpy"]).await);
    assert!(h.manager("w1").unwrap().calls().is_empty());
    assert!(matches!(
        &h.manager("w2").unwrap().calls()[0],
        FakeCall::Install { plan } if plan.upgrade
    ));
}

#[tokio::test]
async fn test_failing_install_reports_error() {
    let h = ClusterHarness::start(&["w1"], CoordinatorConfig::default()).await.unwrap();
    h.manager("w1").unwrap().fail_with("exit status: 1");

    let report = h.coordinator.install(install(&["broken"])).await.unwrap();
    let id = report.tasks[0].id;
    assert!(wait_until(SETTLE, || status_of(&h, id) == Some(TaskStatus::Error)).await);
    let task = h.tasks.get(id).unwrap();
    assert!(task.error.unwrap().contains("exit status: 1"));
    assert!(h.dependencies_of("w1").is_empty());
}

#[tokio::test]
async fn test_malformed_install_payload_fails_task() {
    let h = ClusterHarness::start(&["w1"], CoordinatorConfig::default()).await.unwrap();
    let setting = h.store.setting_for(Ecosystem::Python).unwrap();
    let node = h.nodes.by_key("w1").unwrap();
    let task = h
        .tasks
        .create(setting.id, Ecosystem::Python, node.id, vec![], TaskAction::Install)
        .unwrap();

    // `command` missing and `names` of the wrong type
    let msg = Message::new(
        OperationCode::Ecosystem(Ecosystem::Python, EcosystemOp::Install),
        &serde_json::json!({ "task_id": task.id, "names": 42 }),
    )
    .unwrap();
    h.master.send_message("w1", &msg).await.unwrap();

    assert!(wait_until(SETTLE, || status_of(&h, task.id) == Some(TaskStatus::Error)).await);
    assert!(h.manager("w1").unwrap().calls().iter().all(|c| !matches!(c, FakeCall::Install { .. })));
}

#[tokio::test]
async fn test_config_file_install_uses_workspace_manifest() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("crawler")).unwrap();
    std::fs::write(dir.path().join("crawler/requirements.txt"), "requests==2.31.0\n# pinned\nlxml\n").unwrap();

    let mut h = ClusterHarness::start(&[], CoordinatorConfig::default()).await.unwrap();
    h.set_workspace_root(dir.path());
    let fake = h.add_agent("w1", FakeManager::new(Ecosystem::Python)).await.unwrap();

    let report = h
        .coordinator
        .install(InstallCommand {
            use_config_file: true,
            workspace_ref: Some("crawler".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    let id = report.tasks[0].id;
    assert!(wait_until(SETTLE, || status_of(&h, id) == Some(TaskStatus::Finished)).await);
    assert!(matches!(
        &fake.calls()[0],
        FakeCall::Install { plan } if plan.target == InstallTarget::ConfigFile(dir.path().join("crawler/requirements.txt"))
    ));
}

#[tokio::test]
async fn test_bad_requirements_file_fails_task() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("crawler")).unwrap();
    std::fs::write(dir.path().join("crawler/requirements.txt"), "requests\n==1.0\n").unwrap();

    let mut h = ClusterHarness::start(&[], CoordinatorConfig::default()).await.unwrap();
    h.set_workspace_root(dir.path());
    let fake = h.add_agent("w1", FakeManager::new(Ecosystem::Python)).await.unwrap();

    let report = h
        .coordinator
        .install(InstallCommand {
            use_config_file: true,
            workspace_ref: Some("crawler".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    let id = report.tasks[0].id;
    assert!(wait_until(SETTLE, || status_of(&h, id) == Some(TaskStatus::Error)).await);
    assert!(h.tasks.get(id).unwrap().error.unwrap().contains("line 2"));
    assert!(fake.calls().iter().all(|c| !matches!(c, FakeCall::Install { .. })));
}

#[tokio::test]
async fn test_unanswered_task_times_out() {
    let config = CoordinatorConfig {
        task_timeout: Some(Duration::from_millis(150)),
        ..Default::default()
    };
    let mut h = ClusterHarness::start(&[], config).await.unwrap();
    h.add_silent_node("ghost").await.unwrap();

    let report = h.coordinator.install(install(&["requests"])).await.unwrap();
    let id = report.tasks[0].id;
    assert!(wait_until(SETTLE, || status_of(&h, id) == Some(TaskStatus::Error)).await);
    assert_eq!(h.tasks.get(id).unwrap().error.as_deref(), Some(TIMEOUT_ERROR));
}

#[tokio::test]
async fn test_disabled_ecosystem_creates_no_tasks() {
    let h = ClusterHarness::start(&["w1"], CoordinatorConfig::default()).await.unwrap();
    let setting = h.store.setting_for(Ecosystem::Python).unwrap();
    h.store.settings.update(setting.id, |s| s.enabled = false).unwrap();

    assert!(matches!(
        h.coordinator.install(install(&["requests"])).await,
        Err(CoreError::EcosystemDisabled(Ecosystem::Python))
    ));
    assert!(h.store.tasks.is_empty());
}

#[tokio::test]
async fn test_agent_reconnects_and_keeps_serving() {
    let h = ClusterHarness::start(&["w1"], CoordinatorConfig::default()).await.unwrap();
    assert!(h.hub.disconnect("w1"));
    let agent_link = h.agents["w1"].link.clone();
    assert!(wait_until(SETTLE, || agent_link.reconnects() >= 1 && h.hub.is_connected("w1")).await);

    let report = h.coordinator.install(install(&["requests"])).await.unwrap();
    let id = report.tasks[0].id;
    assert!(wait_until(SETTLE, || status_of(&h, id) == Some(TaskStatus::Finished)).await);
}
