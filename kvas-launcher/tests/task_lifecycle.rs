//! End-to-end task runs against the mock cloud, shell and archive.

use kvas_launcher::mock::{eventually, MockRig};
use kvas_launcher::{ExecError, TaskError, TaskSettings};
use kvas_types::{LaunchRequest, TaskState, Topology, VmRole};
use std::time::Duration;

fn request(node_count: u32) -> LaunchRequest {
    LaunchRequest {
        image: "ghcr.io/kvas/kvnode:51bee04".into(),
        node_count,
        topology: Topology::Replication,
    }
}

#[tokio::test]
async fn launch_returns_immediately_in_setup() {
    let rig = MockRig::new();
    rig.ssh.block_command("docker pull");

    let handle = rig.launcher.launch_task(request(2)).unwrap();

    assert_eq!(handle.snapshot.state, TaskState::Setup);
    assert!(handle.snapshot.nodes.is_empty());
    assert!(rig.launcher.get_task(&handle.id()).is_some());
    handle.cancel();
    assert!(handle.wait().await.is_err());
}

#[tokio::test]
async fn replication_with_three_nodes_finishes() {
    let rig = MockRig::new();
    let handle = rig.launcher.launch_task(request(3)).unwrap();
    let id = handle.id();
    handle.wait().await.unwrap();

    let task = rig.launcher.get_task(&id).unwrap();
    assert_eq!(task.state, TaskState::Finished);
    assert_eq!(task.nodes.len(), 3);
    assert_eq!(task.leader.as_deref(), Some(task.nodes[0].instance.as_str()));
    assert!(task.nodes.iter().all(|n| n.role == VmRole::Node));
    let client = task.client.clone().unwrap();
    assert!(client.instance.starts_with("kvclient-"));

    // One leader, two followers pointing at it.
    let leader_address = &task.nodes[0].address;
    assert_eq!(rig.ssh.commands_matching("--replication leader").len(), 1);
    let followers = rig.ssh.commands_matching("--replication follower");
    assert_eq!(followers.len(), 2);
    assert!(followers
        .iter()
        .all(|(_, cmd)| cmd.contains(&format!("--leader {}:8080", leader_address))));

    // Load test ran once, against the leader.
    let load_tests = rig.ssh.commands_matching("--target ");
    assert_eq!(load_tests.len(), 1);
    assert!(load_tests[0].1.contains(&format!("--target {}:8080", leader_address)));

    // Every node's logs were archived.
    for node in &task.nodes {
        let key = format!("{}/{}/docker-logs-kvnode.out.txt", id, node.instance);
        assert!(rig.blobs.get(&key).is_some(), "missing {}", key);
    }

    // Teardown deletes every machine and closes every channel.
    assert_eq!(rig.cloud.created().len(), 4);
    assert!(eventually(|| rig.cloud.live().is_empty()).await);
    assert!(eventually(|| rig.ssh.open_sessions() == 0).await);
}

#[tokio::test]
async fn failed_node_acquisition_fails_task_and_releases_client() {
    let rig = MockRig::new();
    rig.cloud.fail_create(VmRole::Node, 1);

    let handle = rig.launcher.launch_task(request(2)).unwrap();
    let id = handle.id();
    let err = handle.wait().await.unwrap_err();

    assert!(matches!(err, TaskError::Provision(_)));
    let task = rig.launcher.get_task(&id).unwrap();
    assert_eq!(task.state, TaskState::Failure);
    assert!(task.nodes.is_empty());

    // The client and the surviving node were created and then deleted.
    assert_eq!(rig.cloud.created().len(), 2);
    assert!(eventually(|| rig.cloud.live().is_empty()).await);
    let client = task.client.unwrap();
    assert!(rig.cloud.deleted().contains(&client.instance));
    assert!(rig.ssh.commands().is_empty());
}

#[tokio::test]
async fn failed_bootstrap_archives_output_and_fails() {
    let rig = MockRig::new();
    rig.ssh
        .fail_command("--replication leader", 1, "bind: address already in use");

    let handle = rig.launcher.launch_task(request(2)).unwrap();
    let id = handle.id();
    let err = handle.wait().await.unwrap_err();

    assert!(matches!(
        err,
        TaskError::Exec(ExecError::Command { exit_code: 1, .. })
    ));
    let task = rig.launcher.get_task(&id).unwrap();
    assert_eq!(task.state, TaskState::Failure);
    let leader = &task.nodes[0].instance;

    let prefix = format!("{}/{}/", id, leader);
    let leader_files: Vec<String> = rig
        .blobs
        .keys()
        .into_iter()
        .filter(|key| key.starts_with(&prefix))
        .collect();
    assert_eq!(leader_files.len(), 2, "{:?}", leader_files);
    let err_file = leader_files
        .iter()
        .find(|key| key.ends_with(".err.txt"))
        .unwrap();
    assert_eq!(
        rig.blobs.get(err_file),
        Some(b"bind: address already in use".to_vec())
    );

    // Nothing after the bootstrap ran.
    assert!(rig.ssh.commands_matching("--target ").is_empty());
    assert!(eventually(|| rig.cloud.live().is_empty()).await);
}

#[tokio::test]
async fn unreachable_machines_fail_after_three_attempts_each() {
    let rig = MockRig::new();
    rig.ssh.refuse_connections();

    let handle = rig.launcher.launch_task(request(1)).unwrap();
    let err = handle.wait().await.unwrap_err();

    assert!(matches!(
        err,
        TaskError::Exec(ExecError::Connection { attempts: 3, .. })
    ));
    // Client and node each tried three times.
    assert_eq!(rig.ssh.connect_attempts(), 6);
    assert!(rig.blobs.is_empty());
    assert!(eventually(|| rig.cloud.live().is_empty()).await);
}

#[tokio::test]
async fn client_setup_failure_releases_client() {
    let rig = MockRig::new();
    rig.ssh.fail_command("loadtest-client", 1, "denied");

    let handle = rig.launcher.launch_task(request(1)).unwrap();
    let id = handle.id();
    assert!(handle.wait().await.is_err());

    let task = rig.launcher.get_task(&id).unwrap();
    assert_eq!(task.state, TaskState::Failure);
    let client = task.client.unwrap();
    assert!(eventually(|| rig.cloud.deleted().contains(&client.instance)).await);
    assert!(eventually(|| rig.cloud.live().is_empty()).await);
}

#[tokio::test]
async fn sharding_uses_router_and_shards() {
    let rig = MockRig::new();
    let mut req = request(2);
    req.topology = Topology::NaiveSharding;

    rig.launcher.launch_task(req).unwrap().wait().await.unwrap();

    assert_eq!(rig.ssh.commands_matching("--sharding router").len(), 1);
    assert_eq!(rig.ssh.commands_matching("--sharding shard --router").len(), 1);
    assert!(rig.ssh.commands_matching("--replication").is_empty());
}

#[tokio::test]
async fn cancelled_task_fails_and_releases_everything() {
    let rig = MockRig::new();
    rig.ssh.block_command("docker pull");

    let handle = rig.launcher.launch_task(request(2)).unwrap();
    let id = handle.id();
    assert!(eventually(|| rig.ssh.commands_matching("docker pull").len() == 3).await);

    assert!(rig.launcher.cancel_task(&id));
    assert!(matches!(handle.wait().await, Err(TaskError::Cancelled)));

    assert_eq!(rig.launcher.get_task(&id).unwrap().state, TaskState::Failure);
    assert!(eventually(|| rig.cloud.live().is_empty()).await);
    assert!(eventually(|| rig.ssh.open_sessions() == 0).await);
}

#[tokio::test]
async fn deadline_fails_running_task() {
    let rig = MockRig::with_settings(TaskSettings {
        timeout: Duration::from_millis(200),
        ..TaskSettings::default()
    });
    rig.ssh.block_command("docker logs");

    let handle = rig.launcher.launch_task(request(1)).unwrap();
    let id = handle.id();
    let err = handle.wait().await.unwrap_err();

    assert!(matches!(err, TaskError::TimedOut { .. }));
    let task = rig.launcher.get_task(&id).unwrap();
    assert_eq!(task.state, TaskState::Failure);
    assert!(task.leader.is_some());
    assert!(eventually(|| rig.cloud.live().is_empty()).await);
}

#[tokio::test]
async fn extra_tasks_wait_for_a_slot() {
    let rig = MockRig::with_settings(TaskSettings {
        timeout: Duration::from_secs(60),
        max_concurrent: 1,
        ..TaskSettings::default()
    });
    rig.ssh.block_command("docker pull");

    let first = rig.launcher.launch_task(request(1)).unwrap();
    let second = rig.launcher.launch_task(request(1)).unwrap();
    assert!(eventually(|| rig.cloud.created().len() == 2).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The second task has not provisioned anything yet.
    assert_eq!(rig.cloud.created().len(), 2);
    let waiting = rig.launcher.get_task(&second.id()).unwrap();
    assert_eq!(waiting.state, TaskState::Setup);
    assert!(waiting.client.is_none());

    first.cancel();
    assert!(first.wait().await.is_err());
    assert!(eventually(|| rig.cloud.created().len() == 4).await);

    second.cancel();
    assert!(second.wait().await.is_err());
    assert!(eventually(|| rig.cloud.live().is_empty()).await);
}

#[tokio::test]
async fn cancel_while_provisioning_deletes_created_instances() {
    let rig = MockRig::new();
    rig.cloud.set_create_delay(Duration::from_millis(300));

    let handle = rig.launcher.launch_task(request(2)).unwrap();
    let id = handle.id();
    assert!(eventually(|| rig.cloud.live().len() == 3).await);

    assert!(rig.launcher.cancel_task(&id));
    assert!(matches!(handle.wait().await, Err(TaskError::Cancelled)));

    let task = rig.launcher.get_task(&id).unwrap();
    assert_eq!(task.state, TaskState::Failure);
    assert!(task.nodes.is_empty());
    assert!(eventually(|| rig.cloud.live().is_empty()).await);
    assert_eq!(rig.cloud.deleted().len(), 3);
}

#[tokio::test]
async fn deadline_while_provisioning_deletes_created_instances() {
    let rig = MockRig::with_settings(TaskSettings {
        timeout: Duration::from_millis(50),
        ..TaskSettings::default()
    });
    rig.cloud.set_create_delay(Duration::from_millis(300));

    let handle = rig.launcher.launch_task(request(2)).unwrap();
    assert!(matches!(
        handle.wait().await,
        Err(TaskError::TimedOut { .. })
    ));
    assert_eq!(rig.cloud.created().len(), 3);
    assert!(eventually(|| rig.cloud.live().is_empty()).await);
}

#[tokio::test]
async fn shutdown_cancels_runs_and_waits_for_cleanup() {
    let rig = MockRig::new();
    rig.ssh.block_command("docker pull");

    let running = rig.launcher.launch_task(request(2)).unwrap();
    let running_id = running.id();
    assert!(eventually(|| rig.ssh.commands_matching("docker pull").len() == 3).await);

    rig.cloud.set_create_delay(Duration::from_millis(200));
    let provisioning = rig.launcher.launch_task(request(1)).unwrap();
    let provisioning_id = provisioning.id();
    assert!(eventually(|| rig.cloud.live().len() == 5).await);

    rig.launcher.shutdown().await;

    // Everything is gone by the time shutdown returns.
    assert!(rig.cloud.live().is_empty());
    assert_eq!(rig.cloud.deleted().len(), 5);
    assert_eq!(rig.launcher.active_runs(), 0);
    for id in [running_id, provisioning_id] {
        assert_eq!(rig.launcher.get_task(&id).unwrap().state, TaskState::Failure);
    }
    assert!(matches!(running.wait().await, Err(TaskError::Cancelled)));
    assert!(matches!(provisioning.wait().await, Err(TaskError::Cancelled)));
}
