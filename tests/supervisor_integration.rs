//! End-to-end tests driving the real binary as the control plane

use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ctfgate::client::RpcClient;
use ctfgate::control::ProgramState;
use ctfgate::daemon::TasksSupervisor;
use ctfgate::program::ProgramSpec;
use ctfgate::routes::RouteTable;
use ctfgate::supervisor::{ProgramControl, Supervisor, SupervisorOptions};
use ctfgate::tasks::DirectoryTaskSource;

fn options() -> SupervisorOptions {
    SupervisorOptions {
        executable: PathBuf::from(env!("CARGO_BIN_EXE_ctfgate")),
        probe_attempts: 50,
        probe_interval: Duration::from_millis(100),
    }
}

fn sleeper() -> ProgramSpec {
    ProgramSpec::new(["sleep", "1000"])
}

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Poll until `name` reaches `state`; returns its pid
async fn wait_for_state(client: &RpcClient, name: &str, state: ProgramState) -> Option<u32> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let processes = client.list_processes().await.unwrap();
        if let Some(status) = processes.iter().find(|p| p.name == name) {
            if status.state == state {
                return status.pid;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{} never reached {:?}: {:?}",
            name,
            state,
            processes
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn process_exists(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[tokio::test]
async fn test_programs_registered_before_start_are_launched() {
    let supervisor = Supervisor::new(options()).unwrap();
    let programs = BTreeMap::from([("a".to_string(), sleeper()), ("b".to_string(), sleeper())]);
    supervisor.set_programs(programs).await.unwrap();

    supervisor.start().await.unwrap();
    assert!(supervisor.is_started());

    let client = supervisor.client();
    let pid_a = wait_for_state(client, "a", ProgramState::Running).await.unwrap();
    let pid_b = wait_for_state(client, "b", ProgramState::Running).await.unwrap();
    assert!(process_exists(pid_a));

    supervisor.terminate().await;
    assert!(!supervisor.is_started());
    assert!(!process_exists(pid_a));
    assert!(!process_exists(pid_b));
}

#[tokio::test]
async fn test_set_programs_applies_diff_to_running_control_plane() {
    let supervisor = Supervisor::new(options()).unwrap();
    supervisor
        .set_programs(BTreeMap::from([
            ("keep".to_string(), sleeper()),
            ("change".to_string(), sleeper()),
            ("drop".to_string(), sleeper()),
        ]))
        .await
        .unwrap();
    supervisor.start().await.unwrap();

    let client = supervisor.client();
    let keep_pid = wait_for_state(client, "keep", ProgramState::Running).await;
    let change_pid = wait_for_state(client, "change", ProgramState::Running).await;
    let drop_pid = wait_for_state(client, "drop", ProgramState::Running).await.unwrap();

    let diff = supervisor
        .set_programs(BTreeMap::from([
            ("keep".to_string(), sleeper()),
            ("change".to_string(), ProgramSpec::new(["sleep", "999"])),
            ("new".to_string(), sleeper()),
        ]))
        .await
        .unwrap();

    assert_eq!(diff.added, BTreeSet::from(["new".to_string()]));
    assert_eq!(diff.changed, BTreeSet::from(["change".to_string()]));
    assert_eq!(diff.removed, BTreeSet::from(["drop".to_string()]));

    assert_eq!(wait_for_state(client, "keep", ProgramState::Running).await, keep_pid);
    assert_ne!(wait_for_state(client, "change", ProgramState::Running).await, change_pid);
    wait_for_state(client, "new", ProgramState::Running).await;

    let names: Vec<String> = client
        .list_processes()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert!(!names.contains(&"drop".to_string()));
    assert!(!process_exists(drop_pid));

    // Restart replaces the running process
    supervisor.restart("keep").await.unwrap();
    assert_ne!(wait_for_state(client, "keep", ProgramState::Running).await, keep_pid);

    supervisor.terminate().await;
}

#[tokio::test]
async fn test_task_reload_restarts_only_touched_daemons() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let tasks = root.join("tasks");
    for name in ["web", "pwn"] {
        let task_dir = tasks.join(name);
        std::fs::create_dir_all(&task_dir).unwrap();
        write_script(&task_dir.join("daemon.sh"), "exec sleep 1000");
        std::fs::write(
            task_dir.join(format!("{}.toml", name)),
            format!(
                "flags = [\"ctf{{{}}}\"]\n\n[daemon]\nexec = \"./daemon.sh\"\nsocket = \"app.sock\"\n",
                name
            ),
        )
        .unwrap();
    }
    let proxy = root.join("fake-nginx.sh");
    write_script(&proxy, "trap '' HUP\nexec sleep 1000");

    let supervisor = Arc::new(Supervisor::new(options()).unwrap());
    let routes = RouteTable::new(
        supervisor.runtime_dir(),
        proxy.display().to_string(),
        Some("8080".to_string()),
    )
    .unwrap();
    let mut orchestrator = TasksSupervisor::new(
        Arc::clone(&supervisor),
        Box::new(DirectoryTaskSource::new(&tasks).unwrap()),
        supervisor.runtime_dir(),
        root.join("state"),
        routes,
    );

    let report = orchestrator.reload(&BTreeSet::new()).await.unwrap();
    assert_eq!(report.tasks, 2);
    supervisor.start().await.unwrap();

    let client = supervisor.client();
    let web_pid = wait_for_state(client, "task_web", ProgramState::Running).await;
    let pwn_pid = wait_for_state(client, "task_pwn", ProgramState::Running).await;
    let proxy_pid = wait_for_state(client, "nginx", ProgramState::Running).await;

    let config = std::fs::read_to_string(orchestrator.routes().config_path()).unwrap();
    assert!(config.contains("server_name web *.web;"));
    assert!(config.contains("server_name pwn *.pwn;"));

    // A touched file inside the task directory restarts that daemon only
    let touched = BTreeSet::from([tasks.join("web").join("daemon.sh")]);
    let report = orchestrator.reload(&touched).await.unwrap();
    assert!(report.diff.is_empty());
    assert_eq!(report.restarted, BTreeSet::from(["task_web".to_string()]));

    assert_ne!(wait_for_state(client, "task_web", ProgramState::Running).await, web_pid);
    assert_eq!(wait_for_state(client, "task_pwn", ProgramState::Running).await, pwn_pid);
    // The proxy was signalled, not restarted
    assert_eq!(wait_for_state(client, "nginx", ProgramState::Running).await, proxy_pid);

    // Removing a task removes its daemon and its route
    std::fs::remove_dir_all(tasks.join("pwn")).unwrap();
    let report = orchestrator
        .reload(&BTreeSet::from([tasks.join("pwn")]))
        .await
        .unwrap();
    assert_eq!(report.tasks, 1);
    assert_eq!(report.diff.removed, BTreeSet::from(["task_pwn".to_string()]));
    assert!(report.restarted.is_empty());

    let config = std::fs::read_to_string(orchestrator.routes().config_path()).unwrap();
    assert!(!config.contains("server_name pwn"));

    supervisor.terminate().await;
}
