//! Integration tests for stack lifecycle operations.
//!
//! Every test drives the orchestrator against the in-memory control plane and
//! inspects the resulting remote state and call journal.

use stackform_core::{
    control::{InstanceStatus, MemoryConnector, MemoryControlPlane},
    naming, Bind, DownOptions, ExportOptions, Orchestrator, OrchestratorContext, RemoteConfig, RemoveOptions,
    Secret, Service, ServiceState, SnapshotOptions, Stack, StackError, StopOptions, UpOptions, Violation, Volume,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

const IMAGE: &str = "images:debian/12";

fn orchestrator(plane: &Arc<MemoryControlPlane>, stack: Stack) -> Orchestrator {
    let connector = Arc::new(MemoryConnector::new(plane.clone()));
    let ctx = OrchestratorContext::for_stack(RemoteConfig::default(), connector, &stack);
    Orchestrator::new(stack, ctx)
}

fn db_and_web() -> Stack {
    Stack::new(
        "myapp",
        vec![Service::new("web", IMAGE).depends_on("db"), Service::new("db", IMAGE)],
    )
    .unwrap()
}

fn position(calls: &[stackform_core::control::memory::Call], op: &str, target: &str) -> usize {
    calls
        .iter()
        .position(|c| c.op == op && c.target == target)
        .unwrap_or_else(|| panic!("no {op} call for {target}"))
}

#[tokio::test]
async fn test_up_brings_dependencies_up_first() {
    let plane = Arc::new(MemoryControlPlane::new());
    let orch = orchestrator(&plane, db_and_web());

    orch.up(&UpOptions::default()).await.unwrap();

    assert_eq!(plane.targets("create_instance"), vec!["db", "web"]);
    assert_eq!(plane.targets("update_instance_state"), vec!["db:start", "web:start"]);
    let calls = plane.calls();
    assert!(position(&calls, "update_instance_state", "db:start") < position(&calls, "create_instance", "web"));
    for name in ["db", "web"] {
        assert_eq!(plane.instance_info("default", name).unwrap().status, InstanceStatus::Running);
    }
}

#[tokio::test]
async fn test_down_tears_dependents_down_first() {
    let plane = Arc::new(MemoryControlPlane::new());
    let orch = orchestrator(&plane, db_and_web());
    orch.up(&UpOptions::default()).await.unwrap();
    plane.clear_calls();

    orch.down(&DownOptions::default()).await.unwrap();

    assert_eq!(plane.targets("update_instance_state"), vec!["web:stop", "db:stop"]);
    assert_eq!(plane.targets("delete_instance"), vec!["web", "db"]);
    let calls = plane.calls();
    assert!(position(&calls, "delete_instance", "web") < position(&calls, "update_instance_state", "db:stop"));
    assert!(plane.instance_names("default").is_empty());
}

#[tokio::test]
async fn test_second_up_is_a_noop() {
    let dir = tempfile::TempDir::new().unwrap();
    let password = dir.path().join("db_password.txt");
    std::fs::write(&password, "hunter2\n").unwrap();
    let config_dir = dir.path().join("config");
    std::fs::create_dir(&config_dir).unwrap();

    let plane = Arc::new(MemoryControlPlane::new().with_pool("fast").with_network("lan", true, "bridge"));
    let mut db = Service::new("db", IMAGE)
        .with_volume("cache", Volume::new("/data", "fast"))
        .with_bind(Bind::new(config_dir.to_string_lossy(), "/etc/db"));
    db.networks = vec!["lan".into()];
    db.gpu = true;
    db.cloud_init_user_data = Some("#cloud-config\n".into());
    db.secrets.insert(
        "db_password".into(),
        Secret { source: "db_password".into(), target: "db_password".into() },
    );
    let stack = Stack::new("myapp", vec![db, Service::new("web", IMAGE).depends_on("db")])
        .unwrap()
        .with_working_dir(dir.path())
        .with_secret_files(BTreeMap::from([("db_password".to_string(), password)]));
    let orch = orchestrator(&plane, stack);

    orch.up(&UpOptions::default()).await.unwrap();
    let bind = naming::bind_device_name(&config_dir.to_string_lossy());
    assert!(plane.targets("add_device").contains(&format!("db/{bind}")));
    assert!(plane.targets("add_device").contains(&"db/secrets-db".to_string()));
    plane.clear_calls();

    orch.up(&UpOptions::default()).await.unwrap();
    assert_eq!(plane.mutations(), vec![]);
    assert_eq!(plane.instance_names("default"), vec!["db", "web"]);
    assert_eq!(plane.volume_names("default"), vec!["myapp-db-cache"]);
}

#[tokio::test]
async fn test_volume_created_once_and_attached() {
    let plane = Arc::new(MemoryControlPlane::new().with_pool("fast"));
    let db = Service::new("db", IMAGE).with_volume("cache", Volume::new("/data", "fast"));
    let orch = orchestrator(&plane, Stack::new("myapp", vec![db]).unwrap());

    orch.up(&UpOptions::default()).await.unwrap();
    orch.up(&UpOptions::default()).await.unwrap();

    assert_eq!(plane.targets("create_storage_volume"), vec!["myapp-db-cache"]);
    assert_eq!(plane.targets("add_device"), vec!["db/myapp-db-cache"]);
    let volume = plane.volume_info("default", "fast", "myapp-db-cache").unwrap();
    assert_eq!(volume.content_type, "filesystem");
    let db = plane.instance_info("default", "db").unwrap();
    assert_eq!(db.devices["myapp-db-cache"]["path"], "/data");
    assert_eq!(db.devices["myapp-db-cache"]["pool"], "fast");
}

#[tokio::test]
async fn test_failure_stops_the_walk() {
    let plane = Arc::new(MemoryControlPlane::new());
    let stack = Stack::new(
        "chain",
        vec![
            Service::new("a", IMAGE),
            Service::new("b", IMAGE).depends_on("a"),
            Service::new("c", IMAGE).depends_on("b"),
        ],
    )
    .unwrap();
    plane.fail_on("create_instance", "b");
    let orch = orchestrator(&plane, stack);

    let err = orch.up(&UpOptions::default()).await.unwrap_err();
    assert!(matches!(err, StackError::Remote { ref resource, .. } if resource == "b"));

    assert_eq!(plane.instance_info("default", "a").unwrap().status, InstanceStatus::Running);
    assert!(plane.instance_info("default", "b").is_none());
    let touched_c = plane.calls().into_iter().any(|c| c.target == "c" || c.target.starts_with("c:"));
    assert!(!touched_c, "service c must never be attempted");
}

#[tokio::test]
async fn test_remove_running_without_force_is_refused() {
    let plane = Arc::new(MemoryControlPlane::new());
    let orch = orchestrator(&plane, Stack::new("myapp", vec![Service::new("web", IMAGE)]).unwrap());
    orch.up(&UpOptions::default()).await.unwrap();

    let err = orch.remove(&RemoveOptions::default()).await.unwrap_err();
    assert!(matches!(err, StackError::InstanceRunning { ref instance } if instance == "web"));
    assert!(err.to_string().contains("web"));
    assert!(plane.targets("delete_instance").is_empty());
    assert!(plane.instance_info("default", "web").is_some());

    plane.clear_calls();
    orch.remove(&RemoveOptions { force: true, ..Default::default() }).await.unwrap();
    let calls = plane.calls();
    assert!(position(&calls, "update_instance_state", "web:stop") < position(&calls, "delete_instance", "web"));
    assert!(plane.instance_info("default", "web").is_none());
}

#[tokio::test]
async fn test_remove_with_stop_flag() {
    let plane = Arc::new(MemoryControlPlane::new());
    let orch = orchestrator(&plane, Stack::new("myapp", vec![Service::new("web", IMAGE)]).unwrap());
    orch.up(&UpOptions::default()).await.unwrap();

    orch.remove(&RemoveOptions { stop: true, ..Default::default() }).await.unwrap();
    assert!(plane.instance_info("default", "web").is_none());

    // nothing left to remove
    orch.remove(&RemoveOptions::default()).await.unwrap();
}

#[tokio::test]
async fn test_down_keeps_volumes_unless_asked() {
    let plane = Arc::new(MemoryControlPlane::new());
    let db = Service::new("db", IMAGE).with_volume("data", Volume::new("/var/lib/db", "default"));
    let orch = orchestrator(&plane, Stack::new("myapp", vec![db]).unwrap());

    orch.up(&UpOptions::default()).await.unwrap();
    orch.down(&DownOptions::default()).await.unwrap();
    assert_eq!(plane.volume_names("default"), vec!["myapp-db-data"]);

    orch.up(&UpOptions::default()).await.unwrap();
    orch.down(&DownOptions { volumes: true, ..Default::default() }).await.unwrap();
    assert!(plane.volume_names("default").is_empty());
}

#[tokio::test]
async fn test_stop_start_restart() {
    let plane = Arc::new(MemoryControlPlane::new());
    let orch = orchestrator(&plane, db_and_web());
    orch.up(&UpOptions::default()).await.unwrap();
    plane.clear_calls();

    orch.stop(&StopOptions::default()).await.unwrap();
    assert_eq!(plane.targets("update_instance_state"), vec!["web:stop", "db:stop"]);

    // already stopped is not an error
    orch.stop(&StopOptions::default()).await.unwrap();
    assert_eq!(plane.targets("update_instance_state").len(), 2);

    orch.start(false).await.unwrap();
    orch.start(false).await.unwrap();
    assert_eq!(
        plane.targets("update_instance_state"),
        vec!["web:stop", "db:stop", "db:start", "web:start"]
    );

    plane.clear_calls();
    orch.restart().await.unwrap();
    assert_eq!(plane.targets("update_instance_state"), vec!["db:restart", "web:restart"]);
}

#[tokio::test]
async fn test_restart_starts_stopped_instances() {
    let plane = Arc::new(MemoryControlPlane::new());
    let orch = orchestrator(&plane, Stack::new("myapp", vec![Service::new("web", IMAGE)]).unwrap());
    orch.up(&UpOptions::default()).await.unwrap();
    orch.stop(&StopOptions::default()).await.unwrap();

    orch.restart().await.unwrap();
    assert_eq!(plane.instance_info("default", "web").unwrap().status, InstanceStatus::Running);
}

#[tokio::test]
async fn test_validation_fails_before_any_mutation() {
    let plane = Arc::new(MemoryControlPlane::new());
    let mut web = Service::new("web", IMAGE).with_volume("data", Volume::new("/data", "fast"));
    web.additional_profiles = vec!["gpu".into()];
    let orch = orchestrator(&plane, Stack::new("myapp", vec![web]).unwrap());

    let err = orch.up(&UpOptions::default()).await.unwrap_err();
    let StackError::Validation(report) = err else { panic!("expected validation error, got {err}") };
    assert!(report.violations.contains(&Violation::MissingPool { pool: "fast".into() }));
    assert!(report.violations.contains(&Violation::MissingProfile {
        profile: "gpu".into(),
        project: "default".into()
    }));
    assert!(plane.mutations().is_empty());
}

#[tokio::test]
async fn test_cloud_init_profile_and_wait() {
    let plane = Arc::new(MemoryControlPlane::new());
    let mut web = Service::new("web", IMAGE);
    web.cloud_init_user_data = Some("#cloud-config\npackages: [nginx]\n".into());
    let orch = orchestrator(&plane, Stack::new("app", vec![web]).unwrap());

    orch.up(&UpOptions::default()).await.unwrap();
    let profile = "default-app-web-cloudinit";
    assert_eq!(plane.profile_spec("default", profile).unwrap().config["user.user-data"], "#cloud-config\npackages: [nginx]\n");
    assert!(plane.instance_info("default", "web").unwrap().profiles.contains(&profile.to_string()));
    assert_eq!(plane.targets("exec"), vec!["web:cloud-init status --wait"]);

    orch.down(&DownOptions::default()).await.unwrap();
    assert!(plane.profile_spec("default", profile).is_none());
}

#[tokio::test]
async fn test_cloud_init_exit_codes() {
    let plane = Arc::new(MemoryControlPlane::new());
    let mut web = Service::new("web", IMAGE);
    web.cloud_init_user_data = Some("#cloud-config\n".into());
    let orch = orchestrator(&plane, Stack::new("app", vec![web]).unwrap());

    // recoverable errors only warn
    plane.set_exit_code("web", 2);
    orch.up(&UpOptions::default()).await.unwrap();

    plane.set_exit_code("web", 1);
    let err = orch.start(true).await.unwrap_err();
    assert!(matches!(err, StackError::CloudInitFailed { ref instance, exit_code: 1 } if instance == "web"));

    // no wait, no exec
    plane.clear_calls();
    orch.up(&UpOptions { wait: false, skip_checks: false }).await.unwrap();
    assert!(plane.targets("exec").is_empty());
}

#[tokio::test]
async fn test_snapshot_expiry() {
    let plane = Arc::new(MemoryControlPlane::new());
    let db = Service::new("db", IMAGE).with_volume("data", Volume::new("/data", "default"));
    let orch = orchestrator(&plane, Stack::new("myapp", vec![db]).unwrap());
    orch.up(&UpOptions::default()).await.unwrap();

    orch.snapshot(&SnapshotOptions::default()).await.unwrap();
    let snapshots = plane.instance_snapshots();
    assert_eq!(snapshots.len(), 1);
    assert!(snapshots[0].1.name.starts_with("db-"));
    assert!(snapshots[0].1.expires_at.is_some());
    assert!(plane.volume_snapshots().is_empty());

    orch.snapshot(&SnapshotOptions { noexpiry: true, stateful: false, volumes: true }).await.unwrap();
    assert!(plane.instance_snapshots()[1].1.expires_at.is_none());
    let volume_snapshots = plane.volume_snapshots();
    assert_eq!(volume_snapshots.len(), 1);
    assert_eq!(volume_snapshots[0].1, "myapp-db-data");
}

#[tokio::test]
async fn test_export_writes_archives() {
    let dir = tempfile::TempDir::new().unwrap();
    let plane = Arc::new(MemoryControlPlane::new());
    let db = Service::new("db", IMAGE).with_volume("data", Volume::new("/data", "default"));
    let stack = Stack::new("myapp", vec![db]).unwrap().with_export_path(dir.path().join("exports"));
    let orch = orchestrator(&plane, stack);
    orch.up(&UpOptions::default()).await.unwrap();

    let written = orch.export(&ExportOptions { volumes: true, custom_volumes_only: false }).await.unwrap();
    assert_eq!(written.len(), 2);
    let names: Vec<String> =
        written.iter().map(|p| p.file_name().unwrap().to_string_lossy().into_owned()).collect();
    assert!(names[0].starts_with("db-export-") && names[0].ends_with(".tar.gz"));
    assert!(names[1].starts_with("myapp-db-data-export-"));
    assert!(written.iter().all(|p| p.is_file()));
    let volume_archive = std::fs::read_to_string(&written[1]).unwrap();
    assert!(volume_archive.contains("without_snapshots=true"));

    let only_volumes = orch.export(&ExportOptions { volumes: false, custom_volumes_only: true }).await.unwrap();
    assert_eq!(plane.targets("export_volume").len(), 2);
    assert_eq!(only_volumes.len(), 1);
}

#[tokio::test]
async fn test_failed_export_leaves_no_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let plane = Arc::new(MemoryControlPlane::new());
    let stack = Stack::new("myapp", vec![Service::new("web", IMAGE)]).unwrap().with_export_path(dir.path());
    let orch = orchestrator(&plane, stack);
    orch.up(&UpOptions::default()).await.unwrap();

    plane.fail_on("export_instance", "web");
    assert!(orch.export(&ExportOptions::default()).await.is_err());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_info_reports_state() {
    let plane = Arc::new(MemoryControlPlane::new());
    let orch = orchestrator(&plane, db_and_web());

    let rows = orch.info().await.unwrap();
    assert_eq!(rows.iter().map(|r| r.service.as_str()).collect::<Vec<_>>(), vec!["db", "web"]);
    assert!(rows.iter().all(|r| r.state == ServiceState::Absent));

    orch.up(&UpOptions::default()).await.unwrap();
    let rows = orch.info().await.unwrap();
    assert_eq!(rows[0].state, ServiceState::Running);
    assert_eq!(rows[0].instance_type.as_deref(), Some("container"));
    assert_eq!(rows[0].ipv4, vec!["10.0.0.2"]);
}

#[tokio::test]
async fn test_cancellation_before_next_service() {
    let plane = Arc::new(MemoryControlPlane::new());
    let stack = db_and_web();
    let connector = Arc::new(MemoryConnector::new(plane.clone()));
    let (tx, rx) = watch::channel(true);
    let ctx = OrchestratorContext::for_stack(RemoteConfig::default(), connector, &stack).with_cancellation(rx);
    let orch = Orchestrator::new(stack, ctx);

    let err = orch.up(&UpOptions::default()).await.unwrap_err();
    assert!(matches!(err, StackError::Cancelled { ref next_service } if next_service == "db"));
    assert!(plane.mutations().is_empty());
    drop(tx);
}

#[tokio::test]
async fn test_foreign_instance_is_a_conflict() {
    let plane = Arc::new(MemoryControlPlane::new());
    let other = orchestrator(&plane, Stack::new("other", vec![Service::new("web", IMAGE)]).unwrap());
    other.up(&UpOptions::default()).await.unwrap();

    let orch = orchestrator(&plane, Stack::new("mine", vec![Service::new("web", IMAGE)]).unwrap());
    let err = orch.up(&UpOptions::default()).await.unwrap_err();
    assert!(matches!(err, StackError::Conflict { ref name, .. } if name == "web"));
}

#[tokio::test]
async fn test_container_name_override() {
    let plane = Arc::new(MemoryControlPlane::new());
    let mut web = Service::new("web", IMAGE);
    web.container_name = Some("frontend".into());
    let orch = orchestrator(&plane, Stack::new("myapp", vec![web]).unwrap());

    orch.up(&UpOptions::default()).await.unwrap();
    assert_eq!(plane.instance_names("default"), vec!["frontend"]);
}
