//! End-to-end build lifecycle against a scripted stand-in for the customizer.
//!
//! The fake interpreter receives `<script> --config <path> [flags]`, so `$3`
//! is the transient configuration file.

#![cfg(unix)]

mod common;

use std::fs;
use std::path::Path;
use std::time::Duration;

use common::{
    build_harness, build_harness_with, build_settings, collect_until_terminal, late_events, valid_configuration,
};
use droidforge::orchestrator::broadcaster::ProgressBroadcaster;
use droidforge::orchestrator::build::{BuildOrchestrator, BUILD_FAILED_MESSAGE};
use droidforge::orchestrator::classifier::{Effect, ProgressClassifier, Rule};
use droidforge::orchestrator::registry::OperationRegistry;
use droidforge::{
    BuildError, BuildRecord, BuildRecordUpdate, BuildStore, EventType, InMemoryBuildStore, KernelConfiguration,
    OperationStatus, Orchestrator, StoreError,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use nix::sys::signal::kill;
use nix::unistd::Pid;

fn successful_build(dir: &Path) -> String {
    format!(
        r#"echo "$3" > "{dir}/config_path"
cp "$3" "{dir}/config_copy.json"
echo "STEP: Setting up WSL environment"
echo "PROGRESS: 10% - Preparing toolchain"
echo "PROGRESS: 20% - Cloning kernel source"
echo "PROGRESS: 15% - Regressing"
echo "compiler warning" >&2
echo "PROGRESS: 60% - Starting compilation"
echo "BUILD_COMPLETE: out/Image.gz-dtb"
exit 0"#,
        dir = dir.display()
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_successful_build_reaches_completion() {
    let harness = build_harness(successful_build);
    let mut events = harness.orchestrator.subscribe();

    let task = harness
        .orchestrator
        .start_build(harness.configuration_id)
        .expect("build should start");
    let operation_id = task.id().to_string();

    let collected = collect_until_terminal(&mut events, &operation_id).await;
    let status = task.wait().await.expect("build task should not panic");
    eprintln!("[TEST] Build finished with {:?} after {} events", status, collected.len());

    assert_eq!(status, OperationStatus::Succeeded);

    let terminal = collected.last().expect("terminal event");
    assert_eq!(terminal.event_type, EventType::Success);
    assert_eq!(terminal.progress, Some(100));
    assert_eq!(collected.iter().filter(|e| e.is_terminal()).count(), 1);

    // Progress as seen by observers never goes backwards
    let progress: Vec<u8> = collected.iter().filter_map(|e| e.progress).collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "progress regressed: {:?}", progress);
    assert!(progress.contains(&60));

    assert!(collected
        .iter()
        .any(|e| e.event_type == EventType::Error && e.message.as_deref() == Some("compiler warning")));
    assert!(collected
        .iter()
        .any(|e| e.event_type == EventType::Output && e.message.as_deref() == Some("BUILD_COMPLETE: out/Image.gz-dtb")));

    let records = harness.store.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.status, OperationStatus::Succeeded);
    assert_eq!(record.progress, 100);
    assert_eq!(record.current_step, "Build completed successfully");
    assert_eq!(record.operation_id.as_deref(), Some(operation_id.as_str()));
    assert!(record.started_at.is_some());
    assert!(record.completed_at.is_some());
    assert!(record.error_message.is_none());
    assert!(record.logs.contains("PROGRESS: 60% - Starting compilation"));

    // The transient configuration is gone, but the tool saw the stored one
    let config_path = fs::read_to_string(harness.dir.path().join("config_path")).unwrap();
    assert!(!Path::new(config_path.trim()).exists(), "transient config should be deleted");

    let copied: KernelConfiguration =
        serde_json::from_str(&fs::read_to_string(harness.dir.path().join("config_copy.json")).unwrap()).unwrap();
    let mut expected = valid_configuration();
    expected.id = harness.configuration_id;
    assert_eq!(copied, expected);

    assert!(harness.orchestrator.operation(&operation_id).is_none());
    assert!(late_events(&mut events, &operation_id, Duration::from_millis(200)).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_build_keeps_last_progress() {
    let harness = build_harness(|dir| {
        format!(
            r#"echo "$3" > "{dir}/config_path"
echo "PROGRESS: 20% - Cloning kernel source"
echo "BUILD_FAILED: make exited 2"
exit 1"#,
            dir = dir.display()
        )
    });
    let mut events = harness.orchestrator.subscribe();

    let task = harness.orchestrator.start_build(harness.configuration_id).unwrap();
    let operation_id = task.id().to_string();
    let collected = collect_until_terminal(&mut events, &operation_id).await;
    let status = task.wait().await.unwrap();

    assert_eq!(status, OperationStatus::Failed);
    let terminal = collected.last().unwrap();
    assert_eq!(terminal.event_type, EventType::Failure);
    assert_eq!(terminal.message.as_deref(), Some(BUILD_FAILED_MESSAGE));
    assert_eq!(terminal.progress, Some(20));

    let record = &harness.store.records()[0];
    assert_eq!(record.status, OperationStatus::Failed);
    assert_eq!(record.progress, 20);
    assert_eq!(record.error_message.as_deref(), Some(BUILD_FAILED_MESSAGE));

    let config_path = fs::read_to_string(harness.dir.path().join("config_path")).unwrap();
    assert!(!Path::new(config_path.trim()).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_kills_build_process() {
    let harness = build_harness(|dir| {
        format!(
            r#"echo $$ > "{dir}/pid"
exec sleep 30"#,
            dir = dir.display()
        )
    });
    let mut events = harness.orchestrator.subscribe();

    let task = harness.orchestrator.start_build(harness.configuration_id).unwrap();
    let operation_id = task.id().to_string();
    let build_id = harness.store.records()[0].id;

    let pid_file = harness.dir.path().join("pid");
    let pid = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(text) = fs::read_to_string(&pid_file) {
                if let Ok(pid) = text.trim().parse::<i32>() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("build process should start");
    eprintln!("[TEST] Build process running as pid {}", pid);

    harness.orchestrator.cancel_build(build_id).expect("build should be active");

    let collected = collect_until_terminal(&mut events, &operation_id).await;
    let status = task.wait().await.unwrap();

    assert_eq!(status, OperationStatus::Cancelled);
    assert_eq!(collected.last().unwrap().event_type, EventType::Cancelled);
    assert_eq!(collected.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(late_events(&mut events, &operation_id, Duration::from_millis(200)).await.is_empty());

    // Reaped, not just signalled
    assert!(kill(Pid::from_raw(pid), None).is_err(), "process {} still exists", pid);

    assert_eq!(harness.store.records()[0].status, OperationStatus::Cancelled);
    assert!(matches!(
        harness.orchestrator.cancel_build(build_id),
        Err(BuildError::NotActive(id)) if id == build_id
    ));
    assert!(!harness.orchestrator.cancel_operation(&operation_id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_build_timeout_fails_the_build() {
    let harness = build_harness_with(
        |_| "exec sleep 30".to_string(),
        |mut settings| {
            settings.operation_timeout_secs = Some(1);
            settings
        },
    );
    let mut events = harness.orchestrator.subscribe();

    let task = harness.orchestrator.start_build(harness.configuration_id).unwrap();
    let operation_id = task.id().to_string();
    let collected = collect_until_terminal(&mut events, &operation_id).await;

    assert_eq!(task.wait().await.unwrap(), OperationStatus::Failed);
    let terminal = collected.last().unwrap();
    assert_eq!(terminal.event_type, EventType::Failure);
    assert_eq!(terminal.message.as_deref(), Some("Build timed out after 1 seconds"));
    assert_eq!(
        harness.store.records()[0].error_message.as_deref(),
        Some("Build timed out after 1 seconds")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_configuration_never_spawns() {
    let harness = build_harness(|dir| format!(r#"touch "{}/spawned""#, dir.display()));
    let broken = harness.store.insert_configuration(KernelConfiguration {
        codename: String::new(),
        ..valid_configuration()
    });
    let mut events = harness.orchestrator.subscribe();

    let task = harness.orchestrator.start_build(broken).unwrap();
    let operation_id = task.id().to_string();
    let collected = collect_until_terminal(&mut events, &operation_id).await;

    assert_eq!(task.wait().await.unwrap(), OperationStatus::Failed);
    assert!(collected
        .last()
        .and_then(|e| e.message.as_deref())
        .map_or(false, |m| m.starts_with("Invalid build configuration")));
    assert!(!harness.dir.path().join("spawned").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_configuration_is_rejected_up_front() {
    let harness = build_harness(|_| "exit 0".to_string());
    assert!(harness.orchestrator.start_build(9999).is_err());
    assert!(harness.store.records().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_builds_respect_the_limit() -> anyhow::Result<()> {
    // build_settings allows two operations at a time
    let harness = build_harness(|dir| {
        format!(
            r#"touch "{dir}/running.$$"
ls "{dir}" | grep -c '^running\.' >> "{dir}/concurrency"
sleep 0.3
rm "{dir}/running.$$""#,
            dir = dir.display()
        )
    });

    let tasks = (0..4)
        .map(|_| harness.orchestrator.start_build(harness.configuration_id))
        .collect::<Result<Vec<_>, _>>()?;
    let statuses = futures::future::join_all(tasks.into_iter().map(|t| t.wait())).await;

    for status in statuses {
        assert_eq!(status?, OperationStatus::Succeeded);
    }

    let observed: Vec<usize> = fs::read_to_string(harness.dir.path().join("concurrency"))?
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect();
    eprintln!("[TEST] Concurrent builds observed: {:?}", observed);
    assert_eq!(observed.len(), 4);
    assert!(observed.iter().all(|&n| n <= 2), "limit exceeded: {:?}", observed);
    assert_eq!(harness.store.records().len(), 4);
    Ok(())
}

/// Reads work, every write fails.
struct ReadOnlyStore {
    inner: InMemoryBuildStore,
}

impl BuildStore for ReadOnlyStore {
    fn get_build_configuration(&self, id: u64) -> Result<KernelConfiguration, StoreError> {
        self.inner.get_build_configuration(id)
    }

    fn create_build_record(&self, configuration_id: u64) -> Result<BuildRecord, StoreError> {
        self.inner.create_build_record(configuration_id)
    }

    fn get_build_record(&self, id: u64) -> Result<BuildRecord, StoreError> {
        self.inner.get_build_record(id)
    }

    fn update_build_record(&self, _id: u64, _update: BuildRecordUpdate) -> Result<BuildRecord, StoreError> {
        Err(StoreError::Backend("database is locked".to_string()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_store_write_failures_do_not_abort_the_build() {
    let dir = TempDir::new().unwrap();
    let settings = build_settings(dir.path(), "echo \"PROGRESS: 50% - Compiling\"\nexit 0");
    let inner = InMemoryBuildStore::new();
    let configuration_id = inner.insert_configuration(valid_configuration());
    let orchestrator = Orchestrator::new(settings, Arc::new(ReadOnlyStore { inner }));
    let mut events = orchestrator.subscribe();

    let task = orchestrator.start_build(configuration_id).unwrap();
    let operation_id = task.id().to_string();
    let collected = collect_until_terminal(&mut events, &operation_id).await;

    assert_eq!(task.wait().await.unwrap(), OperationStatus::Succeeded);
    assert_eq!(collected.last().map(|e| e.event_type), Some(EventType::Success));
    assert!(collected.iter().any(|e| e.progress == Some(50)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_custom_classifier_rules_drive_progress() {
    let dir = TempDir::new().unwrap();
    let settings = build_settings(
        dir.path(),
        "echo \"running repo sync -j8\"\necho \"PROGRESS: 50% - ignored by custom rules\"\nexit 0",
    );
    let store = Arc::new(InMemoryBuildStore::new());
    let configuration_id = store.insert_configuration(valid_configuration());
    let broadcaster = ProgressBroadcaster::new(256);
    let mut events = broadcaster.subscribe();

    let classifier = ProgressClassifier::new(vec![Rule::contains(
        "repo-sync",
        "repo sync",
        Effect::Milestone {
            progress: 5,
            step: "Syncing sources",
        },
    )]);
    let builds = BuildOrchestrator::new(
        Arc::new(settings),
        store.clone(),
        OperationRegistry::new(),
        broadcaster.clone(),
        Arc::new(Semaphore::new(1)),
    )
    .with_classifier(classifier);

    let task = builds.start(configuration_id).unwrap();
    let operation_id = task.id().to_string();
    let collected = collect_until_terminal(&mut events, &operation_id).await;
    assert_eq!(task.wait().await.unwrap(), OperationStatus::Succeeded);

    let progress: Vec<(u8, Option<&str>)> = collected
        .iter()
        .filter(|e| e.event_type == EventType::Progress)
        .filter_map(|e| e.progress.map(|p| (p, e.message.as_deref())))
        .collect();
    assert_eq!(progress, vec![(5, Some("Syncing sources"))]);
}
