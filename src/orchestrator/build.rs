//! Kernel/ROM build execution.
//!
//! Each build runs in its own task:
//! 1. Wait for a concurrency permit (still `Pending`)
//! 2. Write the configuration to a transient JSON file in the work dir
//! 3. Spawn the customizer script and stream its output through the classifier
//! 4. Resolve to `Succeeded`, `Failed` or `Cancelled`, persist and broadcast it
//!
//! The transient file is a `NamedTempFile` owned by the build task, so it is
//! removed on every path out of the task, panics included.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;

use crate::config::validator::validate_kernel_configuration;
use crate::config::ForgeSettings;
use crate::error::{BuildError, ForgeError, StoreError};
use crate::log_collector::LogCollector;
use crate::models::{
    BuildRecord, BuildRecordUpdate, KernelConfiguration, OperationKind, OperationStatus,
    SkipOptions, WslStatus,
};
use crate::orchestrator::broadcaster::{EventType, ProgressBroadcaster, ProgressEvent};
use crate::orchestrator::classifier::ProgressClassifier;
use crate::orchestrator::context::{Interruption, OperationContext};
use crate::orchestrator::registry::OperationRegistry;
use crate::orchestrator::state::Operation;
use crate::orchestrator::store::BuildStore;
use crate::orchestrator::OperationTask;
use crate::process::{CommandOutput, CommandSpec, ProcessOutcome, ProcessRunner, StreamKind};

pub const BUILD_SUCCEEDED_MESSAGE: &str = "Build completed successfully";
pub const BUILD_FAILED_MESSAGE: &str = "Build process failed with non-zero exit code";
pub const BUILD_CANCELLED_MESSAGE: &str = "Build cancelled by user";

/// Command-line arguments for the customizer script, after the interpreter.
///
/// Each skip option maps 1:1 to a flag; unset options are omitted.
pub fn build_command_args(script: &Path, config_path: &Path, skip: &SkipOptions) -> Vec<String> {
    let mut args = vec![
        script.display().to_string(),
        "--config".to_string(),
        config_path.display().to_string(),
    ];

    let flags = [
        (skip.skip_env_setup, "--skip-env-setup"),
        (skip.skip_clone, "--skip-clone"),
        (skip.skip_patches, "--skip-patches"),
        (skip.skip_config_tweaks, "--skip-config-tweaks"),
        (skip.skip_build, "--skip-build"),
        (skip.clean_output, "--clean-output"),
    ];
    args.extend(
        flags
            .iter()
            .filter(|(set, _)| *set)
            .map(|(_, flag)| flag.to_string()),
    );

    args
}

/// Write `configuration` in the tool's input format to a fresh temp file in `dir`.
pub fn write_transient_config(
    dir: &Path,
    configuration: &KernelConfiguration,
) -> Result<tempfile::NamedTempFile, BuildError> {
    std::fs::create_dir_all(dir).map_err(BuildError::TransientConfig)?;
    let mut file = tempfile::Builder::new()
        .prefix("kernel_config_")
        .suffix(".json")
        .tempfile_in(dir)
        .map_err(BuildError::TransientConfig)?;
    serde_json::to_writer_pretty(file.as_file_mut(), configuration)?;
    file.as_file_mut()
        .flush()
        .map_err(BuildError::TransientConfig)?;
    Ok(file)
}

/// Interpret `wsl --list --quiet`.
///
/// Windows writes the listing as UTF-16, so NUL bytes are dropped before lines
/// are trimmed.
pub fn wsl_status_from_output(output: &CommandOutput) -> WslStatus {
    if output.outcome.is_none() {
        return WslStatus {
            available: false,
            distros: Vec::new(),
            message: "WSL command not found".to_string(),
        };
    }
    if !output.success {
        return WslStatus {
            available: false,
            distros: Vec::new(),
            message: "WSL is not available or not properly configured".to_string(),
        };
    }

    let distros: Vec<String> = output
        .stdout
        .replace('\0', "")
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    WslStatus {
        available: true,
        message: format!("WSL is available with {} distribution(s)", distros.len()),
        distros,
    }
}

/// Drives builds against a `BuildStore`.
#[derive(Clone)]
pub struct BuildOrchestrator {
    settings: Arc<ForgeSettings>,
    store: Arc<dyn BuildStore>,
    registry: OperationRegistry,
    broadcaster: ProgressBroadcaster,
    runner: ProcessRunner,
    permits: Arc<Semaphore>,
    classifier: Arc<ProgressClassifier>,
    log_collector: Option<LogCollector>,
}

impl BuildOrchestrator {
    pub fn new(
        settings: Arc<ForgeSettings>,
        store: Arc<dyn BuildStore>,
        registry: OperationRegistry,
        broadcaster: ProgressBroadcaster,
        permits: Arc<Semaphore>,
    ) -> Self {
        BuildOrchestrator {
            runner: ProcessRunner::new(settings.kill_grace()),
            settings,
            store,
            registry,
            broadcaster,
            permits,
            classifier: Arc::new(ProgressClassifier::default()),
            log_collector: None,
        }
    }

    pub fn with_classifier(mut self, classifier: ProgressClassifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn with_log_collector(mut self, collector: Option<LogCollector>) -> Self {
        self.log_collector = collector;
        self
    }

    /// Create a build record for a stored configuration and start it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, configuration_id: u64) -> Result<OperationTask<OperationStatus>, ForgeError> {
        let configuration = self.store.get_build_configuration(configuration_id)?;
        let record = self.store.create_build_record(configuration_id)?;
        self.start_record(record, configuration)
    }

    /// Start an already created record.
    pub fn start_record(
        &self,
        record: BuildRecord,
        configuration: KernelConfiguration,
    ) -> Result<OperationTask<OperationStatus>, ForgeError> {
        let operation = Operation::new(OperationKind::Build);
        let cancel_rx = self.registry.register_with_build(&operation, Some(record.id))?;

        let ctx = OperationContext::new(operation.id.clone(), cancel_rx, self.broadcaster.clone())
            .with_timeout(self.settings.operation_timeout())
            .with_log_collector(self.log_collector.clone());

        self.persist(
            record.id,
            BuildRecordUpdate {
                operation_id: Some(operation.id.clone()),
                current_step: Some("Queued".to_string()),
                ..Default::default()
            },
        );
        ctx.publish(
            ProgressEvent::status(&operation.id, "Build queued")
                .with_progress(0)
                .with_detail("buildId", record.id),
        );
        log::info!(
            "[Build] Queued build {} (configuration {}) as operation {}",
            record.id,
            configuration.id,
            operation.id
        );

        let operation_id = operation.id.clone();
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run(operation, record.id, configuration, ctx).await });

        Ok(OperationTask::new(operation_id, handle))
    }

    /// Whether the host can run builds under WSL, and which distributions it has.
    pub async fn check_wsl_status(&self) -> WslStatus {
        let spec = CommandSpec::new(self.settings.wsl_path.clone()).args(["--list", "--quiet"]);
        let status = wsl_status_from_output(&self.runner.run(&spec, None).await);
        log::debug!("[Build] {}", status.message);
        status
    }

    /// Cancel the live operation driving `build_id`.
    pub fn cancel(&self, build_id: u64) -> Result<(), BuildError> {
        match self.registry.find_build(build_id) {
            Some(operation_id) if self.registry.cancel(&operation_id) => {
                log::info!("[Build] Cancellation requested for build {}", build_id);
                Ok(())
            }
            _ => Err(BuildError::NotActive(build_id)),
        }
    }

    async fn run(
        self,
        mut operation: Operation,
        build_id: u64,
        configuration: KernelConfiguration,
        ctx: OperationContext,
    ) -> OperationStatus {
        let result = self.execute(&mut operation, build_id, &configuration, &ctx).await;
        self.finish(operation, build_id, result, &ctx).await
    }

    async fn execute(
        &self,
        operation: &mut Operation,
        build_id: u64,
        configuration: &KernelConfiguration,
        ctx: &OperationContext,
    ) -> Result<(), BuildError> {
        let _permit = match ctx.interruptible(self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(BuildError::SpawnFailed(
                    "Operation limiter is closed".to_string(),
                ))
            }
            Err(interruption) => return Err(self.interrupted(interruption)),
        };

        let (config_file, spec) = self.prepare(configuration, ctx)?;

        let process = self
            .runner
            .spawn(&spec)
            .map_err(|e| BuildError::SpawnFailed(e.to_string()))?;
        self.registry.attach_pid(&operation.id, process.pid());

        let _ = operation.start();
        operation.set_step("Starting build");
        self.registry.update(operation);
        self.persist(
            build_id,
            BuildRecordUpdate {
                status: Some(OperationStatus::Running),
                current_step: Some("Starting build".to_string()),
                started_at: Some(Utc::now()),
                ..Default::default()
            },
        );
        ctx.publish(
            ProgressEvent::new(EventType::Status, &operation.id)
                .with_message(format!("Build started: {}", spec.display()))
                .with_progress(operation.progress),
        );
        log::info!(target: "parsed", "[Build] Build {} started", build_id);

        let outcome = process
            .wait_streaming(Some(ctx), |kind, line| {
                self.on_line(operation, build_id, ctx, kind, line)
            })
            .await
            .map_err(|e| BuildError::SpawnFailed(e.to_string()))?;

        if let Err(e) = config_file.close() {
            log::warn!("[Build] Failed to remove transient configuration: {}", e);
        }

        match outcome {
            ProcessOutcome::Exited { success: true, .. } => Ok(()),
            ProcessOutcome::Exited { code, .. } => {
                log::warn!("[Build] Build {} exited with code {:?}", build_id, code);
                Err(BuildError::ProcessFailed { code })
            }
            ProcessOutcome::Cancelled => Err(BuildError::BuildCancelled),
            ProcessOutcome::TimedOut => Err(self.interrupted(Interruption::TimedOut)),
        }
    }

    /// Validate, write the transient configuration and assemble the command line.
    ///
    /// A cancel or timeout that lands after the permit was granted stops here,
    /// before anything is spawned.
    pub(crate) fn prepare(
        &self,
        configuration: &KernelConfiguration,
        ctx: &OperationContext,
    ) -> Result<(tempfile::NamedTempFile, CommandSpec), BuildError> {
        ctx.checkpoint().map_err(|i| self.interrupted(i))?;

        validate_kernel_configuration(configuration)
            .map_err(|e| BuildError::InvalidConfiguration(e.to_string()))?;

        let config_file = write_transient_config(&self.settings.work_dir, configuration)?;
        log::debug!("[Build] Wrote transient configuration {}", config_file.path().display());

        let spec = CommandSpec::new(self.settings.python_path.clone())
            .args(build_command_args(
                &self.settings.build_script,
                config_file.path(),
                &configuration.skip_options,
            ))
            .current_dir(self.settings.work_dir.clone());

        // Dropping `config_file` on this path removes it again
        ctx.checkpoint().map_err(|i| self.interrupted(i))?;
        Ok((config_file, spec))
    }

    /// Record, classify and publish one line of build output.
    fn on_line(
        &self,
        operation: &mut Operation,
        build_id: u64,
        ctx: &OperationContext,
        kind: StreamKind,
        line: String,
    ) {
        operation.append_log(line.clone());
        ctx.log_output(&line);

        let mut update = BuildRecordUpdate {
            append_logs: Some(format!("{}\n", line)),
            ..Default::default()
        };

        let classification = self.classifier.classify(&line);

        let event = match kind {
            StreamKind::Stdout => ProgressEvent::output(&operation.id, line),
            StreamKind::Stderr => ProgressEvent::error(&operation.id, line),
        };
        ctx.publish(event);

        if let Some(classification) = classification {
            let raised = classification
                .progress
                .map_or(false, |p| operation.set_progress(p));
            let step_changed = match classification.step {
                Some(step) if step != operation.current_step => {
                    operation.set_step(step.clone());
                    update.current_step = Some(step);
                    true
                }
                _ => false,
            };

            if raised || step_changed {
                update.progress = Some(operation.progress);
                ctx.publish(
                    ProgressEvent::progress(&operation.id, operation.progress, operation.current_step.clone())
                        .with_detail("buildId", build_id),
                );
            }
        }

        self.registry.update(operation);
        self.persist(build_id, update);
    }

    async fn finish(
        &self,
        mut operation: Operation,
        build_id: u64,
        result: Result<(), BuildError>,
        ctx: &OperationContext,
    ) -> OperationStatus {
        // Losing the retire race means a cancel was delivered
        let retired = self.registry.retire(&operation.id);
        let cancelled = !retired || ctx.is_cancelled() || matches!(result, Err(BuildError::BuildCancelled));

        let mut update = BuildRecordUpdate {
            completed_at: Some(Utc::now()),
            ..Default::default()
        };

        let event = if cancelled {
            let _ = operation.cancel(BUILD_CANCELLED_MESSAGE);
            update.status = Some(OperationStatus::Cancelled);
            update.current_step = Some(BUILD_CANCELLED_MESSAGE.to_string());
            update.append_logs = Some(format!("{}\n", BUILD_CANCELLED_MESSAGE));
            log::info!(target: "parsed", "[Build] Build {} cancelled", build_id);
            ProgressEvent::new(EventType::Cancelled, &operation.id).with_message(BUILD_CANCELLED_MESSAGE)
        } else {
            match result {
                Ok(()) => {
                    let _ = operation.succeed(BUILD_SUCCEEDED_MESSAGE);
                    update.status = Some(OperationStatus::Succeeded);
                    update.progress = Some(100);
                    update.current_step = Some(BUILD_SUCCEEDED_MESSAGE.to_string());
                    update.append_logs = Some(format!("{}\n", BUILD_SUCCEEDED_MESSAGE));
                    log::info!(target: "parsed", "[Build] Build {} succeeded", build_id);
                    ProgressEvent::new(EventType::Success, &operation.id)
                        .with_message(BUILD_SUCCEEDED_MESSAGE)
                        .with_progress(100)
                }
                Err(e) => {
                    let message = match e {
                        BuildError::ProcessFailed { .. } => BUILD_FAILED_MESSAGE.to_string(),
                        other => other.to_string(),
                    };
                    operation.set_step("Build failed");
                    let _ = operation.fail(message.clone());
                    update.status = Some(OperationStatus::Failed);
                    update.current_step = Some("Build failed".to_string());
                    update.error_message = Some(message.clone());
                    update.append_logs = Some(format!("{}\n", message));
                    log::error!(target: "parsed", "[Build] Build {} failed: {}", build_id, message);
                    ProgressEvent::new(EventType::Failure, &operation.id)
                        .with_message(message)
                        .with_progress(operation.progress)
                }
            }
        };

        self.persist(build_id, update);

        if let Some(collector) = ctx.log_collector() {
            if let Err(e) = collector.wait_for_empty().await {
                log::warn!("[Build] Log flush failed: {}", e);
            }
            collector.close_operation(&operation.id);
        }

        ctx.publish(event.with_detail("buildId", build_id));
        operation.status
    }

    fn interrupted(&self, interruption: Interruption) -> BuildError {
        match interruption {
            Interruption::Cancelled => BuildError::BuildCancelled,
            Interruption::TimedOut => {
                BuildError::TimedOut(self.settings.operation_timeout_secs.unwrap_or_default())
            }
        }
    }

    /// Store failures never abort a build.
    fn persist(&self, build_id: u64, update: BuildRecordUpdate) {
        if let Err(e) = self.store.update_build_record(build_id, update) {
            match e {
                StoreError::RecordNotFound(_) => {
                    log::warn!("[Build] Build record {} disappeared: {}", build_id, e)
                }
                _ => log::error!("[Build] Failed to persist build {}: {}", build_id, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_args_without_skip_flags() {
        let args = build_command_args(
            Path::new("/opt/forge/kernel_customizer.py"),
            Path::new("/tmp/kernel_config_1.json"),
            &SkipOptions::default(),
        );
        assert_eq!(
            args,
            vec![
                "/opt/forge/kernel_customizer.py",
                "--config",
                "/tmp/kernel_config_1.json"
            ]
        );
    }

    #[test]
    fn test_each_skip_flag_maps_one_to_one() {
        let skip = SkipOptions {
            skip_clone: true,
            skip_build: true,
            clean_output: true,
            ..Default::default()
        };
        let args = build_command_args(Path::new("k.py"), Path::new("c.json"), &skip);
        assert_eq!(&args[3..], &["--skip-clone", "--skip-build", "--clean-output"]);

        let all = SkipOptions {
            skip_env_setup: true,
            skip_clone: true,
            skip_patches: true,
            skip_config_tweaks: true,
            skip_build: true,
            clean_output: true,
        };
        let args = build_command_args(Path::new("k.py"), Path::new("c.json"), &all);
        assert_eq!(args.len(), 9);
        assert_eq!(args[3], "--skip-env-setup");
        assert_eq!(args[6], "--skip-config-tweaks");
    }

    fn exited(success: bool, stdout: &str) -> CommandOutput {
        CommandOutput {
            success,
            stdout: stdout.to_string(),
            stderr: String::new(),
            outcome: Some(ProcessOutcome::Exited {
                success,
                code: Some(if success { 0 } else { 1 }),
            }),
        }
    }

    #[test]
    fn test_wsl_listing_outcomes() {
        let missing = CommandOutput {
            success: false,
            stdout: String::new(),
            stderr: "No such file or directory".to_string(),
            outcome: None,
        };
        assert_eq!(wsl_status_from_output(&missing).message, "WSL command not found");

        let broken = wsl_status_from_output(&exited(false, ""));
        assert!(!broken.available);
        assert_eq!(broken.message, "WSL is not available or not properly configured");

        // UTF-16LE listing as Windows prints it
        let status = wsl_status_from_output(&exited(true, "k\0a\0l\0i\0\r\0\n\0\0\r\0\n\0U\0b\0u\0n\0t\0u\0\r\0\n\0"));
        assert!(status.available);
        assert_eq!(status.distros, vec!["kali", "Ubuntu"]);
        assert_eq!(status.message, "WSL is available with 2 distribution(s)");
    }

    fn orchestrator_in(dir: &Path) -> BuildOrchestrator {
        let settings = ForgeSettings {
            python_path: "/nonexistent/python".to_string(),
            work_dir: dir.to_path_buf(),
            ..Default::default()
        };
        BuildOrchestrator::new(
            Arc::new(settings),
            Arc::new(crate::orchestrator::store::InMemoryBuildStore::new()),
            OperationRegistry::new(),
            ProgressBroadcaster::new(16),
            Arc::new(Semaphore::new(1)),
        )
    }

    fn buildable() -> KernelConfiguration {
        KernelConfiguration {
            device: "Google Pixel 3".to_string(),
            codename: "blueline".to_string(),
            kernel_repo: "https://android.googlesource.com/kernel/msm".to_string(),
            kernel_branch: "android-msm-crosshatch-4.9-android12".to_string(),
            output_dir: "out".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_prepare_writes_config_and_command() {
        let dir = tempfile::TempDir::new().unwrap();
        let builds = orchestrator_in(dir.path());
        let (_tx, rx) = tokio::sync::watch::channel(false);
        let ctx = OperationContext::new("op", rx, ProgressBroadcaster::new(4));

        let (file, spec) = builds.prepare(&buildable(), &ctx).unwrap();
        assert!(file.path().exists());
        assert!(spec.display().contains(&file.path().display().to_string()));
    }

    #[test]
    fn test_prepare_stops_once_cancelled() {
        let dir = tempfile::TempDir::new().unwrap();
        let builds = orchestrator_in(dir.path());
        let (tx, rx) = tokio::sync::watch::channel(false);
        let ctx = OperationContext::new("op", rx, ProgressBroadcaster::new(4));
        tx.send(true).unwrap();

        assert!(matches!(
            builds.prepare(&buildable(), &ctx),
            Err(BuildError::BuildCancelled)
        ));
        // No transient configuration was left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_transient_config_round_trip_and_cleanup() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut configuration = KernelConfiguration {
            id: 4,
            name: "Pixel 3".to_string(),
            device: "google_blueline".to_string(),
            codename: "blueline".to_string(),
            custom_kernel_configs: vec!["CONFIG_USB_ACM=y".to_string()],
            ..Default::default()
        };
        configuration.features.bad_usb = true;
        configuration.skip_options.skip_patches = true;

        let file = write_transient_config(dir.path(), &configuration).unwrap();
        let path: PathBuf = file.path().to_path_buf();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("kernel_config_") && name.ends_with(".json"));

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["codename"], "blueline");
        assert_eq!(raw["features"]["bad_usb"], true);
        assert_eq!(raw["skip_options"]["skip_patches"], true);
        assert_eq!(raw["kernel_image_name_patterns"][0], "Image.gz-dtb");

        let parsed: KernelConfiguration = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed, configuration);

        drop(file);
        assert!(!path.exists());
    }
}
