//! TWRP recovery image builds.
//!
//! A TWRP build walks a fixed list of stages, each waiting out a nominal
//! duration scaled by `DelaySettings::twrp_stage_percent`, then reports the
//! image and flashable zip it produced. Builds stay listed after they finish;
//! while one is live its status, progress and log come from the registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tokio::sync::Semaphore;

use crate::config::validator::validate_twrp_config;
use crate::config::ForgeSettings;
use crate::error::{BuildError, ForgeError};
use crate::log_collector::LogCollector;
use crate::models::{OperationKind, OperationStatus, TwrpBuildConfig, TwrpBuildJob};
use crate::orchestrator::broadcaster::{EventType, ProgressBroadcaster, ProgressEvent};
use crate::orchestrator::build::{BUILD_CANCELLED_MESSAGE, BUILD_SUCCEEDED_MESSAGE};
use crate::orchestrator::context::{Interruption, OperationContext};
use crate::orchestrator::registry::OperationRegistry;
use crate::orchestrator::state::{stage_progress, Operation};
use crate::orchestrator::OperationTask;

/// Build stages and their nominal durations in milliseconds.
pub const TWRP_STAGES: [(&str, u64); 8] = [
    ("Setting up build environment", 5_000),
    ("Cloning TWRP source", 8_000),
    ("Applying device-specific patches", 3_000),
    ("Configuring build flags", 2_000),
    ("Applying theme customizations", 4_000),
    ("Compiling recovery image", 15_000),
    ("Packaging output files", 3_000),
    ("Finalizing build", 2_000),
];

/// Image and flashable zip a finished build leaves in the output directory.
pub fn twrp_output_files(config: &TwrpBuildConfig) -> Vec<String> {
    let stem = format!("{}_twrp_{}", config.device_codename, config.version);
    vec![format!("{}.img", stem), format!("{}.zip", stem)]
}

fn timestamped(message: &str) -> String {
    format!("[{}] {}", Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true), message)
}

/// Runs TWRP builds as `Build` operations and keeps every job it started.
#[derive(Clone)]
pub struct TwrpBuilder {
    settings: Arc<ForgeSettings>,
    registry: OperationRegistry,
    broadcaster: ProgressBroadcaster,
    permits: Arc<Semaphore>,
    jobs: Arc<Mutex<HashMap<String, TwrpBuildJob>>>,
    log_collector: Option<LogCollector>,
}

impl TwrpBuilder {
    pub fn new(
        settings: Arc<ForgeSettings>,
        registry: OperationRegistry,
        broadcaster: ProgressBroadcaster,
        permits: Arc<Semaphore>,
    ) -> Self {
        TwrpBuilder {
            settings,
            registry,
            broadcaster,
            permits,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            log_collector: None,
        }
    }

    pub fn with_log_collector(mut self, collector: Option<LogCollector>) -> Self {
        self.log_collector = collector;
        self
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, TwrpBuildJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| {
            log::warn!("[TWRP] Job table lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Validate `config` and start building it. The task resolves to the terminal status.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, config: TwrpBuildConfig) -> Result<OperationTask<OperationStatus>, ForgeError> {
        validate_twrp_config(&config).map_err(|e| BuildError::InvalidConfiguration(e.to_string()))?;

        let mut operation = Operation::new(OperationKind::Build);
        operation.set_step("Initializing");
        let cancel_rx = self.registry.register(&operation)?;
        let ctx = OperationContext::new(operation.id.clone(), cancel_rx, self.broadcaster.clone())
            .with_timeout(self.settings.operation_timeout())
            .with_log_collector(self.log_collector.clone());

        let job = TwrpBuildJob {
            id: operation.id.clone(),
            config: config.clone(),
            status: OperationStatus::Pending,
            current_step: operation.current_step.clone(),
            progress: 0,
            logs: String::new(),
            error_message: None,
            started_at: operation.created_at,
            completed_at: None,
            output_files: Vec::new(),
        };
        self.jobs().insert(job.id.clone(), job);

        ctx.publish(
            ProgressEvent::status(&operation.id, "TWRP build queued")
                .with_progress(0)
                .with_detail("deviceCodename", &config.device_codename),
        );
        log::info!(
            "[TWRP] Queued {} {} as operation {}",
            config.device_codename,
            config.version,
            operation.id
        );

        let operation_id = operation.id.clone();
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run(operation, config, ctx).await });

        Ok(OperationTask::new(operation_id, handle))
    }

    /// Cancel a live TWRP build. `false` when it is unknown or already finished.
    pub fn cancel(&self, build_id: &str) -> bool {
        if !self.jobs().contains_key(build_id) {
            return false;
        }
        let cancelled = self.registry.cancel(build_id);
        if cancelled {
            log::info!("[TWRP] Cancellation requested for {}", build_id);
        }
        cancelled
    }

    pub fn status(&self, build_id: &str) -> Option<TwrpBuildJob> {
        let job = self.jobs().get(build_id).cloned()?;
        Some(self.with_live_state(job))
    }

    /// Every build started so far, newest first.
    pub fn all(&self) -> Vec<TwrpBuildJob> {
        let jobs: Vec<TwrpBuildJob> = self.jobs().values().cloned().collect();
        let mut jobs: Vec<TwrpBuildJob> = jobs.into_iter().map(|job| self.with_live_state(job)).collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs
    }

    fn with_live_state(&self, mut job: TwrpBuildJob) -> TwrpBuildJob {
        if let Some(operation) = self.registry.snapshot(&job.id) {
            job.status = operation.status;
            job.progress = operation.progress;
            job.current_step = operation.current_step;
            job.logs = render_log(&operation.log);
        }
        job
    }

    async fn run(self, mut operation: Operation, config: TwrpBuildConfig, ctx: OperationContext) -> OperationStatus {
        let result = self.execute(&mut operation, &config, &ctx).await;
        self.finish(operation, &config, result, &ctx).await
    }

    async fn execute(
        &self,
        operation: &mut Operation,
        config: &TwrpBuildConfig,
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

        let _ = operation.start();
        operation.set_step("Starting TWRP build");
        self.record(operation);
        log::info!(target: "parsed", "[TWRP] Build {} started for {}", operation.id, config.device_codename);

        for (index, (stage, nominal_ms)) in TWRP_STAGES.iter().enumerate() {
            ctx.checkpoint().map_err(|i| self.interrupted(i))?;

            operation.set_step(*stage);
            self.append(operation, ctx, &format!("Starting: {}", stage));
            self.record(operation);
            ctx.publish(
                ProgressEvent::progress(&operation.id, operation.progress, *stage)
                    .with_detail("stage", index + 1),
            );

            ctx.sleep(self.stage_duration(*nominal_ms))
                .await
                .map_err(|i| self.interrupted(i))?;

            operation.set_progress(stage_progress(index + 1, TWRP_STAGES.len()));
            self.append(operation, ctx, &format!("Completed: {}", stage));
            self.record(operation);
            ctx.publish(ProgressEvent::progress(&operation.id, operation.progress, *stage));
        }

        Ok(())
    }

    async fn finish(
        &self,
        mut operation: Operation,
        config: &TwrpBuildConfig,
        result: Result<(), BuildError>,
        ctx: &OperationContext,
    ) -> OperationStatus {
        // Losing the retire race means a cancel was delivered
        let retired = self.registry.retire(&operation.id);
        let cancelled = !retired || ctx.is_cancelled() || matches!(result, Err(BuildError::BuildCancelled));

        let mut output_files = Vec::new();
        let event = if cancelled {
            self.append(&mut operation, ctx, BUILD_CANCELLED_MESSAGE);
            let _ = operation.cancel(BUILD_CANCELLED_MESSAGE);
            log::info!(target: "parsed", "[TWRP] Build {} cancelled", operation.id);
            ProgressEvent::new(EventType::Cancelled, &operation.id).with_message(BUILD_CANCELLED_MESSAGE)
        } else {
            match result {
                Ok(()) => {
                    output_files = twrp_output_files(config);
                    self.append(&mut operation, ctx, "Build completed successfully!");
                    self.append(&mut operation, ctx, &format!("Output files: {}", output_files.join(", ")));
                    let _ = operation.succeed(BUILD_SUCCEEDED_MESSAGE);
                    log::info!(target: "parsed", "[TWRP] Build {} succeeded", operation.id);
                    ProgressEvent::new(EventType::Success, &operation.id)
                        .with_message(BUILD_SUCCEEDED_MESSAGE)
                        .with_progress(100)
                        .with_detail("outputFiles", &output_files)
                }
                Err(e) => {
                    let message = e.to_string();
                    self.append(&mut operation, ctx, &format!("ERROR: {}", message));
                    operation.set_step("Build failed");
                    let _ = operation.fail(message.clone());
                    log::error!(target: "parsed", "[TWRP] Build {} failed: {}", operation.id, message);
                    ProgressEvent::new(EventType::Failure, &operation.id)
                        .with_message(message)
                        .with_progress(operation.progress)
                }
            }
        };

        if let Some(job) = self.jobs().get_mut(&operation.id) {
            job.status = operation.status;
            job.progress = operation.progress;
            job.current_step = operation.current_step.clone();
            job.logs = render_log(&operation.log);
            job.error_message = operation.error_message.clone();
            job.completed_at = Some(Utc::now());
            job.output_files = output_files;
        }

        if let Some(collector) = ctx.log_collector() {
            if let Err(e) = collector.wait_for_empty().await {
                log::warn!("[TWRP] Log flush failed: {}", e);
            }
            collector.close_operation(&operation.id);
        }

        ctx.publish(event.with_detail("deviceCodename", &config.device_codename));
        operation.status
    }

    fn append(&self, operation: &mut Operation, ctx: &OperationContext, message: &str) {
        let line = timestamped(message);
        ctx.log_output(&line);
        operation.append_log(line);
    }

    /// Publish the operation to the registry and mirror it into the job table.
    fn record(&self, operation: &Operation) {
        self.registry.update(operation);
        if let Some(job) = self.jobs().get_mut(&operation.id) {
            job.status = operation.status;
            job.progress = operation.progress;
            job.current_step = operation.current_step.clone();
            job.logs = render_log(&operation.log);
        }
    }

    fn stage_duration(&self, nominal_ms: u64) -> Duration {
        Duration::from_millis(nominal_ms.saturating_mul(self.settings.delays.twrp_stage_percent) / 100)
    }

    fn interrupted(&self, interruption: Interruption) -> BuildError {
        match interruption {
            Interruption::Cancelled => BuildError::BuildCancelled,
            Interruption::TimedOut => {
                BuildError::TimedOut(self.settings.operation_timeout_secs.unwrap_or_default())
            }
        }
    }
}

fn render_log(lines: &[String]) -> String {
    lines.iter().map(|line| format!("{}\n", line)).collect()
}
