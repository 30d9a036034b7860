//! Operation orchestration: builds and device procedures run as tracked,
//! cancellable operations that stream progress to every subscriber.
//!
//! # Module Structure
//!
//! - `state`: `Operation` record and its status transitions
//! - `registry`: In-flight operations, cancellation tokens and snapshots
//! - `broadcaster`: Progress event fan-out
//! - `context`: Per-operation cancellation, deadline and event sink
//! - `classifier`: Build output line classification
//! - `store`: Build configuration/record persistence seam
//! - `build`: Build orchestrator
//! - `twrp`: TWRP recovery image builds
//!
//! `Orchestrator` is the single service object a host holds. It owns the
//! registry, broadcaster and store handle; nothing here is global.

pub mod broadcaster;
pub mod build;
pub mod classifier;
pub mod context;
pub mod registry;
pub mod state;
pub mod store;
pub mod twrp;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::ForgeSettings;
use crate::device::developer::DeveloperModeReport;
use crate::device::DeviceRecoveryEngine;
use crate::error::{BuildError, ForgeError, RecoveryError};
use crate::log_collector::LogCollector;
use crate::models::{
    DeviceBrickStatus, DeviceInfo, DeviceInterface, KernelTweakParams, OperationKind,
    OperationStatus, TwrpBuildConfig, TwrpBuildJob, UnbrickRequest, WslStatus,
};

use broadcaster::{EventType, ProgressBroadcaster, ProgressEvent, ProgressSubscription};
use build::BuildOrchestrator;
use context::OperationContext;
use registry::OperationRegistry;
use state::Operation;
use store::BuildStore;
use twrp::TwrpBuilder;

pub const OPERATION_CANCELLED_MESSAGE: &str = "Operation cancelled";

/// A spawned operation: its id plus the task driving it.
///
/// Dropping the task detaches it; the operation keeps running and can still be
/// cancelled by id.
pub struct OperationTask<T> {
    operation_id: String,
    handle: JoinHandle<T>,
}

impl<T> OperationTask<T> {
    pub fn new(operation_id: String, handle: JoinHandle<T>) -> Self {
        OperationTask {
            operation_id,
            handle,
        }
    }

    pub fn id(&self) -> &str {
        &self.operation_id
    }

    /// Wait for the terminal state.
    pub async fn wait(self) -> Result<T, ForgeError> {
        self.handle
            .await
            .map_err(|e| ForgeError::TaskFailed(format!("{}: {}", self.operation_id, e)))
    }
}

struct Inner {
    settings: Arc<ForgeSettings>,
    registry: OperationRegistry,
    broadcaster: ProgressBroadcaster,
    permits: Arc<Semaphore>,
    builds: BuildOrchestrator,
    twrp: TwrpBuilder,
    engine: DeviceRecoveryEngine,
    log_collector: Option<LogCollector>,
}

/// Service object owning every in-flight operation.
///
/// Cheap to clone; clones share the same registry and broadcaster. Methods that
/// start operations must be called from within a tokio runtime.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(settings: ForgeSettings, store: Arc<dyn BuildStore>) -> Self {
        Self::with_log_collector(settings, store, None)
    }

    /// Like `new`, additionally persisting per-operation output through `collector`.
    pub fn with_log_collector(
        settings: ForgeSettings,
        store: Arc<dyn BuildStore>,
        collector: Option<LogCollector>,
    ) -> Self {
        let settings = Arc::new(settings);
        let registry = OperationRegistry::new();
        let broadcaster = ProgressBroadcaster::new(settings.broadcast_capacity);
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_operations.max(1)));

        let builds = BuildOrchestrator::new(
            settings.clone(),
            store,
            registry.clone(),
            broadcaster.clone(),
            permits.clone(),
        )
        .with_log_collector(collector.clone());
        let twrp = TwrpBuilder::new(
            settings.clone(),
            registry.clone(),
            broadcaster.clone(),
            permits.clone(),
        )
        .with_log_collector(collector.clone());
        let engine = DeviceRecoveryEngine::new(settings.clone());

        log::info!(
            "[Orchestrator] Ready: {} concurrent operations, broadcast capacity {}",
            settings.max_concurrent_operations,
            settings.broadcast_capacity
        );

        Orchestrator {
            inner: Arc::new(Inner {
                settings,
                registry,
                broadcaster,
                permits,
                builds,
                twrp,
                engine,
                log_collector: collector,
            }),
        }
    }

    pub fn settings(&self) -> &ForgeSettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.inner.registry
    }

    pub fn builds(&self) -> &BuildOrchestrator {
        &self.inner.builds
    }

    pub fn engine(&self) -> &DeviceRecoveryEngine {
        &self.inner.engine
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    pub fn subscribe(&self) -> ProgressSubscription {
        self.inner.broadcaster.subscribe()
    }

    pub fn subscribe_operation(&self, operation_id: &str) -> ProgressSubscription {
        self.inner.broadcaster.subscribe_operation(operation_id)
    }

    /// Latest snapshot of an active operation.
    pub fn operation(&self, operation_id: &str) -> Option<Operation> {
        self.inner.registry.snapshot(operation_id)
    }

    pub fn active_operations(&self) -> Vec<Operation> {
        self.inner
            .registry
            .active_ids()
            .iter()
            .filter_map(|id| self.inner.registry.snapshot(id))
            .collect()
    }

    // ------------------------------------------------------------------
    // Builds and cancellation
    // ------------------------------------------------------------------

    /// Start a build of a stored configuration.
    pub fn start_build(&self, configuration_id: u64) -> Result<OperationTask<OperationStatus>, ForgeError> {
        self.inner.builds.start(configuration_id)
    }

    pub fn cancel_build(&self, build_id: u64) -> Result<(), BuildError> {
        self.inner.builds.cancel(build_id)
    }

    /// Start a TWRP recovery image build.
    pub fn start_twrp_build(&self, config: TwrpBuildConfig) -> Result<OperationTask<OperationStatus>, ForgeError> {
        self.inner.twrp.start(config)
    }

    pub fn cancel_twrp_build(&self, build_id: &str) -> bool {
        self.inner.twrp.cancel(build_id)
    }

    pub fn twrp_build(&self, build_id: &str) -> Option<TwrpBuildJob> {
        self.inner.twrp.status(build_id)
    }

    /// Every TWRP build started by this orchestrator, newest first.
    pub fn twrp_builds(&self) -> Vec<TwrpBuildJob> {
        self.inner.twrp.all()
    }

    /// Cancel any active operation. `false` when it is unknown or already finished.
    pub fn cancel_operation(&self, operation_id: &str) -> bool {
        let cancelled = self.inner.registry.cancel(operation_id);
        if cancelled {
            log::info!("[Orchestrator] Cancellation requested for {}", operation_id);
        } else {
            log::debug!("[Orchestrator] Nothing to cancel for {}", operation_id);
        }
        cancelled
    }

    // ------------------------------------------------------------------
    // Device procedures
    // ------------------------------------------------------------------

    /// Quick connectivity check. Not tracked as an operation.
    pub async fn check_connectivity(&self, interface: DeviceInterface) -> bool {
        match self.inner.engine.check_connectivity(interface, None).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("[Device] Connectivity check failed: {}", e);
                false
            }
        }
    }

    /// Whether WSL is installed on the host. Not tracked as an operation.
    pub async fn check_wsl_status(&self) -> WslStatus {
        self.inner.builds.check_wsl_status().await
    }

    pub fn detect_brick_status(&self) -> Result<OperationTask<Option<DeviceBrickStatus>>, ForgeError> {
        self.spawn_device(
            OperationKind::DeviceCommand,
            "Brick analysis",
            |engine, ctx| async move { engine.detect_brick_status(&ctx).await },
            |result| result,
        )
    }

    pub fn enter_special_mode(&self, request: UnbrickRequest) -> Result<OperationTask<bool>, ForgeError> {
        self.spawn_device(
            OperationKind::Recovery,
            "Special mode entry",
            move |engine, ctx| async move { engine.enter_special_mode(&request, &ctx).await },
            |result| result.is_some(),
        )
    }

    pub fn unbrick_device(&self, request: UnbrickRequest) -> Result<OperationTask<bool>, ForgeError> {
        self.spawn_device(
            OperationKind::Recovery,
            "Unbrick",
            move |engine, ctx| async move { engine.unbrick_device(&request, &ctx).await },
            |result| result.is_some(),
        )
    }

    pub fn device_info(&self) -> Result<OperationTask<Option<DeviceInfo>>, ForgeError> {
        self.spawn_device(
            OperationKind::DeviceCommand,
            "Device info",
            |engine, ctx| async move { engine.device_info(&ctx).await },
            |result| result,
        )
    }

    pub fn tweak_kernel(&self, params: KernelTweakParams) -> Result<OperationTask<bool>, ForgeError> {
        self.spawn_device(
            OperationKind::DeviceCommand,
            "Kernel tweaks",
            move |engine, ctx| async move { engine.tweak_kernel(&params, &ctx).await },
            |result| result.is_some(),
        )
    }

    pub fn flash_recovery(&self, image: PathBuf) -> Result<OperationTask<bool>, ForgeError> {
        self.spawn_device(
            OperationKind::DeviceCommand,
            "Recovery flash",
            move |engine, ctx| async move { engine.flash_recovery(&image, &ctx).await },
            |result| result.is_some(),
        )
    }

    pub fn sideload_package(&self, package: PathBuf) -> Result<OperationTask<bool>, ForgeError> {
        self.spawn_device(
            OperationKind::DeviceCommand,
            "Sideload",
            move |engine, ctx| async move { engine.sideload_package(&package, &ctx).await },
            |result| result.is_some(),
        )
    }

    /// Patch a boot image; resolves to the patched image path.
    pub fn patch_boot_image(
        &self,
        boot_image: PathBuf,
        magiskboot: PathBuf,
    ) -> Result<OperationTask<Option<PathBuf>>, ForgeError> {
        self.spawn_device(
            OperationKind::DeviceCommand,
            "Boot image patch",
            move |engine, ctx| async move { engine.patch_boot_image(&boot_image, &magiskboot, &ctx).await },
            |result| result,
        )
    }

    pub fn dump_boot_image(&self) -> Result<OperationTask<Option<PathBuf>>, ForgeError> {
        self.spawn_device(
            OperationKind::DeviceCommand,
            "Boot image dump",
            |engine, ctx| async move { engine.dump_boot_image(&ctx).await },
            |result| result,
        )
    }

    pub fn enable_developer_mode_via_recovery(&self) -> Result<OperationTask<bool>, ForgeError> {
        self.spawn_device(
            OperationKind::DeviceCommand,
            "Developer mode enablement",
            |engine, ctx| async move { engine.enable_developer_mode_via_recovery(&ctx).await },
            |result| result.is_some(),
        )
    }

    pub fn check_developer_mode(&self) -> Result<OperationTask<Option<DeveloperModeReport>>, ForgeError> {
        self.spawn_device(
            OperationKind::DeviceCommand,
            "Developer mode check",
            |engine, ctx| async move { engine.check_developer_mode(&ctx).await },
            |result| result,
        )
    }

    /// Register a device operation and drive `work` on a new task.
    ///
    /// `work` receives its own handle to the engine and the operation context;
    /// `resolve` maps the outcome (`None` for failed or cancelled) to the task result.
    fn spawn_device<T, R, F, Fut, G>(
        &self,
        kind: OperationKind,
        label: &'static str,
        work: F,
        resolve: G,
    ) -> Result<OperationTask<R>, ForgeError>
    where
        F: FnOnce(DeviceRecoveryEngine, OperationContext) -> Fut,
        Fut: Future<Output = Result<T, RecoveryError>> + Send + 'static,
        G: FnOnce(Option<T>) -> R + Send + 'static,
        T: Send + 'static,
        R: Send + 'static,
    {
        let operation = Operation::new(kind);
        let cancel_rx = self.inner.registry.register(&operation)?;
        let ctx = OperationContext::new(operation.id.clone(), cancel_rx, self.inner.broadcaster.clone())
            .with_timeout(self.inner.settings.operation_timeout())
            .with_log_collector(self.inner.log_collector.clone());

        log::info!("[Device] {} queued as {}", label, operation.id);
        ctx.publish(ProgressEvent::status(&operation.id, format!("{} queued", label)).with_progress(0));

        let operation_id = operation.id.clone();
        let work = work(self.inner.engine.clone(), ctx.clone());
        let this = self.clone();
        let handle = tokio::spawn(async move { resolve(this.drive(operation, ctx, label, work).await) });

        Ok(OperationTask::new(operation_id, handle))
    }

    /// Run one device operation to its terminal state.
    ///
    /// Publishes exactly one terminal event, after every other event of the operation.
    async fn drive<T, Fut>(
        &self,
        mut operation: Operation,
        ctx: OperationContext,
        label: &str,
        work: Fut,
    ) -> Option<T>
    where
        Fut: Future<Output = Result<T, RecoveryError>>,
    {
        let result = match ctx.interruptible(self.inner.permits.clone().acquire_owned()).await {
            Ok(Ok(_permit)) => {
                let _ = operation.start();
                operation.set_step(format!("{} running", label));
                self.inner.registry.update(&operation);
                log::info!("[Device] {} started ({})", label, operation.id);
                work.await
            }
            Ok(Err(_)) => Err(RecoveryError::Io("Operation limiter is closed".to_string())),
            Err(interruption) => Err(interruption.into()),
        };

        // Losing the retire race means a cancel was delivered
        let retired = self.inner.registry.retire(&operation.id);
        let cancelled = !retired || ctx.is_cancelled() || matches!(result, Err(RecoveryError::Cancelled));

        let (event, value) = if cancelled {
            let _ = operation.cancel(OPERATION_CANCELLED_MESSAGE);
            log::info!(target: "parsed", "[Device] {} cancelled ({})", label, operation.id);
            (
                ProgressEvent::new(EventType::Cancelled, &operation.id).with_message(OPERATION_CANCELLED_MESSAGE),
                None,
            )
        } else {
            match result {
                Ok(value) => {
                    let message = format!("{} completed successfully", label);
                    let _ = operation.succeed(message.clone());
                    log::info!(target: "parsed", "[Device] {} succeeded ({})", label, operation.id);
                    (
                        ProgressEvent::new(EventType::Success, &operation.id)
                            .with_message(message)
                            .with_progress(100),
                        Some(value),
                    )
                }
                Err(e) => {
                    let message = format!("{} failed: {}", label, e);
                    let _ = operation.fail(message.clone());
                    log::error!(target: "parsed", "[Device] {} ({})", message, operation.id);
                    ctx.error(message.clone());
                    (
                        ProgressEvent::new(EventType::Failure, &operation.id).with_message(message),
                        None,
                    )
                }
            }
        };

        if let Some(collector) = ctx.log_collector() {
            if let Err(e) = collector.wait_for_empty().await {
                log::warn!("[Device] Log flush failed: {}", e);
            }
            collector.close_operation(&operation.id);
        }

        ctx.publish(event);
        value
    }
}
