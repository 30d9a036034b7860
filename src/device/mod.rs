//! Device recovery engine.
//!
//! # Module Structure
//!
//! - `detect`: Pure parsing of device lists, USB signatures and brick classification
//! - `entry`: Special-mode entry tables and request validation
//! - `recovery`: Mode-specific recovery procedures
//! - `tools`: Device toolbox (info, kernel tweaks, flashing, boot image handling)
//! - `developer`: Developer-mode guidance and recovery-shell enablement
//!
//! Every external probe goes through `ProcessRunner` with the operation's
//! context, so output is streamed and every wait is cancellable.

pub mod detect;
pub mod developer;
pub mod entry;
pub mod recovery;
pub mod tools;

use std::sync::Arc;
use std::time::Duration;

use crate::config::ForgeSettings;
use crate::error::RecoveryError;
use crate::models::{
    DeviceBrickStatus, DeviceInterface, DeviceMode, DeviceSignals, UnbrickMethod, UnbrickRequest,
};
use crate::orchestrator::broadcaster::{EventType, ProgressEvent};
use crate::orchestrator::context::OperationContext;
use crate::process::{CommandOutput, CommandSpec, ProcessOutcome, ProcessRunner, StreamKind};

use detect::{classify_brick_status, has_connected_device, scan_usb_signatures, UsbScan};
use entry::{
    adb_entry_args, button_mode_title, button_steps, cable_dip_switches, cable_mode_title,
    cable_steps, fastboot_entry_args, resolve_button_combo, validate_entry_request,
    validate_unbrick_request,
};

/// Runs device probes, mode entry and recovery procedures.
#[derive(Clone)]
pub struct DeviceRecoveryEngine {
    settings: Arc<ForgeSettings>,
    runner: ProcessRunner,
}

impl DeviceRecoveryEngine {
    pub fn new(settings: Arc<ForgeSettings>) -> Self {
        DeviceRecoveryEngine {
            runner: ProcessRunner::new(settings.kill_grace()),
            settings,
        }
    }

    pub fn settings(&self) -> &ForgeSettings {
        &self.settings
    }

    fn adb<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(self.settings.adb_path.clone()).args(args)
    }

    fn fastboot<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(self.settings.fastboot_path.clone()).args(args)
    }

    /// Run a command for the operation. Only cancellation and timeout are errors.
    async fn exec(&self, ctx: &OperationContext, spec: CommandSpec) -> Result<CommandOutput, RecoveryError> {
        let output = self.runner.run(&spec, Some(ctx)).await;
        check_interrupted(&output)?;
        Ok(output)
    }

    /// Run a command that must exit successfully.
    async fn exec_checked(
        &self,
        ctx: &OperationContext,
        spec: CommandSpec,
    ) -> Result<CommandOutput, RecoveryError> {
        let command = spec.display();
        let output = self.exec(ctx, spec).await?;
        if output.success {
            Ok(output)
        } else {
            Err(RecoveryError::CommandFailed {
                command,
                output: output.text(),
            })
        }
    }

    async fn settle(&self, ctx: &OperationContext, millis: u64) -> Result<(), RecoveryError> {
        ctx.sleep(Duration::from_millis(millis)).await?;
        Ok(())
    }

    /// Whether `adb devices` / `fastboot devices` lists a usable device.
    ///
    /// Without a context the probe runs unsupervised and publishes nothing.
    pub async fn check_connectivity(
        &self,
        interface: DeviceInterface,
        ctx: Option<&OperationContext>,
    ) -> Result<bool, RecoveryError> {
        let spec = match interface {
            DeviceInterface::Adb => self.adb(["devices"]),
            DeviceInterface::Fastboot => self.fastboot(["devices"]),
        };
        let output = self.runner.run(&spec, ctx).await;
        check_interrupted(&output)?;
        Ok(output.success && has_connected_device(&output.stdout))
    }

    /// Look for EDL/Download USB signatures. Best-effort: any failure reads as
    /// "nothing found".
    pub async fn probe_usb(&self, ctx: &OperationContext) -> Result<UsbScan, RecoveryError> {
        let (program, args) = match self.settings.usb_probe.command() {
            Some(command) => command,
            None => return Ok(UsbScan::default()),
        };
        let spec = CommandSpec::new(program).args(args);

        let process = match self.runner.spawn(&spec) {
            Ok(process) => process,
            Err(e) => {
                log::warn!("[Device] USB probe unavailable, assuming no signatures: {}", e);
                return Ok(UsbScan::default());
            }
        };

        let mut listing = String::new();
        let outcome = process
            .wait_streaming(Some(ctx), |kind, line| {
                if kind == StreamKind::Stdout {
                    listing.push_str(&line);
                    listing.push('\n');
                }
            })
            .await;

        match outcome {
            Ok(ProcessOutcome::Cancelled) => Err(RecoveryError::Cancelled),
            Ok(ProcessOutcome::TimedOut) => Err(RecoveryError::TimedOut),
            Ok(ProcessOutcome::Exited { success: false, code }) => {
                log::warn!("[Device] USB probe '{}' exited with {:?}", spec.display(), code);
                Ok(scan_usb_signatures(&listing))
            }
            Ok(ProcessOutcome::Exited { .. }) => Ok(scan_usb_signatures(&listing)),
            Err(e) => {
                log::warn!("[Device] USB probe failed: {}", e);
                Ok(UsbScan::default())
            }
        }
    }

    /// Gather every signal brick classification looks at.
    pub async fn collect_signals(&self, ctx: &OperationContext) -> Result<DeviceSignals, RecoveryError> {
        let adb_reachable = self.check_connectivity(DeviceInterface::Adb, Some(ctx)).await?;
        let fastboot_reachable = self
            .check_connectivity(DeviceInterface::Fastboot, Some(ctx))
            .await?;
        let usb = self.probe_usb(ctx).await?;

        Ok(DeviceSignals {
            adb_reachable,
            fastboot_reachable,
            download_mode_signature: usb.download,
            edl_mode_signature: usb.edl,
        })
    }

    /// Probe the device and classify how badly it is bricked.
    pub async fn detect_brick_status(&self, ctx: &OperationContext) -> Result<DeviceBrickStatus, RecoveryError> {
        ctx.status("Analyzing device brick status...");

        let signals = self.collect_signals(ctx).await?;
        let status = classify_brick_status(&signals);
        log::info!(
            "[Device] Brick analysis: {:?} via {} ({:?})",
            status.brick_type,
            status.detected_mode,
            signals
        );

        ctx.publish(
            ProgressEvent::new(EventType::AnalysisComplete, ctx.id())
                .with_message(status.recommended_action.clone())
                .with_detail("brickType", status.brick_type)
                .with_detail("detectedMode", &status.detected_mode)
                .with_detail("recoverable", status.recoverable)
                .with_detail("recommendedAction", &status.recommended_action)
                .with_detail("supportedMethods", &status.supported_methods),
        );
        Ok(status)
    }

    /// Check once whether the device currently sits in `mode`.
    pub async fn detect_special_mode(
        &self,
        mode: DeviceMode,
        ctx: &OperationContext,
    ) -> Result<bool, RecoveryError> {
        ctx.status(format!("Detecting {} mode...", mode.as_str().to_uppercase()));

        let (detected, details) = match mode {
            DeviceMode::Edl => (self.probe_usb(ctx).await?.edl, "Qualcomm EDL mode detected"),
            DeviceMode::Download => (self.probe_usb(ctx).await?.download, "Download mode detected"),
            DeviceMode::Recovery => {
                let output = self.exec(ctx, self.adb(["get-state"])).await?;
                (output.text().contains("recovery"), "Recovery mode detected")
            }
            DeviceMode::Bootloader => (
                self.check_connectivity(DeviceInterface::Fastboot, Some(ctx)).await?,
                "Bootloader/Fastboot mode detected",
            ),
            // DSU images are installed from a booted system, so an adb device is the ready state
            DeviceMode::Dsu => (
                self.check_connectivity(DeviceInterface::Adb, Some(ctx)).await?,
                "Device reachable over ADB for DSU",
            ),
        };

        if detected {
            log::info!("[Device] {}", details);
            ctx.status(details);
        } else {
            log::info!("[Device] {} mode not detected", mode);
        }
        Ok(detected)
    }

    /// Push the device into the requested mode, then confirm it arrived.
    ///
    /// Cable and button methods only publish a checklist for the user; command
    /// methods issue the reboot themselves. Either way detection runs exactly once,
    /// and a miss is `ModeEntryFailed`.
    pub async fn enter_special_mode(
        &self,
        request: &UnbrickRequest,
        ctx: &OperationContext,
    ) -> Result<(), RecoveryError> {
        validate_entry_request(request)?;
        let mode = request.device_mode;
        let mode_upper = mode.as_str().to_uppercase();

        ctx.status(format!(
            "Attempting to enter {} mode using {}...",
            mode_upper, request.method
        ));

        match request.method {
            UnbrickMethod::Cable => {
                ctx.status("Configuring special cable for mode entry...");
                ctx.publish(
                    ProgressEvent::new(EventType::CableInstructions, ctx.id())
                        .with_message(cable_mode_title(mode))
                        .with_detail("mode", mode)
                        .with_detail("instructions", cable_mode_title(mode))
                        .with_detail("dipSwitches", cable_dip_switches(mode))
                        .with_detail("steps", cable_steps(mode, request.cable_config.as_ref())),
                );
                self.settle(ctx, self.settings.delays.cable_settle_ms).await?;
            }
            UnbrickMethod::ButtonCombo => {
                let combo = resolve_button_combo(request)?;
                ctx.publish(
                    ProgressEvent::new(EventType::ButtonInstructions, ctx.id())
                        .with_message(button_mode_title(mode))
                        .with_detail("mode", mode)
                        .with_detail("instructions", button_mode_title(mode))
                        .with_detail("combo", &combo)
                        .with_detail("steps", button_steps(&combo)),
                );
                self.settle(ctx, self.settings.delays.button_settle_ms).await?;
            }
            UnbrickMethod::AdbCommand => {
                let args = adb_entry_args(mode).ok_or(RecoveryError::CommandUnavailable { tool: "ADB", mode })?;
                self.exec_checked(ctx, self.adb(args)).await?;
                self.settle(ctx, self.settings.delays.command_settle_ms).await?;
            }
            UnbrickMethod::FastbootCommand => {
                let args = fastboot_entry_args(mode).ok_or(RecoveryError::CommandUnavailable {
                    tool: "Fastboot",
                    mode,
                })?;
                self.exec_checked(ctx, self.fastboot(args)).await?;
                self.settle(ctx, self.settings.delays.command_settle_ms).await?;
            }
        }

        if !self.detect_special_mode(mode, ctx).await? {
            if request.method == UnbrickMethod::Cable {
                ctx.status(format!(
                    "Failed to detect {} mode. Please check cable configuration.",
                    mode_upper
                ));
            }
            return Err(RecoveryError::ModeEntryFailed(mode));
        }

        ctx.status(format!("Successfully entered {} mode", mode_upper));
        Ok(())
    }

    /// Analyse, enter the target mode, then run its recovery procedure.
    ///
    /// Stops at the first failing step; nothing is retried.
    pub async fn unbrick_device(
        &self,
        request: &UnbrickRequest,
        ctx: &OperationContext,
    ) -> Result<(), RecoveryError> {
        validate_unbrick_request(request)?;
        ctx.status("Starting device unbrick procedure...");

        let status = self.detect_brick_status(ctx).await?;
        log::info!(
            "[Device] Unbricking from {} towards {} via {}",
            status.detected_mode,
            request.device_mode,
            request.method
        );

        self.enter_special_mode(request, ctx).await?;
        self.recover(request, ctx).await
    }
}

fn check_interrupted(output: &CommandOutput) -> Result<(), RecoveryError> {
    match output.outcome {
        Some(ProcessOutcome::Cancelled) => Err(RecoveryError::Cancelled),
        Some(ProcessOutcome::TimedOut) => Err(RecoveryError::TimedOut),
        _ => Ok(()),
    }
}
