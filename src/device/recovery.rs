//! Mode-specific recovery procedures, run once the device sits in the target mode.

use std::path::Path;

use crate::error::RecoveryError;
use crate::models::{DeviceMode, UnbrickRequest};
use crate::orchestrator::broadcaster::ProgressEvent;
use crate::orchestrator::context::OperationContext;
use crate::orchestrator::state::stage_progress;

use super::DeviceRecoveryEngine;

pub const EDL_STAGES: &[&str] = &[
    "Loading Firehose programmer...",
    "Establishing EDL communication...",
    "Erasing corrupted partitions...",
    "Flashing firmware images...",
    "Verifying flash integrity...",
    "Rebooting device...",
];

pub const DOWNLOAD_STAGES: &[&str] = &[
    "Preparing firmware package...",
    "Initiating download protocol...",
    "Flashing bootloader...",
    "Flashing recovery...",
    "Flashing system image...",
    "Finalizing recovery...",
];

pub const EDL_COMPLETED_MESSAGE: &str = "EDL recovery completed successfully";
pub const DOWNLOAD_COMPLETED_MESSAGE: &str = "Download mode recovery completed successfully";

impl DeviceRecoveryEngine {
    /// Run the recovery procedure for `request.device_mode`.
    pub async fn recover(&self, request: &UnbrickRequest, ctx: &OperationContext) -> Result<(), RecoveryError> {
        match request.device_mode {
            DeviceMode::Edl => {
                ctx.status("Executing EDL recovery - preparing Firehose programmer...");
                self.run_stages(ctx, EDL_STAGES, self.settings.delays.edl_stage_ms)
                    .await?;
                ctx.publish(ProgressEvent::progress(ctx.id(), 100, EDL_COMPLETED_MESSAGE));
            }
            DeviceMode::Download => {
                ctx.status("Executing Download mode recovery - preparing Odin/Heimdall...");
                self.run_stages(ctx, DOWNLOAD_STAGES, self.settings.delays.download_stage_ms)
                    .await?;
                ctx.publish(ProgressEvent::progress(ctx.id(), 100, DOWNLOAD_COMPLETED_MESSAGE));
            }
            DeviceMode::Dsu => {
                ctx.status("Executing DSU recovery - Dynamic System Update...");
                let image = firmware(request)?;
                self.dsu_install(image, ctx).await?;
            }
            DeviceMode::Recovery => {
                ctx.status("Executing recovery flash procedure...");
                let package = firmware(request)?;
                self.exec_checked(ctx, self.adb(["sideload".to_string(), path_arg(package)]))
                    .await?;
            }
            DeviceMode::Bootloader => {
                ctx.status("Executing bootloader recovery via fastboot...");
                let image = firmware(request)?;
                self.exec_checked(
                    ctx,
                    self.fastboot(["flash".to_string(), "recovery".to_string(), path_arg(image)]),
                )
                .await?;
                self.exec_checked(ctx, self.fastboot(["reboot"])).await?;
            }
        }

        log::info!(target: "parsed", "[Device] {} recovery finished", request.device_mode);
        Ok(())
    }

    /// Announce each named stage with the share of stages already done, waiting `stage_ms` per stage.
    async fn run_stages(
        &self,
        ctx: &OperationContext,
        stages: &[&str],
        stage_ms: u64,
    ) -> Result<(), RecoveryError> {
        for (index, stage) in stages.iter().enumerate() {
            ctx.publish(ProgressEvent::progress(
                ctx.id(),
                stage_progress(index, stages.len()),
                *stage,
            ));
            self.settle(ctx, stage_ms).await?;
        }
        Ok(())
    }

    async fn dsu_install(&self, image: &Path, ctx: &OperationContext) -> Result<(), RecoveryError> {
        let stages = [
            self.adb([
                "shell".to_string(),
                "dsu".to_string(),
                "install-unverified".to_string(),
                path_arg(image),
            ]),
            self.adb(["shell", "dsu", "set-active"]),
            self.adb(["reboot"]),
        ];
        for spec in stages {
            self.exec_checked(ctx, spec).await?;
        }
        Ok(())
    }
}

fn firmware(request: &UnbrickRequest) -> Result<&Path, RecoveryError> {
    request
        .firmware_path
        .as_deref()
        .ok_or(RecoveryError::FirmwareRequired(request.device_mode))
}

pub(crate) fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
