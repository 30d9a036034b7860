//! Device toolbox: identity queries, runtime kernel tweaks, flashing and
//! boot image handling over adb/fastboot.

use std::path::{Path, PathBuf};

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::RecoveryError;
use crate::models::{DeviceInfo, DeviceInterface, DeviceState, KernelTweakParams};
use crate::orchestrator::context::OperationContext;
use crate::process::CommandSpec;

use super::detect::parse_device_list;
use super::recovery::path_arg;
use super::DeviceRecoveryEngine;

/// Partition dumped by `dump_boot_image`.
pub const BOOT_PARTITION: &str = "/dev/block/bootdevice/by-name/boot";
const DEVICE_BOOT_DUMP: &str = "/sdcard/boot.img";

/// Values written through a root shell are restricted to plain tokens.
static TWEAK_VALUE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").ok());

/// One sysfs/procfs write requested by `KernelTweakParams`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelTweak {
    pub name: &'static str,
    pub path: &'static str,
    pub value: String,
}

impl KernelTweak {
    fn shell_command(&self) -> String {
        format!("echo {} > {}", self.value, self.path)
    }
}

/// Expand tweak parameters into writes, rejecting values unsafe for a shell.
pub fn planned_tweaks(params: &KernelTweakParams) -> Result<Vec<KernelTweak>, RecoveryError> {
    let requested = [
        (
            "CPU Governor",
            "/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor",
            &params.cpu_governor,
        ),
        ("I/O Scheduler", "/sys/block/mmcblk0/queue/scheduler", &params.io_scheduler),
        (
            "TCP Congestion Control",
            "/proc/sys/net/ipv4/tcp_congestion_control",
            &params.tcp_congestion,
        ),
    ];

    let mut tweaks = Vec::new();
    for (name, path, value) in requested {
        let value = match value {
            Some(v) => v.trim(),
            None => continue,
        };
        let valid = TWEAK_VALUE.as_ref().map_or(false, |re| re.is_match(value));
        if !valid {
            return Err(RecoveryError::InvalidRequest(format!(
                "Invalid value '{}' for {}",
                value, name
            )));
        }
        tweaks.push(KernelTweak {
            name,
            path,
            value: value.to_string(),
        });
    }
    Ok(tweaks)
}

/// Device state from `adb devices -l` output, or `None` when no device is listed.
///
/// An unauthorized entry wins over everything else since nothing can be queried.
pub fn device_state_from_list(output: &str) -> Option<DeviceState> {
    let devices = parse_device_list(output);
    if devices.iter().any(|d| d.state == "unauthorized") {
        Some(DeviceState::Unauthorized)
    } else if devices
        .iter()
        .any(|d| d.state == "recovery" || d.state == "sideload")
    {
        Some(DeviceState::Recovery)
    } else if devices.iter().any(|d| d.state == "device") {
        Some(DeviceState::Normal)
    } else {
        None
    }
}

impl DeviceRecoveryEngine {
    /// Value of `adb shell <args>`, or "Unknown" when the query fails.
    async fn shell_query(&self, ctx: &OperationContext, args: &[&str]) -> Result<String, RecoveryError> {
        let mut all = vec!["shell"];
        all.extend_from_slice(args);
        let output = self.exec(ctx, self.adb(all)).await?;
        Ok(if output.success {
            output.text()
        } else {
            "Unknown".to_string()
        })
    }

    /// Identity and security posture of the connected device.
    pub async fn device_info(&self, ctx: &OperationContext) -> Result<DeviceInfo, RecoveryError> {
        let listing = self.exec(ctx, self.adb(["devices", "-l"])).await?;
        if !listing.success {
            return Err(RecoveryError::DeviceNotDetected(listing.text()));
        }

        let state = match device_state_from_list(&listing.stdout) {
            Some(DeviceState::Unauthorized) => {
                return Ok(DeviceInfo::limited("Device Locked", "N/A", DeviceState::Unauthorized))
            }
            Some(state) => state,
            None => {
                if self.check_connectivity(DeviceInterface::Fastboot, Some(ctx)).await? {
                    return Ok(DeviceInfo::limited("Fastboot Mode", "Fastboot", DeviceState::Fastboot));
                }
                return Err(RecoveryError::DeviceNotDetected(
                    "No device connected over ADB or Fastboot".to_string(),
                ));
            }
        };

        let model = self.shell_query(ctx, &["getprop", "ro.product.model"]).await?;
        let android_version = self.shell_query(ctx, &["getprop", "ro.build.version.release"]).await?;
        let build_id = self.shell_query(ctx, &["getprop", "ro.build.display.id"]).await?;
        let security_patch = self
            .shell_query(ctx, &["getprop", "ro.build.version.security_patch"])
            .await?;
        let bootloader = self.shell_query(ctx, &["getprop", "ro.bootloader"]).await?;
        let kernel_version = self.shell_query(ctx, &["uname", "-r"]).await?;

        let root = self.exec(ctx, self.adb(["shell", "su", "-c", "whoami"])).await?;
        let is_rooted = root.success && root.text().contains("root");

        let boot_state = self
            .exec(ctx, self.adb(["shell", "getprop", "ro.boot.verifiedbootstate"]))
            .await?;
        let bootloader_unlocked = boot_state.text().contains("orange");

        let adb_enabled = self
            .exec(ctx, self.adb(["shell", "settings", "get", "global", "adb_enabled"]))
            .await?;
        let developer_mode_enabled = adb_enabled.text() == "1";

        log::info!(
            "[Device] {} (Android {}), rooted: {}, unlocked: {}",
            model,
            android_version,
            is_rooted,
            bootloader_unlocked
        );

        Ok(DeviceInfo {
            model,
            android_version,
            build_id,
            security_patch,
            kernel_version,
            bootloader,
            is_rooted,
            bootloader_unlocked,
            developer_mode_enabled,
            device_state: state,
        })
    }

    async fn require_root(&self, ctx: &OperationContext, purpose: &str) -> Result<(), RecoveryError> {
        let info = self.device_info(ctx).await?;
        if info.is_rooted {
            Ok(())
        } else {
            Err(RecoveryError::RootRequired(purpose.to_string()))
        }
    }

    /// Apply runtime kernel tunables through `su -c`.
    ///
    /// Every requested tweak is attempted; the call fails if any of them did.
    pub async fn tweak_kernel(&self, params: &KernelTweakParams, ctx: &OperationContext) -> Result<(), RecoveryError> {
        let tweaks = planned_tweaks(params)?;
        ctx.status("Starting kernel tweaking...");
        if tweaks.is_empty() {
            ctx.status("No kernel tweaks requested");
            return Ok(());
        }

        self.require_root(ctx, "kernel tweaking").await?;

        let mut failed = Vec::new();
        for tweak in &tweaks {
            ctx.status(format!("Setting {} to {}...", tweak.name, tweak.value));
            let output = self
                .exec(
                    ctx,
                    self.adb(["shell".to_string(), "su".to_string(), "-c".to_string(), tweak.shell_command()]),
                )
                .await?;
            if output.success {
                ctx.status(format!("{} set to {}", tweak.name, tweak.value));
            } else {
                log::warn!("[Device] Failed to set {}: {}", tweak.name, output.text());
                ctx.error(format!("Failed to set {}", tweak.name));
                failed.push(tweak.name);
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(RecoveryError::CommandFailed {
                command: "kernel tweaks".to_string(),
                output: format!("failed to set {}", failed.join(", ")),
            })
        }
    }

    /// Reboot to the bootloader and flash a recovery image.
    pub async fn flash_recovery(&self, image: &Path, ctx: &OperationContext) -> Result<(), RecoveryError> {
        require_file(image)?;

        ctx.status("Rebooting to bootloader...");
        let reboot = self.exec(ctx, self.adb(["reboot", "bootloader"])).await?;
        if !reboot.success {
            log::warn!("[Device] adb reboot bootloader: {}", reboot.text());
        }
        self.settle(ctx, self.settings.delays.bootloader_reboot_ms).await?;

        if !self.check_connectivity(DeviceInterface::Fastboot, Some(ctx)).await? {
            return Err(RecoveryError::DeviceNotDetected(
                "Device not detected in fastboot mode".to_string(),
            ));
        }

        ctx.status("Flashing recovery image...");
        self.exec_checked(
            ctx,
            self.fastboot(["flash".to_string(), "recovery".to_string(), path_arg(image)]),
        )
        .await?;
        ctx.status("Recovery flashed successfully");

        let reboot = self.exec(ctx, self.fastboot(["reboot"])).await?;
        if !reboot.success {
            log::warn!("[Device] fastboot reboot: {}", reboot.text());
        }
        Ok(())
    }

    /// Reboot to recovery and sideload a flashable zip (Magisk, GApps, ...).
    pub async fn sideload_package(&self, package: &Path, ctx: &OperationContext) -> Result<(), RecoveryError> {
        require_file(package)?;

        ctx.status("Rebooting to recovery for sideloading...");
        let reboot = self.exec(ctx, self.adb(["reboot", "recovery"])).await?;
        if !reboot.success {
            log::warn!("[Device] adb reboot recovery: {}", reboot.text());
        }
        self.settle(ctx, self.settings.delays.recovery_reboot_ms).await?;

        ctx.status("Sideloading package...");
        self.exec_checked(ctx, self.adb(["sideload".to_string(), path_arg(package)]))
            .await?;
        ctx.status("Package sideloaded successfully");
        Ok(())
    }

    /// Unpack and repack a boot image with `magiskboot`; returns the patched image path.
    ///
    /// Work happens in a scratch directory under the output directory that is
    /// removed on every path out of this function.
    pub async fn patch_boot_image(
        &self,
        boot_image: &Path,
        magiskboot: &Path,
        ctx: &OperationContext,
    ) -> Result<PathBuf, RecoveryError> {
        require_file(boot_image)?;
        require_file(magiskboot)?;
        ctx.status("Starting boot image patching with Magisk...");

        let output_dir = self.settings.output_dir.clone();
        tokio::fs::create_dir_all(&output_dir).await?;
        let scratch = tempfile::Builder::new()
            .prefix("patch_")
            .tempdir_in(&output_dir)?;

        let work_boot = scratch.path().join("boot.img");
        let work_tool = scratch.path().join("magiskboot");
        tokio::fs::copy(boot_image, &work_boot).await?;
        tokio::fs::copy(magiskboot, &work_tool).await?;
        make_executable(&work_tool).await?;

        let tool = path_arg(&work_tool);

        ctx.status("Unpacking boot image...");
        self.exec_checked(
            ctx,
            CommandSpec::new(tool.clone())
                .args(["unpack".to_string(), path_arg(&work_boot)])
                .current_dir(scratch.path()),
        )
        .await?;

        ctx.status("Repacking with Magisk patches...");
        self.exec_checked(
            ctx,
            CommandSpec::new(tool)
                .args(["repack".to_string(), path_arg(&work_boot)])
                .current_dir(scratch.path()),
        )
        .await?;

        let repacked = scratch.path().join("new-boot.img");
        if !repacked.exists() {
            return Err(RecoveryError::Io(
                "magiskboot did not produce new-boot.img".to_string(),
            ));
        }

        let name = format!("patched-boot-{}.img", Utc::now().timestamp_millis());
        let patched = output_dir.join(&name);
        tokio::fs::copy(&repacked, &patched).await?;

        if let Err(e) = scratch.close() {
            log::warn!("[Device] Failed to remove patch scratch directory: {}", e);
        }

        log::info!(target: "parsed", "[Device] Patched boot image written to {}", patched.display());
        ctx.status(format!("Boot image patched successfully: {}", name));
        Ok(patched)
    }

    /// Copy the boot partition off a rooted device into the tools directory.
    pub async fn dump_boot_image(&self, ctx: &OperationContext) -> Result<PathBuf, RecoveryError> {
        self.require_root(ctx, "dumping the boot image").await?;

        ctx.status("Dumping boot image from device...");
        self.exec_checked(
            ctx,
            self.adb([
                "shell".to_string(),
                "su".to_string(),
                "-c".to_string(),
                format!("dd if={} of={}", BOOT_PARTITION, DEVICE_BOOT_DUMP),
            ]),
        )
        .await?;

        tokio::fs::create_dir_all(&self.settings.tools_dir).await?;
        let destination = self.settings.tools_dir.join("dumped-boot.img");
        self.exec_checked(
            ctx,
            self.adb([
                "pull".to_string(),
                DEVICE_BOOT_DUMP.to_string(),
                path_arg(&destination),
            ]),
        )
        .await?;

        ctx.status(format!("Boot image dumped to: {}", destination.display()));
        Ok(destination)
    }
}

fn require_file(path: &Path) -> Result<(), RecoveryError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(RecoveryError::FirmwareMissing(path.display().to_string()))
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<(), RecoveryError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<(), RecoveryError> {
    Ok(())
}
