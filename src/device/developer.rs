//! Developer-mode (USB debugging) guidance and enablement from a recovery shell.

use serde::{Deserialize, Serialize};

use crate::error::RecoveryError;
use crate::models::DeviceState;
use crate::orchestrator::context::OperationContext;

use super::detect::parse_device_list;
use super::DeviceRecoveryEngine;

/// Shell commands that switch on adb from a recovery shell. Any one succeeding is enough.
pub const RECOVERY_ADB_COMMANDS: &[&str] = &[
    "settings put global adb_enabled 1",
    "settings put global development_settings_enabled 1",
    "settings put global device_provisioned 1",
    "setprop persist.sys.usb.config adb",
    "setprop sys.usb.config adb",
];

/// What the user should do to get USB debugging working from `state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeveloperModeGuidance {
    pub state: DeviceState,
    pub instructions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_methods: Option<Vec<String>>,
}

/// Whether developer mode is on, and what to try if it is not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeveloperModeReport {
    pub enabled: bool,
    pub device_state: DeviceState,
    pub suggestions: Vec<String>,
}

fn lines(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn instructions_for(state: DeviceState) -> Vec<String> {
    match state {
        DeviceState::Normal => lines(&[
            "Go to Settings app",
            "Scroll down to 'About Phone' or 'System'",
            "Find 'Build Number' or 'Software Information' > 'Build Number'",
            "Tap 'Build Number' 7 times rapidly",
            "Enter your PIN/password when prompted",
            "Go back to Settings main menu",
            "Find 'Developer Options' or 'System' > 'Developer Options'",
            "Enable 'Developer Options' toggle",
            "Enable 'USB Debugging'",
            "Enable 'Install via USB' (if available)",
            "Connect device to PC and approve USB debugging prompt",
        ]),
        DeviceState::Unauthorized => lines(&[
            "Your device is connected but locked. To enable developer mode:",
            "Unlock your device with PIN/password/pattern",
            "When prompted 'Allow USB debugging?', tap 'Allow'",
            "Check 'Always allow from this computer' for convenience",
            "If no prompt appears, disconnect and reconnect the USB cable",
            "If still no prompt, try these steps:",
            "- Revoke USB debugging authorizations in Developer Options",
            "- Disable and re-enable USB debugging",
            "- Change USB connection mode to 'File Transfer/MTP'",
            "- Try a different USB cable or port",
        ]),
        DeviceState::Recovery => lines(&[
            "Device is in recovery mode. Options to enable developer mode:",
            "Option 1 - Exit Recovery:",
            "- Select 'Reboot system now' from recovery menu",
            "- Once booted, follow normal developer mode instructions",
            "",
            "Option 2 - Recovery Commands:",
            "- In TWRP: Mount > System, then use Terminal",
            "- Enable ADB in recovery if available",
            "- Use volume keys to navigate, power to select",
            "",
            "Option 3 - Recovery ADB (if enabled):",
            "- Some recoveries have ADB enabled by default",
            "- Try 'adb devices' to check connectivity",
            "- If connected, can modify system settings directly",
        ]),
        DeviceState::Fastboot => lines(&[
            "Device is in fastboot/bootloader mode.",
            "Developer mode must be enabled from Android OS.",
            "To exit fastboot and enable developer mode:",
            "- Run: fastboot reboot",
            "- Or use device buttons:",
            "  - Hold Power button for 10+ seconds",
            "  - Or select 'Start' or 'Reboot' with volume keys",
            "- Once in Android, follow normal developer mode steps",
        ]),
        DeviceState::Locked => lines(&[
            "Device appears to be locked or encrypted.",
            "To enable developer mode on a locked device:",
            "1. Boot into recovery mode:",
            "   - Power off device completely",
            "   - Hold Power + Volume Up (varies by device)",
            "   - Release when logo appears",
            "2. If stock recovery, try:",
            "   - 'Apply update from ADB'",
            "   - This may enable temporary ADB access",
            "3. If custom recovery (TWRP):",
            "   - Can often enable ADB without unlocking",
            "   - Mount system partition first",
            "4. Last resort - Factory Reset:",
            "   - Will erase all data",
            "   - Allows fresh setup with developer mode",
        ]),
    }
}

fn recovery_methods_for(state: DeviceState) -> Option<Vec<String>> {
    match state {
        DeviceState::Recovery => Some(lines(&[
            "For Samsung devices: Hold Power + Volume Up + Home",
            "For OnePlus: Hold Power + Volume Down",
            "For Google Pixel: Hold Power + Volume Down",
            "For Nothing Phone: Hold Power + Volume Up",
            "For Fairphone: Hold Volume Up while connecting USB",
        ])),
        DeviceState::Fastboot => Some(lines(&[
            "Already in fastboot mode",
            "To return to fastboot from Android:",
            "- adb reboot bootloader",
            "- Or hold Power + Volume Down during boot",
        ])),
        _ => None,
    }
}

/// Manual steps for enabling USB debugging; `None` means a normally booted device.
pub fn developer_mode_guidance(state: Option<DeviceState>) -> DeveloperModeGuidance {
    let state = state.unwrap_or(DeviceState::Normal);
    DeveloperModeGuidance {
        state,
        instructions: instructions_for(state),
        recovery_methods: recovery_methods_for(state),
    }
}

impl DeviceRecoveryEngine {
    /// Try to switch on adb from a device sitting in a custom recovery.
    pub async fn enable_developer_mode_via_recovery(&self, ctx: &OperationContext) -> Result<(), RecoveryError> {
        ctx.status("Attempting to enable developer mode via recovery...");

        let listing = self.exec(ctx, self.adb(["devices"])).await?;
        let in_recovery = listing.success
            && parse_device_list(&listing.stdout)
                .iter()
                .any(|d| d.state == "recovery");
        if !in_recovery {
            return Err(RecoveryError::DeviceNotDetected(
                "Device not in recovery mode".to_string(),
            ));
        }

        // TWRP leaves /system unmounted
        let mount = self.exec(ctx, self.adb(["shell", "mount", "/system"])).await?;
        if !mount.success {
            log::debug!("[Device] mount /system: {}", mount.text());
        }

        let mut applied = 0usize;
        for command in RECOVERY_ADB_COMMANDS {
            let output = self.exec(ctx, self.adb(["shell", command])).await?;
            if output.success {
                applied += 1;
                ctx.status(format!("Executed: {}", command));
            }
        }

        if applied == 0 {
            return Err(RecoveryError::CommandFailed {
                command: "adb shell settings/setprop".to_string(),
                output: "Failed to enable developer mode via recovery. Manual intervention required."
                    .to_string(),
            });
        }

        log::info!("[Device] Applied {} developer mode settings from recovery", applied);
        ctx.status("Developer mode settings applied. Reboot device to take effect.");
        Ok(())
    }

    /// Report whether USB debugging is on, with guidance for the device's state.
    pub async fn check_developer_mode(&self, ctx: &OperationContext) -> Result<DeveloperModeReport, RecoveryError> {
        match self.device_info(ctx).await {
            Ok(info) => Ok(DeveloperModeReport {
                enabled: info.developer_mode_enabled,
                device_state: info.device_state,
                suggestions: developer_mode_guidance(Some(info.device_state)).instructions,
            }),
            Err(RecoveryError::DeviceNotDetected(reason)) => {
                log::info!("[Device] No device for developer mode check: {}", reason);
                Ok(DeveloperModeReport {
                    enabled: false,
                    device_state: DeviceState::Locked,
                    suggestions: lines(&[
                        "No device detected. Please connect your device.",
                        "Make sure USB drivers are installed.",
                        "Try different USB cable or port.",
                    ]),
                })
            }
            Err(e) => Err(e),
        }
    }
}
