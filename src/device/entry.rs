//! Special-mode entry tables and request validation.

use crate::error::RecoveryError;
use crate::models::{CableConfig, CableVoltage, DeviceButton, DeviceMode, UnbrickMethod, UnbrickRequest};

/// DIP switches that must be ON for a mode on the mode-entry cable.
pub fn cable_dip_switches(mode: DeviceMode) -> &'static [u8] {
    match mode {
        DeviceMode::Edl => &[1, 2],
        DeviceMode::Download => &[1, 3, 5],
        DeviceMode::Dsu => &[2, 4],
        DeviceMode::Recovery => &[1, 4, 6],
        DeviceMode::Bootloader => &[3, 4],
    }
}

pub fn cable_mode_title(mode: DeviceMode) -> &'static str {
    match mode {
        DeviceMode::Edl => "EDL Mode - Qualcomm Emergency Download",
        DeviceMode::Download => "Download Mode - Samsung/LG Recovery",
        DeviceMode::Dsu => "DSU Mode - Dynamic System Update",
        DeviceMode::Recovery => "Recovery Mode - Custom Recovery Boot",
        DeviceMode::Bootloader => "Bootloader Mode - Fastboot Interface",
    }
}

/// Human-guided checklist for the cable method.
pub fn cable_steps(mode: DeviceMode, config: Option<&CableConfig>) -> Vec<String> {
    let switches = cable_dip_switches(mode)
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    let mut steps = vec![
        "1. Power off your device completely".to_string(),
        format!("2. Set DIP switches to: {} (ON position)", switches),
    ];
    match config {
        Some(config) => {
            let voltage = match config.voltage {
                CableVoltage::V3_3 => "3.3V",
                CableVoltage::V1_8 => "1.8V",
            };
            steps.push(format!(
                "3. Connect the cable ({}, {}) to your device's USB port",
                voltage, config.resistance
            ))
        }
        None => steps.push("3. Connect the cable to your device's USB port".to_string()),
    }
    steps.extend([
        "4. Connect USB end to computer".to_string(),
        "5. Press and hold volume down + power for 10 seconds".to_string(),
        "6. Release buttons and wait for mode detection".to_string(),
        "7. Check the LED indicator on the cable for confirmation".to_string(),
    ]);
    steps
}

const RECOVERY_COMBO: &[DeviceButton] = &[DeviceButton::VolumeUp, DeviceButton::Power];
const BOOTLOADER_COMBO: &[DeviceButton] = &[DeviceButton::VolumeDown, DeviceButton::Power];
const DOWNLOAD_COMBO: &[DeviceButton] =
    &[DeviceButton::VolumeDown, DeviceButton::Home, DeviceButton::Power];
const EDL_COMBO: &[DeviceButton] =
    &[DeviceButton::VolumeUp, DeviceButton::VolumeDown, DeviceButton::Power];

/// Standard hardware key combination for a mode. DSU has none.
pub fn button_combo(mode: DeviceMode) -> Option<&'static [DeviceButton]> {
    match mode {
        DeviceMode::Recovery => Some(RECOVERY_COMBO),
        DeviceMode::Bootloader => Some(BOOTLOADER_COMBO),
        DeviceMode::Download => Some(DOWNLOAD_COMBO),
        DeviceMode::Edl => Some(EDL_COMBO),
        DeviceMode::Dsu => None,
    }
}

pub fn button_mode_title(mode: DeviceMode) -> &'static str {
    match mode {
        DeviceMode::Recovery => "Recovery Mode Entry",
        DeviceMode::Bootloader => "Bootloader/Fastboot Mode Entry",
        DeviceMode::Download => "Download Mode Entry (Samsung)",
        DeviceMode::Edl => "EDL Mode Entry (Qualcomm)",
        DeviceMode::Dsu => "DSU Mode Entry",
    }
}

/// The table combination wins; a caller-supplied one only fills modes without one.
pub fn resolve_button_combo(request: &UnbrickRequest) -> Result<Vec<DeviceButton>, RecoveryError> {
    if let Some(combo) = button_combo(request.device_mode) {
        return Ok(combo.to_vec());
    }
    match request.button_combo {
        Some(ref combo) if !combo.is_empty() => Ok(combo.clone()),
        _ => Err(RecoveryError::MethodUnavailable {
            method: UnbrickMethod::ButtonCombo,
            mode: request.device_mode,
        }),
    }
}

pub fn button_steps(combo: &[DeviceButton]) -> Vec<String> {
    let combo = combo
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join(" + ");
    vec![
        "1. Power off your device completely".to_string(),
        "2. Wait 10 seconds for full shutdown".to_string(),
        format!("3. Press and hold: {}", combo),
        "4. Hold for 10-15 seconds".to_string(),
        "5. Release all buttons".to_string(),
        "6. Wait for mode detection".to_string(),
    ]
}

/// `adb` arguments that reboot into a mode.
pub fn adb_entry_args(mode: DeviceMode) -> Option<[&'static str; 2]> {
    match mode {
        DeviceMode::Recovery => Some(["reboot", "recovery"]),
        DeviceMode::Bootloader => Some(["reboot", "bootloader"]),
        DeviceMode::Edl => Some(["reboot", "edl"]),
        DeviceMode::Download => Some(["reboot", "download"]),
        DeviceMode::Dsu => None,
    }
}

/// `fastboot` arguments that reboot into a mode.
pub fn fastboot_entry_args(mode: DeviceMode) -> Option<[&'static str; 2]> {
    match mode {
        DeviceMode::Recovery => Some(["reboot", "recovery"]),
        DeviceMode::Edl => Some(["oem", "edl"]),
        DeviceMode::Download => Some(["oem", "download"]),
        DeviceMode::Bootloader | DeviceMode::Dsu => None,
    }
}

/// Reject inconsistent requests before anything is spawned.
pub fn validate_entry_request(request: &UnbrickRequest) -> Result<(), RecoveryError> {
    let mode = request.device_mode;

    if request.cable_config.is_some() && request.method != UnbrickMethod::Cable {
        return Err(RecoveryError::InvalidRequest(format!(
            "cableConfig is only valid with the cable method, not {}",
            request.method
        )));
    }
    if request.button_combo.is_some() && request.method != UnbrickMethod::ButtonCombo {
        return Err(RecoveryError::InvalidRequest(format!(
            "buttonCombo is only valid with the button_combo method, not {}",
            request.method
        )));
    }

    match request.method {
        UnbrickMethod::Cable => {
            if let Some(ref config) = request.cable_config {
                if let Some(bad) = config.dip_switches.iter().find(|s| !(1..=6).contains(*s)) {
                    return Err(RecoveryError::InvalidRequest(format!(
                        "DIP switch {} out of range 1-6",
                        bad
                    )));
                }
                let table = cable_dip_switches(mode);
                if !config.dip_switches.is_empty() && config.dip_switches != table {
                    log::warn!(
                        "[Device] Requested DIP switches {:?} differ from {:?} for {} mode; using the latter",
                        config.dip_switches,
                        table,
                        mode
                    );
                }
            }
        }
        UnbrickMethod::ButtonCombo => {
            resolve_button_combo(request)?;
        }
        UnbrickMethod::AdbCommand => {
            if adb_entry_args(mode).is_none() {
                return Err(RecoveryError::CommandUnavailable { tool: "ADB", mode });
            }
        }
        UnbrickMethod::FastbootCommand => {
            if fastboot_entry_args(mode).is_none() {
                return Err(RecoveryError::CommandUnavailable {
                    tool: "Fastboot",
                    mode,
                });
            }
        }
    }

    Ok(())
}

/// Full unbrick validation: entry rules plus firmware requirements.
pub fn validate_unbrick_request(request: &UnbrickRequest) -> Result<(), RecoveryError> {
    validate_entry_request(request)?;

    let needs_firmware = matches!(
        request.device_mode,
        DeviceMode::Recovery | DeviceMode::Bootloader | DeviceMode::Dsu
    );
    if !needs_firmware {
        return Ok(());
    }

    let path = request
        .firmware_path
        .as_ref()
        .ok_or(RecoveryError::FirmwareRequired(request.device_mode))?;
    if !request.force_mode && !path.exists() {
        return Err(RecoveryError::FirmwareMissing(path.display().to_string()));
    }
    Ok(())
}
