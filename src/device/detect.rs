//! Device presence and brick-state detection.
//!
//! Everything here that interprets tool output is a pure function; the engine
//! in `device::mod` runs the commands and feeds their text in.

use crate::models::{BrickType, DeviceBrickStatus, DeviceSignals};

/// Mode a USB vendor/product pair identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureMode {
    Download,
    Edl,
}

/// Known USB identities of devices sitting in a low-level flashing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbSignature {
    pub vendor: &'static str,
    pub product: &'static str,
    pub mode: SignatureMode,
    pub label: &'static str,
}

pub const USB_SIGNATURES: &[UsbSignature] = &[
    UsbSignature {
        vendor: "04e8",
        product: "685d",
        mode: SignatureMode::Download,
        label: "Samsung download mode",
    },
    UsbSignature {
        vendor: "1004",
        product: "61a1",
        mode: SignatureMode::Download,
        label: "LG download mode",
    },
    UsbSignature {
        vendor: "05c6",
        product: "9008",
        mode: SignatureMode::Edl,
        label: "Qualcomm EDL (9008)",
    },
    UsbSignature {
        vendor: "05c6",
        product: "900e",
        mode: SignatureMode::Edl,
        label: "Qualcomm diagnostic (900E)",
    },
];

impl UsbSignature {
    /// Whether a lowercased USB listing mentions this device.
    ///
    /// Accepts `lsusb` (`05c6:9008`), Windows PnP ids (`vid_05c6&pid_9008`) and
    /// the underscore form some drivers print (`05c6_9008`).
    fn found_in(&self, listing: &str) -> bool {
        let forms = [
            format!("{}:{}", self.vendor, self.product),
            format!("vid_{}&pid_{}", self.vendor, self.product),
            format!("{}_{}", self.vendor, self.product),
        ];
        forms.iter().any(|form| listing.contains(form.as_str()))
    }
}

/// Low-level mode signatures found in one USB listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsbScan {
    pub download: bool,
    pub edl: bool,
}

pub fn scan_usb_signatures(listing: &str) -> UsbScan {
    let listing = listing.to_lowercase();
    let mut scan = UsbScan::default();
    for signature in USB_SIGNATURES.iter().filter(|s| s.found_in(&listing)) {
        log::debug!("[Device] USB signature matched: {}", signature.label);
        match signature.mode {
            SignatureMode::Download => scan.download = true,
            SignatureMode::Edl => scan.edl = true,
        }
    }
    scan
}

/// One entry of `adb devices` / `fastboot devices` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedDevice {
    pub serial: String,
    pub state: String,
}

/// Parse a device list, skipping the header and daemon chatter.
pub fn parse_device_list(output: &str) -> Vec<ListedDevice> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            Some(ListedDevice {
                serial: serial.to_string(),
                state: state.to_string(),
            })
        })
        .collect()
}

/// Whether a device list shows at least one device that is not offline.
pub fn has_connected_device(output: &str) -> bool {
    parse_device_list(output)
        .iter()
        .any(|device| device.state != "offline")
}

/// Classify brick severity from observed signals.
///
/// First true signal wins: adb, fastboot, download signature, EDL signature;
/// nothing at all means unresponsive.
pub fn classify_brick_status(signals: &DeviceSignals) -> DeviceBrickStatus {
    let (brick_type, mode, action, methods): (BrickType, &str, &str, [&str; 3]) =
        if signals.adb_reachable {
            (
                BrickType::Soft,
                "adb",
                "Device responsive via ADB - soft brick recovery possible",
                ["adb_sideload", "factory_reset", "kernel_flash"],
            )
        } else if signals.fastboot_reachable {
            (
                BrickType::Semi,
                "fastboot",
                "Device in fastboot mode - recovery via fastboot commands",
                ["fastboot_flash", "bootloader_unlock", "recovery_flash"],
            )
        } else if signals.download_mode_signature {
            (
                BrickType::Hard,
                "download",
                "Device in download mode - firmware flash required",
                ["odin_flash", "heimdall_flash", "lg_bridge"],
            )
        } else if signals.edl_mode_signature {
            (
                BrickType::Hard,
                "edl",
                "Device in EDL mode - specialized tools required",
                ["qfil_flash", "edl_programmer", "firehose_protocol"],
            )
        } else {
            (
                BrickType::Hard,
                "unresponsive",
                "Device unresponsive - hardware intervention required",
                ["cable_mode_entry", "testpoint_method", "jtag_recovery"],
            )
        };

    DeviceBrickStatus {
        brick_type,
        detected_mode: mode.to_string(),
        recoverable: true,
        recommended_action: action.to_string(),
        supported_methods: methods.iter().map(|m| m.to_string()).collect(),
    }
}
