//! Core data types for DroidForge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// What kind of long-running work an operation represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Build,
    DeviceCommand,
    Recovery,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Build => write!(f, "build"),
            OperationKind::DeviceCommand => write!(f, "device_command"),
            OperationKind::Recovery => write!(f, "recovery"),
        }
    }
}

/// Lifecycle status shared by operations and persisted build records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl OperationStatus {
    /// Get the lowercase name used in records and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Succeeded | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// DEVICE TYPES
// ============================================================================

/// Severity classification of a device that may be bricked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrickType {
    None,
    Soft,
    Semi,
    Hard,
    Bootloop,
}

/// Raw signals observed while probing a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSignals {
    pub adb_reachable: bool,
    pub fastboot_reachable: bool,
    pub download_mode_signature: bool,
    pub edl_mode_signature: bool,
}

/// Snapshot of a device's brick state. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceBrickStatus {
    pub brick_type: BrickType,
    pub detected_mode: String,
    pub recoverable: bool,
    pub recommended_action: String,
    pub supported_methods: Vec<String>,
}

/// Interface a device can be reached through for connectivity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceInterface {
    Adb,
    Fastboot,
}

/// Target mode an unbrick request tries to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    Edl,
    Download,
    Dsu,
    Recovery,
    Bootloader,
}

impl DeviceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceMode::Edl => "edl",
            DeviceMode::Download => "download",
            DeviceMode::Dsu => "dsu",
            DeviceMode::Recovery => "recovery",
            DeviceMode::Bootloader => "bootloader",
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "edl" => Ok(DeviceMode::Edl),
            "download" => Ok(DeviceMode::Download),
            "dsu" => Ok(DeviceMode::Dsu),
            "recovery" => Ok(DeviceMode::Recovery),
            "bootloader" | "fastboot" => Ok(DeviceMode::Bootloader),
            _ => Err(format!("Unknown device mode: {}", s)),
        }
    }
}

/// How the orchestrator tries to push a device into a special mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnbrickMethod {
    Cable,
    ButtonCombo,
    AdbCommand,
    FastbootCommand,
}

impl fmt::Display for UnbrickMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnbrickMethod::Cable => write!(f, "cable"),
            UnbrickMethod::ButtonCombo => write!(f, "button_combo"),
            UnbrickMethod::AdbCommand => write!(f, "adb_command"),
            UnbrickMethod::FastbootCommand => write!(f, "fastboot_command"),
        }
    }
}

/// Signal level selected on a mode-entry cable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CableVoltage {
    #[serde(rename = "3.3V")]
    V3_3,
    #[serde(rename = "1.8V")]
    V1_8,
}

/// Parameters of a DIP-switch mode-entry cable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CableConfig {
    pub dip_switches: Vec<u8>,
    pub voltage: CableVoltage,
    pub resistance: String,
}

/// Physical button used in a mode-entry combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceButton {
    VolumeUp,
    VolumeDown,
    Power,
    Home,
}

impl fmt::Display for DeviceButton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceButton::VolumeUp => write!(f, "volume_up"),
            DeviceButton::VolumeDown => write!(f, "volume_down"),
            DeviceButton::Power => write!(f, "power"),
            DeviceButton::Home => write!(f, "home"),
        }
    }
}

/// Input to the device recovery engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnbrickRequest {
    pub device_mode: DeviceMode,
    pub method: UnbrickMethod,
    #[serde(default)]
    pub firmware_path: Option<PathBuf>,
    #[serde(default)]
    pub cable_config: Option<CableConfig>,
    #[serde(default)]
    pub button_combo: Option<Vec<DeviceButton>>,
    #[serde(default)]
    pub force_mode: bool,
}

impl UnbrickRequest {
    pub fn new(device_mode: DeviceMode, method: UnbrickMethod) -> Self {
        UnbrickRequest {
            device_mode,
            method,
            firmware_path: None,
            cable_config: None,
            button_combo: None,
            force_mode: false,
        }
    }

    pub fn with_firmware(mut self, path: impl Into<PathBuf>) -> Self {
        self.firmware_path = Some(path.into());
        self
    }
}

/// State a connected device reports over ADB/Fastboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Normal,
    Recovery,
    Fastboot,
    Locked,
    Unauthorized,
}

/// Identity and security posture of a connected device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub model: String,
    pub android_version: String,
    pub build_id: String,
    pub security_patch: String,
    pub kernel_version: String,
    pub bootloader: String,
    pub is_rooted: bool,
    pub bootloader_unlocked: bool,
    pub developer_mode_enabled: bool,
    pub device_state: DeviceState,
}

impl DeviceInfo {
    /// Placeholder info for a device reachable only in a limited state.
    pub fn limited(model: &str, bootloader: &str, device_state: DeviceState) -> Self {
        DeviceInfo {
            model: model.to_string(),
            android_version: "N/A".to_string(),
            build_id: "N/A".to_string(),
            security_patch: "N/A".to_string(),
            kernel_version: "N/A".to_string(),
            bootloader: bootloader.to_string(),
            is_rooted: false,
            bootloader_unlocked: false,
            developer_mode_enabled: false,
            device_state,
        }
    }
}

/// Runtime kernel tunables applied over a root shell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelTweakParams {
    pub cpu_governor: Option<String>,
    pub io_scheduler: Option<String>,
    pub tcp_congestion: Option<String>,
}

// ============================================================================
// BUILD CONFIGURATION
// ============================================================================

/// Build-script phases the user asked to skip. Each maps 1:1 to a command flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkipOptions {
    pub skip_env_setup: bool,
    pub skip_clone: bool,
    pub skip_patches: bool,
    pub skip_config_tweaks: bool,
    pub skip_build: bool,
    pub clean_output: bool,
}

/// Kernel feature toggles understood by the customizer script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelFeatures {
    // NetHunter core
    pub wifi_monitor_mode: bool,
    pub usb_gadget: bool,
    pub hid_support: bool,
    pub rtl8812au_driver: bool,

    // Advanced NetHunter
    pub packet_injection: bool,
    pub bad_usb: bool,
    pub wireless_keylogger: bool,
    pub bluetooth_arsenal: bool,
    pub nfc_hacking: bool,
    pub sdr_support: bool,
    pub rf_analyzer: bool,

    // Wireless drivers
    pub rtl88xxau_driver: bool,
    pub rt2800usb_driver: bool,
    pub rt73usb_driver: bool,
    pub zd1211rw_driver: bool,
    pub ath9k_htc_driver: bool,

    // Root & security
    pub kernel_su: bool,
    pub magisk_integration: bool,
    pub selinux_permissive: bool,
    pub dm_verity_disable: bool,

    // Performance & debugging
    pub kprobe_support: bool,
    pub ftracing_support: bool,
    pub perf_counters: bool,
    pub cpu_governors: bool,

    // Custom recovery
    pub twrp_support: bool,
    pub recovery_ramdisk: bool,
}

impl Default for KernelFeatures {
    fn default() -> Self {
        KernelFeatures {
            wifi_monitor_mode: true,
            usb_gadget: true,
            hid_support: true,
            rtl8812au_driver: false,
            packet_injection: false,
            bad_usb: false,
            wireless_keylogger: false,
            bluetooth_arsenal: false,
            nfc_hacking: false,
            sdr_support: false,
            rf_analyzer: false,
            rtl88xxau_driver: false,
            rt2800usb_driver: false,
            rt73usb_driver: false,
            zd1211rw_driver: false,
            ath9k_htc_driver: false,
            kernel_su: false,
            magisk_integration: false,
            selinux_permissive: false,
            dm_verity_disable: false,
            kprobe_support: false,
            ftracing_support: false,
            perf_counters: false,
            cpu_governors: false,
            twrp_support: false,
            recovery_ramdisk: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MagiskConfig {
    pub enabled: bool,
    pub version: String,
    pub hide_root: bool,
    pub zygisk_enabled: bool,
    pub deny_list_enabled: bool,
    pub modules: Vec<String>,
}

impl Default for MagiskConfig {
    fn default() -> Self {
        MagiskConfig {
            enabled: false,
            version: "latest".to_string(),
            hide_root: true,
            zygisk_enabled: true,
            deny_list_enabled: true,
            modules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwrpConfig {
    pub enabled: bool,
    pub version: String,
    pub theme: String,
    pub encryption: bool,
    pub touch_support: bool,
    pub custom_flags: Vec<String>,
}

impl Default for TwrpConfig {
    fn default() -> Self {
        TwrpConfig {
            enabled: false,
            version: "latest".to_string(),
            theme: "portrait_hdpi".to_string(),
            encryption: true,
            touch_support: true,
            custom_flags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelSuConfig {
    pub enabled: bool,
    pub version: String,
    pub manager_app: bool,
    pub web_ui: bool,
    pub safe_mode: bool,
    pub log_level: String,
}

impl Default for KernelSuConfig {
    fn default() -> Self {
        KernelSuConfig {
            enabled: false,
            version: "latest".to_string(),
            manager_app: true,
            web_ui: false,
            safe_mode: true,
            log_level: "info".to_string(),
        }
    }
}

/// A stored kernel build configuration.
///
/// The serde field names are the customizer script's input format, so the same
/// struct is written verbatim to the transient build-input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfiguration {
    pub id: u64,
    pub name: String,
    pub device: String,
    pub codename: String,
    pub kernel_repo: String,
    pub kernel_branch: String,
    pub nethunter_patches_repo: String,
    pub nethunter_patches_branch: String,
    pub nethunter_patches_dir_relative: String,
    pub git_patch_level: String,
    pub output_dir: String,
    pub defconfig_filename_template: String,
    pub kernel_arch: String,
    pub kernel_cross_compile: String,
    pub kernel_image_name_patterns: Vec<String>,
    pub features: KernelFeatures,
    pub custom_kernel_configs: Vec<String>,
    pub wsl_distro_name: String,
    pub skip_options: SkipOptions,
    pub magisk_config: MagiskConfig,
    pub twrp_config: TwrpConfig,
    pub kernelsu_config: KernelSuConfig,
}

impl Default for KernelConfiguration {
    fn default() -> Self {
        KernelConfiguration {
            id: 0,
            name: String::new(),
            device: String::new(),
            codename: String::new(),
            kernel_repo: String::new(),
            kernel_branch: String::new(),
            nethunter_patches_repo: String::new(),
            nethunter_patches_branch: String::new(),
            nethunter_patches_dir_relative: String::new(),
            git_patch_level: "1".to_string(),
            output_dir: String::new(),
            defconfig_filename_template: "arch/arm64/configs/{codename}_defconfig".to_string(),
            kernel_arch: "arm64".to_string(),
            kernel_cross_compile: "aarch64-linux-gnu-".to_string(),
            kernel_image_name_patterns: vec![
                "Image.gz-dtb".to_string(),
                "Image.gz".to_string(),
                "Image".to_string(),
            ],
            features: KernelFeatures::default(),
            custom_kernel_configs: Vec::new(),
            wsl_distro_name: "kali-linux".to_string(),
            skip_options: SkipOptions::default(),
            magisk_config: MagiskConfig::default(),
            twrp_config: TwrpConfig::default(),
            kernelsu_config: KernelSuConfig::default(),
        }
    }
}

// ============================================================================
// TWRP BUILD TYPES
// ============================================================================

/// Recovery features compiled into a TWRP image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TwrpFeatures {
    pub encryption: bool,
    pub mtp: bool,
    pub adb: bool,
    pub terminal: bool,
    pub fastboot: bool,
    pub magisk: bool,
    pub backup: bool,
    pub custom_commands: bool,
}

impl Default for TwrpFeatures {
    fn default() -> Self {
        TwrpFeatures {
            encryption: true,
            mtp: true,
            adb: true,
            terminal: true,
            fastboot: true,
            magisk: false,
            backup: true,
            custom_commands: false,
        }
    }
}

/// Input to a TWRP recovery image build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwrpBuildConfig {
    pub device_codename: String,
    pub theme: String,
    pub version: String,
    pub color_scheme: String,
    #[serde(default)]
    pub build_name: Option<String>,
    #[serde(default)]
    pub features: TwrpFeatures,
    #[serde(default)]
    pub custom_flags: Vec<String>,
}

impl TwrpBuildConfig {
    pub fn new(device_codename: impl Into<String>, version: impl Into<String>) -> Self {
        TwrpBuildConfig {
            device_codename: device_codename.into(),
            theme: "portrait_hdpi".to_string(),
            version: version.into(),
            color_scheme: "default".to_string(),
            build_name: None,
            features: TwrpFeatures::default(),
            custom_flags: Vec::new(),
        }
    }
}

/// A TWRP build as seen by hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwrpBuildJob {
    /// Same as the id of the operation driving the build
    pub id: String,
    pub config: TwrpBuildConfig,
    pub status: OperationStatus,
    pub current_step: String,
    pub progress: u8,
    pub logs: String,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output_files: Vec<String>,
}

/// Result of probing the host for Windows Subsystem for Linux.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WslStatus {
    pub available: bool,
    pub distros: Vec<String>,
    pub message: String,
}

/// A persisted build job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: u64,
    pub configuration_id: u64,
    pub operation_id: Option<String>,
    pub status: OperationStatus,
    pub current_step: String,
    pub progress: u8,
    pub logs: String,
    pub error_message: Option<String>,
    pub output_files: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl BuildRecord {
    /// A fresh record in `Pending`.
    pub fn new(id: u64, configuration_id: u64) -> Self {
        BuildRecord {
            id,
            configuration_id,
            operation_id: None,
            status: OperationStatus::Pending,
            current_step: String::new(),
            progress: 0,
            logs: String::new(),
            error_message: None,
            output_files: Vec::new(),
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Partial update of a build record. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildRecordUpdate {
    pub operation_id: Option<String>,
    pub status: Option<OperationStatus>,
    pub current_step: Option<String>,
    pub progress: Option<u8>,
    pub append_logs: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BuildRecordUpdate {
    pub fn status(status: OperationStatus) -> Self {
        BuildRecordUpdate {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn apply(self, record: &mut BuildRecord) {
        if let Some(id) = self.operation_id {
            record.operation_id = Some(id);
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(step) = self.current_step {
            record.current_step = step;
        }
        if let Some(progress) = self.progress {
            record.progress = progress.min(100);
        }
        if let Some(logs) = self.append_logs {
            record.logs.push_str(&logs);
        }
        if let Some(message) = self.error_message {
            record.error_message = Some(message);
        }
        if let Some(at) = self.started_at {
            record.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            record.completed_at = Some(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_mode_from_str() {
        assert_eq!("EDL".parse::<DeviceMode>(), Ok(DeviceMode::Edl));
        assert_eq!("fastboot".parse::<DeviceMode>(), Ok(DeviceMode::Bootloader));
        assert!("odin".parse::<DeviceMode>().is_err());
    }

    #[test]
    fn test_unbrick_request_wire_names() {
        let json = r#"{
            "deviceMode": "edl",
            "method": "button_combo",
            "buttonCombo": ["volume_up", "volume_down", "power"]
        }"#;
        let request: UnbrickRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.device_mode, DeviceMode::Edl);
        assert_eq!(request.method, UnbrickMethod::ButtonCombo);
        assert_eq!(request.button_combo.map(|c| c.len()), Some(3));
        assert!(!request.force_mode);
    }

    #[test]
    fn test_cable_voltage_serialization() {
        let cfg = CableConfig {
            dip_switches: vec![1, 2],
            voltage: CableVoltage::V1_8,
            resistance: "910k".to_string(),
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"1.8V\""));
        assert!(json.contains("dipSwitches"));
    }

    #[test]
    fn test_status_terminality() {
        assert!(!OperationStatus::Pending.is_terminal());
        assert!(!OperationStatus::Running.is_terminal());
        assert!(OperationStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_record_update_applies_only_set_fields() {
        let mut record = BuildRecord::new(1, 9);
        record.current_step = "Cloning repositories".to_string();

        BuildRecordUpdate {
            progress: Some(40),
            append_logs: Some("line\n".to_string()),
            ..Default::default()
        }
        .apply(&mut record);

        assert_eq!(record.progress, 40);
        assert_eq!(record.current_step, "Cloning repositories");
        assert_eq!(record.logs, "line\n");
        assert_eq!(record.status, OperationStatus::Pending);
    }

    #[test]
    fn test_twrp_config_wire_names() {
        let json = r#"{
            "deviceCodename": "beryllium",
            "theme": "landscape_hdpi",
            "version": "3.7.0",
            "colorScheme": "dark",
            "features": { "magisk": true, "customCommands": true }
        }"#;
        let config: TwrpBuildConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.device_codename, "beryllium");
        assert!(config.features.magisk);
        assert!(config.features.custom_commands);
        // Unlisted features keep their defaults
        assert!(config.features.mtp);
        assert!(config.build_name.is_none());
    }

    #[test]
    fn test_configuration_defaults_match_tool_defaults() {
        let cfg = KernelConfiguration::default();
        assert_eq!(cfg.kernel_arch, "arm64");
        assert_eq!(cfg.wsl_distro_name, "kali-linux");
        assert!(cfg.features.wifi_monitor_mode);
        assert!(!cfg.features.rtl8812au_driver);
    }
}
