//! Configuration module for the orchestrator host.
//!
//! # Module Structure
//!
//! - `loader`: Loads and saves `ForgeSettings` as JSON or TOML
//! - `validator`: Validates settings and stored kernel build configurations
//!
//! Settings are read once at startup and shared as `Arc<ForgeSettings>` by every
//! component; nothing mutates them afterwards.

pub mod loader;
pub mod validator;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Backend used to enumerate USB devices when probing EDL/Download signatures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsbProbeBackend {
    /// `wmic` on Windows, `lsusb` everywhere else
    Auto,
    Lsusb,
    Wmic,
    /// Any command whose output lists `vid:pid` pairs
    Custom { program: String, args: Vec<String> },
    /// Hardware signature detection off; EDL/Download are never detected
    Disabled,
}

impl UsbProbeBackend {
    /// Resolve to a concrete command line, or `None` when probing is disabled.
    pub fn command(&self) -> Option<(String, Vec<String>)> {
        match self {
            UsbProbeBackend::Auto => {
                if cfg!(windows) {
                    UsbProbeBackend::Wmic.command()
                } else {
                    UsbProbeBackend::Lsusb.command()
                }
            }
            UsbProbeBackend::Lsusb => Some(("lsusb".to_string(), Vec::new())),
            UsbProbeBackend::Wmic => Some((
                "wmic".to_string(),
                vec![
                    "path".to_string(),
                    "Win32_USBControllerDevice".to_string(),
                    "get".to_string(),
                    "Dependent".to_string(),
                ],
            )),
            UsbProbeBackend::Custom { program, args } => Some((program.clone(), args.clone())),
            UsbProbeBackend::Disabled => None,
        }
    }
}

/// Fixed waits used by device procedures, in milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelaySettings {
    /// Wait after presenting the cable checklist
    pub cable_settle_ms: u64,
    /// Wait after presenting the button combination
    pub button_settle_ms: u64,
    /// Wait after a direct adb/fastboot reboot command
    pub command_settle_ms: u64,
    /// Wait for fastboot after `adb reboot bootloader`
    pub bootloader_reboot_ms: u64,
    /// Wait for recovery after `adb reboot recovery`
    pub recovery_reboot_ms: u64,
    pub edl_stage_ms: u64,
    pub download_stage_ms: u64,
    /// Scale for the nominal TWRP stage durations; 100 is real time, 0 skips them
    pub twrp_stage_percent: u64,
}

impl Default for DelaySettings {
    fn default() -> Self {
        DelaySettings {
            cable_settle_ms: 5_000,
            button_settle_ms: 10_000,
            command_settle_ms: 5_000,
            bootloader_reboot_ms: 5_000,
            recovery_reboot_ms: 10_000,
            edl_stage_ms: 3_000,
            download_stage_ms: 4_000,
            twrp_stage_percent: 100,
        }
    }
}

impl DelaySettings {
    /// All waits disabled. Used by hosts that drive devices interactively and by tests.
    pub fn immediate() -> Self {
        DelaySettings {
            cable_settle_ms: 0,
            button_settle_ms: 0,
            command_settle_ms: 0,
            bootloader_reboot_ms: 0,
            recovery_reboot_ms: 0,
            edl_stage_ms: 0,
            download_stage_ms: 0,
            twrp_stage_percent: 0,
        }
    }
}

/// Host-level settings for the orchestrator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeSettings {
    // External tools
    pub adb_path: String,
    pub fastboot_path: String,
    pub python_path: String,
    pub build_script: PathBuf,
    /// Windows Subsystem for Linux launcher probed before builds
    pub wsl_path: String,

    // Directories
    /// Where transient build-input files are created
    pub work_dir: PathBuf,
    pub tools_dir: PathBuf,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,

    // Concurrency
    pub max_concurrent_operations: usize,
    pub broadcast_capacity: usize,
    /// Upper bound on a whole operation; `None` waits forever
    pub operation_timeout_secs: Option<u64>,
    /// Time between SIGTERM and SIGKILL when terminating a child
    pub kill_grace_ms: u64,

    // Device probing
    pub usb_probe: UsbProbeBackend,
    pub delays: DelaySettings,
}

impl Default for ForgeSettings {
    fn default() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        ForgeSettings {
            adb_path: if cfg!(windows) { "adb.exe" } else { "adb" }.to_string(),
            fastboot_path: if cfg!(windows) { "fastboot.exe" } else { "fastboot" }.to_string(),
            python_path: "python3".to_string(),
            build_script: cwd.join("kernel_customizer.py"),
            wsl_path: if cfg!(windows) { "wsl.exe" } else { "wsl" }.to_string(),
            work_dir: cwd.clone(),
            tools_dir: cwd.join("tools"),
            output_dir: cwd.join("output"),
            log_dir: cwd.join("logs"),
            max_concurrent_operations: num_cpus::get().max(1),
            broadcast_capacity: 1024,
            operation_timeout_secs: None,
            kill_grace_ms: 5_000,
            usb_probe: UsbProbeBackend::Auto,
            delays: DelaySettings::default(),
        }
    }
}

impl ForgeSettings {
    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_secs.map(Duration::from_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Create the tool and output directories if missing.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.tools_dir)?;
        std::fs::create_dir_all(&self.output_dir)?;
        std::fs::create_dir_all(&self.work_dir)?;
        Ok(())
    }
}
