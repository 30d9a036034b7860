//! Shared fixtures: fake adb/fastboot/python/lsusb scripts that record how
//! they were invoked.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use droidforge::{
    DelaySettings, ForgeSettings, InMemoryBuildStore, KernelConfiguration, Orchestrator,
    ProgressEvent, ProgressSubscription, UsbProbeBackend,
};
use tempfile::TempDir;

/// Write an executable `/bin/sh` script.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("Failed to write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("Failed to chmod script");
    path
}

/// Lines appended by the fake tools to `calls.log`.
pub fn calls(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

pub fn count_calls(dir: &Path, call: &str) -> usize {
    calls(dir).iter().filter(|line| line.as_str() == call).count()
}

/// Device reachable over adb (and optionally fastboot), with a USB listing.
pub struct FakeDevice {
    pub adb_devices: &'static str,
    pub fastboot_devices: &'static str,
    pub get_state: &'static str,
    pub usb_listing: &'static str,
}

impl Default for FakeDevice {
    fn default() -> Self {
        FakeDevice {
            adb_devices: "List of devices attached\\nR58M12ABCDE\\tdevice\\n",
            fastboot_devices: "",
            get_state: "device",
            usb_listing: "Bus 001 Device 002: ID 1d6b:0002 Linux Foundation 2.0 root hub",
        }
    }
}

/// Install fake tools into `dir` and return settings pointing at them.
pub fn device_settings(dir: &Path, device: &FakeDevice) -> ForgeSettings {
    let log = dir.join("calls.log");
    let log = log.display();

    let adb = write_script(
        dir,
        "adb",
        &format!(
            r#"echo "adb $*" >> "{log}"
case "$1" in
  devices) printf '{devices}' ;;
  get-state) echo "{state}" ;;
esac
exit 0"#,
            log = log,
            devices = device.adb_devices,
            state = device.get_state,
        ),
    );
    let fastboot = write_script(
        dir,
        "fastboot",
        &format!(
            r#"echo "fastboot $*" >> "{log}"
case "$1" in
  devices) printf '{devices}' ;;
esac
exit 0"#,
            log = log,
            devices = device.fastboot_devices,
        ),
    );
    let probe = write_script(
        dir,
        "usbprobe",
        &format!(
            r#"echo "probe" >> "{log}"
echo "{listing}""#,
            log = log,
            listing = device.usb_listing,
        ),
    );

    ForgeSettings {
        adb_path: adb.display().to_string(),
        fastboot_path: fastboot.display().to_string(),
        work_dir: dir.to_path_buf(),
        tools_dir: dir.join("tools"),
        output_dir: dir.join("output"),
        log_dir: dir.join("logs"),
        max_concurrent_operations: 4,
        kill_grace_ms: 500,
        usb_probe: UsbProbeBackend::Custom {
            program: probe.display().to_string(),
            args: Vec::new(),
        },
        delays: DelaySettings::immediate(),
        ..Default::default()
    }
}

/// Settings whose "python" is the given build script body.
pub fn build_settings(dir: &Path, body: &str) -> ForgeSettings {
    let python = write_script(dir, "fake_python", body);
    ForgeSettings {
        python_path: python.display().to_string(),
        build_script: dir.join("kernel_customizer.py"),
        work_dir: dir.to_path_buf(),
        output_dir: dir.join("output"),
        log_dir: dir.join("logs"),
        max_concurrent_operations: 2,
        kill_grace_ms: 500,
        usb_probe: UsbProbeBackend::Disabled,
        delays: DelaySettings::immediate(),
        ..Default::default()
    }
}

pub fn valid_configuration() -> KernelConfiguration {
    KernelConfiguration {
        name: "Pixel NetHunter".to_string(),
        device: "Google Pixel 6".to_string(),
        codename: "oriole".to_string(),
        kernel_repo: "https://android.googlesource.com/kernel/gs".to_string(),
        kernel_branch: "android-gs-raviole-5.10-android13".to_string(),
        output_dir: "out".to_string(),
        custom_kernel_configs: vec!["CONFIG_USB_ACM=y".to_string()],
        ..Default::default()
    }
}

pub struct BuildHarness {
    pub dir: TempDir,
    pub store: Arc<InMemoryBuildStore>,
    pub orchestrator: Orchestrator,
    pub configuration_id: u64,
}

/// Orchestrator with one stored configuration and `body` as the build tool.
pub fn build_harness(body: impl Fn(&Path) -> String) -> BuildHarness {
    build_harness_with(body, |settings| settings)
}

pub fn build_harness_with(
    body: impl Fn(&Path) -> String,
    tune: impl FnOnce(ForgeSettings) -> ForgeSettings,
) -> BuildHarness {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let settings = tune(build_settings(dir.path(), &body(dir.path())));
    let store = Arc::new(InMemoryBuildStore::new());
    let configuration_id = store.insert_configuration(valid_configuration());
    let orchestrator = Orchestrator::new(settings, store.clone());
    BuildHarness {
        dir,
        store,
        orchestrator,
        configuration_id,
    }
}

/// Collect events for `operation_id` through the terminal one, with a safety timeout.
pub async fn collect_until_terminal(events: &mut ProgressSubscription, operation_id: &str) -> Vec<ProgressEvent> {
    tokio::time::timeout(Duration::from_secs(30), events.until_terminal(operation_id))
        .await
        .expect("Timed out waiting for terminal event")
}

/// Events for `operation_id` that arrive within `window` after the terminal one.
pub async fn late_events(events: &mut ProgressSubscription, operation_id: &str, window: Duration) -> Vec<ProgressEvent> {
    let mut late = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(window, events.recv()).await {
        if event.operation_id == operation_id {
            late.push(event);
        }
    }
    late
}
