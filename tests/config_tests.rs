//! Integration tests for the config module
//!
//! Covers settings files as a host would write them by hand, and the checks
//! stored build configurations go through before a build is spawned.

use droidforge::config::{loader, validator};
use droidforge::error::ConfigError;
use droidforge::{ForgeSettings, KernelConfiguration, UsbProbeBackend};
use std::fs;
use tempfile::TempDir;

fn create_test_configuration() -> KernelConfiguration {
    KernelConfiguration {
        name: "Poco F1 NetHunter".to_string(),
        device: "Xiaomi Poco F1".to_string(),
        codename: "beryllium".to_string(),
        kernel_repo: "https://github.com/LineageOS/android_kernel_xiaomi_sdm845".to_string(),
        kernel_branch: "lineage-21".to_string(),
        output_dir: "out/beryllium".to_string(),
        custom_kernel_configs: vec![
            "CONFIG_USB_ACM=y".to_string(),
            "# CONFIG_WLAN_VENDOR_ATH is not set".to_string(),
        ],
        ..Default::default()
    }
}

// ============================================================================
// Settings files
// ============================================================================

#[test]
fn test_load_handwritten_toml() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("settings.toml");
    fs::write(
        &path,
        r#"
adb_path = "/opt/platform-tools/adb"
fastboot_path = "/opt/platform-tools/fastboot"
max_concurrent_operations = 2
operation_timeout_secs = 7200
usb_probe = { custom = { program = "usb-devices", args = ["-v"] } }

[delays]
edl_stage_ms = 500
"#,
    )?;

    let settings = loader::load_settings_from_file(&path)?;
    assert_eq!(settings.adb_path, "/opt/platform-tools/adb");
    assert_eq!(settings.max_concurrent_operations, 2);
    assert_eq!(settings.operation_timeout_secs, Some(7200));
    assert_eq!(
        settings.usb_probe,
        UsbProbeBackend::Custom {
            program: "usb-devices".to_string(),
            args: vec!["-v".to_string()],
        }
    );
    assert_eq!(settings.delays.edl_stage_ms, 500);
    // Unlisted delays keep their defaults
    assert_eq!(settings.delays.download_stage_ms, 4_000);
    Ok(())
}

#[test]
fn test_load_handwritten_json() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("settings.json");
    fs::write(
        &path,
        r#"{
  "python_path": "C:\\Python312\\python.exe",
  "usb_probe": "disabled",
  "kill_grace_ms": 250
}"#,
    )?;

    let settings = loader::load_settings_from_file(&path)?;
    assert_eq!(settings.python_path, "C:\\Python312\\python.exe");
    assert_eq!(settings.usb_probe, UsbProbeBackend::Disabled);
    assert_eq!(settings.usb_probe.command(), None);
    assert_eq!(settings.kill_grace().as_millis(), 250);
    Ok(())
}

#[test]
fn test_invalid_toml_is_reported() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("settings.toml");
    fs::write(&path, "adb_path = [unterminated")?;

    let result = loader::load_settings_from_file(&path);
    assert!(matches!(result, Err(ConfigError::InvalidToml(_))));
    Ok(())
}

#[test]
fn test_zero_timeout_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("settings.json");
    fs::write(&path, r#"{ "operation_timeout_secs": 0 }"#)?;

    let result = loader::load_settings_from_file(&path);
    assert!(matches!(result, Err(ConfigError::ValidationFailed(_))));
    Ok(())
}

#[test]
fn test_save_creates_parent_directories() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("a/b/c/settings.toml");

    let mut settings = ForgeSettings::default();
    settings.broadcast_capacity = 64;
    loader::save_settings_to_file(&settings, &path)?;

    assert!(path.exists());
    let loaded = loader::load_settings_from_file(&path)?;
    assert_eq!(loaded, settings);
    Ok(())
}

#[test]
fn test_missing_settings_fall_back_to_defaults() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("settings.json");

    let settings = loader::load_settings_or_default(&path)?;
    assert_eq!(settings, ForgeSettings::default());

    // An existing but broken file is an error, not a silent fallback
    fs::write(&path, r#"{ "max_concurrent_operations": "many" }"#)?;
    assert!(matches!(
        loader::load_settings_or_default(&path),
        Err(ConfigError::InvalidJson(_))
    ));
    Ok(())
}

#[test]
fn test_global_path_is_namespaced()-> Result<(), Box<dyn std::error::Error>> {
    // Headless CI boxes may have no config dir at all
    if let Ok(path) = loader::get_global_settings_path() {
        assert!(path.ends_with("droidforge/settings.json"));
    }
    Ok(())
}

#[test]
fn test_ensure_directories() -> Result<(), Box<dyn std::error::Error>> {
    let temp_dir = TempDir::new()?;
    let settings = ForgeSettings {
        work_dir: temp_dir.path().join("work"),
        tools_dir: temp_dir.path().join("tools"),
        output_dir: temp_dir.path().join("output"),
        ..Default::default()
    };

    settings.ensure_directories()?;
    assert!(settings.work_dir.is_dir());
    assert!(settings.tools_dir.is_dir());
    assert!(settings.output_dir.is_dir());
    Ok(())
}

// ============================================================================
// Kernel build configurations
// ============================================================================

#[test]
fn test_valid_configuration_passes() {
    assert!(validator::validate_kernel_configuration(&create_test_configuration()).is_ok());
}

#[test]
fn test_each_required_field_is_enforced() {
    let blanks: [fn(&mut KernelConfiguration); 5] = [
        |c| c.device.clear(),
        |c| c.codename.clear(),
        |c| c.kernel_repo.clear(),
        |c| c.kernel_branch.clear(),
        |c| c.output_dir = "   ".to_string(),
    ];

    for blank in blanks {
        let mut config = create_test_configuration();
        blank(&mut config);
        let result = validator::validate_kernel_configuration(&config);
        assert!(
            matches!(result, Err(ConfigError::ValidationFailed(ref msg)) if msg.contains("is required")),
            "expected required-field error, got {:?}",
            result
        );
    }
}

#[test]
fn test_non_numeric_patch_level_rejected() {
    let mut config = create_test_configuration();
    config.git_patch_level = "two".to_string();
    assert!(validator::validate_kernel_configuration(&config).is_err());
}

#[test]
fn test_malformed_kconfig_line_rejected() {
    let mut config = create_test_configuration();
    config.custom_kernel_configs.push("USB_ACM=y".to_string());
    let err = validator::validate_kernel_configuration(&config).unwrap_err();
    assert!(err.to_string().contains("USB_ACM=y"));
}

#[test]
fn test_configuration_from_host_json() -> Result<(), Box<dyn std::error::Error>> {
    // Hosts store the script's input format; absent keys fall back to defaults
    let config: KernelConfiguration = serde_json::from_str(
        r#"{
  "id": 7,
  "name": "Pixel 6",
  "device": "Google Pixel 6",
  "codename": "oriole",
  "kernel_repo": "https://android.googlesource.com/kernel/gs",
  "kernel_branch": "android-gs-raviole-5.10-android13",
  "output_dir": "out"
}"#,
    )?;

    assert_eq!(config.id, 7);
    assert_eq!(config.kernel_arch, "arm64");
    assert_eq!(config.wsl_distro_name, "kali-linux");
    validator::validate_kernel_configuration(&config)?;
    Ok(())
}
