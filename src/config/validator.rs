//! Settings and build configuration validation.

use crate::config::{ForgeSettings, UsbProbeBackend};
use crate::error::ConfigError;
use crate::models::{KernelConfiguration, TwrpBuildConfig};
use once_cell::sync::Lazy;
use regex::Regex;

static KCONFIG_LINE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^(# )?CONFIG_[A-Z0-9_]+(=.+| is not set)$").ok());

/// Codenames and versions end up in artifact file names.
static ARTIFACT_TOKEN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").ok());

/// Smallest broadcast ring that still absorbs a burst of build output.
const MIN_BROADCAST_CAPACITY: usize = 16;

/// Validate host settings.
pub fn validate_settings(settings: &ForgeSettings) -> Result<(), ConfigError> {
    for (name, value) in [
        ("adb_path", &settings.adb_path),
        ("fastboot_path", &settings.fastboot_path),
        ("python_path", &settings.python_path),
        ("wsl_path", &settings.wsl_path),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(format!(
                "{} cannot be empty",
                name
            )));
        }
    }

    if settings.build_script.as_os_str().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "build_script cannot be empty".to_string(),
        ));
    }

    if settings.max_concurrent_operations == 0 {
        return Err(ConfigError::ValidationFailed(
            "max_concurrent_operations must be at least 1".to_string(),
        ));
    }

    if settings.broadcast_capacity < MIN_BROADCAST_CAPACITY {
        return Err(ConfigError::ValidationFailed(format!(
            "broadcast_capacity must be at least {}, got {}",
            MIN_BROADCAST_CAPACITY, settings.broadcast_capacity
        )));
    }

    if settings.operation_timeout_secs == Some(0) {
        return Err(ConfigError::ValidationFailed(
            "operation_timeout_secs must be positive when set".to_string(),
        ));
    }

    if let UsbProbeBackend::Custom { program, .. } = &settings.usb_probe {
        if program.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "Custom USB probe program cannot be empty".to_string(),
            ));
        }
    }

    Ok(())
}

/// Validate a stored kernel configuration before it is handed to the build script.
///
/// Mirrors the keys the customizer script reads unconditionally.
pub fn validate_kernel_configuration(config: &KernelConfiguration) -> Result<(), ConfigError> {
    let required = [
        ("device", &config.device),
        ("codename", &config.codename),
        ("kernel_repo", &config.kernel_repo),
        ("kernel_branch", &config.kernel_branch),
        ("output_dir", &config.output_dir),
        ("defconfig_filename_template", &config.defconfig_filename_template),
        ("wsl_distro_name", &config.wsl_distro_name),
    ];
    for (name, value) in required {
        if value.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(format!(
                "Configuration field '{}' is required",
                name
            )));
        }
    }

    if config.git_patch_level.parse::<u32>().is_err() {
        return Err(ConfigError::ValidationFailed(format!(
            "git_patch_level must be a number, got: {}",
            config.git_patch_level
        )));
    }

    if config.kernel_image_name_patterns.is_empty() {
        return Err(ConfigError::ValidationFailed(
            "At least one kernel image name pattern is required".to_string(),
        ));
    }

    let matcher = KCONFIG_LINE.as_ref().ok_or_else(|| {
        ConfigError::ValidationFailed("Failed to compile kconfig validation regex".to_string())
    })?;
    for line in &config.custom_kernel_configs {
        if !matcher.is_match(line.trim()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Custom kernel config entry is not a CONFIG_ line: {}",
                line
            )));
        }
    }

    Ok(())
}

/// Validate a TWRP build request before it is queued.
pub fn validate_twrp_config(config: &TwrpBuildConfig) -> Result<(), ConfigError> {
    let token = ARTIFACT_TOKEN.as_ref().ok_or_else(|| {
        ConfigError::ValidationFailed("Failed to compile artifact name regex".to_string())
    })?;

    for (name, value) in [
        ("deviceCodename", &config.device_codename),
        ("version", &config.version),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(format!(
                "TWRP field '{}' is required",
                name
            )));
        }
        if !token.is_match(value) {
            return Err(ConfigError::ValidationFailed(format!(
                "TWRP field '{}' may only contain letters, digits, '.', '_' and '-', got: {}",
                name, value
            )));
        }
    }

    if config.theme.trim().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "TWRP field 'theme' is required".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_configuration() -> KernelConfiguration {
        KernelConfiguration {
            id: 1,
            name: "Nord".to_string(),
            device: "oneplus_nord".to_string(),
            codename: "avicii".to_string(),
            kernel_repo: "https://github.com/OnePlusOSS/android_kernel_oneplus_sm7250.git"
                .to_string(),
            kernel_branch: "android-10.0".to_string(),
            output_dir: "/tmp/out".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_settings_validate() {
        assert!(validate_settings(&ForgeSettings::default()).is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut settings = ForgeSettings::default();
        settings.max_concurrent_operations = 0;
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn test_small_broadcast_capacity_rejected() {
        let mut settings = ForgeSettings::default();
        settings.broadcast_capacity = 4;
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn test_empty_tool_path_rejected() {
        let mut settings = ForgeSettings::default();
        settings.adb_path = "  ".to_string();
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn test_valid_configuration() {
        assert!(validate_kernel_configuration(&valid_configuration()).is_ok());
    }

    #[test]
    fn test_missing_codename_rejected() {
        let mut config = valid_configuration();
        config.codename.clear();
        let err = validate_kernel_configuration(&config).unwrap_err();
        assert!(err.to_string().contains("codename"));
    }

    #[test]
    fn test_custom_kernel_configs() {
        let mut config = valid_configuration();
        config.custom_kernel_configs = vec![
            "CONFIG_USB_NET_RNDIS_HOST=y".to_string(),
            "# CONFIG_MODULE_SIG is not set".to_string(),
        ];
        assert!(validate_kernel_configuration(&config).is_ok());

        config.custom_kernel_configs.push("rm -rf /".to_string());
        assert!(validate_kernel_configuration(&config).is_err());
    }

    #[test]
    fn test_patch_level_must_be_numeric() {
        let mut config = valid_configuration();
        config.git_patch_level = "one".to_string();
        assert!(validate_kernel_configuration(&config).is_err());
    }

    #[test]
    fn test_twrp_config_tokens() {
        assert!(validate_twrp_config(&TwrpBuildConfig::new("beryllium", "3.7.0_9-0")).is_ok());
        assert!(validate_twrp_config(&TwrpBuildConfig::new("", "3.7.0")).is_err());

        let err = validate_twrp_config(&TwrpBuildConfig::new("../beryllium", "3.7.0")).unwrap_err();
        assert!(err.to_string().contains("deviceCodename"));

        let mut config = TwrpBuildConfig::new("beryllium", "3.7.0");
        config.theme = " ".to_string();
        assert!(validate_twrp_config(&config).is_err());
    }
}
