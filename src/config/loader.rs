//! Settings file loader and serialization.

use crate::config::validator::validate_settings;
use crate::config::ForgeSettings;
use crate::error::ConfigError;
use std::fs;
use std::path::{Path, PathBuf};

/// Get the global settings path: <config dir>/droidforge/settings.json
pub fn get_global_settings_path() -> Result<PathBuf, ConfigError> {
    let config_dir = dirs::config_dir().ok_or_else(|| {
        ConfigError::ValidationFailed("Cannot determine config directory".to_string())
    })?;

    Ok(config_dir.join("droidforge").join("settings.json"))
}

/// On-disk encodings accepted for settings files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SettingsFormat {
    Json,
    Toml,
}

/// Pick the encoding from the file extension (.json or .toml required).
fn settings_format(path: &Path) -> Result<SettingsFormat, ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "Settings path cannot be empty".to_string(),
        ));
    }

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Ok(SettingsFormat::Json),
        Some("toml") => Ok(SettingsFormat::Toml),
        Some(ext) => Err(ConfigError::ValidationFailed(format!(
            "Settings file must have .json or .toml extension, got .{}",
            ext
        ))),
        None => Err(ConfigError::ValidationFailed(
            "Settings file must have .json or .toml extension".to_string(),
        )),
    }
}

/// Load and validate settings from a JSON or TOML file.
pub fn load_settings_from_file(path: &Path) -> Result<ForgeSettings, ConfigError> {
    let format = settings_format(path)?;

    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound(format!("Settings file not found at: {}", path.display()))
        } else {
            ConfigError::IoError(e)
        }
    })?;

    let settings: ForgeSettings = match format {
        SettingsFormat::Json => serde_json::from_str(&content)?,
        SettingsFormat::Toml => toml::from_str(&content)?,
    };

    validate_settings(&settings)?;
    log::debug!("[Config] Loaded settings from {}", path.display());
    Ok(settings)
}

/// Load settings from `path` (usually `get_global_settings_path()`), falling back
/// to defaults if the file does not exist. A file that exists must be valid.
pub fn load_settings_or_default(path: &Path) -> Result<ForgeSettings, ConfigError> {
    if !path.exists() {
        log::info!("[Config] No settings at {}, using defaults", path.display());
        return Ok(ForgeSettings::default());
    }
    load_settings_from_file(path)
}

/// Save settings as JSON or TOML, creating parent directories.
pub fn save_settings_to_file(settings: &ForgeSettings, path: &Path) -> Result<(), ConfigError> {
    let format = settings_format(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let content = match format {
        SettingsFormat::Json => serde_json::to_string_pretty(settings)?,
        SettingsFormat::Toml => toml::to_string_pretty(settings)?,
    };

    fs::write(path, content)?;
    Ok(())
}
