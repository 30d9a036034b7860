//! Unified error type hierarchy for DroidForge
//!
//! Provides structured error handling with ProcessError, BuildError, RecoveryError,
//! StoreError, ConfigError, RegistryError, and the top-level ForgeError.

use std::io;
use thiserror::Error;

use crate::models::{DeviceMode, UnbrickMethod};
use crate::orchestrator::context::Interruption;

/// External process spawn and supervision errors.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Command line is empty")]
    EmptyCommand,

    #[error("Failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to capture {0} of child process")]
    PipeUnavailable(&'static str),

    #[error("Failed to reap child process: {0}")]
    WaitFailed(#[source] io::Error),
}

/// Build record / configuration store errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Build configuration {0} not found")]
    ConfigurationNotFound(u64),

    #[error("Build record {0} not found")]
    RecordNotFound(u64),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Kernel/ROM build execution errors.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to write transient build configuration: {0}")]
    TransientConfig(#[source] io::Error),

    #[error("Invalid build configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to serialize build configuration: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Build process failed to start: {0}")]
    SpawnFailed(String),

    #[error("Build process failed with non-zero exit code")]
    ProcessFailed { code: Option<i32> },

    #[error("Build cancelled by user")]
    BuildCancelled,

    #[error("Build timed out after {0} seconds")]
    TimedOut(u64),

    #[error("Build {0} is not active")]
    NotActive(u64),
}

/// Device detection, mode entry and recovery errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("Invalid unbrick request: {0}")]
    InvalidRequest(String),

    #[error("{tool} command not available for {mode} mode")]
    CommandUnavailable { tool: &'static str, mode: DeviceMode },

    #[error("{method} method is not available for {mode} mode")]
    MethodUnavailable { method: UnbrickMethod, mode: DeviceMode },

    #[error("Firmware path required for {0} recovery")]
    FirmwareRequired(DeviceMode),

    #[error("Firmware file not found: {0}")]
    FirmwareMissing(String),

    #[error("Failed to enter {0} mode")]
    ModeEntryFailed(DeviceMode),

    #[error("Command '{command}' failed: {output}")]
    CommandFailed { command: String, output: String },

    #[error("Root access required: {0}")]
    RootRequired(String),

    #[error("Device not detected: {0}")]
    DeviceNotDetected(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out")]
    TimedOut,
}

impl From<io::Error> for RecoveryError {
    fn from(e: io::Error) -> Self {
        RecoveryError::Io(e.to_string())
    }
}

impl From<Interruption> for RecoveryError {
    fn from(interruption: Interruption) -> Self {
        match interruption {
            Interruption::Cancelled => RecoveryError::Cancelled,
            Interruption::TimedOut => RecoveryError::TimedOut,
        }
    }
}

/// Settings file parsing and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Settings file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid JSON in settings: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Invalid TOML in settings: {0}")]
    InvalidToml(#[from] toml::de::Error),

    #[error("Failed to encode TOML settings: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    #[error("Settings validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error during settings operations: {0}")]
    IoError(#[from] io::Error),
}

/// Operation registry errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Operation {0} is already registered")]
    Duplicate(String),
}

/// Global error type for the orchestrator surface.
///
/// Hosts only ever see this type (or a terminal operation state), never a panic.
#[derive(Error, Debug)]
pub enum ForgeError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Operation task failed: {0}")]
    TaskFailed(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl ForgeError {
    /// Get a user-facing error message suitable for display by a host
    pub fn user_message(&self) -> String {
        match self {
            ForgeError::Process(e) => format!("Failed to run external tool: {}", e),
            ForgeError::Build(BuildError::BuildCancelled) => "Build cancelled by user".to_string(),
            ForgeError::Build(e) => format!("Build failed: {}", e),
            ForgeError::Recovery(RecoveryError::Cancelled) => "Operation cancelled".to_string(),
            ForgeError::Recovery(e) => format!("Device operation failed: {}", e),
            ForgeError::Store(e) => format!("Build store error: {}", e),
            ForgeError::Config(e) => format!("Settings error: {}", e),
            ForgeError::Registry(e) => format!("Operation tracking error: {}", e),
            ForgeError::TaskFailed(msg) => format!("Operation aborted unexpectedly: {}", msg),
            ForgeError::Io(msg) => format!("File operation failed: {}", msg),
        }
    }
}

impl From<io::Error> for ForgeError {
    fn from(e: io::Error) -> Self {
        ForgeError::Io(e.to_string())
    }
}

/// Top-level result type for operations that may fail.
pub type Result<T> = std::result::Result<T, ForgeError>;
