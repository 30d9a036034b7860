//! DroidForge Rust Backend
//!
//! This crate provides the operation orchestrator behind the DroidForge Android
//! kernel/ROM customization console: it launches build scripts and device tools,
//! streams their progress to observers, walks devices through brick detection,
//! special-mode entry and recovery, and cancels anything in flight.
//!
//! **Architecture**: A host (web server, desktop shell, CLI) holds one
//! `Orchestrator` and subscribes to its progress events. Persistence of build
//! configurations and records stays with the host behind the `BuildStore` trait.
//!
//! The system is organized into functional modules:
//! - **error**: Unified error type hierarchy
//! - **models**: Core data structures and types
//! - **config**: Host settings, loading and validation
//! - **log_collector**: Decoupled log persistence
//! - **process**: External process execution and supervision
//! - **orchestrator**: Operation tracking, progress fan-out and builds
//! - **device**: Device detection, mode entry, recovery and toolbox

// Core foundational modules
pub mod error;
pub mod models;

// Host settings
pub mod config;

// Robust, decoupled logging system
pub mod log_collector;

// External tool execution
pub mod process;

// Operation tracking, progress broadcasting and build orchestration
pub mod orchestrator;

// Device recovery engine and toolbox
pub mod device;

// Re-export the log crate for macro usage
pub use log;

// Re-export log collector for use throughout the system
pub use log_collector::{init_global_logger, LogCollector, LogLine};

// ============================================================================
// PUBLIC RE-EXPORTS FOR CONVENIENCE
// ============================================================================

// Re-export error types for easy access
pub use error::{
    BuildError, ConfigError, ForgeError, ProcessError, RecoveryError, RegistryError, Result,
    StoreError,
};

// Re-export model types for easy access
pub use models::{
    BrickType,
    BuildRecord,
    BuildRecordUpdate,
    CableConfig,
    CableVoltage,
    DeviceBrickStatus,
    DeviceButton,
    DeviceInfo,
    DeviceInterface,
    DeviceMode,
    DeviceSignals,
    DeviceState,
    KernelConfiguration,
    KernelTweakParams,
    // Enums
    OperationKind,
    OperationStatus,
    SkipOptions,
    TwrpBuildConfig,
    TwrpBuildJob,
    TwrpFeatures,
    UnbrickMethod,
    UnbrickRequest,
    WslStatus,
};

// Re-export settings
pub use config::{DelaySettings, ForgeSettings, UsbProbeBackend};

// Re-export orchestrator surface
pub use orchestrator::{
    broadcaster::{EventType, ProgressEvent, ProgressSubscription},
    state::Operation,
    store::{BuildStore, InMemoryBuildStore},
    OperationTask,
    Orchestrator,
};

pub use device::DeviceRecoveryEngine;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
