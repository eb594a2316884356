//! ScaleWiz test controller
//!
//! Runs dynamic scale-inhibitor tests: two pumps push fluid through
//! capillaries while their pressures are sampled on a fixed, drift-corrected
//! schedule until a pressure, time or reading limit is reached or the
//! operator stops the run. Finished tests are saved into a JSON project file.
//!
//! The crate is organized into functional modules:
//! - **error**: Unified error type hierarchy
//! - **models**: Samples, test drafts, persisted test records, run state
//! - **config**: Settings persisted as TOML
//! - **project**: Project model, limits snapshot and the JSON project store
//! - **device**: Pump handle seam and simulated pumps
//! - **events**: Typed controller events and the event bus
//! - **log_collector**: Per-test session log files and the observer log stream
//! - **orchestrator**: Test controller state machine, sampling loop, rinse

// Core foundational modules
pub mod error;
pub mod models;

// Settings
pub mod config;

// Project files
pub mod project;

// Pump devices
pub mod device;

// Observer surface
pub mod events;

// Robust, decoupled logging system
pub mod log_collector;

// Test lifecycle and sampling
pub mod orchestrator;

// Re-export the log crate for macro usage
pub use log;

// Re-export log collector for use throughout the system
pub use log_collector::{LogCollector, LogLine};

// ============================================================================
// PUBLIC RE-EXPORTS FOR CONVENIENCE
// ============================================================================

pub use error::{ConfigError, ControllerError, PreflightIssues, ProjectError, PumpError};

pub use models::{RunState, Sample, ScoredPump, TestDraft, TestRecord};

pub use config::{Settings, SettingsManager};

pub use project::{JsonProjectStore, Project, ProjectLimits, ProjectStore};

pub use device::{PumpConnector, PumpHandle, SimulatedConnector};

pub use events::{EventBus, TestEvent};

pub use orchestrator::{
    Clock, ControllerStatus, HaltReason, ManualClock, Phase, RunSummary, StartOutcome,
    StopReason, StopSignal, SystemClock, TestController,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
