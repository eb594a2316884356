//! Unified error type hierarchy for ScaleWiz
//!
//! Provides structured error handling with PumpError, ProjectError, ConfigError
//! and ControllerError. Device faults are converted to `PumpError` at the pump
//! boundary so the controller never sees a raw I/O failure.

use std::fmt;
use std::io;
use thiserror::Error;

/// Pump device errors, always tagged with the port they came from.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PumpError {
    #[error("Couldn't connect to {port}: {reason}")]
    OpenFailed { port: String, reason: String },

    #[error("Device at {port} is not open")]
    NotOpen { port: String },

    #[error("I/O error on {port}: {reason}")]
    Io { port: String, reason: String },

    #[error("Device at {port} did not respond in time")]
    Timeout { port: String },

    #[error("Unexpected response from {port}: {response:?}")]
    InvalidResponse { port: String, response: String },
}

impl PumpError {
    /// Device identifier the error originated from.
    pub fn port(&self) -> &str {
        match self {
            PumpError::OpenFailed { port, .. }
            | PumpError::NotOpen { port }
            | PumpError::Io { port, .. }
            | PumpError::Timeout { port }
            | PumpError::InvalidResponse { port, .. } => port,
        }
    }
}

/// Project file load/save errors.
#[derive(Error, Debug)]
pub enum ProjectError {
    #[error("Project file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid JSON in project: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("IO error during project operations: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to persist project: {0}")]
    Persist(String),
}

/// Settings file errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot determine the user configuration directory")]
    NoConfigDir,

    #[error("Invalid TOML in settings: {0}")]
    InvalidToml(#[from] toml::de::Error),

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("IO error during settings operations: {0}")]
    Io(#[from] io::Error),
}

/// Aggregated pre-flight validation failures.
///
/// Every failed check contributes one line so the operator sees all problems
/// in a single pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PreflightIssues(pub Vec<String>);

impl PreflightIssues {
    pub fn push(&mut self, issue: impl Into<String>) {
        self.0.push(issue.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    pub fn contains(&self, issue: &str) -> bool {
        self.0.iter().any(|i| i == issue)
    }

    pub fn extend(&mut self, other: PreflightIssues) {
        self.0.extend(other.0);
    }

    /// Keep only the first `max` issues.
    pub fn capped(mut self, max: usize) -> Self {
        self.0.truncate(max);
        self
    }
}

impl fmt::Display for PreflightIssues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("\n"))
    }
}

/// Controller-level errors surfaced to the presentation layer.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Couldn't start the test:\n{0}")]
    Preflight(PreflightIssues),

    #[error("Operation not allowed while a test is running")]
    Busy,

    #[error("No finished test is waiting to be saved")]
    NoPendingSave,

    #[error("A finished test is waiting to be saved")]
    SavePending,

    #[error(transparent)]
    Project(#[from] ProjectError),

    #[error("Worker failure: {0}")]
    Worker(String),
}

impl ControllerError {
    /// Get a user-facing error message suitable for display
    pub fn user_message(&self) -> String {
        match self {
            ControllerError::Preflight(issues) => issues.to_string(),
            ControllerError::Busy => "Stop the running test first".to_string(),
            ControllerError::NoPendingSave => "Nothing to save".to_string(),
            ControllerError::SavePending => "Save or discard the previous test first".to_string(),
            ControllerError::Project(e) => format!("Project file operation failed: {}", e),
            ControllerError::Worker(msg) => format!("Test worker failed: {}", msg),
        }
    }
}
