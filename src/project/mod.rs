//! Project model: limits, clerical metadata and the completed tests of one study.
//!
//! The controller only reads a [`ProjectLimits`] snapshot at start and hands a
//! finished [`TestRecord`] back at stop; everything else here exists so the
//! project file round-trips faithfully.

pub mod sort;
pub mod store;

pub use store::{JsonProjectStore, ProjectStore};

use crate::config::Defaults;
use crate::models::{nullable, TestRecord};
use crate::orchestrator::predicate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Clerical metadata used on reports.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectInfo {
    #[serde(deserialize_with = "nullable")]
    pub customer: String,
    #[serde(rename = "submittedBy", deserialize_with = "nullable")]
    pub submitted_by: String,
    #[serde(rename = "productionCo", deserialize_with = "nullable")]
    pub client: String,
    #[serde(deserialize_with = "nullable")]
    pub field: String,
    #[serde(deserialize_with = "nullable")]
    pub sample: String,
    #[serde(rename = "sampleDate", deserialize_with = "nullable")]
    pub sample_date: String,
    #[serde(rename = "recDate", deserialize_with = "nullable")]
    pub received_date: String,
    #[serde(rename = "compDate", deserialize_with = "nullable")]
    pub completed_date: String,
    #[serde(deserialize_with = "nullable")]
    pub name: String,
    #[serde(deserialize_with = "nullable")]
    pub analyst: String,
    #[serde(deserialize_with = "nullable")]
    pub numbers: String,
    #[serde(deserialize_with = "nullable")]
    pub path: String,
    #[serde(deserialize_with = "nullable")]
    pub notes: String,
}

/// Experiment parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectParams {
    pub bicarbonates: f64,
    #[serde(rename = "bicarbsIncreased")]
    pub bicarbs_increased: bool,
    pub calcium: f64,
    pub chlorides: f64,
    pub baseline: u32,
    pub temperature: f64,
    #[serde(rename = "limitPSI")]
    pub limit_psi: u32,
    #[serde(rename = "limitMin")]
    pub limit_minutes: f64,
    #[serde(rename = "interval")]
    pub interval_seconds: f64,
    pub flowrate: f64,
    #[serde(rename = "uptake")]
    pub uptake_seconds: f64,
}

impl ProjectParams {
    pub fn from_defaults(defaults: &Defaults) -> Self {
        let defaults = defaults.clone().sanitized();
        ProjectParams {
            bicarbonates: 0.0,
            bicarbs_increased: false,
            calcium: 0.0,
            chlorides: 0.0,
            baseline: defaults.baseline,
            temperature: defaults.test_temperature,
            limit_psi: defaults.pressure_limit,
            limit_minutes: defaults.time_limit,
            interval_seconds: defaults.reading_interval,
            flowrate: defaults.flowrate,
            uptake_seconds: defaults.uptake_time,
        }
    }
}

impl Default for ProjectParams {
    fn default() -> Self {
        Self::from_defaults(&Defaults::default())
    }
}

/// Shortest reading interval a run accepts.
pub const MIN_INTERVAL_SECONDS: f64 = 1.0;

/// Read-only limits a run is executed against, snapshotted at start.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectLimits {
    pub pressure_limit: u32,
    pub time_limit_minutes: f64,
    pub sample_interval_seconds: f64,
    pub uptake_seconds: f64,
    pub flowrate: f64,
}

impl ProjectLimits {
    pub fn interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.sample_interval_seconds).unwrap_or(Duration::ZERO)
    }

    pub fn uptake(&self) -> Duration {
        Duration::try_from_secs_f64(self.uptake_seconds).unwrap_or(Duration::ZERO)
    }

    /// Upper bound on the number of samples in one run.
    pub fn max_readings(&self) -> usize {
        predicate::max_readings(self.time_limit_minutes, self.sample_interval_seconds)
    }

    /// Problems that make these limits unusable for a run.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        // elapsed minutes are kept to 0.01 min, so shorter intervals collide
        if !(self.sample_interval_seconds >= MIN_INTERVAL_SECONDS)
            || !self.sample_interval_seconds.is_finite()
        {
            problems.push(format!(
                "The reading interval must be at least {} second",
                MIN_INTERVAL_SECONDS
            ));
        }
        if !(self.time_limit_minutes > 0.0) || !self.time_limit_minutes.is_finite() {
            problems.push("The time limit must be greater than zero".to_string());
        }
        if !(self.uptake_seconds >= 0.0) || !self.uptake_seconds.is_finite() {
            problems.push("The uptake time cannot be negative".to_string());
        }
        if !(self.flowrate > 0.0) || !self.flowrate.is_finite() {
            problems.push("The flowrate must be greater than zero".to_string());
        }
        problems
    }
}

impl From<&ProjectParams> for ProjectLimits {
    fn from(params: &ProjectParams) -> Self {
        ProjectLimits {
            pressure_limit: params.limit_psi,
            time_limit_minutes: params.limit_minutes,
            sample_interval_seconds: params.interval_seconds,
            uptake_seconds: params.uptake_seconds,
            flowrate: params.flowrate,
        }
    }
}

/// A project file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub info: ProjectInfo,
    #[serde(default)]
    pub params: ProjectParams,
    #[serde(default, deserialize_with = "nullable")]
    pub tests: Vec<TestRecord>,
    #[serde(rename = "outputFormat", default, deserialize_with = "nullable")]
    pub output_format: String,
    #[serde(default, deserialize_with = "nullable")]
    pub plot: String,
}

impl Default for Project {
    fn default() -> Self {
        Self::new(&Defaults::default())
    }
}

impl Project {
    /// A fresh project seeded from the configured defaults.
    pub fn new(defaults: &Defaults) -> Self {
        Project {
            uuid: Some(uuid::Uuid::new_v4().simple().to_string()),
            info: ProjectInfo::default(),
            params: ProjectParams::from_defaults(defaults),
            tests: Vec::new(),
            output_format: defaults.output_format.clone(),
            plot: String::new(),
        }
    }

    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.info.path)
    }

    pub fn limits(&self) -> ProjectLimits {
        ProjectLimits::from(&self.params)
    }

    pub fn has_test_named(&self, name: &str) -> bool {
        self.tests.iter().any(|t| t.name == name)
    }

    /// Default project name: production company (or customer), field, sample.
    pub fn default_name(&self) -> String {
        let mut name = if self.info.client.is_empty() {
            self.info.customer.trim().to_string()
        } else {
            self.info.client.trim().to_string()
        };
        if !self.info.field.is_empty() {
            name = format!("{} - {}", name, self.info.field.trim());
        }
        if !self.info.sample.is_empty() {
            name = format!("{} ({})", name, self.info.sample.trim());
        }
        name
    }

    /// Lower-case and de-duplicate labels, then order tests blanks-first,
    /// each group in natural label order.
    pub fn arrange_tests(&mut self) {
        let mut seen: HashSet<String> = HashSet::new();
        let mut blanks = Vec::new();
        let mut trials = Vec::new();

        for mut test in self.tests.drain(..) {
            let mut label = test.label.to_lowercase();
            while seen.contains(&label) {
                label.push_str(" - copy");
            }
            seen.insert(label.clone());
            test.label = label;
            if test.is_blank {
                blanks.push(test);
            } else {
                trials.push(test);
            }
        }

        blanks.sort_by(|a, b| sort::natural_cmp(&a.label, &b.label));
        trials.sort_by(|a, b| sort::natural_cmp(&a.label, &b.label));
        self.tests = blanks.into_iter().chain(trials).collect();
    }
}
