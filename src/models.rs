//! Core data types for ScaleWiz.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;

/// Deserialize `null` as the type's default. Project files written by older
/// tools carry explicit nulls for unset fields.
pub(crate) fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Round to two decimal places, the resolution elapsed minutes are captured at.
pub fn round_hundredths(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Which pump channel a test is scored on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScoredPump {
    #[default]
    #[serde(rename = "pump 1")]
    Pump1,
    #[serde(rename = "pump 2")]
    Pump2,
    #[serde(rename = "average")]
    Average,
}

/// One measurement tick.
///
/// Fields are private: a sample is immutable once the sampling loop has built it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(rename = "elapsedMin")]
    elapsed_minutes: f64,
    #[serde(rename = "pump 1")]
    pump1_psi: u32,
    #[serde(rename = "pump 2")]
    pump2_psi: u32,
    #[serde(rename = "average")]
    average_psi: u32,
}

impl Sample {
    /// Build a sample from the time elapsed since sampling started and both raw readings.
    pub fn new(elapsed: Duration, pump1_psi: u32, pump2_psi: u32) -> Self {
        Sample {
            elapsed_minutes: round_hundredths(elapsed.as_secs_f64() / 60.0),
            pump1_psi,
            pump2_psi,
            average_psi: average_psi(pump1_psi, pump2_psi),
        }
    }

    pub fn elapsed_minutes(&self) -> f64 {
        self.elapsed_minutes
    }

    pub fn pump1_psi(&self) -> u32 {
        self.pump1_psi
    }

    pub fn pump2_psi(&self) -> u32 {
        self.pump2_psi
    }

    pub fn average_psi(&self) -> u32 {
        self.average_psi
    }

    pub fn psi_for(&self, pump: ScoredPump) -> u32 {
        match pump {
            ScoredPump::Pump1 => self.pump1_psi,
            ScoredPump::Pump2 => self.pump2_psi,
            ScoredPump::Average => self.average_psi,
        }
    }

    /// The per-sample line shown in the operator's log panel.
    pub fn log_line(&self) -> String {
        format!(
            "@ {:.2} min; pump1: {}, pump2: {}, avg: {}",
            self.elapsed_minutes, self.pump1_psi, self.pump2_psi, self.average_psi
        )
    }
}

/// Mean of two readings, rounded half-to-even.
pub fn average_psi(pump1_psi: u32, pump2_psi: u32) -> u32 {
    ((f64::from(pump1_psi) + f64::from(pump2_psi)) / 2.0).round_ties_even() as u32
}

/// Operator input describing the test about to be run.
#[derive(Debug, Clone, PartialEq)]
pub struct TestDraft {
    pub name: String,
    pub is_blank: bool,
    pub chemical: String,
    pub rate: f64,
    /// Report label; defaults to the trimmed name.
    pub label: Option<String>,
    pub clarity: String,
    pub notes: String,
    pub pump_to_score: ScoredPump,
}

impl Default for TestDraft {
    fn default() -> Self {
        TestDraft {
            name: String::new(),
            is_blank: true,
            chemical: String::new(),
            rate: 0.0,
            label: None,
            clarity: String::new(),
            notes: String::new(),
            pump_to_score: ScoredPump::Pump1,
        }
    }
}

impl TestDraft {
    /// A blank (untreated) test.
    pub fn blank(name: impl Into<String>) -> Self {
        TestDraft {
            name: name.into(),
            ..Default::default()
        }
    }

    /// A chemical trial, named `"{chemical} {rate} ppm"`.
    pub fn trial(chemical: impl Into<String>, rate: f64, clarity: impl Into<String>) -> Self {
        let chemical = chemical.into().trim().to_string();
        let mut draft = TestDraft {
            is_blank: false,
            chemical,
            rate,
            clarity: clarity.into(),
            ..Default::default()
        };
        if let Some(name) = draft.derived_name() {
            draft.name = name;
        }
        draft
    }

    /// Name derived from chemical and treating rate, if both are set.
    pub fn derived_name(&self) -> Option<String> {
        if self.chemical.trim().is_empty() || self.rate == 0.0 {
            None
        } else {
            Some(format!("{} {} ppm", self.chemical.trim(), self.rate))
        }
    }

    pub fn effective_label(&self) -> String {
        match &self.label {
            Some(label) if !label.trim().is_empty() => label.trim().to_string(),
            _ => self.name.trim().to_string(),
        }
    }
}

/// A finished test as persisted in the project file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestRecord {
    #[serde(deserialize_with = "nullable")]
    pub name: String,
    #[serde(rename = "isBlank", deserialize_with = "nullable")]
    pub is_blank: bool,
    #[serde(deserialize_with = "nullable")]
    pub chemical: String,
    #[serde(deserialize_with = "nullable")]
    pub rate: f64,
    #[serde(rename = "reportAs", deserialize_with = "nullable")]
    pub label: String,
    #[serde(deserialize_with = "nullable")]
    pub clarity: String,
    #[serde(deserialize_with = "nullable")]
    pub notes: String,
    #[serde(rename = "toConsider", deserialize_with = "nullable")]
    pub pump_to_score: ScoredPump,
    #[serde(rename = "includeOnRep", deserialize_with = "nullable")]
    pub include_on_report: bool,
    #[serde(deserialize_with = "nullable")]
    pub result: f64,
    #[serde(rename = "obsBaseline", deserialize_with = "nullable")]
    pub observed_baseline: u32,
    #[serde(deserialize_with = "nullable")]
    pub readings: Vec<Sample>,
}

impl Default for TestRecord {
    fn default() -> Self {
        TestRecord {
            name: String::new(),
            is_blank: true,
            chemical: String::new(),
            rate: 0.0,
            label: String::new(),
            clarity: String::new(),
            notes: String::new(),
            pump_to_score: ScoredPump::Pump1,
            include_on_report: false,
            result: 0.0,
            observed_baseline: 0,
            readings: Vec::new(),
        }
    }
}

impl TestRecord {
    pub fn from_draft(draft: &TestDraft, readings: Vec<Sample>) -> Self {
        let mut record = TestRecord {
            name: draft.name.trim().to_string(),
            is_blank: draft.is_blank,
            chemical: draft.chemical.clone(),
            rate: draft.rate,
            label: draft.effective_label(),
            clarity: draft.clarity.clone(),
            notes: draft.notes.clone(),
            pump_to_score: draft.pump_to_score,
            readings,
            ..Default::default()
        };
        record.observed_baseline = record.compute_observed_baseline();
        record
    }

    /// Pressures of the scored pump, in reading order.
    pub fn scored_pressures(&self) -> Vec<u32> {
        self.readings
            .iter()
            .map(|r| r.psi_for(self.pump_to_score))
            .collect()
    }

    pub fn max_psi(&self) -> u32 {
        self.scored_pressures().into_iter().max().unwrap_or(0)
    }

    /// Rounded mean of the first four scored readings.
    pub fn compute_observed_baseline(&self) -> u32 {
        let pressures = self.scored_pressures();
        if pressures.is_empty() {
            return 0;
        }
        let first: u32 = pressures.iter().take(4).sum();
        (f64::from(first) / 4.0).round_ties_even() as u32
    }
}

/// Test Run State: one per armed test.
///
/// The sampling loop updates the maxima and counters as it goes; samples
/// travel through the readings channel and are merged in once the worker
/// has stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    pub draft: TestDraft,
    pub samples: Vec<Sample>,
    pub max_psi_1: u32,
    pub max_psi_2: u32,
    pub elapsed_minutes: f64,
    pub samples_taken: usize,
}

impl RunState {
    pub fn new(draft: TestDraft) -> Self {
        RunState {
            draft,
            samples: Vec::new(),
            max_psi_1: 0,
            max_psi_2: 0,
            elapsed_minutes: 0.0,
            samples_taken: 0,
        }
    }

    /// Fold a freshly taken sample into the incremental bookkeeping.
    pub fn observe(&mut self, sample: &Sample) {
        self.max_psi_1 = self.max_psi_1.max(sample.pump1_psi());
        self.max_psi_2 = self.max_psi_2.max(sample.pump2_psi());
        self.elapsed_minutes = sample.elapsed_minutes();
        self.samples_taken += 1;
    }

    /// Append drained samples in FIFO order.
    pub fn absorb(&mut self, drained: Vec<Sample>) {
        self.samples.extend(drained);
    }

    pub fn to_record(&self) -> TestRecord {
        TestRecord::from_draft(&self.draft, self.samples.clone())
    }
}

impl fmt::Display for ScoredPump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoredPump::Pump1 => write!(f, "pump 1"),
            ScoredPump::Pump2 => write!(f, "pump 2"),
            ScoredPump::Average => write!(f, "average"),
        }
    }
}
