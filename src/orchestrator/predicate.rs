//! Termination predicate: may the current run keep going?

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why the predicate stopped a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaltReason {
    StopRequested,
    /// Both pumps went over the pressure limit.
    PressureLimit,
    TimeLimit,
    ReadingLimit,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::StopRequested => write!(f, "stop requested"),
            HaltReason::PressureLimit => write!(f, "pressure limit reached"),
            HaltReason::TimeLimit => write!(f, "time limit reached"),
            HaltReason::ReadingLimit => write!(f, "all readings taken"),
        }
    }
}

/// Snapshot of everything the predicate looks at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunProgress {
    pub max_psi_1: u32,
    pub max_psi_2: u32,
    pub pressure_limit: u32,
    pub elapsed_minutes: f64,
    pub time_limit_minutes: f64,
    pub samples_taken: usize,
    pub max_readings: usize,
    pub stop_requested: bool,
}

/// First failing condition, or `None` while the run may continue.
///
/// Pressure is an OR over the pumps: one pump within the limit keeps the run
/// alive. All comparisons are inclusive.
pub fn check(progress: &RunProgress) -> Option<HaltReason> {
    if progress.stop_requested {
        return Some(HaltReason::StopRequested);
    }
    if !(progress.max_psi_1 <= progress.pressure_limit
        || progress.max_psi_2 <= progress.pressure_limit)
    {
        return Some(HaltReason::PressureLimit);
    }
    if !(progress.elapsed_minutes <= progress.time_limit_minutes) {
        return Some(HaltReason::TimeLimit);
    }
    if progress.samples_taken >= progress.max_readings {
        return Some(HaltReason::ReadingLimit);
    }
    None
}

pub fn can_run(progress: &RunProgress) -> bool {
    check(progress).is_none()
}

fn usable(time_limit_minutes: f64, interval_seconds: f64) -> bool {
    interval_seconds > 0.0
        && time_limit_minutes > 0.0
        && interval_seconds.is_finite()
        && time_limit_minutes.is_finite()
}

/// Whole intervals in the time limit, rounded half-to-even.
///
/// Zero for a non-positive or non-finite interval or time limit.
pub fn interval_count(time_limit_minutes: f64, interval_seconds: f64) -> usize {
    if !usable(time_limit_minutes, interval_seconds) {
        return 0;
    }
    (time_limit_minutes * 60.0 / interval_seconds).round_ties_even() as usize
}

/// Bound on samples per run: one at the start of sampling plus one per interval.
pub fn max_readings(time_limit_minutes: f64, interval_seconds: f64) -> usize {
    if !usable(time_limit_minutes, interval_seconds) {
        return 0;
    }
    interval_count(time_limit_minutes, interval_seconds).saturating_add(1)
}
