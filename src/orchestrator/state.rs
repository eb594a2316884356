//! Controller phases and the status snapshot observers read.
//!
//! **Architecture**:
//! - `Phase`: discrete lifecycle states with their legal transitions
//! - `ControllerStatus`: what a display shows (phase, progress, elapsed label)
//! - `StatusPublisher`: single writer of the status; readers hold a
//!   `tokio::sync::watch::Receiver` and never block the worker

use crate::events::{EventBus, TestEvent};
use crate::orchestrator::predicate::HaltReason;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Controller lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Phase {
    /// No run in progress
    #[default]
    Idle,

    /// Pre-flight validation and pump setup
    Arming,

    /// Pumps running, no samples taken yet
    Uptake,

    /// Drift-corrected sampling loop
    Sampling,

    /// Pumps running to flush the lines; never recorded
    Rinsing,

    /// Pumps shutting down, readings being saved
    Stopping,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Arming => "arming",
            Phase::Uptake => "uptake",
            Phase::Sampling => "sampling",
            Phase::Rinsing => "rinsing",
            Phase::Stopping => "stopping",
        }
    }

    /// All valid phase transitions FROM this phase.
    pub fn valid_next_phases(&self) -> Vec<Phase> {
        match self {
            Phase::Idle => vec![Phase::Arming],
            // a failed pre-flight goes straight back to Idle
            Phase::Arming => vec![Phase::Uptake, Phase::Rinsing, Phase::Idle],
            Phase::Uptake => vec![Phase::Sampling, Phase::Stopping],
            Phase::Sampling => vec![Phase::Stopping],
            Phase::Rinsing => vec![Phase::Stopping],
            Phase::Stopping => vec![Phase::Idle],
        }
    }

    pub fn can_transition_to(&self, next: Phase) -> bool {
        self.valid_next_phases().contains(&next)
    }

    /// Whether a worker owns the pumps in this phase.
    pub fn is_active(&self) -> bool {
        !matches!(self, Phase::Idle)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The termination predicate failed.
    Halted(HaltReason),
    /// A pump could not be read or commanded.
    DeviceFault,
    /// A rinse ran for its full duration.
    RinseFinished,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Halted(reason) => write!(f, "{}", reason),
            StopReason::DeviceFault => write!(f, "device fault"),
            StopReason::RinseFinished => write!(f, "rinse finished"),
        }
    }
}

/// Status snapshot for display.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ControllerStatus {
    pub phase: Phase,
    /// 0-100
    pub progress_percent: u8,
    pub elapsed_label: String,
    pub stop_requested: bool,
}

/// Single writer of [`ControllerStatus`].
///
/// Every change is also published on the event bus.
#[derive(Clone)]
pub struct StatusPublisher {
    tx: Arc<watch::Sender<ControllerStatus>>,
    events: EventBus,
}

impl StatusPublisher {
    pub fn new(events: EventBus) -> Self {
        let (tx, _rx) = watch::channel(ControllerStatus::default());
        StatusPublisher {
            tx: Arc::new(tx),
            events,
        }
    }

    pub fn snapshot(&self) -> ControllerStatus {
        self.tx.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        self.tx.borrow().phase
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerStatus> {
        self.tx.subscribe()
    }

    /// Move to `next`, refusing transitions the lifecycle doesn't allow.
    pub fn transition(&self, next: Phase) -> Result<(), String> {
        let mut result = Ok(());
        self.tx.send_if_modified(|status| {
            if !status.phase.can_transition_to(next) {
                result = Err(format!(
                    "Invalid phase transition: {} -> {}",
                    status.phase, next
                ));
                return false;
            }
            status.phase = next;
            true
        });
        if result.is_ok() {
            log::debug!("[Controller] Phase -> {}", next);
            self.events.publish(TestEvent::PhaseChanged(next));
        }
        result
    }

    /// Clear progress and the stop flag for a new run. Only valid from Idle.
    pub fn reset_for_run(&self) {
        self.tx.send_modify(|status| {
            status.progress_percent = 0;
            status.elapsed_label.clear();
            status.stop_requested = false;
        });
    }

    pub fn set_progress(&self, percent: u8, label: String) {
        let percent = percent.min(100);
        self.tx.send_modify(|status| {
            status.progress_percent = percent;
            status.elapsed_label = label.clone();
        });
        self.events.publish(TestEvent::Progress(percent));
        self.events.publish(TestEvent::ElapsedLabel(label));
    }

    pub fn mark_stop_requested(&self) {
        self.tx.send_if_modified(|status| {
            let changed = !status.stop_requested;
            status.stop_requested = true;
            changed
        });
    }
}
