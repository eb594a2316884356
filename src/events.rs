//! Typed controller events and the bus that fans them out to observers.
//!
//! The controller never knows who is listening: a terminal printer, a GUI
//! bridge and a test can all subscribe to the same [`EventBus`].

use crate::models::Sample;
use crate::orchestrator::state::{Phase, StopReason};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::{Arc, Mutex};

/// Events emitted by the test controller.
#[derive(Debug, Clone, PartialEq)]
pub enum TestEvent {
    PhaseChanged(Phase),
    /// 0-100
    Progress(u8),
    ElapsedLabel(String),
    SampleTaken(Sample),
    /// Line for the operator's log panel.
    Log(String),
    PreflightFailed(Vec<String>),
    DeviceFault {
        port: String,
        phase: Phase,
        message: String,
    },
    TimingDrift {
        recorded_min: f64,
        scheduled_min: f64,
    },
    SaveFailed(String),
    RunFinished {
        reason: StopReason,
        saved: bool,
        samples: usize,
    },
}

/// Publish/subscribe fan-out over unbounded channels.
///
/// Publishing never blocks; subscribers whose receiver was dropped are
/// forgotten on the next publish.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<TestEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> Receiver<TestEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub fn publish(&self, event: TestEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
