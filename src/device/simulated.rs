//! In-process pumps with scripted pressure readings.
//!
//! Used by the binary when no hardware is attached and by the tests, which
//! inspect the recorded [`DeviceCall`]s after a run.

use super::{PumpConnector, PumpHandle};
use crate::error::PumpError;
use crate::orchestrator::clock::{Clock, StopSignal};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// One call made against a simulated pump.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    Open,
    Close,
    Run,
    Stop,
    Pressure,
    SetFlowrate(f64),
}

/// Scripted behavior of one simulated pump.
#[derive(Debug, Clone, PartialEq)]
pub struct PumpScript {
    pressures: Vec<u32>,
    ramp: Option<(u32, u32)>,
    fail_open: bool,
    failing_reads: Vec<usize>,
    fail_reads_from: Option<usize>,
    read_latency: Duration,
}

impl Default for PumpScript {
    fn default() -> Self {
        PumpScript::steady(0)
    }
}

impl PumpScript {
    /// Every read returns `psi`.
    pub fn steady(psi: u32) -> Self {
        PumpScript::sequence(vec![psi])
    }

    /// Reads return `pressures` in order, then repeat the last value.
    pub fn sequence(pressures: Vec<u32>) -> Self {
        PumpScript {
            pressures,
            ramp: None,
            fail_open: false,
            failing_reads: Vec::new(),
            fail_reads_from: None,
            read_latency: Duration::ZERO,
        }
    }

    /// Read `n` returns `start + n * step`, like a scaling capillary.
    pub fn ramp(start: u32, step: u32) -> Self {
        PumpScript {
            ramp: Some((start, step)),
            ..PumpScript::sequence(Vec::new())
        }
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Read number `index` (0-based, counting failed reads) times out.
    pub fn fail_read(mut self, index: usize) -> Self {
        self.failing_reads.push(index);
        self
    }

    /// Every read from number `index` on times out.
    pub fn fail_reads_from(mut self, index: usize) -> Self {
        self.fail_reads_from = Some(index);
        self
    }

    /// Each read takes `latency` on the connector's clock.
    pub fn with_read_latency(mut self, latency: Duration) -> Self {
        self.read_latency = latency;
        self
    }

    fn read_fails(&self, index: usize) -> bool {
        self.failing_reads.contains(&index)
            || self.fail_reads_from.map_or(false, |from| index >= from)
    }

    fn pressure_at(&self, index: usize) -> u32 {
        if let Some((start, step)) = self.ramp {
            let index = u32::try_from(index).unwrap_or(u32::MAX);
            return start.saturating_add(step.saturating_mul(index));
        }
        self.pressures
            .get(index)
            .or_else(|| self.pressures.last())
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Default)]
struct Shared {
    scripts: HashMap<String, PumpScript>,
    calls: Vec<(String, DeviceCall)>,
    connects: usize,
}

/// Hands out [`SimulatedPump`]s and records every call they receive.
#[derive(Clone, Default)]
pub struct SimulatedConnector {
    shared: Arc<Mutex<Shared>>,
    clock: Option<Arc<dyn Clock>>,
}

impl SimulatedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read latency is spent on `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Script the pump that will be connected at `port`.
    pub fn script(self, port: &str, script: PumpScript) -> Self {
        self.lock().scripts.insert(port.to_string(), script);
        self
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<(String, DeviceCall)> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, port: &str) -> Vec<DeviceCall> {
        self.lock()
            .calls
            .iter()
            .filter(|(p, _)| p == port)
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PumpConnector for SimulatedConnector {
    fn connect(&self, port: &str) -> Box<dyn PumpHandle> {
        let script = {
            let mut shared = self.lock();
            shared.connects += 1;
            shared.scripts.get(port).cloned().unwrap_or_default()
        };
        Box::new(SimulatedPump {
            port: port.to_string(),
            script,
            open: false,
            running: false,
            reads: 0,
            flowrate: 0.0,
            shared: Arc::clone(&self.shared),
            clock: self.clock.clone(),
        })
    }
}

/// A pump that answers from a [`PumpScript`].
pub struct SimulatedPump {
    port: String,
    script: PumpScript,
    open: bool,
    running: bool,
    reads: usize,
    flowrate: f64,
    shared: Arc<Mutex<Shared>>,
    clock: Option<Arc<dyn Clock>>,
}

impl SimulatedPump {
    fn record(&self, call: DeviceCall) {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.calls.push((self.port.clone(), call));
    }

    fn ensure_open(&self) -> Result<(), PumpError> {
        if self.open {
            Ok(())
        } else {
            Err(PumpError::NotOpen {
                port: self.port.clone(),
            })
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn flowrate(&self) -> f64 {
        self.flowrate
    }
}

impl PumpHandle for SimulatedPump {
    fn port(&self) -> &str {
        &self.port
    }

    fn open(&mut self) -> Result<(), PumpError> {
        self.record(DeviceCall::Open);
        if self.script.fail_open {
            return Err(PumpError::OpenFailed {
                port: self.port.clone(),
                reason: "device not responding".to_string(),
            });
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), PumpError> {
        if !self.open {
            return Ok(());
        }
        self.record(DeviceCall::Close);
        self.open = false;
        self.running = false;
        Ok(())
    }

    fn run(&mut self) -> Result<(), PumpError> {
        self.record(DeviceCall::Run);
        self.ensure_open()?;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PumpError> {
        self.record(DeviceCall::Stop);
        self.ensure_open()?;
        self.running = false;
        Ok(())
    }

    fn pressure(&mut self) -> Result<u32, PumpError> {
        self.record(DeviceCall::Pressure);
        self.ensure_open()?;
        let index = self.reads;
        self.reads += 1;

        if let (Some(clock), false) = (&self.clock, self.script.read_latency.is_zero()) {
            // serial reads can't be interrupted
            clock.sleep(self.script.read_latency, &StopSignal::new());
        }

        if self.script.read_fails(index) {
            return Err(PumpError::Timeout {
                port: self.port.clone(),
            });
        }
        Ok(self.script.pressure_at(index))
    }

    fn set_flowrate(&mut self, flowrate: f64) -> Result<(), PumpError> {
        self.record(DeviceCall::SetFlowrate(flowrate));
        self.ensure_open()?;
        self.flowrate = flowrate;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
