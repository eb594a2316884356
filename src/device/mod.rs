//! Pump device seam.
//!
//! The controller talks to pumps only through [`PumpHandle`]; how a handle
//! reaches the hardware (serial protocol, simulation) is the connector's
//! business. Every failure crosses this boundary as a [`PumpError`].

pub mod simulated;

pub use simulated::{DeviceCall, PumpScript, SimulatedConnector};

use crate::error::PumpError;

/// Placeholder shown by port pickers when no serial port was found.
pub const NO_PORT_FOUND: &str = "None found";

/// Handle to one physical pump.
pub trait PumpHandle: Send {
    /// Device identifier (serial port name).
    fn port(&self) -> &str;

    fn open(&mut self) -> Result<(), PumpError>;

    /// Closing an already closed handle is a no-op.
    fn close(&mut self) -> Result<(), PumpError>;

    fn run(&mut self) -> Result<(), PumpError>;

    fn stop(&mut self) -> Result<(), PumpError>;

    /// Current pressure in psi. May block until the device answers.
    fn pressure(&mut self) -> Result<u32, PumpError>;

    /// Flow rate in mL/min.
    fn set_flowrate(&mut self, flowrate: f64) -> Result<(), PumpError>;

    fn is_open(&self) -> bool;
}

/// Creates pump handles for port identifiers.
pub trait PumpConnector: Send + Sync {
    fn connect(&self, port: &str) -> Box<dyn PumpHandle>;
}

/// Whether a port selection names an actual device.
pub fn is_port_selected(port: &str) -> bool {
    let port = port.trim();
    !port.is_empty() && port != NO_PORT_FOUND
}

/// Stop then close a pump, skipping pumps that are already closed.
///
/// Returns the first error so the caller can log it; both calls are
/// always attempted.
pub fn shut_down(pump: &mut dyn PumpHandle) -> Result<(), PumpError> {
    if !pump.is_open() {
        return Ok(());
    }
    let stopped = pump.stop();
    let closed = pump.close();
    stopped.and(closed)
}

/// The two pumps of a run, owned by whoever is driving them.
pub struct PumpPair {
    pub pump1: Box<dyn PumpHandle>,
    pub pump2: Box<dyn PumpHandle>,
}

impl PumpPair {
    pub fn new(pump1: Box<dyn PumpHandle>, pump2: Box<dyn PumpHandle>) -> Self {
        PumpPair { pump1, pump2 }
    }

    pub fn each_mut(&mut self) -> [&mut dyn PumpHandle; 2] {
        [self.pump1.as_mut(), self.pump2.as_mut()]
    }

    /// Start both pumps, stopping at the first failure.
    pub fn run(&mut self) -> Result<(), PumpError> {
        for pump in self.each_mut() {
            pump.run()?;
        }
        Ok(())
    }

    /// Stop and close both pumps, collecting every failure.
    pub fn shut_down(&mut self) -> Vec<PumpError> {
        self.each_mut()
            .into_iter()
            .filter_map(|pump| shut_down(pump).err())
            .collect()
    }
}
