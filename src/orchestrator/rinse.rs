//! Rinse cycle: run both pumps for a while to flush the lines.
//!
//! Nothing is sampled or saved. Only a stop request ends a rinse early.

use crate::device::PumpPair;
use crate::orchestrator::predicate::HaltReason;
use crate::orchestrator::sampler::RunContext;
use crate::orchestrator::state::{Phase, StopReason};
use std::time::Duration;

/// Run the pumps for `duration`, in drift-corrected steps. The caller has
/// already moved to Rinsing and shuts the pumps down afterwards.
pub fn run_rinse(ctx: &RunContext, pumps: &mut PumpPair, duration: Duration) -> StopReason {
    if ctx.stop.is_requested() {
        return StopReason::Halted(HaltReason::StopRequested);
    }
    if let Err(e) = pumps.run() {
        ctx.report_fault(&e, Phase::Rinsing);
        return StopReason::DeviceFault;
    }
    log::info!("[Rinse] Rinsing for {} s", duration.as_secs_f64().round());

    let stopped = ctx.step_through(duration, || {
        ctx.stop
            .is_requested()
            .then_some(HaltReason::StopRequested)
    });
    match stopped {
        Some(reason) => {
            log::info!("[Rinse] Rinse ended early: {}", reason);
            StopReason::Halted(reason)
        }
        None => StopReason::RinseFinished,
    }
}
