//! Uptake phase and the drift-corrected sampling loop.
//!
//! Both run on the controller's worker thread. Every tick is anchored to a
//! fixed start instant (`start + k * period`), so time spent in blocking
//! pressure reads never accumulates into the schedule.
//!
//! Cancellation is cooperative: the stop flag is consulted once per tick and
//! wakes the drift-corrected sleep, but a pressure read in progress runs to
//! completion. A hung device therefore bounds stop latency.

use crate::device::{PumpHandle, PumpPair};
use crate::error::PumpError;
use crate::events::{EventBus, TestEvent};
use crate::models::{RunState, Sample};
use crate::orchestrator::clock::{next_tick_delay, Clock, StopSignal};
use crate::orchestrator::predicate::{self, HaltReason, RunProgress};
use crate::orchestrator::readings::ReadingsChannel;
use crate::orchestrator::state::{Phase, StatusPublisher, StopReason};
use crate::project::ProjectLimits;
use std::sync::Arc;
use std::time::Duration;

/// Number of drift-corrected steps uptake and rinse are divided into.
pub const STEP_COUNT: u32 = 100;

/// Recorded vs scheduled elapsed minutes beyond which drift is reported.
pub const DRIFT_TOLERANCE_MINUTES: f64 = 0.01;

/// Everything the worker needs, cloned out of the controller at start.
#[derive(Clone)]
pub struct RunContext {
    pub limits: ProjectLimits,
    pub clock: Arc<dyn Clock>,
    pub stop: StopSignal,
    pub status: StatusPublisher,
    pub events: EventBus,
    pub readings: ReadingsChannel,
    /// Extra attempts after a failed pressure read.
    pub read_retries: u32,
}

/// How a test run ended on the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub reason: StopReason,
    /// False when the run ended during uptake; such runs are never saved.
    pub reached_sampling: bool,
}

impl RunContext {
    fn progress(&self, state: &RunState) -> RunProgress {
        RunProgress {
            max_psi_1: state.max_psi_1,
            max_psi_2: state.max_psi_2,
            pressure_limit: self.limits.pressure_limit,
            elapsed_minutes: state.elapsed_minutes,
            time_limit_minutes: self.limits.time_limit_minutes,
            samples_taken: state.samples_taken,
            max_readings: self.limits.max_readings(),
            stop_requested: self.stop.is_requested(),
        }
    }

    /// Log a device failure with its port and phase, and tell observers.
    pub(crate) fn report_fault(&self, error: &PumpError, phase: Phase) {
        log::error!("[Sampler] Device fault on {} during {}: {}", error.port(), phase, error);
        self.events.publish(TestEvent::DeviceFault {
            port: error.port().to_string(),
            phase,
            message: error.to_string(),
        });
    }

    fn log_line(&self, line: String) {
        if !line.is_empty() {
            log::info!("{}", line);
        }
        self.events.publish(TestEvent::Log(line));
    }

    /// Split `total` into [`STEP_COUNT`] drift-corrected steps, showing the
    /// seconds left. `halt` is consulted before each step.
    pub(crate) fn step_through(
        &self,
        total: Duration,
        mut halt: impl FnMut() -> Option<HaltReason>,
    ) -> Option<HaltReason> {
        let step = total / STEP_COUNT;
        let start = self.clock.now();
        for i in 0..STEP_COUNT {
            if let Some(reason) = halt() {
                return Some(reason);
            }
            let elapsed = self.clock.now().saturating_sub(start);
            let remaining = total.saturating_sub(elapsed);
            self.status
                .set_progress(i as u8, format!("{} s", remaining.as_secs_f64().round() as u64));
            self.clock.sleep(next_tick_delay(elapsed, step), &self.stop);
        }
        halt()
    }
}

/// Read one pump, retrying failed reads up to `retries` more times.
pub fn read_pressure(pump: &mut dyn PumpHandle, retries: u32) -> Result<u32, PumpError> {
    let mut attempt = 0;
    loop {
        match pump.pressure() {
            Ok(psi) => return Ok(psi),
            Err(e) if attempt < retries => {
                attempt += 1;
                log::warn!(
                    "[Sampler] Read from {} failed (retry {}/{}): {}",
                    pump.port(),
                    attempt,
                    retries,
                    e
                );
            }
            Err(e) => return Err(e),
        }
    }
}

/// Run uptake then sampling. The caller has already moved to Uptake and
/// shuts the pumps down afterwards.
pub fn run_test(ctx: &RunContext, pumps: &mut PumpPair, state: &mut RunState) -> RunOutcome {
    let ended = |reason| RunOutcome {
        reason,
        reached_sampling: false,
    };

    // a stop that arrived while the pumps were opening
    if ctx.stop.is_requested() {
        log::info!("[Sampler] Stop requested before the pumps started");
        return ended(StopReason::Halted(HaltReason::StopRequested));
    }

    if let Err(e) = pumps.run() {
        ctx.report_fault(&e, Phase::Uptake);
        return ended(StopReason::DeviceFault);
    }

    if let Some(halt) = ctx.step_through(ctx.limits.uptake(), || predicate::check(&ctx.progress(state))) {
        log::info!("[Sampler] Run ended during uptake: {}", halt);
        return ended(StopReason::Halted(halt));
    }

    if let Err(e) = ctx.status.transition(Phase::Sampling) {
        log::error!("[Sampler] {}", e);
    }
    ctx.log_line(String::new());

    let reason = sample(ctx, pumps, state);
    report_drift(ctx, state);
    RunOutcome {
        reason,
        reached_sampling: true,
    }
}

/// The sampling loop proper.
fn sample(ctx: &RunContext, pumps: &mut PumpPair, state: &mut RunState) -> StopReason {
    let interval = ctx.limits.interval();
    let max_readings = ctx.limits.max_readings().max(1);
    let start = ctx.clock.now();

    loop {
        if let Some(halt) = predicate::check(&ctx.progress(state)) {
            return StopReason::Halted(halt);
        }

        let tick = ctx.clock.now().saturating_sub(start);
        let psi1 = match read_pressure(pumps.pump1.as_mut(), ctx.read_retries) {
            Ok(psi) => psi,
            Err(e) => {
                ctx.report_fault(&e, Phase::Sampling);
                return StopReason::DeviceFault;
            }
        };
        let psi2 = match read_pressure(pumps.pump2.as_mut(), ctx.read_retries) {
            Ok(psi) => psi,
            Err(e) => {
                ctx.report_fault(&e, Phase::Sampling);
                return StopReason::DeviceFault;
            }
        };

        let sample = Sample::new(tick, psi1, psi2);
        ctx.log_line(sample.log_line());
        ctx.readings.push(sample);
        state.observe(&sample);
        ctx.events.publish(TestEvent::SampleTaken(sample));

        let percent = (state.samples_taken as f64 / max_readings as f64 * 100.0).round();
        ctx.status.set_progress(
            percent.min(100.0) as u8,
            format!("{:.2} min.", sample.elapsed_minutes()),
        );

        // the last sample doesn't wait out another interval
        if predicate::can_run(&ctx.progress(state)) {
            let elapsed = ctx.clock.now().saturating_sub(start);
            ctx.clock.sleep(next_tick_delay(elapsed, interval), &ctx.stop);
        }
    }
}

/// Compare the last sample's recorded time with its place on the schedule.
/// Samples are never adjusted.
fn report_drift(ctx: &RunContext, state: &RunState) -> Option<(f64, f64)> {
    let ticks = state.samples_taken.checked_sub(1)?;
    let scheduled = ticks as f64 * ctx.limits.sample_interval_seconds / 60.0;
    let recorded = state.elapsed_minutes;
    if (recorded - scheduled).abs() <= DRIFT_TOLERANCE_MINUTES {
        return None;
    }
    log::warn!(
        "[Sampler] Timing drift: last reading recorded at {:.2} min, scheduled for {:.2} min",
        recorded,
        scheduled
    );
    ctx.events.publish(TestEvent::TimingDrift {
        recorded_min: recorded,
        scheduled_min: scheduled,
    });
    Some((recorded, scheduled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCall, PumpConnector, PumpScript, SimulatedConnector};
    use crate::models::TestDraft;
    use crate::orchestrator::clock::ManualClock;
    use crate::project::MIN_INTERVAL_SECONDS;
    use crossbeam_channel::Receiver;
    use proptest::prelude::*;

    fn limits(minutes: f64, interval: f64, psi: u32) -> ProjectLimits {
        ProjectLimits {
            pressure_limit: psi,
            time_limit_minutes: minutes,
            sample_interval_seconds: interval,
            uptake_seconds: 10.0,
            flowrate: 15.0,
        }
    }

    fn context(limits: ProjectLimits, clock: Arc<dyn Clock>) -> (RunContext, Receiver<TestEvent>) {
        let events = EventBus::new();
        let rx = events.subscribe();
        let status = StatusPublisher::new(events.clone());
        status.transition(Phase::Arming).unwrap();
        status.transition(Phase::Uptake).unwrap();
        let ctx = RunContext {
            limits,
            clock,
            stop: StopSignal::new(),
            status,
            events,
            readings: ReadingsChannel::new(),
            read_retries: 2,
        };
        (ctx, rx)
    }

    fn open_pair(connector: &SimulatedConnector) -> PumpPair {
        let mut pair = PumpPair::new(connector.connect("A"), connector.connect("B"));
        for pump in pair.each_mut() {
            pump.open().unwrap();
        }
        pair
    }

    #[test]
    fn test_samples_land_on_schedule() {
        let clock = Arc::new(ManualClock::new());
        let connector = SimulatedConnector::new()
            .with_clock(clock.clone())
            .script("A", PumpScript::steady(100).with_read_latency(Duration::from_secs(2)))
            .script("B", PumpScript::steady(100).with_read_latency(Duration::from_secs(2)));
        let (ctx, events) = context(limits(2.0, 30.0, 500), clock);
        let mut pumps = open_pair(&connector);
        let mut state = RunState::new(TestDraft::blank("b"));

        let outcome = run_test(&ctx, &mut pumps, &mut state);

        assert_eq!(outcome.reason, StopReason::Halted(HaltReason::ReadingLimit));
        assert!(outcome.reached_sampling);
        let minutes: Vec<f64> = ctx.readings.drain().iter().map(|s| s.elapsed_minutes()).collect();
        assert_eq!(minutes, vec![0.0, 0.5, 1.0, 1.5, 2.0]);
        assert!(!events
            .try_iter()
            .any(|e| matches!(e, TestEvent::TimingDrift { .. })));
    }

    #[test]
    fn test_overrun_skips_a_tick_and_reports_drift() {
        let clock = Arc::new(ManualClock::new());
        // two 20 s reads overrun a 30 s interval
        let connector = SimulatedConnector::new()
            .with_clock(clock.clone())
            .script("A", PumpScript::steady(100).with_read_latency(Duration::from_secs(20)))
            .script("B", PumpScript::steady(100).with_read_latency(Duration::from_secs(20)));
        let (ctx, events) = context(limits(1.0, 30.0, 500), clock);
        let mut pumps = open_pair(&connector);
        let mut state = RunState::new(TestDraft::blank("b"));

        let outcome = run_test(&ctx, &mut pumps, &mut state);

        // the predicate sees the last recorded time, so one reading lands past the limit
        assert_eq!(outcome.reason, StopReason::Halted(HaltReason::TimeLimit));
        let minutes: Vec<f64> = ctx.readings.drain().iter().map(|s| s.elapsed_minutes()).collect();
        assert_eq!(minutes, vec![0.0, 1.0, 2.0]);
        let drift: Vec<TestEvent> = events
            .try_iter()
            .filter(|e| matches!(e, TestEvent::TimingDrift { .. }))
            .collect();
        assert_eq!(
            drift,
            vec![TestEvent::TimingDrift {
                recorded_min: 2.0,
                scheduled_min: 1.0
            }]
        );
    }

    #[test]
    fn test_read_retries_recover() {
        let connector = SimulatedConnector::new().script("A", PumpScript::steady(7).fail_read(0).fail_read(1));
        let mut pump = connector.connect("A");
        pump.open().unwrap();
        assert_eq!(read_pressure(pump.as_mut(), 2), Ok(7));
        assert!(read_pressure(pump.as_mut(), 0).is_ok());
    }

    #[test]
    fn test_exhausted_retries_fault_the_run() {
        let clock = Arc::new(ManualClock::new());
        let connector = SimulatedConnector::new()
            .script("A", PumpScript::steady(100))
            .script("B", PumpScript::steady(100).fail_reads_from(1));
        let (ctx, events) = context(limits(1.0, 30.0, 500), clock);
        let mut pumps = open_pair(&connector);
        let mut state = RunState::new(TestDraft::blank("b"));

        let outcome = run_test(&ctx, &mut pumps, &mut state);

        assert_eq!(outcome.reason, StopReason::DeviceFault);
        assert!(outcome.reached_sampling);
        assert_eq!(ctx.readings.len(), 1);
        assert!(events.try_iter().any(|e| e
            == TestEvent::DeviceFault {
                port: "B".into(),
                phase: Phase::Sampling,
                message: "Device at B did not respond in time".into(),
            }));
    }

    #[test]
    fn test_stop_before_uptake_ends_without_sampling() {
        let clock = Arc::new(ManualClock::new());
        let connector = SimulatedConnector::new();
        let (ctx, _events) = context(limits(1.0, 30.0, 500), clock);
        ctx.stop.request();
        let mut pumps = open_pair(&connector);
        let mut state = RunState::new(TestDraft::blank("b"));

        let outcome = run_test(&ctx, &mut pumps, &mut state);

        assert_eq!(outcome.reason, StopReason::Halted(HaltReason::StopRequested));
        assert!(!outcome.reached_sampling);
        assert!(ctx.readings.is_empty());
    }

    #[test]
    fn test_stop_while_arming_never_runs_the_pumps() {
        let clock = Arc::new(ManualClock::new());
        let connector = SimulatedConnector::new();
        let (ctx, _events) = context(limits(1.0, 30.0, 500), clock.clone());
        ctx.stop.request();
        let mut pumps = open_pair(&connector);
        let mut state = RunState::new(TestDraft::blank("b"));

        let outcome = run_test(&ctx, &mut pumps, &mut state);

        assert_eq!(outcome.reason, StopReason::Halted(HaltReason::StopRequested));
        assert!(!connector.calls_for("A").contains(&DeviceCall::Run));
        assert!(!connector.calls_for("B").contains(&DeviceCall::Run));
        assert_eq!(clock.now(), Duration::ZERO);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_samples_increase_and_respect_max_readings(
            minutes in 0.05f64..3.0,
            interval in MIN_INTERVAL_SECONDS..45.0,
            latency_ms in 0u64..40_000,
        ) {
            let clock = Arc::new(ManualClock::new());
            let latency = Duration::from_millis(latency_ms);
            let connector = SimulatedConnector::new()
                .with_clock(clock.clone())
                .script("A", PumpScript::steady(100).with_read_latency(latency))
                .script("B", PumpScript::steady(100).with_read_latency(latency));
            let limits = limits(minutes, interval, 500);
            let max = limits.max_readings();
            let (ctx, _events) = context(limits, clock);
            let mut pumps = open_pair(&connector);
            let mut state = RunState::new(TestDraft::blank("b"));

            let outcome = run_test(&ctx, &mut pumps, &mut state);
            let samples = ctx.readings.drain();

            prop_assert!(outcome.reached_sampling);
            prop_assert!(!samples.is_empty());
            prop_assert!(samples.len() <= max, "{} samples, max {}", samples.len(), max);
            for pair in samples.windows(2) {
                prop_assert!(pair[0].elapsed_minutes() < pair[1].elapsed_minutes());
            }
        }
    }

    #[test]
    fn test_uptake_counts_down() {
        let clock = Arc::new(ManualClock::new());
        let connector = SimulatedConnector::new();
        let (ctx, _events) = context(limits(1.0, 30.0, 500), clock.clone());
        let labels = ctx.status.subscribe();
        let mut pumps = open_pair(&connector);
        let mut state = RunState::new(TestDraft::blank("b"));

        run_test(&ctx, &mut pumps, &mut state);

        // 10 s of uptake then one minute of sampling
        assert_eq!(clock.now(), Duration::from_secs(70));
        assert_eq!(labels.borrow().elapsed_label, "1.00 min.");
    }
}
