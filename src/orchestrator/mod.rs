//! Test execution: Idle -> Arming -> Uptake -> Sampling -> Stopping -> Idle.
//!
//! [`TestController`] owns one test at a time. `start` validates and arms on
//! the caller's thread, then hands the pumps to a dedicated worker thread
//! that runs uptake and the sampling loop, shuts the pumps down, drains the
//! readings channel and saves the finished test into the project.

pub mod clock;
pub mod predicate;
pub mod preflight;
pub mod readings;
pub mod rinse;
pub mod sampler;
pub mod state;

pub use clock::{Clock, ManualClock, StopSignal, SystemClock};
pub use predicate::HaltReason;
pub use readings::ReadingsChannel;
pub use sampler::{RunContext, RunOutcome};
pub use state::{ControllerStatus, Phase, StatusPublisher, StopReason};

use crate::config::DeviceSettings;
use crate::device::{PumpConnector, PumpPair};
use crate::error::{ControllerError, PreflightIssues, ProjectError};
use crate::events::{EventBus, TestEvent};
use crate::log_collector::LogCollector;
use crate::models::{RunState, TestDraft, TestRecord};
use crate::project::{Project, ProjectStore};
use crossbeam_channel::Receiver;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::watch;

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A worker is already active; the request was ignored.
    AlreadyRunning,
}

/// Summary of the most recent test run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub name: String,
    pub reason: StopReason,
    pub samples: usize,
    pub reached_sampling: bool,
    pub saved: bool,
    pub save_error: Option<String>,
}

/// Controller state guarded by one lock. The worker only takes it after its
/// loop has returned.
struct ControllerInner {
    project: Project,
    draft: TestDraft,
    ports: (String, String),
    /// A finished run whose save failed.
    pending: Option<RunState>,
    last_run: Option<RunSummary>,
}

/// State shared with the worker thread.
struct Shared {
    store: Arc<dyn ProjectStore>,
    events: EventBus,
    status: StatusPublisher,
    readings: ReadingsChannel,
    stop: Mutex<StopSignal>,
    inner: Mutex<ControllerInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    done: AtomicBool,
}

impl Shared {
    fn inner(&self) -> MutexGuard<'_, ControllerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stop_slot(&self) -> MutexGuard<'_, StopSignal> {
        self.stop.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, phase: Phase) {
        if let Err(e) = self.status.transition(phase) {
            log::error!("[Controller] {}", e);
        }
    }
}

/// Drives one test at a time against two pumps.
pub struct TestController {
    connector: Arc<dyn PumpConnector>,
    clock: Arc<dyn Clock>,
    read_retries: u32,
    log_collector: Option<LogCollector>,
    shared: Arc<Shared>,
}

impl TestController {
    pub fn new(
        connector: Arc<dyn PumpConnector>,
        store: Arc<dyn ProjectStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let events = EventBus::new();
        let status = StatusPublisher::new(events.clone());
        TestController {
            connector,
            clock,
            read_retries: DeviceSettings::default().read_retries,
            log_collector: None,
            shared: Arc::new(Shared {
                store,
                events,
                status,
                readings: ReadingsChannel::new(),
                stop: Mutex::new(StopSignal::new()),
                inner: Mutex::new(ControllerInner {
                    project: Project::default(),
                    draft: TestDraft::default(),
                    ports: (String::new(), String::new()),
                    pending: None,
                    last_run: None,
                }),
                worker: Mutex::new(None),
                running: AtomicBool::new(false),
                done: AtomicBool::new(false),
            }),
        }
    }

    /// Write a session log file per test through `collector`.
    pub fn with_log_collector(mut self, collector: LogCollector) -> Self {
        self.log_collector = Some(collector);
        self
    }

    pub fn with_read_retries(mut self, retries: u32) -> Self {
        self.read_retries = retries;
        self
    }

    fn ensure_idle(&self) -> Result<(), ControllerError> {
        if self.is_running() {
            Err(ControllerError::Busy)
        } else {
            Ok(())
        }
    }

    /// The project can't change under a finished run that still has to be saved.
    fn ensure_no_pending_save(inner: &ControllerInner) -> Result<(), ControllerError> {
        if inner.pending.is_some() {
            Err(ControllerError::SavePending)
        } else {
            Ok(())
        }
    }

    /// Load a project from the store and arm a fresh test.
    pub fn load_project(&self, path: &Path) -> Result<(), ControllerError> {
        self.ensure_idle()?;
        Self::ensure_no_pending_save(&self.shared.inner())?;
        let project = self.shared.store.load(path)?;
        let mut inner = self.shared.inner();
        Self::ensure_no_pending_save(&inner)?;
        inner.project = project;
        inner.draft = TestDraft::default();
        log::info!("[Controller] Loaded project {}", path.display());
        Ok(())
    }

    pub fn project(&self) -> Project {
        self.shared.inner().project.clone()
    }

    /// Replace the in-memory project. Nothing is written.
    pub fn set_project(&self, project: Project) -> Result<(), ControllerError> {
        self.ensure_idle()?;
        let mut inner = self.shared.inner();
        Self::ensure_no_pending_save(&inner)?;
        inner.project = project;
        Ok(())
    }

    /// Reset the test run state for a new test.
    pub fn arm_test(&self, draft: TestDraft) -> Result<(), ControllerError> {
        self.ensure_idle()?;
        log::info!("[Controller] Initialized a new test");
        self.shared.inner().draft = draft;
        self.shared.done.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn draft(&self) -> TestDraft {
        self.shared.inner().draft.clone()
    }

    pub fn select_devices(&self, port1: &str, port2: &str) {
        self.shared.inner().ports = (port1.to_string(), port2.to_string());
    }

    /// Claim the worker slot and install the new run's stop signal, or
    /// report that a worker is active.
    ///
    /// The stop slot stays locked across both steps, so a stop request can
    /// only ever land on the signal of the run it was meant for.
    fn claim(&self) -> Option<StopSignal> {
        let mut slot = self.shared.stop_slot();
        self.shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        let stop = StopSignal::new();
        *slot = stop.clone();
        self.shared.status.reset_for_run();
        Some(stop)
    }

    fn release_after_failed_preflight(&self, issues: PreflightIssues) -> ControllerError {
        log::warn!("[Controller] Couldn't start:\n{}", issues);
        self.shared
            .events
            .publish(TestEvent::PreflightFailed(issues.0.clone()));
        self.shared.enter(Phase::Idle);
        self.shared.running.store(false, Ordering::SeqCst);
        ControllerError::Preflight(issues)
    }

    fn run_context(&self, project: &Project, stop: StopSignal) -> RunContext {
        RunContext {
            limits: project.limits(),
            clock: Arc::clone(&self.clock),
            stop,
            status: self.shared.status.clone(),
            events: self.shared.events.clone(),
            readings: self.shared.readings.clone(),
            read_retries: self.read_retries,
        }
    }

    /// Validate, open the pumps and start the armed test on a worker thread.
    ///
    /// A second call while a worker is active does nothing.
    pub fn start(&self) -> Result<StartOutcome, ControllerError> {
        let Some(stop) = self.claim() else {
            log::debug!("[Controller] Start ignored, a run is active");
            return Ok(StartOutcome::AlreadyRunning);
        };
        self.shared.enter(Phase::Arming);

        let (project, draft, ports, save_pending) = {
            let inner = self.shared.inner();
            (
                inner.project.clone(),
                inner.draft.clone(),
                inner.ports.clone(),
                inner.pending.is_some(),
            )
        };

        let issues = preflight::validate_test(&project, &draft, save_pending);
        let limits = project.limits();
        let pumps = match preflight::arm_pumps(
            self.connector.as_ref(),
            &ports.0,
            &ports.1,
            limits.flowrate,
            issues,
        ) {
            Ok(pumps) => pumps,
            Err(issues) => return Err(self.release_after_failed_preflight(issues)),
        };

        self.shared.done.store(false, Ordering::SeqCst);
        self.shared.readings.drain();

        if let Some(collector) = &self.log_collector {
            let dir = project
                .path()
                .parent()
                .map(|p| p.join("logs"))
                .unwrap_or_else(|| Path::new("logs").to_path_buf());
            match collector.start_new_session(&dir, &draft.name) {
                Ok(path) => log::debug!("[Controller] Logging to {}", path.display()),
                Err(e) => log::warn!("[Controller] No session log for this test: {}", e),
            }
        }
        log::info!(
            "[Controller] Starting test {:?}: {} readings max, every {} s",
            draft.name.trim(),
            limits.max_readings(),
            limits.sample_interval_seconds
        );

        self.shared.enter(Phase::Uptake);
        let ctx = self.run_context(&project, stop);
        let shared = Arc::clone(&self.shared);
        let collector = self.log_collector.clone();
        let state = RunState::new(draft);

        self.spawn_worker("scalewiz-test", pumps, move |mut pumps| {
            let mut state = state;
            let outcome = sampler::run_test(&ctx, &mut pumps, &mut state);
            finalize_test(&shared, collector.as_ref(), pumps, state, outcome);
        })
    }

    /// Run both pumps for `duration` to flush the lines. Nothing is recorded.
    pub fn start_rinse(&self, duration: Duration) -> Result<StartOutcome, ControllerError> {
        let Some(stop) = self.claim() else {
            return Ok(StartOutcome::AlreadyRunning);
        };
        self.shared.enter(Phase::Arming);

        let (project, ports) = {
            let inner = self.shared.inner();
            (inner.project.clone(), inner.ports.clone())
        };
        let pumps = match preflight::arm_pumps(
            self.connector.as_ref(),
            &ports.0,
            &ports.1,
            project.limits().flowrate,
            PreflightIssues::default(),
        ) {
            Ok(pumps) => pumps,
            Err(issues) => return Err(self.release_after_failed_preflight(issues)),
        };

        self.shared.enter(Phase::Rinsing);
        let ctx = self.run_context(&project, stop);
        let shared = Arc::clone(&self.shared);

        self.spawn_worker("scalewiz-rinse", pumps, move |mut pumps| {
            let reason = rinse::run_rinse(&ctx, &mut pumps, duration);
            shared.enter(Phase::Stopping);
            shut_down_pumps(&shared, &mut pumps);
            shared.events.publish(TestEvent::RunFinished {
                reason,
                saved: false,
                samples: 0,
            });
            log::info!("[Controller] Rinse finished: {}", reason);
            shared.enter(Phase::Idle);
            shared.running.store(false, Ordering::SeqCst);
        })
    }

    /// Start the worker thread, then hand it the open pumps. The pumps stay
    /// with the caller until the thread exists.
    fn spawn_worker<F>(
        &self,
        name: &str,
        pumps: PumpPair,
        work: F,
    ) -> Result<StartOutcome, ControllerError>
    where
        F: FnOnce(PumpPair) + Send + 'static,
    {
        let (pumps_tx, pumps_rx) = crossbeam_channel::bounded::<PumpPair>(1);
        let spawned = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                if let Ok(pumps) = pumps_rx.recv() {
                    work(pumps);
                }
            });

        match spawned {
            Ok(handle) => {
                *self.shared.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                match pumps_tx.send(pumps) {
                    Ok(()) => Ok(StartOutcome::Started),
                    Err(e) => Err(self.abandon_start(
                        e.into_inner(),
                        format!("{} worker exited before starting", name),
                    )),
                }
            }
            Err(e) => Err(self.abandon_start(
                pumps,
                format!("failed to spawn {} worker: {}", name, e),
            )),
        }
    }

    /// Shut the pumps down and go back to Idle when no worker could take the run.
    fn abandon_start(&self, mut pumps: PumpPair, reason: String) -> ControllerError {
        log::error!("[Controller] {}", reason);
        self.shared.enter(Phase::Stopping);
        shut_down_pumps(&self.shared, &mut pumps);
        self.shared.enter(Phase::Idle);
        self.shared.running.store(false, Ordering::SeqCst);
        ControllerError::Worker(reason)
    }

    /// Ask the active run to stop at its next tick. Never blocks.
    pub fn request_stop(&self) {
        let stop = self.shared.stop_slot();
        if !stop.is_requested() {
            log::info!("[Controller] Stop requested");
        }
        stop.request();
        if self.is_running() {
            self.shared.status.mark_stop_requested();
        }
    }

    /// Block until the active worker (if any) has finished.
    pub fn wait(&self) -> Result<(), ControllerError> {
        let handle = self
            .shared
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| ControllerError::Worker("worker thread panicked".to_string())),
            None => Ok(()),
        }
    }

    pub fn status(&self) -> ControllerStatus {
        self.shared.status.snapshot()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ControllerStatus> {
        self.shared.status.subscribe()
    }

    pub fn subscribe(&self) -> Receiver<TestEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Whether the armed test has finished running.
    pub fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::SeqCst)
    }

    pub fn last_run(&self) -> Option<RunSummary> {
        self.shared.inner().last_run.clone()
    }

    /// The finished test waiting for a successful save, if any.
    pub fn pending_save(&self) -> Option<TestRecord> {
        self.shared.inner().pending.as_ref().map(RunState::to_record)
    }

    /// Try again to save a run whose save failed.
    ///
    /// The run goes into the project it was recorded against: the project
    /// can't be replaced while a save is pending.
    pub fn retry_save(&self) -> Result<(), ControllerError> {
        self.ensure_idle()?;
        let mut inner = self.shared.inner();
        let state = inner.pending.take().ok_or(ControllerError::NoPendingSave)?;
        match persist(&mut inner, self.shared.store.as_ref(), state) {
            Ok(()) => {
                if let Some(summary) = inner.last_run.as_mut() {
                    summary.saved = true;
                    summary.save_error = None;
                }
                Ok(())
            }
            Err((state, e)) => {
                log::error!("[Controller] Save retry failed: {}", e);
                self.shared.events.publish(TestEvent::SaveFailed(e.to_string()));
                inner.pending = Some(state);
                Err(e.into())
            }
        }
    }

    /// Drop a run whose save failed.
    pub fn discard_pending_save(&self) -> Result<(), ControllerError> {
        let mut inner = self.shared.inner();
        let state = inner.pending.take().ok_or(ControllerError::NoPendingSave)?;
        log::warn!(
            "[Controller] Discarded {} unsaved readings for {:?}",
            state.samples.len(),
            state.draft.name
        );
        Ok(())
    }
}

/// Append the run to a copy of the project and save it. On success the
/// project is reloaded from the store and a fresh test is armed; on failure
/// the controller's project is untouched and the run is handed back.
fn persist(
    inner: &mut ControllerInner,
    store: &dyn ProjectStore,
    state: RunState,
) -> Result<(), (RunState, ProjectError)> {
    let mut project = inner.project.clone();
    project.tests.push(state.to_record());
    if let Err(e) = store.save(&mut project) {
        return Err((state, e));
    }
    log::info!(
        "[Controller] Saved {:?} with {} readings to {}",
        state.draft.name.trim(),
        state.samples.len(),
        project.info.path
    );

    inner.project = match store.load(&project.path()) {
        Ok(reloaded) => reloaded,
        Err(e) => {
            log::warn!("[Controller] Couldn't reload the saved project: {}", e);
            project
        }
    };
    inner.draft = TestDraft::default();
    Ok(())
}

/// Stop and close both pumps, logging every failure with its port.
fn shut_down_pumps(shared: &Shared, pumps: &mut PumpPair) {
    for e in pumps.shut_down() {
        log::error!(
            "[Controller] Device fault on {} during {}: {}",
            e.port(),
            Phase::Stopping,
            e
        );
        shared.events.publish(TestEvent::DeviceFault {
            port: e.port().to_string(),
            phase: Phase::Stopping,
            message: e.to_string(),
        });
    }
}

/// Everything after the loop returns: pumps off, drain, save, back to Idle.
fn finalize_test(
    shared: &Shared,
    collector: Option<&LogCollector>,
    mut pumps: PumpPair,
    mut state: RunState,
    outcome: RunOutcome,
) {
    shared.enter(Phase::Stopping);
    shut_down_pumps(shared, &mut pumps);
    shared.done.store(true, Ordering::SeqCst);

    let drained = shared.readings.drain();
    let samples = drained.len();
    let name = state.draft.name.trim().to_string();
    let mut saved = false;
    let mut save_error = None;

    {
        let mut inner = shared.inner();
        if outcome.reached_sampling {
            state.absorb(drained);
            match persist(&mut inner, shared.store.as_ref(), state) {
                Ok(()) => saved = true,
                Err((state, e)) => {
                    log::error!("[Controller] Couldn't save {:?}: {}", name, e);
                    shared.events.publish(TestEvent::SaveFailed(e.to_string()));
                    save_error = Some(e.to_string());
                    inner.pending = Some(state);
                }
            }
        } else {
            log::info!("[Controller] {:?} ended before sampling; nothing to save", name);
        }
        inner.last_run = Some(RunSummary {
            name,
            reason: outcome.reason,
            samples,
            reached_sampling: outcome.reached_sampling,
            saved,
            save_error,
        });
    }

    log::info!(
        "[Controller] Test finished ({}): {} readings, saved: {}",
        outcome.reason,
        samples,
        saved
    );
    shared.events.publish(TestEvent::RunFinished {
        reason: outcome.reason,
        saved,
        samples,
    });

    if let Some(collector) = collector {
        if let Err(e) = collector.flush_blocking() {
            eprintln!("[Controller] Session log flush failed: {}", e);
        }
        collector.end_session();
    }

    shared.enter(Phase::Idle);
    shared.running.store(false, Ordering::SeqCst);
}
