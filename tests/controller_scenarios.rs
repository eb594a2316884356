//! End-to-end controller runs against simulated pumps in virtual time.

use scalewiz::device::{DeviceCall, PumpScript};
use scalewiz::orchestrator::preflight::{ISSUE_SAME_PORTS, ISSUE_SAVE_PENDING};
use scalewiz::project::ProjectParams;
use scalewiz::{
    Clock, ControllerError, HaltReason, JsonProjectStore, ManualClock, Phase, Project,
    ProjectError, ProjectStore, PumpConnector, PumpError, PumpHandle, SimulatedConnector,
    StartOutcome, StopReason, StopSignal, TestController, TestDraft, TestEvent,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tempfile::TempDir;

/// Write a project whose params are adjusted by `tweak`.
fn write_project(dir: &TempDir, tweak: impl FnOnce(&mut ProjectParams)) -> PathBuf {
    let path = dir.path().join("project.json");
    let mut project = Project::default();
    project.info.path = path.display().to_string();
    project.params.uptake_seconds = 10.0;
    tweak(&mut project.params);
    JsonProjectStore::default().save(&mut project).unwrap();
    path
}

fn steady_connector(psi: u32) -> SimulatedConnector {
    SimulatedConnector::new()
        .script("COM1", PumpScript::steady(psi))
        .script("COM2", PumpScript::steady(psi))
}

fn controller_for(
    connector: SimulatedConnector,
    store: Arc<dyn ProjectStore>,
    clock: Arc<dyn Clock>,
    project: &Path,
) -> TestController {
    let controller = TestController::new(Arc::new(connector), store, clock);
    controller.load_project(project).unwrap();
    controller.select_devices("COM1", "COM2");
    controller
}

fn one_minute_every_30s(params: &mut ProjectParams) {
    params.limit_minutes = 1.0;
    params.interval_seconds = 30.0;
    params.limit_psi = 500;
}

/// Uptake never ends on its own; only a stop request releases it.
struct GatedClock;

impl Clock for GatedClock {
    fn now(&self) -> Duration {
        Duration::ZERO
    }

    fn sleep(&self, _duration: Duration, stop: &StopSignal) {
        stop.wait_timeout(Duration::from_secs(10));
    }
}

/// JSON store whose saves fail while `broken` is set.
struct FlakyStore {
    inner: JsonProjectStore,
    broken: AtomicBool,
}

impl ProjectStore for FlakyStore {
    fn load(&self, path: &Path) -> Result<Project, ProjectError> {
        self.inner.load(path)
    }

    fn save(&self, project: &mut Project) -> Result<(), ProjectError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(ProjectError::Persist("disk full".to_string()));
        }
        self.inner.save(project)
    }
}

/// Asks the controller to stop while each pump is being opened.
struct StopWhileOpening {
    inner: SimulatedConnector,
    controller: Arc<OnceLock<Weak<TestController>>>,
}

impl PumpConnector for StopWhileOpening {
    fn connect(&self, port: &str) -> Box<dyn PumpHandle> {
        Box::new(StoppingPump {
            inner: self.inner.connect(port),
            controller: Arc::clone(&self.controller),
        })
    }
}

struct StoppingPump {
    inner: Box<dyn PumpHandle>,
    controller: Arc<OnceLock<Weak<TestController>>>,
}

impl PumpHandle for StoppingPump {
    fn port(&self) -> &str {
        self.inner.port()
    }

    fn open(&mut self) -> Result<(), PumpError> {
        if let Some(controller) = self.controller.get().and_then(Weak::upgrade) {
            controller.request_stop();
        }
        self.inner.open()
    }

    fn close(&mut self) -> Result<(), PumpError> {
        self.inner.close()
    }

    fn run(&mut self) -> Result<(), PumpError> {
        self.inner.run()
    }

    fn stop(&mut self) -> Result<(), PumpError> {
        self.inner.stop()
    }

    fn pressure(&mut self) -> Result<u32, PumpError> {
        self.inner.pressure()
    }

    fn set_flowrate(&mut self, flowrate: f64) -> Result<(), PumpError> {
        self.inner.set_flowrate(flowrate)
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}

#[test]
fn test_full_run_saves_every_reading() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_project(&dir, one_minute_every_30s);
    let clock = Arc::new(ManualClock::new());
    let controller = controller_for(
        steady_connector(100),
        Arc::new(JsonProjectStore::default()),
        clock.clone(),
        &path,
    );
    controller.arm_test(TestDraft::blank("Blank 1")).unwrap();
    let events = controller.subscribe();

    assert_eq!(controller.start().unwrap(), StartOutcome::Started);
    controller.wait().unwrap();

    let summary = controller.last_run().unwrap();
    assert_eq!(summary.reason, StopReason::Halted(HaltReason::ReadingLimit));
    assert_eq!(summary.samples, 3);
    assert!(summary.saved);
    assert!(controller.is_done());
    assert_eq!(controller.status().phase, Phase::Idle);
    // 10 s uptake then samples at 0, 30 and 60 s
    assert_eq!(clock.now(), Duration::from_secs(70));

    let saved = JsonProjectStore::default().load(&path).unwrap();
    assert_eq!(saved.tests.len(), 1);
    let test = &saved.tests[0];
    assert_eq!(test.name, "Blank 1");
    assert_eq!(test.label, "blank 1");
    let minutes: Vec<f64> = test.readings.iter().map(|r| r.elapsed_minutes()).collect();
    assert_eq!(minutes, vec![0.0, 0.5, 1.0]);
    assert!(test.readings.iter().all(|r| r.average_psi() == 100));
    assert_eq!(test.observed_baseline, 75);

    // the controller reloaded the project and armed a fresh test
    assert_eq!(controller.project().tests.len(), 1);
    assert_eq!(controller.draft(), TestDraft::default());

    let phases: Vec<Phase> = events
        .try_iter()
        .filter_map(|e| match e {
            TestEvent::PhaseChanged(phase) => Some(phase),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            Phase::Arming,
            Phase::Uptake,
            Phase::Sampling,
            Phase::Stopping,
            Phase::Idle
        ]
    );
}

#[test]
fn test_pressure_limit_ends_run_after_first_reading() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_project(&dir, one_minute_every_30s);
    let controller = controller_for(
        steady_connector(600),
        Arc::new(JsonProjectStore::default()),
        Arc::new(ManualClock::new()),
        &path,
    );
    controller.arm_test(TestDraft::blank("Blank 1")).unwrap();

    controller.start().unwrap();
    controller.wait().unwrap();

    let summary = controller.last_run().unwrap();
    assert_eq!(summary.reason, StopReason::Halted(HaltReason::PressureLimit));
    assert_eq!(summary.samples, 1);
    assert!(summary.saved);
    let saved = JsonProjectStore::default().load(&path).unwrap();
    assert_eq!(saved.tests[0].readings.len(), 1);
    assert_eq!(saved.tests[0].max_psi(), 600);
}

#[test]
fn test_stop_during_uptake_saves_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_project(&dir, one_minute_every_30s);
    let connector = steady_connector(100);
    let controller = controller_for(
        connector.clone(),
        Arc::new(JsonProjectStore::default()),
        Arc::new(GatedClock),
        &path,
    );
    controller.arm_test(TestDraft::blank("Blank 1")).unwrap();

    controller.start().unwrap();
    assert_eq!(controller.status().phase, Phase::Uptake);
    controller.request_stop();
    controller.wait().unwrap();

    let summary = controller.last_run().unwrap();
    assert_eq!(summary.reason, StopReason::Halted(HaltReason::StopRequested));
    assert!(!summary.reached_sampling);
    assert!(!summary.saved);
    assert_eq!(summary.samples, 0);
    assert!(JsonProjectStore::default().load(&path).unwrap().tests.is_empty());
    assert!(controller.pending_save().is_none());

    // both pumps were stopped and closed
    for port in ["COM1", "COM2"] {
        let calls = connector.calls_for(port);
        assert_eq!(calls.last(), Some(&DeviceCall::Close));
    }
}

#[test]
fn test_same_ports_fail_without_device_io() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_project(&dir, one_minute_every_30s);
    let connector = steady_connector(100);
    let controller = controller_for(
        connector.clone(),
        Arc::new(JsonProjectStore::default()),
        Arc::new(ManualClock::new()),
        &path,
    );
    controller.arm_test(TestDraft::blank("Blank 1")).unwrap();
    controller.select_devices("COM1", "COM1");
    let events = controller.subscribe();

    match controller.start() {
        Err(ControllerError::Preflight(issues)) => assert!(issues.contains(ISSUE_SAME_PORTS)),
        other => panic!("expected a pre-flight failure, got {:?}", other),
    }
    assert_eq!(connector.connect_count(), 0);
    assert!(connector.calls().is_empty());
    assert!(!controller.is_running());
    assert!(events
        .try_iter()
        .any(|e| matches!(e, TestEvent::PreflightFailed(_))));
}

#[test]
fn test_second_start_while_running_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_project(&dir, one_minute_every_30s);
    let connector = steady_connector(100);
    let controller = controller_for(
        connector.clone(),
        Arc::new(JsonProjectStore::default()),
        Arc::new(GatedClock),
        &path,
    );
    controller.arm_test(TestDraft::blank("Blank 1")).unwrap();

    assert_eq!(controller.start().unwrap(), StartOutcome::Started);
    assert_eq!(controller.start().unwrap(), StartOutcome::AlreadyRunning);
    assert!(matches!(
        controller.arm_test(TestDraft::blank("Blank 2")),
        Err(ControllerError::Busy)
    ));
    assert_eq!(connector.connect_count(), 2);

    controller.request_stop();
    controller.wait().unwrap();
    assert!(!controller.is_running());
}

#[test]
fn test_failed_save_can_be_retried() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_project(&dir, one_minute_every_30s);
    let store = Arc::new(FlakyStore {
        inner: JsonProjectStore::default(),
        broken: AtomicBool::new(true),
    });
    let controller = controller_for(
        steady_connector(100),
        store.clone(),
        Arc::new(ManualClock::new()),
        &path,
    );
    controller.arm_test(TestDraft::blank("Blank 1")).unwrap();
    let events = controller.subscribe();

    controller.start().unwrap();
    controller.wait().unwrap();

    let summary = controller.last_run().unwrap();
    assert!(!summary.saved);
    assert_eq!(summary.save_error.as_deref(), Some("Failed to persist project: disk full"));
    assert!(events.try_iter().any(|e| matches!(e, TestEvent::SaveFailed(_))));
    assert_eq!(controller.pending_save().unwrap().readings.len(), 3);
    assert!(controller.project().tests.is_empty());

    // a new test can't start over an unsaved one
    controller.arm_test(TestDraft::blank("Blank 2")).unwrap();
    match controller.start() {
        Err(ControllerError::Preflight(issues)) => assert!(issues.contains(ISSUE_SAVE_PENDING)),
        other => panic!("expected a pre-flight failure, got {:?}", other),
    }

    assert!(controller.retry_save().is_err());
    assert!(controller.pending_save().is_some());

    store.broken.store(false, Ordering::SeqCst);
    controller.retry_save().unwrap();
    assert!(controller.pending_save().is_none());
    assert!(controller.last_run().unwrap().saved);
    let saved = JsonProjectStore::default().load(&path).unwrap();
    assert_eq!(saved.tests.len(), 1);
    assert_eq!(saved.tests[0].readings.len(), 3);
}

#[test]
fn test_unsaved_run_can_be_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_project(&dir, one_minute_every_30s);
    let store = Arc::new(FlakyStore {
        inner: JsonProjectStore::default(),
        broken: AtomicBool::new(true),
    });
    let controller = controller_for(
        steady_connector(100),
        store,
        Arc::new(ManualClock::new()),
        &path,
    );
    controller.arm_test(TestDraft::blank("Blank 1")).unwrap();
    controller.start().unwrap();
    controller.wait().unwrap();

    controller.discard_pending_save().unwrap();
    assert!(controller.pending_save().is_none());
    assert!(matches!(controller.retry_save(), Err(ControllerError::NoPendingSave)));
}

#[test]
fn test_device_fault_mid_run_keeps_earlier_readings() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_project(&dir, one_minute_every_30s);
    let connector = SimulatedConnector::new()
        .script("COM1", PumpScript::steady(100))
        .script("COM2", PumpScript::steady(100).fail_reads_from(2));
    let controller = controller_for(
        connector,
        Arc::new(JsonProjectStore::default()),
        Arc::new(ManualClock::new()),
        &path,
    );
    controller.arm_test(TestDraft::blank("Blank 1")).unwrap();
    let events = controller.subscribe();

    controller.start().unwrap();
    controller.wait().unwrap();

    let summary = controller.last_run().unwrap();
    assert_eq!(summary.reason, StopReason::DeviceFault);
    assert_eq!(summary.samples, 2);
    assert!(summary.saved);
    assert!(events.try_iter().any(|e| matches!(
        e,
        TestEvent::DeviceFault { ref port, phase: Phase::Sampling, .. } if port == "COM2"
    )));
    let saved = JsonProjectStore::default().load(&path).unwrap();
    assert_eq!(saved.tests[0].readings.len(), 2);
}

#[test]
fn test_rinse_records_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_project(&dir, one_minute_every_30s);
    let clock = Arc::new(ManualClock::new());
    let controller = controller_for(
        steady_connector(100),
        Arc::new(JsonProjectStore::default()),
        clock.clone(),
        &path,
    );
    let events = controller.subscribe();

    assert_eq!(
        controller.start_rinse(Duration::from_secs(120)).unwrap(),
        StartOutcome::Started
    );
    controller.wait().unwrap();

    assert_eq!(clock.now(), Duration::from_secs(120));
    assert!(events.try_iter().any(|e| e
        == TestEvent::RunFinished {
            reason: StopReason::RinseFinished,
            saved: false,
            samples: 0
        }));
    assert!(controller.last_run().is_none());
    assert!(JsonProjectStore::default().load(&path).unwrap().tests.is_empty());
    assert_eq!(controller.status().phase, Phase::Idle);
}

#[test]
fn test_stop_while_arming_ends_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_project(&dir, one_minute_every_30s);
    let simulated = steady_connector(100);
    let slot = Arc::new(OnceLock::new());
    let connector = StopWhileOpening {
        inner: simulated.clone(),
        controller: Arc::clone(&slot),
    };
    let controller = Arc::new(TestController::new(
        Arc::new(connector),
        Arc::new(JsonProjectStore::default()),
        Arc::new(ManualClock::new()),
    ));
    slot.set(Arc::downgrade(&controller)).unwrap();
    controller.load_project(&path).unwrap();
    controller.select_devices("COM1", "COM2");
    controller.arm_test(TestDraft::blank("Blank 1")).unwrap();

    assert_eq!(controller.start().unwrap(), StartOutcome::Started);
    controller.wait().unwrap();

    let summary = controller.last_run().unwrap();
    assert_eq!(summary.reason, StopReason::Halted(HaltReason::StopRequested));
    assert!(!summary.reached_sampling);
    assert!(!summary.saved);
    assert!(JsonProjectStore::default().load(&path).unwrap().tests.is_empty());
    assert_eq!(controller.status().phase, Phase::Idle);
    for port in ["COM1", "COM2"] {
        let calls = simulated.calls_for(port);
        assert!(!calls.contains(&DeviceCall::Run), "{:?}", calls);
        assert_eq!(calls.last(), Some(&DeviceCall::Close));
    }
}

#[test]
fn test_pending_save_keeps_its_project() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let path_a = write_project(&dir_a, one_minute_every_30s);
    let path_b = write_project(&dir_b, one_minute_every_30s);
    let store = Arc::new(FlakyStore {
        inner: JsonProjectStore::default(),
        broken: AtomicBool::new(true),
    });
    let controller = controller_for(
        steady_connector(100),
        store.clone(),
        Arc::new(ManualClock::new()),
        &path_a,
    );
    controller.arm_test(TestDraft::blank("Blank 1")).unwrap();
    controller.start().unwrap();
    controller.wait().unwrap();
    assert!(controller.pending_save().is_some());

    assert!(matches!(
        controller.load_project(&path_b),
        Err(ControllerError::SavePending)
    ));
    let other = JsonProjectStore::default().load(&path_b).unwrap();
    assert!(matches!(
        controller.set_project(other),
        Err(ControllerError::SavePending)
    ));

    store.broken.store(false, Ordering::SeqCst);
    controller.retry_save().unwrap();
    let store = JsonProjectStore::default();
    assert_eq!(store.load(&path_a).unwrap().tests.len(), 1);
    assert!(store.load(&path_b).unwrap().tests.is_empty());

    // once saved, switching projects works again
    controller.load_project(&path_b).unwrap();
    assert!(controller.project().tests.is_empty());
}
