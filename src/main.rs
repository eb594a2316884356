use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use scalewiz::device::PumpScript;
use scalewiz::log_collector::LogLine;
use scalewiz::{
    Clock, ControllerError, JsonProjectStore, LogCollector, ManualClock, Project, ProjectStore,
    SettingsManager, Settings, SimulatedConnector, SystemClock, TestController, TestDraft,
    TestEvent,
};

#[derive(Parser)]
#[command(name = "scalewiz", version, about = "Dual-pump scale test controller")]
struct Cli {
    /// Log debug detail
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a new project file from the configured defaults
    Init {
        path: PathBuf,
        #[arg(long)]
        customer: Option<String>,
    },
    /// Run one test against simulated pumps
    Run {
        #[arg(long)]
        project: PathBuf,
        /// Test name; trials default to "{chemical} {rate} ppm"
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        blank: bool,
        #[arg(long, default_value = "")]
        chemical: String,
        #[arg(long, default_value_t = 0.0)]
        rate: f64,
        #[arg(long, default_value = "")]
        clarity: String,
        #[arg(long)]
        port1: String,
        #[arg(long)]
        port2: String,
        /// Starting pressure of the simulated pumps
        #[arg(long, default_value_t = 100)]
        psi: u32,
        /// Pressure rise per reading of the simulated pumps
        #[arg(long, default_value_t = 0)]
        ramp: u32,
        /// Wall-clock timing instead of virtual time
        #[arg(long)]
        realtime: bool,
    },
    /// Run both pumps to flush the lines
    Rinse {
        #[arg(long)]
        port1: String,
        #[arg(long)]
        port2: String,
        #[arg(long)]
        seconds: f64,
        #[arg(long)]
        realtime: bool,
    },
}

fn load_settings() -> Settings {
    match SettingsManager::load() {
        Ok(settings) => settings,
        Err(e) => {
            log::warn!("[Main] Using default settings: {}", e);
            Settings::default()
        }
    }
}

fn clock_for(realtime: bool) -> Arc<dyn Clock> {
    if realtime {
        Arc::new(SystemClock::new())
    } else {
        Arc::new(ManualClock::new())
    }
}

/// Print controller events until the run finishes. Returns whether it saved.
fn print_events(events: crossbeam_channel::Receiver<TestEvent>) -> bool {
    while let Ok(event) = events.recv() {
        match event {
            TestEvent::PhaseChanged(phase) => println!("== {}", phase),
            TestEvent::Log(line) => println!("{}", line),
            TestEvent::DeviceFault {
                port,
                phase,
                message,
            } => eprintln!("!! Device fault on {} during {}: {}", port, phase, message),
            TestEvent::TimingDrift {
                recorded_min,
                scheduled_min,
            } => eprintln!(
                "!! Timing drift: recorded {:.2} min, scheduled {:.2} min",
                recorded_min, scheduled_min
            ),
            TestEvent::SaveFailed(message) => eprintln!("!! Save failed: {}", message),
            TestEvent::RunFinished {
                reason,
                saved,
                samples,
            } => {
                println!("Finished: {} ({} readings, saved: {})", reason, samples, saved);
                return saved;
            }
            _ => {}
        }
    }
    false
}

fn init_project(settings: &Settings, path: &Path, customer: Option<String>) -> anyhow::Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    let path = std::path::absolute(path).context("Couldn't resolve the project path")?;
    let mut project = Project::new(&settings.defaults);
    project.info.customer = customer.unwrap_or_default();
    project.info.analyst = settings.recents.analyst.clone();
    project.info.path = path.display().to_string();
    project.info.name = project.default_name();

    JsonProjectStore::new(settings.defaults.clone())
        .save(&mut project)
        .with_context(|| format!("Couldn't write {}", path.display()))?;
    println!("Created {}", path.display());
    Ok(())
}

async fn run_test(
    settings: &mut Settings,
    collector: LogCollector,
    project_path: PathBuf,
    draft: TestDraft,
    ports: (String, String),
    script: PumpScript,
    realtime: bool,
) -> anyhow::Result<()> {
    let clock = clock_for(realtime);
    let connector = SimulatedConnector::new()
        .script(&ports.0, script.clone())
        .script(&ports.1, script);
    let store = JsonProjectStore::new(settings.defaults.clone());

    let controller = Arc::new(
        TestController::new(Arc::new(connector), Arc::new(store), clock)
            .with_log_collector(collector)
            .with_read_retries(settings.devices.read_retries),
    );
    controller
        .load_project(&project_path)
        .with_context(|| format!("Couldn't open {}", project_path.display()))?;
    controller.arm_test(draft)?;
    controller.select_devices(&ports.0, &ports.1);

    let events = controller.subscribe();
    match controller.start() {
        Ok(_) => {}
        Err(ControllerError::Preflight(issues)) => {
            eprintln!("Couldn't start the test:");
            for issue in issues.iter() {
                eprintln!("  - {}", issue);
            }
            bail!("pre-flight validation failed");
        }
        Err(e) => return Err(e.into()),
    }

    let stopper = Arc::clone(&controller);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.request_stop();
        }
    });

    let waiter = Arc::clone(&controller);
    let saved = tokio::task::spawn_blocking(move || {
        let saved = print_events(events);
        waiter.wait().map(|()| saved)
    })
    .await
    .context("Event printer failed")??;

    if !saved {
        if let Some(summary) = controller.last_run() {
            if let Some(error) = summary.save_error {
                bail!("The test ran but couldn't be saved: {}", error);
            }
        }
        return Ok(());
    }

    let project = controller.project();
    settings.remember_project(&project.info.analyst, &project.path());
    if let Err(e) = SettingsManager::save(settings) {
        log::warn!("[Main] Couldn't remember the project: {}", e);
    }
    Ok(())
}

async fn rinse(
    settings: &Settings,
    ports: (String, String),
    seconds: f64,
    realtime: bool,
) -> anyhow::Result<()> {
    let duration = Duration::try_from_secs_f64(seconds).context("Invalid rinse duration")?;
    let mut project = Project::new(&settings.defaults);
    project.info.path = settings.recents.project.clone();

    let controller = Arc::new(TestController::new(
        Arc::new(SimulatedConnector::new()),
        Arc::new(JsonProjectStore::new(settings.defaults.clone())),
        clock_for(realtime),
    ));
    controller.set_project(project)?;
    controller.select_devices(&ports.0, &ports.1);

    let events = controller.subscribe();
    if let Err(e) = controller.start_rinse(duration) {
        eprintln!("{}", e.user_message());
        bail!("couldn't start the rinse");
    }

    let stopper = Arc::clone(&controller);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.request_stop();
        }
    });

    let waiter = Arc::clone(&controller);
    tokio::task::spawn_blocking(move || {
        print_events(events);
        waiter.wait()
    })
    .await
    .context("Event printer failed")??;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // =========================================================================
    // LOGGING INITIALIZATION - MUST BE FIRST
    // =========================================================================
    let (log_ui_tx, mut log_ui_rx) = mpsc::channel::<LogLine>(1024);
    let collector = LogCollector::new(Some(log_ui_tx))
        .map_err(anyhow::Error::msg)
        .context("LogCollector initialization failed")?;
    let max_level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let collector = collector.with_level(max_level);
    if let Err(e) = log::set_boxed_logger(Box::new(collector.clone()))
        .map(|()| log::set_max_level(max_level))
    {
        eprintln!("[Main] WARNING: Failed to set LogCollector as global logger: {}", e);
    }

    // Problems go to the terminal; everything else is in the session file
    tokio::spawn(async move {
        while let Some(line) = log_ui_rx.recv().await {
            if line.level <= log::Level::Warn {
                eprintln!("{}", line.formatted());
            }
        }
    });

    let mut settings = load_settings();

    let result = match cli.command {
        Command::Init { path, customer } => init_project(&settings, &path, customer),
        Command::Run {
            project,
            name,
            blank,
            chemical,
            rate,
            clarity,
            port1,
            port2,
            psi,
            ramp,
            realtime,
        } => {
            let mut draft = if blank {
                TestDraft::blank(name.clone().unwrap_or_default())
            } else {
                TestDraft::trial(chemical, rate, clarity)
            };
            if let Some(name) = name {
                draft.name = name;
            }
            run_test(
                &mut settings,
                collector.clone(),
                project,
                draft,
                (port1, port2),
                PumpScript::ramp(psi, ramp),
                realtime,
            )
            .await
        }
        Command::Rinse {
            port1,
            port2,
            seconds,
            realtime,
        } => rinse(&settings, (port1, port2), seconds, realtime).await,
    };

    if let Err(e) = collector.wait_for_empty().await {
        eprintln!("[Main] Log flush failed: {}", e);
    }
    result
}
