//! Decoupled logging pipeline for test runs.
//!
//! Every line goes to the current session file (one per test) and, without
//! blocking, to an optional observer channel for a live log panel.
//!
//! # Architecture
//!
//! ```text
//! log::info!() / LogCollector::log_line()
//!     |
//! [LogCollector] (non-blocking, crossbeam unbounded)
//!     |
//! [background thread]
//!     +--> <project dir>/logs/<unix>_<test>_<date>.txt   (always)
//!     +--> observer mpsc channel                        (try_send, may drop)
//! ```
//!
//! Disk persistence never depends on the observer keeping up.

use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Internal log line or special marker
enum LogMessage {
    Line(LogLine),
    /// Switch the session file. Travels in order with the lines, so every
    /// line lands in the session that was current when it was logged.
    Session(Option<PathBuf>),
    /// Flush marker with channel sender to signal completion
    Flush(std::sync::mpsc::Sender<()>),
}

/// One formatted log record.
#[derive(Clone, Debug, PartialEq)]
pub struct LogLine {
    /// `YYYY-MM-DD HH:MM:SS`
    pub timestamp: String,
    pub thread: String,
    pub level: Level,
    pub message: String,
}

impl LogLine {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        let current = std::thread::current();
        LogLine {
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            thread: current.name().unwrap_or("unnamed").to_string(),
            level,
            message: message.into(),
        }
    }

    /// Line as written to the session file, without the trailing newline.
    pub fn formatted(&self) -> String {
        format!(
            "{} - {} - {} - {}",
            self.timestamp, self.thread, self.level, self.message
        )
    }
}

/// File name of a per-test session log.
pub fn session_file_name(test_name: &str) -> String {
    let unix = Local::now().timestamp();
    let date = Local::now().format("%Y-%m-%d");
    let safe: String = test_name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();
    format!("{}_{}_{}.txt", unix, safe, date)
}

/// Unified logger that handles disk and observer dispatch
pub struct LogCollector {
    /// crossbeam unbounded so any thread can log without blocking
    tx: Sender<LogMessage>,
    session_path: Arc<Mutex<Option<PathBuf>>>,
    level: LevelFilter,
}

impl LogCollector {
    /// Spawn the background writer. `ui_tx` receives a copy of every line
    /// when there is room for it.
    pub fn new(ui_tx: Option<tokio::sync::mpsc::Sender<LogLine>>) -> Result<Self, String> {
        let (tx, rx) = unbounded::<LogMessage>();

        std::thread::Builder::new()
            .name("scalewiz-log".to_string())
            .spawn(move || {
                let mut file: Option<File> = None;

                while let Ok(msg) = rx.recv() {
                    match msg {
                        LogMessage::Session(path) => {
                            if let Some(f) = file.as_mut() {
                                let _ = f.flush();
                            }
                            file = path.and_then(|path| {
                                OpenOptions::new()
                                    .create(true)
                                    .append(true)
                                    .open(&path)
                                    .map_err(|e| {
                                        eprintln!("[Log] Failed to open {}: {}", path.display(), e)
                                    })
                                    .ok()
                            });
                        }
                        LogMessage::Line(line) => {
                            if let Some(f) = file.as_mut() {
                                let _ = writeln!(f, "{}", line.formatted());
                            }

                            if let Some(ui_tx) = &ui_tx {
                                let _ = ui_tx.try_send(line);
                            }
                        }
                        LogMessage::Flush(done) => {
                            if let Some(f) = file.as_mut() {
                                let _ = f.flush();
                            }
                            let _ = done.send(());
                        }
                    }
                }
            })
            .map_err(|e| format!("Failed to spawn log writer thread: {}", e))?;

        Ok(LogCollector {
            tx,
            session_path: Arc::new(Mutex::new(None)),
            level: LevelFilter::Info,
        })
    }

    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.level = level;
        self
    }

    /// Direct subsequent lines to a new file in `log_dir`, named after the test.
    pub fn start_new_session(&self, log_dir: &Path, test_name: &str) -> Result<PathBuf, String> {
        std::fs::create_dir_all(log_dir)
            .map_err(|e| format!("Failed to create logs directory: {}", e))?;
        let log_path = log_dir.join(session_file_name(test_name));

        self.switch_session(Some(log_path.clone()))?;
        Ok(log_path)
    }

    /// Stop writing to disk; lines still reach the observer.
    pub fn end_session(&self) {
        if let Err(e) = self.switch_session(None) {
            eprintln!("[Log] {}", e);
        }
    }

    fn switch_session(&self, path: Option<PathBuf>) -> Result<(), String> {
        // held across the send so the writer sees switches in the same order
        let mut current = self.session_path.lock().unwrap_or_else(|e| e.into_inner());
        *current = path.clone();
        self.tx
            .send(LogMessage::Session(path))
            .map_err(|e| format!("Log writer is gone: {}", e))
    }

    pub fn session_log_path(&self) -> Option<PathBuf> {
        self.session_path.lock().ok().and_then(|path| path.clone())
    }

    /// Queue a line. Never blocks.
    pub fn log_line(&self, line: LogLine) {
        let _ = self.tx.send(LogMessage::Line(line));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log_line(LogLine::new(Level::Info, message));
    }

    /// Block until every line queued before this call is on disk.
    pub fn flush_blocking(&self) -> Result<(), String> {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        self.tx
            .send(LogMessage::Flush(tx))
            .map_err(|e| format!("Failed to send flush marker: {}", e))?;
        rx.recv()
            .map_err(|e| format!("Flush signal interrupted: {}", e))
    }

    /// Async form of [`flush_blocking`](Self::flush_blocking) for the binary.
    pub async fn wait_for_empty(&self) -> Result<(), String> {
        let collector = self.clone();
        tokio::task::spawn_blocking(move || collector.flush_blocking())
            .await
            .map_err(|e| format!("Flush task failed: {}", e))?
    }
}

impl Clone for LogCollector {
    fn clone(&self) -> Self {
        LogCollector {
            tx: self.tx.clone(),
            session_path: Arc::clone(&self.session_path),
            level: self.level,
        }
    }
}

/// Wires all log::info!(), log::warn!(), log::error!() calls into LogCollector
impl Log for LogCollector {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.log_line(LogLine::new(record.level(), record.args().to_string()));
        }
    }

    fn flush(&self) {
        let _ = self.flush_blocking();
    }
}
