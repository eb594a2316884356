//! Time source and cancellation token for the sampling worker.
//!
//! All waiting in a run goes through a [`Clock`] so tests can drive a whole
//! test in virtual time with [`ManualClock`].

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Cooperative cancellation token shared between the controller and its worker.
///
/// Once requested it stays requested; a new run gets a new signal.
#[derive(Clone)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

struct StopInner {
    requested: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        StopSignal {
            inner: Arc::new(StopInner {
                requested: AtomicBool::new(false),
                wake_tx,
                wake_rx,
            }),
        }
    }

    /// Set the flag and wake a sleeping worker. Never blocks; repeated calls
    /// have no further effect.
    pub fn request(&self) {
        if !self.inner.requested.swap(true, Ordering::SeqCst) {
            let _ = self.inner.wake_tx.try_send(());
        }
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout` for a stop request. Returns whether one arrived.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_requested() {
            return true;
        }
        match self.inner.wake_rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                self.is_requested()
            }
        }
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSignal")
            .field("requested", &self.is_requested())
            .finish()
    }
}

/// Monotonic time source.
pub trait Clock: Send + Sync {
    /// Time since the clock's origin.
    fn now(&self) -> Duration;

    /// Sleep for `duration`, returning early if `stop` is requested.
    fn sleep(&self, duration: Duration, stop: &StopSignal);
}

/// Wall-clock time.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration, stop: &StopSignal) {
        if !duration.is_zero() {
            stop.wait_timeout(duration);
        }
    }
}

/// Virtual time: `sleep` advances the clock and returns at once.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward without sleeping, as a slow device call would.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sleep(&self, duration: Duration, stop: &StopSignal) {
        if !stop.is_requested() {
            self.advance(duration);
        }
    }
}

/// Delay until the next tick of a schedule anchored at `elapsed == 0`.
///
/// Always in `(0, period]`; an overrun skips to the following tick rather
/// than going negative. A zero period yields zero.
pub fn next_tick_delay(elapsed: Duration, period: Duration) -> Duration {
    if period.is_zero() {
        return Duration::ZERO;
    }
    let into_tick = elapsed.as_nanos() % period.as_nanos();
    period - Duration::from_nanos(u64::try_from(into_tick).unwrap_or(u64::MAX))
}
