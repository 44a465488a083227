//! Progress tracking with smoothed speed and ETA
//!
//! A [`ProgressTracker`] accumulates byte counts for one phase of an
//! acquisition (download or checksum) and reports `(percentage, eta, speed)`
//! through a callback. Reports are driven by a sampling tick (1 Hz by default,
//! after an initial delay) rather than by `update`, so bursts of small chunks
//! never flood the consumer.
//!
//! Unknown values use the `-1` sentinel: percentage is `-1.0` while the total
//! size is unknown, eta is `-1` until a speed estimate exists, speed is `-1.0`
//! before the first sample. While in transit the percentage stays below 100
//! and the eta stays at or above 1; only [`ProgressTracker::complete`] reports
//! `(100, 0, 0)`.
//!
//! ## Example
//!
//! ```no_run
//! use imgfetch_core::progress::ProgressTracker;
//!
//! # async fn run() -> imgfetch_core::Result<()> {
//! let mut progress = ProgressTracker::new(|report| {
//!     println!("{:.0}% eta={}s", report.percentage, report.eta_seconds);
//! })
//! .with_total_size(4096);
//!
//! progress.start();
//! progress.update(1024);
//! progress.complete();
//! # Ok(())
//! # }
//! ```

use crate::config::ProgressConfig;
use crate::error::{Error, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Sentinel for an unknown eta
pub const UNKNOWN_ETA: i64 = -1;

/// Sentinel for an unknown percentage or speed
pub const UNKNOWN: f64 = -1.0;

/// Highest percentage reported before completion
pub const MAX_TRANSIT_PERCENTAGE: f64 = 99.0;

// ============================================================================
// Reports and events
// ============================================================================

/// One progress sample as delivered to callbacks
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressReport {
    /// Completion percentage, `-1.0` if the total is unknown
    pub percentage: f64,
    /// Estimated seconds remaining, `-1` if unknown
    pub eta_seconds: i64,
    /// Smoothed speed in bytes per second, `-1.0` if unknown
    pub speed: f64,
}

impl ProgressReport {
    /// The terminal report emitted by `complete()`
    pub fn completed() -> Self {
        Self {
            percentage: 100.0,
            eta_seconds: 0,
            speed: 0.0,
        }
    }

    /// Eta as an option, `None` for the sentinel
    pub fn eta(&self) -> Option<u64> {
        u64::try_from(self.eta_seconds).ok()
    }

    /// Speed as an option, `None` for the sentinel
    pub fn speed_bps(&self) -> Option<f64> {
        (self.speed >= 0.0).then_some(self.speed)
    }

    /// Percentage as an option, `None` for the sentinel
    pub fn percentage_known(&self) -> Option<f64> {
        (self.percentage >= 0.0).then_some(self.percentage)
    }
}

/// Acquisition phase a progress event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Fetching the image from the network
    Download,
    /// Streaming the image through a hash function
    Checksum,
}

impl Phase {
    /// Lowercase phase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Download => "download",
            Phase::Checksum => "checksum",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress event for the caller of an acquisition
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressEvent {
    /// Phase that produced the report
    pub phase: Phase,
    /// Completion percentage, `-1.0` if unknown
    pub percentage: f64,
    /// Seconds remaining, `-1` if unknown
    pub eta: i64,
    /// Bytes per second, `-1.0` if unknown
    pub speed: f64,
}

impl ProgressEvent {
    /// Tag a tracker report with its phase
    pub fn new(phase: Phase, report: ProgressReport) -> Self {
        Self {
            phase,
            percentage: report.percentage,
            eta: report.eta_seconds,
            speed: report.speed,
        }
    }
}

/// Callback receiving tracker reports
pub type ProgressCallback = Arc<dyn Fn(ProgressReport) + Send + Sync>;

// ============================================================================
// Progress state
// ============================================================================

/// Counters behind a tracker
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressState {
    /// Declared size, 0 when unknown
    pub total_size: u64,
    /// Bytes accounted so far (non-decreasing until a rebase)
    pub updated_size: u64,
    /// Snapshot of `updated_size` at the previous tick
    pub last_updated_size: u64,
    /// EWMA of the per-tick speed, bytes per second
    pub average_speed: f64,
    /// Whether `start()` has been called
    pub is_started: bool,
    /// Whether `complete()` or `abort()` has been called
    pub is_completed: bool,
    /// Number of sampling ticks taken
    pub ticks: u64,
    has_updates: bool,
}

impl ProgressState {
    fn percentage(&self) -> f64 {
        if self.total_size == 0 {
            return UNKNOWN;
        }
        let raw = self.updated_size as f64 / self.total_size as f64 * 100.0;
        raw.clamp(0.0, MAX_TRANSIT_PERCENTAGE)
    }

    fn eta(&self) -> i64 {
        if self.total_size == 0 || self.average_speed <= 0.0 {
            return UNKNOWN_ETA;
        }
        let Some(pending) = self.total_size.checked_sub(self.updated_size) else {
            return UNKNOWN_ETA;
        };
        let eta = (pending as f64 / self.average_speed).floor() as i64;
        eta.max(1)
    }

    /// Take one sample: fold the bytes since the last tick into the average
    fn sample(&mut self, smoothing_factor: f64, tick_interval: Duration) -> ProgressReport {
        let delta = self.updated_size.saturating_sub(self.last_updated_size);
        let instantaneous = delta as f64 / tick_interval.as_secs_f64();

        // an empty average has nothing to smooth against
        self.average_speed = if self.average_speed > 0.0 {
            smoothing_factor * instantaneous + (1.0 - smoothing_factor) * self.average_speed
        } else {
            instantaneous
        };
        self.last_updated_size = self.updated_size;
        self.ticks += 1;

        ProgressReport {
            percentage: self.percentage(),
            eta_seconds: self.eta(),
            speed: self.average_speed,
        }
    }

    fn ensure_configurable(&self, what: &str) -> Result<()> {
        if self.is_started || self.has_updates || self.ticks > 0 {
            return Err(Error::InvalidState(format!(
                "{} cannot change after progress updates have started",
                what
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Progress tracker
// ============================================================================

struct Shared {
    state: Mutex<ProgressState>,
    callback: ProgressCallback,
    smoothing_factor: f64,
    tick_interval: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tick(&self) -> Option<ProgressReport> {
        let report = {
            let mut state = self.lock();
            if state.is_completed {
                return None;
            }
            state.sample(self.smoothing_factor, self.tick_interval)
        };
        (self.callback)(report);
        Some(report)
    }
}

/// Byte-count tracker for one acquisition phase
pub struct ProgressTracker {
    shared: Arc<Shared>,
    initial_delay: Duration,
    ticker: Option<JoinHandle<()>>,
}

impl ProgressTracker {
    /// Create a tracker with default timing
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(ProgressReport) + Send + Sync + 'static,
    {
        Self::with_config(&ProgressConfig::default(), callback)
    }

    /// Create a tracker with custom timing and smoothing
    pub fn with_config<F>(config: &ProgressConfig, callback: F) -> Self
    where
        F: Fn(ProgressReport) + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ProgressState::default()),
                callback: Arc::new(callback),
                smoothing_factor: config.smoothing_factor,
                tick_interval: config.tick_interval,
            }),
            initial_delay: config.initial_delay,
            ticker: None,
        }
    }

    /// Tracker that discards all reports
    pub fn silent() -> Self {
        Self::new(|_| {})
    }

    /// Set a known total size at construction time
    pub fn with_total_size(self, total: u64) -> Self {
        self.shared.lock().total_size = total;
        self
    }

    /// Set the total size; fails once updates have started
    pub fn set_total_size(&self, total: u64) -> Result<()> {
        let mut state = self.shared.lock();
        state.ensure_configurable("total size")?;
        state.total_size = total;
        Ok(())
    }

    /// Account bytes already present before this run (resumed transfers)
    ///
    /// Speed and eta then reflect only the bytes added afterwards.
    pub fn set_start_size(&self, size: u64) -> Result<()> {
        let mut state = self.shared.lock();
        state.ensure_configurable("start size")?;
        state.updated_size = size;
        state.last_updated_size = size;
        Ok(())
    }

    /// Reset the counters for a transfer that starts over
    ///
    /// Unlike [`set_total_size`](Self::set_total_size) this works on a
    /// running tracker. The speed average restarts from the next tick.
    pub fn rebase(&self, total: u64, start: u64) {
        let mut state = self.shared.lock();
        state.total_size = total;
        state.updated_size = start;
        state.last_updated_size = start;
        state.average_speed = 0.0;
    }

    /// Emit the initial report and schedule periodic ticks
    ///
    /// Ticks are only scheduled when called inside a tokio runtime.
    pub fn start(&mut self) {
        let report = {
            let mut state = self.shared.lock();
            if state.is_started || state.is_completed {
                return;
            }
            state.is_started = true;
            ProgressReport {
                percentage: state.percentage(),
                eta_seconds: UNKNOWN_ETA,
                speed: UNKNOWN,
            }
        };
        (self.shared.callback)(report);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No tokio runtime, progress ticks disabled");
            return;
        };
        let shared = Arc::clone(&self.shared);
        let first_tick = tokio::time::Instant::now() + self.initial_delay;
        let period = shared.tick_interval;
        self.ticker = Some(handle.spawn(async move {
            let mut interval = tokio::time::interval_at(first_tick, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if shared.tick().is_none() {
                    break;
                }
            }
        }));
    }

    /// Add transferred bytes; does not invoke the callback
    pub fn update(&self, delta: u64) {
        let mut state = self.shared.lock();
        state.updated_size = state.updated_size.saturating_add(delta);
        state.has_updates = true;
    }

    /// Take a sampling tick now and report it
    ///
    /// Normally driven by the timer scheduled in [`start`](Self::start).
    /// Returns `None` once the tracker is completed or aborted.
    pub fn tick(&self) -> Option<ProgressReport> {
        self.shared.tick()
    }

    /// Stop ticking without a final report
    pub fn abort(&mut self) {
        self.shared.lock().is_completed = true;
        self.stop_ticker();
    }

    /// Stop ticking and report `(100, 0, 0)`
    pub fn complete(&mut self) {
        {
            let mut state = self.shared.lock();
            if state.is_completed {
                return;
            }
            state.is_completed = true;
        }
        self.stop_ticker();
        (self.shared.callback)(ProgressReport::completed());
    }

    /// Snapshot of the current counters
    pub fn state(&self) -> ProgressState {
        self.shared.lock().clone()
    }

    /// Whether `start()` has been called
    pub fn is_started(&self) -> bool {
        self.shared.lock().is_started
    }

    /// Whether the tracker has completed or aborted
    pub fn is_completed(&self) -> bool {
        self.shared.lock().is_completed
    }

    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("state", &self.state())
            .field("initial_delay", &self.initial_delay)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================
