//! Host-aligned monotonic clock.
//!
//! ## Design
//! - The offset between this machine and the host is estimated from a
//!   round trip: the reported server time is corrected forward by half
//!   the measured latency before differencing against the local clock.
//! - A background loop keeps probing and adopts a sample only when its
//!   round trip was strictly faster than the best one held. After
//!   enough probes in a row fail to improve, the loop concludes it has
//!   hit the accuracy floor and stops.
//! - Timestamps are strictly monotonic for the lifetime of the clock
//!   value, across stop/start cycles included. Two calls never return
//!   the same value even when the estimated offset shrinks between
//!   them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::error::SyncError;
use crate::time::TimeService;

/// Seconds between improvement probes.
const PROBE_INTERVAL_SECS: u64 = 5;

/// Consecutive non-improving probes tolerated before probing halts.
const NON_IMPROVEMENT_BUDGET: u32 = 5;

/// Something that can stamp events with host-aligned milliseconds.
pub trait TimestampSource: Send + Sync {
    /// Next timestamp, in host-aligned UTC milliseconds. Strictly
    /// greater than every timestamp previously returned by this source.
    fn timestamp(&self) -> Result<i64, SyncError>;

    /// Upper bound on how far [`Self::timestamp`] may sit from the
    /// host's true clock, in milliseconds.
    fn max_error_ms(&self) -> Result<i64, SyncError>;
}

/// One completed round trip against the time service.
#[derive(Debug, Clone, Copy)]
pub struct TimeSample {
    /// Millis to add to the local clock to approximate the host's.
    pub offset_ms: i64,
    /// Latency-corrected host time at the moment the sample landed.
    pub server_time_utc_ms: i64,
    /// Local UTC millis at the moment the sample landed.
    pub local_time_utc_ms: i64,
    /// Full round-trip duration of this probe, in milliseconds.
    pub request_latency_ms: f64,
}

/// Tuning knobs for [`SessionClock`].
#[derive(Debug, Clone)]
pub struct ClockConfig {
    pub probe_interval: Duration,
    pub non_improvement_budget: u32,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(PROBE_INTERVAL_SECS),
            non_improvement_budget: NON_IMPROVEMENT_BUDGET,
        }
    }
}

#[derive(Debug, Default)]
struct ClockState {
    best: Option<TimeSample>,
    non_improvements: u32,
    last_emitted: i64,
    running: bool,
}

/// Clock synchronized against a [`TimeService`].
///
/// `start` blocks on the first probe so that a started clock can always
/// stamp, then keeps refining the estimate in the background.
pub struct SessionClock {
    service: Arc<dyn TimeService>,
    config: ClockConfig,
    state: Arc<Mutex<ClockState>>,
    probe_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionClock {
    pub fn new(service: Arc<dyn TimeService>) -> Self {
        Self::with_config(service, ClockConfig::default())
    }

    pub fn with_config(service: Arc<dyn TimeService>, config: ClockConfig) -> Self {
        Self {
            service,
            config,
            state: Arc::new(Mutex::new(ClockState::default())),
            probe_task: Mutex::new(None),
        }
    }

    /// Run the first probe and spawn the improvement loop.
    ///
    /// Fails fast when the service cannot be reached at all; no loop is
    /// left running in that case.
    pub async fn start(&self) -> Result<(), SyncError> {
        {
            let mut state = self.state.lock();
            if state.running {
                return Err(SyncError::ClockAlreadyRunning);
            }
            state.running = true;
            state.best = None;
            state.non_improvements = 0;
            // last_emitted survives restarts: one clock never goes backwards.
        }

        let first = match probe(self.service.as_ref()).await {
            Ok(sample) => sample,
            Err(err) => {
                self.state.lock().running = false;
                return Err(err);
            }
        };
        tracing::info!(
            offset_ms = first.offset_ms,
            latency_ms = first.request_latency_ms,
            "clock synchronized"
        );
        note_probe(&self.state, Some(first));

        let service = self.service.clone();
        let state = self.state.clone();
        let config = self.config.clone();
        let task = tokio::spawn(improvement_loop(service, state, config));
        *self.probe_task.lock() = Some(task);
        Ok(())
    }

    /// Halt probing and forget the current estimate. Timestamps stop
    /// being available until the next `start`.
    pub fn stop(&self) {
        if let Some(task) = self.probe_task.lock().take() {
            task.abort();
        }
        let mut state = self.state.lock();
        state.running = false;
        state.best = None;
        state.non_improvements = 0;
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// The best sample held, if the clock has started.
    pub fn current_sample(&self) -> Option<TimeSample> {
        self.state.lock().best
    }
}

impl TimestampSource for SessionClock {
    fn timestamp(&self) -> Result<i64, SyncError> {
        let mut state = self.state.lock();
        let sample = state.best.ok_or(SyncError::ClockNotStarted)?;
        let candidate = Utc::now().timestamp_millis() + sample.offset_ms;
        let next = candidate.max(state.last_emitted + 1);
        state.last_emitted = next;
        Ok(next)
    }

    fn max_error_ms(&self) -> Result<i64, SyncError> {
        let state = self.state.lock();
        let sample = state.best.ok_or(SyncError::ClockNotStarted)?;
        Ok((sample.request_latency_ms / 2.0).floor() as i64)
    }
}

impl Drop for SessionClock {
    fn drop(&mut self) {
        if let Some(task) = self.probe_task.lock().take() {
            task.abort();
        }
    }
}

/// One round trip against the service, latency-corrected.
async fn probe(service: &dyn TimeService) -> Result<TimeSample, SyncError> {
    let started = Instant::now();
    let reported = service.server_time().await?;
    let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;

    // The reading is as old as the return leg by the time it lands;
    // credit half the round trip to bring it up to now.
    let server_time_utc_ms = reported.utc_millis + (latency_ms / 2.0).floor() as i64;
    let local_time_utc_ms = Utc::now().timestamp_millis();
    Ok(TimeSample {
        offset_ms: server_time_utc_ms - local_time_utc_ms,
        server_time_utc_ms,
        local_time_utc_ms,
        request_latency_ms: latency_ms,
    })
}

/// Record a probe outcome. Adopts the sample only when strictly faster
/// than the best held; returns the consecutive non-improvement count.
fn note_probe(state: &Mutex<ClockState>, outcome: Option<TimeSample>) -> u32 {
    let mut state = state.lock();
    match outcome {
        Some(sample)
            if state
                .best
                .map_or(true, |best| sample.request_latency_ms < best.request_latency_ms) =>
        {
            tracing::debug!(
                offset_ms = sample.offset_ms,
                latency_ms = sample.request_latency_ms,
                "clock estimate improved"
            );
            state.best = Some(sample);
            state.non_improvements = 0;
        }
        _ => {
            state.non_improvements += 1;
        }
    }
    state.non_improvements
}

async fn improvement_loop(
    service: Arc<dyn TimeService>,
    state: Arc<Mutex<ClockState>>,
    config: ClockConfig,
) {
    loop {
        tokio::time::sleep(config.probe_interval).await;
        if !state.lock().running {
            break;
        }
        let outcome = match probe(service.as_ref()).await {
            Ok(sample) => Some(sample),
            Err(err) => {
                tracing::warn!(error = %err, "clock probe failed");
                None
            }
        };
        let misses = note_probe(&state, outcome);
        if misses >= config.non_improvement_budget {
            tracing::debug!(misses, "clock accuracy plateaued, probing halted");
            break;
        }
    }
}

/// Monotonic clock for single-machine sessions: zero offset, zero
/// error, no service behind it.
#[derive(Debug, Default)]
pub struct LocalClock {
    last_emitted: Mutex<i64>,
}

impl LocalClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimestampSource for LocalClock {
    fn timestamp(&self) -> Result<i64, SyncError> {
        let mut last = self.last_emitted.lock();
        let next = Utc::now().timestamp_millis().max(*last + 1);
        *last = next;
        Ok(next)
    }

    fn max_error_ms(&self) -> Result<i64, SyncError> {
        Ok(0)
    }
}

// ── Tests ───────────────────────────────────────────────────────
