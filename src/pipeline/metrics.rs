//! In-process pipeline counters and status snapshot.
//!
//! Both loops share one [`PipelineMetrics`]. With the `otel` feature the
//! counters are mirrored onto the instruments in `utils::metrics`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Reconciliation loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Polling,
    Routing,
    Committing,
    Backoff,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Idle => "idle",
            LoopState::Polling => "polling",
            LoopState::Routing => "routing",
            LoopState::Committing => "committing",
            LoopState::Backoff => "backoff",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => LoopState::Polling,
            2 => LoopState::Routing,
            3 => LoopState::Committing,
            4 => LoopState::Backoff,
            _ => LoopState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LoopState::Idle => 0,
            LoopState::Polling => 1,
            LoopState::Routing => 2,
            LoopState::Committing => 3,
            LoopState::Backoff => 4,
        }
    }
}

/// Point-in-time view of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStatus {
    pub running: bool,
    pub state: LoopState,
    pub checkpoint_position: u64,
    /// Consecutive failed cycles; reset by a successful cycle.
    pub error_count: u64,
    /// Failed cycles since start.
    pub cycle_failures: u64,
    pub events_per_minute: u64,
    /// Ledger head minus checkpoint, once the head is known.
    pub consumer_lag: Option<u64>,
    pub last_heartbeat_age: Duration,
    pub events_processed: u64,
    pub reward_failures: u64,
    pub retry_successes: u64,
    pub retries_failed: u64,
    pub abandoned: u64,
    pub query_errors: u64,
}

#[derive(Debug)]
pub struct PipelineMetrics {
    running: AtomicBool,
    state: AtomicU8,
    checkpoint: AtomicU64,
    head: AtomicU64,
    error_count: AtomicU64,
    cycle_failures: AtomicU64,
    events_processed: AtomicU64,
    reward_failures: AtomicU64,
    retry_successes: AtomicU64,
    retries_failed: AtomicU64,
    abandoned: AtomicU64,
    query_errors: AtomicU64,
    heartbeat: Mutex<Instant>,
    recent: Mutex<VecDeque<Instant>>,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(false),
            state: AtomicU8::new(LoopState::Idle.as_u8()),
            checkpoint: AtomicU64::new(0),
            head: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            cycle_failures: AtomicU64::new(0),
            events_processed: AtomicU64::new(0),
            reward_failures: AtomicU64::new(0),
            retry_successes: AtomicU64::new(0),
            retries_failed: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            query_errors: AtomicU64::new(0),
            heartbeat: Mutex::new(Instant::now()),
            recent: Mutex::new(VecDeque::new()),
        }
    }
}

impl PipelineMetrics {
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    pub fn set_state(&self, state: LoopState) {
        self.state.store(state.as_u8(), Ordering::Relaxed);
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn heartbeat(&self) {
        *self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn set_checkpoint(&self, position: u64) {
        self.checkpoint.store(position, Ordering::Relaxed);
    }

    pub fn observe_head(&self, head: u64) {
        self.head.fetch_max(head, Ordering::Relaxed);
    }

    pub fn checkpoint_advanced(&self, position: u64) {
        self.set_checkpoint(position);
        #[cfg(feature = "otel")]
        crate::utils::metrics::CHECKPOINT_ADVANCES_TOTAL.add(1, &[]);
    }

    pub fn cycle_succeeded(&self) {
        self.error_count.store(0, Ordering::Relaxed);
    }

    /// Returns the number of consecutive failed cycles.
    pub fn cycle_failed(&self) -> u64 {
        self.cycle_failures.fetch_add(1, Ordering::Relaxed);
        self.error_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn event_processed(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        recent.push_back(now);
        prune(&mut recent, now);
        #[cfg(feature = "otel")]
        crate::utils::metrics::EVENTS_PROCESSED_TOTAL.add(1, &[]);
    }

    pub fn reward_failed(&self) {
        self.reward_failures.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        crate::utils::metrics::REWARD_FAILURES_TOTAL.add(1, &[]);
    }

    pub fn query_failed(&self) {
        self.query_errors.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        crate::utils::metrics::QUERY_ERRORS_TOTAL.add(1, &[]);
    }

    pub fn retry_succeeded(&self) {
        self.retry_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry_failed(&self) {
        self.retries_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        crate::utils::metrics::ABANDONED_TOTAL.add(1, &[]);
    }

    pub fn snapshot(&self) -> PipelineStatus {
        let now = Instant::now();
        let events_per_minute = {
            let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
            prune(&mut recent, now);
            recent.len() as u64
        };
        let heartbeat = *self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
        let checkpoint = self.checkpoint.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);

        PipelineStatus {
            running: self.running.load(Ordering::Relaxed),
            state: self.state(),
            checkpoint_position: checkpoint,
            error_count: self.error_count.load(Ordering::Relaxed),
            cycle_failures: self.cycle_failures.load(Ordering::Relaxed),
            events_per_minute,
            consumer_lag: (head > 0).then(|| head.saturating_sub(checkpoint)),
            last_heartbeat_age: now.saturating_duration_since(heartbeat),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            reward_failures: self.reward_failures.load(Ordering::Relaxed),
            retry_successes: self.retry_successes.load(Ordering::Relaxed),
            retries_failed: self.retries_failed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            query_errors: self.query_errors.load(Ordering::Relaxed),
        }
    }
}

fn prune(recent: &mut VecDeque<Instant>, now: Instant) {
    while recent
        .front()
        .is_some_and(|t| now.saturating_duration_since(*t) > RATE_WINDOW)
    {
        recent.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_defaults() {
        let metrics = PipelineMetrics::default();
        let status = metrics.snapshot();

        assert!(!status.running);
        assert_eq!(status.state, LoopState::Idle);
        assert_eq!(status.consumer_lag, None);
        assert_eq!(status.events_per_minute, 0);
    }

    #[test]
    fn test_lag_and_rate() {
        let metrics = PipelineMetrics::default();
        metrics.observe_head(120);
        metrics.observe_head(100);
        metrics.checkpoint_advanced(90);
        metrics.event_processed();
        metrics.event_processed();

        let status = metrics.snapshot();
        assert_eq!(status.consumer_lag, Some(30));
        assert_eq!(status.checkpoint_position, 90);
        assert_eq!(status.events_per_minute, 2);
        assert_eq!(status.events_processed, 2);
    }

    #[test]
    fn test_consecutive_failures_reset() {
        let metrics = PipelineMetrics::default();
        assert_eq!(metrics.cycle_failed(), 1);
        assert_eq!(metrics.cycle_failed(), 2);
        metrics.cycle_succeeded();
        assert_eq!(metrics.cycle_failed(), 1);

        let status = metrics.snapshot();
        assert_eq!(status.error_count, 1);
        assert_eq!(status.cycle_failures, 3);

        metrics.cycle_succeeded();
        let status = metrics.snapshot();
        assert_eq!(status.error_count, 0);
        assert_eq!(status.cycle_failures, 3);
    }

    #[test]
    fn test_state_round_trip() {
        let metrics = PipelineMetrics::default();
        for state in [
            LoopState::Polling,
            LoopState::Routing,
            LoopState::Committing,
            LoopState::Backoff,
            LoopState::Idle,
        ] {
            metrics.set_state(state);
            assert_eq!(metrics.state(), state);
        }
    }
}
