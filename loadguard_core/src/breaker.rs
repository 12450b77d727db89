//! Admission state machine.
//!
//! The breaker sits in the request hot path: `allow` before the work,
//! `done` after it. Both run entirely under the owning coordinator's
//! lock, never suspend, and never perform I/O; state transitions are
//! returned by value so the caller can hand them to the alert
//! dispatcher after the lock is dropped.

use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::ConfigSnapshot;
use crate::memory::MemoryProbe;
use crate::window::LatencyWindow;

/// Recent samples strictly above threshold needed for the plateau trip
/// when trend analysis rejects the window as trendless.
const PLATEAU_TRIP_MIN_SAMPLES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerState {
  Closed,
  Open,
}

/// Why the breaker tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TripReason {
  Memory,
  Latency,
  LatencyTrend,
  LatencyPlateau,
}

impl TripReason {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Memory => "memory",
      Self::Latency => "latency",
      Self::LatencyTrend => "latency-trend",
      Self::LatencyPlateau => "latency-plateau",
    }
  }

  pub fn is_latency(&self) -> bool {
    matches!(self, Self::Latency | Self::LatencyTrend | Self::LatencyPlateau)
  }
}

/// Snapshot of the conditions at the moment of the last trip.
#[derive(Debug, Clone, Serialize)]
pub struct TripSummary {
  pub reason: TripReason,
  pub peak_latency_ms: i64,
  pub percentile_ms: i64,
  pub memory_ok: bool,
  #[serde(skip)]
  pub at: Instant,
}

/// Context handed to the dispatcher when the breaker opens.
#[derive(Debug, Clone)]
pub struct OpenContext {
  pub reason: TripReason,
  pub percentile_ms: i64,
  pub peak_latency_ms: i64,
  pub memory_ok: bool,
  pub memory_usage_percent: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
  /// Operator-driven: `reset()` or `enable()`.
  Manual,
  /// The breaker closed itself after the cool-off.
  Recovered,
}

/// State transition surfaced to the coordinator.
#[derive(Debug, Clone)]
pub enum TransitionEvent {
  Opened(OpenContext),
  Reset(ResetKind),
}

pub struct Breaker {
  window: LatencyWindow,
  probe: Arc<MemoryProbe>,
  state: BreakerState,
  enabled: bool,
  last_trip_at: Option<Instant>,
  last_trip: Option<TripSummary>,
}

impl Breaker {
  pub fn new(cfg: &ConfigSnapshot, probe: Arc<MemoryProbe>) -> Self {
    Self {
      window: LatencyWindow::new(cfg.window_size, cfg.sample_max_age),
      probe,
      state: BreakerState::Closed,
      enabled: true,
      last_trip_at: None,
      last_trip: None,
    }
  }

  /// May a new request proceed?
  ///
  /// Closed: gated only by memory. Open: refused until the cool-off
  /// has elapsed *and* memory is healthy, at which point the breaker
  /// closes in a single atomic decision. A disabled breaker always
  /// answers yes.
  pub fn allow(&mut self, cfg: &ConfigSnapshot) -> (bool, Option<TransitionEvent>) {
    if !self.enabled {
      self.state = BreakerState::Closed;
      return (true, None);
    }

    match self.state {
      BreakerState::Closed => (self.probe.ok(cfg.memory_threshold), None),
      BreakerState::Open => {
        let cooled = self
          .last_trip_at
          .map(|at| at.elapsed() > cfg.wait)
          .unwrap_or(true);
        if cooled && self.probe.ok(cfg.memory_threshold) {
          self.state = BreakerState::Closed;
          info!(breaker = %cfg.name, "breaker closed after cool-off");
          (true, Some(TransitionEvent::Reset(ResetKind::Recovered)))
        } else {
          (false, None)
        }
      }
    }
  }

  /// Record a finished operation and re-evaluate health.
  ///
  /// `end < start` is caller misuse; the duration clamps to zero and
  /// the sample is still recorded. An open breaker keeps recording but
  /// never transitions here.
  pub fn done(&mut self, cfg: &ConfigSnapshot, start: Instant, end: Instant) -> Option<TransitionEvent> {
    self.window.add(start, end);

    if !self.enabled || self.state == BreakerState::Open {
      return None;
    }

    let context = self.should_trip(cfg)?;
    let now = Instant::now();
    self.state = BreakerState::Open;
    self.last_trip_at = Some(now);
    self.last_trip = Some(TripSummary {
      reason: context.reason,
      peak_latency_ms: context.peak_latency_ms,
      percentile_ms: context.percentile_ms,
      memory_ok: context.memory_ok,
      at: now,
    });
    warn!(
      breaker = %cfg.name,
      reason = context.reason.as_str(),
      percentile_ms = context.percentile_ms,
      peak_latency_ms = context.peak_latency_ms,
      "breaker opened"
    );
    Some(TransitionEvent::Opened(context))
  }

  fn should_trip(&mut self, cfg: &ConfigSnapshot) -> Option<OpenContext> {
    let memory_ok = self.probe.ok(cfg.memory_threshold);
    let percentile_ms = self.window.percentile(cfg.percentile);

    let reason = if !memory_ok {
      Some(TripReason::Memory)
    } else if percentile_ms > cfg.latency_threshold_ms {
      if !cfg.trend_enabled {
        Some(TripReason::Latency)
      } else if self.window.has_positive_trend(cfg.trend_min_samples, &cfg.trend) {
        Some(TripReason::LatencyTrend)
      } else {
        let recent = self.window.recent_values();
        let plateau = recent.len() >= PLATEAU_TRIP_MIN_SAMPLES
          && recent.iter().all(|&v| v > cfg.latency_threshold_ms);
        plateau.then_some(TripReason::LatencyPlateau)
      }
    } else {
      None
    };

    reason.map(|reason| OpenContext {
      reason,
      percentile_ms,
      peak_latency_ms: self.window.peak(),
      memory_ok,
      memory_usage_percent: self.probe.usage_percent(),
    })
  }

  /// Clear the window and force the breaker closed.
  pub fn reset(&mut self, cfg: &ConfigSnapshot) -> Option<TransitionEvent> {
    self.window.reset();
    let was_open = self.state == BreakerState::Open;
    self.state = BreakerState::Closed;
    if was_open {
      info!(breaker = %cfg.name, "breaker reset");
      Some(TransitionEvent::Reset(ResetKind::Manual))
    } else {
      None
    }
  }

  /// Re-arm the breaker; behaves as a reset.
  pub fn enable(&mut self, cfg: &ConfigSnapshot) -> Option<TransitionEvent> {
    self.enabled = true;
    self.reset(cfg)
  }

  /// Stop gating admissions. State is left as-is and cleaned up lazily
  /// on the next `allow`.
  pub fn disable(&mut self) {
    self.enabled = false;
  }

  pub fn is_enabled(&self) -> bool {
    self.enabled
  }

  pub fn is_open(&self) -> bool {
    self.enabled && self.state == BreakerState::Open
  }

  pub fn state(&self) -> BreakerState {
    self.state
  }

  pub fn last_trip(&self) -> Option<&TripSummary> {
    self.last_trip.as_ref()
  }

  pub fn recent_samples(&self) -> Vec<i64> {
    self.window.recent_values()
  }

  /// Adopt a new configuration snapshot. A changed window capacity
  /// discards sample history.
  pub fn apply_config(&mut self, cfg: &ConfigSnapshot) {
    self
      .window
      .reconfigure(cfg.window_size, cfg.sample_max_age);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::BreakerConfig;
  use std::time::Duration;

  fn snapshot(config: BreakerConfig) -> ConfigSnapshot {
    config.validate().unwrap()
  }

  fn test_probe(ok: bool) -> Arc<MemoryProbe> {
    let probe = Arc::new(MemoryProbe::new(None));
    probe.force_ok(Some(ok));
    probe
  }

  fn feed(breaker: &mut Breaker, cfg: &ConfigSnapshot, values_ms: &[i64]) -> Option<TransitionEvent> {
    let mut last = None;
    for &v in values_ms {
      let end = Instant::now();
      let start = end
        .checked_sub(Duration::from_millis(v.max(0) as u64))
        .unwrap_or(end);
      if let Some(event) = breaker.done(cfg, start, end) {
        last = Some(event);
      }
    }
    last
  }

  #[tokio::test(start_paused = true)]
  async fn test_no_trip_under_threshold() {
    let cfg = snapshot(BreakerConfig {
      latency_threshold: 600,
      percentile: 0.95,
      latency_window_size: 10,
      wait_time: 10,
      ..Default::default()
    });
    let mut breaker = Breaker::new(&cfg, test_probe(true));

    let values: Vec<i64> = (0..100).map(|i| 100 + (i * 4) % 401).collect();
    assert!(feed(&mut breaker, &cfg, &values).is_none());
    assert!(!breaker.is_open());
    assert!(breaker.allow(&cfg).0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_trip_on_rising_latencies() {
    let cfg = snapshot(BreakerConfig {
      latency_threshold: 600,
      percentile: 0.95,
      latency_window_size: 10,
      wait_time: 10,
      ..Default::default()
    });
    let mut breaker = Breaker::new(&cfg, test_probe(true));

    let event = feed(
      &mut breaker,
      &cfg,
      &[300, 350, 400, 450, 500, 550, 600, 650, 700, 750],
    );
    match event {
      Some(TransitionEvent::Opened(ctx)) => {
        assert_eq!(ctx.reason, TripReason::Latency);
        assert!(ctx.percentile_ms > 600);
      }
      other => panic!("expected open transition, got {other:?}"),
    }
    assert!(breaker.is_open());
    assert!(!breaker.allow(&cfg).0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_memory_pressure_trips_and_blocks() {
    let cfg = snapshot(BreakerConfig::default());
    let probe = test_probe(false);
    let mut breaker = Breaker::new(&cfg, probe.clone());

    // Closed but memory-gated: allow refuses without a transition.
    let (verdict, event) = breaker.allow(&cfg);
    assert!(!verdict);
    assert!(event.is_none());

    // Any completed operation trips on memory, latency regardless.
    let event = feed(&mut breaker, &cfg, &[1]);
    match event {
      Some(TransitionEvent::Opened(ctx)) => assert_eq!(ctx.reason, TripReason::Memory),
      other => panic!("expected open transition, got {other:?}"),
    }
    assert!(!breaker.allow(&cfg).0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cool_off_honored_then_recovers() {
    let cfg = snapshot(BreakerConfig {
      latency_threshold: 100,
      latency_window_size: 10,
      wait_time: 10,
      sample_max_age: Some(3600),
      ..Default::default()
    });
    let mut breaker = Breaker::new(&cfg, test_probe(true));
    assert!(feed(&mut breaker, &cfg, &[500; 6]).is_some());

    // Inside the cool-off window every allow refuses.
    for _ in 0..5 {
      tokio::time::advance(Duration::from_secs(1)).await;
      assert!(!breaker.allow(&cfg).0);
    }

    // Strictly past the cool-off the breaker closes atomically.
    tokio::time::advance(Duration::from_secs(6)).await;
    let (verdict, event) = breaker.allow(&cfg);
    assert!(verdict);
    assert!(matches!(
      event,
      Some(TransitionEvent::Reset(ResetKind::Recovered))
    ));
    assert!(!breaker.is_open());
  }

  #[tokio::test(start_paused = true)]
  async fn test_open_breaker_still_records_samples() {
    let cfg = snapshot(BreakerConfig {
      latency_threshold: 100,
      latency_window_size: 10,
      ..Default::default()
    });
    let mut breaker = Breaker::new(&cfg, test_probe(true));
    feed(&mut breaker, &cfg, &[500; 6]);
    assert!(breaker.is_open());

    let before = breaker.recent_samples().len();
    assert!(feed(&mut breaker, &cfg, &[50]).is_none());
    assert_eq!(breaker.recent_samples().len(), before + 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_disable_bypasses_gating() {
    let cfg = snapshot(BreakerConfig {
      latency_threshold: 100,
      latency_window_size: 10,
      ..Default::default()
    });
    let mut breaker = Breaker::new(&cfg, test_probe(true));
    feed(&mut breaker, &cfg, &[500; 6]);
    assert!(breaker.is_open());

    breaker.disable();
    assert!(!breaker.is_open());
    let (verdict, event) = breaker.allow(&cfg);
    assert!(verdict);
    assert!(event.is_none());
    assert!(!breaker.is_enabled());

    // Enable behaves as reset: closed, clean window.
    let event = breaker.enable(&cfg);
    assert!(event.is_none(), "state was already closed by allow");
    assert!(breaker.is_enabled());
    assert!(breaker.recent_samples().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_manual_reset_emits_event_only_when_open() {
    let cfg = snapshot(BreakerConfig {
      latency_threshold: 100,
      latency_window_size: 10,
      ..Default::default()
    });
    let mut breaker = Breaker::new(&cfg, test_probe(true));
    assert!(breaker.reset(&cfg).is_none());

    feed(&mut breaker, &cfg, &[500; 6]);
    assert!(matches!(
      breaker.reset(&cfg),
      Some(TransitionEvent::Reset(ResetKind::Manual))
    ));
    assert!(breaker.recent_samples().is_empty());
    assert!(breaker.last_trip().is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_done_with_reversed_timestamps_clamps() {
    let cfg = snapshot(BreakerConfig::default());
    let mut breaker = Breaker::new(&cfg, test_probe(true));
    let now = Instant::now();
    breaker.done(&cfg, now + Duration::from_secs(5), now);
    assert_eq!(breaker.recent_samples(), vec![0]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_trend_plateau_trip_reason() {
    let cfg = snapshot(BreakerConfig {
      latency_threshold: 300,
      latency_window_size: 16,
      trend_analysis_enabled: true,
      trend_analysis_min_sample_count: 5,
      ..Default::default()
    });
    let mut breaker = Breaker::new(&cfg, test_probe(true));

    let event = feed(&mut breaker, &cfg, &[400; 10]);
    match event {
      Some(TransitionEvent::Opened(ctx)) => {
        assert_eq!(ctx.reason, TripReason::LatencyPlateau)
      }
      other => panic!("expected plateau trip, got {other:?}"),
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_trend_rising_trip_reason() {
    let cfg = snapshot(BreakerConfig {
      latency_threshold: 300,
      latency_window_size: 32,
      trend_analysis_enabled: true,
      trend_analysis_min_sample_count: 5,
      ..Default::default()
    });
    let mut breaker = Breaker::new(&cfg, test_probe(true));

    let mut values = vec![200, 210, 220, 230, 240];
    values.extend((0..10).map(|i| 260 + i * 22));
    let event = feed(&mut breaker, &cfg, &values);
    match event {
      Some(TransitionEvent::Opened(ctx)) => {
        assert_eq!(ctx.reason, TripReason::LatencyTrend)
      }
      other => panic!("expected trend trip, got {other:?}"),
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_trend_enabled_spike_without_trend_does_not_trip() {
    let cfg = snapshot(BreakerConfig {
      latency_threshold: 300,
      latency_window_size: 16,
      trend_analysis_enabled: true,
      trend_analysis_min_sample_count: 5,
      ..Default::default()
    });
    let mut breaker = Breaker::new(&cfg, test_probe(true));

    // One huge spike drags the percentile over threshold, but there is
    // no trend and most samples sit under the limit.
    let event = feed(&mut breaker, &cfg, &[2_000, 100, 110, 90, 95, 105]);
    assert!(event.is_none(), "transient spike must not trip");
    assert!(!breaker.is_open());
  }
}
