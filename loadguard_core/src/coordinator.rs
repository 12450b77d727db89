//! Public façade owning every component.
//!
//! The coordinator wires the memory probe, latency window, breaker and
//! dispatcher together and exposes the host-facing API: `allow` before
//! the work, `done` after it, plus operator controls and a status
//! snapshot for whatever management surface the host runs.
//!
//! Locking is deliberately simple: one mutex around the breaker (held
//! for the whole of `allow`/`done`/`reset`), one inside the dispatcher.
//! Transition events leave the breaker section by value and reach the
//! dispatcher only after the breaker lock is dropped, so the two are
//! never held together and the hot path never waits on alerting.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

use crate::alert::AlertSink;
use crate::breaker::{Breaker, BreakerState, TransitionEvent, TripReason};
use crate::config::{BreakerConfig, ConfigSnapshot};
use crate::dispatch::{SharedConfig, StagedDispatcher};
use crate::error::ConfigError;
use crate::memory::MemoryProbe;

/// Read-only view of breaker state for management surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
  pub name: String,
  pub state: BreakerState,
  pub enabled: bool,
  pub open: bool,
  pub last_trip: Option<LastTripView>,
  pub recent_samples_ms: Vec<i64>,
  pub memory_limit_bytes: Option<u64>,
  pub memory_usage_percent: Option<f64>,
  pub pending_incidents: usize,
  pub alert_delivery_failures: u64,
  pub config: ConfigSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastTripView {
  pub reason: TripReason,
  pub peak_latency_ms: i64,
  pub percentile_ms: i64,
  pub memory_ok: bool,
  pub seconds_since: u64,
}

pub struct Coordinator {
  config: SharedConfig,
  probe: Arc<MemoryProbe>,
  breaker: Arc<Mutex<Breaker>>,
  dispatcher: Arc<StagedDispatcher>,
}

impl Coordinator {
  /// Validate `config`, build every component and wire them together.
  ///
  /// Must be called from within a Tokio runtime: alert deliveries and
  /// the escalation scanner are spawned onto it. The sink is injected
  /// and must outlive the coordinator.
  pub fn new(config: BreakerConfig, sink: Arc<dyn AlertSink>) -> Result<Self, ConfigError> {
    let snapshot = Arc::new(config.validate()?);
    let probe = Arc::new(MemoryProbe::new(snapshot.memory_limit_bytes));
    let breaker = Arc::new(Mutex::new(Breaker::new(&snapshot, probe.clone())));
    let shared_config: SharedConfig = Arc::new(RwLock::new(snapshot.clone()));

    let breaker_ref = breaker.clone();
    let dispatcher = Arc::new(StagedDispatcher::new(
      sink,
      shared_config.clone(),
      Box::new(move || breaker_ref.lock().is_open()),
    ));
    if snapshot.staged() {
      dispatcher.ensure_scanner();
    }

    info!(
      breaker = %snapshot.name,
      latency_threshold_ms = snapshot.latency_threshold_ms,
      window_size = snapshot.window_size,
      staged = snapshot.staged(),
      "breaker coordinator started"
    );

    Ok(Self {
      config: shared_config,
      probe,
      breaker,
      dispatcher,
    })
  }

  fn current(&self) -> Arc<ConfigSnapshot> {
    self.config.read().clone()
  }

  fn handle(&self, event: Option<TransitionEvent>) {
    match event {
      Some(TransitionEvent::Opened(ctx)) => self.dispatcher.on_breaker_opened(ctx),
      Some(TransitionEvent::Reset(kind)) => self.dispatcher.on_breaker_reset(kind),
      None => {}
    }
  }

  /// May a new request proceed right now?
  pub fn allow(&self) -> bool {
    let cfg = self.current();
    let (verdict, event) = self.breaker.lock().allow(&cfg);
    self.handle(event);
    verdict
  }

  /// Report a finished operation that started and ended at the given
  /// instants.
  pub fn done(&self, start: Instant, end: Instant) {
    let cfg = self.current();
    let event = self.breaker.lock().done(&cfg, start, end);
    self.handle(event);
  }

  /// Clear latency history and force the breaker closed.
  pub fn reset(&self) {
    let cfg = self.current();
    let event = self.breaker.lock().reset(&cfg);
    self.handle(event);
  }

  pub fn enable(&self) {
    let cfg = self.current();
    let event = self.breaker.lock().enable(&cfg);
    self.handle(event);
  }

  pub fn disable(&self) {
    self.breaker.lock().disable();
  }

  pub fn is_enabled(&self) -> bool {
    self.breaker.lock().is_enabled()
  }

  pub fn is_open(&self) -> bool {
    self.breaker.lock().is_open()
  }

  /// Atomically swap in a new configuration. The breaker picks it up
  /// on its next operation; a changed window capacity discards sample
  /// history.
  pub fn update_config(&self, config: BreakerConfig) -> Result<(), ConfigError> {
    let snapshot = Arc::new(config.validate()?);
    {
      let mut current = self.config.write();
      *current = snapshot.clone();
    }
    self.breaker.lock().apply_config(&snapshot);
    if snapshot.staged() {
      self.dispatcher.ensure_scanner();
    }
    info!(breaker = %snapshot.name, "configuration reloaded");
    Ok(())
  }

  /// Read-only snapshot of state, recent samples and effective config.
  pub fn snapshot_status(&self) -> StatusView {
    let cfg = self.current();
    let (state, enabled, open, last_trip, recent) = {
      let breaker = self.breaker.lock();
      (
        breaker.state(),
        breaker.is_enabled(),
        breaker.is_open(),
        breaker.last_trip().map(|trip| LastTripView {
          reason: trip.reason,
          peak_latency_ms: trip.peak_latency_ms,
          percentile_ms: trip.percentile_ms,
          memory_ok: trip.memory_ok,
          seconds_since: trip.at.elapsed().as_secs(),
        }),
        breaker.recent_samples(),
      )
    };

    StatusView {
      name: cfg.name.clone(),
      state,
      enabled,
      open,
      last_trip,
      recent_samples_ms: recent,
      memory_limit_bytes: self.probe.limit_bytes(),
      memory_usage_percent: self.probe.usage_percent(),
      pending_incidents: self.dispatcher.pending_incidents(),
      alert_delivery_failures: self.dispatcher.delivery_failures(),
      config: (*cfg).clone(),
    }
  }

  /// Memory probe handle, exposed for tests that stub the gate.
  pub fn memory_probe(&self) -> &Arc<MemoryProbe> {
    &self.probe
  }

  /// Stop the dispatcher scanner and cancel in-flight deliveries.
  /// Idempotent; the breaker itself keeps answering `allow`/`done`.
  pub async fn shutdown(&self) {
    self.dispatcher.shutdown().await;
  }
}
