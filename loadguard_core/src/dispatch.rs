//! Staged alert dispatcher.
//!
//! Turns breaker transitions into a two-phase alert flow: a
//! low-priority notification the moment the breaker opens, followed by
//! a high-priority escalation if the breaker is still open once the
//! escalation deadline passes, or an auto-resolution notice when it
//! recovered on its own. Duplicate alerts are suppressed by a
//! fingerprint-keyed cooldown.
//!
//! The breaker side hands transitions over through a bounded command
//! queue: `try_send` never blocks, and when the queue is full under a
//! burst of trips the event is dropped with a warning rather than
//! growing state without bound. A worker task drains the queue;
//! incident state lives behind one short-held mutex, deliveries run as
//! detached tasks with a hard deadline, and a background scanner owns
//! the escalation clock. No lock is ever held across a sink call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg_attr(not(test), allow(unused_imports))]
use crate::alert::{fields, AlertEvent, AlertFields, AlertKind, AlertSink, Priority};
use crate::breaker::{OpenContext, ResetKind, TripReason};
use crate::config::ConfigSnapshot;

/// Current configuration snapshot, swapped atomically on reload.
pub type SharedConfig = Arc<RwLock<Arc<ConfigSnapshot>>>;

/// Capacity of the breaker→dispatcher command queue. A burst of trips
/// beyond this drops events instead of queueing unbounded work.
const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Upper bound on the scanner cadence.
const SCAN_INTERVAL: Duration = Duration::from_secs(10);
const SCAN_INTERVAL_FLOOR: Duration = Duration::from_millis(500);

/// Hard deadline on any single sink delivery, retries included.
pub const DELIVERY_DEADLINE: Duration = Duration::from_secs(10);

/// Small latency fluctuations land in the same dedup fingerprint.
const LATENCY_BUCKET_MS: i64 = 100;

/// A pending incident is discarded this many escalation delays after it
/// was first observed, whatever state it is in.
const SAFETY_TTL_FACTOR: u32 = 3;

/// Breaker transition handed over from the hot path.
#[derive(Debug)]
enum DispatchCommand {
  Opened(OpenContext),
  Reset(ResetKind),
}

#[derive(Debug)]
struct PendingIncident {
  first_observed_at: Instant,
  deadline: Instant,
  /// Set once the initial delivery attempt has *completed*; escalation
  /// waits for it so per-incident alerts stay totally ordered.
  initial_sent: bool,
  escalated_sent: bool,
  alias: String,
  fields: AlertFields,
}

#[derive(Default)]
struct DispatchState {
  pending: HashMap<u64, PendingIncident>,
  dedup: HashMap<String, Instant>,
  next_id: u64,
  /// Alias of the most recent open alert, so reset notifications can
  /// close it at the sink.
  last_open_alias: Option<String>,
}

enum SendFollowup {
  None,
  /// Mark the incident's initial delivery as completed.
  MarkInitial(u64),
  /// Drop the incident once its escalation actually went out.
  RemoveOnSuccess(u64),
}

struct Shared {
  sink: Arc<dyn AlertSink>,
  config: SharedConfig,
  state: Mutex<DispatchState>,
  breaker_is_open: Box<dyn Fn() -> bool + Send + Sync>,
  delivery_failures: AtomicU64,
  cancel: CancellationToken,
  runtime: Handle,
}

pub struct StagedDispatcher {
  shared: Arc<Shared>,
  commands: mpsc::Sender<DispatchCommand>,
  worker: Mutex<Option<JoinHandle<()>>>,
  scanner: Mutex<Option<JoinHandle<()>>>,
}

impl StagedDispatcher {
  /// Must be called from within a Tokio runtime; the command worker,
  /// deliveries and the scanner are spawned onto it.
  pub fn new(
    sink: Arc<dyn AlertSink>,
    config: SharedConfig,
    breaker_is_open: Box<dyn Fn() -> bool + Send + Sync>,
  ) -> Self {
    let shared = Arc::new(Shared {
      sink,
      config,
      state: Mutex::new(DispatchState::default()),
      breaker_is_open,
      delivery_failures: AtomicU64::new(0),
      cancel: CancellationToken::new(),
      runtime: Handle::current(),
    });

    let (commands, mut command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let worker_shared = shared.clone();
    let worker = shared.runtime.clone().spawn(async move {
      loop {
        tokio::select! {
          _ = worker_shared.cancel.cancelled() => break,
          command = command_rx.recv() => match command {
            Some(DispatchCommand::Opened(ctx)) => worker_shared.handle_opened(ctx),
            Some(DispatchCommand::Reset(kind)) => worker_shared.handle_reset(kind),
            None => break,
          },
        }
      }
      debug!("dispatch worker stopped");
    });

    Self {
      shared,
      commands,
      worker: Mutex::new(Some(worker)),
      scanner: Mutex::new(None),
    }
  }

  /// Start the background scanner if it is not already running.
  /// Harmless to call repeatedly; single-shot configurations never
  /// need it.
  pub fn ensure_scanner(&self) {
    let mut guard = self.scanner.lock();
    if guard.is_some() {
      return;
    }
    let shared = self.shared.clone();
    let handle = shared.runtime.clone().spawn(async move {
      loop {
        let delay = scan_delay(&shared.current_config());
        tokio::select! {
          _ = shared.cancel.cancelled() => break,
          _ = tokio::time::sleep(delay) => shared.scan(),
        }
      }
      debug!("incident scanner stopped");
    });
    *guard = Some(handle);
  }

  /// The breaker just tripped open. Never blocks: the transition is
  /// enqueued, and dropped with a warning when the queue is full.
  pub fn on_breaker_opened(&self, ctx: OpenContext) {
    self.enqueue(DispatchCommand::Opened(ctx));
  }

  /// The breaker closed, either by operator action or on its own.
  pub fn on_breaker_reset(&self, kind: ResetKind) {
    self.enqueue(DispatchCommand::Reset(kind));
  }

  fn enqueue(&self, command: DispatchCommand) {
    match self.commands.try_send(command) {
      Ok(()) => {}
      Err(TrySendError::Full(command)) => {
        warn!(?command, "dispatch queue full; dropping breaker event");
      }
      Err(TrySendError::Closed(command)) => {
        debug!(?command, "dispatcher stopped; dropping breaker event");
      }
    }
  }

  pub fn pending_incidents(&self) -> usize {
    self.shared.state.lock().pending.len()
  }

  pub fn delivery_failures(&self) -> u64 {
    self.shared.delivery_failures.load(Ordering::Relaxed)
  }

  /// Stop the worker and scanner and cancel in-flight deliveries.
  /// Idempotent.
  pub async fn shutdown(&self) {
    self.shared.cancel.cancel();
    for slot in [&self.worker, &self.scanner] {
      let handle = slot.lock().take();
      if let Some(handle) = handle {
        if let Err(error) = handle.await {
          warn!(error = %error, "dispatcher task join failed");
        }
      }
    }
    let pending = self.shared.state.lock().pending.len();
    if pending > 0 {
      info!(pending, "dispatcher stopped with pending incidents");
    }
  }
}

impl Shared {
  fn current_config(&self) -> Arc<ConfigSnapshot> {
    self.config.read().clone()
  }

  /// Process one breaker-open transition off the command queue.
  fn handle_opened(self: &Arc<Self>, ctx: OpenContext) {
    let cfg = self.current_config();
    let now = Instant::now();
    let alias = open_alias(&cfg, &ctx);
    let mut open_fields = build_open_fields(&cfg, &ctx);
    open_fields.insert(fields::ALIAS.to_string(), alias.clone());

    self.state.lock().last_open_alias = Some(alias.clone());

    if cfg.on_open {
      match cfg.escalate_after {
        Some(delay) => {
          let suppressed = !self.dedup_allows(&alias, now);
          let id = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.pending.insert(
              id,
              PendingIncident {
                first_observed_at: now,
                deadline: now + delay,
                // A suppressed initial leaves nothing to order behind.
                initial_sent: suppressed,
                escalated_sent: false,
                alias: alias.clone(),
                fields: open_fields.clone(),
              },
            );
            id
          };
          info!(
            incident = id,
            escalate_after_secs = delay.as_secs(),
            "staged incident opened"
          );
          if !suppressed {
            self.spawn_send(
              AlertEvent {
                kind: AlertKind::Open,
                priority: cfg.initial_priority,
                fields: open_fields.clone(),
                dedup_key: alias.clone(),
                at: now,
              },
              SendFollowup::MarkInitial(id),
            );
          }
        }
        None => {
          if self.dedup_allows(&alias, now) {
            self.spawn_send(
              AlertEvent {
                kind: AlertKind::Open,
                priority: cfg.initial_priority,
                fields: open_fields.clone(),
                dedup_key: alias.clone(),
                at: now,
              },
              SendFollowup::None,
            );
          }
        }
      }
    }

    // Kind-specific single-shot alerts ride along with the open, each
    // behind its own trigger switch and fingerprint.
    match ctx.reason {
      TripReason::Memory if cfg.on_memory => {
        let key = memory_key(&cfg.name, ctx.memory_usage_percent);
        if self.dedup_allows(&key, now) {
          let mut memory_fields = open_fields.clone();
          memory_fields.insert(fields::ALIAS.to_string(), key.clone());
          self.spawn_send(
            AlertEvent {
              kind: AlertKind::Memory,
              priority: cfg.initial_priority,
              fields: memory_fields,
              dedup_key: key,
              at: now,
            },
            SendFollowup::None,
          );
        }
      }
      reason if reason.is_latency() && cfg.on_latency => {
        let key = latency_key(&cfg.name, ctx.percentile_ms);
        if self.dedup_allows(&key, now) {
          let mut latency_fields = open_fields.clone();
          latency_fields.insert(fields::ALIAS.to_string(), key.clone());
          self.spawn_send(
            AlertEvent {
              kind: AlertKind::Latency,
              priority: cfg.initial_priority,
              fields: latency_fields,
              dedup_key: key,
              at: now,
            },
            SendFollowup::None,
          );
        }
      }
      _ => {}
    }
  }

  /// Process one breaker-reset transition off the command queue.
  fn handle_reset(self: &Arc<Self>, kind: ResetKind) {
    let cfg = self.current_config();
    let now = Instant::now();
    let resolution = match kind {
      ResetKind::Manual => "manual",
      ResetKind::Recovered => "automatic",
    };

    let (drained, last_alias) = {
      let mut state = self.state.lock();
      let drained: Vec<PendingIncident> = state.pending.drain().map(|(_, inc)| inc).collect();
      (drained, state.last_open_alias.clone())
    };

    if !cfg.on_reset {
      if !drained.is_empty() {
        info!(count = drained.len(), resolution, "pending incidents cleared");
      }
      return;
    }

    if cfg.staged() {
      if !drained.is_empty() {
        info!(count = drained.len(), resolution, "pending incidents cleared");
      }
      for incident in drained {
        // Escalated incidents already paged someone; stay quiet.
        if incident.escalated_sent {
          continue;
        }
        let key = reset_key(&cfg.name);
        if !self.dedup_allows(&key, now) {
          continue;
        }
        let mut reset_fields = incident.fields.clone();
        reset_fields.insert(fields::RESOLUTION.to_string(), resolution.to_string());
        self.spawn_send(
          AlertEvent {
            kind: AlertKind::Reset,
            priority: cfg.initial_priority,
            fields: reset_fields,
            dedup_key: key,
            at: now,
          },
          SendFollowup::None,
        );
      }
    } else {
      let key = reset_key(&cfg.name);
      if self.dedup_allows(&key, now) {
        let mut reset_fields = AlertFields::new();
        reset_fields.insert(fields::BREAKER.to_string(), cfg.name.clone());
        reset_fields.insert(fields::RESOLUTION.to_string(), resolution.to_string());
        if let Some(alias) = last_alias {
          reset_fields.insert(fields::ALIAS.to_string(), alias);
        }
        self.spawn_send(
          AlertEvent {
            kind: AlertKind::Reset,
            priority: cfg.initial_priority,
            fields: reset_fields,
            dedup_key: key,
            at: now,
          },
          SendFollowup::None,
        );
      }
    }
  }

  /// Check-and-record the cooldown gate for `key`. A zero cooldown
  /// disables deduplication entirely.
  fn dedup_allows(&self, key: &str, now: Instant) -> bool {
    let cooldown = self.current_config().alert_cooldown;
    if cooldown.is_zero() {
      return true;
    }
    let mut state = self.state.lock();
    if let Some(&last) = state.dedup.get(key) {
      if now.saturating_duration_since(last) < cooldown {
        debug!(key, "alert suppressed by cooldown");
        return false;
      }
    }
    state.dedup.insert(key.to_string(), now);
    state
      .dedup
      .retain(|_, &mut at| now.saturating_duration_since(at) <= cooldown);
    true
  }

  /// Deliver one event on a detached task under the hard deadline.
  /// Errors are logged and counted, never propagated.
  fn spawn_send(self: &Arc<Self>, event: AlertEvent, followup: SendFollowup) {
    let shared = self.clone();
    self.runtime.spawn(async move {
      let kind = event.kind;
      let key = event.dedup_key.clone();
      let outcome = tokio::select! {
        _ = shared.cancel.cancelled() => {
          debug!(kind = kind.as_str(), "alert send cancelled");
          None
        }
        result = timeout(DELIVERY_DEADLINE, event.deliver(shared.sink.as_ref())) => Some(result),
      };

      let success = match outcome {
        Some(Ok(Ok(()))) => {
          debug!(kind = kind.as_str(), key = %key, "alert delivered");
          true
        }
        Some(Ok(Err(error))) => {
          shared.delivery_failures.fetch_add(1, Ordering::Relaxed);
          warn!(kind = kind.as_str(), key = %key, error = %error, "alert delivery failed");
          false
        }
        Some(Err(_)) => {
          shared.delivery_failures.fetch_add(1, Ordering::Relaxed);
          warn!(kind = kind.as_str(), key = %key, "alert delivery timed out");
          false
        }
        None => false,
      };

      match followup {
        SendFollowup::None => {}
        SendFollowup::MarkInitial(id) => {
          if let Some(incident) = shared.state.lock().pending.get_mut(&id) {
            incident.initial_sent = true;
          }
        }
        SendFollowup::RemoveOnSuccess(id) => {
          if success {
            shared.state.lock().pending.remove(&id);
          }
        }
      }
    });
  }

  /// One scanner pass: expire over-age incidents, then escalate or
  /// auto-resolve everything past its deadline.
  fn scan(self: &Arc<Self>) {
    let cfg = self.current_config();
    let Some(delay) = cfg.escalate_after else {
      return;
    };
    let ttl = delay * SAFETY_TTL_FACTOR;
    let now = Instant::now();

    let due: Vec<u64> = {
      let mut state = self.state.lock();
      state.pending.retain(|id, incident| {
        let keep = now.saturating_duration_since(incident.first_observed_at) <= ttl;
        if !keep {
          warn!(incident = *id, "pending incident exceeded safety ttl; discarding");
        }
        keep
      });
      state
        .pending
        .iter()
        .filter(|(_, inc)| now >= inc.deadline && inc.initial_sent && !inc.escalated_sent)
        .map(|(id, _)| *id)
        .collect()
    };
    if due.is_empty() {
      return;
    }

    // Queried outside both locks; one answer covers the whole pass.
    let open = (self.breaker_is_open)();

    for id in due {
      if open {
        let event = {
          let mut state = self.state.lock();
          let Some(incident) = state.pending.get_mut(&id) else {
            continue;
          };
          incident.escalated_sent = true;
          AlertEvent {
            kind: AlertKind::Open,
            priority: cfg.escalated_priority,
            fields: incident.fields.clone(),
            dedup_key: incident.alias.clone(),
            at: now,
          }
        };
        if cfg.on_open {
          info!(
            incident = id,
            priority = cfg.escalated_priority.as_str(),
            "incident escalated"
          );
          self.spawn_send(event, SendFollowup::RemoveOnSuccess(id));
        } else {
          self.state.lock().pending.remove(&id);
        }
      } else {
        let Some(incident) = self.state.lock().pending.remove(&id) else {
          continue;
        };
        info!(incident = id, "incident auto-resolved");
        if cfg.on_reset {
          let key = reset_key(&cfg.name);
          if self.dedup_allows(&key, now) {
            let mut reset_fields = incident.fields.clone();
            reset_fields.insert(fields::RESOLUTION.to_string(), "automatic".to_string());
            self.spawn_send(
              AlertEvent {
                kind: AlertKind::Reset,
                priority: cfg.initial_priority,
                fields: reset_fields,
                dedup_key: key,
                at: now,
              },
              SendFollowup::None,
            );
          }
        }
      }
    }
  }
}

/// Scanner cadence: half the escalation delay, clamped so a short
/// deadline is noticed promptly and a long one does not spin.
fn scan_delay(cfg: &ConfigSnapshot) -> Duration {
  match cfg.escalate_after {
    Some(delay) => (delay / 2).clamp(SCAN_INTERVAL_FLOOR, SCAN_INTERVAL),
    None => SCAN_INTERVAL,
  }
}

fn latency_bucket(ms: i64) -> i64 {
  (ms / LATENCY_BUCKET_MS) * LATENCY_BUCKET_MS
}

fn open_alias(cfg: &ConfigSnapshot, ctx: &OpenContext) -> String {
  format!(
    "{}:open:{}:{}:{}",
    cfg.name,
    latency_bucket(ctx.percentile_ms),
    ctx.memory_ok,
    cfg.wait.as_secs()
  )
}

fn memory_key(name: &str, usage_percent: Option<f64>) -> String {
  let rounded = usage_percent.map(|u| u.round() as i64).unwrap_or(-1);
  format!("{name}:memory:{rounded}")
}

fn latency_key(name: &str, percentile_ms: i64) -> String {
  format!("{name}:latency:{}", latency_bucket(percentile_ms))
}

fn reset_key(name: &str) -> String {
  format!("{name}:reset")
}

fn build_open_fields(cfg: &ConfigSnapshot, ctx: &OpenContext) -> AlertFields {
  let mut out = AlertFields::new();
  out.insert(fields::BREAKER.to_string(), cfg.name.clone());
  out.insert(fields::REASON.to_string(), ctx.reason.as_str().to_string());
  out.insert(fields::LATENCY_MS.to_string(), ctx.percentile_ms.to_string());
  out.insert(
    fields::THRESHOLD_MS.to_string(),
    cfg.latency_threshold_ms.to_string(),
  );
  out.insert(
    fields::PEAK_LATENCY_MS.to_string(),
    ctx.peak_latency_ms.to_string(),
  );
  out.insert(fields::MEMORY_OK.to_string(), ctx.memory_ok.to_string());
  out.insert(
    fields::WAIT_SECONDS.to_string(),
    cfg.wait.as_secs().to_string(),
  );
  if let Some(usage) = ctx.memory_usage_percent {
    out.insert(fields::MEMORY_USAGE_PERCENT.to_string(), format!("{usage:.1}"));
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::BreakerConfig;
  use crate::error::AlertError;
  use async_trait::async_trait;
  use std::sync::atomic::AtomicBool;

  #[derive(Debug, Clone, PartialEq)]
  struct Recorded {
    kind: AlertKind,
    priority: Priority,
    resolution: Option<String>,
  }

  #[derive(Default)]
  struct RecordingSink {
    events: std::sync::Mutex<Vec<Recorded>>,
    fail_opens: AtomicBool,
  }

  impl RecordingSink {
    fn record(&self, kind: AlertKind, priority: Priority, alert_fields: &AlertFields) {
      self.events.lock().unwrap().push(Recorded {
        kind,
        priority,
        resolution: alert_fields.get(fields::RESOLUTION).cloned(),
      });
    }

    fn events(&self) -> Vec<Recorded> {
      self.events.lock().unwrap().clone()
    }

    fn of_kind(&self, kind: AlertKind) -> Vec<Recorded> {
      self.events().into_iter().filter(|e| e.kind == kind).collect()
    }
  }

  #[async_trait]
  impl AlertSink for RecordingSink {
    async fn open_alert(&self, priority: Priority, f: AlertFields) -> Result<(), AlertError> {
      if self.fail_opens.load(Ordering::Relaxed) {
        return Err(AlertError::Network("injected".to_string()));
      }
      self.record(AlertKind::Open, priority, &f);
      Ok(())
    }
    async fn reset_alert(&self, priority: Priority, f: AlertFields) -> Result<(), AlertError> {
      self.record(AlertKind::Reset, priority, &f);
      Ok(())
    }
    async fn memory_alert(&self, priority: Priority, f: AlertFields) -> Result<(), AlertError> {
      self.record(AlertKind::Memory, priority, &f);
      Ok(())
    }
    async fn latency_alert(&self, priority: Priority, f: AlertFields) -> Result<(), AlertError> {
      self.record(AlertKind::Latency, priority, &f);
      Ok(())
    }
  }

  fn shared_config(config: BreakerConfig) -> SharedConfig {
    Arc::new(RwLock::new(Arc::new(config.validate().unwrap())))
  }

  fn latency_context() -> OpenContext {
    OpenContext {
      reason: TripReason::Latency,
      percentile_ms: 742,
      peak_latency_ms: 910,
      memory_ok: true,
      memory_usage_percent: None,
    }
  }

  async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
  }

  fn dispatcher(
    config: SharedConfig,
    sink: Arc<RecordingSink>,
    open_flag: Arc<AtomicBool>,
  ) -> StagedDispatcher {
    StagedDispatcher::new(
      sink,
      config,
      Box::new(move || open_flag.load(Ordering::Relaxed)),
    )
  }

  #[tokio::test(start_paused = true)]
  async fn test_staged_initial_then_escalated() {
    let sink = Arc::new(RecordingSink::default());
    let open = Arc::new(AtomicBool::new(true));
    let dispatcher = dispatcher(
      shared_config(BreakerConfig {
        time_before_send_alert: 2,
        alert_cooldown_seconds: 0,
        trigger_on_latency: false,
        ..Default::default()
      }),
      sink.clone(),
      open.clone(),
    );
    dispatcher.ensure_scanner();

    dispatcher.on_breaker_opened(latency_context());
    settle().await;

    let opens = sink.of_kind(AlertKind::Open);
    assert_eq!(opens.len(), 1);
    assert_eq!(opens[0].priority, Priority::P3);

    tokio::time::sleep(Duration::from_secs(4)).await;

    let opens = sink.of_kind(AlertKind::Open);
    assert_eq!(opens.len(), 2, "escalation expected after the deadline");
    assert_eq!(opens[1].priority, Priority::P1);
    assert_eq!(dispatcher.pending_incidents(), 0);

    // Escalated incidents stay quiet on a later reset.
    dispatcher.on_breaker_reset(ResetKind::Manual);
    settle().await;
    assert!(sink.of_kind(AlertKind::Reset).is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_reset_before_deadline_cancels_escalation() {
    let sink = Arc::new(RecordingSink::default());
    let open = Arc::new(AtomicBool::new(true));
    let dispatcher = dispatcher(
      shared_config(BreakerConfig {
        time_before_send_alert: 30,
        alert_cooldown_seconds: 0,
        trigger_on_latency: false,
        ..Default::default()
      }),
      sink.clone(),
      open.clone(),
    );
    dispatcher.ensure_scanner();

    dispatcher.on_breaker_opened(latency_context());
    settle().await;
    open.store(false, Ordering::Relaxed);
    dispatcher.on_breaker_reset(ResetKind::Manual);
    settle().await;

    tokio::time::sleep(Duration::from_secs(120)).await;

    let opens = sink.of_kind(AlertKind::Open);
    assert_eq!(opens.len(), 1, "no escalation after reset");
    let resets = sink.of_kind(AlertKind::Reset);
    assert_eq!(resets.len(), 1);
    assert_eq!(resets[0].resolution.as_deref(), Some("manual"));
    assert_eq!(dispatcher.pending_incidents(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_auto_recovery_resolves_instead_of_escalating() {
    let sink = Arc::new(RecordingSink::default());
    let open = Arc::new(AtomicBool::new(true));
    let dispatcher = dispatcher(
      shared_config(BreakerConfig {
        time_before_send_alert: 3,
        alert_cooldown_seconds: 0,
        trigger_on_latency: false,
        ..Default::default()
      }),
      sink.clone(),
      open.clone(),
    );
    dispatcher.ensure_scanner();

    dispatcher.on_breaker_opened(latency_context());
    settle().await;
    open.store(false, Ordering::Relaxed);

    tokio::time::sleep(Duration::from_secs(6)).await;

    let opens = sink.of_kind(AlertKind::Open);
    assert_eq!(opens.len(), 1, "never escalated");
    let resets = sink.of_kind(AlertKind::Reset);
    assert_eq!(resets.len(), 1);
    assert_eq!(resets[0].resolution.as_deref(), Some("automatic"));
    assert_eq!(dispatcher.pending_incidents(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_single_shot_mode_sends_one_open_and_one_reset() {
    let sink = Arc::new(RecordingSink::default());
    let open = Arc::new(AtomicBool::new(true));
    let dispatcher = dispatcher(
      shared_config(BreakerConfig {
        time_before_send_alert: 0,
        alert_cooldown_seconds: 0,
        trigger_on_latency: false,
        ..Default::default()
      }),
      sink.clone(),
      open.clone(),
    );

    dispatcher.on_breaker_opened(latency_context());
    dispatcher.on_breaker_reset(ResetKind::Recovered);
    settle().await;

    assert_eq!(sink.of_kind(AlertKind::Open).len(), 1);
    let resets = sink.of_kind(AlertKind::Reset);
    assert_eq!(resets.len(), 1);
    assert_eq!(resets[0].resolution.as_deref(), Some("automatic"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_cooldown_suppresses_duplicate_opens() {
    let sink = Arc::new(RecordingSink::default());
    let open = Arc::new(AtomicBool::new(true));
    let dispatcher = dispatcher(
      shared_config(BreakerConfig {
        time_before_send_alert: 0,
        alert_cooldown_seconds: 300,
        trigger_on_latency: false,
        ..Default::default()
      }),
      sink.clone(),
      open.clone(),
    );

    dispatcher.on_breaker_opened(latency_context());
    dispatcher.on_breaker_opened(latency_context());
    settle().await;
    assert_eq!(sink.of_kind(AlertKind::Open).len(), 1);

    tokio::time::sleep(Duration::from_secs(301)).await;
    dispatcher.on_breaker_opened(latency_context());
    settle().await;
    assert_eq!(sink.of_kind(AlertKind::Open).len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_command_queue_bounded_under_burst() {
    let sink = Arc::new(RecordingSink::default());
    let open = Arc::new(AtomicBool::new(true));
    let dispatcher = dispatcher(
      shared_config(BreakerConfig {
        time_before_send_alert: 600,
        alert_cooldown_seconds: 0,
        trigger_on_latency: false,
        ..Default::default()
      }),
      sink.clone(),
      open.clone(),
    );

    // No await between sends, so the worker cannot drain: everything
    // past the queue capacity must be dropped, not accumulated.
    for _ in 0..COMMAND_QUEUE_CAPACITY + 16 {
      dispatcher.on_breaker_opened(latency_context());
    }
    settle().await;

    assert_eq!(dispatcher.pending_incidents(), COMMAND_QUEUE_CAPACITY);
    assert_eq!(sink.of_kind(AlertKind::Open).len(), COMMAND_QUEUE_CAPACITY);
  }

  #[tokio::test(start_paused = true)]
  async fn test_safety_ttl_discards_stuck_incidents() {
    let sink = Arc::new(RecordingSink::default());
    sink.fail_opens.store(true, Ordering::Relaxed);
    let open = Arc::new(AtomicBool::new(true));
    let dispatcher = dispatcher(
      shared_config(BreakerConfig {
        time_before_send_alert: 2,
        alert_cooldown_seconds: 0,
        trigger_on_latency: false,
        ..Default::default()
      }),
      sink.clone(),
      open.clone(),
    );
    dispatcher.ensure_scanner();

    dispatcher.on_breaker_opened(latency_context());
    settle().await;

    // Initial and escalated deliveries both fail; the incident lingers
    // with escalated_sent set until the ttl sweep removes it.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(dispatcher.pending_incidents(), 0);
    assert!(sink.of_kind(AlertKind::Open).is_empty());
    assert!(dispatcher.delivery_failures() >= 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_trigger_switches_gate_each_kind() {
    let sink = Arc::new(RecordingSink::default());
    let open = Arc::new(AtomicBool::new(true));
    let dispatcher = dispatcher(
      shared_config(BreakerConfig {
        time_before_send_alert: 0,
        alert_cooldown_seconds: 0,
        trigger_on_open: false,
        trigger_on_memory: true,
        ..Default::default()
      }),
      sink.clone(),
      open.clone(),
    );

    dispatcher.on_breaker_opened(OpenContext {
      reason: TripReason::Memory,
      percentile_ms: 120,
      peak_latency_ms: 200,
      memory_ok: false,
      memory_usage_percent: Some(91.4),
    });
    settle().await;

    assert!(sink.of_kind(AlertKind::Open).is_empty());
    assert_eq!(sink.of_kind(AlertKind::Memory).len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_latency_trip_emits_latency_alert() {
    let sink = Arc::new(RecordingSink::default());
    let open = Arc::new(AtomicBool::new(true));
    let dispatcher = dispatcher(
      shared_config(BreakerConfig {
        time_before_send_alert: 0,
        alert_cooldown_seconds: 0,
        ..Default::default()
      }),
      sink.clone(),
      open.clone(),
    );

    dispatcher.on_breaker_opened(latency_context());
    settle().await;

    assert_eq!(sink.of_kind(AlertKind::Open).len(), 1);
    assert_eq!(sink.of_kind(AlertKind::Latency).len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_shutdown_is_idempotent_and_drops_late_events() {
    let sink = Arc::new(RecordingSink::default());
    let open = Arc::new(AtomicBool::new(true));
    let dispatcher = dispatcher(
      shared_config(BreakerConfig {
        time_before_send_alert: 5,
        ..Default::default()
      }),
      sink.clone(),
      open,
    );
    dispatcher.ensure_scanner();
    dispatcher.shutdown().await;
    dispatcher.shutdown().await;

    // Events after shutdown are dropped, not queued.
    dispatcher.on_breaker_opened(latency_context());
    settle().await;
    assert!(sink.events().is_empty());
    assert_eq!(dispatcher.pending_incidents(), 0);
  }

  #[test]
  fn test_fingerprints_bucket_small_fluctuations() {
    assert_eq!(latency_bucket(742), 700);
    assert_eq!(latency_bucket(799), 700);
    assert_eq!(latency_bucket(800), 800);
    assert_eq!(memory_key("api", Some(91.4)), "api:memory:91");
    assert_eq!(memory_key("api", None), "api:memory:-1");
    assert_eq!(latency_key("api", 742), "api:latency:700");
  }
}
