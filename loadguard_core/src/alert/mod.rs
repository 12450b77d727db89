// Alert boundary - types crossing into pluggable delivery backends

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::AlertError;

pub mod opsgenie;
pub mod retry;

/// Alert priority levels, P1 (page someone now) through P5 (informational).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
  P1,
  P2,
  P3,
  P4,
  P5,
}

impl Priority {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::P1 => "P1",
      Self::P2 => "P2",
      Self::P3 => "P3",
      Self::P4 => "P4",
      Self::P5 => "P5",
    }
  }
}

/// Kind of alert crossing the sink boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
  Open,
  Reset,
  Memory,
  Latency,
}

impl AlertKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Open => "open",
      Self::Reset => "reset",
      Self::Memory => "memory",
      Self::Latency => "latency",
    }
  }
}

/// Free-form message fields attached to every alert.
pub type AlertFields = HashMap<String, String>;

/// Well-known field keys. Sinks may rely on these being present.
pub mod fields {
  /// Deduplication key; doubles as the incident alias for sinks that
  /// close alerts by alias.
  pub const ALIAS: &str = "alias";
  pub const BREAKER: &str = "breaker";
  pub const REASON: &str = "reason";
  pub const LATENCY_MS: &str = "latency_ms";
  pub const THRESHOLD_MS: &str = "threshold_ms";
  pub const PEAK_LATENCY_MS: &str = "peak_latency_ms";
  pub const MEMORY_OK: &str = "memory_ok";
  pub const MEMORY_USAGE_PERCENT: &str = "memory_usage_percent";
  pub const WAIT_SECONDS: &str = "wait_seconds";
  /// `automatic` when the breaker recovered on its own, `manual` for
  /// operator-driven resets.
  pub const RESOLUTION: &str = "resolution";
}

/// A single alert emission, fully resolved before it reaches a sink.
#[derive(Debug, Clone)]
pub struct AlertEvent {
  pub kind: AlertKind,
  pub priority: Priority,
  pub fields: AlertFields,
  pub dedup_key: String,
  pub at: Instant,
}

/// Destination for alert events.
///
/// Implementations must enforce their own retry and timeout policy and
/// never block the caller beyond the configured delivery deadline.
/// Errors are surfaced as return values; the dispatcher logs and
/// discards them, so delivery health never affects admission decisions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertSink: Send + Sync {
  async fn open_alert(&self, priority: Priority, fields: AlertFields) -> Result<(), AlertError>;
  async fn reset_alert(&self, priority: Priority, fields: AlertFields) -> Result<(), AlertError>;
  async fn memory_alert(&self, priority: Priority, fields: AlertFields) -> Result<(), AlertError>;
  async fn latency_alert(&self, priority: Priority, fields: AlertFields)
    -> Result<(), AlertError>;
}

impl AlertEvent {
  /// Route this event to the sink operation matching its kind.
  pub async fn deliver(self, sink: &dyn AlertSink) -> Result<(), AlertError> {
    match self.kind {
      AlertKind::Open => sink.open_alert(self.priority, self.fields).await,
      AlertKind::Reset => sink.reset_alert(self.priority, self.fields).await,
      AlertKind::Memory => sink.memory_alert(self.priority, self.fields).await,
      AlertKind::Latency => sink.latency_alert(self.priority, self.fields).await,
    }
  }
}
