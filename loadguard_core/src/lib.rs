//! Overload circuit breaker for request-handling services.
//!
//! Callers ask [`Coordinator::allow`] whether a request may proceed,
//! run their work, then report the elapsed time with
//! [`Coordinator::done`]. The breaker watches two live health signals
//! — process memory pressure and windowed latency percentiles — trips
//! open when either indicates distress, cools off, and probes recovery
//! as a single atomic decision. State transitions feed a staged alert
//! flow (low-priority notice first, high-priority escalation if the
//! incident persists) through a pluggable [`AlertSink`].

pub mod alert;
pub mod breaker;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod memory;
pub mod window;

// Re-export core types and traits
pub use alert::{
  opsgenie::{OpsgenieConfig, OpsgenieRegion, OpsgenieSink},
  AlertEvent, AlertFields, AlertKind, AlertSink, Priority,
};
pub use breaker::{BreakerState, ResetKind, TripReason};
pub use config::{BreakerConfig, ConfigSnapshot, TrendParams};
pub use coordinator::{Coordinator, StatusView};
pub use error::{AlertError, ConfigError};
pub use memory::MemoryProbe;
pub use window::{LatencySample, LatencyWindow};
