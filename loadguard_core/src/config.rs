//! # Breaker Configuration
//!
//! **Responsibility**: raw, serde-facing configuration and its validated
//! immutable snapshot. Hosts parse whatever file format they like into
//! [`BreakerConfig`]; the library only ever works from a
//! [`ConfigSnapshot`], shared as an `Arc` and swapped atomically on
//! reload.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::alert::Priority;
use crate::error::ConfigError;

/// Raw breaker configuration as a host would deserialize it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
  /// Identifier of the protected API; used in alert fields and dedup keys.
  #[serde(default = "default_name")]
  pub name: String,

  /// Fraction of the memory limit above which memory is "not OK".
  /// Values in (1, 100] are read as percentages and converted.
  #[serde(default = "default_memory_threshold")]
  pub memory_threshold: f64,

  /// Per-request latency limit in milliseconds.
  #[serde(default = "default_latency_threshold")]
  pub latency_threshold: i64,

  /// Ring-buffer capacity for latency samples.
  #[serde(default = "default_window_size")]
  pub latency_window_size: usize,

  /// Statistic compared against `latency_threshold`, in (0, 1].
  #[serde(default = "default_percentile")]
  pub percentile: f64,

  /// Minimum seconds the breaker stays open after tripping.
  #[serde(default = "default_wait_time")]
  pub wait_time: u64,

  /// Samples older than this many seconds are ignored.
  /// Defaults to `wait_time` when unset.
  #[serde(default)]
  pub sample_max_age: Option<u64>,

  /// When true, a high percentile alone does not trip unless recent
  /// samples also show a positive trend or a plateau above threshold.
  #[serde(default)]
  pub trend_analysis_enabled: bool,

  /// Minimum recent samples required to evaluate the trend.
  #[serde(default = "default_trend_min_samples")]
  pub trend_analysis_min_sample_count: usize,

  /// Minimum gap between duplicate alerts of the same key.
  #[serde(default = "default_alert_cooldown")]
  pub alert_cooldown_seconds: u64,

  /// Seconds before a still-open incident escalates; > 0 enables the
  /// staged (initial + escalated) alert flow.
  #[serde(default)]
  pub time_before_send_alert: u64,

  #[serde(default = "default_initial_priority")]
  pub initial_alert_priority: Priority,

  #[serde(default = "default_escalated_priority")]
  pub escalated_alert_priority: Priority,

  #[serde(default = "default_true")]
  pub trigger_on_open: bool,

  #[serde(default = "default_true")]
  pub trigger_on_reset: bool,

  #[serde(default = "default_true")]
  pub trigger_on_memory: bool,

  #[serde(default = "default_true")]
  pub trigger_on_latency: bool,

  /// Explicit memory limit override; when unset the limit is discovered
  /// from the container environment, and when that fails the memory
  /// gate is disabled.
  #[serde(default)]
  pub memory_limit_bytes: Option<u64>,

  /// Empirical constants of the trend detector.
  #[serde(default)]
  pub trend: TrendParams,
}

fn default_name() -> String {
  "default".to_string()
}
fn default_memory_threshold() -> f64 {
  0.85
}
fn default_latency_threshold() -> i64 {
  1_000
}
fn default_window_size() -> usize {
  256
}
fn default_percentile() -> f64 {
  0.95
}
fn default_wait_time() -> u64 {
  30
}
fn default_trend_min_samples() -> usize {
  5
}
fn default_alert_cooldown() -> u64 {
  300
}
fn default_initial_priority() -> Priority {
  Priority::P3
}
fn default_escalated_priority() -> Priority {
  Priority::P1
}
fn default_true() -> bool {
  true
}

impl Default for BreakerConfig {
  fn default() -> Self {
    Self {
      name: default_name(),
      memory_threshold: default_memory_threshold(),
      latency_threshold: default_latency_threshold(),
      latency_window_size: default_window_size(),
      percentile: default_percentile(),
      wait_time: default_wait_time(),
      sample_max_age: None,
      trend_analysis_enabled: false,
      trend_analysis_min_sample_count: default_trend_min_samples(),
      alert_cooldown_seconds: default_alert_cooldown(),
      time_before_send_alert: 0,
      initial_alert_priority: default_initial_priority(),
      escalated_alert_priority: default_escalated_priority(),
      trigger_on_open: true,
      trigger_on_reset: true,
      trigger_on_memory: true,
      trigger_on_latency: true,
      memory_limit_bytes: None,
      trend: TrendParams::default(),
    }
  }
}

/// Named empirical constants of the trend detector.
///
/// The values come from production tuning; overriding them re-fits the
/// detector without touching the algorithm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendParams {
  /// Minimum total rise (ms) for the three-sample fast path.
  pub short_rise_min_ms: i64,
  /// Relative tolerance for "similar" trailing values in the plateau guard.
  pub similarity_tolerance: f64,
  /// Slopes below this (ms per sample) over a similar tail are a plateau.
  pub plateau_slope_max: f64,
  /// Every sample at or above this floor marks a "high and flat" window.
  pub high_floor_ms: i64,
  /// Maximum absolute slope still considered flat on a high floor.
  pub high_flat_slope_max: f64,
  /// Net drift ratio that turns a strict zigzag into a trend.
  pub zigzag_drift_ratio: f64,
  /// Last/first ratio for the general rising rule.
  pub rise_ratio: f64,
  /// Minimum slope accompanying the general rising rule.
  pub rise_slope_min: f64,
  /// Slope that counts as a trend on its own.
  pub fallback_slope_min: f64,
}

impl Default for TrendParams {
  fn default() -> Self {
    Self {
      short_rise_min_ms: 20,
      similarity_tolerance: 0.05,
      plateau_slope_max: 15.0,
      high_floor_ms: 375,
      high_flat_slope_max: 3.0,
      zigzag_drift_ratio: 1.10,
      rise_ratio: 1.15,
      rise_slope_min: 2.0,
      fallback_slope_min: 8.0,
    }
  }
}

/// Validated, immutable view of a [`BreakerConfig`].
///
/// Owned by the coordinator and shared read-only with every component;
/// hot reload swaps the `Arc` and readers pick up the new snapshot on
/// their next operation.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSnapshot {
  pub name: String,
  /// Always a fraction in (0, 1] after validation.
  pub memory_threshold: f64,
  pub latency_threshold_ms: i64,
  pub window_size: usize,
  pub percentile: f64,
  #[serde(serialize_with = "secs", rename = "wait_seconds")]
  pub wait: Duration,
  /// `None` disables the age filter entirely.
  #[serde(skip)]
  pub sample_max_age: Option<Duration>,
  pub trend_enabled: bool,
  pub trend_min_samples: usize,
  #[serde(serialize_with = "secs", rename = "alert_cooldown_seconds")]
  pub alert_cooldown: Duration,
  /// `None` means single-shot alerting; `Some` enables the staged flow.
  #[serde(skip)]
  pub escalate_after: Option<Duration>,
  pub initial_priority: Priority,
  pub escalated_priority: Priority,
  pub on_open: bool,
  pub on_reset: bool,
  pub on_memory: bool,
  pub on_latency: bool,
  #[serde(skip)]
  pub memory_limit_bytes: Option<u64>,
  #[serde(skip)]
  pub trend: TrendParams,
}

fn secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
  s.serialize_u64(d.as_secs())
}

impl ConfigSnapshot {
  pub fn staged(&self) -> bool {
    self.escalate_after.is_some()
  }
}

impl BreakerConfig {
  /// Validate and freeze this configuration.
  ///
  /// The one normalization applied here is the memory threshold: a value
  /// in (1, 100] is converted from a percentage, so downstream code only
  /// ever sees a fraction.
  pub fn validate(self) -> Result<ConfigSnapshot, ConfigError> {
    if self.name.trim().is_empty() {
      return Err(ConfigError::EmptyName);
    }

    let memory_threshold = if self.memory_threshold > 0.0 && self.memory_threshold <= 1.0 {
      self.memory_threshold
    } else if self.memory_threshold > 1.0 && self.memory_threshold <= 100.0 {
      self.memory_threshold / 100.0
    } else {
      return Err(ConfigError::InvalidMemoryThreshold(self.memory_threshold));
    };

    if self.latency_threshold <= 0 {
      return Err(ConfigError::InvalidLatencyThreshold(self.latency_threshold));
    }
    if self.latency_window_size == 0 {
      return Err(ConfigError::InvalidWindowSize(self.latency_window_size));
    }
    if !(self.percentile > 0.0 && self.percentile <= 1.0) {
      return Err(ConfigError::InvalidPercentile(self.percentile));
    }
    if self.trend_analysis_min_sample_count == 0 {
      return Err(ConfigError::InvalidTrendMinSamples(
        self.trend_analysis_min_sample_count,
      ));
    }
    if let Some(0) = self.sample_max_age {
      return Err(ConfigError::InvalidSampleMaxAge(0));
    }

    let sample_max_age = match self.sample_max_age {
      Some(secs) => Some(Duration::from_secs(secs)),
      None if self.wait_time > 0 => Some(Duration::from_secs(self.wait_time)),
      None => None,
    };

    let escalate_after = if self.time_before_send_alert > 0 {
      Some(Duration::from_secs(self.time_before_send_alert))
    } else {
      None
    };

    Ok(ConfigSnapshot {
      name: self.name,
      memory_threshold,
      latency_threshold_ms: self.latency_threshold,
      window_size: self.latency_window_size,
      percentile: self.percentile,
      wait: Duration::from_secs(self.wait_time),
      sample_max_age,
      trend_enabled: self.trend_analysis_enabled,
      trend_min_samples: self.trend_analysis_min_sample_count,
      alert_cooldown: Duration::from_secs(self.alert_cooldown_seconds),
      escalate_after,
      initial_priority: self.initial_alert_priority,
      escalated_priority: self.escalated_alert_priority,
      on_open: self.trigger_on_open,
      on_reset: self.trigger_on_reset,
      on_memory: self.trigger_on_memory,
      on_latency: self.trigger_on_latency,
      memory_limit_bytes: self.memory_limit_bytes,
      trend: self.trend,
    })
  }
}
