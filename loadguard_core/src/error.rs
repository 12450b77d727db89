use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors, surfaced at construction or reload only.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
  #[error("breaker name must not be empty")]
  EmptyName,

  #[error("invalid memory threshold {0}: expected a fraction in (0, 1] or a percentage in (1, 100]")]
  InvalidMemoryThreshold(f64),

  #[error("invalid latency threshold: {0} ms")]
  InvalidLatencyThreshold(i64),

  #[error("invalid latency window size: {0}")]
  InvalidWindowSize(usize),

  #[error("invalid percentile: {0}")]
  InvalidPercentile(f64),

  #[error("invalid sample max age: {0} s")]
  InvalidSampleMaxAge(u64),

  #[error("invalid trend minimum sample count: {0}")]
  InvalidTrendMinSamples(usize),
}

/// Alert delivery error types
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum AlertError {
  /// Network connection errors
  #[error("network error: {0}")]
  Network(String),

  /// Delivery deadline exceeded
  #[error("timeout error: {0}")]
  Timeout(String),

  /// The alert service asked us to back off
  #[error("rate limit exceeded: {0}")]
  RateLimit(String),

  /// The alert service rejected the payload
  #[error("rejected by alert service: {0}")]
  Rejected(String),

  /// Sink misconfiguration (bad URL, missing key)
  #[error("configuration error: {0}")]
  Configuration(String),
}

impl AlertError {
  /// Check if this error type is retryable
  pub fn is_retryable(&self) -> bool {
    match self {
      AlertError::Network(_) | AlertError::Timeout(_) | AlertError::RateLimit(_) => true,
      AlertError::Rejected(_) | AlertError::Configuration(_) => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_retryable_classification() {
    assert!(AlertError::Network("conn refused".to_string()).is_retryable());
    assert!(AlertError::Timeout("10s elapsed".to_string()).is_retryable());
    assert!(AlertError::RateLimit("429".to_string()).is_retryable());
    assert!(!AlertError::Rejected("bad payload".to_string()).is_retryable());
    assert!(!AlertError::Configuration("no api key".to_string()).is_retryable());
  }
}
