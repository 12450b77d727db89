use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::error::AlertError;

/// Retry schedule for sink deliveries: a first attempt up front, then
/// one more attempt after each pause in a doubling, capped series.
#[derive(Debug, Clone)]
pub struct Backoff {
  /// Pause before the second attempt; later pauses double from here.
  pub first_pause: Duration,
  /// Ceiling on any single pause.
  pub max_pause: Duration,
  /// Attempts made after the first one.
  pub extra_attempts: u32,
}

impl Default for Backoff {
  fn default() -> Self {
    Self {
      first_pause: Duration::from_millis(250),
      max_pause: Duration::from_secs(2),
      extra_attempts: 2,
    }
  }
}

impl Backoff {
  /// The pauses taken between attempts.
  fn pauses(&self) -> impl Iterator<Item = Duration> + '_ {
    (0..self.extra_attempts).map(|n| (self.first_pause * 2u32.saturating_pow(n)).min(self.max_pause))
  }

  /// Drive `deliver` until it succeeds, fails permanently, or the
  /// schedule runs out. Only errors whose kind is transient
  /// (`AlertError::is_retryable`) earn another attempt.
  pub async fn run<T, F, Fut>(&self, deliver: F) -> Result<T, AlertError>
  where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, AlertError>>,
  {
    let mut outcome = deliver().await;
    for pause in self.pauses() {
      match &outcome {
        Ok(_) => break,
        Err(error) if !error.is_retryable() => break,
        Err(error) => {
          debug!(
            error = %error,
            pause_ms = pause.as_millis() as u64,
            "transient delivery error; will retry"
          );
          sleep(pause).await;
          outcome = deliver().await;
        }
      }
    }
    outcome
  }
}
