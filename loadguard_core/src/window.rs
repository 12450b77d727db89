//! Time-bounded sliding window of latency samples.
//!
//! A fixed ring of timestamped millisecond durations with percentile
//! queries, age filtering, and trend analysis. The window is not
//! independently thread-safe: every method is called under the owning
//! breaker's lock.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::TrendParams;

/// One recorded operation latency. Slots that were never written are
/// `None` rather than a sentinel value.
#[derive(Debug, Clone, Copy)]
pub struct LatencySample {
  pub value_ms: i64,
  pub at: Instant,
}

pub struct LatencyWindow {
  slots: Box<[Option<LatencySample>]>,
  write_idx: usize,
  max_age: Option<Duration>,
  /// Bumped on every mutation; keys the sorted-snapshot cache.
  generation: u64,
  sorted_cache: Option<(u64, Vec<i64>)>,
}

impl LatencyWindow {
  pub fn new(capacity: usize, max_age: Option<Duration>) -> Self {
    Self {
      slots: vec![None; capacity].into_boxed_slice(),
      write_idx: 0,
      max_age,
      generation: 0,
      sorted_cache: None,
    }
  }

  /// Record `end - start` in milliseconds, stamped with `end`.
  /// Overwrites the oldest slot by position. O(1).
  pub fn add(&mut self, start: Instant, end: Instant) {
    let value_ms = end.saturating_duration_since(start).as_millis() as i64;
    self.slots[self.write_idx] = Some(LatencySample { value_ms, at: end });
    self.write_idx = (self.write_idx + 1) % self.slots.len();
    self.generation += 1;
  }

  /// Values of samples still inside the age window, in no particular
  /// order.
  pub fn recent(&self) -> impl Iterator<Item = i64> + '_ {
    let now = Instant::now();
    self
      .slots
      .iter()
      .flatten()
      .filter(move |sample| self.is_recent(sample, now))
      .map(|sample| sample.value_ms)
  }

  /// Recent samples ordered by timestamp ascending. Trend analysis only.
  pub fn recent_ordered(&self) -> Vec<LatencySample> {
    let now = Instant::now();
    let mut samples: Vec<LatencySample> = self
      .slots
      .iter()
      .flatten()
      .filter(|sample| self.is_recent(sample, now))
      .copied()
      .collect();
    samples.sort_by_key(|sample| sample.at);
    samples
  }

  fn is_recent(&self, sample: &LatencySample, now: Instant) -> bool {
    match self.max_age {
      Some(age) => now.saturating_duration_since(sample.at) < age,
      None => true,
    }
  }

  /// The `p`-th percentile of recent samples: sorted ascending, index
  /// `⌊n·p⌋` clamped to the last element. 0 when the window holds no
  /// recent samples.
  pub fn percentile(&mut self, p: f64) -> i64 {
    let sorted = self.sorted_recent();
    if sorted.is_empty() {
      return 0;
    }
    let idx = ((sorted.len() as f64) * p).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
  }

  /// Recent values strictly above `threshold_ms`.
  pub fn above_threshold(&self, threshold_ms: i64) -> Vec<i64> {
    self.recent().filter(|&v| v > threshold_ms).collect()
  }

  /// True when the tail of the distribution sits under `threshold_ms`.
  pub fn below_threshold(&mut self, threshold_ms: i64) -> bool {
    self.percentile(0.99) < threshold_ms
  }

  /// Largest recent value, 0 when empty.
  pub fn peak(&self) -> i64 {
    self.recent().max().unwrap_or(0)
  }

  pub fn recent_values(&self) -> Vec<i64> {
    self.recent().collect()
  }

  pub fn recent_count(&self) -> usize {
    self.recent().count()
  }

  /// Drop every sample and reset the write position.
  pub fn reset(&mut self) {
    self.slots.fill(None);
    self.write_idx = 0;
    self.generation += 1;
    self.sorted_cache = None;
  }

  /// Apply a new capacity and age limit. Resizing discards history;
  /// an unchanged capacity keeps it.
  pub fn reconfigure(&mut self, capacity: usize, max_age: Option<Duration>) {
    self.max_age = max_age;
    if capacity != self.slots.len() {
      self.slots = vec![None; capacity].into_boxed_slice();
      self.write_idx = 0;
      self.sorted_cache = None;
    }
    self.generation += 1;
  }

  // The sort is the dominant cost under the breaker lock; memoize it
  // until the ring changes again.
  fn sorted_recent(&mut self) -> &[i64] {
    let stale = !matches!(&self.sorted_cache, Some((generation, _)) if *generation == self.generation);
    if stale {
      let mut values: Vec<i64> = self.recent().collect();
      values.sort_unstable();
      self.sorted_cache = Some((self.generation, values));
    }
    match &self.sorted_cache {
      Some((_, values)) => values,
      None => unreachable!(),
    }
  }

  /// Decide whether recent samples show genuine upward drift rather
  /// than a transient spike or a flat plateau.
  ///
  /// The rules run in a fixed order: a three-sample fast path, a
  /// plateau guard, a high-and-flat guard, a zigzag-with-drift check,
  /// then the general rising rule. Every constant is a named
  /// [`TrendParams`] field so the detector can be re-fitted without
  /// touching this code.
  pub fn has_positive_trend(&self, min_samples: usize, params: &TrendParams) -> bool {
    let values: Vec<i64> = self
      .recent_ordered()
      .iter()
      .map(|sample| sample.value_ms)
      .collect();
    let n = values.len();
    if n < min_samples {
      return false;
    }

    // Three strictly rising samples with a meaningful total climb are
    // enough on their own.
    if n == 3
      && values[0] < values[1]
      && values[1] < values[2]
      && values[2] - values[0] >= params.short_rise_min_ms
    {
      return true;
    }

    let slope = least_squares_slope(&values);

    // Plateau guard: a similar trailing trio with a mildly positive
    // slope is a level shelf, not a climb.
    if n >= 3 {
      let base = values[n - 3] as f64;
      let tolerance = params.similarity_tolerance * base.abs();
      let tail_similar = values[n - 3..]
        .iter()
        .all(|&v| (v as f64 - base).abs() <= tolerance);
      if tail_similar && slope > 0.0 && slope < params.plateau_slope_max {
        return false;
      }
    }

    // High-and-flat guard: the whole window already sits on a high
    // floor and is not moving.
    if n >= 7
      && values.iter().all(|&v| v >= params.high_floor_ms)
      && slope.abs() < params.high_flat_slope_max
    {
      return false;
    }

    // A strict zigzag still counts when it drifts upward overall.
    if n >= 6
      && strict_zigzag(&values)
      && (values[n - 1] as f64) > params.zigzag_drift_ratio * values[0] as f64
    {
      return true;
    }

    if (values[n - 1] as f64) > params.rise_ratio * values[0] as f64
      && slope > params.rise_slope_min
    {
      return true;
    }
    slope > params.fallback_slope_min
  }
}

/// Least-squares slope of `values` against their index, in ms per
/// sample. 0 for fewer than two points.
fn least_squares_slope(values: &[i64]) -> f64 {
  let n = values.len();
  if n < 2 {
    return 0.0;
  }
  let n_f = n as f64;
  let mean_x = (n_f - 1.0) / 2.0;
  let mean_y = values.iter().map(|&v| v as f64).sum::<f64>() / n_f;

  let mut numerator = 0.0;
  let mut denominator = 0.0;
  for (i, &v) in values.iter().enumerate() {
    let dx = i as f64 - mean_x;
    numerator += dx * (v as f64 - mean_y);
    denominator += dx * dx;
  }
  if denominator == 0.0 {
    return 0.0;
  }
  numerator / denominator
}

/// True when no three consecutive values are strictly monotonic.
fn strict_zigzag(values: &[i64]) -> bool {
  values.windows(3).all(|w| {
    let rising = w[0] < w[1] && w[1] < w[2];
    let falling = w[0] > w[1] && w[1] > w[2];
    !rising && !falling
  })
}
