//! Process memory pressure probe.
//!
//! Answers one question: is current process memory usage still within a
//! configured fraction of the known limit? The limit comes from an
//! explicit override or the container environment; when neither is
//! available the gate is disabled and the probe always answers yes.

use std::fs;
use std::sync::atomic::{AtomicI8, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};

const CGROUP_V2_LIMIT: &str = "/sys/fs/cgroup/memory.max";
const CGROUP_V1_LIMIT: &str = "/sys/fs/cgroup/memory/memory.limit_in_bytes";

/// cgroup v1 reports "no limit" as a page-rounded huge number.
const V1_UNLIMITED_FLOOR: u64 = 1 << 60;

/// Minimum gap between two usage refreshes; callers in between read the
/// cached value.
const SAMPLE_INTERVAL_MS: u64 = 250;

const NEVER_SAMPLED: u64 = u64::MAX;

const FORCED_NONE: i8 = -1;
const FORCED_NOT_OK: i8 = 0;
const FORCED_OK: i8 = 1;

pub struct MemoryProbe {
  limit_bytes: Option<u64>,
  /// Test hook; production code never sets it.
  forced: AtomicI8,
  cached_used: AtomicU64,
  last_sample_ms: AtomicU64,
  started: Instant,
  sampler: Mutex<System>,
  pid: Pid,
}

impl MemoryProbe {
  /// Build a probe, discovering the memory limit from the explicit
  /// override or the container environment. An unknown limit is not an
  /// error: the gate is disabled and that fact is logged once.
  pub fn new(limit_override: Option<u64>) -> Self {
    let limit_bytes = limit_override.or_else(discover_cgroup_limit);
    match limit_bytes {
      Some(limit) => debug!(limit_bytes = limit, "memory probe limit resolved"),
      None => warn!("memory limit unknown; memory gate disabled"),
    }

    Self {
      limit_bytes,
      forced: AtomicI8::new(FORCED_NONE),
      cached_used: AtomicU64::new(0),
      last_sample_ms: AtomicU64::new(NEVER_SAMPLED),
      started: Instant::now(),
      sampler: Mutex::new(System::new()),
      pid: Pid::from_u32(std::process::id()),
    }
  }

  /// True when current usage is within `threshold` of the limit.
  ///
  /// Never raises; an unknown limit always answers true. The usage
  /// sample is cached and refreshed at most every
  /// [`SAMPLE_INTERVAL_MS`], so the common path is two atomic loads.
  pub fn ok(&self, threshold: f64) -> bool {
    match self.forced.load(Ordering::Relaxed) {
      FORCED_OK => return true,
      FORCED_NOT_OK => return false,
      _ => {}
    }

    let Some(limit) = self.limit_bytes else {
      return true;
    };
    (self.sample() as f64) < threshold * limit as f64
  }

  /// Current usage as a percentage of the limit, for alert fields.
  /// `None` when the limit is unknown.
  pub fn usage_percent(&self) -> Option<f64> {
    let limit = self.limit_bytes?;
    Some(self.sample() as f64 / limit as f64 * 100.0)
  }

  pub fn limit_bytes(&self) -> Option<u64> {
    self.limit_bytes
  }

  /// Force `ok` to a fixed answer (`Some`) or restore live sampling
  /// (`None`). Tests only.
  pub fn force_ok(&self, forced: Option<bool>) {
    let value = match forced {
      Some(true) => FORCED_OK,
      Some(false) => FORCED_NOT_OK,
      None => FORCED_NONE,
    };
    self.forced.store(value, Ordering::Relaxed);
  }

  fn sample(&self) -> u64 {
    let now_ms = self.started.elapsed().as_millis() as u64;
    let last = self.last_sample_ms.load(Ordering::Acquire);
    let stale = last == NEVER_SAMPLED || now_ms.saturating_sub(last) >= SAMPLE_INTERVAL_MS;

    // One caller wins the refresh; everyone else keeps the cached value.
    // try_lock keeps the losers from ever blocking behind the sampler.
    if stale
      && self
        .last_sample_ms
        .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Relaxed)
        .is_ok()
    {
      if let Some(mut system) = self.sampler.try_lock() {
        system.refresh_processes_specifics(
          ProcessesToUpdate::Some(&[self.pid]),
          false,
          ProcessRefreshKind::nothing().with_memory(),
        );
        if let Some(process) = system.process(self.pid) {
          self.cached_used.store(process.memory(), Ordering::Release);
        }
      }
    }

    self.cached_used.load(Ordering::Acquire)
  }
}

fn discover_cgroup_limit() -> Option<u64> {
  read_limit_file(CGROUP_V2_LIMIT).or_else(|| read_limit_file(CGROUP_V1_LIMIT))
}

fn read_limit_file(path: &str) -> Option<u64> {
  let raw = fs::read_to_string(path).ok()?;
  let trimmed = raw.trim();
  if trimmed == "max" {
    return None;
  }
  let value: u64 = trimmed.parse().ok()?;
  if value >= V1_UNLIMITED_FLOOR {
    return None;
  }
  Some(value)
}
