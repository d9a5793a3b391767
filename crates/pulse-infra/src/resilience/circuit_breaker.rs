//! Circuit breaker registry
//!
//! Tracks failures per (stage, error category) pair. A breaker opens once the
//! failure count reaches the threshold and stays open for the cool-down
//! window after the last failure. Expiry is checked lazily on the next query.
//! The registry is shared by every workflow in the process.

use dashmap::DashMap;
use pulse_core::{CircuitBreakerSettings, ErrorCategory};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Composite breaker key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BreakerKey {
    pub stage: String,
    pub category: ErrorCategory,
}

impl BreakerKey {
    pub fn new(stage: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            stage: stage.into(),
            category,
        }
    }
}

impl std::fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.stage, self.category)
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures before the breaker opens
    pub failure_threshold: u32,
    /// How long an open breaker blocks after its last failure
    pub cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(300),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_cool_down(mut self, cool_down: Duration) -> Self {
        self.cool_down = cool_down;
        self
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            cool_down: settings.cool_down(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BreakerEntry {
    failure_count: u32,
    last_failure_time: Instant,
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub key: BreakerKey,
    pub failure_count: u32,
    pub open: bool,
}

/// Thread-safe registry of breakers keyed by (stage, category)
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    entries: DashMap<BreakerKey, BreakerEntry>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether retries for this pair are currently blocked
    pub fn is_open(&self, stage: &str, category: ErrorCategory) -> bool {
        self.is_open_at(stage, category, Instant::now())
    }

    /// [`Self::is_open`] evaluated at a given instant
    pub fn is_open_at(&self, stage: &str, category: ErrorCategory, now: Instant) -> bool {
        let key = BreakerKey::new(stage, category);

        let entry = match self.entries.get(&key) {
            Some(entry) => *entry,
            None => return false,
        };

        if self.expired(&entry, now) {
            // Cool-down elapsed: the entry resets to zero
            let cool_down = self.config.cool_down;
            self.entries.remove_if(&key, |_, e| {
                now.saturating_duration_since(e.last_failure_time) >= cool_down
            });
            info!(breaker = %key, "Circuit breaker reset after cool-down");
            return false;
        }

        let open = entry.failure_count >= self.config.failure_threshold;
        if open {
            debug!(breaker = %key, failures = entry.failure_count, "Circuit breaker is open");
        }
        open
    }

    /// Record one failure for the pair
    pub fn record_failure(&self, stage: &str, category: ErrorCategory) {
        self.record_failure_at(stage, category, Instant::now());
    }

    /// [`Self::record_failure`] evaluated at a given instant
    pub fn record_failure_at(&self, stage: &str, category: ErrorCategory, now: Instant) {
        let key = BreakerKey::new(stage, category);
        let cool_down = self.config.cool_down;

        let mut entry = self.entries.entry(key.clone()).or_insert(BreakerEntry {
            failure_count: 0,
            last_failure_time: now,
        });

        if now.saturating_duration_since(entry.last_failure_time) >= cool_down {
            entry.failure_count = 0;
        }
        entry.failure_count += 1;
        entry.last_failure_time = now;

        if entry.failure_count == self.config.failure_threshold {
            warn!(
                breaker = %key,
                failures = entry.failure_count,
                cool_down_secs = cool_down.as_secs(),
                "Circuit breaker opened"
            );
        }
    }

    /// Close the breaker for one pair
    pub fn reset(&self, stage: &str, category: ErrorCategory) {
        self.entries.remove(&BreakerKey::new(stage, category));
    }

    /// Close every breaker belonging to a stage
    pub fn reset_stage(&self, stage: &str) {
        self.entries.retain(|key, _| key.stage != stage);
    }

    /// Current failure count for the pair (0 when absent)
    pub fn failure_count(&self, stage: &str, category: ErrorCategory) -> u32 {
        self.entries
            .get(&BreakerKey::new(stage, category))
            .map(|e| e.failure_count)
            .unwrap_or(0)
    }

    /// Snapshot of every tracked breaker, ordered by key
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        let mut snapshots: Vec<_> = self
            .entries
            .iter()
            .map(|e| BreakerSnapshot {
                key: e.key().clone(),
                failure_count: e.failure_count,
                open: !self.expired(e.value(), now)
                    && e.failure_count >= self.config.failure_threshold,
            })
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    fn expired(&self, entry: &BreakerEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_failure_time) >= self.config.cool_down
    }
}
