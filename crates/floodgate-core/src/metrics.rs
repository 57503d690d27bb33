//! Named counters and event rates behind a get-or-add registry.
//!
//! This is the narrow sink the framework emits into; reporting to an
//! external system is a collaborator's job (poll [`MetricsRegistry::snapshot`]).
//! Handles are cheap `Arc` clones and safe to hit from any thread. Rates
//! count events over a fixed window list (per-second and per-minute by
//! default) and accept an optional tag map per hit, which the framework uses
//! to break the `closed` rate down by close cause.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

/// Default rate windows: one second and one minute.
pub const DEFAULT_RATE_WINDOWS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(60)];

/// A monotonic (but decrementable) named value.
#[derive(Debug, Clone, Default)]
pub struct Counter {
    value: Arc<AtomicI64>,
}

impl Counter {
    /// A counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one.
    pub fn increment(&self) {
        self.add(1);
    }

    /// Subtract one.
    pub fn decrement(&self) {
        self.add(-1);
    }

    /// Add `delta` (may be negative).
    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Current value.
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// One tumbling window of a [`Rate`].
#[derive(Debug)]
struct Window {
    len: Duration,
    started: Instant,
    current: u64,
    previous: u64,
}

impl Window {
    fn roll(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed >= self.len * 2 {
            // The window went quiet for longer than a full period.
            self.previous = 0;
            self.current = 0;
            self.started = now;
        } else if elapsed >= self.len {
            self.previous = self.current;
            self.current = 0;
            self.started += self.len;
        }
    }
}

#[derive(Debug)]
struct RateInner {
    total: AtomicU64,
    windows: Mutex<Vec<Window>>,
    tags: Mutex<HashMap<String, u64>>,
}

/// An events-per-window rate with a lifetime total and per-hit tags.
#[derive(Debug, Clone)]
pub struct Rate {
    inner: Arc<RateInner>,
}

impl Default for Rate {
    fn default() -> Self {
        Self::new(&DEFAULT_RATE_WINDOWS)
    }
}

impl Rate {
    /// A rate tracking the given window lengths.
    pub fn new(windows: &[Duration]) -> Self {
        let now = Instant::now();
        let windows = windows
            .iter()
            .map(|&len| Window { len, started: now, current: 0, previous: 0 })
            .collect();

        Self {
            inner: Arc::new(RateInner {
                total: AtomicU64::new(0),
                windows: Mutex::new(windows),
                tags: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Record one event.
    pub fn hit(&self) {
        self.record(Instant::now());
    }

    /// Record one event carrying a tag map.
    pub fn hit_tagged(&self, tags: &[(&str, &str)]) {
        self.hit();

        let mut tagged = self.inner.tags.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in tags {
            *tagged.entry(format!("{key}={value}")).or_insert(0) += 1;
        }
    }

    fn record(&self, now: Instant) {
        self.inner.total.fetch_add(1, Ordering::Relaxed);

        let mut windows = self.inner.windows.lock().unwrap_or_else(PoisonError::into_inner);
        for window in windows.iter_mut() {
            window.roll(now);
            window.current += 1;
        }
    }

    /// Events recorded since creation.
    pub fn total(&self) -> u64 {
        self.inner.total.load(Ordering::Relaxed)
    }

    /// Events in the last *complete* period of the given window, or `None`
    /// if that window length is not tracked.
    pub fn value(&self, window: Duration) -> Option<u64> {
        let now = Instant::now();
        let mut windows = self.inner.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.iter_mut().find(|w| w.len == window).map(|w| {
            w.roll(now);
            w.previous
        })
    }

    /// Lifetime hits carrying `key=value`.
    pub fn tagged_total(&self, key: &str, value: &str) -> u64 {
        let tagged = self.inner.tags.lock().unwrap_or_else(PoisonError::into_inner);
        tagged.get(&format!("{key}={value}")).copied().unwrap_or(0)
    }
}

/// Point-in-time view of a registry, for external reporters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Counter values, sorted by name.
    pub counters: Vec<(String, i64)>,
    /// Rate lifetime totals, sorted by name.
    pub rates: Vec<(String, u64)>,
}

/// Get-or-add registry of named [`Counter`]s and [`Rate`]s.
///
/// One registry per I/O system; servers namespace their metric names with
/// their own name (`"web.connects"`). Two callers asking for the same name
/// share the same underlying metric.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: Mutex<HashMap<String, Counter>>,
    rates: Mutex<HashMap<String, Rate>>,
}

impl MetricsRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The counter named `name`, created on first use.
    pub fn counter(&self, name: &str) -> Counter {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.entry(name.to_string()).or_default().clone()
    }

    /// The rate named `name`, created on first use with the default windows.
    pub fn rate(&self, name: &str) -> Rate {
        let mut rates = self.rates.lock().unwrap_or_else(PoisonError::into_inner);
        rates.entry(name.to_string()).or_default().clone()
    }

    /// Snapshot every metric.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let rates = self.rates.lock().unwrap_or_else(PoisonError::into_inner);

        let mut snapshot = MetricsSnapshot {
            counters: counters.iter().map(|(name, c)| (name.clone(), c.value())).collect(),
            rates: rates.iter().map(|(name, r)| (name.clone(), r.total())).collect(),
        };
        snapshot.counters.sort();
        snapshot.rates.sort();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments_and_decrements() {
        let counter = Counter::new();
        counter.increment();
        counter.increment();
        counter.decrement();
        assert_eq!(counter.value(), 1);

        counter.add(-5);
        assert_eq!(counter.value(), -4);
    }

    #[test]
    fn counter_handles_share_state() {
        let counter = Counter::new();
        let other = counter.clone();
        counter.increment();
        other.increment();
        assert_eq!(counter.value(), 2);
    }

    #[test]
    fn rate_counts_totals() {
        let rate = Rate::default();
        rate.hit();
        rate.hit();
        rate.hit();
        assert_eq!(rate.total(), 3);
    }

    #[test]
    fn rate_tags_accumulate() {
        let rate = Rate::default();
        rate.hit_tagged(&[("cause", "idle_timeout")]);
        rate.hit_tagged(&[("cause", "idle_timeout")]);
        rate.hit_tagged(&[("cause", "peer_closed")]);

        assert_eq!(rate.total(), 3);
        assert_eq!(rate.tagged_total("cause", "idle_timeout"), 2);
        assert_eq!(rate.tagged_total("cause", "peer_closed"), 1);
        assert_eq!(rate.tagged_total("cause", "refused"), 0);
    }

    #[test]
    fn rate_window_rolls_over() {
        let rate = Rate::new(&[Duration::from_millis(20)]);
        rate.hit();
        rate.hit();

        // Nothing complete yet.
        assert_eq!(rate.value(Duration::from_millis(20)), Some(0));

        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(rate.value(Duration::from_millis(20)), Some(2));
    }

    #[test]
    fn rate_window_clears_after_quiet_period() {
        let rate = Rate::new(&[Duration::from_millis(10)]);
        rate.hit();

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(rate.value(Duration::from_millis(10)), Some(0));
    }

    #[test]
    fn unknown_window_is_none() {
        let rate = Rate::default();
        assert_eq!(rate.value(Duration::from_secs(5)), None);
    }

    #[test]
    fn registry_get_or_add_shares_metrics() {
        let registry = MetricsRegistry::new();
        registry.counter("connections").increment();
        registry.counter("connections").increment();
        assert_eq!(registry.counter("connections").value(), 2);

        registry.rate("connects").hit();
        assert_eq!(registry.rate("connects").total(), 1);
    }

    #[test]
    fn snapshot_is_sorted() {
        let registry = MetricsRegistry::new();
        registry.counter("b").increment();
        registry.counter("a").add(2);
        registry.rate("z").hit();

        let snapshot = registry.snapshot();
        assert_eq!(
            snapshot.counters,
            vec![("a".to_string(), 2), ("b".to_string(), 1)]
        );
        assert_eq!(snapshot.rates, vec![("z".to_string(), 1)]);
    }
}
