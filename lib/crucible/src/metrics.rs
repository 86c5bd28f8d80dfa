use hashbrown::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Default rate windows: events in the last second and the last minute.
pub const DEFAULT_WINDOWS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(60)];

/// Named-metric registry handed to every component of an `IOSystem`.
///
/// Handles are `Arc`s, so a component looks its metric up once and hits it
/// on the hot path without touching the registry lock again.
pub struct Metrics {
    name: String,
    windows: Vec<Duration>,
    counters: Mutex<HashMap<String, Arc<Counter>>>,
    rates: Mutex<HashMap<String, Arc<Rate>>>,
}

impl Metrics {
    pub fn new(name: &str) -> Arc<Metrics> {
        Metrics::with_windows(name, &DEFAULT_WINDOWS)
    }

    /// Registry whose rates track the supplied window list instead of
    /// `DEFAULT_WINDOWS`. Windows are truncated to whole seconds and must be
    /// at least one second long.
    pub fn with_windows(name: &str, windows: &[Duration]) -> Arc<Metrics> {
        let windows: Vec<Duration> = windows
            .iter()
            .map(|window| Duration::from_secs(window.as_secs().max(1)))
            .collect();

        if windows.is_empty() {
            panic!("Metrics requires at least one rate window");
        }

        Arc::new(Metrics {
            name: name.to_string(),
            windows,
            counters: Mutex::new(HashMap::new()),
            rates: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the counter registered under `name`, creating it on first use.
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        let mut counters = self.counters.lock().expect("Metrics counter lock poisoned");

        match counters.get(name) {
            Some(counter) => counter.clone(),
            None => {
                let counter = Arc::new(Counter::new());
                counters.insert(name.to_string(), counter.clone());
                counter
            }
        }
    }

    /// Returns the rate registered under `name`, creating it on first use.
    pub fn rate(&self, name: &str) -> Arc<Rate> {
        let mut rates = self.rates.lock().expect("Metrics rate lock poisoned");

        match rates.get(name) {
            Some(rate) => rate.clone(),
            None => {
                let rate = Arc::new(Rate::new(&self.windows));
                rates.insert(name.to_string(), rate.clone());
                rate
            }
        }
    }
}

/// Signed counter supporting increment and decrement.
pub struct Counter {
    value: AtomicI64,
}

impl Counter {
    fn new() -> Counter {
        Counter {
            value: AtomicI64::new(0),
        }
    }

    #[inline]
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn decrement(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    #[inline]
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Event rate over a list of sliding windows, with optional per-tag totals.
///
/// Events land in per-second ring buckets sized to the largest window, so a
/// window value is exact to one-second resolution and `hit` stays O(1)
/// amortised.
pub struct Rate {
    windows: Vec<Duration>,
    inner: Mutex<RateInner>,
}

struct RateInner {
    buckets: Vec<u64>,
    head_slot: u64,
    total: u64,
    tags: HashMap<String, u64>,
    epoch: Instant,
}

impl Rate {
    fn new(windows: &[Duration]) -> Rate {
        let span = windows
            .iter()
            .map(Duration::as_secs)
            .max()
            .expect("Rate requires at least one window") as usize;

        Rate {
            windows: windows.to_vec(),
            inner: Mutex::new(RateInner {
                buckets: vec![0; span + 1],
                head_slot: 0,
                total: 0,
                tags: HashMap::new(),
                epoch: Instant::now(),
            }),
        }
    }

    /// Records one event.
    pub fn hit(&self) {
        let mut inner = self.lock();
        let slot = inner.current_slot();
        inner.record(slot, &[]);
    }

    /// Records one event carrying a tag map. Tag totals are cumulative and
    /// not windowed.
    pub fn hit_tagged(&self, tags: &[(&str, &str)]) {
        let mut inner = self.lock();
        let slot = inner.current_slot();
        inner.record(slot, tags);
    }

    /// Events observed within the trailing `window`. The window must be one
    /// of the registry's configured windows.
    pub fn value(&self, window: Duration) -> u64 {
        if !self.windows.contains(&window) {
            panic!("Rate window {:?} was not configured", window);
        }

        let mut inner = self.lock();
        let slot = inner.current_slot();
        inner.sum_window(slot, window.as_secs())
    }

    /// Events observed since creation.
    pub fn total(&self) -> u64 {
        self.lock().total
    }

    /// Cumulative events recorded with the given tag key/value.
    pub fn tag_total(&self, key: &str, value: &str) -> u64 {
        let inner = self.lock();
        inner.tags.get(&tag_slug(key, value)).copied().unwrap_or(0)
    }

    pub fn windows(&self) -> &[Duration] {
        &self.windows
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RateInner> {
        self.inner.lock().expect("Rate lock poisoned")
    }
}

impl RateInner {
    fn current_slot(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    fn record(&mut self, slot: u64, tags: &[(&str, &str)]) {
        self.advance(slot);

        let len = self.buckets.len() as u64;
        self.buckets[(slot % len) as usize] += 1;
        self.total += 1;

        for (key, value) in tags {
            *self.tags.entry(tag_slug(key, value)).or_insert(0) += 1;
        }
    }

    /// Zeroes every bucket the clock has passed since the last event.
    fn advance(&mut self, slot: u64) {
        let len = self.buckets.len() as u64;
        let stale = (slot - self.head_slot).min(len);

        for offset in 0..stale {
            let idx = ((self.head_slot + offset + 1) % len) as usize;
            self.buckets[idx] = 0;
        }

        self.head_slot = slot;
    }

    fn sum_window(&mut self, slot: u64, window_secs: u64) -> u64 {
        self.advance(slot);

        let len = self.buckets.len() as u64;
        let span = window_secs.min(slot + 1);

        (0..span)
            .map(|back| self.buckets[((slot - back) % len) as usize])
            .sum()
    }
}

fn tag_slug(key: &str, value: &str) -> String {
    format!("{}={}", key, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increment_decrement() {
        let metrics = Metrics::new("test");
        let counter = metrics.counter("connections");

        counter.increment();
        counter.increment();
        counter.decrement();
        counter.add(5);

        assert_eq!(counter.value(), 6);
    }

    #[test]
    fn test_registry_get_or_add() {
        let metrics = Metrics::new("test");

        let first = metrics.counter("connections");
        first.increment();

        // Same name returns the same underlying counter.
        assert_eq!(metrics.counter("connections").value(), 1);
        assert_eq!(metrics.counter("other").value(), 0);
    }

    #[test]
    fn test_rate_total_and_tags() {
        let metrics = Metrics::new("test");
        let rate = metrics.rate("closed");

        rate.hit();
        rate.hit_tagged(&[("cause", "idle_timeout")]);
        rate.hit_tagged(&[("cause", "idle_timeout")]);
        rate.hit_tagged(&[("cause", "refused")]);

        assert_eq!(rate.total(), 4);
        assert_eq!(rate.tag_total("cause", "idle_timeout"), 2);
        assert_eq!(rate.tag_total("cause", "refused"), 1);
        assert_eq!(rate.tag_total("cause", "unknown"), 0);
    }

    #[test]
    fn test_rate_window_decay() {
        let metrics = Metrics::new("test");
        let rate = metrics.rate("connects");

        {
            let mut inner = rate.lock();
            inner.record(0, &[]);
            inner.record(0, &[]);
            inner.record(30, &[]);
            inner.record(61, &[]);
        }

        // Slot 61: the one-second window sees only the latest event, the
        // sixty-second window has lost the slot-0 pair.
        let mut inner = rate.lock();
        assert_eq!(inner.sum_window(61, 1), 1);
        assert_eq!(inner.sum_window(61, 60), 2);
        assert_eq!(inner.total, 4);
    }

    #[test]
    fn test_rate_long_gap_clears_ring() {
        let metrics = Metrics::new("test");
        let rate = metrics.rate("connects");

        let mut inner = rate.lock();
        inner.record(5, &[]);
        // A gap far longer than the ring lets every bucket go stale.
        assert_eq!(inner.sum_window(500, 60), 0);
        assert_eq!(inner.total, 1);
    }

    #[test]
    #[should_panic(expected = "was not configured")]
    fn test_rate_rejects_unknown_window() {
        let metrics = Metrics::new("test");
        let rate = metrics.rate("connects");

        rate.value(Duration::from_secs(7));
    }
}
