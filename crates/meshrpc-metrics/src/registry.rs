use crate::sink::{CallOutcome, MetricsSink};
use crate::snapshot::{EndpointMetrics, MetricsSnapshot, QualifierMetrics};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Instant, SystemTime};

/// One bucket per power of two, plus bucket 0 for zero.
const NUM_BUCKETS: usize = 65;

/// Operations between two cleanup passes.
const CLEANUP_INTERVAL: u64 = 1000;

/// Used instead of wall-clock time when the system clock is before the epoch.
static TIMESTAMP_FALLBACK: AtomicU64 = AtomicU64::new(1);

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// Milliseconds since the epoch, strictly increasing across calls.
///
/// LRU eviction sorts on these values, so two accesses must never share a
/// timestamp.
fn monotonic_timestamp_ms() -> u64 {
    let wall = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_else(|_| TIMESTAMP_FALLBACK.fetch_add(1, Ordering::SeqCst));

    loop {
        let last = LAST_TIMESTAMP.load(Ordering::Acquire);
        let next = wall.max(last + 1);
        if LAST_TIMESTAMP
            .compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Acquire)
            .is_ok()
        {
            return next;
        }
    }
}

/// Size limits and entry lifetime for the metrics tables.
///
/// # Example
///
/// ```rust
/// use meshrpc_metrics::{MetricsConfig, MetricsRegistry};
///
/// let config = MetricsConfig {
///     max_qualifiers: 500,
///     max_endpoints: 50,
///     ttl_secs: 600,
/// };
/// let registry = MetricsRegistry::with_config(config);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    /// Distinct qualifiers tracked before least-recently-used ones are evicted.
    pub max_qualifiers: usize,
    /// Distinct endpoints tracked before least-recently-used ones are evicted.
    pub max_endpoints: usize,
    /// Entries untouched for this long are dropped at the next cleanup.
    pub ttl_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_qualifiers: 1000,
            max_endpoints: 1000,
            ttl_secs: 3600,
        }
    }
}

/// Power-of-two latency histogram.
///
/// Bucket `b > 0` holds samples in `[2^(b-1), 2^b)` microseconds. Percentiles
/// are interpolated linearly inside the bucket and clamped to the largest
/// sample seen, which keeps estimates within one bucket width.
#[derive(Debug)]
struct LatencyHistogram {
    buckets: [AtomicU64; NUM_BUCKETS],
    total_latency: AtomicU64,
    sample_count: AtomicU64,
    max_latency: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            total_latency: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
            max_latency: AtomicU64::new(0),
        }
    }

    fn record(&self, latency_us: u64) {
        self.buckets[Self::bucket_of(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.total_latency.fetch_add(latency_us, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
        self.max_latency.fetch_max(latency_us, Ordering::Relaxed);
    }

    fn bucket_of(latency_us: u64) -> usize {
        (u64::BITS - latency_us.leading_zeros()) as usize
    }

    fn bucket_bounds(bucket: usize) -> (u64, u64) {
        match bucket {
            0 => (0, 1),
            64 => (1 << 63, u64::MAX),
            b => (1 << (b - 1), 1 << b),
        }
    }

    fn estimate_percentile(&self, percentile: u64) -> u64 {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        let target = ((total * percentile).div_ceil(100)).max(1);
        let max = self.max_latency.load(Ordering::Relaxed);
        let mut cumulative = 0;

        for (bucket, count) in self.buckets.iter().enumerate() {
            let count = count.load(Ordering::Relaxed);
            if count == 0 {
                continue;
            }
            if cumulative + count >= target {
                let (low, high) = Self::bucket_bounds(bucket);
                let fraction = (target - cumulative) as f64 / count as f64;
                let estimate = low as f64 + fraction * (high - low) as f64;
                return (estimate as u64).min(max);
            }
            cumulative += count;
        }

        max
    }

    /// `(avg, p50, p95, p99)` in microseconds, all zero when empty.
    fn percentiles(&self) -> (u64, u64, u64, u64) {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return (0, 0, 0, 0);
        }
        let avg = self.total_latency.load(Ordering::Relaxed) / total;
        (
            avg,
            self.estimate_percentile(50),
            self.estimate_percentile(95),
            self.estimate_percentile(99),
        )
    }
}

#[derive(Debug)]
struct QualifierStats {
    call_count: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    timeout_count: AtomicU64,
    latencies: LatencyHistogram,
    last_access_ms: AtomicU64,
}

impl QualifierStats {
    fn new() -> Self {
        Self {
            call_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
            latencies: LatencyHistogram::new(),
            last_access_ms: AtomicU64::new(monotonic_timestamp_ms()),
        }
    }

    fn record(&self, latency_us: u64, outcome: CallOutcome) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            CallOutcome::Success => &self.success_count,
            CallOutcome::Failure => &self.failure_count,
            CallOutcome::Timeout => &self.timeout_count,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.latencies.record(latency_us);
        self.last_access_ms
            .store(monotonic_timestamp_ms(), Ordering::Relaxed);
    }

    fn snapshot(&self) -> QualifierMetrics {
        let (avg_latency_us, p50_latency_us, p95_latency_us, p99_latency_us) =
            self.latencies.percentiles();
        QualifierMetrics {
            call_count: self.call_count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            timeout_count: self.timeout_count.load(Ordering::Relaxed),
            avg_latency_us,
            p50_latency_us,
            p95_latency_us,
            p99_latency_us,
        }
    }
}

#[derive(Debug)]
struct EndpointStats {
    route_count: AtomicU64,
    last_route_ms: AtomicU64,
}

impl EndpointStats {
    fn new() -> Self {
        Self {
            route_count: AtomicU64::new(0),
            last_route_ms: AtomicU64::new(monotonic_timestamp_ms()),
        }
    }

    fn record(&self) {
        self.route_count.fetch_add(1, Ordering::Relaxed);
        self.last_route_ms
            .store(monotonic_timestamp_ms(), Ordering::Relaxed);
    }

    fn snapshot(&self, endpoint_id: &str) -> EndpointMetrics {
        EndpointMetrics {
            endpoint_id: endpoint_id.to_string(),
            route_count: self.route_count.load(Ordering::Relaxed),
            last_route_ms: self.last_route_ms.load(Ordering::Relaxed),
        }
    }
}

/// Drops entries idle for longer than `ttl_ms`, then the least recently
/// touched ones until at most `max` remain.
fn evict<T>(
    table: &mut HashMap<String, Arc<T>>,
    now: u64,
    ttl_ms: u64,
    max: usize,
    last_touch: impl Fn(&T) -> u64,
) {
    table.retain(|_, stats| now.saturating_sub(last_touch(&**stats)) < ttl_ms);

    if table.len() > max {
        let mut by_age: Vec<(String, u64)> = table
            .iter()
            .map(|(key, stats)| (key.clone(), last_touch(&**stats)))
            .collect();
        by_age.sort_by_key(|&(_, touched)| touched);
        let excess = by_age.len() - max;
        for (key, _) in by_age.into_iter().take(excess) {
            table.remove(&key);
        }
    }
}

/// In-memory [`MetricsSink`].
///
/// Global and per-entry counters are atomics updated with relaxed ordering;
/// snapshots are best-effort and may observe counters mid-update. The
/// per-qualifier and per-endpoint tables are behind `RwLock`s that are
/// written only to insert an entry or during cleanup, which runs every
/// thousand operations and applies [`MetricsConfig`].
///
/// # Example
///
/// ```rust
/// use meshrpc_metrics::{CallOutcome, MetricsRegistry};
///
/// let registry = MetricsRegistry::new();
/// registry.record_latency("greeting/hello", 150, CallOutcome::Success);
///
/// let snapshot = registry.snapshot();
/// assert_eq!(snapshot.total_calls, 1);
/// assert_eq!(snapshot.qualifiers["greeting/hello"].p50_latency_us, 150);
/// ```
#[derive(Debug)]
pub struct MetricsRegistry {
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    timed_out_calls: AtomicU64,
    qualifiers: RwLock<HashMap<String, Arc<QualifierStats>>>,
    endpoints: RwLock<HashMap<String, Arc<EndpointStats>>>,
    start_time: Instant,
    config: MetricsConfig,
    cleanup_counter: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_config(MetricsConfig::default())
    }

    pub fn with_config(config: MetricsConfig) -> Self {
        Self {
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            timed_out_calls: AtomicU64::new(0),
            qualifiers: RwLock::new(HashMap::new()),
            endpoints: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
            config,
            cleanup_counter: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Records one call with an already measured latency.
    ///
    /// # Arguments
    /// * `qualifier` - The `service/method` that was called
    /// * `latency_us` - Call duration in microseconds
    /// * `outcome` - How the call ended
    pub fn record_latency(&self, qualifier: &str, latency_us: u64, outcome: CallOutcome) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let global = match outcome {
            CallOutcome::Success => &self.successful_calls,
            CallOutcome::Failure => &self.failed_calls,
            CallOutcome::Timeout => &self.timed_out_calls,
        };
        global.fetch_add(1, Ordering::Relaxed);

        self.maybe_cleanup();

        let stats = {
            let mut qualifiers = self
                .qualifiers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            qualifiers
                .entry(qualifier.to_string())
                .or_insert_with(|| Arc::new(QualifierStats::new()))
                .clone()
        };
        stats.record(latency_us, outcome);
    }

    /// Records one routing decision that selected `endpoint_id`.
    pub fn record_endpoint(&self, endpoint_id: &str) {
        self.maybe_cleanup();

        let stats = {
            let mut endpoints = self
                .endpoints
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            endpoints
                .entry(endpoint_id.to_string())
                .or_insert_with(|| Arc::new(EndpointStats::new()))
                .clone()
        };
        stats.record();
    }

    fn maybe_cleanup(&self) {
        let count = self.cleanup_counter.fetch_add(1, Ordering::Relaxed);
        if count % CLEANUP_INTERVAL == 0 {
            self.cleanup_stale_entries();
        }
    }

    fn cleanup_stale_entries(&self) {
        let now = monotonic_timestamp_ms();
        let ttl_ms = self.config.ttl_secs.saturating_mul(1000);

        {
            let mut qualifiers = self
                .qualifiers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            evict(&mut *qualifiers, now, ttl_ms, self.config.max_qualifiers, |s| {
                s.last_access_ms.load(Ordering::Relaxed)
            });
        }

        {
            let mut endpoints = self
                .endpoints
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            evict(&mut *endpoints, now, ttl_ms, self.config.max_endpoints, |s| {
                s.last_route_ms.load(Ordering::Relaxed)
            });
        }
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let qualifiers = self
            .qualifiers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();

        let endpoints = self
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, stats)| (id.clone(), stats.snapshot(id)))
            .collect();

        MetricsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            timed_out_calls: self.timed_out_calls.load(Ordering::Relaxed),
            uptime_ms: self.uptime_ms(),
            qualifiers,
            endpoints,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for MetricsRegistry {
    fn record_call(&self, qualifier: &str, start: Instant, outcome: CallOutcome) {
        let latency_us = start.elapsed().as_micros() as u64;
        self.record_latency(qualifier, latency_us, outcome);
    }

    fn record_route(&self, _qualifier: &str, endpoint_id: &str) {
        self.record_endpoint(endpoint_id);
    }
}
