use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::time::Instant;

lazy_static! {
    // Query metrics
    pub static ref QUERY_COUNTER: IntCounterVec = register_int_counter_vec!(
        "mpc_queries_total",
        "Total number of peak queries, by kind",
        &["kind"]
    ).unwrap();

    pub static ref QUERY_FAILURES: IntCounterVec = register_int_counter_vec!(
        "mpc_query_failures_total",
        "Total number of failed peak queries, by kind",
        &["kind"]
    ).unwrap();

    pub static ref QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "mpc_query_duration_seconds",
        "Peak query duration in seconds",
        &["kind"],
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0]
    ).unwrap();

    // Sampling metrics
    pub static ref SAMPLES_RECORDED: IntCounter = register_int_counter!(
        "mpc_samples_recorded_total",
        "Total number of player count samples written"
    ).unwrap();

    pub static ref SAMPLES_PRUNED: IntCounter = register_int_counter!(
        "mpc_samples_pruned_total",
        "Total number of samples removed by retention"
    ).unwrap();

    pub static ref REGISTERED_SERVERS: IntGauge = register_int_gauge!(
        "mpc_registered_servers",
        "Number of servers currently registered"
    ).unwrap();

    // Cache metrics
    pub static ref CACHE_REFRESHES: IntCounterVec = register_int_counter_vec!(
        "mpc_cache_refreshes_total",
        "Total number of cache refreshes started, by cache",
        &["cache"]
    ).unwrap();
}

pub fn init_metrics() {
    lazy_static::initialize(&QUERY_COUNTER);
    lazy_static::initialize(&QUERY_FAILURES);
    lazy_static::initialize(&QUERY_DURATION);
    lazy_static::initialize(&SAMPLES_RECORDED);
    lazy_static::initialize(&SAMPLES_PRUNED);
    lazy_static::initialize(&CACHE_REFRESHES);
    REGISTERED_SERVERS.set(0);
}

/// Counts a query on creation and records its duration when dropped.
pub struct QueryTimer {
    kind: &'static str,
    start: Instant,
}

impl QueryTimer {
    pub fn new(kind: &'static str) -> Self {
        QUERY_COUNTER.with_label_values(&[kind]).inc();
        Self {
            kind,
            start: Instant::now(),
        }
    }

    pub fn fail(&self) {
        QUERY_FAILURES.with_label_values(&[self.kind]).inc();
    }
}

impl Drop for QueryTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        QUERY_DURATION.with_label_values(&[self.kind]).observe(duration);
    }
}

pub fn record_samples(count: usize) {
    SAMPLES_RECORDED.inc_by(count as u64);
}

pub fn record_pruned(count: u64) {
    SAMPLES_PRUNED.inc_by(count);
}

pub fn record_cache_refresh(cache: &str) {
    CACHE_REFRESHES.with_label_values(&[cache]).inc();
}

pub fn set_registered_servers(count: usize) {
    REGISTERED_SERVERS.set(count as i64);
}

/// Renders every registered collector in the Prometheus text format.
pub fn gather_text() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
