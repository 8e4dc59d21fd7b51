use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_lookup_total", "Cache lookups by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookup_total");
    vec
});

static CACHE_STORE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_store_total", "Capture outcomes by kind");
    let vec = IntCounterVec::new(opts, &["outcome"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_store_total");
    vec
});

static CACHE_EVICTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter =
        IntCounter::new("cache_evictions_total", "LRU capacity evictions").expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_evictions_total");
    counter
});

static CACHE_PURGES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter =
        IntCounter::new("cache_purges_total", "Full cache purges").expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_purges_total");
    counter
});

static CACHE_ENTRIES: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("cache_entries", "Entries held in the in-process tier")
        .expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register cache_entries");
    gauge
});

static POLICY_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "policy_errors_total",
        "Policy evaluation failures by entry point",
    );
    let vec = IntCounterVec::new(opts, &["entry"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register policy_errors_total");
    vec
});

static POLICY_RELOADS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("policy_reloads_total", "Policy reload attempts by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register policy_reloads_total");
    vec
});

static REFRESH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("refresh_total", "Background refresh events");
    let vec = IntCounterVec::new(opts, &["event"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register refresh_total");
    vec
});

static REMOTE_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("remote_errors_total", "Remote tier failures by operation");
    let vec = IntCounterVec::new(opts, &["op"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register remote_errors_total");
    vec
});

static REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "cache_request_duration_seconds",
        "Time from request start to finalize, by lookup result",
    )
    .buckets(latency_buckets());
    let vec = HistogramVec::new(opts, &["lookup"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_request_duration_seconds");
    vec
});

fn latency_buckets() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
    ]
}

pub fn record_cache_lookup(result: &str) {
    CACHE_LOOKUP_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_cache_store(outcome: &str) {
    CACHE_STORE_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_cache_eviction() {
    CACHE_EVICTIONS_TOTAL.inc();
}

pub fn record_cache_purge() {
    CACHE_PURGES_TOTAL.inc();
}

pub fn set_cache_entries(entries: usize) {
    CACHE_ENTRIES.set(entries as i64);
}

pub fn record_policy_error(entry: &str) {
    POLICY_ERRORS_TOTAL.with_label_values(&[entry]).inc();
}

pub fn record_policy_reload(ok: bool) {
    let label = if ok { "ok" } else { "failed" };
    POLICY_RELOADS_TOTAL.with_label_values(&[label]).inc();
}

pub fn record_refresh(event: &str) {
    REFRESH_TOTAL.with_label_values(&[event]).inc();
}

pub fn record_remote_error(op: &str) {
    REMOTE_ERRORS_TOTAL.with_label_values(&[op]).inc();
}

pub fn record_request_duration(lookup: &str, elapsed: Duration) {
    REQUEST_DURATION_SECONDS
        .with_label_values(&[lookup])
        .observe(elapsed.as_secs_f64());
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("encode metrics");
    buffer
}
