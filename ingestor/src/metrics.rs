use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::Once;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref READINGS_RECEIVED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_readings_received_total",
        "Total readings submitted over any transport"
    ))
    .unwrap();
    pub static ref READINGS_ACCEPTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_readings_accepted_total",
        "Total readings newly persisted"
    ))
    .unwrap();
    pub static ref READINGS_DUPLICATE_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_readings_duplicate_total",
        "Total resubmissions answered as duplicates"
    ))
    .unwrap();
    pub static ref READINGS_REJECTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "ingestor_readings_rejected_total",
            "Total readings rejected by validation, by reason"
        ),
        &["reason"]
    )
    .unwrap();
    pub static ref STORAGE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_storage_failures_total",
        "Total failed storage operations"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_ingest_latency_seconds",
            "Time taken to persist a reading or batch"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref BATCH_SIZE: Gauge = Gauge::with_opts(Opts::new(
        "ingestor_batch_size",
        "Current batch size being processed"
    ))
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_channel_full_total",
        "Total number of times channel was full (backpressure events)"
    ))
    .unwrap();
    pub static ref READINGS_PRUNED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_readings_pruned_total",
        "Total readings removed by retention"
    ))
    .unwrap();
    pub static ref RETENTION_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_retention_failures_total",
        "Total failed retention passes"
    ))
    .unwrap();
}

static INIT: Once = Once::new();

/// Registers all collectors. Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(READINGS_RECEIVED_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(READINGS_ACCEPTED_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(READINGS_DUPLICATE_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(READINGS_REJECTED_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(STORAGE_FAILURES_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(INGEST_LATENCY_SECONDS.clone()))
            .unwrap();
        REGISTRY.register(Box::new(BATCH_SIZE.clone())).unwrap();
        REGISTRY
            .register(Box::new(CHANNEL_FULL_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(READINGS_PRUNED_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(RETENTION_FAILURES_TOTAL.clone()))
            .unwrap();
    });
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
