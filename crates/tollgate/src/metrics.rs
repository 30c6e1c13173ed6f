use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::LazyLock;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("tollgate_requests_total", "Total number of requests"),
        &["service", "status"],
    )
    .unwrap()
});

pub static CHALLENGES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tollgate_challenges_total",
        "Total number of payment challenges issued",
    )
    .unwrap()
});

pub static TOKENS_VERIFIED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "tollgate_tokens_verified_total",
            "Token verification attempts by result",
        ),
        &["result"],
    )
    .unwrap()
});

pub static PROXY_LATENCY: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "tollgate_proxy_latency_seconds",
            "Upstream request latency",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
    )
    .unwrap()
});

pub static INVOICE_CACHE_SIZE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "tollgate_invoice_cache_size",
        "Number of invoices in the settlement cache",
    )
    .unwrap()
});

/// Register all metrics with the registry. Call once at startup.
pub fn register_metrics() {
    REGISTRY.register(Box::new(REQUESTS_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(CHALLENGES_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(TOKENS_VERIFIED.clone())).unwrap();
    REGISTRY.register(Box::new(PROXY_LATENCY.clone())).unwrap();
    REGISTRY
        .register(Box::new(INVOICE_CACHE_SIZE.clone()))
        .unwrap();
}
