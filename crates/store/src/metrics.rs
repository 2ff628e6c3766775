use std::sync::LazyLock;

use prometheus::{
    register_histogram_vec,
    register_int_counter,
    HistogramTimer,
    HistogramVec,
    IntCounter,
};

static STORE_REQUEST_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "synckairos_store_request_seconds",
        "Latency of primary store round-trips by operation",
        &["op"],
        prometheus::exponential_buckets(0.0005, 2.0, 12).expect("bucket layout")
    )
    .expect("metric registration")
});

static CAS_CONFLICTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "synckairos_store_cas_conflicts_total",
        "Version-checked writes that lost the race"
    )
    .expect("metric registration")
});

pub(crate) fn store_timer(op: &str) -> HistogramTimer {
    STORE_REQUEST_SECONDS.with_label_values(&[op]).start_timer()
}

pub(crate) fn log_cas_conflict() {
    CAS_CONFLICTS_TOTAL.inc()
}
