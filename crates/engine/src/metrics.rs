use std::sync::LazyLock;

use prometheus::{
    register_histogram,
    register_int_counter_vec,
    Histogram,
    HistogramTimer,
    IntCounterVec,
};

static OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "synckairos_engine_operations_total",
        "Successful engine operations by kind",
        &["op"]
    )
    .expect("metric registration")
});

static SWITCH_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "synckairos_engine_switch_seconds",
        "End-to-end cycle switch latency (load, transition, CAS persist)",
        prometheus::exponential_buckets(0.001, 2.0, 10).expect("bucket layout")
    )
    .expect("metric registration")
});

pub(crate) fn log_operation(op: &str) {
    OPERATIONS_TOTAL.with_label_values(&[op]).inc();
}

pub(crate) fn switch_timer() -> HistogramTimer {
    SWITCH_SECONDS.start_timer()
}
