use std::sync::LazyLock;

use prometheus::{
    register_histogram_vec,
    HistogramTimer,
    HistogramVec,
};

/// Hot-path budget is tens of milliseconds end-to-end; the buckets are laid
/// out to resolve regressions inside that envelope.
static MUTATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "synckairos_state_mutation_seconds",
        "Latency of persisted session mutations (write + publish + enqueue)",
        &["op"],
        prometheus::exponential_buckets(0.001, 2.0, 10).expect("bucket layout")
    )
    .expect("metric registration")
});

pub(crate) fn mutation_timer(op: &str) -> HistogramTimer {
    MUTATION_SECONDS.with_label_values(&[op]).start_timer()
}
