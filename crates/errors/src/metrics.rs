use std::sync::LazyLock;

use prometheus::{
    register_int_counter_vec,
    IntCounterVec,
};

static ERRORS_REPORTED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "synckairos_errors_reported_total",
        "Errors funneled through report_error, labeled by stable code",
        &["code"]
    )
    .expect("metric registration")
});

pub(crate) fn log_error_reported(code: &str) {
    ERRORS_REPORTED_TOTAL.with_label_values(&[code]).inc();
}
