use std::sync::LazyLock;

use prometheus::{
    register_int_counter,
    register_int_counter_vec,
    IntCounter,
    IntCounterVec,
};

static AUDIT_ENQUEUED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "synckairos_audit_enqueued_total",
        "Audit jobs accepted by the queue, by event type",
        &["event_type"]
    )
    .expect("metric registration")
});

static AUDIT_COMPLETED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "synckairos_audit_completed_total",
        "Audit jobs durably persisted, by event type",
        &["event_type"]
    )
    .expect("metric registration")
});

static AUDIT_DEAD_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "synckairos_audit_dead_total",
        "Audit jobs dropped after exhausting all retry attempts"
    )
    .expect("metric registration")
});

static AUDIT_PERMANENT_FAILURES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "synckairos_audit_permanent_failures_total",
        "Audit jobs completed without persisting due to constraint violations"
    )
    .expect("metric registration")
});

pub(crate) fn log_enqueued(event_type: &str) {
    AUDIT_ENQUEUED_TOTAL.with_label_values(&[event_type]).inc();
}

pub(crate) fn log_completed(event_type: &str) {
    AUDIT_COMPLETED_TOTAL.with_label_values(&[event_type]).inc();
}

pub(crate) fn log_dead() {
    AUDIT_DEAD_TOTAL.inc();
}

pub(crate) fn log_permanent_failure() {
    AUDIT_PERMANENT_FAILURES_TOTAL.inc();
}
