use std::sync::LazyLock;

use prometheus::{
    register_int_counter,
    register_int_gauge,
    IntCounter,
    IntGauge,
};

static CONNECTIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!(
        "synckairos_ws_connections",
        "Currently open WebSocket connections on this instance"
    )
    .expect("metric registration")
});

static MESSAGES_IN_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "synckairos_ws_messages_in_total",
        "Text frames received from clients"
    )
    .expect("metric registration")
});

static MESSAGES_OUT_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "synckairos_ws_messages_out_total",
        "Messages enqueued for delivery to clients"
    )
    .expect("metric registration")
});

static SLOW_CONSUMER_DISCONNECTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "synckairos_ws_slow_consumer_disconnects_total",
        "Connections dropped because their send queue overran"
    )
    .expect("metric registration")
});

static HEARTBEAT_TIMEOUTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "synckairos_ws_heartbeat_timeouts_total",
        "Connections reaped for not answering a heartbeat probe"
    )
    .expect("metric registration")
});

pub(crate) fn log_connection_opened() {
    CONNECTIONS.inc();
}

pub(crate) fn log_connection_closed() {
    CONNECTIONS.dec();
}

pub(crate) fn log_message_in() {
    MESSAGES_IN_TOTAL.inc();
}

pub(crate) fn log_message_out() {
    MESSAGES_OUT_TOTAL.inc();
}

pub(crate) fn log_slow_consumer_disconnect() {
    SLOW_CONSUMER_DISCONNECTS_TOTAL.inc();
}

pub(crate) fn log_heartbeat_timeout() {
    HEARTBEAT_TIMEOUTS_TOTAL.inc();
}
