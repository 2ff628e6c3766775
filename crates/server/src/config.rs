use std::{
    net::SocketAddr,
    time::Duration,
};

use clap::Parser;

/// Everything an instance needs, overridable from the environment for
/// container deployments.
#[derive(Parser, Clone, Debug)]
#[clap(name = "synckairos", version, about = "Distributed session sync service")]
pub struct ServerConfig {
    /// Address to listen on.
    #[clap(long, env = "SYNCKAIROS_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: SocketAddr,

    /// Primary store (Redis) connection URL.
    #[clap(
        long,
        env = "SYNCKAIROS_REDIS_URL",
        default_value = "redis://127.0.0.1:6379"
    )]
    pub redis_url: String,

    /// Audit log (PostgreSQL) connection URL. Without one, audit events stay
    /// in process memory; fine for local development, not for production.
    #[clap(long, env = "SYNCKAIROS_POSTGRES_URL")]
    pub postgres_url: Option<String>,

    /// Concurrent audit persist transactions.
    #[clap(long, env = "SYNCKAIROS_AUDIT_WORKERS", default_value_t = 10)]
    pub audit_workers: usize,

    /// Attempts per audit job before it is surfaced as dead.
    #[clap(long, env = "SYNCKAIROS_AUDIT_MAX_ATTEMPTS", default_value_t = 5)]
    pub audit_max_attempts: u32,

    /// Base delay between audit retries, in milliseconds (doubles per
    /// failure).
    #[clap(long, env = "SYNCKAIROS_AUDIT_RETRY_BASE_MS", default_value_t = 2_000)]
    pub audit_retry_base_ms: u64,

    /// Session key TTL in seconds; refreshed on every write.
    #[clap(long, env = "SYNCKAIROS_SESSION_TTL_SECS", default_value_t = 3_600)]
    pub session_ttl_secs: u64,

    /// WebSocket heartbeat interval in seconds.
    #[clap(long, env = "SYNCKAIROS_HEARTBEAT_SECS", default_value_t = 5)]
    pub heartbeat_secs: u64,

    /// Outbound queue depth per WebSocket connection.
    #[clap(long, env = "SYNCKAIROS_WS_SEND_QUEUE_DEPTH", default_value_t = 64)]
    pub ws_send_queue_depth: usize,

    /// Hot-path operations per session per second.
    #[clap(long, env = "SYNCKAIROS_SWITCH_RATE_PER_SECOND", default_value_t = 10)]
    pub switch_rate_per_second: i64,

    /// General requests per client IP per minute.
    #[clap(long, env = "SYNCKAIROS_IP_RATE_PER_MINUTE", default_value_t = 100)]
    pub ip_rate_per_minute: i64,
}

impl ServerConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn audit_retry_base(&self) -> Duration {
        Duration::from_millis(self.audit_retry_base_ms)
    }
}
