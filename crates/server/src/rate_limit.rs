use std::{
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use errors::ErrorMetadata;
use store::{
    KeySpace,
    PrimaryStore,
};
use sync_types::SessionId;

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    /// Hot-path operations per session per second.
    pub switch_per_second: i64,
    /// General requests per client IP per minute.
    pub ip_per_minute: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            switch_per_second: 10,
            ip_per_minute: 100,
        }
    }
}

/// Fixed-window counters in the primary store, so limits hold across the
/// whole fleet, not per instance. Counter failures fail open: throttling is
/// protection, not a correctness gate, and a Redis hiccup must not take the
/// API down with it.
pub struct RateLimiter {
    store: Arc<dyn PrimaryStore>,
    keys: KeySpace,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn PrimaryStore>, keys: KeySpace, config: RateLimitConfig) -> Self {
        Self {
            store,
            keys,
            config,
        }
    }

    pub async fn check_switch(&self, session_id: SessionId) -> anyhow::Result<()> {
        let window = Utc::now().timestamp();
        let key = self
            .keys
            .rate_limit_key("switch", format!("{session_id}:{window}"));
        self.check(&key, self.config.switch_per_second, Duration::from_secs(2), 1)
            .await
    }

    pub async fn check_ip(&self, ip: IpAddr) -> anyhow::Result<()> {
        let window = Utc::now().timestamp() / 60;
        let key = self.keys.rate_limit_key("ip", format!("{ip}:{window}"));
        let retry_after = 60 - (Utc::now().timestamp() % 60).unsigned_abs();
        self.check(
            &key,
            self.config.ip_per_minute,
            Duration::from_secs(120),
            retry_after.max(1),
        )
        .await
    }

    async fn check(
        &self,
        key: &str,
        limit: i64,
        window_ttl: Duration,
        retry_after_seconds: u64,
    ) -> anyhow::Result<()> {
        let count = match self.store.increment_with_ttl(key, window_ttl).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("rate-limit counter unavailable, failing open: {e:#}");
                return Ok(());
            },
        };
        if count > limit {
            return Err(ErrorMetadata::rate_limited(
                "Too many requests; slow down",
                Duration::from_secs(retry_after_seconds),
            )
            .into());
        }
        Ok(())
    }
}
