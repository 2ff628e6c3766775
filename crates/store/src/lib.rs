//! The primary store client (Redis in production, in-memory in tests).
//!
//! All shared mutable state in SyncKairos lives behind this interface: one
//! serialized JSON document per session key, version-checked writes for
//! optimistic locking, TTL-based eviction of idle sessions, and pub/sub
//! channels for cross-instance fan-out.

use std::{
    pin::Pin,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

mod memory;
mod metrics;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Default TTL for session keys; refreshed on every write so active sessions
/// never expire underneath their participants.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

/// One message delivered on a subscribed channel.
#[derive(Clone, Debug)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: Bytes,
}

pub type MessageStream = Pin<Box<dyn Stream<Item = ChannelMessage> + Send>>;

/// Outcome of a version-checked write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    Written,
    /// Stored version differed from the expected one; carries what was
    /// actually there so the conflict error can report both.
    VersionMismatch { actual: u64 },
    /// Key absent (deleted or TTL-expired).
    Missing,
}

/// Remote key-value service with publish/subscribe. Implementations must be
/// safe to share across tasks; every method is a potential suspension point
/// and callers never hold locks across them.
#[async_trait]
pub trait PrimaryStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>>;

    /// Unconditional write; refreshes the TTL.
    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> anyhow::Result<()>;

    /// Atomic version-checked write: reads the stored document, compares its
    /// `version` field against `expected_version`, and writes (refreshing
    /// the TTL) only on equality. The comparison and write happen on the
    /// server side in one step; two racing writers cannot both win.
    async fn compare_and_set_with_ttl(
        &self,
        key: &str,
        expected_version: u64,
        value: Bytes,
        ttl: Duration,
    ) -> anyhow::Result<CasOutcome>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> anyhow::Result<bool>;

    /// Fire-and-forget broadcast to all instances subscribed to `channel`.
    async fn publish(&self, channel: &str, payload: Bytes) -> anyhow::Result<()>;

    /// Long-lived subscription to a single channel. Messages arrive in
    /// publish order for this channel; no ordering across channels.
    async fn subscribe(&self, channel: &str) -> anyhow::Result<MessageStream>;

    /// Long-lived subscription to a glob pattern (e.g. `ws:*`).
    async fn psubscribe(&self, pattern: &str) -> anyhow::Result<MessageStream>;

    /// Bumps a shared counter, setting `ttl` when the counter is created.
    /// Returns the post-increment value. Used for fixed-window rate limits.
    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> anyhow::Result<i64>;

    /// Best-effort teardown of connections and subscriptions.
    async fn close(&self) {}
}

/// Key construction for everything this service stores. Production uses the
/// stable default prefix; test suites get a per-run unique prefix so runs
/// sharing one Redis never collide.
#[derive(Clone, Debug)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn production() -> Self {
        Self {
            prefix: "synckairos".to_owned(),
        }
    }

    pub fn unique_for_test() -> Self {
        Self {
            prefix: format!("synckairos-test-{}", uuid::Uuid::new_v4().simple()),
        }
    }

    pub fn session_key(&self, session_id: impl std::fmt::Display) -> String {
        format!("{}:session:{session_id}", self.prefix)
    }

    pub fn rate_limit_key(&self, scope: &str, subject: impl std::fmt::Display) -> String {
        format!("{}:ratelimit:{scope}:{subject}", self.prefix)
    }
}

/// Redis-style glob matching, restricted to the `*` wildcard — the only
/// pattern this service subscribes with.
pub(crate) fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.as_bytes().first() {
        None => channel.is_empty(),
        Some(b'*') => {
            pattern_matches(&pattern[1..], channel)
                || (!channel.is_empty() && pattern_matches(pattern, &channel[1..]))
        },
        Some(&pc) => match channel.as_bytes().first() {
            Some(&cc) if cc == pc => pattern_matches(&pattern[1..], &channel[1..]),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_space_prefixes() {
        let keys = KeySpace::production();
        assert_eq!(keys.session_key("abc"), "synckairos:session:abc");
        assert_eq!(
            keys.rate_limit_key("switch", "abc"),
            "synckairos:ratelimit:switch:abc"
        );

        let a = KeySpace::unique_for_test();
        let b = KeySpace::unique_for_test();
        assert_ne!(a.session_key("x"), b.session_key("x"));
    }

    #[test]
    fn glob_patterns() {
        assert!(pattern_matches("ws:*", "ws:1234"));
        assert!(pattern_matches("ws:*", "ws:"));
        assert!(!pattern_matches("ws:*", "session-updates"));
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("a*c", "abbbc"));
        assert!(!pattern_matches("a*c", "abbbd"));
        assert!(pattern_matches("exact", "exact"));
        assert!(!pattern_matches("exact", "exactly"));
    }
}
