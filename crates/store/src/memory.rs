use std::{
    collections::HashMap,
    time::{
        Duration,
        Instant,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    pattern_matches,
    CasOutcome,
    ChannelMessage,
    MessageStream,
    PrimaryStore,
};

const PUBSUB_BUFFER: usize = 1024;

struct Entry {
    value: Bytes,
    expires_at: Instant,
}

/// In-process stand-in for Redis used by unit tests: same CAS semantics
/// (version field extracted from the stored JSON, exactly what the Lua
/// script does server-side), same TTL behavior via lazy expiry, and pub/sub
/// over a process-local broadcast channel.
///
/// Sharing one `MemoryStore` between two `StateManager`s simulates two
/// server instances against one Redis.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    messages: broadcast::Sender<ChannelMessage>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (messages, _) = broadcast::channel(PUBSUB_BUFFER);
        Self {
            entries: Mutex::new(HashMap::new()),
            messages,
        }
    }

    /// Drops the entry if its TTL lapsed, mimicking Redis eviction.
    fn live_value(entries: &mut HashMap<String, Entry>, key: &str) -> Option<Bytes> {
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            },
            None => None,
        }
    }

    fn filtered_stream<F>(&self, filter: F) -> MessageStream
    where
        F: Fn(&ChannelMessage) -> bool + Send + 'static,
    {
        let stream = BroadcastStream::new(self.messages.subscribe())
            .filter_map(move |result| {
                // Lagged receivers skip; subscribers only ever need the
                // latest full snapshot.
                let out = match result {
                    Ok(message) if filter(&message) => Some(message),
                    _ => None,
                };
                futures::future::ready(out)
            });
        Box::pin(stream)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PrimaryStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        let mut entries = self.entries.lock();
        Ok(Self::live_value(&mut entries, key))
    }

    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> anyhow::Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn compare_and_set_with_ttl(
        &self,
        key: &str,
        expected_version: u64,
        value: Bytes,
        ttl: Duration,
    ) -> anyhow::Result<CasOutcome> {
        let mut entries = self.entries.lock();
        let Some(current) = Self::live_value(&mut entries, key) else {
            return Ok(CasOutcome::Missing);
        };
        let document: serde_json::Value = serde_json::from_slice(&current)
            .map_err(|e| anyhow::anyhow!("corrupt document under {key}: {e}"))?;
        let actual = document
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| anyhow::anyhow!("document under {key} has no version field"))?;
        if actual != expected_version {
            return Ok(CasOutcome::VersionMismatch { actual });
        }
        entries.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(CasOutcome::Written)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let mut entries = self.entries.lock();
        let existed = Self::live_value(&mut entries, key).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> anyhow::Result<()> {
        // No subscribers is fine; Redis PUBLISH to zero listeners is a no-op.
        let _ = self.messages.send(ChannelMessage {
            channel: channel.to_owned(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<MessageStream> {
        let channel = channel.to_owned();
        Ok(self.filtered_stream(move |message| message.channel == channel))
    }

    async fn psubscribe(&self, pattern: &str) -> anyhow::Result<MessageStream> {
        let pattern = pattern.to_owned();
        Ok(self.filtered_stream(move |message| pattern_matches(&pattern, &message.channel)))
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> anyhow::Result<i64> {
        let mut entries = self.entries.lock();
        let current = Self::live_value(&mut entries, key)
            .map(|value| {
                std::str::from_utf8(&value)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| anyhow::anyhow!("counter under {key} is not an integer"))
            })
            .transpose()?
            .unwrap_or(0);
        let next = current + 1;
        let expires_at = match entries.get(key) {
            // INCR preserves the existing TTL; only creation sets one.
            Some(entry) => entry.expires_at,
            None => Instant::now() + ttl,
        };
        entries.insert(
            key.to_owned(),
            Entry {
                value: Bytes::from(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn doc(version: u64) -> Bytes {
        Bytes::from(format!(r#"{{"version":{version},"status":"pending"}}"#))
    }

    #[tokio::test]
    async fn get_set_delete_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);

        store
            .set_with_ttl("k", doc(1), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(doc(1)));

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ttl_expiry_evicts() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("k", doc(1), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        // An expired key looks missing to CAS, not conflicting.
        let outcome = store
            .compare_and_set_with_ttl("k", 1, doc(2), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Missing);
    }

    #[tokio::test]
    async fn cas_refreshes_the_ttl() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("k", doc(1), Duration::from_millis(40))
            .await
            .unwrap();
        let outcome = store
            .compare_and_set_with_ttl("k", 1, doc(2), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Written);
        // Past the original deadline, alive on the refreshed one.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await.unwrap(), Some(doc(2)));
    }

    #[tokio::test]
    async fn cas_exactly_one_writer_wins() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("k", doc(2), Duration::from_secs(60))
            .await
            .unwrap();

        // Two writers both observed version 2.
        let first = store
            .compare_and_set_with_ttl("k", 2, doc(3), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(first, CasOutcome::Written);

        let second = store
            .compare_and_set_with_ttl("k", 2, doc(3), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(second, CasOutcome::VersionMismatch { actual: 3 });

        assert_eq!(store.get("k").await.unwrap(), Some(doc(3)));
    }

    #[tokio::test]
    async fn publish_reaches_exact_and_pattern_subscribers() {
        let store = MemoryStore::new();
        let mut updates = store.subscribe("session-updates").await.unwrap();
        let mut ws = store.psubscribe("ws:*").await.unwrap();

        store
            .publish("session-updates", Bytes::from_static(b"u1"))
            .await
            .unwrap();
        store
            .publish("ws:abc", Bytes::from_static(b"b1"))
            .await
            .unwrap();

        let got = updates.next().await.unwrap();
        assert_eq!(got.channel, "session-updates");
        assert_eq!(got.payload, Bytes::from_static(b"u1"));

        let got = ws.next().await.unwrap();
        assert_eq!(got.channel, "ws:abc");
        assert_eq!(got.payload, Bytes::from_static(b"b1"));
    }

    #[tokio::test]
    async fn increment_is_a_fixed_window_counter() {
        let store = MemoryStore::new();
        assert_eq!(
            store
                .increment_with_ttl("c", Duration::from_secs(60))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .increment_with_ttl("c", Duration::from_secs(60))
                .await
                .unwrap(),
            2
        );
    }
}
