use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fred::{
    clients::SubscriberClient,
    interfaces::{
        ClientLike,
        EventInterface,
        KeysInterface,
        LuaInterface,
        PubsubInterface,
    },
    prelude::{
        Builder,
        Client,
        Config,
    },
    types::{
        Expiration,
        Value,
    },
};
use futures::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    metrics,
    pattern_matches,
    CasOutcome,
    ChannelMessage,
    MessageStream,
    PrimaryStore,
};

/// Version-checked write, executed atomically server-side. Reads the stored
/// JSON document, compares its `version` field, and overwrites (refreshing
/// the TTL) only on equality.
///
/// Returns -1 when the key is absent, 0 on a successful write, and the
/// actual stored version on a mismatch. Versions start at 1, so 0 and -1 are
/// unambiguous.
const CAS_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if current == false then
  return -1
end
local ok, document = pcall(cjson.decode, current)
if not ok or type(document) ~= 'table' or document['version'] == nil then
  return redis.error_reply('unversioned document under key')
end
local actual = tonumber(document['version'])
if actual == tonumber(ARGV[1]) then
  redis.call('SET', KEYS[1], ARGV[2], 'EX', tonumber(ARGV[3]))
  return 0
end
return actual
";

/// INCR that attaches the window TTL only when the counter is created, so
/// the fixed window does not slide on every hit.
const INCR_SCRIPT: &str = r"
local value = redis.call('INCR', KEYS[1])
if value == 1 then
  redis.call('EXPIRE', KEYS[1], tonumber(ARGV[1]))
end
return value
";

/// Redis-backed [`PrimaryStore`]. Holds two connections, as RESP requires:
/// one for request/response commands and one dedicated to subscriptions.
/// The subscriber client re-establishes its subscriptions after a reconnect.
pub struct RedisStore {
    client: Client,
    subscriber: SubscriberClient,
}

impl RedisStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let config = Config::from_url(url)?;
        let client = Builder::from_config(config.clone()).build()?;
        client.init().await?;
        let subscriber = Builder::from_config(config).build_subscriber_client()?;
        subscriber.init().await?;
        tracing::info!("connected to primary store");
        Ok(Self { client, subscriber })
    }

    fn filtered_stream<F>(&self, filter: F) -> MessageStream
    where
        F: Fn(&str) -> bool + Send + 'static,
    {
        // Attach to the broadcast before the SUBSCRIBE command is issued so
        // no message can slip between confirmation and attachment.
        let rx = self.subscriber.message_rx();
        let stream = BroadcastStream::new(rx).filter_map(move |result| {
            let out = match result {
                Ok(message) if filter(&message.channel) => {
                    payload_bytes(message.value).map(|payload| ChannelMessage {
                        channel: message.channel.to_string(),
                        payload,
                    })
                },
                Ok(_) => None,
                Err(lag) => {
                    // Subscribers only need the latest snapshot per session,
                    // so dropped intermediate messages are survivable.
                    tracing::warn!("subscription receiver lagged: {lag}");
                    None
                },
            };
            futures::future::ready(out)
        });
        Box::pin(stream)
    }
}

fn payload_bytes(value: Value) -> Option<Bytes> {
    match value {
        Value::String(s) => Some(s.into_inner()),
        Value::Bytes(b) => Some(b),
        other => {
            tracing::warn!("non-bytes pubsub payload: {other:?}");
            None
        },
    }
}

fn ttl_seconds(ttl: Duration) -> i64 {
    // Redis EX of 0 is an error; clamp to the smallest legal TTL.
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1)
}

#[async_trait]
impl PrimaryStore for RedisStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        let _timer = metrics::store_timer("get");
        let value: Value = self.client.get(key).await?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(payload_bytes(value))
    }

    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> anyhow::Result<()> {
        let _timer = metrics::store_timer("set");
        let _: () = self
            .client
            .set(
                key,
                Value::Bytes(value),
                Some(Expiration::EX(ttl_seconds(ttl))),
                None,
                false,
            )
            .await?;
        Ok(())
    }

    async fn compare_and_set_with_ttl(
        &self,
        key: &str,
        expected_version: u64,
        value: Bytes,
        ttl: Duration,
    ) -> anyhow::Result<CasOutcome> {
        let _timer = metrics::store_timer("cas");
        let args = vec![
            Value::Integer(i64::try_from(expected_version)?),
            Value::Bytes(value),
            Value::Integer(ttl_seconds(ttl)),
        ];
        let result: i64 = self
            .client
            .eval(CAS_SCRIPT, vec![key.to_owned()], args)
            .await?;
        let outcome = match result {
            -1 => CasOutcome::Missing,
            0 => CasOutcome::Written,
            actual => {
                metrics::log_cas_conflict();
                CasOutcome::VersionMismatch {
                    actual: u64::try_from(actual)?,
                }
            },
        };
        Ok(outcome)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let _timer = metrics::store_timer("delete");
        let removed: i64 = self.client.del(key).await?;
        Ok(removed > 0)
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> anyhow::Result<()> {
        let _timer = metrics::store_timer("publish");
        let _: i64 = self.client.publish(channel, Value::Bytes(payload)).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<MessageStream> {
        let stream = {
            let channel = channel.to_owned();
            self.filtered_stream(move |incoming| incoming == channel)
        };
        self.subscriber.subscribe(channel).await?;
        Ok(stream)
    }

    async fn psubscribe(&self, pattern: &str) -> anyhow::Result<MessageStream> {
        let stream = {
            let pattern = pattern.to_owned();
            self.filtered_stream(move |incoming| pattern_matches(&pattern, incoming))
        };
        self.subscriber.psubscribe(pattern).await?;
        Ok(stream)
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> anyhow::Result<i64> {
        let _timer = metrics::store_timer("incr");
        let value: i64 = self
            .client
            .eval(
                INCR_SCRIPT,
                vec![key.to_owned()],
                vec![Value::Integer(ttl_seconds(ttl))],
            )
            .await?;
        Ok(value)
    }

    /// Best-effort teardown: flush buffered commands and close both
    /// connections. Subscriptions die with the subscriber connection.
    async fn close(&self) {
        if let Err(e) = self.subscriber.quit().await {
            tracing::warn!("error closing subscriber connection: {e}");
        }
        if let Err(e) = self.client.quit().await {
            tracing::warn!("error closing command connection: {e}");
        }
    }
}
