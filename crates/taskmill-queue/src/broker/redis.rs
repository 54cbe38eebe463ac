//! Redis-backed broker.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use tracing::debug;

use crate::broker::{Broker, MessageStream};
use crate::error::QueueResult;

/// Broker over a shared `redis::Client`.
///
/// Every operation opens a multiplexed connection from the client, so a
/// single `RedisBroker` can be cloned behind an `Arc` and used from any
/// number of worker loops.
pub struct RedisBroker {
    client: redis::Client,
}

impl RedisBroker {
    pub fn new(redis_url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push_front(&self, list: &str, value: &str) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.lpush::<_, _, ()>(list, value).await?;
        Ok(())
    }

    async fn pop_back(&self, list: &str) -> QueueResult<Option<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<String> = conn.rpop(list, None).await?;
        Ok(value)
    }

    async fn remove_from_list(&self, list: &str, value: &str) -> QueueResult<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let removed: u64 = conn.lrem(list, 0, value).await?;
        Ok(removed)
    }

    async fn list_len(&self, list: &str) -> QueueResult<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let len: u64 = conn.llen(list).await?;
        Ok(len)
    }

    async fn set_nx_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        // SET with NX and EX is atomic; the reply is nil when the key is held.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn zadd(&self, set: &str, member: &str, score: f64) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.zadd::<_, _, _, ()>(set, member, score).await?;
        Ok(())
    }

    async fn zrange_by_score_upto(&self, set: &str, max_score: f64) -> QueueResult<Vec<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let members: Vec<String> = conn.zrangebyscore(set, "-inf", max_score).await?;
        Ok(members)
    }

    async fn zrem(&self, set: &str, member: &str) -> QueueResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let removed: u64 = conn.zrem(set, member).await?;
        Ok(removed > 0)
    }

    async fn publish(&self, channel: &str, payload: &str) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> QueueResult<MessageStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        debug!("Subscribed to channel {}", channel);

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });

        Ok(Box::pin(stream))
    }
}
