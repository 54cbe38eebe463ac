//! In-memory broker for tests and single-process runs.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::{broadcast, Mutex};

use crate::broker::{Broker, MessageStream};
use crate::error::QueueResult;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct MemoryState {
    lists: HashMap<String, VecDeque<String>>,
    /// Key -> (value, expiry). Expired entries are dropped lazily.
    keys: HashMap<String, (String, Instant)>,
    sorted: HashMap<String, HashMap<String, f64>>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

/// Broker over process-local state. Implements the same ordering and
/// expiry contracts as [`super::RedisBroker`].
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push_front(&self, list: &str, value: &str) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state
            .lists
            .entry(list.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn pop_back(&self, list: &str) -> QueueResult<Option<String>> {
        let mut state = self.state.lock().await;
        Ok(state.lists.get_mut(list).and_then(|l| l.pop_back()))
    }

    async fn remove_from_list(&self, list: &str, value: &str) -> QueueResult<u64> {
        let mut state = self.state.lock().await;
        let Some(entries) = state.lists.get_mut(list) else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|v| v != value);
        Ok((before - entries.len()) as u64)
    }

    async fn list_len(&self, list: &str) -> QueueResult<u64> {
        let state = self.state.lock().await;
        Ok(state.lists.get(list).map(|l| l.len()).unwrap_or(0) as u64)
    }

    async fn set_nx_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if let Some((_, expiry)) = state.keys.get(key) {
            if *expiry > now {
                return Ok(false);
            }
        }

        state
            .keys
            .insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.keys.remove(key);
        Ok(())
    }

    async fn zadd(&self, set: &str, member: &str, score: f64) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state
            .sorted
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange_by_score_upto(&self, set: &str, max_score: f64) -> QueueResult<Vec<String>> {
        let state = self.state.lock().await;
        let Some(members) = state.sorted.get(set) else {
            return Ok(Vec::new());
        };

        let mut due: Vec<(&String, f64)> = members
            .iter()
            .filter(|(_, &score)| score <= max_score)
            .map(|(member, &score)| (member, score))
            .collect();
        due.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        Ok(due.into_iter().map(|(member, _)| member.clone()).collect())
    }

    async fn zrem(&self, set: &str, member: &str) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        Ok(state
            .sorted
            .get_mut(set)
            .map(|members| members.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn publish(&self, channel: &str, payload: &str) -> QueueResult<()> {
        let state = self.state.lock().await;
        if let Some(tx) = state.channels.get(channel) {
            // No receivers is fine for fire-and-forget publishing.
            let _ = tx.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> QueueResult<MessageStream> {
        let mut state = self.state.lock().await;
        let tx = state
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        let rx = tx.subscribe();
        drop(state);

        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => return Some((msg, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_fifo_ordering() {
        let broker = MemoryBroker::new();
        broker.push_front("q", "a").await.unwrap();
        broker.push_front("q", "b").await.unwrap();
        broker.push_front("q", "c").await.unwrap();

        assert_eq!(broker.pop_back("q").await.unwrap(), Some("a".to_string()));
        assert_eq!(broker.pop_back("q").await.unwrap(), Some("b".to_string()));
        assert_eq!(broker.pop_back("q").await.unwrap(), Some("c".to_string()));
        assert_eq!(broker.pop_back("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_from_list() {
        let broker = MemoryBroker::new();
        broker.push_front("q", "a").await.unwrap();
        broker.push_front("q", "b").await.unwrap();
        broker.push_front("q", "a").await.unwrap();

        assert_eq!(broker.remove_from_list("q", "a").await.unwrap(), 2);
        assert_eq!(broker.remove_from_list("q", "missing").await.unwrap(), 0);
        assert_eq!(broker.list_len("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_nx_excludes_second_writer() {
        let broker = MemoryBroker::new();
        let ttl = Duration::from_secs(10);

        assert!(broker.set_nx_with_ttl("lock", "w1", ttl).await.unwrap());
        assert!(!broker.set_nx_with_ttl("lock", "w2", ttl).await.unwrap());

        broker.delete("lock").await.unwrap();
        assert!(broker.set_nx_with_ttl("lock", "w2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_nx_succeeds_after_expiry() {
        let broker = MemoryBroker::new();
        let ttl = Duration::from_millis(20);

        assert!(broker.set_nx_with_ttl("lock", "w1", ttl).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(broker.set_nx_with_ttl("lock", "w2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_zrange_orders_by_score() {
        let broker = MemoryBroker::new();
        broker.zadd("s", "late", 30.0).await.unwrap();
        broker.zadd("s", "early", 10.0).await.unwrap();
        broker.zadd("s", "mid", 20.0).await.unwrap();
        broker.zadd("s", "future", 99.0).await.unwrap();

        let due = broker.zrange_by_score_upto("s", 25.0).await.unwrap();
        assert_eq!(due, vec!["early".to_string(), "mid".to_string()]);

        assert!(broker.zrem("s", "early").await.unwrap());
        assert!(!broker.zrem("s", "early").await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let broker = MemoryBroker::new();
        let mut stream = broker.subscribe("events").await.unwrap();

        broker.publish("events", "hello").await.unwrap();
        assert_eq!(stream.next().await, Some("hello".to_string()));
    }
}
