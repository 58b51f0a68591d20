use async_trait::async_trait;
use futures_util::StreamExt;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{trace, warn};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Pub/sub channels plus a shared key/value store; the only cross-process
/// shared resource. Every cross-node coordination flows through one of these.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError>;

    /// Subscribe to one channel. Messages are delivered in publish order per
    /// channel.
    async fn subscribe(&self, channel: &str) -> Result<BusSubscriber, BusError>;

    async fn kv_set(&self, key: &str, value: &str) -> Result<(), BusError>;

    async fn kv_get(&self, key: &str) -> Result<Option<String>, BusError>;
}

pub struct BusSubscriber {
    receiver: mpsc::Receiver<String>,
}

impl BusSubscriber {
    /// Next message on the channel; `None` once the bus drops the
    /// subscription.
    pub async fn receive(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

const SUBSCRIBER_BUFFER: usize = 64;

/// In-process bus for single-node deployments and tests.
#[derive(Default)]
pub struct LocalBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
    kv: Mutex<HashMap<String, String>>,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let targets = {
            let mut guard = self.subscribers.lock().unwrap();
            match guard.get_mut(channel) {
                Some(senders) => {
                    senders.retain(|tx| !tx.is_closed());
                    senders.clone()
                }
                None => Vec::new(),
            }
        };
        trace!(channel, targets = targets.len(), "publishing");
        for tx in targets {
            // A lagging subscriber delays delivery rather than dropping it;
            // per-channel ordering is part of the bus contract.
            let _ = tx.send(payload.to_owned()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BusSubscriber, BusError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .lock()
            .unwrap()
            .entry(channel.to_owned())
            .or_default()
            .push(tx);
        Ok(BusSubscriber { receiver: rx })
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<(), BusError> {
        self.kv
            .lock()
            .unwrap()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, BusError> {
        Ok(self.kv.lock().unwrap().get(key).cloned())
    }
}

/// Redis-backed bus connecting sibling processes of the service.
pub struct RedisBus {
    client: redis::Client,
    conn: redis::aio::ConnectionManager,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::AsyncCommands::publish(&mut conn, channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BusSubscriber, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let channel = channel.to_owned();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(channel, "dropping non-utf8 bus message: {err}");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(BusSubscriber { receiver: rx })
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: () = redis::AsyncCommands::set(&mut conn, key, value).await?;
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, BusError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::AsyncCommands::get(&mut conn, key).await?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_delivers_in_order_per_channel() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("room:test").await.unwrap();
        bus.publish("room:test", "one").await.unwrap();
        bus.publish("room:test", "two").await.unwrap();
        bus.publish("room:other", "elsewhere").await.unwrap();
        assert_eq!(sub.receive().await.as_deref(), Some("one"));
        assert_eq!(sub.receive().await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn local_bus_fans_out_to_every_subscriber() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe("c").await.unwrap();
        let mut b = bus.subscribe("c").await.unwrap();
        bus.publish("c", "hello").await.unwrap();
        assert_eq!(a.receive().await.as_deref(), Some("hello"));
        assert_eq!(b.receive().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn local_bus_prunes_dropped_subscribers() {
        let bus = LocalBus::new();
        let sub = bus.subscribe("c").await.unwrap();
        drop(sub);
        bus.publish("c", "x").await.unwrap();
        assert!(bus.subscribers.lock().unwrap()["c"].is_empty());
    }

    #[tokio::test]
    async fn local_bus_kv_round_trip() {
        let bus = LocalBus::new();
        assert_eq!(bus.kv_get("k").await.unwrap(), None);
        bus.kv_set("k", "v").await.unwrap();
        assert_eq!(bus.kv_get("k").await.unwrap().as_deref(), Some("v"));
    }
}
