use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use metrics::counter;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

type Subscribers = HashMap<String, Vec<(u64, mpsc::Sender<Value>)>>;

/// 实时订阅注册表
///
/// 每个订阅键（如 `logs.network.42`、`notifications.task.alice`）下可有多个订阅者，
/// 每个订阅者一个有界通道；通道满时丢弃该条消息而不阻塞发布方。
#[derive(Clone)]
pub struct SubscriberRegistry {
    subscribers: Arc<Mutex<Subscribers>>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl SubscriberRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            capacity: capacity.max(1),
        }
    }

    /// 返回的句柄被丢弃时自动注销
    pub fn subscribe(&self, key: &str) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers
                .entry(key.to_string())
                .or_default()
                .push((id, sender));
        }
        debug!(key, id, "订阅者已注册");
        Subscription {
            key: key.to_string(),
            id,
            receiver,
            registry: self.subscribers.clone(),
        }
    }

    /// 返回成功投递的订阅者数量
    pub fn publish(&self, key: &str, payload: &Value) -> usize {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return 0;
        };
        let Some(entries) = subscribers.get_mut(key) else {
            return 0;
        };

        let mut delivered = 0;
        entries.retain(|(id, sender)| match sender.try_send(payload.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(key, id, "订阅者通道已满，丢弃消息");
                counter!("orchestrator_live_messages_dropped_total").increment(1);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if entries.is_empty() {
            subscribers.remove(key);
        }
        delivered
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.subscribers
            .lock()
            .map(|s| s.get(key).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

pub struct Subscription {
    key: String,
    id: u64,
    receiver: mpsc::Receiver<Value>,
    registry: Arc<Mutex<Subscribers>>,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut subscribers) = self.registry.lock() {
            if let Some(entries) = subscribers.get_mut(&self.key) {
                entries.retain(|(id, _)| *id != self.id);
                if entries.is_empty() {
                    subscribers.remove(&self.key);
                }
            }
        }
        debug!(key = %self.key, id = self.id, "订阅者已注销");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers_of_key() {
        let registry = SubscriberRegistry::new(8);
        let mut a = registry.subscribe("logs.network.1");
        let mut b = registry.subscribe("logs.network.1");
        let mut other = registry.subscribe("logs.network.2");

        assert_eq!(registry.publish("logs.network.1", &json!({"line": "hello"})), 2);
        assert_eq!(a.recv().await.unwrap()["line"], json!("hello"));
        assert_eq!(b.recv().await.unwrap()["line"], json!("hello"));
        assert!(other.try_recv().is_none());
    }

    #[test]
    fn test_full_channel_drops_without_blocking() {
        let registry = SubscriberRegistry::new(1);
        let mut sub = registry.subscribe("k");
        assert_eq!(registry.publish("k", &json!(1)), 1);
        assert_eq!(registry.publish("k", &json!(2)), 0);
        assert_eq!(sub.try_recv(), Some(json!(1)));
        assert!(sub.try_recv().is_none());
        assert_eq!(registry.subscriber_count("k"), 1);
    }

    #[test]
    fn test_drop_unregisters() {
        let registry = SubscriberRegistry::new(4);
        let sub = registry.subscribe("notifications.task.alice");
        assert_eq!(registry.subscriber_count("notifications.task.alice"), 1);
        drop(sub);
        assert_eq!(registry.subscriber_count("notifications.task.alice"), 0);
        assert_eq!(registry.publish("notifications.task.alice", &json!({})), 0);
    }
}
