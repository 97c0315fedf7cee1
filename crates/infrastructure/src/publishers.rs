use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use orchestrator_domain::{
    EventPublisher, ExchangeKind, ExchangeSpec, MessageBroker, MessageType, Notification,
    Notifier, OrchestratorResult, ResourceEvent, TaskEnvelope,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::subscriber_registry::SubscriberRegistry;

/// 把资源事件发到 per-entity 的自删除 fanout 交换机
pub struct BrokerEventPublisher {
    broker: Arc<dyn MessageBroker>,
    live_prefix: String,
    declared: Mutex<HashSet<String>>,
}

impl BrokerEventPublisher {
    pub fn new(broker: Arc<dyn MessageBroker>, live_prefix: impl Into<String>) -> Self {
        Self {
            broker,
            live_prefix: live_prefix.into(),
            declared: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl EventPublisher for BrokerEventPublisher {
    async fn publish(&self, event: &ResourceEvent) -> OrchestratorResult<()> {
        let spec = ExchangeSpec::live(&self.live_prefix, event.kind.as_str(), event.resource_id);
        {
            let mut declared = self.declared.lock().await;
            if !declared.contains(&spec.name) {
                self.broker.declare_exchange(&spec).await?;
                declared.insert(spec.name.clone());
            }
        }

        let envelope = TaskEnvelope::new(
            event,
            MessageType::Event,
            spec.name,
            event.routing_key(),
            ExchangeKind::Fanout,
        )?;
        self.broker.publish(&envelope).await
    }
}

/// 用户通知发到通知 topic 交换机，路由键 `notifications.task.<user>`
pub struct BrokerNotifier {
    broker: Arc<dyn MessageBroker>,
    exchange: String,
}

impl BrokerNotifier {
    pub fn new(broker: Arc<dyn MessageBroker>, exchange: impl Into<String>) -> Self {
        Self {
            broker,
            exchange: exchange.into(),
        }
    }
}

#[async_trait]
impl Notifier for BrokerNotifier {
    async fn notify(&self, notification: &Notification) -> OrchestratorResult<()> {
        let envelope = TaskEnvelope::new(
            notification,
            MessageType::Notification,
            self.exchange.as_str(),
            notification.routing_key(),
            ExchangeKind::Topic,
        )?;
        self.broker.publish(&envelope).await?;
        debug!(user_id = %notification.user_id, "通知已发布");
        Ok(())
    }
}

/// 直接推送给本进程内的实时订阅者
pub struct LocalPublisher {
    registry: SubscriberRegistry,
}

impl LocalPublisher {
    pub fn new(registry: SubscriberRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl EventPublisher for LocalPublisher {
    async fn publish(&self, event: &ResourceEvent) -> OrchestratorResult<()> {
        let payload = serde_json::to_value(event)?;
        self.registry.publish(&event.routing_key(), &payload);
        Ok(())
    }
}

#[async_trait]
impl Notifier for LocalPublisher {
    async fn notify(&self, notification: &Notification) -> OrchestratorResult<()> {
        let payload = serde_json::to_value(notification)?;
        self.registry.publish(&notification.routing_key(), &payload);
        Ok(())
    }
}

/// 依次发给多个发布者；任一失败只记录日志，全部失败才返回错误
pub struct CompositeEventPublisher {
    publishers: Vec<Arc<dyn EventPublisher>>,
}

impl CompositeEventPublisher {
    pub fn new(publishers: Vec<Arc<dyn EventPublisher>>) -> Self {
        Self { publishers }
    }
}

#[async_trait]
impl EventPublisher for CompositeEventPublisher {
    async fn publish(&self, event: &ResourceEvent) -> OrchestratorResult<()> {
        let mut last_error = None;
        let mut succeeded = 0;
        for publisher in &self.publishers {
            match publisher.publish(event).await {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    warn!(resource_id = event.resource_id, error = %e, "事件发布失败");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if succeeded == 0 => Err(e),
            _ => Ok(()),
        }
    }
}
