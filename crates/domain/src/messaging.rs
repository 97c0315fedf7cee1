use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use orchestrator_errors::{OrchestratorError, OrchestratorResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::entities::{Resource, ResourceId, TaskRecord, TaskRecordStatus};
use crate::state_machine::Action;

pub const HEADER_RETRIES: &str = "retries";
pub const HEADER_MAX_RETRIES: &str = "max_retries";
pub const HEADER_DELAY: &str = "x-delay";
pub const DEFAULT_MAX_RETRIES: i64 = 3;

const METADATA_KEY: &str = "_metadata";
const METADATA_MESSAGE_TYPE: &str = "_message_type";
const METADATA_ROUTING_KEY: &str = "_routing_key";

pub type MessageHeaders = BTreeMap<String, i64>;

/// 信封类型鉴别字段，决定 worker 使用哪个处理器
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    Task,
    Event,
    Log,
    SchedulerJob,
    Broadcast,
    Notification,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::User => "user",
            MessageType::Task => "task",
            MessageType::Event => "event",
            MessageType::Log => "log",
            MessageType::SchedulerJob => "scheduler_job",
            MessageType::Broadcast => "broadcast",
            MessageType::Notification => "notification",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

/// 重试记账，放在传输层消息头中而不是 JSON 体内
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    pub retries: i64,
    pub max_retries: i64,
    pub delay_ms: i64,
}

impl Default for EnvelopeMetadata {
    fn default() -> Self {
        Self {
            retries: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            delay_ms: 0,
        }
    }
}

impl EnvelopeMetadata {
    pub fn to_headers(&self) -> MessageHeaders {
        let mut headers = MessageHeaders::new();
        headers.insert(HEADER_RETRIES.to_string(), self.retries);
        headers.insert(HEADER_MAX_RETRIES.to_string(), self.max_retries);
        headers.insert(HEADER_DELAY.to_string(), self.delay_ms);
        headers
    }

    pub fn from_headers(headers: &MessageHeaders) -> Self {
        let defaults = Self::default();
        Self {
            retries: headers.get(HEADER_RETRIES).copied().unwrap_or(defaults.retries),
            max_retries: headers
                .get(HEADER_MAX_RETRIES)
                .copied()
                .unwrap_or(defaults.max_retries),
            delay_ms: headers.get(HEADER_DELAY).copied().unwrap_or(defaults.delay_ms),
        }
    }

    /// 再投递一次就会达到上限
    pub fn is_exhausted(&self) -> bool {
        self.retries + 1 >= self.max_retries
    }
}

/// 派发给 broker 的工作单元
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEnvelope {
    pub body: Map<String, Value>,
    pub message_type: MessageType,
    pub exchange: String,
    pub routing_key: String,
    pub exchange_kind: ExchangeKind,
    pub metadata: EnvelopeMetadata,
}

impl TaskEnvelope {
    pub fn new(
        body: impl Serialize,
        message_type: MessageType,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        exchange_kind: ExchangeKind,
    ) -> OrchestratorResult<Self> {
        let body = match serde_json::to_value(body)? {
            Value::Object(map) => map,
            other => {
                return Err(OrchestratorError::invalid_input(format!(
                    "消息体必须是JSON对象, 实际为: {other}"
                )))
            }
        };
        if body.contains_key(METADATA_KEY) {
            return Err(OrchestratorError::invalid_input("消息体不能包含保留字段 _metadata"));
        }

        Ok(Self {
            body,
            message_type,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            exchange_kind,
            metadata: EnvelopeMetadata::default(),
        })
    }

    /// 资源任务信封，发往 topic 交换机
    pub fn for_task(task: &ResourceTask, exchange: &str, max_retries: i64) -> OrchestratorResult<Self> {
        Ok(Self::new(
            task,
            MessageType::Task,
            exchange,
            task.routing_key(),
            ExchangeKind::Topic,
        )?
        .with_max_retries(max_retries))
    }

    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.metadata.max_retries = max_retries;
        self
    }

    pub fn headers(&self) -> MessageHeaders {
        self.metadata.to_headers()
    }

    pub fn encode(&self) -> OrchestratorResult<Vec<u8>> {
        let mut payload = self.body.clone();
        let mut metadata = Map::new();
        metadata.insert(
            METADATA_MESSAGE_TYPE.to_string(),
            Value::String(self.message_type.as_str().to_string()),
        );
        metadata.insert(
            METADATA_ROUTING_KEY.to_string(),
            Value::String(self.routing_key.clone()),
        );
        payload.insert(METADATA_KEY.to_string(), Value::Object(metadata));
        Ok(serde_json::to_vec(&payload)?)
    }

    /// 解析传输层消息；`_metadata._routing_key` 缺失时使用投递时的路由键
    pub fn decode(
        bytes: &[u8],
        headers: &MessageHeaders,
        exchange: &str,
        exchange_kind: ExchangeKind,
        delivery_routing_key: &str,
    ) -> OrchestratorResult<Self> {
        let mut body = match serde_json::from_slice::<Value>(bytes)? {
            Value::Object(map) => map,
            _ => return Err(OrchestratorError::invalid_input("消息体必须是JSON对象")),
        };

        let metadata = match body.remove(METADATA_KEY) {
            Some(Value::Object(map)) => map,
            _ => return Err(OrchestratorError::invalid_input("消息缺少 _metadata 字段")),
        };
        let message_type = metadata
            .get(METADATA_MESSAGE_TYPE)
            .cloned()
            .ok_or_else(|| OrchestratorError::invalid_input("消息缺少 _message_type"))
            .and_then(|v| {
                serde_json::from_value::<MessageType>(v)
                    .map_err(|e| OrchestratorError::invalid_input(format!("未知的消息类型: {e}")))
            })?;
        let routing_key = metadata
            .get(METADATA_ROUTING_KEY)
            .and_then(Value::as_str)
            .unwrap_or(delivery_routing_key)
            .to_string();

        Ok(Self {
            body,
            message_type,
            exchange: exchange.to_string(),
            routing_key,
            exchange_kind,
            metadata: EnvelopeMetadata::from_headers(headers),
        })
    }

    pub fn body_as<T: DeserializeOwned>(&self) -> OrchestratorResult<T> {
        serde_json::from_value(Value::Object(self.body.clone()))
            .map_err(|e| OrchestratorError::invalid_input(format!("消息体格式错误: {e}")))
    }

    /// 保留原路由的重投副本，retries+1
    pub fn retry(&self, delay_ms: i64) -> Self {
        let mut next = self.clone();
        next.metadata.retries += 1;
        next.metadata.delay_ms = delay_ms;
        next
    }
}

/// 资源执行任务的消息体
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTask {
    pub task_id: Uuid,
    pub resource_id: ResourceId,
    pub entity: String,
    pub action: Action,
    pub actor_id: String,
    #[serde(default)]
    pub dry_run: bool,
}

impl ResourceTask {
    pub fn new(resource: &Resource, action: Action, actor_id: impl Into<String>, dry_run: bool) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            resource_id: resource.id,
            entity: resource.kind.as_str().to_string(),
            action,
            actor_id: actor_id.into(),
            dry_run,
        }
    }

    pub fn routing_key(&self) -> String {
        format!("task.{}.{}", self.entity, self.action)
    }

    pub fn record(&self, status: TaskRecordStatus) -> TaskRecord {
        let now = Utc::now();
        TaskRecord {
            task_id: self.task_id,
            resource_id: self.resource_id,
            action: self.action,
            actor_id: self.actor_id.clone(),
            dry_run: self.dry_run,
            status,
            detail: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 交换机声明
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    /// 按 `x-delay` 头延迟投递，RabbitMQ 上需要 delayed-message 插件
    pub delayed: bool,
}

impl ExchangeSpec {
    pub fn durable(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
            auto_delete: false,
            delayed: false,
        }
    }

    /// 任务交换机：durable topic，重试消息按退避时间延迟投递
    pub fn tasks(name: impl Into<String>) -> Self {
        Self {
            delayed: true,
            ..Self::durable(name, ExchangeKind::Topic)
        }
    }

    /// 交互式查看用的实时 fanout 交换机，例如 `logs.network.42`
    pub fn live(prefix: &str, entity: &str, entity_id: ResourceId) -> Self {
        Self {
            name: format!("{prefix}.{entity}.{entity_id}"),
            kind: ExchangeKind::Fanout,
            durable: false,
            auto_delete: true,
            delayed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// 为空时由 broker 生成
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    pub fn shared(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    pub fn exclusive() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> OrchestratorResult<()>;
    async fn nack(&self, requeue: bool) -> OrchestratorResult<()>;
}

/// 从队列取出的一条消息。processed 标记保证只确认一次
pub struct InboundMessage {
    pub body: Vec<u8>,
    pub headers: MessageHeaders,
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub routing_key: String,
    pub redelivered: bool,
    acker: Arc<dyn Acknowledger>,
    processed: AtomicBool,
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("processed", &self.is_processed())
            .finish()
    }
}

impl InboundMessage {
    pub fn new(
        body: Vec<u8>,
        headers: MessageHeaders,
        exchange: impl Into<String>,
        exchange_kind: ExchangeKind,
        routing_key: impl Into<String>,
        redelivered: bool,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            body,
            headers,
            exchange: exchange.into(),
            exchange_kind,
            routing_key: routing_key.into(),
            redelivered,
            acker,
            processed: AtomicBool::new(false),
        }
    }

    pub fn is_processed(&self) -> bool {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn decode(&self) -> OrchestratorResult<TaskEnvelope> {
        TaskEnvelope::decode(
            &self.body,
            &self.headers,
            &self.exchange,
            self.exchange_kind,
            &self.routing_key,
        )
    }

    /// 返回 false 表示此前已确认过，本次未发送
    pub async fn ack(&self) -> OrchestratorResult<bool> {
        if self.processed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.acker.ack().await?;
        Ok(true)
    }

    pub async fn nack(&self, requeue: bool) -> OrchestratorResult<bool> {
        if self.processed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.acker.nack(requeue).await?;
        Ok(true)
    }
}

pub type DeliveryStream = BoxStream<'static, OrchestratorResult<InboundMessage>>;

/// 消息代理连接，由进程启动时构造并注入
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> OrchestratorResult<()>;
    /// 返回实际队列名（匿名队列由 broker 命名）
    async fn declare_queue(&self, spec: &QueueSpec) -> OrchestratorResult<String>;
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> OrchestratorResult<()>;
    async fn publish(&self, envelope: &TaskEnvelope) -> OrchestratorResult<()>;
    async fn consume(&self, queue: &str, consumer_tag: &str) -> OrchestratorResult<DeliveryStream>;
    async fn cancel(&self, consumer_tag: &str) -> OrchestratorResult<()>;
    async fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> TaskEnvelope {
        TaskEnvelope::new(
            json!({"resource_id": 7, "action": "execute"}),
            MessageType::Task,
            "tasks",
            "task.network.execute",
            ExchangeKind::Topic,
        )
        .unwrap()
    }

    #[test]
    fn test_encode_embeds_reserved_metadata() {
        let bytes = envelope().encode().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["_metadata"]["_message_type"], json!("task"));
        assert_eq!(value["_metadata"]["_routing_key"], json!("task.network.execute"));
        assert_eq!(value["resource_id"], json!(7));
        assert!(value.get("retries").is_none());
    }

    #[test]
    fn test_decode_reads_retry_headers() {
        let original = envelope();
        let mut headers = MessageHeaders::new();
        headers.insert(HEADER_RETRIES.to_string(), 2);

        let decoded = TaskEnvelope::decode(
            &original.encode().unwrap(),
            &headers,
            "tasks",
            ExchangeKind::Topic,
            "ignored",
        )
        .unwrap();

        assert_eq!(decoded.body, original.body);
        assert_eq!(decoded.routing_key, "task.network.execute");
        assert_eq!(decoded.metadata.retries, 2);
        assert_eq!(decoded.metadata.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(decoded.metadata.delay_ms, 0);
    }

    #[test]
    fn test_decode_rejects_missing_metadata() {
        let err = TaskEnvelope::decode(
            br#"{"resource_id": 1}"#,
            &MessageHeaders::new(),
            "tasks",
            ExchangeKind::Topic,
            "task.x",
        )
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));
    }

    #[test]
    fn test_non_object_body_rejected() {
        let result = TaskEnvelope::new(json!([1, 2]), MessageType::Log, "x", "y", ExchangeKind::Fanout);
        assert!(result.is_err());
    }

    #[test]
    fn test_retry_increments_and_keeps_routing() {
        let first = envelope();
        let second = first.retry(5000);
        assert_eq!(second.metadata.retries, 1);
        assert_eq!(second.metadata.delay_ms, 5000);
        assert_eq!(second.routing_key, first.routing_key);
        assert_eq!(second.exchange, first.exchange);
    }

    #[test]
    fn test_exhaustion_counts_total_deliveries() {
        let mut meta = EnvelopeMetadata::default();
        assert!(!meta.is_exhausted());
        meta.retries = 1;
        assert!(!meta.is_exhausted());
        meta.retries = 2;
        assert!(meta.is_exhausted());
    }

    #[test]
    fn test_resource_task_routing_key() {
        let task = ResourceTask {
            task_id: Uuid::new_v4(),
            resource_id: 3,
            entity: "cluster".into(),
            action: Action::Destroy,
            actor_id: "bob".into(),
            dry_run: false,
        };
        assert_eq!(task.routing_key(), "task.cluster.destroy");
    }

    #[test]
    fn test_live_exchange_naming() {
        let spec = ExchangeSpec::live("logs", "network", 42);
        assert_eq!(spec.name, "logs.network.42");
        assert!(spec.auto_delete);
        assert_eq!(spec.kind, ExchangeKind::Fanout);
        assert!(!spec.delayed);
    }

    #[test]
    fn test_task_exchange_delays_delivery() {
        let spec = ExchangeSpec::tasks("tasks");
        assert_eq!(spec.kind, ExchangeKind::Topic);
        assert!(spec.delayed && spec.durable && !spec.auto_delete);
        assert_ne!(spec, ExchangeSpec::durable("tasks", ExchangeKind::Topic));
    }

    struct CountingAcker(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl Acknowledger for CountingAcker {
        async fn ack(&self) -> OrchestratorResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn nack(&self, _requeue: bool) -> OrchestratorResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_inbound_message_acks_once() {
        let acker = Arc::new(CountingAcker(Default::default()));
        let message = InboundMessage::new(
            envelope().encode().unwrap(),
            MessageHeaders::new(),
            "tasks",
            ExchangeKind::Topic,
            "task.network.execute",
            false,
            acker.clone(),
        );

        assert!(message.ack().await.unwrap());
        assert!(!message.ack().await.unwrap());
        assert!(!message.nack(false).await.unwrap());
        assert_eq!(acker.0.load(Ordering::SeqCst), 1);
    }
}
