use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::*,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use orchestrator_config::MessageQueueConfig;
use orchestrator_domain::{
    Acknowledger, DeliveryStream, ExchangeKind, ExchangeSpec, InboundMessage, MessageBroker,
    MessageHeaders, OrchestratorError, OrchestratorResult, QueueSpec, TaskEnvelope,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const DELAYED_EXCHANGE_TYPE: &str = "x-delayed-message";
const DELAYED_TYPE_ARGUMENT: &str = "x-delayed-type";

/// RabbitMQ 消息代理实现
pub struct RabbitMQBroker {
    connection: Connection,
    channel: Arc<Mutex<Channel>>,
    /// 已声明交换机的类型，用于还原入站消息的拓扑信息
    exchange_kinds: Arc<RwLock<HashMap<String, ExchangeKind>>>,
    config: MessageQueueConfig,
}

impl RabbitMQBroker {
    pub async fn new(config: MessageQueueConfig) -> OrchestratorResult<Self> {
        let connect = Connection::connect(&config.url, ConnectionProperties::default());
        let connection = tokio::time::timeout(
            std::time::Duration::from_secs(config.connection_timeout_seconds),
            connect,
        )
        .await
        .map_err(|_| OrchestratorError::message_queue(format!("连接RabbitMQ超时: {}", config.url)))?
        .map_err(|e| OrchestratorError::message_queue(format!("连接RabbitMQ失败: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| OrchestratorError::message_queue(format!("创建通道失败: {e}")))?;

        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| OrchestratorError::message_queue(format!("设置prefetch失败: {e}")))?;

        info!("成功连接到RabbitMQ: {}", config.url);

        Ok(Self {
            connection,
            channel: Arc::new(Mutex::new(channel)),
            exchange_kinds: Arc::new(RwLock::new(HashMap::new())),
            config,
        })
    }

    pub fn config(&self) -> &MessageQueueConfig {
        &self.config
    }

    pub async fn close(&self) -> OrchestratorResult<()> {
        self.connection
            .close(200, "正常关闭")
            .await
            .map_err(|e| OrchestratorError::message_queue(format!("关闭连接失败: {e}")))?;
        info!("RabbitMQ连接已关闭");
        Ok(())
    }

    fn lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        }
    }

    fn kind_name(kind: ExchangeKind) -> &'static str {
        match kind {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        }
    }

    /// 延迟交换机使用 x-delayed-message 类型，实际路由方式放在 x-delayed-type 参数里
    fn exchange_declaration(spec: &ExchangeSpec) -> (lapin::ExchangeKind, FieldTable) {
        let mut arguments = FieldTable::default();
        if !spec.delayed {
            return (Self::lapin_kind(spec.kind), arguments);
        }
        arguments.insert(
            DELAYED_TYPE_ARGUMENT.into(),
            AMQPValue::LongString(Self::kind_name(spec.kind).into()),
        );
        (lapin::ExchangeKind::Custom(DELAYED_EXCHANGE_TYPE.to_string()), arguments)
    }

    fn to_field_table(headers: &MessageHeaders) -> FieldTable {
        let mut table = FieldTable::default();
        for (key, value) in headers {
            table.insert(key.as_str().into(), AMQPValue::LongLongInt(*value));
        }
        table
    }

    /// 只保留整数类型的头部，其余忽略
    fn from_field_table(table: Option<&FieldTable>) -> MessageHeaders {
        let mut headers = MessageHeaders::new();
        let Some(table) = table else {
            return headers;
        };
        for (key, value) in table.inner() {
            let number = match value {
                AMQPValue::LongLongInt(v) => Some(*v),
                AMQPValue::LongInt(v) => Some(i64::from(*v)),
                AMQPValue::LongUInt(v) => Some(i64::from(*v)),
                AMQPValue::ShortInt(v) => Some(i64::from(*v)),
                AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
                AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
                AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
                _ => None,
            };
            if let Some(number) = number {
                headers.insert(key.as_str().to_string(), number);
            }
        }
        headers
    }
}

struct LapinAcknowledger(Acker);

#[async_trait]
impl Acknowledger for LapinAcknowledger {
    async fn ack(&self) -> OrchestratorResult<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| OrchestratorError::message_queue(format!("确认消息失败: {e}")))
    }

    async fn nack(&self, requeue: bool) -> OrchestratorResult<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| OrchestratorError::message_queue(format!("拒绝消息失败: {e}")))
    }
}

#[async_trait]
impl MessageBroker for RabbitMQBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> OrchestratorResult<()> {
        let (kind, arguments) = Self::exchange_declaration(spec);
        let channel = self.channel.lock().await;
        channel
            .exchange_declare(
                &spec.name,
                kind,
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| {
                OrchestratorError::message_queue(format!("声明交换机 {} 失败: {e}", spec.name))
            })?;

        self.exchange_kinds
            .write()
            .await
            .insert(spec.name.clone(), spec.kind);
        debug!("交换机 {} 声明成功 ({:?}, delayed={})", spec.name, spec.kind, spec.delayed);
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> OrchestratorResult<String> {
        let channel = self.channel.lock().await;
        let queue = channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| OrchestratorError::message_queue(format!("声明队列 {} 失败: {e}", spec.name)))?;

        let name = queue.name().as_str().to_string();
        debug!("队列 {} 声明成功", name);
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> OrchestratorResult<()> {
        let channel = self.channel.lock().await;
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                OrchestratorError::message_queue(format!("绑定队列 {queue} 到 {exchange} 失败: {e}"))
            })?;
        debug!("队列 {} 已绑定到 {} ({})", queue, exchange, routing_key);
        Ok(())
    }

    async fn publish(&self, envelope: &TaskEnvelope) -> OrchestratorResult<()> {
        let payload = envelope.encode()?;
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_headers(Self::to_field_table(&envelope.headers()));

        let channel = self.channel.lock().await;
        let confirm = channel
            .basic_publish(
                &envelope.exchange,
                &envelope.routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| {
                OrchestratorError::message_queue(format!(
                    "发布消息到 {}/{} 失败: {e}",
                    envelope.exchange, envelope.routing_key
                ))
            })?;

        confirm
            .await
            .map_err(|e| OrchestratorError::message_queue(format!("消息发布确认失败: {e}")))?;

        debug!(
            "消息已发布到 {} ({}), retries={}",
            envelope.exchange, envelope.routing_key, envelope.metadata.retries
        );
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> OrchestratorResult<DeliveryStream> {
        let consumer = {
            let channel = self.channel.lock().await;
            channel
                .basic_consume(
                    queue,
                    consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| OrchestratorError::message_queue(format!("创建消费者失败: {e}")))?
        };
        debug!("为队列 {} 创建消费者: {}", queue, consumer_tag);

        let kinds = self.exchange_kinds.read().await.clone();
        let stream = consumer.map(move |delivery| {
            let delivery = delivery
                .map_err(|e| OrchestratorError::message_queue(format!("接收消息失败: {e}")))?;
            let exchange = delivery.exchange.as_str().to_string();
            let kind = kinds.get(&exchange).copied().unwrap_or(ExchangeKind::Topic);
            let headers = Self::from_field_table(delivery.properties.headers().as_ref());
            Ok(InboundMessage::new(
                delivery.data,
                headers,
                exchange,
                kind,
                delivery.routing_key.as_str(),
                delivery.redelivered,
                Arc::new(LapinAcknowledger(delivery.acker)),
            ))
        });

        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> OrchestratorResult<()> {
        let channel = self.channel.lock().await;
        if let Err(e) = channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
        {
            warn!("取消消费者 {} 失败: {}", consumer_tag, e);
            return Err(OrchestratorError::message_queue(format!("取消消费者失败: {e}")));
        }
        info!("消费者 {} 已取消", consumer_tag);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}
