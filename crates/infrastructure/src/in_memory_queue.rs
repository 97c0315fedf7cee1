use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use orchestrator_domain::{
    Acknowledger, DeliveryStream, ExchangeKind, ExchangeSpec, InboundMessage, MessageBroker,
    MessageHeaders, OrchestratorError, OrchestratorResult, QueueSpec, TaskEnvelope,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

/// 内存消息代理
///
/// 用 tokio channel 模拟 exchange/binding/queue 拓扑，支持 direct/topic/fanout 路由、
/// `x-delay` 延迟投递和 nack 重新入队。适用于单进程部署和测试。
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    connected: AtomicBool,
    honor_delay: bool,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueSlot>,
    bindings: Vec<Binding>,
    consumers: HashMap<String, watch::Sender<bool>>,
    published: Vec<TaskEnvelope>,
    acknowledgements: Vec<AckRecord>,
}

struct QueueSlot {
    sender: mpsc::UnboundedSender<RawMessage>,
    receiver: Option<mpsc::UnboundedReceiver<RawMessage>>,
}

#[derive(Debug, Clone)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Debug, Clone)]
struct RawMessage {
    body: Vec<u8>,
    headers: MessageHeaders,
    exchange: String,
    exchange_kind: ExchangeKind,
    routing_key: String,
    redelivered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    Nacked { requeue: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRecord {
    pub routing_key: String,
    pub outcome: AckOutcome,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        info!("创建内存消息代理");
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            connected: AtomicBool::new(true),
            honor_delay: true,
        }
    }

    /// 忽略 `x-delay`，立即投递
    pub fn without_delays() -> Self {
        Self {
            honor_delay: false,
            ..Self::new()
        }
    }

    /// 模拟 broker 断开，之后的声明与发布都会失败
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// 所有发布过的信封（包括没有匹配队列而被丢弃的）
    pub fn published(&self) -> Vec<TaskEnvelope> {
        self.lock().map(|s| s.published.clone()).unwrap_or_default()
    }

    pub fn acknowledgements(&self) -> Vec<AckRecord> {
        self.lock()
            .map(|s| s.acknowledgements.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> OrchestratorResult<std::sync::MutexGuard<'_, BrokerState>> {
        self.state
            .lock()
            .map_err(|_| OrchestratorError::message_queue("内存队列状态锁已损坏"))
    }

    fn ensure_connected(&self) -> OrchestratorResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(OrchestratorError::message_queue("消息代理未连接"))
        }
    }

    fn routes(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
        match kind {
            ExchangeKind::Fanout => true,
            ExchangeKind::Direct => binding_key == routing_key,
            ExchangeKind::Topic => {
                let pattern: Vec<&str> = binding_key.split('.').collect();
                let words: Vec<&str> = routing_key.split('.').collect();
                topic_matches(&pattern, &words)
            }
        }
    }

    fn deliver(state: &BrokerState, message: RawMessage) -> usize {
        let targets: Vec<&QueueSlot> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == message.exchange)
            .filter(|b| Self::routes(message.exchange_kind, &b.routing_key, &message.routing_key))
            .filter_map(|b| state.queues.get(&b.queue))
            .collect();

        let mut delivered = 0;
        for slot in targets {
            if slot.sender.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

/// AMQP topic 规则：`*` 匹配一个词，`#` 匹配零个或多个词
fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match (pattern.first(), words.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            topic_matches(&pattern[1..], words)
                || (!words.is_empty() && topic_matches(pattern, &words[1..]))
        }
        (Some(&"*"), Some(_)) => topic_matches(&pattern[1..], &words[1..]),
        (Some(p), Some(w)) if p == w => topic_matches(&pattern[1..], &words[1..]),
        _ => false,
    }
}

struct MemoryAcknowledger {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
    message: RawMessage,
}

impl MemoryAcknowledger {
    fn record(&self, outcome: AckOutcome) -> OrchestratorResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| OrchestratorError::message_queue("内存队列状态锁已损坏"))?;
        state.acknowledgements.push(AckRecord {
            routing_key: self.message.routing_key.clone(),
            outcome,
        });
        if outcome == (AckOutcome::Nacked { requeue: true }) {
            if let Some(slot) = state.queues.get(&self.queue) {
                let mut again = self.message.clone();
                again.redelivered = true;
                let _ = slot.sender.send(again);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcknowledger {
    async fn ack(&self) -> OrchestratorResult<()> {
        self.record(AckOutcome::Acked)
    }

    async fn nack(&self, requeue: bool) -> OrchestratorResult<()> {
        self.record(AckOutcome::Nacked { requeue })
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> OrchestratorResult<()> {
        self.ensure_connected()?;
        let mut state = self.lock()?;
        if let Some(existing) = state.exchanges.get(&spec.name) {
            if existing.kind != spec.kind || existing.delayed != spec.delayed {
                return Err(OrchestratorError::message_queue(format!(
                    "交换机 {} 已以不同类型声明",
                    spec.name
                )));
            }
            return Ok(());
        }
        state.exchanges.insert(spec.name.clone(), spec.clone());
        debug!("交换机 {} 声明成功 ({:?})", spec.name, spec.kind);
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> OrchestratorResult<String> {
        self.ensure_connected()?;
        let name = if spec.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            spec.name.clone()
        };

        let mut state = self.lock()?;
        state.queues.entry(name.clone()).or_insert_with(|| {
            let (sender, receiver) = mpsc::unbounded_channel();
            QueueSlot {
                sender,
                receiver: Some(receiver),
            }
        });
        debug!("队列 {} 声明成功", name);
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> OrchestratorResult<()> {
        self.ensure_connected()?;
        let mut state = self.lock()?;
        if !state.exchanges.contains_key(exchange) {
            return Err(OrchestratorError::message_queue(format!("交换机 {exchange} 不存在")));
        }
        if !state.queues.contains_key(queue) {
            return Err(OrchestratorError::message_queue(format!("队列 {queue} 不存在")));
        }
        state.bindings.push(Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn publish(&self, envelope: &TaskEnvelope) -> OrchestratorResult<()> {
        self.ensure_connected()?;
        let message = RawMessage {
            body: envelope.encode()?,
            headers: envelope.headers(),
            exchange: envelope.exchange.clone(),
            exchange_kind: envelope.exchange_kind,
            routing_key: envelope.routing_key.clone(),
            redelivered: false,
        };

        {
            let mut state = self.lock()?;
            let Some(exchange) = state.exchanges.get(&envelope.exchange) else {
                return Err(OrchestratorError::message_queue(format!(
                    "交换机 {} 不存在",
                    envelope.exchange
                )));
            };
            let delayed = exchange.delayed;
            let message = RawMessage {
                exchange_kind: exchange.kind,
                ..message.clone()
            };
            state.published.push(envelope.clone());

            // 与 RabbitMQ 一致：只有延迟交换机才理会 x-delay
            let delay_ms = envelope.metadata.delay_ms;
            if !self.honor_delay || !delayed || delay_ms <= 0 {
                let delivered = Self::deliver(&state, message);
                debug!(
                    "消息已发布到 {} ({})，投递到 {} 个队列",
                    envelope.exchange, envelope.routing_key, delivered
                );
                return Ok(());
            }
        }

        let state = self.state.clone();
        let delay = Duration::from_millis(envelope.metadata.delay_ms as u64);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Ok(state) = state.lock() {
                let kind = state
                    .exchanges
                    .get(&message.exchange)
                    .map(|e| e.kind)
                    .unwrap_or(message.exchange_kind);
                InMemoryBroker::deliver(
                    &state,
                    RawMessage {
                        exchange_kind: kind,
                        ..message
                    },
                );
            }
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> OrchestratorResult<DeliveryStream> {
        self.ensure_connected()?;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let receiver = {
            let mut state = self.lock()?;
            let receiver = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| OrchestratorError::message_queue(format!("队列 {queue} 不存在")))?
                .receiver
                .take()
                .ok_or_else(|| OrchestratorError::message_queue(format!("队列 {queue} 已有消费者")))?;
            state.consumers.insert(consumer_tag.to_string(), cancel_tx);
            receiver
        };
        debug!("消费者 {} 已挂载到队列 {}", consumer_tag, queue);

        let shared = self.state.clone();
        let queue = queue.to_string();
        let stream = futures::stream::unfold(
            (receiver, cancel_rx),
            move |(mut receiver, mut cancel_rx)| {
                let shared = shared.clone();
                let queue = queue.clone();
                async move {
                    if *cancel_rx.borrow() {
                        return None;
                    }
                    let raw = tokio::select! {
                        raw = receiver.recv() => raw?,
                        _ = cancel_rx.changed() => return None,
                    };
                    let acker = Arc::new(MemoryAcknowledger {
                        state: shared,
                        queue,
                        message: raw.clone(),
                    });
                    let message = InboundMessage::new(
                        raw.body,
                        raw.headers,
                        raw.exchange,
                        raw.exchange_kind,
                        raw.routing_key,
                        raw.redelivered,
                        acker,
                    );
                    Some((Ok::<_, OrchestratorError>(message), (receiver, cancel_rx)))
                }
            },
        );

        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> OrchestratorResult<()> {
        let mut state = self.lock()?;
        match state.consumers.remove(consumer_tag) {
            Some(cancel) => {
                let _ = cancel.send(true);
                debug!("消费者 {} 已取消", consumer_tag);
                Ok(())
            }
            None => Err(OrchestratorError::message_queue(format!(
                "消费者 {consumer_tag} 不存在"
            ))),
        }
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
