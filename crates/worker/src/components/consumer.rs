use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt;
use metrics::counter;
use orchestrator_config::MessageQueueConfig;
use orchestrator_domain::{
    DeliveryStream, ExchangeKind, ExchangeSpec, InboundMessage, MessageBroker, OrchestratorError,
    OrchestratorResult, QueueSpec, TaskEnvelope, WorkerRegistry,
};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::handlers::{HandlerTable, TaskFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Consuming,
    Cancelled,
    Failed,
}

/// 消费者声明的交换机、队列与绑定键
#[derive(Debug, Clone)]
pub struct ConsumerBinding {
    pub exchange: ExchangeSpec,
    pub queue: QueueSpec,
    pub routing_key: String,
}

impl ConsumerBinding {
    pub fn new(exchange: ExchangeSpec, queue: QueueSpec, routing_key: impl Into<String>) -> Self {
        Self {
            exchange,
            queue,
            routing_key: routing_key.into(),
        }
    }

    /// 共享任务队列，多个 worker 实例竞争消费
    pub fn tasks(config: &MessageQueueConfig) -> Self {
        Self::new(
            ExchangeSpec::tasks(&config.task_exchange),
            QueueSpec::shared(&config.task_queue),
            &config.task_binding_key,
        )
    }

    /// 每个进程独占一个匿名队列，接收全部系统广播
    pub fn system(config: &MessageQueueConfig) -> Self {
        Self::new(
            ExchangeSpec::durable(&config.system_exchange, ExchangeKind::Fanout),
            QueueSpec::exclusive(),
            "",
        )
    }
}

struct BusyFlag {
    registry: Arc<dyn WorkerRegistry>,
    worker_name: String,
}

impl BusyFlag {
    async fn set(&self, busy: bool) {
        if let Err(e) = self.registry.set_busy(&self.worker_name, busy, Utc::now()).await {
            warn!(worker = %self.worker_name, busy, error = %e, "更新忙碌标记失败");
        }
    }
}

/// 逐条处理消息；同一时刻只处理一条
struct MessageProcessor {
    tag: String,
    handlers: HandlerTable,
    busy: Option<BusyFlag>,
}

impl MessageProcessor {
    async fn process(&self, message: InboundMessage) {
        if message.is_processed() {
            debug!(consumer = %self.tag, "消息已确认过，跳过");
            return;
        }

        if let Some(busy) = &self.busy {
            busy.set(true).await;
        }
        let started = Instant::now();

        let result = match message.decode() {
            Ok(envelope) => self.dispatch(&envelope).await,
            Err(e) => Err(TaskFailure::Rejected(e)),
        };
        let outcome = self.settle(&message, result).await;

        if let Some(busy) = &self.busy {
            busy.set(false).await;
        }
        counter!(
            "orchestrator_messages_consumed_total",
            "consumer" => self.tag.clone(),
            "outcome" => outcome
        )
        .increment(1);
        debug!(
            consumer = %self.tag,
            routing_key = %message.routing_key,
            outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "消息处理完成"
        );
    }

    async fn dispatch(&self, envelope: &TaskEnvelope) -> Result<(), TaskFailure> {
        let Some(handler) = self.handlers.get(envelope.message_type) else {
            return Err(TaskFailure::Rejected(OrchestratorError::invalid_input(format!(
                "没有 {} 类型消息的处理器",
                envelope.message_type
            ))));
        };
        handler.handle(envelope).await
    }

    /// 处理器返回后才确认；终止失败不重新入队
    async fn settle(&self, message: &InboundMessage, result: Result<(), TaskFailure>) -> &'static str {
        let (settled, outcome) = match result {
            Ok(()) => (message.ack().await, "ok"),
            Err(failure) => {
                let outcome = failure.outcome_label();
                match failure {
                    TaskFailure::Retried { .. } => (message.ack().await, outcome),
                    TaskFailure::Fatal { message: reason, .. } => {
                        warn!(consumer = %self.tag, reason = %reason, "任务最终失败");
                        (message.nack(false).await, outcome)
                    }
                    TaskFailure::Rejected(e) => {
                        let requeue = e.is_retryable() && !message.redelivered;
                        error!(
                            consumer = %self.tag,
                            routing_key = %message.routing_key,
                            requeue,
                            error = %e,
                            "消息被拒绝"
                        );
                        (message.nack(requeue).await, outcome)
                    }
                }
            }
        };

        match settled {
            Ok(true) => {}
            Ok(false) => debug!(consumer = %self.tag, "消息已确认过，忽略重复确认"),
            Err(e) => error!(consumer = %self.tag, error = %e, "确认消息失败"),
        }
        outcome
    }
}

/// 任务消费者
///
/// 启动时声明一个交换机和一个队列并绑定，随后顺序消费。
/// 消息交给单 worker 通道处理，上一条处理完之前不会取下一条。
pub struct TaskConsumer {
    tag: String,
    broker: Arc<dyn MessageBroker>,
    binding: ConsumerBinding,
    processor: Arc<MessageProcessor>,
    state: Arc<RwLock<ConsumerState>>,
}

impl TaskConsumer {
    pub fn new(
        tag: impl Into<String>,
        broker: Arc<dyn MessageBroker>,
        binding: ConsumerBinding,
        handlers: HandlerTable,
    ) -> Self {
        let tag = tag.into();
        Self {
            processor: Arc::new(MessageProcessor {
                tag: tag.clone(),
                handlers,
                busy: None,
            }),
            tag,
            broker,
            binding,
            state: Arc::new(RwLock::new(ConsumerState::Disconnected)),
        }
    }

    /// 处理每条消息前后切换 worker 的 busy 标记
    pub fn with_busy_tracking(
        mut self,
        registry: Arc<dyn WorkerRegistry>,
        worker_name: impl Into<String>,
    ) -> Self {
        self.processor = Arc::new(MessageProcessor {
            tag: self.tag.clone(),
            handlers: self.processor.handlers.clone(),
            busy: Some(BusyFlag {
                registry,
                worker_name: worker_name.into(),
            }),
        });
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub async fn state(&self) -> ConsumerState {
        *self.state.read().await
    }

    async fn set_state(&self, state: ConsumerState) {
        *self.state.write().await = state;
        debug!(consumer = %self.tag, ?state, "消费者状态变化");
    }

    async fn connect(&self) -> OrchestratorResult<DeliveryStream> {
        self.broker.declare_exchange(&self.binding.exchange).await?;
        let queue = self.broker.declare_queue(&self.binding.queue).await?;
        self.broker
            .bind_queue(&queue, &self.binding.exchange.name, &self.binding.routing_key)
            .await?;
        info!(
            consumer = %self.tag,
            exchange = %self.binding.exchange.name,
            queue = %queue,
            routing_key = %self.binding.routing_key,
            "消费者绑定完成"
        );
        self.broker.consume(&queue, &self.tag).await
    }

    /// 消费直到收到关闭信号（返回 Ok）或连接失败（返回 Err）
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> OrchestratorResult<()> {
        self.set_state(ConsumerState::Connecting).await;
        let mut stream = match self.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                error!(consumer = %self.tag, error = %e, "启动消费者失败");
                self.set_state(ConsumerState::Failed).await;
                return Err(e);
            }
        };
        self.set_state(ConsumerState::Consuming).await;

        let (sender, mut receiver) = mpsc::channel::<InboundMessage>(1);
        let processor = Arc::clone(&self.processor);
        let worker = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                processor.process(message).await;
            }
        });

        let result = loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(consumer = %self.tag, "收到关闭信号，取消消费者");
                    if let Err(e) = self.broker.cancel(&self.tag).await {
                        warn!(consumer = %self.tag, error = %e, "取消消费者失败");
                    }
                    break Ok(());
                }
                next = stream.next() => match next {
                    Some(Ok(message)) => {
                        if sender.send(message).await.is_err() {
                            break Err(OrchestratorError::Internal("消息处理任务已退出".to_string()));
                        }
                    }
                    Some(Err(e)) => {
                        error!(consumer = %self.tag, error = %e, "消息流错误");
                        break Err(e);
                    }
                    None => {
                        break Err(OrchestratorError::message_queue(format!(
                            "消费者 {} 的投递流已关闭",
                            self.tag
                        )));
                    }
                },
            }
        };

        // 等待正在处理的消息结束
        drop(sender);
        if let Err(e) = worker.await {
            error!(consumer = %self.tag, error = %e, "消息处理任务异常终止");
        }

        match result {
            Ok(()) => {
                self.set_state(ConsumerState::Cancelled).await;
                info!(consumer = %self.tag, "消费者已停止");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConsumerState::Failed).await;
                Err(e)
            }
        }
    }
}
