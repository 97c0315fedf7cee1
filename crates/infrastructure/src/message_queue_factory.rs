use std::sync::Arc;

use orchestrator_config::{MessageQueueConfig, MessageQueueType};
use orchestrator_domain::{
    ExchangeKind, ExchangeSpec, MessageBroker, OrchestratorResult,
};
use tracing::{debug, info};

use crate::{InMemoryBroker, RabbitMQBroker};

pub struct MessageQueueFactory;

impl MessageQueueFactory {
    pub async fn create(config: &MessageQueueConfig) -> OrchestratorResult<Arc<dyn MessageBroker>> {
        debug!("创建消息代理，类型: {:?}", config.r#type);

        let broker: Arc<dyn MessageBroker> = match config.r#type {
            MessageQueueType::Rabbitmq => {
                info!("初始化RabbitMQ消息代理");
                Arc::new(RabbitMQBroker::new(config.clone()).await?)
            }
            MessageQueueType::InMemory => {
                info!("初始化内存消息代理");
                Arc::new(InMemoryBroker::new())
            }
        };

        Self::declare_topology(broker.as_ref(), config).await?;
        Ok(broker)
    }

    /// 声明持久交换机：任务 topic（延迟投递）、系统 fanout、通知 topic
    pub async fn declare_topology(broker: &dyn MessageBroker, config: &MessageQueueConfig) -> OrchestratorResult<()> {
        for spec in Self::durable_exchanges(config) {
            broker.declare_exchange(&spec).await?;
        }
        info!(
            "消息拓扑声明完成: {}, {}, {}",
            config.task_exchange, config.system_exchange, config.notification_exchange
        );
        Ok(())
    }

    pub fn durable_exchanges(config: &MessageQueueConfig) -> Vec<ExchangeSpec> {
        vec![
            ExchangeSpec::tasks(&config.task_exchange),
            ExchangeSpec::durable(&config.system_exchange, ExchangeKind::Fanout),
            ExchangeSpec::durable(&config.notification_exchange, ExchangeKind::Topic),
        ]
    }
}
