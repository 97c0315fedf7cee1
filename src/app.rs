use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use orchestrator_config::AppConfig;
use orchestrator_dispatcher::{ActionDispatcher, DispatcherPorts, DispatcherSettings};
use orchestrator_domain::{ApprovalFlowSwitch, EventPublisher, MessageBroker, WorkerRegistration};
use orchestrator_infrastructure::{
    BrokerEventPublisher, BrokerNotifier, CompositeEventPublisher, LocalPublisher, MemoryStores,
    MessageQueueFactory, StaticPolicyGate, SubscriberRegistry,
};
use orchestrator_worker::{
    ConsumerBinding, ExceptionClassifier, HandlerTable, HealthCheckManager,
    ProvisioningTaskHandler, ReconciliationHandler, RetryPolicy, SchedulerJob, ShellPipeline,
    SystemEventHandler, TaskConsumer, WorkerPorts, WorkerService,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// HTTP 接口、系统广播消费与对账调度
    Api,
    /// 任务消费与健康检查
    Worker,
    All,
}

impl AppMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "api" => Ok(Self::Api),
            "worker" => Ok(Self::Worker),
            "all" => Ok(Self::All),
            other => Err(anyhow::anyhow!("未知的运行模式: {}", other)),
        }
    }

    /// 资源、账本与暂存修改都在进程内存中，api 与 worker 分开部署时彼此不可见
    fn check_store_support(self) -> Result<()> {
        match self {
            Self::All => Ok(()),
            other => Err(anyhow::anyhow!(
                "运行模式 {:?} 需要共享存储，当前仅支持进程内存储，请使用 all 模式",
                other
            )),
        }
    }

    fn runs_api(self) -> bool {
        matches!(self, Self::Api | Self::All)
    }

    fn runs_worker(self) -> bool {
        matches!(self, Self::Worker | Self::All)
    }
}

/// 按运行模式组装并运行各组件
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    stores: MemoryStores,
    broker: Arc<dyn MessageBroker>,
    approval: ApprovalFlowSwitch,
    subscribers: SubscriberRegistry,
    dispatcher: Arc<ActionDispatcher>,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        mode.check_store_support()?;
        info!(
            "初始化应用，模式: {:?}，消息队列: {}",
            mode,
            mask_amqp_url(&config.message_queue.url)
        );

        let broker = MessageQueueFactory::create(&config.message_queue)
            .await
            .context("创建消息队列失败")?;
        let stores = MemoryStores::new();
        let approval = ApprovalFlowSwitch::new(config.dispatcher.approval_flow_enabled);
        let subscribers = SubscriberRegistry::new(256);

        let events = Self::event_publisher(&config, &broker, &subscribers);
        let ports = DispatcherPorts {
            resources: stores.resources.clone(),
            pending_edits: stores.pending_edits.clone(),
            policy: Arc::new(StaticPolicyGate::from_config(&config.policy)),
            audit: stores.audit.clone(),
            revisions: stores.revisions.clone(),
            ledger: stores.ledger.clone(),
            execution_log: stores.execution_log.clone(),
            broker: broker.clone(),
            events,
        };
        let settings = DispatcherSettings {
            task_exchange: config.message_queue.task_exchange.clone(),
            max_retries: i64::from(config.message_queue.max_retries),
            reset_cooldown: chrono::Duration::seconds(
                config.dispatcher.reset_cooldown_seconds as i64,
            ),
        };
        let dispatcher = Arc::new(ActionDispatcher::new(ports, approval.clone(), settings));

        Ok(Self {
            config,
            mode,
            stores,
            broker,
            approval,
            subscribers,
            dispatcher,
        })
    }

    pub fn dispatcher(&self) -> Arc<ActionDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    #[cfg(test)]
    pub fn stores(&self) -> &MemoryStores {
        &self.stores
    }

    fn event_publisher(
        config: &AppConfig,
        broker: &Arc<dyn MessageBroker>,
        subscribers: &SubscriberRegistry,
    ) -> Arc<dyn EventPublisher> {
        let publishers: Vec<Arc<dyn EventPublisher>> = vec![
            Arc::new(BrokerEventPublisher::new(
                broker.clone(),
                &config.message_queue.live_exchange_prefix,
            )),
            Arc::new(LocalPublisher::new(subscribers.clone())),
        ];
        Arc::new(CompositeEventPublisher::new(publishers))
    }

    fn worker_ports(&self) -> WorkerPorts {
        WorkerPorts {
            resources: self.stores.resources.clone(),
            ledger: self.stores.ledger.clone(),
            execution_log: self.stores.execution_log.clone(),
            audit: self.stores.audit.clone(),
            notifier: Arc::new(BrokerNotifier::new(
                self.broker.clone(),
                &self.config.message_queue.notification_exchange,
            )),
            events: Self::event_publisher(&self.config, &self.broker, &self.subscribers),
        }
    }

    /// 系统广播只需一个消费者：它更新的审批开关由本进程内所有派发方共享
    fn worker_service(&self) -> WorkerService {
        let mq = &self.config.message_queue;
        let worker = &self.config.worker;
        let mut service = WorkerService::new().with_consumer(TaskConsumer::new(
            format!("{}-system", worker.worker_name),
            self.broker.clone(),
            ConsumerBinding::system(mq),
            HandlerTable::new().with(Arc::new(SystemEventHandler::new(self.approval.clone()))),
        ));

        if !self.mode.runs_worker() {
            return service;
        }

        let ports = self.worker_ports();
        let pipeline = Arc::new(ShellPipeline::new(
            worker.pipeline.clone(),
            self.stores.resources.clone(),
        ));
        let classifier =
            ExceptionClassifier::new(ports.clone(), self.broker.clone(), RetryPolicy::from_config(mq));
        let handlers = HandlerTable::new()
            .with(Arc::new(ProvisioningTaskHandler::new(
                ports.clone(),
                pipeline,
                classifier,
            )))
            .with(Arc::new(ReconciliationHandler::new(
                ports,
                self.broker.clone(),
                &mq.task_exchange,
                i64::from(mq.max_retries),
                chrono::Duration::seconds(self.config.dispatcher.reconcile_after_seconds as i64),
            )));

        let mut tasks = TaskConsumer::new(
            format!("{}-tasks", worker.worker_name),
            self.broker.clone(),
            ConsumerBinding::tasks(mq),
            handlers,
        );
        if worker.track_busy {
            tasks = tasks.with_busy_tracking(self.stores.workers.clone(), &worker.worker_name);
        }

        service = service.with_consumer(tasks).with_health_check(HealthCheckManager::new(
            self.stores.workers.clone(),
            WorkerRegistration::new(&worker.worker_name, &worker.hostname),
            Duration::from_secs(worker.health_check_interval_seconds),
        ));
        service
    }

    /// 运行到收到关闭信号或任一组件失败；失败时广播关闭并返回第一个错误
    pub async fn run(&self, shutdown: broadcast::Sender<()>) -> Result<()> {
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        let service = self.worker_service();
        let worker_shutdown = shutdown.clone();
        tasks.spawn(async move {
            service
                .run(worker_shutdown)
                .await
                .context("worker 服务异常退出")
        });

        if self.mode.runs_api() {
            let listener = TcpListener::bind(&self.config.api.bind_address)
                .await
                .with_context(|| format!("无法绑定API地址: {}", self.config.api.bind_address))?;
            info!(
                "API服务器启动在: {}",
                listener.local_addr().context("无法获取API监听地址")?
            );

            let app = orchestrator_api::create_app(self.dispatcher());
            let mut rx = shutdown.subscribe();
            tasks.spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = rx.recv().await;
                    })
                    .await
                    .context("API服务器异常退出")
            });

            let broker = self.broker.clone();
            let exchange = self.config.message_queue.task_exchange.clone();
            let interval = Duration::from_secs(self.config.dispatcher.reconcile_after_seconds);
            let rx = shutdown.subscribe();
            tasks.spawn(async move {
                run_reconcile_schedule(broker, exchange, interval, rx).await;
                Ok(())
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.context("组件任务异常终止").and_then(|r| r);
            if let Err(e) = result {
                error!("组件运行失败: {:#}", e);
                let _ = shutdown.send(());
                first_error.get_or_insert(e);
            }
        }

        info!("应用已停止");
        first_error.map_or(Ok(()), Err)
    }
}

/// 周期性发布对账任务，由 worker 侧的对账处理器执行
async fn run_reconcile_schedule(
    broker: Arc<dyn MessageBroker>,
    exchange: String,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);
    // 第一次 tick 立即触发，启动时不需要对账
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let job = SchedulerJob::ReconcileQueued { older_than_seconds: None };
                match job.envelope(&exchange) {
                    Ok(envelope) => {
                        if let Err(e) = broker.publish(&envelope).await {
                            warn!(error = %e, "发布对账任务失败");
                        }
                    }
                    Err(e) => warn!(error = %e, "构建对账任务失败"),
                }
            }
            _ = shutdown.recv() => {
                info!("对账调度已停止");
                break;
            }
        }
    }
}

/// 日志中隐藏 AMQP URL 的密码
fn mask_amqp_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.rsplit_once('@') {
        Some((credentials, host)) => {
            let user = credentials.split(':').next().unwrap_or_default();
            format!("{scheme}://{user}:***@{host}")
        }
        None => url.to_string(),
    }
}
