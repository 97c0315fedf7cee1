use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use orchestrator_config::{AppConfig, LogFormat};
use tracing::{error, info, warn};

mod app;
mod shutdown;

use app::{AppMode, Application};
use shutdown::{wait_for_signal, ShutdownManager};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("orchestrator")
        .version("1.0.0")
        .about("基础设施资源生命周期编排")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时按默认路径查找"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式；api 与 worker 分开部署需要共享存储，目前只支持 all")
                .value_parser(["api", "worker", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("worker-name")
                .long("worker-name")
                .value_name("NAME")
                .help("Worker 名称，覆盖配置文件"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mode_str = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("all");

    let mut config = AppConfig::load(config_path).context("加载配置失败")?;
    if let Some(name) = matches.get_one::<String>("worker-name") {
        config.worker.worker_name = name.clone();
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = match format.as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
    }

    orchestrator_infrastructure::init_observability(&config.observability)?;

    info!("启动资源编排服务");
    info!("配置文件: {}", config_path.unwrap_or("<默认路径>"));
    info!("运行模式: {mode_str}");

    let app_mode = AppMode::parse(mode_str)?;
    let app = Arc::new(Application::new(config, app_mode).await?);
    let shutdown_manager = ShutdownManager::new();

    let mut app_handle = {
        let app = Arc::clone(&app);
        let sender = shutdown_manager.sender();
        tokio::spawn(async move { app.run(sender).await })
    };

    // 组件失败时应用会自行结束，不再等待信号
    let finished = tokio::select! {
        _ = wait_for_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
            shutdown_manager.shutdown();
            None
        }
        result = &mut app_handle => Some(result),
    };

    let result = match finished {
        Some(result) => result,
        None => match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
            Ok(result) => result,
            Err(_) => {
                warn!("应用关闭超时，强制退出");
                return Err(anyhow::anyhow!("应用关闭超时"));
            }
        },
    };

    match result.context("应用任务异常终止")? {
        Ok(()) => {
            info!("资源编排服务已退出");
            Ok(())
        }
        Err(e) => {
            error!("应用运行失败: {:#}", e);
            Err(e)
        }
    }
}
