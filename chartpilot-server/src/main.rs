//! Chartpilot 服务主程序

mod context;

use anyhow::{Context, Result};
use chartpilot_admin::config::write_config_file;
use chartpilot_admin::{AppConfig, ConfigManager, LogFormat};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::context::AppContext;

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "chartpilot-server")]
#[command(about = "临床文书自动化服务：定时签名、自动填写与系统监控")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "chartpilot.toml")]
    config: String,

    /// 日志级别，覆盖配置文件
    #[arg(short, long)]
    log_level: Option<String>,

    /// 强制离线模拟模式
    #[arg(long)]
    offline: bool,

    /// 将默认配置写入配置文件路径后退出
    #[arg(long)]
    write_default_config: bool,
}

fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.write_default_config {
        init_logging(args.log_level.as_deref().unwrap_or("info"), LogFormat::Pretty);
        write_config_file(&AppConfig::default(), &args.config).await?;
        return Ok(());
    }

    let manager = ConfigManager::new(&args.config)?;
    let mut config = manager.get_config().await;
    if args.offline {
        config.portal.force_offline = true;
    }

    let level = args.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, config.logging.format);

    info!("Starting chartpilot server...");
    info!("  Portal: {}", config.portal.base_url);
    info!("  Store: {:?}", config.database.backend);
    info!(
        "  Scheduler every {}s, monitor every {}s",
        config.scheduler.poll_interval_secs, config.monitor.interval_secs
    );

    let context = AppContext::build(config).await.context("Failed to build application context")?;
    info!("Loaded {} alert rules", context.alerts.rules().await.len());

    let outcome = context.service.connect_browser().await;
    if !outcome.success {
        warn!(
            "Browser not connected at startup: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }

    let shutdown = CancellationToken::new();
    let scheduler = tokio::spawn(context.scheduler.clone().run(
        context.config.scheduler.poll_interval(),
        context.config.scheduler.error_backoff(),
        shutdown.clone(),
    ));
    let monitor = tokio::spawn(
        context
            .monitor
            .clone()
            .run(context.config.monitor.interval(), shutdown.clone()),
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested, stopping workers");
    shutdown.cancel();

    for (name, handle) in [("scheduler", scheduler), ("monitor", monitor)] {
        match handle.await {
            Ok(rounds) => info!("{} stopped after {} rounds", name, rounds),
            Err(e) => error!("{} task ended abnormally: {}", name, e),
        }
    }

    context.shutdown().await;
    info!("Chartpilot server stopped");
    Ok(())
}
