//! 应用上下文
//!
//! 启动时构建一次，后台任务与服务共享其中的组件。

use std::sync::Arc;

use anyhow::{Context, Result};
use chartpilot_admin::{AlertSystem, AppConfig, DatabaseBackend, MonitorSettings, SysinfoProbe, SystemMonitor};
use chartpilot_core::{PlaintextVault, SecretsVault};
use chartpilot_database::{DatabasePool, MemoryTaskStore, PgTaskStore, TaskStore};
use chartpilot_integration::{LiveHub, NotificationManager, NtfyGateway, PushGateway};
use chartpilot_portal::{PortalHandle, PortalSession, WebDriverClient};
use chartpilot_workflow::{AutomationService, TaskScheduler};
use tracing::{info, warn};

/// 共享组件集合
pub struct AppContext {
    pub config: AppConfig,
    pub alerts: Arc<AlertSystem>,
    pub scheduler: Arc<TaskScheduler>,
    pub monitor: Arc<SystemMonitor>,
    pub service: Arc<AutomationService>,
    db_pool: Option<DatabasePool>,
}

impl AppContext {
    pub async fn build(config: AppConfig) -> Result<Self> {
        let (store, db_pool) = open_store(&config).await?;

        let driver = WebDriverClient::from_config(&config.portal).context("Failed to create WebDriver client")?;
        let portal = PortalHandle::new(PortalSession::new(Box::new(driver), config.portal.clone()));

        let live = Arc::new(LiveHub::new(config.notifications.live_capacity));
        let push: Option<Arc<dyn PushGateway>> = if config.notifications.push_enabled() {
            let gateway = NtfyGateway::new(
                config.notifications.push_base_url.clone(),
                config.notifications.push_timeout(),
            )
            .context("Failed to create push gateway")?;
            Some(Arc::new(gateway))
        } else {
            info!("External push disabled");
            None
        };
        let notifications = Arc::new(NotificationManager::new(live, push, config.notifications.max_history));

        let alerts = build_alerts(&config, notifications.clone()).await?;

        let registered = register_push_topics(store.as_ref(), &notifications).await?;
        info!("Registered {} push topics", registered);

        let vault: Arc<dyn SecretsVault> = Arc::new(PlaintextVault);
        warn!("Using the plaintext development vault; credentials are only base64-encoded");

        let scheduler = Arc::new(TaskScheduler::new(
            store.clone(),
            portal.clone(),
            notifications.clone(),
            Some(alerts.clone()),
        ));
        let monitor = Arc::new(SystemMonitor::new(
            portal.clone(),
            notifications.clone(),
            alerts.clone(),
            Arc::new(SysinfoProbe::new()),
            MonitorSettings::from(&config.monitor),
        ));
        let service = Arc::new(AutomationService::new(store, vault, portal, notifications));

        Ok(Self {
            config,
            alerts,
            scheduler,
            monitor,
            service,
            db_pool,
        })
    }

    /// 关闭浏览器会话和数据库连接
    pub async fn shutdown(&self) {
        self.service.disconnect_browser().await;
        if let Some(pool) = &self.db_pool {
            pool.close().await;
        }
        info!("Application context shut down");
    }
}

async fn open_store(config: &AppConfig) -> Result<(Arc<dyn TaskStore>, Option<DatabasePool>)> {
    match config.database.backend {
        DatabaseBackend::Memory => {
            warn!("Using in-memory task store; tasks are lost on restart");
            Ok((Arc::new(MemoryTaskStore::new()), None))
        }
        DatabaseBackend::Postgres => {
            let pool = DatabasePool::connect(&config.database.connection_string, config.database.max_connections)
                .await
                .context("Failed to connect to PostgreSQL")?;
            let store = PgTaskStore::new(pool.clone());
            store.create_tables().await.context("Failed to create tables")?;
            Ok((Arc::new(store), Some(pool)))
        }
    }
}

async fn build_alerts(config: &AppConfig, notifications: Arc<NotificationManager>) -> Result<Arc<AlertSystem>> {
    let timeout = config.alerts.webhook_timeout();
    let alerts = if config.alerts.load_defaults {
        AlertSystem::with_default_rules(notifications, timeout).await?
    } else {
        AlertSystem::new(notifications, timeout)?
    };
    if let Some(path) = &config.alerts.rules_file {
        alerts.load_rules_file(path).await?;
    }
    Ok(Arc::new(alerts))
}

/// 为启用通知的账户注册推送频道
async fn register_push_topics(store: &dyn TaskStore, notifications: &NotificationManager) -> Result<usize> {
    let accounts = store.list_accounts().await.context("Failed to list accounts")?;
    let mut registered = 0;
    for account in &accounts {
        if let Some(topic) = account.push_channel() {
            notifications.register_push_topic(&account.id.to_string(), topic).await;
            registered += 1;
        }
    }
    Ok(registered)
}
