//! 系统监控
//!
//! 周期检查浏览器连接、电池电量和主机资源，并把观测数据交给告警系统。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chartpilot_core::{PeriodicWorker, Severity};
use chartpilot_integration::{LiveEvent, NotificationManager};
use chartpilot_portal::PortalHandle;
use chrono::{DateTime, Utc};
use serde_json::json;
use sysinfo::System;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerting::AlertSystem;
use crate::config::MonitorConfig;

/// 主机资源采样
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HostSnapshot {
    /// 内存使用率（百分比）
    pub memory_usage: f64,
    /// CPU 使用率（百分比）
    pub cpu_usage: f64,
    /// 电池电量（百分比），没有电池时为空
    pub battery_level: Option<f32>,
}

/// 主机资源探针
#[async_trait::async_trait]
pub trait HostProbe: Send + Sync {
    async fn sample(&self) -> HostSnapshot;
}

/// 基于 sysinfo 的探针，电量读取 Linux power_supply
pub struct SysinfoProbe {
    system: Mutex<System>,
    power_supply_dir: PathBuf,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self::with_power_supply_dir("/sys/class/power_supply")
    }

    pub fn with_power_supply_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            system: Mutex::new(System::new()),
            power_supply_dir: dir.into(),
        }
    }

    async fn battery_level(&self) -> Option<f32> {
        let mut entries = tokio::fs::read_dir(&self.power_supply_dir).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let kind = tokio::fs::read_to_string(path.join("type")).await.unwrap_or_default();
            if kind.trim() != "Battery" {
                continue;
            }
            if let Ok(capacity) = tokio::fs::read_to_string(path.join("capacity")).await {
                if let Ok(level) = capacity.trim().parse::<f32>() {
                    return Some(level);
                }
            }
        }
        None
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SysinfoProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoProbe")
            .field("power_supply_dir", &self.power_supply_dir)
            .finish()
    }
}

#[async_trait::async_trait]
impl HostProbe for SysinfoProbe {
    async fn sample(&self) -> HostSnapshot {
        let (memory_usage, cpu_usage) = {
            let mut system = self.system.lock().await;
            system.refresh_memory();
            system.refresh_cpu_usage();

            let total = system.total_memory();
            let memory_usage = if total == 0 {
                0.0
            } else {
                system.used_memory() as f64 / total as f64 * 100.0
            };
            (memory_usage, system.global_cpu_usage() as f64)
        };

        HostSnapshot {
            memory_usage,
            cpu_usage,
            battery_level: self.battery_level().await,
        }
    }
}

/// 监控阈值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorSettings {
    pub battery_threshold: f32,
    pub memory_ceiling: f64,
    pub cpu_ceiling: f64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

impl From<&MonitorConfig> for MonitorSettings {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            battery_threshold: config.battery_threshold,
            memory_ceiling: config.memory_ceiling,
            cpu_ceiling: config.cpu_ceiling,
        }
    }
}

/// 单次检查的结果
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TickReport {
    pub connected: bool,
    /// 连接状态是否发生翻转
    pub connectivity_changed: bool,
    pub battery_warning: bool,
    /// 超过上限的资源名
    pub resource_warnings: Vec<&'static str>,
    /// 命中的告警规则
    pub fired_alerts: Vec<String>,
}

#[derive(Debug, Default)]
struct MonitorState {
    /// 上一次观测的连接状态，首次观测前为空
    previous_connectivity: Option<bool>,
    /// 低电量警告已发出，电量恢复后解除
    battery_latched: bool,
    disconnected_since: Option<DateTime<Utc>>,
}

/// 系统监控器
pub struct SystemMonitor {
    portal: PortalHandle,
    notifications: Arc<NotificationManager>,
    alerts: Arc<AlertSystem>,
    probe: Arc<dyn HostProbe>,
    settings: MonitorSettings,
    state: Mutex<MonitorState>,
}

impl std::fmt::Debug for SystemMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemMonitor").field("settings", &self.settings).finish()
    }
}

impl SystemMonitor {
    pub fn new(
        portal: PortalHandle,
        notifications: Arc<NotificationManager>,
        alerts: Arc<AlertSystem>,
        probe: Arc<dyn HostProbe>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            portal,
            notifications,
            alerts,
            probe,
            settings,
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// 按给定间隔运行直到取消
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> u64 {
        let worker = PeriodicWorker::new("system-monitor", interval, interval, shutdown);
        worker
            .run(|| {
                let monitor = self.clone();
                async move {
                    monitor.check_once().await;
                    Ok(())
                }
            })
            .await
    }

    pub async fn check_once(&self) -> TickReport {
        self.check_at(Utc::now()).await
    }

    /// 执行一次完整检查
    pub async fn check_at(&self, now: DateTime<Utc>) -> TickReport {
        let connected = self.portal.lock().await.check_connection().await;
        let host = self.probe.sample().await;
        debug!(
            "Monitor tick: connected={} memory={:.1}% cpu={:.1}% battery={:?}",
            connected, host.memory_usage, host.cpu_usage, host.battery_level
        );

        let (connectivity_changed, battery_warning, disconnected_secs) = {
            let mut state = self.state.lock().await;

            let previous = state.previous_connectivity.replace(connected);
            let changed = matches!(previous, Some(prev) if prev != connected);

            let disconnected_secs = if connected {
                state.disconnected_since = None;
                0
            } else {
                let since = *state.disconnected_since.get_or_insert(now);
                (now - since).num_seconds().max(0)
            };

            let mut battery_warning = false;
            if let Some(level) = host.battery_level {
                if level < self.settings.battery_threshold {
                    if !state.battery_latched {
                        state.battery_latched = true;
                        battery_warning = true;
                    }
                } else {
                    state.battery_latched = false;
                }
            }

            (changed, battery_warning, disconnected_secs)
        };

        if connectivity_changed {
            self.report_connectivity(connected).await;
        }
        self.notifications
            .live()
            .broadcast(LiveEvent::BrowserStatus { connected });

        if battery_warning {
            if let Some(level) = host.battery_level {
                self.report_low_battery(level).await;
            }
        }

        let resource_warnings = self.report_resources(&host).await;

        let mut event = json!({
            "browser_connected": connected,
            "duration": disconnected_secs,
            "memory_usage": host.memory_usage,
            "cpu_usage": host.cpu_usage,
        });
        if let Some(level) = host.battery_level {
            event["battery_level"] = json!(level);
        }
        let fired_alerts = self.alerts.check_alerts(&event).await;

        TickReport {
            connected,
            connectivity_changed,
            battery_warning,
            resource_warnings,
            fired_alerts,
        }
    }

    async fn report_connectivity(&self, connected: bool) {
        if connected {
            info!("Browser connection re-established");
            self.notifications
                .broadcast(
                    "Browser Connected",
                    "Browser connection has been re-established",
                    Severity::Success,
                )
                .await;
        } else {
            warn!("Browser connection lost");
            self.notifications
                .broadcast(
                    "Browser Disconnected",
                    "Browser connection lost. Attempting to reconnect...",
                    Severity::Warning,
                )
                .await;
        }
    }

    async fn report_low_battery(&self, level: f32) {
        warn!("Battery level {:.0}% below threshold {:.0}%", level, self.settings.battery_threshold);
        self.notifications
            .broadcast(
                "Low Battery Warning",
                &format!("System battery is at {:.0}%. Please connect to power.", level),
                Severity::Warning,
            )
            .await;
        self.notifications
            .live()
            .broadcast(LiveEvent::LowBatteryWarning { level });
    }

    async fn report_resources(&self, host: &HostSnapshot) -> Vec<&'static str> {
        let mut warnings = Vec::new();
        if host.memory_usage > self.settings.memory_ceiling {
            self.notifications
                .broadcast(
                    "High Memory Usage",
                    &format!("System memory usage is at {:.1}%", host.memory_usage),
                    Severity::Warning,
                )
                .await;
            warnings.push("memory");
        }
        if host.cpu_usage > self.settings.cpu_ceiling {
            self.notifications
                .broadcast(
                    "High CPU Usage",
                    &format!("System CPU usage is at {:.1}%", host.cpu_usage),
                    Severity::Warning,
                )
                .await;
            warnings.push("cpu");
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::{default_rules, AlertRule, Condition, Predicate};
    use chartpilot_integration::LiveHub;
    use chartpilot_portal::{PortalConfig, PortalSession, ScriptedDriver};
    use std::sync::Mutex as StdMutex;

    /// 按顺序返回预设采样
    struct FakeProbe {
        samples: StdMutex<Vec<HostSnapshot>>,
    }

    impl FakeProbe {
        fn new(samples: Vec<HostSnapshot>) -> Arc<Self> {
            let mut samples = samples;
            samples.reverse();
            Arc::new(Self {
                samples: StdMutex::new(samples),
            })
        }
    }

    #[async_trait::async_trait]
    impl HostProbe for FakeProbe {
        async fn sample(&self) -> HostSnapshot {
            let mut samples = self.samples.lock().unwrap();
            if samples.len() > 1 {
                samples.pop().unwrap()
            } else {
                samples.last().copied().unwrap_or_default()
            }
        }
    }

    fn idle() -> HostSnapshot {
        HostSnapshot {
            memory_usage: 40.0,
            cpu_usage: 10.0,
            battery_level: None,
        }
    }

    fn battery(level: f32) -> HostSnapshot {
        HostSnapshot {
            battery_level: Some(level),
            ..idle()
        }
    }

    struct Fixture {
        monitor: SystemMonitor,
        notifications: Arc<NotificationManager>,
        driver: ScriptedDriver,
    }

    async fn fixture(samples: Vec<HostSnapshot>, rules: Vec<AlertRule>) -> Fixture {
        let notifications = Arc::new(NotificationManager::new(Arc::new(LiveHub::default()), None, 100));
        let alerts = Arc::new(AlertSystem::new(notifications.clone(), Duration::from_secs(1)).unwrap());
        for rule in rules {
            alerts.add_rule(rule).await;
        }

        let driver = ScriptedDriver::new();
        let mut session = PortalSession::with_environment(Box::new(driver.clone()), PortalConfig::default(), |_| None);
        session.connect().await.unwrap();

        let monitor = SystemMonitor::new(
            PortalHandle::new(session),
            notifications.clone(),
            alerts,
            FakeProbe::new(samples),
            MonitorSettings::default(),
        );
        Fixture {
            monitor,
            notifications,
            driver,
        }
    }

    async fn titles(notifications: &NotificationManager) -> Vec<String> {
        let mut titles: Vec<String> = notifications.get(None, 100).await.into_iter().map(|n| n.title).collect();
        titles.reverse();
        titles
    }

    #[tokio::test]
    async fn test_first_observation_only_records_state() {
        let f = fixture(vec![idle()], Vec::new()).await;

        let report = f.monitor.check_once().await;
        assert!(report.connected);
        assert!(!report.connectivity_changed);
        assert!(f.notifications.get(None, 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_connectivity_is_edge_triggered() {
        let f = fixture(vec![idle()], Vec::new()).await;
        f.monitor.check_once().await;

        f.driver.fail_probe(true);
        assert!(f.monitor.check_once().await.connectivity_changed);
        assert!(!f.monitor.check_once().await.connectivity_changed);

        f.driver.fail_probe(false);
        assert!(f.monitor.check_once().await.connectivity_changed);

        assert_eq!(
            titles(&f.notifications).await,
            vec!["Browser Disconnected", "Browser Connected"]
        );
    }

    #[tokio::test]
    async fn test_battery_warning_latches_until_recovery() {
        let samples = vec![battery(50.0), battery(15.0), battery(10.0), battery(25.0), battery(12.0)];
        let f = fixture(samples, Vec::new()).await;
        let mut live = f.notifications.live().subscribe("operator");

        let mut fired = Vec::new();
        for _ in 0..5 {
            fired.push(f.monitor.check_once().await.battery_warning);
        }
        assert_eq!(fired, vec![false, true, false, false, true]);

        let mut battery_events = Vec::new();
        while let Some(event) = live.try_recv() {
            if let LiveEvent::LowBatteryWarning { level } = event {
                battery_events.push(level);
            }
        }
        assert_eq!(battery_events, vec![15.0, 12.0]);
    }

    #[tokio::test]
    async fn test_unknown_battery_keeps_latch() {
        let samples = vec![battery(10.0), idle(), battery(9.0)];
        let f = fixture(samples, Vec::new()).await;

        assert!(f.monitor.check_once().await.battery_warning);
        assert!(!f.monitor.check_once().await.battery_warning);
        assert!(!f.monitor.check_once().await.battery_warning);
    }

    #[tokio::test]
    async fn test_resource_warnings_fire_every_tick() {
        let hot = HostSnapshot {
            memory_usage: 92.0,
            cpu_usage: 97.0,
            battery_level: None,
        };
        let f = fixture(vec![hot, hot], Vec::new()).await;

        assert_eq!(f.monitor.check_once().await.resource_warnings, vec!["memory", "cpu"]);
        assert_eq!(f.monitor.check_once().await.resource_warnings, vec!["memory", "cpu"]);
        assert_eq!(f.notifications.get(None, 10).await.len(), 4);
    }

    #[tokio::test]
    async fn test_every_tick_emits_browser_status() {
        let f = fixture(vec![idle()], Vec::new()).await;
        let mut live = f.notifications.live().subscribe("operator");

        f.monitor.check_once().await;
        f.driver.fail_probe(true);
        f.monitor.check_once().await;

        let mut statuses = Vec::new();
        while let Some(event) = live.try_recv() {
            if let LiveEvent::BrowserStatus { connected } = event {
                statuses.push(connected);
            }
        }
        assert_eq!(statuses, vec![true, false]);
    }

    #[tokio::test]
    async fn test_disconnection_duration_feeds_alerts() {
        let f = fixture(vec![idle()], default_rules()).await;
        let start = Utc::now();
        f.monitor.check_at(start).await;

        f.driver.fail_probe(true);
        let report = f.monitor.check_at(start + chrono::Duration::seconds(60)).await;
        assert!(report.fired_alerts.is_empty());

        let report = f.monitor.check_at(start + chrono::Duration::seconds(420)).await;
        assert_eq!(report.fired_alerts, vec!["Browser Connection Lost"]);

        f.driver.fail_probe(false);
        let report = f.monitor.check_at(start + chrono::Duration::seconds(480)).await;
        assert!(report.fired_alerts.is_empty());
    }

    #[tokio::test]
    async fn test_battery_level_reaches_alert_data() {
        let rule = AlertRule::new("battery").when("battery_level", Condition::Predicate(Predicate::lt(5)));
        let f = fixture(vec![battery(3.0)], vec![rule]).await;

        assert_eq!(f.monitor.check_once().await.fired_alerts, vec!["battery"]);
    }

    #[tokio::test]
    async fn test_sysinfo_probe_without_battery() {
        let dir = std::env::temp_dir().join(format!("chartpilot-power-{}", std::process::id()));
        let adapter = dir.join("AC");
        tokio::fs::create_dir_all(&adapter).await.unwrap();
        tokio::fs::write(adapter.join("type"), "Mains\n").await.unwrap();

        let probe = SysinfoProbe::with_power_supply_dir(&dir);
        let snapshot = probe.sample().await;
        assert_eq!(snapshot.battery_level, None);
        assert!((0.0..=100.0).contains(&snapshot.memory_usage));

        let bat = dir.join("BAT0");
        tokio::fs::create_dir_all(&bat).await.unwrap();
        tokio::fs::write(bat.join("type"), "Battery\n").await.unwrap();
        tokio::fs::write(bat.join("capacity"), "42\n").await.unwrap();
        assert_eq!(probe.sample().await.battery_level, Some(42.0));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
