//! 通知管理
//!
//! 通知只保存在内存中，进程重启后丢失。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chartpilot_core::{Notification, NotificationScope, Severity, TaskType};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::live::{LiveEvent, LiveHub};
use crate::push::PushGateway;

/// 系统级操作使用的用户标识
pub const SYSTEM_USER: &str = "system";

/// 通知管理器
pub struct NotificationManager {
    /// 通知记录（按时间追加）
    log: RwLock<VecDeque<Notification>>,
    /// 用户推送频道
    push_topics: RwLock<HashMap<String, String>>,
    live: Arc<LiveHub>,
    push: Option<Arc<dyn PushGateway>>,
    max_history: usize,
}

impl std::fmt::Debug for NotificationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationManager")
            .field("max_history", &self.max_history)
            .field("push_enabled", &self.push.is_some())
            .finish()
    }
}

impl NotificationManager {
    /// 创建新的通知管理器
    pub fn new(live: Arc<LiveHub>, push: Option<Arc<dyn PushGateway>>, max_history: usize) -> Self {
        Self {
            log: RwLock::new(VecDeque::new()),
            push_topics: RwLock::new(HashMap::new()),
            live,
            push,
            max_history: max_history.max(1),
        }
    }

    pub fn live(&self) -> &Arc<LiveHub> {
        &self.live
    }

    /// 发送给指定用户
    pub async fn send(&self, user_id: &str, title: &str, message: &str, severity: Severity) -> Notification {
        let notification = Notification::new(title, message, severity, NotificationScope::User(user_id.to_string()));
        self.append(notification.clone()).await;
        self.live.send_to(user_id, LiveEvent::Notification(notification.clone()));

        let topic = self.push_topics.read().await.get(user_id).cloned();
        if let (Some(topic), Some(gateway)) = (topic, self.push.clone()) {
            let title = title.to_string();
            let message = message.to_string();
            tokio::spawn(async move {
                if let Err(e) = gateway.publish(&topic, &title, &message).await {
                    warn!("External push to {} failed: {}", topic, e);
                }
            });
        }

        debug!("Notification {} sent to {}", notification.id, user_id);
        notification
    }

    /// 广播给所有用户
    pub async fn broadcast(&self, title: &str, message: &str, severity: Severity) -> Notification {
        let notification = Notification::new(title, message, severity, NotificationScope::Broadcast);
        self.append(notification.clone()).await;
        self.live.broadcast(LiveEvent::Notification(notification.clone()));

        info!("Broadcast notification: {}", title);
        notification
    }

    /// 最近的通知，按时间倒序；指定用户时只返回其可见通知
    pub async fn get(&self, user_id: Option<&str>, limit: usize) -> Vec<Notification> {
        let log = self.log.read().await;
        let mut visible: Vec<Notification> = log
            .iter()
            .rev()
            .filter(|n| user_id.map_or(true, |user| n.is_visible_to(user)))
            .cloned()
            .collect();
        visible.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        visible.truncate(limit);
        visible
    }

    /// 清除指定用户的通知（保留广播），不指定时清空全部
    pub async fn clear(&self, user_id: Option<&str>) {
        let mut log = self.log.write().await;
        match user_id {
            Some(user) => log.retain(|n| !n.belongs_to(user)),
            None => log.clear(),
        }
    }

    pub async fn register_push_topic(&self, user_id: &str, topic: &str) {
        self.push_topics
            .write()
            .await
            .insert(user_id.to_string(), topic.to_string());
        info!("Registered push topic for {}", user_id);
    }

    pub async fn remove_push_topic(&self, user_id: &str) -> bool {
        self.push_topics.write().await.remove(user_id).is_some()
    }

    async fn append(&self, notification: Notification) {
        let mut log = self.log.write().await;
        log.push_back(notification);
        while log.len() > self.max_history {
            log.pop_front();
        }
    }
}

/// 任务生命周期通知
#[derive(Debug, Clone)]
pub struct TaskNotifier {
    manager: Arc<NotificationManager>,
}

impl TaskNotifier {
    pub fn new(manager: Arc<NotificationManager>) -> Self {
        Self { manager }
    }

    pub async fn notify_scheduled(&self, user_id: &str, patient: &str, task_type: TaskType, run_at: DateTime<Utc>) {
        self.manager
            .send(
                user_id,
                "Task Scheduled",
                &format!("{} task scheduled for {} at {}", task_type, patient, run_at.format("%Y-%m-%d %H:%M")),
                Severity::Info,
            )
            .await;
    }

    pub async fn notify_started(&self, user_id: &str, patient: &str, task_type: TaskType) {
        self.manager
            .send(
                user_id,
                "Task Started",
                &format!("Executing {} for {}", task_type, patient),
                Severity::Info,
            )
            .await;
    }

    pub async fn notify_completed(&self, user_id: &str, patient: &str, task_type: TaskType) {
        self.manager
            .send(
                user_id,
                "Task Completed",
                &format!("Successfully completed {} for {}", task_type, patient),
                Severity::Success,
            )
            .await;
    }

    pub async fn notify_failed(&self, user_id: &str, patient: &str, task_type: TaskType, error: &str) {
        self.manager
            .send(
                user_id,
                "Task Failed",
                &format!("Failed to complete {} for {}: {}", task_type, patient, error),
                Severity::Error,
            )
            .await;
    }

    pub async fn notify_batch_complete(&self, user_id: &str, completed: usize, total: usize) {
        let severity = if completed == total { Severity::Success } else { Severity::Warning };
        self.manager
            .send(
                user_id,
                "Batch Processing Complete",
                &format!("Completed {} of {} scheduled tasks", completed, total),
                severity,
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartpilot_core::{PilotError, Result};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingGateway {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl PushGateway for RecordingGateway {
        async fn publish(&self, topic: &str, title: &str, _message: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((topic.to_string(), title.to_string()));
            if self.fail {
                Err(PilotError::ExternalPush("gateway down".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn manager_with(gateway: Option<Arc<dyn PushGateway>>, max_history: usize) -> NotificationManager {
        NotificationManager::new(Arc::new(LiveHub::default()), gateway, max_history)
    }

    #[tokio::test]
    async fn test_get_returns_own_and_broadcast_newest_first() {
        let manager = manager_with(None, 100);
        manager.send("alice", "A1", "m", Severity::Info).await;
        manager.send("bob", "B1", "m", Severity::Info).await;
        manager.broadcast("All", "m", Severity::Warning).await;
        manager.send("alice", "A2", "m", Severity::Success).await;

        let titles: Vec<String> = manager.get(Some("alice"), 10).await.into_iter().map(|n| n.title).collect();
        assert_eq!(titles, vec!["A2", "All", "A1"]);
        assert_eq!(manager.get(None, 2).await.len(), 2);
        assert_eq!(manager.get(None, 50).await.len(), 4);
    }

    #[tokio::test]
    async fn test_clear_user_keeps_broadcasts() {
        let manager = manager_with(None, 100);
        manager.send("alice", "A1", "m", Severity::Info).await;
        manager.send("bob", "B1", "m", Severity::Info).await;
        manager.broadcast("All", "m", Severity::Info).await;

        manager.clear(Some("alice")).await;
        let titles: Vec<String> = manager.get(None, 10).await.into_iter().map(|n| n.title).collect();
        assert_eq!(titles, vec!["All", "B1"]);

        manager.clear(None).await;
        assert!(manager.get(None, 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_history_is_capped() {
        let manager = manager_with(None, 3);
        for i in 0..5 {
            manager.broadcast(&format!("n{}", i), "m", Severity::Info).await;
        }
        let titles: Vec<String> = manager.get(None, 10).await.into_iter().map(|n| n.title).collect();
        assert_eq!(titles.len(), 3);
        assert!(!titles.contains(&"n0".to_string()));
        assert!(!titles.contains(&"n1".to_string()));
    }

    #[tokio::test]
    async fn test_live_delivery_is_scoped() {
        let manager = manager_with(None, 10);
        let mut alice = manager.live().subscribe("alice");
        let mut bob = manager.live().subscribe("bob");

        manager.send("alice", "Private", "m", Severity::Info).await;
        match alice.try_recv() {
            Some(LiveEvent::Notification(n)) => assert_eq!(n.title, "Private"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(bob.try_recv(), None);
    }

    #[tokio::test]
    async fn test_push_failure_is_swallowed() {
        let gateway = Arc::new(RecordingGateway {
            fail: true,
            ..Default::default()
        });
        let manager = manager_with(Some(gateway.clone()), 10);
        manager.register_push_topic("alice", "alice-topic").await;

        let notification = manager.send("alice", "Task Failed", "m", Severity::Error).await;
        manager.send("bob", "No topic", "m", Severity::Info).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(notification.title, "Task Failed");
        let sent = gateway.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![("alice-topic".to_string(), "Task Failed".to_string())]);
        assert!(manager.remove_push_topic("alice").await);
    }

    #[tokio::test]
    async fn test_batch_severity() {
        let manager = Arc::new(manager_with(None, 10));
        let notifier = TaskNotifier::new(manager.clone());

        notifier.notify_batch_complete(SYSTEM_USER, 2, 3).await;
        notifier.notify_batch_complete(SYSTEM_USER, 3, 3).await;
        notifier.notify_failed(SYSTEM_USER, "demo_001", TaskType::Sign, "Timeout").await;

        let recent = manager.get(Some(SYSTEM_USER), 10).await;
        assert_eq!(recent[0].severity, Severity::Error);
        assert_eq!(recent[0].message, "Failed to complete sign for demo_001: Timeout");
        assert_eq!(recent[1].severity, Severity::Success);
        assert_eq!(recent[2].severity, Severity::Warning);
    }
}
