//! 实时事件通道

use chartpilot_core::{Notification, NotificationScope, TaskStatus, TaskType};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, warn};
use uuid::Uuid;

/// 推送给控制面板的命名事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum LiveEvent {
    TaskCompleted {
        task_id: Uuid,
        task_type: TaskType,
        status: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Notification(Notification),
    BrowserStatus {
        connected: bool,
    },
    LowBatteryWarning {
        level: f32,
    },
}

impl LiveEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LiveEvent::TaskCompleted { .. } => "task_completed",
            LiveEvent::Notification(_) => "notification",
            LiveEvent::BrowserStatus { .. } => "browser_status",
            LiveEvent::LowBatteryWarning { .. } => "low_battery_warning",
        }
    }
}

/// 带投递范围的事件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveMessage {
    pub scope: NotificationScope,
    pub event: LiveEvent,
}

impl LiveMessage {
    fn visible_to(&self, user_id: &str) -> bool {
        match &self.scope {
            NotificationScope::Broadcast => true,
            NotificationScope::User(owner) => owner == user_id,
        }
    }
}

/// 实时事件中心，发送永不阻塞
#[derive(Debug)]
pub struct LiveHub {
    sender: broadcast::Sender<LiveMessage>,
}

impl LiveHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 投递事件，返回当前订阅者数量
    pub fn publish(&self, scope: NotificationScope, event: LiveEvent) -> usize {
        let name = event.name();
        match self.sender.send(LiveMessage { scope, event }) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("No live subscribers for {}", name);
                0
            }
        }
    }

    pub fn broadcast(&self, event: LiveEvent) -> usize {
        self.publish(NotificationScope::Broadcast, event)
    }

    pub fn send_to(&self, user_id: &str, event: LiveEvent) -> usize {
        self.publish(NotificationScope::User(user_id.to_string()), event)
    }

    /// 订阅：收到自己的事件和所有广播
    pub fn subscribe(&self, user_id: impl Into<String>) -> LiveSubscription {
        LiveSubscription {
            user_id: user_id.into(),
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for LiveHub {
    fn default() -> Self {
        Self::new(256)
    }
}

/// 单个用户的订阅
#[derive(Debug)]
pub struct LiveSubscription {
    user_id: String,
    receiver: broadcast::Receiver<LiveMessage>,
}

impl LiveSubscription {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// 等待下一个可见事件，通道关闭时返回 `None`
    pub async fn recv(&mut self) -> Option<LiveEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(message) if message.visible_to(&self.user_id) => return Some(message.event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Live subscriber {} lagged, {} events dropped", self.user_id, skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// 非阻塞读取
    pub fn try_recv(&mut self) -> Option<LiveEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) if message.visible_to(&self.user_id) => return Some(message.event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Live subscriber {} lagged, {} events dropped", self.user_id, skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = LiveEvent::TaskCompleted {
            task_id: Uuid::nil(),
            task_type: TaskType::Sign,
            status: TaskStatus::Failed,
            error: Some("Timeout".to_string()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "task_completed");
        assert_eq!(json["data"]["task_type"], "sign");
        assert_eq!(json["data"]["status"], "failed");

        let json = serde_json::to_value(LiveEvent::BrowserStatus { connected: true }).unwrap();
        assert_eq!(json, serde_json::json!({"event": "browser_status", "data": {"connected": true}}));
    }

    #[tokio::test]
    async fn test_subscribers_see_own_events_and_broadcasts() {
        let hub = LiveHub::default();
        let mut alice = hub.subscribe("alice");
        let mut bob = hub.subscribe("bob");

        hub.send_to("alice", LiveEvent::LowBatteryWarning { level: 15.0 });
        hub.broadcast(LiveEvent::BrowserStatus { connected: false });

        assert_eq!(alice.recv().await, Some(LiveEvent::LowBatteryWarning { level: 15.0 }));
        assert_eq!(alice.recv().await, Some(LiveEvent::BrowserStatus { connected: false }));
        assert_eq!(bob.try_recv(), Some(LiveEvent::BrowserStatus { connected: false }));
        assert_eq!(bob.try_recv(), None);
    }

    #[test]
    fn test_publish_without_subscribers_does_not_fail() {
        let hub = LiveHub::new(4);
        assert_eq!(hub.broadcast(LiveEvent::BrowserStatus { connected: true }), 0);
    }
}
