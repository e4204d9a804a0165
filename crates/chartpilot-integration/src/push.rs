//! 外部推送网关

use std::time::Duration;

use chartpilot_core::utils::join_url;
use chartpilot_core::{PilotError, Result};
use tracing::debug;

/// 外部推送，失败由调用方记录后忽略
#[async_trait::async_trait]
pub trait PushGateway: Send + Sync {
    async fn publish(&self, topic: &str, title: &str, message: &str) -> Result<()>;
}

/// ntfy 推送实现
#[derive(Debug, Clone)]
pub struct NtfyGateway {
    client: reqwest::Client,
    base_url: String,
    tags: String,
}

impl NtfyGateway {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PilotError::Config(format!("failed to build push client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            tags: "medical,chartpilot".to_string(),
        })
    }

    pub fn topic_url(&self, topic: &str) -> String {
        join_url(&self.base_url, topic)
    }
}

#[async_trait::async_trait]
impl PushGateway for NtfyGateway {
    async fn publish(&self, topic: &str, title: &str, message: &str) -> Result<()> {
        let response = self
            .client
            .post(self.topic_url(topic))
            .header("Title", title)
            .header("Priority", "default")
            .header("Tags", &self.tags)
            .body(message.to_string())
            .send()
            .await
            .map_err(|e| PilotError::ExternalPush(format!("push to {} failed: {}", topic, e)))?;

        let status = response.status();
        if status.is_success() {
            debug!("Pushed notification to topic {}", topic);
            Ok(())
        } else {
            Err(PilotError::ExternalPush(format!("push to {} returned {}", topic, status)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_url() {
        let gateway = NtfyGateway::new("https://ntfy.sh/", Duration::from_secs(10)).unwrap();
        assert_eq!(gateway.topic_url("clinic-alerts"), "https://ntfy.sh/clinic-alerts");
    }
}
