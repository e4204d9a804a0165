//! Webhook 调用

use std::time::Duration;

use chartpilot_core::{PilotError, Result};
use tracing::{error, info};

/// Webhook 客户端：以 JSON 形式投递事件数据
#[derive(Debug, Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
}

impl WebhookClient {
    /// 创建带超时的客户端
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PilotError::Config(format!("failed to build webhook client: {}", e)))?;
        Ok(Self { client })
    }

    /// 发送单个 Webhook
    pub async fn post_json(&self, url: &str, payload: &serde_json::Value) -> Result<()> {
        let request = self
            .client
            .post(url)
            .header("User-Agent", "Chartpilot-Webhook/1.0")
            .json(payload);

        match request.send().await {
            Ok(response) => {
                if response.status().is_success() {
                    info!("Successfully sent webhook to: {}", url);
                    Ok(())
                } else {
                    let status = response.status();
                    error!("Webhook failed with status {}: {}", status, url);
                    Err(PilotError::ExternalPush(format!("webhook failed with status: {}", status)))
                }
            }
            Err(e) => {
                error!("Failed to send webhook to {}: {}", url, e);
                Err(PilotError::ExternalPush(format!("failed to send webhook: {}", e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_webhook_reports_push_error() {
        let client = WebhookClient::new(Duration::from_millis(200)).unwrap();
        let result = client
            .post_json("http://127.0.0.1:9/alerts", &serde_json::json!({"cpu_usage": 97}))
            .await;
        assert!(matches!(result, Err(PilotError::ExternalPush(_))));
    }
}
