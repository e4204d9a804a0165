//! W3C WebDriver 客户端
//!
//! 通过 HTTP 与 chromedriver 等 WebDriver 服务通信。

use std::time::Duration;

use chartpilot_core::utils::join_url;
use chartpilot_core::{PilotError, Result};
use reqwest::{Client, Method};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::PortalConfig;
use crate::driver::{ElementRef, PointerEvent, PointerKind, PortalDriver, Rect};

/// W3C 规定的元素标识键
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// WebDriver 客户端
#[derive(Debug)]
pub struct WebDriverClient {
    http: Client,
    endpoint: String,
    browser_args: Vec<String>,
    session_id: RwLock<Option<String>>,
}

impl WebDriverClient {
    /// 创建客户端，不会立即启动浏览器
    pub fn new(endpoint: impl Into<String>, browser_args: Vec<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PilotError::Config(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
            browser_args,
            session_id: RwLock::new(None),
        })
    }

    pub fn from_config(config: &PortalConfig) -> Result<Self> {
        Self::new(config.webdriver_url.clone(), config.browser_args.clone())
    }

    fn capabilities(&self) -> Value {
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": self.browser_args }
                }
            }
        })
    }

    async fn session(&self) -> Result<String> {
        self.session_id
            .read()
            .await
            .clone()
            .ok_or_else(|| PilotError::ConnectionLost("no active webdriver session".to_string()))
    }

    async fn request(&self, method: Method, url: &str, body: Option<Value>) -> Result<Value> {
        let mut request = self.http.request(method.clone(), url);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PilotError::ConnectionLost(format!("webdriver unreachable: {}", e)))?;
        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| PilotError::ConnectionLost(format!("invalid webdriver response: {}", e)))?;
        let value = payload.get("value").cloned().unwrap_or(Value::Null);

        if status.is_success() {
            Ok(value)
        } else {
            let code = value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
            let message = value.get("message").and_then(Value::as_str).unwrap_or("");
            debug!("WebDriver {} {} failed: {} {}", method, url, code, message);
            Err(map_error(code, message))
        }
    }

    /// 在当前会话上执行命令；连接丢失时作废该会话，下次 `start` 会重新创建
    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let session = self.session().await?;
        let url = join_url(&self.endpoint, &format!("session/{}/{}", session, path));
        let result = self.request(method, &url, body).await;
        if let Err(PilotError::ConnectionLost(detail)) = &result {
            self.forget_session(&session, detail).await;
        }
        result
    }

    async fn forget_session(&self, session: &str, reason: &str) {
        let mut current = self.session_id.write().await;
        if current.as_deref() == Some(session) {
            warn!("WebDriver session {} is gone ({}), it will be recreated on reconnect", session, reason);
            *current = None;
        }
    }

    async fn element_command(&self, method: Method, element: &ElementRef, path: &str, body: Option<Value>) -> Result<Value> {
        self.command(method, &format!("element/{}/{}", element.id(), path), body).await
    }
}

/// 将 WebDriver 错误码映射到统一错误类型
fn map_error(code: &str, message: &str) -> PilotError {
    let detail = if message.is_empty() {
        code.to_string()
    } else {
        format!("{}: {}", code, message)
    };
    match code {
        "no such element" | "no such frame" | "stale element reference" | "element not interactable" => {
            PilotError::ElementNotFound(detail)
        }
        "timeout" | "script timeout" => PilotError::Timeout(detail),
        "invalid session id" | "session not created" | "no such window" => PilotError::ConnectionLost(detail),
        _ => PilotError::Internal(detail),
    }
}

fn parse_element(value: &Value) -> Result<ElementRef> {
    value
        .get(ELEMENT_KEY)
        .and_then(Value::as_str)
        .map(|id| ElementRef(id.to_string()))
        .ok_or_else(|| PilotError::Internal(format!("malformed element reference: {}", value)))
}

fn parse_elements(value: &Value) -> Result<Vec<ElementRef>> {
    match value.as_array() {
        Some(items) => items.iter().map(parse_element).collect(),
        None => Err(PilotError::Internal(format!("expected element list: {}", value))),
    }
}

fn locator(selector: &str) -> Value {
    json!({ "using": "css selector", "value": selector })
}

/// 单个指针事件对应的动作序列
fn pointer_actions(event: &PointerEvent) -> Value {
    let movement = json!({
        "type": "pointerMove",
        "duration": 0,
        "origin": "viewport",
        "x": event.x.round() as i64,
        "y": event.y.round() as i64,
    });
    let steps = match event.kind {
        PointerKind::Down => vec![movement, json!({ "type": "pointerDown", "button": 0 })],
        PointerKind::Move => vec![movement],
        PointerKind::Up => vec![movement, json!({ "type": "pointerUp", "button": 0 })],
    };

    json!({
        "actions": [{
            "type": "pointer",
            "id": "signature-pen",
            "parameters": { "pointerType": "mouse" },
            "actions": steps,
        }]
    })
}

fn as_bool(value: Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| PilotError::Internal(format!("expected boolean: {}", value)))
}

fn as_string(value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(PilotError::Internal(format!("expected string: {}", other))),
    }
}

#[async_trait::async_trait]
impl PortalDriver for WebDriverClient {
    async fn start(&self) -> Result<()> {
        if self.session_id.read().await.is_some() {
            return Ok(());
        }

        let url = join_url(&self.endpoint, "session");
        let value = self.request(Method::POST, &url, Some(self.capabilities())).await.map_err(|e| match e {
            PilotError::Internal(detail) => PilotError::ConnectionLost(detail),
            other => other,
        })?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| PilotError::ConnectionLost("webdriver returned no session id".to_string()))?
            .to_string();

        info!("WebDriver session {} started at {}", session_id, self.endpoint);
        *self.session_id.write().await = Some(session_id);
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        self.command(Method::POST, "url", Some(json!({ "url": url }))).await?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        let value = self.command(Method::GET, "url", None).await?;
        as_string(value)
    }

    async fn find_elements(&self, selector: &str) -> Result<Vec<ElementRef>> {
        let value = self.command(Method::POST, "elements", Some(locator(selector))).await?;
        parse_elements(&value)
    }

    async fn find_child_elements(&self, parent: &ElementRef, selector: &str) -> Result<Vec<ElementRef>> {
        let value = self
            .element_command(Method::POST, parent, "elements", Some(locator(selector)))
            .await?;
        parse_elements(&value)
    }

    async fn frame_count(&self) -> Result<usize> {
        Ok(self.find_elements("iframe, frame").await?.len())
    }

    async fn enter_frame(&self, index: usize) -> Result<()> {
        self.command(Method::POST, "frame", Some(json!({ "id": index }))).await?;
        Ok(())
    }

    async fn enter_default(&self) -> Result<()> {
        self.command(Method::POST, "frame", Some(json!({ "id": null }))).await?;
        Ok(())
    }

    async fn is_displayed(&self, element: &ElementRef) -> Result<bool> {
        as_bool(self.element_command(Method::GET, element, "displayed", None).await?)
    }

    async fn tag_name(&self, element: &ElementRef) -> Result<String> {
        as_string(self.element_command(Method::GET, element, "name", None).await?)
    }

    async fn attribute(&self, element: &ElementRef, name: &str) -> Result<Option<String>> {
        // value 读取实时属性而不是初始 HTML 属性
        let path = if name == "value" {
            "property/value".to_string()
        } else {
            format!("attribute/{}", name)
        };
        let value = self.element_command(Method::GET, element, &path, None).await?;
        Ok(match value {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        })
    }

    async fn text(&self, element: &ElementRef) -> Result<String> {
        as_string(self.element_command(Method::GET, element, "text", None).await?)
    }

    async fn is_selected(&self, element: &ElementRef) -> Result<bool> {
        as_bool(self.element_command(Method::GET, element, "selected", None).await?)
    }

    async fn click(&self, element: &ElementRef) -> Result<()> {
        self.element_command(Method::POST, element, "click", Some(json!({}))).await?;
        Ok(())
    }

    async fn clear(&self, element: &ElementRef) -> Result<()> {
        self.element_command(Method::POST, element, "clear", Some(json!({}))).await?;
        Ok(())
    }

    async fn send_keys(&self, element: &ElementRef, text: &str) -> Result<()> {
        self.element_command(Method::POST, element, "value", Some(json!({ "text": text })))
            .await?;
        Ok(())
    }

    async fn rect(&self, element: &ElementRef) -> Result<Rect> {
        let value = self.element_command(Method::GET, element, "rect", None).await?;
        serde_json::from_value(value).map_err(|e| PilotError::Internal(format!("malformed element rect: {}", e)))
    }

    async fn dispatch_pointer(&self, event: PointerEvent) -> Result<()> {
        self.command(Method::POST, "actions", Some(pointer_actions(&event))).await?;
        Ok(())
    }

    async fn quit(&self) -> Result<()> {
        let session = self.session_id.write().await.take();
        if let Some(session) = session {
            let url = join_url(&self.endpoint, &format!("session/{}", session));
            self.request(Method::DELETE, &url, None).await?;
            info!("WebDriver session {} closed", session);
        }
        Ok(())
    }
}
