//! 门户驱动接口
//!
//! 会话只通过这些原语访问目标门户，具体实现可以是 WebDriver 或内存脚本。

use chartpilot_core::Result;
use serde::{Deserialize, Serialize};

/// 驱动返回的元素句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementRef(pub String);

impl ElementRef {
    pub fn id(&self) -> &str {
        &self.0
    }
}

/// 元素包围盒（视口坐标）
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// 指针事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerKind {
    Down,
    Move,
    Up,
}

/// 绝对坐标的指针事件
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointerEvent {
    pub kind: PointerKind,
    pub x: f64,
    pub y: f64,
}

impl PointerEvent {
    pub fn new(kind: PointerKind, x: f64, y: f64) -> Self {
        Self { kind, x, y }
    }
}

/// 门户驱动特征
#[async_trait::async_trait]
pub trait PortalDriver: Send + Sync {
    /// 建立自动化通道
    async fn start(&self) -> Result<()>;

    async fn navigate(&self, url: &str) -> Result<()>;

    /// 轻量级存活探测
    async fn current_url(&self) -> Result<String>;

    /// 在当前文档上下文中查找，无匹配时返回空列表
    async fn find_elements(&self, selector: &str) -> Result<Vec<ElementRef>>;

    async fn find_child_elements(&self, parent: &ElementRef, selector: &str) -> Result<Vec<ElementRef>>;

    /// 默认文档中的子框架数量
    async fn frame_count(&self) -> Result<usize>;

    async fn enter_frame(&self, index: usize) -> Result<()>;

    async fn enter_default(&self) -> Result<()>;

    async fn is_displayed(&self, element: &ElementRef) -> Result<bool>;

    async fn tag_name(&self, element: &ElementRef) -> Result<String>;

    async fn attribute(&self, element: &ElementRef, name: &str) -> Result<Option<String>>;

    async fn text(&self, element: &ElementRef) -> Result<String>;

    async fn is_selected(&self, element: &ElementRef) -> Result<bool>;

    async fn click(&self, element: &ElementRef) -> Result<()>;

    async fn clear(&self, element: &ElementRef) -> Result<()>;

    async fn send_keys(&self, element: &ElementRef, text: &str) -> Result<()>;

    async fn rect(&self, element: &ElementRef) -> Result<Rect>;

    async fn dispatch_pointer(&self, event: PointerEvent) -> Result<()>;

    /// 关闭浏览器会话
    async fn quit(&self) -> Result<()>;
}
