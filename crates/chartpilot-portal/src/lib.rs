//! # Chartpilot Portal
//!
//! 目标门户自动化：元素定位、签名手势回放、会话管理以及浏览器驱动。

pub mod config;
pub mod driver;
pub mod fixtures;
pub mod gesture;
pub mod resolver;
pub mod scripted;
pub mod session;
pub mod webdriver;

pub use config::{GestureConfig, PortalConfig, PortalRoutes, PortalSelectors};
pub use driver::{ElementRef, PointerEvent, PointerKind, PortalDriver, Rect};
pub use gesture::{GestureReplay, GestureTiming, ReplayOutcome};
pub use resolver::{ElementResolver, Resolved};
pub use scripted::{DriverEvent, ScriptedDriver, ScriptedElement, ScriptedPage};
pub use session::{ConnectionState, FillReport, PortalHandle, PortalSession, SignReport};
pub use webdriver::WebDriverClient;
