//! 目标门户配置
//!
//! 门户地址、路由模板和所有选择器都来自配置，代码中不出现具体门户的标识。

use std::time::Duration;

use chartpilot_core::utils::{join_url, render_template};
use serde::{Deserialize, Serialize};

/// 门户配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// 门户基础地址
    pub base_url: String,
    /// WebDriver 服务地址
    pub webdriver_url: String,
    /// 浏览器启动参数
    pub browser_args: Vec<String>,
    /// 强制使用离线模拟
    pub force_offline: bool,
    /// 单步等待上限（秒）
    pub wait_timeout_secs: u64,
    /// 等待标记时的轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    pub gesture: GestureConfig,
    pub routes: PortalRoutes,
    pub selectors: PortalSelectors,
}

/// 签名手势时序
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GestureConfig {
    pub point_delay_ms: u64,
    pub stroke_pause_ms: u64,
}

/// 路由模板，支持 `{patient_key}` 和 `{visit_id}` 占位符
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalRoutes {
    pub login: String,
    pub patients: String,
    pub visits: String,
    pub note: String,
    pub sign: String,
    pub location: String,
}

/// 选择器候选列表，按顺序尝试
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalSelectors {
    pub username: Vec<String>,
    pub password: Vec<String>,
    pub login_submit: Vec<String>,
    pub dashboard: Vec<String>,

    pub patient_table: Vec<String>,
    pub patient_rows: Vec<String>,
    pub patient_key_attributes: Vec<String>,
    pub patient_name: Vec<String>,
    pub patient_dob: Vec<String>,
    pub patient_address: Vec<String>,
    pub patient_phone: Vec<String>,
    pub patient_status: Vec<String>,

    pub visits_table: Vec<String>,
    pub visit_rows: Vec<String>,
    pub visit_id_attributes: Vec<String>,
    pub visit_date: Vec<String>,
    pub visit_status: Vec<String>,

    pub note_form: Vec<String>,
    /// 字段候选模板，`{field}` 替换为字段名
    pub field_candidates: Vec<String>,

    pub sign_form: Vec<String>,
    pub signature_canvas: Vec<String>,
    pub patient_unable: Vec<String>,
    pub sign_submit: Vec<String>,
    pub confirmation: Vec<String>,

    pub location_form: Vec<String>,
    pub location_field_candidates: Vec<String>,
    pub location_submit: Vec<String>,
}

impl PortalConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn login_url(&self) -> String {
        join_url(&self.base_url, &self.routes.login)
    }

    pub fn patients_url(&self) -> String {
        join_url(&self.base_url, &self.routes.patients)
    }

    pub fn visits_url(&self, patient_key: &str) -> String {
        self.route_url(&self.routes.visits, patient_key, "")
    }

    pub fn note_url(&self, patient_key: &str, visit_id: &str) -> String {
        self.route_url(&self.routes.note, patient_key, visit_id)
    }

    pub fn sign_url(&self, patient_key: &str, visit_id: &str) -> String {
        self.route_url(&self.routes.sign, patient_key, visit_id)
    }

    pub fn location_url(&self, patient_key: &str) -> String {
        self.route_url(&self.routes.location, patient_key, "")
    }

    fn route_url(&self, template: &str, patient_key: &str, visit_id: &str) -> String {
        let patient_key = urlencoding::encode(patient_key);
        let visit_id = urlencoding::encode(visit_id);
        let path = render_template(template, &[("patient_key", &*patient_key), ("visit_id", &*visit_id)]);
        join_url(&self.base_url, &path)
    }
}

/// 展开字段候选模板
pub fn expand_field_candidates(templates: &[String], field: &str) -> Vec<String> {
    templates
        .iter()
        .map(|template| render_template(template, &[("field", field)]))
        .collect()
}

fn list(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: "https://portal.example.com".to_string(),
            webdriver_url: "http://localhost:9515".to_string(),
            browser_args: list(&[
                "--headless",
                "--no-sandbox",
                "--disable-dev-shm-usage",
                "--disable-gpu",
                "--window-size=1920,1080",
            ]),
            force_offline: false,
            wait_timeout_secs: 10,
            poll_interval_ms: 250,
            gesture: GestureConfig::default(),
            routes: PortalRoutes::default(),
            selectors: PortalSelectors::default(),
        }
    }
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            point_delay_ms: 10,
            stroke_pause_ms: 50,
        }
    }
}

impl Default for PortalRoutes {
    fn default() -> Self {
        Self {
            login: "/login".to_string(),
            patients: "/patients".to_string(),
            visits: "/patients/{patient_key}/visits".to_string(),
            note: "/patients/{patient_key}/visits/{visit_id}/note".to_string(),
            sign: "/patients/{patient_key}/visits/{visit_id}/sign".to_string(),
            location: "/patients/{patient_key}/location".to_string(),
        }
    }
}

impl Default for PortalSelectors {
    fn default() -> Self {
        Self {
            username: list(&["#username", "[name='username']"]),
            password: list(&["#password", "[name='password']"]),
            login_submit: list(&["button[type='submit']", "input[type='submit']"]),
            dashboard: list(&[".dashboard", "#dashboard", "[data-page='dashboard']", "#main-content"]),

            patient_table: list(&[".patient-table", "#patient-list", "[data-patients]", ".patient-list", "#patients-table"]),
            patient_rows: list(&["tr[data-patient]", ".patient-row"]),
            patient_key_attributes: list(&["data-patient-key", "data-patient-id", "data-id"]),
            patient_name: list(&[".patient-name", "[data-name]"]),
            patient_dob: list(&[".patient-dob", "[data-dob]"]),
            patient_address: list(&[".patient-address", "[data-address]"]),
            patient_phone: list(&[".patient-phone", "[data-phone]"]),
            patient_status: list(&[".patient-status", "[data-status]"]),

            visits_table: list(&[".visits-table", "#visits-list"]),
            visit_rows: list(&["tr[data-visit]", ".visit-row"]),
            visit_id_attributes: list(&["data-visit-id", "data-visit", "data-id"]),
            visit_date: list(&[".visit-date", "[data-date]"]),
            visit_status: list(&[".visit-status", "[data-status]"]),

            note_form: list(&["form", ".note-form"]),
            field_candidates: list(&["#{field}", "[name='{field}']", "[data-field='{field}']", ".{field}"]),

            sign_form: list(&[".signature-form", "#signature-section"]),
            signature_canvas: list(&["#signatureCanvas", "canvas.pad", "div.sig-pad canvas", "canvas[data-signature]"]),
            patient_unable: list(&["input[value='patient_unable']", "#patient_unable", "[data-sign='unable']"]),
            sign_submit: list(&["button[type='submit']", "input[type='submit']", ".submit-signature"]),
            confirmation: list(&[".success", ".confirmation", "[data-success]"]),

            location_form: list(&[".location-form", "#location-section"]),
            location_field_candidates: list(&["[name='{field}']", "#{field}"]),
            location_submit: list(&["button[type='submit']", "input[type='submit']", ".submit-location"]),
        }
    }
}
