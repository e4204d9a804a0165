//! 门户会话
//!
//! 管理与目标门户之间的自动化通道，提供登录、读取患者和访视、填写记录、签名等工作流。
//! 受限运行环境下会话永久处于离线模拟模式，返回固定数据。

use std::sync::Arc;

use chartpilot_core::utils::detect_restricted_runtime;
use chartpilot_core::{
    Credential, FieldValue, NoteField, PatientRecord, PilotError, Result, SignMethod, Signature, Visit, VisitStatus,
};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{expand_field_candidates, PortalConfig};
use crate::driver::{ElementRef, PortalDriver};
use crate::fixtures;
use crate::gesture::{GestureReplay, GestureTiming};
use crate::resolver::ElementResolver;

/// 会话连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    OfflineMock,
}

/// 表单填写结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FillReport {
    pub filled: Vec<String>,
    pub skipped: Vec<String>,
}

impl FillReport {
    fn all_filled(fields: &[NoteField]) -> Self {
        Self {
            filled: fields.iter().map(|f| f.name.clone()).collect(),
            skipped: Vec::new(),
        }
    }
}

/// 签名结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignReport {
    /// 实际采用的签名方式
    pub method_used: SignMethod,
    /// 手写签名失败后改用"患者无法签名"
    pub fell_back: bool,
}

/// 门户会话，不可重入，并发访问需经过 [`PortalHandle`]
pub struct PortalSession {
    driver: Option<Box<dyn PortalDriver>>,
    config: PortalConfig,
    state: ConnectionState,
    authenticated: bool,
    gesture: GestureReplay,
}

impl std::fmt::Debug for PortalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalSession")
            .field("state", &self.state)
            .field("authenticated", &self.authenticated)
            .field("base_url", &self.config.base_url)
            .finish()
    }
}

impl PortalSession {
    /// 创建会话，根据进程环境变量判断是否进入离线模式
    pub fn new(driver: Box<dyn PortalDriver>, config: PortalConfig) -> Self {
        Self::with_environment(driver, config, |name| std::env::var(name).ok())
    }

    /// 使用自定义环境变量来源创建会话，只在构造时判断一次
    pub fn with_environment<F>(driver: Box<dyn PortalDriver>, config: PortalConfig, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let signal = if config.force_offline {
            Some("portal.force_offline")
        } else {
            detect_restricted_runtime(lookup)
        };

        match signal {
            Some(signal) => {
                info!("Restricted runtime detected ({}), portal automation runs in offline mock mode", signal);
                Self::offline(config)
            }
            None => Self {
                driver: Some(driver),
                gesture: GestureReplay::new(GestureTiming::from(&config.gesture)),
                config,
                state: ConnectionState::Disconnected,
                authenticated: false,
            },
        }
    }

    /// 离线模拟会话
    pub fn offline(config: PortalConfig) -> Self {
        Self {
            driver: None,
            gesture: GestureReplay::new(GestureTiming::from(&config.gesture)),
            config,
            state: ConnectionState::OfflineMock,
            authenticated: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    pub fn is_offline(&self) -> bool {
        self.state == ConnectionState::OfflineMock
    }

    /// 最近一次观测到的连接状态，不做探测
    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected | ConnectionState::OfflineMock)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// 建立自动化通道
    pub async fn connect(&mut self) -> Result<()> {
        let driver = match (&self.driver, self.state) {
            (_, ConnectionState::OfflineMock) | (_, ConnectionState::Connected) => return Ok(()),
            (Some(driver), _) => driver,
            (None, _) => return Err(PilotError::ConnectionLost("no portal driver configured".to_string())),
        };

        self.state = ConnectionState::Connecting;
        match driver.start().await {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                info!("Portal automation channel established");
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                warn!("Failed to establish portal automation channel: {}", e);
                Err(e)
            }
        }
    }

    /// 登录门户，未连接时先建立通道
    pub async fn login(&mut self, credential: &Credential) -> Result<()> {
        if self.is_offline() {
            self.authenticated = true;
            return Ok(());
        }
        if self.state != ConnectionState::Connected {
            self.connect().await?;
        }

        let result = self.perform_login(credential).await;
        self.observe(&result);
        match result {
            Ok(()) => {
                self.authenticated = true;
                info!("Logged in to portal as {}", credential.username);
                Ok(())
            }
            Err(e) => {
                self.authenticated = false;
                warn!("Portal login failed for {}: {}", credential.username, e);
                match e {
                    PilotError::Timeout(_) | PilotError::ElementNotFound(_) => Err(PilotError::LoginFailed(e.to_string())),
                    other => Err(other),
                }
            }
        }
    }

    /// 读取患者列表，无法解析的行被跳过
    pub async fn fetch_patients(&mut self) -> Result<Vec<PatientRecord>> {
        if self.is_offline() {
            return Ok(fixtures::patients());
        }
        let result = self.read_patients().await;
        self.observe(&result);
        if let Err(e) = &result {
            warn!("Failed to fetch patients: {}", e);
        }
        result
    }

    /// 读取患者的访视列表
    pub async fn fetch_visits(&mut self, patient_key: &str) -> Result<Vec<Visit>> {
        if self.is_offline() {
            return Ok(fixtures::visits(patient_key));
        }
        let result = self.read_visits(patient_key).await;
        self.observe(&result);
        if let Err(e) = &result {
            warn!("Failed to fetch visits for patient {}: {}", patient_key, e);
        }
        result
    }

    /// 自动填写访视记录
    pub async fn autofill_note(&mut self, patient_key: &str, visit_id: &str, fields: &[NoteField]) -> Result<FillReport> {
        if self.is_offline() {
            return Ok(FillReport::all_filled(fields));
        }
        let result = self.perform_autofill(patient_key, visit_id, fields).await;
        self.observe(&result);
        match &result {
            Ok(report) => info!(
                "Autofilled note {} for patient {} ({} filled, {} skipped)",
                visit_id,
                patient_key,
                report.filled.len(),
                report.skipped.len()
            ),
            Err(e) => warn!("Autofill failed for patient {} visit {}: {}", patient_key, visit_id, e),
        }
        result
    }

    /// 签署访视记录，手写签名失败时改用"患者无法签名"
    pub async fn sign_note(
        &mut self,
        patient_key: &str,
        visit_id: &str,
        signature: Option<&Signature>,
        method: SignMethod,
    ) -> Result<SignReport> {
        if self.is_offline() {
            return Ok(SignReport {
                method_used: method,
                fell_back: false,
            });
        }
        let result = self.perform_sign(patient_key, visit_id, signature, method).await;
        self.observe(&result);
        match &result {
            Ok(report) => info!(
                "Signed note {} for patient {} using {:?}",
                visit_id, patient_key, report.method_used
            ),
            Err(e) => warn!("Signing failed for patient {} visit {}: {}", patient_key, visit_id, e),
        }
        result
    }

    /// 修改患者位置
    pub async fn change_location(&mut self, patient_key: &str, data: &[NoteField]) -> Result<FillReport> {
        if self.is_offline() {
            return Ok(FillReport::all_filled(data));
        }
        let result = self.perform_location_change(patient_key, data).await;
        self.observe(&result);
        if let Err(e) = &result {
            warn!("Location change failed for patient {}: {}", patient_key, e);
        }
        result
    }

    /// 存活探测，结果同时更新缓存的连接状态
    pub async fn check_connection(&mut self) -> bool {
        if self.is_offline() {
            return true;
        }
        let driver = match &self.driver {
            Some(driver) => driver,
            None => return false,
        };

        match driver.current_url().await {
            Ok(url) => {
                debug!("Portal probe ok ({})", url);
                self.state = ConnectionState::Connected;
                true
            }
            Err(e) => {
                if self.state != ConnectionState::Disconnected {
                    warn!("Portal probe failed: {}", e);
                }
                self.state = ConnectionState::Disconnected;
                self.authenticated = false;
                false
            }
        }
    }

    /// 关闭浏览器会话
    pub async fn disconnect(&mut self) {
        if self.is_offline() {
            return;
        }
        if let Some(driver) = &self.driver {
            if self.state != ConnectionState::Disconnected {
                if let Err(e) = driver.quit().await {
                    warn!("Failed to close portal session cleanly: {}", e);
                }
                info!("Portal session closed");
            }
        }
        self.state = ConnectionState::Disconnected;
        self.authenticated = false;
    }

    fn observe<T>(&mut self, result: &Result<T>) {
        if let Err(PilotError::ConnectionLost(reason)) = result {
            warn!("Portal connection lost: {}", reason);
            self.state = ConnectionState::Disconnected;
            self.authenticated = false;
        }
    }

    fn driver(&self) -> Result<&dyn PortalDriver> {
        match (&self.driver, self.state) {
            (Some(driver), ConnectionState::Connected) => Ok(driver.as_ref()),
            _ => Err(PilotError::ConnectionLost("portal session is not connected".to_string())),
        }
    }

    async fn perform_login(&self, credential: &Credential) -> Result<()> {
        let driver = self.driver()?;
        let selectors = &self.config.selectors;

        driver.navigate(&self.config.login_url()).await?;
        self.wait_for_marker(driver, &selectors.username).await?;
        Self::type_into(driver, &selectors.username, &credential.username).await?;
        Self::type_into(driver, &selectors.password, &credential.password).await?;
        Self::click_first(driver, &selectors.login_submit).await?;
        self.wait_for_marker(driver, &selectors.dashboard).await?;
        Ok(())
    }

    async fn read_patients(&self) -> Result<Vec<PatientRecord>> {
        let driver = self.driver()?;
        let selectors = &self.config.selectors;

        driver.navigate(&self.config.patients_url()).await?;
        self.wait_for_marker(driver, &selectors.patient_table).await?;
        let rows = driver.find_elements(&selectors.patient_rows.join(", ")).await?;

        let mut patients = Vec::with_capacity(rows.len());
        for (index, row) in rows.iter().enumerate() {
            match self.extract_patient(driver, row).await {
                Ok(patient) => patients.push(patient),
                Err(PilotError::ConnectionLost(reason)) => return Err(PilotError::ConnectionLost(reason)),
                Err(e) => warn!("Skipping patient row {}: {}", index, e),
            }
        }

        info!("Fetched {} patients from portal", patients.len());
        Ok(patients)
    }

    async fn extract_patient(&self, driver: &dyn PortalDriver, row: &ElementRef) -> Result<PatientRecord> {
        let selectors = &self.config.selectors;
        let patient_key = Self::first_attribute(driver, row, &selectors.patient_key_attributes)
            .await?
            .ok_or_else(|| PilotError::ElementNotFound("patient key attribute".to_string()))?;
        let name = Self::child_text(driver, row, &selectors.patient_name)
            .await?
            .ok_or_else(|| PilotError::ElementNotFound(format!("name for patient {}", patient_key)))?;

        Ok(PatientRecord {
            name,
            dob: Self::child_text(driver, row, &selectors.patient_dob).await?,
            address: Self::child_text(driver, row, &selectors.patient_address).await?,
            phone: Self::child_text(driver, row, &selectors.patient_phone).await?,
            status: Self::child_text(driver, row, &selectors.patient_status).await?,
            patient_key,
        })
    }

    async fn read_visits(&self, patient_key: &str) -> Result<Vec<Visit>> {
        let driver = self.driver()?;
        let selectors = &self.config.selectors;

        driver.navigate(&self.config.visits_url(patient_key)).await?;
        self.wait_for_marker(driver, &selectors.visits_table).await?;
        let rows = driver.find_elements(&selectors.visit_rows.join(", ")).await?;

        let mut visits = Vec::with_capacity(rows.len());
        for (index, row) in rows.iter().enumerate() {
            let visit_id = match Self::first_attribute(driver, row, &selectors.visit_id_attributes).await? {
                Some(id) => id,
                None => {
                    warn!("Skipping visit row {} for patient {}: no visit id", index, patient_key);
                    continue;
                }
            };
            let date = Self::child_text(driver, row, &selectors.visit_date).await?.unwrap_or_default();
            let status = Self::child_text(driver, row, &selectors.visit_status)
                .await?
                .map(|label| VisitStatus::from_label(&label))
                .unwrap_or(VisitStatus::Other);
            visits.push(Visit { visit_id, date, status });
        }

        debug!("Fetched {} visits for patient {}", visits.len(), patient_key);
        Ok(visits)
    }

    async fn perform_autofill(&self, patient_key: &str, visit_id: &str, fields: &[NoteField]) -> Result<FillReport> {
        let driver = self.driver()?;
        let selectors = &self.config.selectors;

        driver.navigate(&self.config.note_url(patient_key, visit_id)).await?;
        self.wait_for_marker(driver, &selectors.note_form).await?;
        Self::fill_fields(driver, &selectors.field_candidates, fields).await
    }

    async fn perform_sign(
        &self,
        patient_key: &str,
        visit_id: &str,
        signature: Option<&Signature>,
        method: SignMethod,
    ) -> Result<SignReport> {
        let driver = self.driver()?;
        let selectors = &self.config.selectors;

        driver.navigate(&self.config.sign_url(patient_key, visit_id)).await?;
        self.wait_for_marker(driver, &selectors.sign_form).await?;

        let mut method_used = method;
        if method == SignMethod::DrawSignature {
            match signature.filter(|s| !s.is_blank()) {
                Some(signature) => {
                    let outcome = self
                        .gesture
                        .replay(driver, &selectors.signature_canvas, &signature.strokes)
                        .await;
                    if !outcome.succeeded() {
                        warn!("Signature replay did not complete ({:?}), falling back to patient unable", outcome);
                        method_used = SignMethod::PatientUnable;
                    }
                }
                None => {
                    warn!("No signature strokes available, falling back to patient unable");
                    method_used = SignMethod::PatientUnable;
                }
            }
        }

        if method_used == SignMethod::PatientUnable {
            let option = ElementResolver::resolve(driver, &selectors.patient_unable, false).await?;
            let toggled = match driver.is_selected(&option.element).await {
                Ok(true) => Ok(()),
                Ok(false) => driver.click(&option.element).await,
                Err(e) => Err(e),
            };
            ElementResolver::release(driver).await;
            toggled?;
        }

        Self::click_first(driver, &selectors.sign_submit).await?;
        self.wait_for_marker(driver, &selectors.confirmation).await?;

        Ok(SignReport {
            method_used,
            fell_back: method_used != method,
        })
    }

    async fn perform_location_change(&self, patient_key: &str, data: &[NoteField]) -> Result<FillReport> {
        let driver = self.driver()?;
        let selectors = &self.config.selectors;

        driver.navigate(&self.config.location_url(patient_key)).await?;
        self.wait_for_marker(driver, &selectors.location_form).await?;
        let report = Self::fill_fields(driver, &selectors.location_field_candidates, data).await?;
        Self::click_first(driver, &selectors.location_submit).await?;
        Ok(report)
    }

    /// 轮询直到任一标记出现或超时
    async fn wait_for_marker(&self, driver: &dyn PortalDriver, candidates: &[String]) -> Result<ElementRef> {
        let group = candidates.join(", ");
        let deadline = Instant::now() + self.config.wait_timeout();

        loop {
            match driver.find_elements(&group).await {
                Ok(found) => {
                    if let Some(element) = found.into_iter().next() {
                        return Ok(element);
                    }
                }
                Err(PilotError::ElementNotFound(_)) => {}
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Err(PilotError::Timeout(format!(
                    "{} not present after {:?}",
                    group,
                    self.config.wait_timeout()
                )));
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// 逐个填写字段，单个字段失败记录后跳过
    async fn fill_fields(driver: &dyn PortalDriver, templates: &[String], fields: &[NoteField]) -> Result<FillReport> {
        let mut report = FillReport::default();

        for field in fields {
            let candidates = expand_field_candidates(templates, &field.name);
            let outcome = match ElementResolver::resolve(driver, &candidates, false).await {
                Ok(resolved) => {
                    let filled = Self::fill_element(driver, &resolved.element, &field.value).await;
                    ElementResolver::release(driver).await;
                    filled
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => report.filled.push(field.name.clone()),
                Err(PilotError::ConnectionLost(reason)) => return Err(PilotError::ConnectionLost(reason)),
                Err(e) => {
                    warn!("Skipping field {}: {}", field.name, e);
                    report.skipped.push(field.name.clone());
                }
            }
        }

        Ok(report)
    }

    async fn fill_element(driver: &dyn PortalDriver, element: &ElementRef, value: &FieldValue) -> Result<()> {
        let tag = driver.tag_name(element).await?.to_lowercase();
        match tag.as_str() {
            "select" => Self::choose_option(driver, element, &value.as_text()).await,
            "textarea" => Self::write_text(driver, element, &value.as_text()).await,
            _ => {
                let kind = driver.attribute(element, "type").await?.unwrap_or_default().to_lowercase();
                if kind == "checkbox" {
                    if driver.is_selected(element).await? != value.as_flag() {
                        driver.click(element).await?;
                    }
                    Ok(())
                } else {
                    Self::write_text(driver, element, &value.as_text()).await
                }
            }
        }
    }

    /// 先按显示文本选择，再按值选择
    async fn choose_option(driver: &dyn PortalDriver, select: &ElementRef, wanted: &str) -> Result<()> {
        let options = driver.find_child_elements(select, "option").await?;

        for option in &options {
            if driver.text(option).await?.trim() == wanted {
                return driver.click(option).await;
            }
        }
        for option in &options {
            if driver.attribute(option, "value").await?.as_deref() == Some(wanted) {
                return driver.click(option).await;
            }
        }

        Err(PilotError::ElementNotFound(format!("option {:?}", wanted)))
    }

    async fn write_text(driver: &dyn PortalDriver, element: &ElementRef, text: &str) -> Result<()> {
        driver.clear(element).await?;
        driver.send_keys(element, text).await
    }

    async fn type_into(driver: &dyn PortalDriver, candidates: &[String], text: &str) -> Result<()> {
        let resolved = ElementResolver::resolve(driver, candidates, true).await?;
        let written = Self::write_text(driver, &resolved.element, text).await;
        ElementResolver::release(driver).await;
        written
    }

    async fn click_first(driver: &dyn PortalDriver, candidates: &[String]) -> Result<()> {
        let resolved = ElementResolver::resolve(driver, candidates, true).await?;
        let clicked = driver.click(&resolved.element).await;
        ElementResolver::release(driver).await;
        clicked
    }

    async fn first_attribute(driver: &dyn PortalDriver, element: &ElementRef, names: &[String]) -> Result<Option<String>> {
        for name in names {
            if let Some(value) = driver.attribute(element, name).await? {
                let value = value.trim();
                if !value.is_empty() {
                    return Ok(Some(value.to_string()));
                }
            }
        }
        Ok(None)
    }

    async fn child_text(driver: &dyn PortalDriver, row: &ElementRef, candidates: &[String]) -> Result<Option<String>> {
        for selector in candidates {
            let found = driver.find_child_elements(row, selector).await?;
            if let Some(cell) = found.first() {
                let text = driver.text(cell).await?.trim().to_string();
                if !text.is_empty() {
                    return Ok(Some(text));
                }
            }
        }
        Ok(None)
    }
}

/// 会话句柄：所有工作流调用按 FIFO 顺序串行执行
#[derive(Debug, Clone)]
pub struct PortalHandle {
    inner: Arc<Mutex<PortalSession>>,
}

impl PortalHandle {
    pub fn new(session: PortalSession) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    /// 等待并独占会话直到返回的守卫被释放
    pub async fn lock(&self) -> MutexGuard<'_, PortalSession> {
        self.inner.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Rect;
    use crate::scripted::{DriverEvent, ScriptedDriver, ScriptedElement, ScriptedPage};
    use chartpilot_core::Point;

    const BASE: &str = "https://portal.example.com";

    fn url(path: &str) -> String {
        format!("{}{}", BASE, path)
    }

    fn credential() -> Credential {
        Credential {
            username: "nurse".to_string(),
            password: "pw".to_string(),
        }
    }

    fn login_page(dashboard_reachable: bool) -> ScriptedPage {
        let target = if dashboard_reachable { url("/dashboard") } else { url("/login-error") };
        ScriptedPage::new()
            .element(ScriptedElement::new("input").matching("#username"))
            .element(ScriptedElement::new("input").matching("#password").attr("type", "password"))
            .element(ScriptedElement::new("button").matching("button[type='submit']").navigates_to(target))
    }

    fn patient_row(key: Option<&str>, name: &str) -> ScriptedElement {
        let mut row = ScriptedElement::new("tr").matching("tr[data-patient]");
        if let Some(key) = key {
            row = row.attr("data-patient-key", key);
        }
        row.child(ScriptedElement::new("td").matching(".patient-name").text(name))
            .child(ScriptedElement::new("td").matching(".patient-dob").text("1990-02-03"))
    }

    fn visit_row(id: &str, status: &str) -> ScriptedElement {
        ScriptedElement::new("tr")
            .matching("tr[data-visit]")
            .attr("data-visit-id", id)
            .child(ScriptedElement::new("td").matching(".visit-date").text("2024-07-26"))
            .child(ScriptedElement::new("td").matching(".visit-status").text(status))
    }

    fn sign_page(with_canvas: bool, confirm: bool) -> ScriptedPage {
        sign_form(with_canvas, confirm, false)
    }

    /// 签名页节点顺序：表单 node-0、patient_unable node-1、提交按钮 node-2
    fn sign_form(with_canvas: bool, confirm: bool, unable_preselected: bool) -> ScriptedPage {
        let submit_target = if confirm { url("/signed") } else { url("/still-signing") };
        let mut page = ScriptedPage::new().element(
            ScriptedElement::new("div")
                .matching(".signature-form")
                .child(
                    ScriptedElement::checkbox()
                        .matching("#patient_unable")
                        .selected(unable_preselected),
                )
                .child(
                    ScriptedElement::new("button")
                        .matching("button[type='submit']")
                        .navigates_to(submit_target),
                ),
        );
        if with_canvas {
            page = page.frame(vec![ScriptedElement::new("canvas").matching("#signatureCanvas").rect(Rect {
                x: 10.0,
                y: 10.0,
                width: 300.0,
                height: 100.0,
            })]);
        }
        page
    }

    fn portal(sign: ScriptedPage) -> ScriptedDriver {
        ScriptedDriver::new()
            .with_page(url("/login"), login_page(true))
            .with_page(url("/dashboard"), ScriptedPage::new().element(ScriptedElement::new("div").matching(".dashboard")))
            .with_page(
                url("/patients"),
                ScriptedPage::new().element(
                    ScriptedElement::new("table")
                        .matching(".patient-table")
                        .child(patient_row(Some("p1"), "Alice Smith"))
                        .child(patient_row(None, "Broken Row"))
                        .child(patient_row(Some("p2"), "Bob Jones")),
                ),
            )
            .with_page(
                url("/patients/p1/visits"),
                ScriptedPage::new().element(
                    ScriptedElement::new("table")
                        .matching(".visits-table")
                        .child(visit_row("v1", "Unsigned"))
                        .child(visit_row("v2", "Signed"))
                        .child(visit_row("v3", "Missed")),
                ),
            )
            .with_page(
                url("/patients/p1/visits/v1/note"),
                ScriptedPage::new().element(
                    ScriptedElement::new("form")
                        .matching(".note-form")
                        .child(ScriptedElement::new("input").matching("#bp").attr("value", "old"))
                        .child(ScriptedElement::new("textarea").matching("[name='narrative']"))
                        .child(ScriptedElement::checkbox().matching("[data-field='homebound']"))
                        .child(ScriptedElement::checkbox().matching("#fall_risk").selected(true))
                        .child(
                            ScriptedElement::new("select")
                                .matching(".mood")
                                .child(ScriptedElement::option("Calm", "calm"))
                                .child(ScriptedElement::option("Anxious", "anxious")),
                        ),
                ),
            )
            .with_page(url("/patients/p1/visits/v1/sign"), sign)
            .with_page(url("/signed"), ScriptedPage::new().element(ScriptedElement::new("div").matching(".success")))
    }

    /// 最近一次进入签名页之后点击过的元素
    fn clicks_on_sign_page(driver: &ScriptedDriver) -> Vec<String> {
        let events = driver.events();
        let entered = DriverEvent::Navigated(url("/patients/p1/visits/v1/sign"));
        let start = events.iter().rposition(|e| *e == entered).map_or(0, |i| i + 1);
        events[start..]
            .iter()
            .filter_map(|e| match e {
                DriverEvent::Clicked(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    async fn connected(driver: &ScriptedDriver) -> PortalSession {
        let mut session = PortalSession::with_environment(Box::new(driver.clone()), PortalConfig::default(), |_| None);
        session.connect().await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_restricted_runtime_is_offline_and_deterministic() {
        let driver = ScriptedDriver::new();
        let mut session = PortalSession::with_environment(Box::new(driver.clone()), PortalConfig::default(), |name| {
            (name == "RAILWAY_ENVIRONMENT").then(|| "production".to_string())
        });

        assert_eq!(session.state(), ConnectionState::OfflineMock);
        let first = session.fetch_patients().await.unwrap();
        let second = session.fetch_patients().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].patient_key, "demo_001");

        assert!(session.login(&credential()).await.is_ok());
        assert!(session.check_connection().await);
        assert!(driver.events().is_empty());
    }

    #[tokio::test]
    async fn test_failed_connect_stays_disconnected() {
        let driver = ScriptedDriver::new();
        driver.fail_start(true);
        let mut session = PortalSession::with_environment(Box::new(driver), PortalConfig::default(), |_| None);

        assert!(session.connect().await.is_err());
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_auto_connects() {
        let driver = portal(sign_page(true, true));
        let mut session = PortalSession::with_environment(Box::new(driver.clone()), PortalConfig::default(), |_| None);

        session.login(&credential()).await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(session.is_authenticated());
        assert_eq!(driver.current_page(), Some(url("/dashboard")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_without_dashboard_fails() {
        let driver = portal(sign_page(true, true));
        driver.add_page(url("/login"), login_page(false));
        let mut session = connected(&driver).await;

        let result = session.login(&credential()).await;
        assert!(matches!(result, Err(PilotError::LoginFailed(_))));
        assert!(!session.is_authenticated());
        assert!(session.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_patients_skips_broken_rows() {
        let driver = portal(sign_page(true, true));
        let mut session = connected(&driver).await;

        let patients = session.fetch_patients().await.unwrap();
        let keys: Vec<&str> = patients.iter().map(|p| p.patient_key.as_str()).collect();
        assert_eq!(keys, vec!["p1", "p2"]);
        assert_eq!(patients[0].name, "Alice Smith");
        assert_eq!(patients[0].dob.as_deref(), Some("1990-02-03"));
        assert_eq!(patients[0].phone, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_visits_derives_signable() {
        let driver = portal(sign_page(true, true));
        let mut session = connected(&driver).await;

        let visits = session.fetch_visits("p1").await.unwrap();
        assert_eq!(visits.len(), 3);
        for visit in &visits {
            assert_eq!(visit.signable(), visit.status == VisitStatus::Unsigned);
        }
        assert!(visits[0].signable());
        assert_eq!(visits[2].status, VisitStatus::Other);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_marker_times_out() {
        let driver = portal(sign_page(true, true));
        let mut session = connected(&driver).await;

        let result = session.fetch_visits("unknown").await;
        assert!(matches!(result, Err(PilotError::Timeout(_))));
        assert!(session.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_autofill_fills_by_element_type() {
        let driver = portal(sign_page(true, true));
        let mut session = connected(&driver).await;

        let fields = vec![
            NoteField::new("bp", "120/80"),
            NoteField::new("narrative", "Patient resting"),
            NoteField::new("homebound", true),
            NoteField::new("fall_risk", true),
            NoteField::new("mood", "anxious"),
            NoteField::new("missing_field", "x"),
        ];
        let report = session.autofill_note("p1", "v1", &fields).await.unwrap();

        assert_eq!(report.filled, vec!["bp", "narrative", "homebound", "fall_risk", "mood"]);
        assert_eq!(report.skipped, vec!["missing_field"]);
        assert_eq!(driver.value_of("#bp").as_deref(), Some("120/80"));
        assert_eq!(driver.value_of("[name='narrative']").as_deref(), Some("Patient resting"));
        assert_eq!(driver.is_checked("[data-field='homebound']"), Some(true));
        // 已选中的复选框不会被再次点击
        assert_eq!(driver.is_checked("#fall_risk"), Some(true));
        assert_eq!(driver.value_of(".mood").as_deref(), Some("anxious"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_with_drawn_signature() {
        let driver = portal(sign_page(true, true));
        let mut session = connected(&driver).await;
        let signature = Signature::new(vec![vec![Point(1.0, 1.0), Point(2.0, 3.0)]]);

        let report = session
            .sign_note("p1", "v1", Some(&signature), SignMethod::DrawSignature)
            .await
            .unwrap();
        assert_eq!(report.method_used, SignMethod::DrawSignature);
        assert!(!report.fell_back);
        assert_eq!(driver.pointer_events().len(), 3);
        assert_eq!(driver.current_page(), Some(url("/signed")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_falls_back_when_surface_missing() {
        let driver = portal(sign_page(false, true));
        let mut session = connected(&driver).await;
        let signature = Signature::new(vec![vec![Point(1.0, 1.0)]]);

        let report = session
            .sign_note("p1", "v1", Some(&signature), SignMethod::DrawSignature)
            .await
            .unwrap();
        assert_eq!(report.method_used, SignMethod::PatientUnable);
        assert!(report.fell_back);
        assert!(driver.pointer_events().is_empty());
        assert_eq!(clicks_on_sign_page(&driver), vec!["node-1", "node-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preselected_patient_unable_is_not_clicked() {
        let driver = portal(sign_form(false, true, true));
        let mut session = connected(&driver).await;

        let report = session.sign_note("p1", "v1", None, SignMethod::PatientUnable).await.unwrap();
        assert_eq!(report.method_used, SignMethod::PatientUnable);
        assert!(!report.fell_back);
        assert_eq!(clicks_on_sign_page(&driver), vec!["node-2"]);
        assert_eq!(driver.current_page(), Some(url("/signed")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_without_confirmation_fails() {
        let driver = portal(sign_page(true, false));
        let mut session = connected(&driver).await;

        let result = session.sign_note("p1", "v1", None, SignMethod::PatientUnable).await;
        assert!(matches!(result, Err(PilotError::Timeout(_))));
        assert_eq!(clicks_on_sign_page(&driver), vec!["node-1", "node-2"]);
        assert_eq!(driver.is_checked("#patient_unable"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_flips_state() {
        let driver = portal(sign_page(true, true));
        let mut session = connected(&driver).await;
        session.login(&credential()).await.unwrap();

        assert!(session.check_connection().await);
        driver.fail_probe(true);
        assert!(!session.check_connection().await);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.is_authenticated());

        let result = session.fetch_patients().await;
        assert!(matches!(result, Err(PilotError::ConnectionLost(_))));
    }

    #[tokio::test]
    async fn test_disconnect_quits_driver() {
        let driver = ScriptedDriver::new();
        let mut session = connected(&driver).await;
        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(driver.events().last(), Some(&DriverEvent::Quit));
    }

    #[tokio::test]
    async fn test_handle_serializes_access() {
        let handle = PortalHandle::new(PortalSession::offline(PortalConfig::default()));
        let guard = handle.lock().await;
        let other = handle.clone();
        let waiter = tokio::spawn(async move { other.lock().await.state() });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(guard);
        assert_eq!(waiter.await.unwrap(), ConnectionState::OfflineMock);
    }
}
