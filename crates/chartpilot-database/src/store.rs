//! 任务存储接口

use chartpilot_core::{Account, NewAccount, Patient, Result, ScheduledTask, TaskStatus, Visit};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// 账户、患者和计划任务的存储
///
/// 任务状态的唯一并发保护是 `transition_task` 的条件更新。
#[async_trait::async_trait]
pub trait TaskStore: Send + Sync {
    // ========== 账户 ==========

    /// 新建账户，昵称重复时返回验证错误
    async fn insert_account(&self, account: NewAccount) -> Result<Account>;

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>>;

    async fn list_accounts(&self) -> Result<Vec<Account>>;

    // ========== 患者 ==========

    /// 插入或更新患者姓名；已有的位置和访视快照保持不变
    async fn upsert_patient(&self, patient: &Patient) -> Result<()>;

    async fn update_patient_visits(&self, patient_key: &str, visits: &[Visit]) -> Result<bool>;

    async fn update_patient_location(&self, patient_key: &str, location: &str) -> Result<bool>;

    async fn get_patient(&self, patient_key: &str) -> Result<Option<Patient>>;

    async fn list_patients(&self) -> Result<Vec<Patient>>;

    // ========== 计划任务 ==========

    async fn insert_task(&self, task: &ScheduledTask) -> Result<()>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<ScheduledTask>>;

    /// 按执行时间排序
    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<ScheduledTask>>;

    /// 状态为 scheduled 且 run_at <= now 的任务
    async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>>;

    /// 仅当当前状态为 `from` 时更新，返回是否生效
    async fn transition_task(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool>;
}
