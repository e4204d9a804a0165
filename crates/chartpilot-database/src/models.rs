//! 数据库模型

use chartpilot_core::{Account, Patient, PilotError, Result, ScheduledTask, Signature, TaskPayload, Visit};
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

// 数据库表模型 - 使用FromRow trait用于SQL查询

/// 数据库账户表
#[derive(Debug, FromRow)]
pub struct DbAccount {
    pub id: Uuid,
    pub nickname: String,
    pub username: String,
    pub credential_blob: String,
    pub push_topic: Option<String>,
    pub signature_template: Option<String>, // JSON 格式的笔画
    pub notifications_enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbAccount> for Account {
    type Error = PilotError;

    fn try_from(db_account: DbAccount) -> Result<Self> {
        let signature_template = db_account
            .signature_template
            .as_deref()
            .map(serde_json::from_str::<Signature>)
            .transpose()?;

        Ok(Account {
            id: db_account.id,
            nickname: db_account.nickname,
            username: db_account.username,
            credential_blob: db_account.credential_blob,
            push_topic: db_account.push_topic,
            signature_template,
            notifications_enabled: db_account.notifications_enabled,
            created_at: db_account.created_at,
        })
    }
}

/// 数据库患者表
#[derive(Debug, FromRow)]
pub struct DbPatient {
    pub patient_key: String,
    pub name: String,
    pub location: Option<String>,
    pub visits_data: String, // JSON 格式的访视快照
    pub last_updated: DateTime<Utc>,
}

impl TryFrom<DbPatient> for Patient {
    type Error = PilotError;

    fn try_from(db_patient: DbPatient) -> Result<Self> {
        let visits: Vec<Visit> = serde_json::from_str(&db_patient.visits_data)?;
        Ok(Patient {
            patient_key: db_patient.patient_key,
            name: db_patient.name,
            location: db_patient.location,
            visits,
            last_updated: db_patient.last_updated,
        })
    }
}

/// 数据库计划任务表
#[derive(Debug, FromRow)]
pub struct DbTask {
    pub task_id: Uuid,
    pub patient_key: String,
    pub task_type: String,
    pub run_at: DateTime<Utc>,
    pub status: String,
    pub payload: String, // 带类型标签的 JSON
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl TryFrom<DbTask> for ScheduledTask {
    type Error = PilotError;

    fn try_from(db_task: DbTask) -> Result<Self> {
        let payload: TaskPayload = serde_json::from_str(&db_task.payload)?;
        if payload.task_type().as_str() != db_task.task_type {
            return Err(PilotError::Store(format!(
                "task {} has type {} but payload for {}",
                db_task.task_id,
                db_task.task_type,
                payload.task_type()
            )));
        }

        Ok(ScheduledTask {
            task_id: db_task.task_id,
            patient_key: db_task.patient_key,
            run_at: db_task.run_at,
            status: db_task.status.parse()?,
            payload,
            created_at: db_task.created_at,
            last_error: db_task.last_error,
        })
    }
}
