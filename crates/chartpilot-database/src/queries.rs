//! PostgreSQL 存储实现

use chartpilot_core::{Account, NewAccount, Patient, PilotError, Result, ScheduledTask, TaskStatus, Visit};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::connection::DatabasePool;
use crate::models::*;
use crate::store::TaskStore;

const UNIQUE_VIOLATION: &str = "23505";

/// PostgreSQL 任务存储
#[derive(Debug, Clone)]
pub struct PgTaskStore {
    pool: DatabasePool,
}

impl PgTaskStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        let pool = self.pool.pool();

        // 创建账户表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id UUID PRIMARY KEY,
                nickname VARCHAR(128) UNIQUE NOT NULL,
                username VARCHAR(255) NOT NULL,
                credential_blob TEXT NOT NULL,
                push_topic VARCHAR(255),
                signature_template TEXT,
                notifications_enabled BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )
        "#).execute(pool).await?;

        // 创建患者表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS patients (
                patient_key VARCHAR(128) PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                location TEXT,
                visits_data TEXT NOT NULL DEFAULT '[]',
                last_updated TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )
        "#).execute(pool).await?;

        // 创建计划任务表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                task_id UUID PRIMARY KEY,
                patient_key VARCHAR(128) NOT NULL,
                task_type VARCHAR(16) NOT NULL,
                run_at TIMESTAMP WITH TIME ZONE NOT NULL,
                status VARCHAR(16) NOT NULL DEFAULT 'scheduled',
                payload TEXT NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
                last_error TEXT
            )
        "#).execute(pool).await?;

        self.create_indexes().await?;

        tracing::info!("Database tables created successfully");
        Ok(())
    }

    /// 创建数据库索引
    async fn create_indexes(&self) -> Result<()> {
        let pool = self.pool.pool();

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_tasks_status_run_at ON scheduled_tasks(status, run_at)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_patient_key ON scheduled_tasks(patient_key)",
            "CREATE INDEX IF NOT EXISTS idx_patients_name ON patients(name)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql).execute(pool).await?;
        }

        tracing::info!("Database indexes created successfully");
        Ok(())
    }
}

fn convert_all<D, T>(rows: Vec<D>) -> Result<Vec<T>>
where
    T: TryFrom<D, Error = PilotError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[async_trait::async_trait]
impl TaskStore for PgTaskStore {
    // ========== 账户相关操作 ==========

    async fn insert_account(&self, account: NewAccount) -> Result<Account> {
        let signature_template = account
            .signature_template
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let row = sqlx::query_as::<_, DbAccount>(r#"
            INSERT INTO accounts (id, nickname, username, credential_blob, push_topic, signature_template, notifications_enabled, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
        "#)
        .bind(Uuid::new_v4())
        .bind(&account.nickname)
        .bind(&account.username)
        .bind(&account.credential_blob)
        .bind(&account.push_topic)
        .bind(signature_template)
        .bind(account.notifications_enabled)
        .bind(Utc::now())
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                PilotError::Validation(format!("nickname already exists: {}", account.nickname))
            }
            _ => PilotError::from(e),
        })?;

        Account::try_from(row)
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, DbAccount>("SELECT * FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;

        row.map(Account::try_from).transpose()
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query_as::<_, DbAccount>("SELECT * FROM accounts ORDER BY nickname")
            .fetch_all(self.pool.pool())
            .await?;

        convert_all(rows)
    }

    // ========== 患者相关操作 ==========

    async fn upsert_patient(&self, patient: &Patient) -> Result<()> {
        let visits_data = serde_json::to_string(&patient.visits)?;

        sqlx::query(r#"
            INSERT INTO patients (patient_key, name, location, visits_data, last_updated)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (patient_key) DO UPDATE SET name = EXCLUDED.name, last_updated = EXCLUDED.last_updated
        "#)
        .bind(&patient.patient_key)
        .bind(&patient.name)
        .bind(&patient.location)
        .bind(visits_data)
        .bind(patient.last_updated)
        .execute(self.pool.pool())
        .await?;

        Ok(())
    }

    async fn update_patient_visits(&self, patient_key: &str, visits: &[Visit]) -> Result<bool> {
        let visits_data = serde_json::to_string(visits)?;

        let result = sqlx::query("UPDATE patients SET visits_data = $1, last_updated = NOW() WHERE patient_key = $2")
            .bind(visits_data)
            .bind(patient_key)
            .execute(self.pool.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_patient_location(&self, patient_key: &str, location: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE patients SET location = $1, last_updated = NOW() WHERE patient_key = $2")
            .bind(location)
            .bind(patient_key)
            .execute(self.pool.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_patient(&self, patient_key: &str) -> Result<Option<Patient>> {
        let row = sqlx::query_as::<_, DbPatient>("SELECT * FROM patients WHERE patient_key = $1")
            .bind(patient_key)
            .fetch_optional(self.pool.pool())
            .await?;

        row.map(Patient::try_from).transpose()
    }

    async fn list_patients(&self) -> Result<Vec<Patient>> {
        let rows = sqlx::query_as::<_, DbPatient>("SELECT * FROM patients ORDER BY name")
            .fetch_all(self.pool.pool())
            .await?;

        convert_all(rows)
    }

    // ========== 计划任务相关操作 ==========

    async fn insert_task(&self, task: &ScheduledTask) -> Result<()> {
        let payload = serde_json::to_string(&task.payload)?;

        sqlx::query(r#"
            INSERT INTO scheduled_tasks (task_id, patient_key, task_type, run_at, status, payload, created_at, last_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#)
        .bind(task.task_id)
        .bind(&task.patient_key)
        .bind(task.task_type().as_str())
        .bind(task.run_at)
        .bind(task.status.as_str())
        .bind(payload)
        .bind(task.created_at)
        .bind(&task.last_error)
        .execute(self.pool.pool())
        .await?;

        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<ScheduledTask>> {
        let row = sqlx::query_as::<_, DbTask>("SELECT * FROM scheduled_tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(self.pool.pool())
            .await?;

        row.map(ScheduledTask::try_from).transpose()
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<ScheduledTask>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, DbTask>("SELECT * FROM scheduled_tasks WHERE status = $1 ORDER BY run_at")
                    .bind(status.as_str())
                    .fetch_all(self.pool.pool())
                    .await?
            }
            None => {
                sqlx::query_as::<_, DbTask>("SELECT * FROM scheduled_tasks ORDER BY run_at")
                    .fetch_all(self.pool.pool())
                    .await?
            }
        };

        convert_all(rows)
    }

    async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        let rows = sqlx::query_as::<_, DbTask>(
            "SELECT * FROM scheduled_tasks WHERE status = 'scheduled' AND run_at <= $1 ORDER BY run_at"
        )
        .bind(now)
        .fetch_all(self.pool.pool())
        .await?;

        convert_all(rows)
    }

    async fn transition_task(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE scheduled_tasks SET status = $1, last_error = $2 WHERE task_id = $3 AND status = $4"
        )
        .bind(to.as_str())
        .bind(error)
        .bind(task_id)
        .bind(from.as_str())
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 FROM scheduled_tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(self.pool.pool())
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(PilotError::NotFound(format!("task {}", task_id))),
        }
    }
}
