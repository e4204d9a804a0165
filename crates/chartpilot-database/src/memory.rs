//! 内存存储实现，用于测试和离线运行

use std::collections::HashMap;

use chartpilot_core::{Account, NewAccount, Patient, PilotError, Result, ScheduledTask, TaskStatus, Visit};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::TaskStore;

/// 内存任务存储
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    accounts: RwLock<HashMap<Uuid, Account>>,
    patients: RwLock<HashMap<String, Patient>>,
    tasks: RwLock<HashMap<Uuid, ScheduledTask>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert_account(&self, account: NewAccount) -> Result<Account> {
        let mut accounts = self.accounts.write().await;
        if accounts.values().any(|existing| existing.nickname == account.nickname) {
            return Err(PilotError::Validation(format!("nickname already exists: {}", account.nickname)));
        }

        let account = Account {
            id: Uuid::new_v4(),
            nickname: account.nickname,
            username: account.username,
            credential_blob: account.credential_blob,
            push_topic: account.push_topic,
            signature_template: account.signature_template,
            notifications_enabled: account.notifications_enabled,
            created_at: Utc::now(),
        };
        accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>> {
        Ok(self.accounts.read().await.get(&id).cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let mut accounts: Vec<Account> = self.accounts.read().await.values().cloned().collect();
        accounts.sort_by(|a, b| a.nickname.cmp(&b.nickname));
        Ok(accounts)
    }

    async fn upsert_patient(&self, patient: &Patient) -> Result<()> {
        let mut patients = self.patients.write().await;
        match patients.get_mut(&patient.patient_key) {
            Some(existing) => {
                existing.name = patient.name.clone();
                existing.last_updated = patient.last_updated;
            }
            None => {
                patients.insert(patient.patient_key.clone(), patient.clone());
            }
        }
        Ok(())
    }

    async fn update_patient_visits(&self, patient_key: &str, visits: &[Visit]) -> Result<bool> {
        let mut patients = self.patients.write().await;
        Ok(match patients.get_mut(patient_key) {
            Some(patient) => {
                patient.visits = visits.to_vec();
                patient.last_updated = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn update_patient_location(&self, patient_key: &str, location: &str) -> Result<bool> {
        let mut patients = self.patients.write().await;
        Ok(match patients.get_mut(patient_key) {
            Some(patient) => {
                patient.location = Some(location.to_string());
                patient.last_updated = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn get_patient(&self, patient_key: &str) -> Result<Option<Patient>> {
        Ok(self.patients.read().await.get(patient_key).cloned())
    }

    async fn list_patients(&self) -> Result<Vec<Patient>> {
        let mut patients: Vec<Patient> = self.patients.read().await.values().cloned().collect();
        patients.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(patients)
    }

    async fn insert_task(&self, task: &ScheduledTask) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.task_id) {
            return Err(PilotError::Store(format!("duplicate task id {}", task.task_id)));
        }
        tasks.insert(task.task_id, task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<ScheduledTask>> {
        Ok(self.tasks.read().await.get(&task_id).cloned())
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<ScheduledTask>> {
        let mut tasks: Vec<ScheduledTask> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|task| status.map_or(true, |s| task.status == s))
            .cloned()
            .collect();
        tasks.sort_by_key(|task| task.run_at);
        Ok(tasks)
    }

    async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        let mut due: Vec<ScheduledTask> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|task| task.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|task| task.run_at);
        Ok(due)
    }

    async fn transition_task(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task_id) {
            Some(task) if task.status == from => {
                task.status = to;
                task.last_error = error.map(str::to_string);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(PilotError::NotFound(format!("task {}", task_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartpilot_core::{AutofillPayload, NoteField, TaskPayload, VisitStatus};
    use chrono::Duration;

    fn new_account(nickname: &str) -> NewAccount {
        NewAccount {
            nickname: nickname.to_string(),
            username: "nurse".to_string(),
            credential_blob: "cHc=".to_string(),
            push_topic: None,
            signature_template: None,
            notifications_enabled: true,
        }
    }

    fn task_at(run_at: DateTime<Utc>) -> ScheduledTask {
        let payload = TaskPayload::Autofill(AutofillPayload {
            visit_id: "visit_001".to_string(),
            fields: vec![NoteField::new("bp", "120/80")],
        });
        ScheduledTask::new("demo_001", run_at, payload).unwrap()
    }

    #[tokio::test]
    async fn test_nickname_is_unique() {
        let store = MemoryTaskStore::new();
        store.insert_account(new_account("main")).await.unwrap();
        let result = store.insert_account(new_account("main")).await;
        assert!(matches!(result, Err(PilotError::Validation(_))));
        assert_eq!(store.list_accounts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_due_tasks_filters_status_and_time() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let past = task_at(now - Duration::minutes(5));
        let future = task_at(now + Duration::minutes(5));
        let cancelled = task_at(now - Duration::minutes(1));
        for task in [&past, &future, &cancelled] {
            store.insert_task(task).await.unwrap();
        }
        store
            .transition_task(cancelled.task_id, TaskStatus::Scheduled, TaskStatus::Cancelled, None)
            .await
            .unwrap();

        let due = store.due_tasks(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].task_id, past.task_id);
    }

    #[tokio::test]
    async fn test_transition_is_conditional() {
        let store = MemoryTaskStore::new();
        let task = task_at(Utc::now());
        store.insert_task(&task).await.unwrap();

        assert!(store
            .transition_task(task.task_id, TaskStatus::Scheduled, TaskStatus::Cancelled, None)
            .await
            .unwrap());
        // 已取消的任务不会被执行结果覆盖
        assert!(!store
            .transition_task(task.task_id, TaskStatus::Scheduled, TaskStatus::Completed, None)
            .await
            .unwrap());
        let stored = store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);

        assert!(store
            .transition_task(Uuid::new_v4(), TaskStatus::Scheduled, TaskStatus::Failed, Some("x"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_upsert_keeps_visits_and_location() {
        let store = MemoryTaskStore::new();
        let patient = Patient {
            patient_key: "demo_001".to_string(),
            name: "Demo Patient 1".to_string(),
            location: None,
            visits: vec![],
            last_updated: Utc::now(),
        };
        store.upsert_patient(&patient).await.unwrap();
        store
            .update_patient_visits(
                "demo_001",
                &[Visit {
                    visit_id: "visit_001".to_string(),
                    date: "2024-07-26".to_string(),
                    status: VisitStatus::Unsigned,
                }],
            )
            .await
            .unwrap();
        store.update_patient_location("demo_001", "Home").await.unwrap();

        let renamed = Patient {
            name: "Demo Patient One".to_string(),
            ..patient
        };
        store.upsert_patient(&renamed).await.unwrap();

        let stored = store.get_patient("demo_001").await.unwrap().unwrap();
        assert_eq!(stored.name, "Demo Patient One");
        assert_eq!(stored.visits.len(), 1);
        assert_eq!(stored.location.as_deref(), Some("Home"));
        assert!(!store.update_patient_location("nobody", "Home").await.unwrap());
    }
}
