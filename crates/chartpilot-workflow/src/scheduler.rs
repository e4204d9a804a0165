//! 任务调度器
//!
//! 周期查询到期任务，通过门户会话逐个执行，并把结果写回存储。
//! 终态更新以 `status = scheduled` 为条件，执行期间被取消的任务保持取消状态。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chartpilot_admin::AlertSystem;
use chartpilot_core::{PeriodicWorker, PilotError, Result, ScheduledTask, TaskPayload, TaskStatus};
use chartpilot_database::TaskStore;
use chartpilot_integration::{LiveEvent, NotificationManager, TaskNotifier, SYSTEM_USER};
use chartpilot_portal::{PortalHandle, PortalSession};
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::state_machine::{TaskEvent, TaskStateMachine};

/// 失败率统计窗口
const OUTCOME_WINDOW_SECS: i64 = 3600;

/// 单次轮询结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// 本轮执行的任务数
    pub executed: usize,
    pub completed: usize,
    pub failed: usize,
    /// 执行期间被取消或已由其他执行方处理的任务数
    pub superseded: usize,
}

/// 任务调度器
pub struct TaskScheduler {
    store: Arc<dyn TaskStore>,
    portal: PortalHandle,
    notifications: Arc<NotificationManager>,
    notifier: TaskNotifier,
    alerts: Option<Arc<AlertSystem>>,
    state_machine: TaskStateMachine,
    /// 最近一小时的执行结果 (时间, 是否成功)
    outcomes: Mutex<VecDeque<(DateTime<Utc>, bool)>>,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("alerts_enabled", &self.alerts.is_some())
            .finish()
    }
}

impl TaskScheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        portal: PortalHandle,
        notifications: Arc<NotificationManager>,
        alerts: Option<Arc<AlertSystem>>,
    ) -> Self {
        Self {
            store,
            portal,
            notifier: TaskNotifier::new(notifications.clone()),
            notifications,
            alerts,
            state_machine: TaskStateMachine::new(),
            outcomes: Mutex::new(VecDeque::new()),
        }
    }

    /// 轮询直到取消；轮询出错后等待 `backoff` 再继续
    pub async fn run(self: Arc<Self>, interval: Duration, backoff: Duration, shutdown: CancellationToken) -> u64 {
        let worker = PeriodicWorker::new("task-scheduler", interval, backoff, shutdown);
        worker
            .run(|| {
                let scheduler = self.clone();
                async move { scheduler.poll_once(Utc::now()).await.map(|_| ()) }
            })
            .await
    }

    /// 执行所有到期任务，只有存储错误会返回 `Err`
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<PollSummary> {
        let due = self.store.due_tasks(now).await?;
        let mut summary = PollSummary::default();
        if due.is_empty() {
            debug!("No due tasks");
            return Ok(summary);
        }
        info!("Found {} due tasks", due.len());

        for task in due {
            let run = run_exclusive(
                self.store.as_ref(),
                &self.portal,
                &self.state_machine,
                &self.notifications,
                &self.notifier,
                task.task_id,
            )
            .await?;

            match run {
                TaskRun::Skipped(status) => {
                    debug!("Task {} is no longer scheduled ({:?}), skipped", task.task_id, status);
                    summary.superseded += 1;
                    continue;
                }
                TaskRun::Finished { status, .. } => match status {
                    Some(TaskStatus::Completed) => summary.completed += 1,
                    Some(_) => summary.failed += 1,
                    None => summary.superseded += 1,
                },
            }
            summary.executed += 1;
        }

        let settled = summary.completed + summary.failed;
        if settled > 0 {
            self.notifier
                .notify_batch_complete(SYSTEM_USER, summary.completed, settled)
                .await;
            self.record_outcomes(now, summary.completed, summary.failed).await;
        }

        info!(
            "Poll finished: {} completed, {} failed, {} superseded",
            summary.completed, summary.failed, summary.superseded
        );
        Ok(summary)
    }

    async fn record_outcomes(&self, now: DateTime<Utc>, completed: usize, failed: usize) {
        let (rate, executed) = {
            let mut outcomes = self.outcomes.lock().await;
            outcomes.extend(std::iter::repeat((now, true)).take(completed));
            outcomes.extend(std::iter::repeat((now, false)).take(failed));

            let cutoff = now - chrono::Duration::seconds(OUTCOME_WINDOW_SECS);
            while matches!(outcomes.front(), Some((at, _)) if *at < cutoff) {
                outcomes.pop_front();
            }

            let executed = outcomes.len();
            let failures = outcomes.iter().filter(|(_, ok)| !ok).count();
            (failures as f64 / executed.max(1) as f64, executed)
        };

        if let Some(alerts) = &self.alerts {
            let event = json!({
                "task_failure_rate": rate,
                "time_window": "last_hour",
                "executed_last_hour": executed,
            });
            alerts.check_alerts(&event).await;
        }
    }
}

/// 独占执行的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TaskRun {
    /// 取得门户锁时任务已不处于 scheduled，未执行；携带当前状态
    Skipped(Option<TaskStatus>),
    /// 已执行；`status` 为 `None` 表示执行期间被取消
    Finished {
        status: Option<TaskStatus>,
        error: Option<String>,
    },
}

/// 持有门户锁完成 "确认状态、执行、写回" 全过程，同一任务不会被执行两次
pub(crate) async fn run_exclusive(
    store: &dyn TaskStore,
    portal: &PortalHandle,
    state_machine: &TaskStateMachine,
    notifications: &NotificationManager,
    notifier: &TaskNotifier,
    task_id: Uuid,
) -> Result<TaskRun> {
    let mut session = portal.lock().await;

    let task = match store.get_task(task_id).await? {
        Some(task) if task.status == TaskStatus::Scheduled => task,
        other => return Ok(TaskRun::Skipped(other.map(|t| t.status))),
    };

    notifier
        .notify_started(SYSTEM_USER, &task.patient_key, task.task_type())
        .await;
    let outcome = execute_task(&mut session, &task).await;
    let error = outcome.as_ref().err().map(|e| e.to_string());
    let status = finish_task(store, state_machine, notifications, notifier, &task, outcome).await?;
    drop(session);

    Ok(TaskRun::Finished { status, error })
}

/// 按载荷类型在会话上执行任务，不负责登录
pub(crate) async fn execute_task(session: &mut PortalSession, task: &ScheduledTask) -> Result<()> {
    if !session.is_connected() {
        return Err(PilotError::ConnectionLost("portal session is not connected".to_string()));
    }

    match &task.payload {
        TaskPayload::Sign(payload) => {
            let report = session
                .sign_note(&task.patient_key, &payload.visit_id, payload.signature.as_ref(), payload.method)
                .await?;
            if report.fell_back {
                info!("Task {} signed with fallback method {:?}", task.task_id, report.method_used);
            }
            Ok(())
        }
        TaskPayload::Autofill(payload) => {
            let report = session
                .autofill_note(&task.patient_key, &payload.visit_id, &payload.fields)
                .await?;
            if !report.skipped.is_empty() {
                warn!(
                    "Task {} filled {} fields, skipped: {}",
                    task.task_id,
                    report.filled.len(),
                    report.skipped.join(", ")
                );
            }
            Ok(())
        }
    }
}

/// 条件写回终态，成功写入后发送实时事件和任务通知
pub(crate) async fn finish_task(
    store: &dyn TaskStore,
    state_machine: &TaskStateMachine,
    notifications: &NotificationManager,
    notifier: &TaskNotifier,
    task: &ScheduledTask,
    outcome: Result<()>,
) -> Result<Option<TaskStatus>> {
    let error = outcome.err().map(|e| e.to_string());
    let target = state_machine.transition(TaskStatus::Scheduled, TaskEvent::from_outcome(error.is_none()))?;

    let applied = store
        .transition_task(task.task_id, TaskStatus::Scheduled, target, error.as_deref())
        .await?;
    if !applied {
        info!("Task {} left scheduled state during execution, result discarded", task.task_id);
        return Ok(None);
    }

    let task_type = task.task_type();
    notifications.live().broadcast(LiveEvent::TaskCompleted {
        task_id: task.task_id,
        task_type,
        status: target,
        error: error.clone(),
    });

    match &error {
        None => {
            info!("Task {} ({}) completed", task.task_id, task_type);
            notifier.notify_completed(SYSTEM_USER, &task.patient_key, task_type).await;
        }
        Some(reason) => {
            warn!("Task {} ({}) failed: {}", task.task_id, task_type, reason);
            notifier
                .notify_failed(SYSTEM_USER, &task.patient_key, task_type, reason)
                .await;
        }
    }

    Ok(Some(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartpilot_admin::{AlertRule, Condition, Predicate};
    use chartpilot_core::{AutofillPayload, NoteField, SignMethod, SignPayload};
    use chartpilot_database::MemoryTaskStore;
    use chartpilot_integration::LiveHub;
    use chartpilot_portal::{PortalConfig, ScriptedDriver, ScriptedElement, ScriptedPage};

    struct Fixture {
        scheduler: TaskScheduler,
        store: Arc<MemoryTaskStore>,
        notifications: Arc<NotificationManager>,
    }

    fn fixture(session: PortalSession, alerts: bool) -> Fixture {
        let store = Arc::new(MemoryTaskStore::new());
        let notifications = Arc::new(NotificationManager::new(Arc::new(LiveHub::default()), None, 100));
        let alerts = if alerts {
            let system = AlertSystem::new(notifications.clone(), Duration::from_secs(1)).unwrap();
            Some(Arc::new(system))
        } else {
            None
        };
        let scheduler = TaskScheduler::new(store.clone(), PortalHandle::new(session), notifications.clone(), alerts);
        Fixture {
            scheduler,
            store,
            notifications,
        }
    }

    fn offline() -> PortalSession {
        PortalSession::offline(PortalConfig::default())
    }

    fn sign_task(run_at: DateTime<Utc>) -> ScheduledTask {
        let payload = TaskPayload::Sign(SignPayload {
            visit_id: "visit_001".to_string(),
            method: SignMethod::PatientUnable,
            signature: None,
        });
        ScheduledTask::new("demo_001", run_at, payload).unwrap()
    }

    fn autofill_task(run_at: DateTime<Utc>) -> ScheduledTask {
        let payload = TaskPayload::Autofill(AutofillPayload {
            visit_id: "visit_001".to_string(),
            fields: vec![NoteField::new("vitals", "stable")],
        });
        ScheduledTask::new("demo_002", run_at, payload).unwrap()
    }

    #[tokio::test]
    async fn test_due_task_completes_within_one_poll() {
        let f = fixture(offline(), false);
        let mut live = f.notifications.live().subscribe("operator");
        let now = Utc::now();
        let task = sign_task(now - chrono::Duration::minutes(1));
        f.store.insert_task(&task).await.unwrap();

        let summary = f.scheduler.poll_once(now).await.unwrap();
        assert_eq!(summary.executed, 1);
        assert_eq!(summary.completed, 1);

        let stored = f.store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);

        let event = live.try_recv().unwrap();
        assert_eq!(
            event,
            LiveEvent::TaskCompleted {
                task_id: task.task_id,
                task_type: chartpilot_core::TaskType::Sign,
                status: TaskStatus::Completed,
                error: None,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_autofill_with_unmatched_fields_still_completes() {
        let driver = ScriptedDriver::new().with_page(
            "https://portal.example.com/patients/demo_002/visits/visit_001/note",
            ScriptedPage::new().element(ScriptedElement::new("form").matching(".note-form")),
        );
        let mut session = PortalSession::with_environment(Box::new(driver), PortalConfig::default(), |_| None);
        session.connect().await.unwrap();
        let f = fixture(session, false);
        let now = Utc::now();
        let task = autofill_task(now);
        f.store.insert_task(&task).await.unwrap();

        let summary = f.scheduler.poll_once(now).await.unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 0);

        let stored = f.store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.last_error, None);
    }

    #[tokio::test]
    async fn test_task_no_longer_scheduled_is_skipped_under_lock() {
        let f = fixture(offline(), false);
        let now = Utc::now();
        let task = sign_task(now);
        f.store.insert_task(&task).await.unwrap();
        f.store
            .transition_task(task.task_id, TaskStatus::Scheduled, TaskStatus::Completed, None)
            .await
            .unwrap();

        let run = run_exclusive(
            f.store.as_ref(),
            &f.scheduler.portal,
            &f.scheduler.state_machine,
            &f.notifications,
            &f.scheduler.notifier,
            task.task_id,
        )
        .await
        .unwrap();
        assert_eq!(run, TaskRun::Skipped(Some(TaskStatus::Completed)));
        assert!(f.notifications.get(None, 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_future_tasks_are_left_alone() {
        let f = fixture(offline(), false);
        let now = Utc::now();
        let task = autofill_task(now + chrono::Duration::hours(1));
        f.store.insert_task(&task).await.unwrap();

        let summary = f.scheduler.poll_once(now).await.unwrap();
        assert_eq!(summary, PollSummary::default());
        let stored = f.store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_disconnected_session_fails_task_with_reason() {
        let driver = ScriptedDriver::new();
        let session = PortalSession::with_environment(Box::new(driver), PortalConfig::default(), |_| None);
        let f = fixture(session, false);
        let mut live = f.notifications.live().subscribe("operator");
        let now = Utc::now();
        let task = autofill_task(now);
        f.store.insert_task(&task).await.unwrap();

        let summary = f.scheduler.poll_once(now).await.unwrap();
        assert_eq!(summary.failed, 1);

        let stored = f.store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.last_error.unwrap().contains("not connected"));

        match live.try_recv() {
            Some(LiveEvent::TaskCompleted { status, error, .. }) => {
                assert_eq!(status, TaskStatus::Failed);
                assert!(error.is_some());
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let titles: Vec<String> = f.notifications.get(None, 10).await.into_iter().map(|n| n.title).collect();
        assert!(titles.iter().any(|t| t == "Task Failed"));
    }

    #[tokio::test]
    async fn test_cancelled_task_keeps_cancelled_status() {
        let f = fixture(offline(), false);
        let now = Utc::now();
        let task = sign_task(now);
        f.store.insert_task(&task).await.unwrap();

        // 取消发生在执行之后、写回之前
        f.store
            .transition_task(task.task_id, TaskStatus::Scheduled, TaskStatus::Cancelled, None)
            .await
            .unwrap();
        let status = finish_task(
            f.store.as_ref(),
            &f.scheduler.state_machine,
            &f.notifications,
            &f.scheduler.notifier,
            &task,
            Ok(()),
        )
        .await
        .unwrap();
        assert_eq!(status, None);

        let stored = f.store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_failure_rate_feeds_alerts() {
        let driver = ScriptedDriver::new();
        let session = PortalSession::with_environment(Box::new(driver), PortalConfig::default(), |_| None);
        let f = fixture(session, true);
        let rule = AlertRule::new("failures")
            .when("task_failure_rate", Condition::Predicate(Predicate::gt(0.5)))
            .when("time_window", Condition::Equals(json!("last_hour")));
        if let Some(alerts) = &f.scheduler.alerts {
            alerts.add_rule(rule).await;
        }

        let now = Utc::now();
        f.store.insert_task(&sign_task(now)).await.unwrap();
        f.store.insert_task(&autofill_task(now)).await.unwrap();
        f.scheduler.poll_once(now).await.unwrap();

        let titles: Vec<String> = f.notifications.get(None, 20).await.into_iter().map(|n| n.title).collect();
        assert!(titles.iter().any(|t| t == "System Alert"));
    }

    #[tokio::test]
    async fn test_outcome_window_drops_old_results() {
        let f = fixture(offline(), false);
        let start = Utc::now();
        f.scheduler.record_outcomes(start, 0, 3).await;
        f.scheduler
            .record_outcomes(start + chrono::Duration::minutes(90), 2, 0)
            .await;

        let outcomes = f.scheduler.outcomes.lock().await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, ok)| *ok));
    }
}
