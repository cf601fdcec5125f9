//! In-memory scheduler façade with real lease semantics.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use cadence_api::{
    ApiError, ApiResult, EndpointExecutionResult, ExecutionPlan, ExecutionStatus,
    ExecutionSummary, JobContext, Message, MessageContent, MessageRole, ScheduleDecision,
    SchedulerApi, TokenUsage,
};

/// Everything the store tracks for one job.
#[derive(Debug, Clone, Default)]
pub struct JobRecord {
    pub context: Option<JobContext>,
    pub locked: bool,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub due: bool,
    pub plans: Vec<ExecutionPlan>,
    pub results: Vec<Vec<EndpointExecutionResult>>,
    pub summaries: Vec<ExecutionSummary>,
    pub decisions: Vec<ScheduleDecision>,
    pub errors: Vec<(String, Option<String>)>,
    pub messages: Vec<Message>,
    pub token_usage: TokenUsage,
    pub execution_statuses: Vec<ExecutionStatus>,
    pub lock_count: u64,
    pub unlock_count: u64,
}

#[derive(Default)]
struct Store {
    jobs: HashMap<Uuid, JobRecord>,
    /// Job ids in insertion order, for deterministic batches.
    order: Vec<Uuid>,
    /// When set, the next matching operation fails transiently once.
    fail_once: Option<String>,
}

/// In-memory [`SchedulerApi`]. Lock acquisition is a compare-and-set under
/// one mutex, so two engines sharing a `MemoryApi` contend exactly like
/// they would against the real façade.
#[derive(Default)]
pub struct MemoryApi {
    store: Mutex<Store>,
}

impl MemoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job with its context; it becomes due immediately.
    pub fn insert_job(&self, context: JobContext) -> Uuid {
        let job_id = context.job.id;
        let mut store = self.store.lock().unwrap();
        store.order.push(job_id);
        store.jobs.insert(
            job_id,
            JobRecord {
                context: Some(context),
                due: true,
                ..Default::default()
            },
        );
        job_id
    }

    /// Register a job id with no context (simulates deletion after lock).
    pub fn insert_job_without_context(&self, job_id: Uuid) {
        let mut store = self.store.lock().unwrap();
        store.order.push(job_id);
        store.jobs.insert(
            job_id,
            JobRecord {
                due: true,
                ..Default::default()
            },
        );
    }

    /// Make the next operation named `op` fail transiently once.
    pub fn fail_once(&self, op: &str) {
        self.store.lock().unwrap().fail_once = Some(op.to_string());
    }

    /// Snapshot a job's record.
    pub fn record(&self, job_id: Uuid) -> JobRecord {
        self.store
            .lock()
            .unwrap()
            .jobs
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Mark a job due again, as the passage of time would.
    pub fn set_due(&self, job_id: Uuid) {
        let mut store = self.store.lock().unwrap();
        if let Some(record) = store.jobs.get_mut(&job_id) {
            record.due = true;
        }
    }

    /// Pre-acquire a lock, as another holder would.
    pub fn hold_lock(&self, job_id: Uuid, expires_at: DateTime<Utc>) {
        let mut store = self.store.lock().unwrap();
        if let Some(record) = store.jobs.get_mut(&job_id) {
            record.locked = true;
            record.lock_expires_at = Some(expires_at);
        }
    }

    fn take_failure(&self, op: &str) -> Option<ApiError> {
        let mut store = self.store.lock().unwrap();
        if store.fail_once.as_deref() == Some(op) {
            store.fail_once = None;
            return Some(ApiError::Network(format!("injected failure for {op}")));
        }
        None
    }

    fn with_job<T>(
        &self,
        job_id: Uuid,
        f: impl FnOnce(&mut JobRecord) -> T,
    ) -> ApiResult<T> {
        let mut store = self.store.lock().unwrap();
        match store.jobs.get_mut(&job_id) {
            Some(record) => Ok(f(record)),
            None => Err(ApiError::Status {
                status: 404,
                message: format!("job {job_id} not found"),
            }),
        }
    }
}

#[async_trait]
impl SchedulerApi for MemoryApi {
    async fn jobs_to_process(&self, limit: usize) -> ApiResult<Vec<Uuid>> {
        if let Some(err) = self.take_failure("jobs_to_process") {
            return Err(err);
        }
        let store = self.store.lock().unwrap();
        let now = Utc::now();
        Ok(store
            .order
            .iter()
            .filter(|id| {
                let Some(record) = store.jobs.get(id) else {
                    return false;
                };
                let lock_valid =
                    record.locked && record.lock_expires_at.is_some_and(|at| at > now);
                record.due && !lock_valid
            })
            .take(limit)
            .copied()
            .collect())
    }

    async fn lock_job(&self, job_id: Uuid, expires_at: DateTime<Utc>) -> ApiResult<bool> {
        if let Some(err) = self.take_failure("lock_job") {
            return Err(err);
        }
        let now = Utc::now();
        self.with_job(job_id, |record| {
            let lock_valid = record.locked && record.lock_expires_at.is_some_and(|at| at > now);
            if lock_valid {
                return false;
            }
            record.locked = true;
            record.lock_expires_at = Some(expires_at);
            record.lock_count += 1;
            true
        })
    }

    async fn unlock_job(&self, job_id: Uuid) -> ApiResult<bool> {
        if let Some(err) = self.take_failure("unlock_job") {
            return Err(err);
        }
        self.with_job(job_id, |record| {
            record.locked = false;
            record.lock_expires_at = None;
            record.unlock_count += 1;
            true
        })
    }

    async fn job_context(&self, job_id: Uuid) -> ApiResult<Option<JobContext>> {
        if let Some(err) = self.take_failure("job_context") {
            return Err(err);
        }
        let store = self.store.lock().unwrap();
        match store.jobs.get(&job_id) {
            Some(record) => Ok(record.context.clone()),
            None => Ok(None),
        }
    }

    async fn record_execution_plan(&self, job_id: Uuid, plan: &ExecutionPlan) -> ApiResult<bool> {
        if let Some(err) = self.take_failure("record_execution_plan") {
            return Err(err);
        }
        self.with_job(job_id, |record| {
            record.plans.push(plan.clone());
            true
        })
    }

    async fn record_endpoint_results(
        &self,
        job_id: Uuid,
        results: &[EndpointExecutionResult],
    ) -> ApiResult<bool> {
        if let Some(err) = self.take_failure("record_endpoint_results") {
            return Err(err);
        }
        self.with_job(job_id, |record| {
            record.results.push(results.to_vec());
            true
        })
    }

    async fn record_execution_summary(
        &self,
        job_id: Uuid,
        summary: &ExecutionSummary,
    ) -> ApiResult<bool> {
        if let Some(err) = self.take_failure("record_execution_summary") {
            return Err(err);
        }
        self.with_job(job_id, |record| {
            record.summaries.push(summary.clone());
            true
        })
    }

    async fn update_job_schedule(
        &self,
        job_id: Uuid,
        decision: &ScheduleDecision,
    ) -> ApiResult<bool> {
        if let Some(err) = self.take_failure("update_job_schedule") {
            return Err(err);
        }
        self.with_job(job_id, |record| {
            record.next_run_at = Some(decision.next_run_at);
            // Once rescheduled into the future the job is no longer due.
            record.due = decision.next_run_at <= Utc::now();
            record.decisions.push(decision.clone());
            true
        })
    }

    async fn record_job_error(
        &self,
        job_id: Uuid,
        message: &str,
        code: Option<&str>,
    ) -> ApiResult<bool> {
        if let Some(err) = self.take_failure("record_job_error") {
            return Err(err);
        }
        self.with_job(job_id, |record| {
            record
                .errors
                .push((message.to_string(), code.map(str::to_string)));
            record.messages.push(Message {
                role: MessageRole::System,
                content: MessageContent::Text(message.to_string()),
                source: None,
                created_at: Utc::now(),
            });
            true
        })
    }

    async fn update_job_token_usage(&self, job_id: Uuid, usage: &TokenUsage) -> ApiResult<bool> {
        if let Some(err) = self.take_failure("update_job_token_usage") {
            return Err(err);
        }
        self.with_job(job_id, |record| {
            record.token_usage.add(usage);
            true
        })
    }

    async fn update_execution_status(
        &self,
        job_id: Uuid,
        status: ExecutionStatus,
        _error_message: Option<&str>,
    ) -> ApiResult<bool> {
        self.with_job(job_id, |record| {
            record.execution_statuses.push(status);
            true
        })
    }

    async fn scheduler_metrics(&self) -> ApiResult<serde_json::Value> {
        let store = self.store.lock().unwrap();
        Ok(serde_json::json!({ "jobs": store.jobs.len() }))
    }
}
