//! The scheduler façade contract and its HTTP implementation.
//!
//! The engine only ever talks to persistence through [`SchedulerApi`];
//! [`HttpSchedulerApi`] is the production adapter over the external REST
//! service (base path `/api`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::{
    EndpointExecutionResult, ExecutionPlan, ExecutionStatus, ExecutionSummary, JobContext,
    ScheduleDecision, TokenUsage,
};

/// Persistence contract consumed by the engine.
///
/// Implementations must make `lock_job` an atomic compare-and-set on
/// `(locked, lock_expires_at)`: a lock held by another holder is only
/// grantable once it has expired.
#[async_trait]
pub trait SchedulerApi: Send + Sync {
    /// Due ACTIVE jobs, unlocked or with an expired lock, ordered by
    /// `next_run_at` ascending.
    async fn jobs_to_process(&self, limit: usize) -> ApiResult<Vec<Uuid>>;

    /// Try to acquire the job lease until `expires_at`. Returns `false`
    /// when another holder's lock is still valid.
    async fn lock_job(&self, job_id: Uuid, expires_at: DateTime<Utc>) -> ApiResult<bool>;

    async fn unlock_job(&self, job_id: Uuid) -> ApiResult<bool>;

    async fn job_context(&self, job_id: Uuid) -> ApiResult<Option<JobContext>>;

    async fn record_execution_plan(&self, job_id: Uuid, plan: &ExecutionPlan) -> ApiResult<bool>;

    /// Stores per-endpoint result records and writes the parallel
    /// endpoint-usage rows.
    async fn record_endpoint_results(
        &self,
        job_id: Uuid,
        results: &[EndpointExecutionResult],
    ) -> ApiResult<bool>;

    async fn record_execution_summary(
        &self,
        job_id: Uuid,
        summary: &ExecutionSummary,
    ) -> ApiResult<bool>;

    /// Sets `next_run_at`; system-visible recommended actions are appended
    /// to the job's message history by the façade.
    async fn update_job_schedule(
        &self,
        job_id: Uuid,
        decision: &ScheduleDecision,
    ) -> ApiResult<bool>;

    /// Appends a system message and an error row for the job.
    async fn record_job_error(
        &self,
        job_id: Uuid,
        message: &str,
        code: Option<&str>,
    ) -> ApiResult<bool>;

    /// Optional: accumulate token counters on the job. Implementations
    /// without token accounting may leave the default no-op.
    async fn update_job_token_usage(&self, _job_id: Uuid, _usage: &TokenUsage) -> ApiResult<bool> {
        Ok(false)
    }

    /// Optional: surface the live execution status of a cycle.
    async fn update_execution_status(
        &self,
        _job_id: Uuid,
        _status: ExecutionStatus,
        _error_message: Option<&str>,
    ) -> ApiResult<bool> {
        Ok(false)
    }

    /// Scheduler-side metrics snapshot, opaque to the engine.
    async fn scheduler_metrics(&self) -> ApiResult<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }
}

/// HTTP adapter over the scheduler REST façade.
#[derive(Clone)]
pub struct HttpSchedulerApi {
    client: Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpSchedulerApi {
    /// Create an adapter for the façade at `base_url` (without the `/api`
    /// suffix, e.g. `http://localhost:3000`).
    pub fn new(base_url: impl Into<String>, bearer_token: Option<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: Client::new(),
            base_url,
            bearer_token,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/api{}", self.base_url, path);
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Issue a request and decode a JSON body, mapping non-success statuses
    /// to [`ApiError::Status`].
    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> ApiResult<T> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// Issue a write and treat any 2xx as success.
    async fn send_ack(&self, builder: RequestBuilder) -> ApiResult<bool> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ApiError::Status {
            status: status.as_u16(),
            message,
        })
    }

    /// Like [`Self::send_ack`] but maps 404 to `Ok(false)`: the façade may
    /// simply not implement the optional route.
    async fn send_ack_optional(&self, builder: RequestBuilder) -> ApiResult<bool> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ApiError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobBody<'a, T: Serialize> {
    job_id: Uuid,
    #[serde(flatten)]
    payload: &'a T,
}

#[async_trait]
impl SchedulerApi for HttpSchedulerApi {
    async fn jobs_to_process(&self, limit: usize) -> ApiResult<Vec<Uuid>> {
        let builder = self
            .request(Method::GET, "/scheduler/jobs-to-process")
            .query(&[("limit", limit)]);
        let ids: Vec<Uuid> = self.send_json(builder).await?;
        debug!(count = ids.len(), "fetched jobs to process");
        Ok(ids)
    }

    async fn lock_job(&self, job_id: Uuid, expires_at: DateTime<Utc>) -> ApiResult<bool> {
        let builder = self
            .request(Method::POST, "/scheduler/jobs/lock")
            .json(&json!({ "jobId": job_id, "expiresAt": expires_at }));
        let response = builder.send().await?;
        let status = response.status();
        // 409 is lock contention, not an error: another holder's lease is
        // still valid.
        if status == StatusCode::CONFLICT {
            return Ok(false);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }
        #[derive(serde::Deserialize)]
        struct LockResponse {
            acquired: bool,
        }
        let body: LockResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(body.acquired)
    }

    async fn unlock_job(&self, job_id: Uuid) -> ApiResult<bool> {
        let builder = self
            .request(Method::POST, "/scheduler/jobs/unlock")
            .json(&json!({ "jobId": job_id }));
        self.send_ack_optional(builder).await
    }

    async fn job_context(&self, job_id: Uuid) -> ApiResult<Option<JobContext>> {
        let builder = self.request(Method::GET, &format!("/scheduler/jobs/{job_id}/context"));
        let response = builder.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }
        let context: JobContext = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(Some(context))
    }

    async fn record_execution_plan(&self, job_id: Uuid, plan: &ExecutionPlan) -> ApiResult<bool> {
        let builder = self
            .request(Method::POST, "/scheduler/jobs/execution-plan")
            .json(&JobBody {
                job_id,
                payload: plan,
            });
        self.send_ack(builder).await
    }

    async fn record_endpoint_results(
        &self,
        job_id: Uuid,
        results: &[EndpointExecutionResult],
    ) -> ApiResult<bool> {
        let builder = self
            .request(Method::POST, "/scheduler/jobs/endpoint-results")
            .json(&json!({ "jobId": job_id, "results": results }));
        self.send_ack(builder).await
    }

    async fn record_execution_summary(
        &self,
        job_id: Uuid,
        summary: &ExecutionSummary,
    ) -> ApiResult<bool> {
        let builder = self
            .request(Method::POST, "/scheduler/jobs/execution-summary")
            .json(&JobBody {
                job_id,
                payload: summary,
            });
        self.send_ack(builder).await
    }

    async fn update_job_schedule(
        &self,
        job_id: Uuid,
        decision: &ScheduleDecision,
    ) -> ApiResult<bool> {
        let builder = self
            .request(Method::POST, "/scheduler/jobs/schedule")
            .json(&JobBody {
                job_id,
                payload: decision,
            });
        self.send_ack(builder).await
    }

    async fn record_job_error(
        &self,
        job_id: Uuid,
        message: &str,
        code: Option<&str>,
    ) -> ApiResult<bool> {
        let builder = self
            .request(Method::POST, "/scheduler/jobs/error")
            .json(&json!({ "jobId": job_id, "message": message, "code": code }));
        self.send_ack(builder).await
    }

    async fn update_job_token_usage(&self, job_id: Uuid, usage: &TokenUsage) -> ApiResult<bool> {
        let builder = self
            .request(Method::POST, "/scheduler/jobs/token-usage")
            .json(&JobBody {
                job_id,
                payload: usage,
            });
        self.send_ack_optional(builder).await
    }

    async fn update_execution_status(
        &self,
        job_id: Uuid,
        status: ExecutionStatus,
        error_message: Option<&str>,
    ) -> ApiResult<bool> {
        let builder = self
            .request(Method::POST, "/scheduler/jobs/execution-status")
            .json(&json!({
                "jobId": job_id,
                "status": status,
                "errorMessage": error_message,
            }));
        self.send_ack_optional(builder).await
    }

    async fn scheduler_metrics(&self) -> ApiResult<serde_json::Value> {
        let builder = self.request(Method::GET, "/scheduler/metrics");
        self.send_json(builder).await
    }
}
