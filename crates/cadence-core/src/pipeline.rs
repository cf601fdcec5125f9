//! Per-job processing pipeline.
//!
//! One job, one cycle: lease it, load its context, plan, execute, summarize,
//! schedule, release. Every acquired lease is released on every path, and
//! terminal failures are persisted before they surface to the cycle runner.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cadence_api::{
    ApiResult, EndpointExecutionResult, EscalationLevel, ExecutionPlan, ExecutionStatus,
    ExecutionSummary, JobContext, PlannedCall, RecoveryAction, SchedulerApi, TokenUsage,
};
use cadence_llm::LanguageModel;

use crate::agent::{AgentCore, Planner, Scheduler};
use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventSink};
use crate::executor::EndpointExecutor;
use crate::state::SharedState;
use crate::strategy::{ConcurrencyOptions, RetryOptions, StrategyRunner};

/// Error code attached to a terminal job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    PlanError,
    ScheduleError,
    ExecutionError,
    UnknownError,
}

impl FailureCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlanError => "plan_error",
            Self::ScheduleError => "schedule_error",
            Self::ExecutionError => "execution_error",
            Self::UnknownError => "unknown_error",
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a job cycle, surfaced into the cycle aggregate.
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub job_id: Uuid,
    pub code: FailureCode,
    pub message: String,
}

/// How the pipeline left the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// The lease was not acquired or the context was gone; nothing happened.
    Skipped,
}

/// Per-job pipeline. Cheap to clone per cycle: everything is shared.
#[derive(Clone)]
pub struct JobPipeline {
    pub api: Arc<dyn SchedulerApi>,
    pub model: Arc<dyn LanguageModel>,
    pub executor: Arc<EndpointExecutor>,
    pub config: Arc<EngineConfig>,
    pub events: Arc<dyn EventSink>,
    pub shared: Arc<SharedState>,
}

impl JobPipeline {
    /// Process one job. Lease denial is a skip; every acquired lease is
    /// paired with exactly one unlock regardless of outcome.
    pub async fn process_job(
        &self,
        job_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, JobFailure> {
        let expires_at = Utc::now()
            + chrono::Duration::milliseconds(
                self.config.scheduler.stale_lock_threshold_ms as i64,
            );

        let acquired = retry_transient(|| self.api.lock_job(job_id, expires_at))
            .await
            .map_err(|e| JobFailure {
                job_id,
                code: FailureCode::UnknownError,
                message: format!("failed to lock job: {e}"),
            })?;

        if !acquired {
            debug!(job_id = %job_id, "lease not acquired, skipping");
            return Ok(JobOutcome::Skipped);
        }

        let outcome = self.run_leased(job_id, cancel).await;

        if let Err(failure) = &outcome {
            // Persist the failure before releasing the lease; both are
            // best-effort and must not mask the original error.
            if let Err(e) = self
                .api
                .record_job_error(job_id, &failure.message, Some(failure.code.as_str()))
                .await
            {
                warn!(job_id = %job_id, error = %e, "failed to record job error");
            }
            if let Err(e) = self
                .api
                .update_execution_status(job_id, ExecutionStatus::Failed, Some(&failure.message))
                .await
            {
                warn!(job_id = %job_id, error = %e, "failed to update execution status");
            }
        }

        match retry_transient(|| self.api.unlock_job(job_id)).await {
            Ok(_) => {}
            Err(e) => {
                // An expired lease self-heals via the stale-lock threshold.
                warn!(job_id = %job_id, error = %e, "failed to unlock job");
            }
        }

        outcome
    }

    /// Everything that happens while holding the lease.
    async fn run_leased(
        &self,
        job_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, JobFailure> {
        let fail = |code: FailureCode, message: String| JobFailure {
            job_id,
            code,
            message,
        };

        // -- LOADING_CONTEXT ------------------------------------------------
        let context = retry_transient(|| self.api.job_context(job_id))
            .await
            .map_err(|e| fail(FailureCode::UnknownError, format!("failed to load context: {e}")))?;
        let Some(context) = context else {
            info!(job_id = %job_id, "job context absent, skipping");
            return Ok(JobOutcome::Skipped);
        };

        let now = Utc::now();
        // Endpoint and model calls only observe the engine token when
        // cancellation is enabled.
        let effective_cancel = if self.config.execution.allow_cancellation {
            cancel.clone()
        } else {
            CancellationToken::new()
        };

        if let Err(e) = self
            .api
            .update_execution_status(job_id, ExecutionStatus::Running, None)
            .await
        {
            warn!(job_id = %job_id, error = %e, "failed to mark execution running");
        }

        // -- PLANNING -------------------------------------------------------
        let planner = Planner {
            core: self.agent_core(),
        };
        let planned = planner
            .plan(&context, self.config.environment, now, &effective_cancel)
            .await
            .map_err(|e| fail(FailureCode::PlanError, format!("planning failed: {e}")))?;

        self.account_agent_usage(job_id, &planned.usage, planned.model_calls)
            .await;

        let plan = planned.output;
        if let Err(e) = retry_transient(|| self.api.record_execution_plan(job_id, &plan)).await {
            return Err(fail(
                FailureCode::PlanError,
                format!("failed to record execution plan: {e}"),
            ));
        }

        // -- EXECUTING ------------------------------------------------------
        let results = self
            .execute_plan(job_id, &context, &plan, &effective_cancel)
            .await
            .map_err(|e| fail(FailureCode::ExecutionError, format!("execution failed: {e:#}")))?;

        {
            let attempts: u64 = results.iter().map(|r| u64::from(r.attempts)).sum();
            let mut stats = self.shared.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.endpoint_calls += attempts;
        }

        if let Err(e) =
            retry_transient(|| self.api.record_endpoint_results(job_id, &results)).await
        {
            return Err(fail(
                FailureCode::ExecutionError,
                format!("failed to record endpoint results: {e}"),
            ));
        }

        // -- SUMMARIZING ----------------------------------------------------
        let summary = self.summarize(job_id, now, &results);
        if let Err(e) =
            retry_transient(|| self.api.record_execution_summary(job_id, &summary)).await
        {
            return Err(fail(
                FailureCode::ExecutionError,
                format!("failed to record execution summary: {e}"),
            ));
        }

        // -- SCHEDULING -----------------------------------------------------
        let scheduler = Scheduler {
            core: self.agent_core(),
        };
        let scheduled = scheduler
            .schedule(&context, &results, &summary, Utc::now(), &effective_cancel)
            .await
            .map_err(|e| fail(FailureCode::ScheduleError, format!("scheduling failed: {e}")))?;

        self.account_agent_usage(job_id, &scheduled.usage, scheduled.model_calls)
            .await;

        let decision = scheduled.output;
        if let Err(e) =
            retry_transient(|| self.api.update_job_schedule(job_id, &decision)).await
        {
            return Err(fail(
                FailureCode::ScheduleError,
                format!("failed to update job schedule: {e}"),
            ));
        }

        if let Err(e) = self
            .api
            .update_execution_status(job_id, ExecutionStatus::Succeeded, None)
            .await
        {
            warn!(job_id = %job_id, error = %e, "failed to mark execution succeeded");
        }

        info!(
            job_id = %job_id,
            succeeded = summary.success_count,
            failed = summary.failure_count,
            next_run_at = %decision.next_run_at,
            "job cycle completed"
        );

        Ok(JobOutcome::Completed)
    }

    fn agent_core(&self) -> AgentCore<'_> {
        AgentCore {
            model: self.model.as_ref(),
            ai: &self.config.ai,
            prompt: &self.config.prompt,
            repair: &self.config.repair,
            events: self.events.as_ref(),
        }
    }

    /// Run the strategy over the plan, excluding endpoints disabled by
    /// earlier escalations.
    async fn execute_plan(
        &self,
        job_id: Uuid,
        context: &JobContext,
        plan: &ExecutionPlan,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<EndpointExecutionResult>> {
        let disabled = self.shared.disabled_endpoints(job_id);
        let endpoints: HashMap<String, cadence_api::Endpoint> = context
            .endpoints
            .iter()
            .map(|e| (e.id.clone(), e.clone()))
            .collect();

        let filtered_calls: Vec<PlannedCall> = plan
            .endpoints_to_call
            .iter()
            .filter(|call| {
                if disabled.contains(&call.endpoint_id) {
                    debug!(
                        job_id = %job_id,
                        endpoint_id = %call.endpoint_id,
                        "skipping disabled endpoint"
                    );
                    return false;
                }
                true
            })
            .cloned()
            .collect();

        let filtered_plan = ExecutionPlan {
            endpoints_to_call: filtered_calls,
            ..plan.clone()
        };

        let runner = StrategyRunner::new(
            self.executor.as_ref(),
            RetryOptions {
                max_attempts: self.config.execution.max_endpoint_retries,
                warn_threshold_attempt: self.config.execution.warn_threshold_attempt,
                critical_threshold_attempt: self.config.execution.critical_threshold_attempt,
            },
            ConcurrencyOptions {
                default_limit: self.config.execution.default_concurrency_limit,
                max_concurrency: self.config.execution.max_concurrency,
            },
            self.events.as_ref(),
        );

        runner
            .run(
                job_id,
                &filtered_plan,
                &endpoints,
                context.job.default_headers.as_ref(),
                cancel,
            )
            .await
    }

    /// Aggregate results, derive the escalation level from the failure
    /// ratio, and apply the recovery action.
    fn summarize(
        &self,
        job_id: Uuid,
        start_time: chrono::DateTime<Utc>,
        results: &[EndpointExecutionResult],
    ) -> ExecutionSummary {
        let end_time = Utc::now();
        let success_count = results.iter().filter(|r| r.success).count();
        let aborted_count = results.iter().filter(|r| r.aborted).count();
        let failure_count = results
            .iter()
            .filter(|r| !r.success && !r.aborted)
            .count();

        // Ratio over non-aborted attempts; aborts are shutdown noise, not
        // endpoint health.
        let attempts = results.len() - aborted_count;
        let ratio = failure_count as f64 / attempts.max(1) as f64;

        let level = if ratio >= self.config.recovery.critical_failure_ratio {
            EscalationLevel::Critical
        } else if ratio >= self.config.recovery.warn_failure_ratio {
            EscalationLevel::Warn
        } else {
            EscalationLevel::None
        };

        let recovery_action = match level {
            EscalationLevel::Critical => RecoveryAction::DisableEndpoint,
            EscalationLevel::Warn => RecoveryAction::BackoffOnly,
            EscalationLevel::None => RecoveryAction::None,
        };

        let disabled_endpoints = if recovery_action == RecoveryAction::DisableEndpoint {
            let failed: Vec<String> = results
                .iter()
                .filter(|r| !r.success && !r.aborted)
                .map(|r| r.endpoint_id.clone())
                .collect();
            if failed.is_empty() {
                None
            } else {
                self.shared.disable_endpoints(job_id, failed.iter().cloned());
                Some(failed)
            }
        } else {
            None
        };

        let previous = self.shared.swap_escalation_level(job_id, level);
        if previous != level {
            self.events.emit(&EngineEvent::Escalation {
                job_id,
                level,
                failure_count,
                aborted_count,
                recovery_action,
            });
        }

        ExecutionSummary {
            start_time,
            end_time,
            total_duration_ms: (end_time - start_time).num_milliseconds().max(0) as u64,
            success_count,
            failure_count,
            aborted_count,
            escalation_level: level,
            recovery_action,
            disabled_endpoints,
        }
    }

    /// Fold agent-call usage into engine stats and persist it best-effort.
    async fn account_agent_usage(&self, job_id: Uuid, usage: &TokenUsage, model_calls: u64) {
        {
            let mut stats = self.shared.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.agent_calls += model_calls;
            stats.token_usage.add(usage);
        }
        if usage.is_zero() {
            return;
        }
        if let Err(e) = self.api.update_job_token_usage(job_id, usage).await {
            warn!(job_id = %job_id, error = %e, "failed to persist token usage");
        }
    }
}

/// Retry a façade operation once when the failure is transient.
pub async fn retry_transient<T, F, Fut>(mut op: F) -> ApiResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ApiResult<T>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(err) if err.is_transient() => {
            warn!(error = %err, "transient api failure, retrying once");
            op().await
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_api::ApiError;

    #[test]
    fn failure_codes_render_snake_case() {
        assert_eq!(FailureCode::PlanError.to_string(), "plan_error");
        assert_eq!(FailureCode::ScheduleError.to_string(), "schedule_error");
        assert_eq!(FailureCode::ExecutionError.to_string(), "execution_error");
        assert_eq!(FailureCode::UnknownError.to_string(), "unknown_error");
    }

    #[tokio::test]
    async fn retry_transient_retries_once() {
        let mut calls = 0;
        let result: ApiResult<u32> = retry_transient(|| {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt == 1 {
                    Err(ApiError::Network("refused".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn retry_transient_gives_up_after_second_failure() {
        let mut calls = 0;
        let result: ApiResult<u32> = retry_transient(|| {
            calls += 1;
            async { Err(ApiError::Timeout("slow".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn retry_transient_does_not_retry_fatal() {
        let mut calls = 0;
        let result: ApiResult<u32> = retry_transient(|| {
            calls += 1;
            async {
                Err(ApiError::Status {
                    status: 422,
                    message: "bad".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
