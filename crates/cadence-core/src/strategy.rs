//! Strategy runner: drives an execution plan across its endpoints.
//!
//! Three disciplines: sequential (priority order, critical failures halt),
//! parallel (bounded fan-out), and mixed (dependency DAG with cycle
//! detection). Endpoint errors never escape this module; every attempted
//! endpoint materializes as exactly one result record.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::Utc;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cadence_api::{Endpoint, EndpointExecutionResult, ExecutionPlan, ExecutionStrategy, PlannedCall};

use crate::events::{EndpointProgressStatus, EngineEvent, EventSink};
use crate::executor::{AttemptOutcome, EndpointExecutor};
use crate::retry::{ErrorCategory, RetryContext, RetryDecision, decide};

/// Retry limits applied per endpoint.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub warn_threshold_attempt: Option<u32>,
    pub critical_threshold_attempt: Option<u32>,
}

/// Concurrency limits applied per plan.
#[derive(Debug, Clone)]
pub struct ConcurrencyOptions {
    /// Used when the plan does not suggest a limit.
    pub default_limit: usize,
    /// Hard global cap, regardless of the plan.
    pub max_concurrency: usize,
}

impl ConcurrencyOptions {
    fn effective(&self, plan_limit: Option<usize>) -> usize {
        plan_limit
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_concurrency)
    }
}

/// Drives one plan to completion.
pub struct StrategyRunner<'a> {
    executor: &'a EndpointExecutor,
    retry: RetryOptions,
    concurrency: ConcurrencyOptions,
    events: &'a dyn EventSink,
}

impl<'a> StrategyRunner<'a> {
    pub fn new(
        executor: &'a EndpointExecutor,
        retry: RetryOptions,
        concurrency: ConcurrencyOptions,
        events: &'a dyn EventSink,
    ) -> Self {
        Self {
            executor,
            retry,
            concurrency,
            events,
        }
    }

    /// Run the plan. Returns one result per attempted endpoint; endpoints
    /// skipped by cancellation or blocked by failed dependencies are absent.
    ///
    /// Fails only on structural problems (a dependency cycle); endpoint
    /// failures are materialized as result records.
    pub async fn run(
        &self,
        job_id: Uuid,
        plan: &ExecutionPlan,
        endpoints: &HashMap<String, Endpoint>,
        job_headers: Option<&HashMap<String, String>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<EndpointExecutionResult>> {
        // Stable priority order; duplicate endpoint ids collapse to their
        // first occurrence so each endpoint yields at most one result.
        let mut seen = HashSet::new();
        let mut calls: Vec<&PlannedCall> = plan
            .endpoints_to_call
            .iter()
            .filter(|c| seen.insert(c.endpoint_id.as_str()))
            .collect();
        calls.sort_by_key(|c| c.priority);

        match plan.execution_strategy {
            ExecutionStrategy::Sequential => {
                Ok(self
                    .run_sequential(job_id, &calls, endpoints, job_headers, cancel)
                    .await)
            }
            ExecutionStrategy::Parallel => {
                let limit = self.concurrency.effective(plan.concurrency_limit);
                Ok(self
                    .run_parallel(job_id, &calls, endpoints, job_headers, limit, cancel)
                    .await)
            }
            ExecutionStrategy::Mixed => {
                let limit = self.concurrency.effective(plan.concurrency_limit);
                self.run_mixed(job_id, &calls, endpoints, job_headers, limit, cancel)
                    .await
            }
        }
    }

    async fn run_sequential(
        &self,
        job_id: Uuid,
        calls: &[&PlannedCall],
        endpoints: &HashMap<String, Endpoint>,
        job_headers: Option<&HashMap<String, String>>,
        cancel: &CancellationToken,
    ) -> Vec<EndpointExecutionResult> {
        let mut results = Vec::with_capacity(calls.len());

        for call in calls {
            // Cancellation before dispatch: the rest are not attempted.
            if cancel.is_cancelled() {
                break;
            }
            let Some(endpoint) = endpoints.get(&call.endpoint_id) else {
                results.push(unknown_endpoint_result(call));
                continue;
            };

            let result = self
                .run_with_retry(job_id, endpoint, call, job_headers, cancel)
                .await;
            let halt = call.critical && !result.success;
            results.push(result);

            // A critical failure after retries stops the run; the remaining
            // endpoints are not attempted.
            if halt {
                break;
            }
        }

        results
    }

    async fn run_parallel(
        &self,
        job_id: Uuid,
        calls: &[&PlannedCall],
        endpoints: &HashMap<String, Endpoint>,
        job_headers: Option<&HashMap<String, String>>,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Vec<EndpointExecutionResult> {
        let semaphore = Arc::new(Semaphore::new(limit));

        let futures = calls.iter().map(|call| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return None;
                };
                if cancel.is_cancelled() {
                    return None;
                }
                let Some(endpoint) = endpoints.get(&call.endpoint_id) else {
                    return Some(unknown_endpoint_result(call));
                };
                Some(
                    self.run_with_retry(job_id, endpoint, call, job_headers, cancel)
                        .await,
                )
            }
        });

        // join_all preserves submission order in the result list even
        // though completion order is arbitrary.
        futures::future::join_all(futures)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn run_mixed(
        &self,
        job_id: Uuid,
        calls: &[&PlannedCall],
        endpoints: &HashMap<String, Endpoint>,
        job_headers: Option<&HashMap<String, String>>,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<EndpointExecutionResult>> {
        let mut results = Vec::with_capacity(calls.len());
        // endpoint id -> success, for completed endpoints.
        let mut completed: HashMap<&str, bool> = HashMap::new();
        let mut submitted: HashSet<&str> = HashSet::new();
        let mut in_flight = FuturesUnordered::new();

        loop {
            let blocked = blocked_by_failures(calls, &completed);

            if !cancel.is_cancelled() {
                for call in calls {
                    if in_flight.len() >= limit {
                        break;
                    }
                    let id = call.endpoint_id.as_str();
                    if submitted.contains(id) || blocked.contains(id) {
                        continue;
                    }
                    if !dependencies_satisfied(call, &completed) {
                        continue;
                    }
                    submitted.insert(id);
                    in_flight.push(async move {
                        let Some(endpoint) = endpoints.get(id) else {
                            return (id, unknown_endpoint_result(call));
                        };
                        let result = self
                            .run_with_retry(job_id, endpoint, call, job_headers, cancel)
                            .await;
                        (id, result)
                    });
                }
            }

            if in_flight.is_empty() {
                let remaining: Vec<&str> = calls
                    .iter()
                    .map(|c| c.endpoint_id.as_str())
                    .filter(|id| !submitted.contains(id) && !blocked.contains(id))
                    .collect();

                if remaining.is_empty() || cancel.is_cancelled() {
                    // Everything ran, or the rest is blocked by failed
                    // dependencies / cancellation: those are not attempted.
                    break;
                }

                // Nothing ready, nothing running, work remaining: the
                // dependency graph cannot make progress.
                bail!(
                    "circular dependency detected among endpoints: {}",
                    remaining.join(", ")
                );
            }

            if let Some((id, result)) = in_flight.next().await {
                completed.insert(id, result.success);
                results.push(result);
            }
        }

        Ok(results)
    }

    /// Run one endpoint through the retry policy until it succeeds, fails,
    /// or escalates. Always returns a result record.
    async fn run_with_retry(
        &self,
        job_id: Uuid,
        endpoint: &Endpoint,
        call: &PlannedCall,
        job_headers: Option<&HashMap<String, String>>,
        cancel: &CancellationToken,
    ) -> EndpointExecutionResult {
        let started_at = Utc::now();
        let begin = Instant::now();
        let mut attempt: u32 = 1;

        loop {
            self.emit_progress(
                job_id,
                &endpoint.id,
                if attempt == 1 {
                    EndpointProgressStatus::Started
                } else {
                    EndpointProgressStatus::Retrying
                },
                attempt,
                None,
            );

            let outcome = self
                .executor
                .execute(endpoint, call, job_headers, cancel)
                .await;

            if outcome.success {
                self.emit_progress(
                    job_id,
                    &endpoint.id,
                    EndpointProgressStatus::Succeeded,
                    attempt,
                    None,
                );
                return materialize(endpoint, outcome, attempt, started_at, begin);
            }

            if outcome.aborted {
                self.emit_progress(
                    job_id,
                    &endpoint.id,
                    EndpointProgressStatus::Aborted,
                    attempt,
                    outcome.error.clone(),
                );
                return materialize(endpoint, outcome, attempt, started_at, begin);
            }

            let context = RetryContext {
                attempt,
                max_attempts: self.retry.max_attempts,
                category: outcome.category.unwrap_or(ErrorCategory::Unknown),
                status_code: (outcome.status_code != 0).then_some(outcome.status_code),
                warn_threshold_attempt: self.retry.warn_threshold_attempt,
                critical_threshold_attempt: self.retry.critical_threshold_attempt,
            };

            match decide(&context) {
                RetryDecision::Retry { delay } => {
                    self.emit_progress(
                        job_id,
                        &endpoint.id,
                        EndpointProgressStatus::Retrying,
                        attempt,
                        outcome.error.clone(),
                    );
                    // Backoff is cancellable: a shutdown mid-wait aborts the
                    // endpoint rather than firing another attempt.
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let mut aborted = outcome;
                            aborted.aborted = true;
                            aborted.category = Some(ErrorCategory::Aborted);
                            aborted.error = Some("aborted during retry backoff".to_string());
                            return materialize(endpoint, aborted, attempt, started_at, begin);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                RetryDecision::Fail | RetryDecision::Escalate => {
                    self.emit_progress(
                        job_id,
                        &endpoint.id,
                        EndpointProgressStatus::Failed,
                        attempt,
                        outcome.error.clone(),
                    );
                    return materialize(endpoint, outcome, attempt, started_at, begin);
                }
            }
        }
    }

    fn emit_progress(
        &self,
        job_id: Uuid,
        endpoint_id: &str,
        status: EndpointProgressStatus,
        attempt: u32,
        error: Option<String>,
    ) {
        self.events.emit(&EngineEvent::EndpointProgress {
            job_id,
            endpoint_id: endpoint_id.to_string(),
            status,
            attempt,
            error,
        });
    }
}

/// Dependencies are satisfied when every one of them completed successfully.
fn dependencies_satisfied(call: &PlannedCall, completed: &HashMap<&str, bool>) -> bool {
    match &call.depends_on {
        None => true,
        Some(deps) => deps
            .iter()
            .all(|dep| completed.get(dep.as_str()).copied() == Some(true)),
    }
}

/// Endpoints transitively blocked by a failed dependency. These are skipped
/// (not attempted), which also distinguishes a stalled-but-legitimate DAG
/// from a genuine cycle.
fn blocked_by_failures<'c>(
    calls: &[&'c PlannedCall],
    completed: &HashMap<&str, bool>,
) -> HashSet<&'c str> {
    let mut blocked: HashSet<&str> = HashSet::new();
    loop {
        let mut changed = false;
        for call in calls {
            let id = call.endpoint_id.as_str();
            if blocked.contains(id) {
                continue;
            }
            let Some(deps) = &call.depends_on else {
                continue;
            };
            let is_blocked = deps.iter().any(|dep| {
                completed.get(dep.as_str()).copied() == Some(false)
                    || blocked.contains(dep.as_str())
            });
            if is_blocked {
                blocked.insert(id);
                changed = true;
            }
        }
        if !changed {
            return blocked;
        }
    }
}

/// Result for a planned endpoint id that does not exist on the job.
fn unknown_endpoint_result(call: &PlannedCall) -> EndpointExecutionResult {
    EndpointExecutionResult {
        endpoint_id: call.endpoint_id.clone(),
        success: false,
        status_code: 0,
        execution_time_ms: 0,
        timestamp: Utc::now(),
        response_content: None,
        error: Some(format!("unknown endpoint id {:?}", call.endpoint_id)),
        request_size: 0,
        response_size: 0,
        truncated: false,
        attempts: 0,
        aborted: false,
    }
}

fn materialize(
    endpoint: &Endpoint,
    outcome: AttemptOutcome,
    attempts: u32,
    started_at: chrono::DateTime<Utc>,
    begin: Instant,
) -> EndpointExecutionResult {
    EndpointExecutionResult {
        endpoint_id: endpoint.id.clone(),
        success: outcome.success,
        status_code: outcome.status_code,
        execution_time_ms: begin.elapsed().as_millis() as u64,
        timestamp: started_at,
        response_content: outcome.response_content,
        error: outcome.error,
        request_size: outcome.request_size,
        response_size: outcome.response_size,
        truncated: outcome.truncated,
        attempts,
        aborted: outcome.aborted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str, priority: i32, deps: &[&str]) -> PlannedCall {
        PlannedCall {
            endpoint_id: id.to_string(),
            parameters: None,
            headers: None,
            priority,
            depends_on: if deps.is_empty() {
                None
            } else {
                Some(deps.iter().map(|d| d.to_string()).collect())
            },
            critical: false,
        }
    }

    #[test]
    fn effective_concurrency_clamps_to_global_cap() {
        let options = ConcurrencyOptions {
            default_limit: 2,
            max_concurrency: 5,
        };
        assert_eq!(options.effective(None), 2);
        assert_eq!(options.effective(Some(3)), 3);
        assert_eq!(options.effective(Some(50)), 5);
        assert_eq!(options.effective(Some(0)), 1);
    }

    #[test]
    fn dependencies_require_successful_completion() {
        let c = call("d", 1, &["a", "b"]);
        let mut completed = HashMap::new();
        completed.insert("a", true);
        assert!(!dependencies_satisfied(&c, &completed));

        completed.insert("b", false);
        assert!(!dependencies_satisfied(&c, &completed));

        completed.insert("b", true);
        assert!(dependencies_satisfied(&c, &completed));
    }

    #[test]
    fn blocked_set_is_transitive() {
        let a = call("a", 1, &[]);
        let b = call("b", 2, &["a"]);
        let c = call("c", 3, &["b"]);
        let d = call("d", 4, &[]);
        let calls = vec![&a, &b, &c, &d];

        let mut completed = HashMap::new();
        completed.insert("a", false);

        let blocked = blocked_by_failures(&calls, &completed);
        assert!(blocked.contains("b"));
        assert!(blocked.contains("c"), "descendants are blocked transitively");
        assert!(!blocked.contains("d"));
    }

    #[test]
    fn unknown_endpoint_results_carry_zero_attempts() {
        let result = unknown_endpoint_result(&call("ghost", 1, &[]));
        assert!(!result.success);
        assert_eq!(result.attempts, 0);
        assert_eq!(result.status_code, 0);
    }
}
