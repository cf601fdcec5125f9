//! Cycle runner: discovers due jobs, fans them out to pipelines under the
//! configured concurrency, and aggregates the outcome. Owns the engine
//! lifecycle (start / stop / status) and the cooperative shutdown signal.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use cadence_api::SchedulerApi;
use cadence_llm::LanguageModel;

use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventSink};
use crate::executor::{EndpointExecutor, ExecutorConfig};
use crate::pipeline::{JobOutcome, JobPipeline, retry_transient};
use crate::state::{EngineSnapshot, EngineStatus, SharedState};

/// One error from the cycle aggregate.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    pub code: String,
}

/// Aggregate outcome of one `process_cycle` call.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResult {
    pub jobs_processed: usize,
    pub successful_jobs: usize,
    pub failed_jobs: usize,
    pub duration_ms: u64,
    pub errors: Vec<ProcessingError>,
}

struct Lifecycle {
    status: EngineStatus,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    last_processing_at: Option<DateTime<Utc>>,
}

/// The scheduling engine. Clone-cheap handle around shared internals.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    api: Arc<dyn SchedulerApi>,
    config: Arc<EngineConfig>,
    shared: Arc<SharedState>,
    events: Arc<dyn EventSink>,
    pipeline: JobPipeline,
    lifecycle: Mutex<Lifecycle>,
    cancel: Mutex<CancellationToken>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
    /// Single-flight gate: at most one cycle in progress per engine.
    cycle_gate: tokio::sync::Mutex<()>,
}

impl Engine {
    pub fn new(
        api: Arc<dyn SchedulerApi>,
        model: Arc<dyn LanguageModel>,
        config: EngineConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let config = Arc::new(config);
        let shared = Arc::new(SharedState::default());

        // Endpoint progress flows through the sink; mirror it into the
        // engine's transient progress map as it passes by.
        let events: Arc<dyn EventSink> = Arc::new(ProgressTrackingSink {
            inner: events,
            shared: Arc::clone(&shared),
        });

        let executor = Arc::new(EndpointExecutor::new(ExecutorConfig {
            default_timeout: config.execution.default_timeout(),
            response_content_length_limit: config.execution.response_content_length_limit,
        }));

        let pipeline = JobPipeline {
            api: Arc::clone(&api),
            model,
            executor,
            config: Arc::clone(&config),
            events: Arc::clone(&events),
            shared: Arc::clone(&shared),
        };

        Self {
            inner: Arc::new(EngineInner {
                api,
                config,
                shared,
                events,
                pipeline,
                lifecycle: Mutex::new(Lifecycle {
                    status: EngineStatus::Stopped,
                    started_at: None,
                    stopped_at: None,
                    last_processing_at: None,
                }),
                cancel: Mutex::new(CancellationToken::new()),
                run_handle: Mutex::new(None),
                cycle_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Run one cycle: fetch due jobs, process them under the job-level
    /// concurrency limit, aggregate the outcome.
    pub async fn process_cycle(&self) -> Result<ProcessingResult> {
        let inner = &self.inner;
        let _single_flight = inner.cycle_gate.lock().await;

        let start = tokio::time::Instant::now();

        let job_ids = retry_transient(|| {
            inner
                .api
                .jobs_to_process(inner.config.scheduler.max_batch_size)
        })
        .await
        .context("failed to fetch jobs to process")?;

        inner.shared.begin_cycle(job_ids.len());
        info!(batch = job_ids.len(), "processing cycle started");

        let cancel = inner.cancel.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let semaphore = Arc::new(Semaphore::new(
            inner.config.scheduler.job_processing_concurrency,
        ));

        let runs = job_ids.iter().map(|&job_id| {
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let pipeline = inner.pipeline.clone();
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return (job_id, Ok(JobOutcome::Skipped));
                };
                let result = pipeline.process_job(job_id, &cancel).await;
                let (total, completed) = inner.shared.job_completed();
                inner.events.emit(&EngineEvent::ExecutionProgress {
                    job_id,
                    total,
                    completed,
                });
                (job_id, result)
            }
        });

        let outcomes = futures::future::join_all(runs).await;

        let mut result = ProcessingResult {
            jobs_processed: job_ids.len(),
            ..Default::default()
        };
        for (job_id, outcome) in outcomes {
            match outcome {
                Ok(JobOutcome::Completed) => result.successful_jobs += 1,
                Ok(JobOutcome::Skipped) => {}
                Err(failure) => {
                    result.failed_jobs += 1;
                    error!(
                        job_id = %job_id,
                        code = failure.code.as_str(),
                        "job cycle failed: {}",
                        failure.message
                    );
                    result.errors.push(ProcessingError {
                        message: failure.message,
                        job_id: Some(job_id),
                        code: failure.code.to_string(),
                    });
                }
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;

        {
            let mut stats = inner.shared.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.jobs_processed += result.jobs_processed as u64;
            stats.successful_jobs += result.successful_jobs as u64;
            stats.failed_jobs += result.failed_jobs as u64;
        }
        {
            let mut lifecycle = inner.lifecycle.lock().unwrap_or_else(|p| p.into_inner());
            lifecycle.last_processing_at = Some(Utc::now());
        }

        info!(
            processed = result.jobs_processed,
            successful = result.successful_jobs,
            failed = result.failed_jobs,
            duration_ms = result.duration_ms,
            "processing cycle finished"
        );

        Ok(result)
    }

    /// Start the interval loop. Cycles are single-flight: a tick that fires
    /// while a cycle is still running is skipped, not queued.
    pub fn start(&self) {
        let mut lifecycle = self
            .inner
            .lifecycle
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if lifecycle.status == EngineStatus::Running {
            warn!("engine already running");
            return;
        }
        lifecycle.status = EngineStatus::Running;
        lifecycle.started_at = Some(Utc::now());
        lifecycle.stopped_at = None;
        drop(lifecycle);

        let cancel = CancellationToken::new();
        *self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = cancel.clone();

        let engine = self.clone();
        let period = Duration::from_millis(self.inner.config.scheduler.processing_interval_ms);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        // Unhandled cycle errors are logged; the loop
                        // continues on the next tick.
                        if let Err(e) = engine.process_cycle().await {
                            error!("cycle failed: {e:#}");
                        }
                    }
                }
            }
        });

        *self
            .inner
            .run_handle
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(handle);

        info!(
            interval_ms = self.inner.config.scheduler.processing_interval_ms,
            "engine started"
        );
    }

    /// Graceful stop: raise the cancellation signal, wait for the current
    /// cycle to drain, and mark the engine stopped.
    pub async fn stop(&self) {
        let cancel = self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        cancel.cancel();

        let handle = self
            .inner
            .run_handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("run loop join failed: {e}");
            }
        }

        // Wait out any cycle started outside the run loop as well.
        let _drained = self.inner.cycle_gate.lock().await;

        let mut lifecycle = self
            .inner
            .lifecycle
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        lifecycle.status = EngineStatus::Stopped;
        lifecycle.stopped_at = Some(Utc::now());

        info!("engine stopped");
    }

    /// Snapshot the engine state for operators.
    pub fn snapshot(&self) -> EngineSnapshot {
        let lifecycle = self
            .inner
            .lifecycle
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let stats = self
            .inner
            .shared
            .stats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let progress = self
            .inner
            .shared
            .progress
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();

        EngineSnapshot {
            status: lifecycle.status,
            started_at: lifecycle.started_at,
            stopped_at: lifecycle.stopped_at,
            last_processing_at: lifecycle.last_processing_at,
            stats,
            progress,
        }
    }
}

/// Sink wrapper that mirrors endpoint progress into the shared state
/// before forwarding to the configured sink.
struct ProgressTrackingSink {
    inner: Arc<dyn EventSink>,
    shared: Arc<SharedState>,
}

impl EventSink for ProgressTrackingSink {
    fn emit(&self, event: &EngineEvent) {
        if let EngineEvent::EndpointProgress {
            endpoint_id,
            status,
            attempt,
            ..
        } = event
        {
            self.shared
                .update_endpoint_progress(endpoint_id, status.as_str(), *attempt);
        }
        self.inner.emit(event);
    }
}
