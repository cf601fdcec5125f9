//! Observer hooks for engine progress and recovery.
//!
//! Sinks must be non-blocking: `emit` is called from hot paths in the
//! pipeline and strategy runner and is never awaited.

use uuid::Uuid;

use cadence_api::{EscalationLevel, RecoveryAction};

/// Which agent core an event originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStage {
    Planner,
    Scheduler,
}

impl AgentStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Scheduler => "scheduler",
        }
    }
}

/// Per-endpoint progress states surfaced while a strategy runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointProgressStatus {
    Started,
    Retrying,
    Succeeded,
    Failed,
    Aborted,
}

impl EndpointProgressStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

/// Events fired through the configured sink.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The model produced a response that failed schema or semantic checks.
    Malformed {
        job_id: Uuid,
        stage: AgentStage,
        category: String,
        message: String,
    },
    RepairAttempt {
        job_id: Uuid,
        stage: AgentStage,
        attempt: u32,
    },
    RepairSuccess {
        job_id: Uuid,
        stage: AgentStage,
    },
    RepairFailure {
        job_id: Uuid,
        stage: AgentStage,
        message: String,
    },
    ExecutionProgress {
        job_id: Uuid,
        total: usize,
        completed: usize,
    },
    EndpointProgress {
        job_id: Uuid,
        endpoint_id: String,
        status: EndpointProgressStatus,
        attempt: u32,
        error: Option<String>,
    },
    Escalation {
        job_id: Uuid,
        level: EscalationLevel,
        failure_count: usize,
        aborted_count: usize,
        recovery_action: RecoveryAction,
    },
}

/// Observer interface for engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &EngineEvent);
}

/// Default sink: structured log lines via tracing.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &EngineEvent) {
        match event {
            EngineEvent::Malformed {
                job_id,
                stage,
                category,
                message,
            } => {
                tracing::warn!(
                    job_id = %job_id,
                    stage = stage.as_str(),
                    category = %category,
                    "malformed model response: {message}"
                );
            }
            EngineEvent::RepairAttempt {
                job_id,
                stage,
                attempt,
            } => {
                tracing::info!(
                    job_id = %job_id,
                    stage = stage.as_str(),
                    attempt = attempt,
                    "attempting model response repair"
                );
            }
            EngineEvent::RepairSuccess { job_id, stage } => {
                tracing::info!(job_id = %job_id, stage = stage.as_str(), "repair succeeded");
            }
            EngineEvent::RepairFailure {
                job_id,
                stage,
                message,
            } => {
                tracing::warn!(
                    job_id = %job_id,
                    stage = stage.as_str(),
                    "repair failed: {message}"
                );
            }
            EngineEvent::ExecutionProgress {
                job_id,
                total,
                completed,
            } => {
                tracing::debug!(
                    job_id = %job_id,
                    total = total,
                    completed = completed,
                    "cycle progress"
                );
            }
            EngineEvent::EndpointProgress {
                job_id,
                endpoint_id,
                status,
                attempt,
                error,
            } => {
                tracing::debug!(
                    job_id = %job_id,
                    endpoint_id = %endpoint_id,
                    status = status.as_str(),
                    attempt = attempt,
                    error = error.as_deref().unwrap_or(""),
                    "endpoint progress"
                );
            }
            EngineEvent::Escalation {
                job_id,
                level,
                failure_count,
                aborted_count,
                recovery_action,
            } => {
                tracing::warn!(
                    job_id = %job_id,
                    level = %level,
                    failures = failure_count,
                    aborted = aborted_count,
                    recovery = %recovery_action,
                    "escalation level changed"
                );
            }
        }
    }
}

/// Sink that drops everything. Useful for tests and embedding.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &EngineEvent) {}
}
