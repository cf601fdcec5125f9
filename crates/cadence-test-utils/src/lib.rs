//! Shared test doubles for cadence integration tests.
//!
//! An in-memory scheduler façade with real compare-and-set lease semantics,
//! a scripted language model, a local HTTP server exercising the endpoint
//! executor for real, and fixture builders.

pub mod api;
pub mod model;
pub mod server;

pub use api::{JobRecord, MemoryApi};
pub use model::ScriptedModel;
pub use server::{EndpointServer, spawn_endpoint_server};

use chrono::Utc;
use uuid::Uuid;

use cadence_api::{
    Endpoint, ExecutionPlan, ExecutionStrategy, HttpMethod, Job, JobContext, JobStatus,
    PlannedCall, TokenUsage,
};

/// An ACTIVE job due now.
pub fn due_job(definition: &str) -> Job {
    Job {
        id: Uuid::new_v4(),
        definition: definition.to_string(),
        status: JobStatus::Active,
        next_run_at: Some(Utc::now()),
        locked: false,
        lock_expires_at: None,
        user_id: "test-user".to_string(),
        token_usage: TokenUsage::default(),
        default_headers: None,
    }
}

/// A GET endpoint pointing at `url`.
pub fn get_endpoint(job_id: Uuid, id: &str, url: &str) -> Endpoint {
    Endpoint {
        id: id.to_string(),
        job_id,
        name: id.to_string(),
        url: url.to_string(),
        method: HttpMethod::Get,
        bearer_token: None,
        request_schema: None,
        timeout_ms: Some(5_000),
        request_size_limit: None,
        response_size_limit: None,
        fire_and_forget: false,
        default_headers: None,
    }
}

/// A context wrapping the given job and endpoints with empty history.
pub fn context_for(job: Job, endpoints: Vec<Endpoint>) -> JobContext {
    JobContext {
        job,
        endpoints,
        messages: Vec::new(),
        endpoint_usage: Vec::new(),
    }
}

/// A plan call with defaults.
pub fn planned_call(endpoint_id: &str, priority: i32) -> PlannedCall {
    PlannedCall {
        endpoint_id: endpoint_id.to_string(),
        parameters: None,
        headers: None,
        priority,
        depends_on: None,
        critical: false,
    }
}

/// A plan over the given calls.
pub fn plan(calls: Vec<PlannedCall>, strategy: ExecutionStrategy) -> ExecutionPlan {
    ExecutionPlan {
        endpoints_to_call: calls,
        execution_strategy: strategy,
        concurrency_limit: None,
        preliminary_next_run_at: None,
        reasoning: "test plan".to_string(),
        confidence: 0.9,
        usage: None,
    }
}
