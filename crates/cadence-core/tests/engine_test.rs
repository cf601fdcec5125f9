//! Cycle-runner tests: aggregation, leasing exclusivity across engines,
//! counter monotonicity, and lifecycle.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use cadence_core::config::EngineConfig;
use cadence_core::{Engine, EngineStatus, NullSink};
use cadence_llm::ModelError;
use cadence_test_utils::{
    MemoryApi, ScriptedModel, context_for, due_job, get_endpoint, spawn_endpoint_server,
};

fn plan_json(endpoint_id: &str) -> serde_json::Value {
    json!({
        "endpointsToCall": [
            {"endpointId": endpoint_id, "priority": 1, "critical": false}
        ],
        "executionStrategy": "sequential",
        "reasoning": "poll it",
        "confidence": 0.9,
    })
}

fn schedule_json() -> serde_json::Value {
    json!({
        "nextRunAt": (Utc::now() + chrono::Duration::hours(1)).to_rfc3339(),
        "reasoning": "hourly",
        "confidence": 0.9,
    })
}

fn engine_with(api: Arc<MemoryApi>, model: Arc<ScriptedModel>) -> Engine {
    Engine::new(api, model, EngineConfig::default(), Arc::new(NullSink))
}

#[tokio::test]
async fn cycle_aggregates_success_and_failure() {
    let server = spawn_endpoint_server().await;
    let api = Arc::new(MemoryApi::new());
    let model = Arc::new(ScriptedModel::new());

    let good = due_job("healthy job");
    let good_id = good.id;
    let endpoint = get_endpoint(good_id, "e1", &server.url("/health"));
    api.insert_job(context_for(good, vec![endpoint]));

    let bad = due_job("doomed job");
    let bad_id = api.insert_job(context_for(bad, vec![]));

    // Jobs process serially in insertion order at the default concurrency,
    // so the script lines up: good planner, good scheduler, bad planner.
    model.push_value(plan_json("e1"));
    model.push_value(schedule_json());
    model.push_error(ModelError::Auth("401".into()));

    let engine = engine_with(api.clone(), model);
    let result = engine.process_cycle().await.unwrap();

    assert_eq!(result.jobs_processed, 2);
    assert_eq!(result.successful_jobs, 1);
    assert_eq!(result.failed_jobs, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].code, "plan_error");
    assert_eq!(result.errors[0].job_id, Some(bad_id));

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.stats.jobs_processed, 2);
    assert_eq!(snapshot.stats.successful_jobs, 1);
    assert_eq!(snapshot.stats.failed_jobs, 1);
    assert!(snapshot.last_processing_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cycles_process_each_job_at_most_once() {
    let server = spawn_endpoint_server().await;
    let api = Arc::new(MemoryApi::new());

    let job = due_job("contended job");
    let job_id = job.id;
    // Slow endpoint keeps the winning engine's lease held while the other
    // engine races for it.
    let endpoint = get_endpoint(job_id, "slow", &server.url("/slow/300"));
    api.insert_job(context_for(job, vec![endpoint]));

    // Each engine gets its own generously stocked script.
    let model_a = Arc::new(ScriptedModel::new());
    let model_b = Arc::new(ScriptedModel::new());
    for model in [&model_a, &model_b] {
        model.push_value(plan_json("slow"));
        model.push_value(schedule_json());
    }

    let engine_a = engine_with(api.clone(), model_a);
    let engine_b = engine_with(api.clone(), model_b);

    let (a, b) = tokio::join!(engine_a.process_cycle(), engine_b.process_cycle());
    let (a, b) = (a.unwrap(), b.unwrap());

    // Exactly one engine ran the job; the other skipped on lock denial.
    assert_eq!(a.successful_jobs + b.successful_jobs, 1);
    assert_eq!(a.failed_jobs + b.failed_jobs, 0);

    let record = api.record(job_id);
    assert_eq!(record.lock_count, 1, "only one lease may be acquired");
    assert_eq!(record.unlock_count, 1);
    assert_eq!(record.plans.len(), 1, "the job ran exactly once");
    assert_eq!(record.summaries.len(), 1);
}

#[tokio::test]
async fn token_counters_never_decrease_across_cycles() {
    let server = spawn_endpoint_server().await;
    let api = Arc::new(MemoryApi::new());
    let model = Arc::new(ScriptedModel::new());

    let job = due_job("recurring job");
    let job_id = job.id;
    let endpoint = get_endpoint(job_id, "e1", &server.url("/health"));
    api.insert_job(context_for(job, vec![endpoint]));

    for _ in 0..3 {
        model.push_value_with_usage(
            plan_json("e1"),
            cadence_llm::Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
                ..Default::default()
            },
        );
        model.push_value_with_usage(
            schedule_json(),
            cadence_llm::Usage {
                prompt_tokens: 4,
                completion_tokens: 2,
                total_tokens: 6,
                ..Default::default()
            },
        );
    }

    let engine = engine_with(api.clone(), model);

    let mut last_total = 0;
    for _ in 0..3 {
        api.set_due(job_id);
        engine.process_cycle().await.unwrap();
        let total = engine.snapshot().stats.token_usage.total_tokens;
        assert!(total >= last_total, "token counters must be monotonic");
        last_total = total;
    }
    assert_eq!(last_total, 63, "3 cycles x 21 tokens");
}

#[tokio::test]
async fn rescheduled_jobs_are_not_due_next_cycle() {
    let server = spawn_endpoint_server().await;
    let api = Arc::new(MemoryApi::new());
    let model = Arc::new(ScriptedModel::new());

    let job = due_job("once an hour");
    let job_id = job.id;
    let endpoint = get_endpoint(job_id, "e1", &server.url("/health"));
    api.insert_job(context_for(job, vec![endpoint]));

    model.push_value(plan_json("e1"));
    model.push_value(schedule_json());

    let engine = engine_with(api.clone(), model.clone());
    let first = engine.process_cycle().await.unwrap();
    assert_eq!(first.successful_jobs, 1);

    // nextRunAt moved an hour out; the next cycle finds nothing to do.
    let second = engine.process_cycle().await.unwrap();
    assert_eq!(second.jobs_processed, 0);
    assert_eq!(model.call_count(), 2, "no further model calls");
    assert_eq!(api.record(job_id).plans.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_and_stop_transition_the_lifecycle() {
    let api = Arc::new(MemoryApi::new());
    let model = Arc::new(ScriptedModel::new());
    let engine = engine_with(api, model);

    assert_eq!(engine.snapshot().status, EngineStatus::Stopped);

    engine.start();
    assert_eq!(engine.snapshot().status, EngineStatus::Running);
    assert!(engine.snapshot().started_at.is_some());

    // Let the immediate first tick run its (empty) cycle.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    engine.stop().await;
    let snapshot = engine.snapshot();
    assert_eq!(snapshot.status, EngineStatus::Stopped);
    assert!(snapshot.stopped_at.is_some());
}
