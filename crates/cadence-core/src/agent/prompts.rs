//! Prompt composition for the planner and scheduler cores.

use chrono::{DateTime, Utc};

use cadence_api::{
    EndpointExecutionResult, ExecutionSummary, JobContext, Message, MessageContent,
    SystemEnvironment,
};

pub fn planner_system(environment: SystemEnvironment) -> String {
    format!(
        "You are the execution planner of an adaptive job scheduler running in the {env:?} environment.\n\
         Given a job definition, its HTTP endpoints, recent conversation history, and recent \
         endpoint usage, decide which endpoints to call this cycle.\n\
         Rules:\n\
         - Reference endpoints only by the ids listed in the catalog.\n\
         - Choose executionStrategy: sequential for ordered work, parallel for independent \
           endpoints, mixed when some endpoints depend on the output of others.\n\
         - Use dependsOn only with the mixed strategy, and never create cycles.\n\
         - Lower priority numbers run first.\n\
         - Mark an endpoint critical only when downstream work is meaningless after its failure.\n\
         - parallel plans must set concurrencyLimit to at least 2.\n\
         - Set preliminaryNextRunAt only when you already know the job should run again at a \
           specific future time.\n\
         Respond with a single JSON object matching the requested schema.",
        env = environment
    )
}

pub fn planner_user(context: &JobContext, now: DateTime<Utc>) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!("Current time: {}\n\n", now.to_rfc3339()));
    prompt.push_str(&format!("Job definition:\n{}\n\n", context.job.definition));

    prompt.push_str("Endpoint catalog:\n");
    for endpoint in &context.endpoints {
        prompt.push_str(&format!(
            "- id={} name={:?} method={} url={}",
            endpoint.id, endpoint.name, endpoint.method, endpoint.url
        ));
        if endpoint.fire_and_forget {
            prompt.push_str(" fire-and-forget");
        }
        if let Some(schema) = &endpoint.request_schema {
            prompt.push_str(&format!(" parameters-schema={schema}"));
        }
        prompt.push('\n');
    }

    if !context.messages.is_empty() {
        prompt.push_str("\nRecent history:\n");
        for message in &context.messages {
            prompt.push_str(&render_message(message));
            prompt.push('\n');
        }
    }

    if !context.endpoint_usage.is_empty() {
        prompt.push_str("\nRecent endpoint usage:\n");
        for usage in &context.endpoint_usage {
            prompt.push_str(&format!(
                "- {} at {}: status={} success={} {}ms",
                usage.endpoint_id,
                usage.timestamp.to_rfc3339(),
                usage.status_code,
                usage.success,
                usage.execution_time_ms
            ));
            if let Some(error) = &usage.error_message {
                prompt.push_str(&format!(" error={error:?}"));
            }
            prompt.push('\n');
        }
    }

    prompt
}

pub fn scheduler_system() -> String {
    "You are the scheduler of an adaptive job engine. Given the job definition, recent \
     history, and the outcome of the cycle that just finished, decide when the job should \
     next run.\n\
     Rules:\n\
     - nextRunAt must be an ISO-8601 timestamp strictly in the future.\n\
     - Back off when endpoints are failing; run sooner when the definition demands \
       freshness.\n\
     - Use recommendedActions to flag follow-ups (retry_failed_endpoints, pause_job, \
       modify_frequency, notify_user, adjust_timeout) instead of encoding them in prose.\n\
     Respond with a single JSON object matching the requested schema."
        .to_string()
}

pub fn scheduler_user(
    context: &JobContext,
    results: &[EndpointExecutionResult],
    summary: &ExecutionSummary,
    now: DateTime<Utc>,
) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!("Current time: {}\n\n", now.to_rfc3339()));
    prompt.push_str(&format!("Job definition:\n{}\n\n", context.job.definition));

    prompt.push_str(&format!(
        "Cycle summary: {} succeeded, {} failed, {} aborted in {} ms; escalation={} recovery={}\n\n",
        summary.success_count,
        summary.failure_count,
        summary.aborted_count,
        summary.total_duration_ms,
        summary.escalation_level,
        summary.recovery_action
    ));

    if !results.is_empty() {
        prompt.push_str("Endpoint results:\n");
        for result in results {
            prompt.push_str(&format!(
                "- {}: success={} status={} attempts={} {}ms",
                result.endpoint_id,
                result.success,
                result.status_code,
                result.attempts,
                result.execution_time_ms
            ));
            if let Some(error) = &result.error {
                prompt.push_str(&format!(" error={error:?}"));
            }
            if let Some(content) = &result.response_content {
                prompt.push_str(&format!(" response={content}"));
            }
            prompt.push('\n');
        }
    }

    if !context.messages.is_empty() {
        prompt.push_str("\nRecent history:\n");
        for message in &context.messages {
            prompt.push_str(&render_message(message));
            prompt.push('\n');
        }
    }

    prompt
}

/// Rescue prompt for the one-shot repair pass: quote the failure and demand
/// a corrected object.
pub fn rescue_user(original_user: &str, error: &str) -> String {
    format!(
        "Your previous response was rejected:\n{error}\n\n\
         Produce a corrected JSON object that strictly conforms to the requested schema and \
         avoids the problem above. Respond with the JSON object only.\n\n\
         The original request follows.\n\n{original_user}"
    )
}

fn render_message(message: &Message) -> String {
    let body = match &message.content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => {
            serde_json::to_string(parts).unwrap_or_else(|_| "[unrenderable parts]".to_string())
        }
    };
    match &message.source {
        Some(source) => format!("[{}] ({source}) {body}", message.role),
        None => format!("[{}] {body}", message.role),
    }
}
