//! Plan and schedule cores.
//!
//! Two near-identical pipelines around one structured-output model call:
//! optimize context, compose prompts, generate against a schema, validate
//! semantics (salvaging where safe), and re-prompt once with a rescue
//! prompt when the response was malformed.

pub mod prompts;
pub mod semantics;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cadence_api::{
    EndpointExecutionResult, ExecutionPlan, ExecutionStrategy, ExecutionSummary, JobContext,
    PlannedCall, RecommendedAction, ScheduleDecision, TokenUsage,
};
use cadence_llm::{GenerateRequest, LanguageModel, ModelError, StructuredOutput, Usage};

use crate::config::{AiConfig, PromptConfig, RepairConfig};
use crate::events::{AgentStage, EngineEvent, EventSink};
use crate::optimizer::optimize_context;

/// Wire shape of the planner's response. `usage` is attached after the
/// call, so the schema only declares what the model authors.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanOutput {
    pub endpoints_to_call: Vec<PlannedCall>,
    pub execution_strategy: ExecutionStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub concurrency_limit: Option<usize>,
    /// ISO-8601; validated as a parseable future timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preliminary_next_run_at: Option<String>,
    pub reasoning: String,
    #[schemars(range(min = 0.0, max = 1.0))]
    pub confidence: f64,
}

/// Wire shape of the scheduler's response.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleOutput {
    /// ISO-8601; must be strictly in the future unless the decision pauses
    /// the job.
    pub next_run_at: String,
    pub reasoning: String,
    #[schemars(range(min = 0.0, max = 1.0))]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_actions: Option<Vec<RecommendedAction>>,
}

/// A validated output plus the accounting for producing it.
#[derive(Debug, Clone)]
pub struct AgentOutcome<T> {
    pub output: T,
    pub usage: TokenUsage,
    /// Model invocations made, including the repair pass.
    pub model_calls: u64,
}

/// Output types the shared generate/validate/repair loop can produce.
trait AgentOutput: StructuredOutput + Serialize {
    const STAGE: AgentStage;

    fn apply_semantics(&mut self, now: DateTime<Utc>, strict: bool) -> Result<(), ModelError>;
}

impl AgentOutput for PlanOutput {
    const STAGE: AgentStage = AgentStage::Planner;

    fn apply_semantics(&mut self, now: DateTime<Utc>, strict: bool) -> Result<(), ModelError> {
        semantics::validate_plan(self, now, strict)
    }
}

impl AgentOutput for ScheduleOutput {
    const STAGE: AgentStage = AgentStage::Scheduler;

    fn apply_semantics(&mut self, now: DateTime<Utc>, strict: bool) -> Result<(), ModelError> {
        semantics::validate_schedule(self, now, strict)
    }
}

/// The shared machinery behind [`Planner`] and [`Scheduler`].
pub struct AgentCore<'a> {
    pub model: &'a dyn LanguageModel,
    pub ai: &'a AiConfig,
    pub prompt: &'a PromptConfig,
    pub repair: &'a RepairConfig,
    pub events: &'a dyn EventSink,
}

impl AgentCore<'_> {
    /// One model call: generate, account usage, deserialize, validate.
    async fn attempt<T: AgentOutput>(
        &self,
        request: &GenerateRequest,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
        usage: &mut TokenUsage,
        model_calls: &mut u64,
    ) -> Result<T, ModelError> {
        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ModelError::Unknown("generation cancelled".to_string()));
            }
            result = self.model.generate(request) => result?,
        };
        *model_calls += 1;
        usage.add(&to_token_usage(response.usage));

        let mut output: T = serde_json::from_value(response.value)
            .map_err(|e| ModelError::SchemaParse(format!("response violates schema: {e}")))?;

        if self.repair.validate_semantics {
            output.apply_semantics(now, self.repair.semantic_strict)?;
        }
        Ok(output)
    }

    /// Generate with semantic validation and, when enabled, a bounded
    /// rescue-prompt repair pass for malformed responses.
    async fn generate_validated<T: AgentOutput>(
        &self,
        job_id: Uuid,
        system: String,
        user: String,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome<T>, ModelError> {
        let mut usage = TokenUsage::default();
        let mut model_calls = 0u64;

        let request = GenerateRequest {
            system: system.clone(),
            user: user.clone(),
            schema_name: <T as StructuredOutput>::schema_name(),
            schema: T::output_schema(),
            temperature: self.ai.temperature,
            max_retries: self.ai.max_retries,
        };

        let first = self
            .attempt::<T>(&request, now, cancel, &mut usage, &mut model_calls)
            .await;

        let mut last_error = match first {
            Ok(output) => {
                return Ok(AgentOutcome {
                    output,
                    usage,
                    model_calls,
                });
            }
            Err(err) => err,
        };

        if last_error.is_repairable() {
            self.events.emit(&EngineEvent::Malformed {
                job_id,
                stage: T::STAGE,
                category: last_error.category().to_string(),
                message: last_error.to_string(),
            });
        }

        if !self.repair.repair_malformed_responses || !last_error.is_repairable() {
            return Err(last_error);
        }

        for repair_attempt in 1..=self.repair.max_repair_attempts {
            self.events.emit(&EngineEvent::RepairAttempt {
                job_id,
                stage: T::STAGE,
                attempt: repair_attempt,
            });

            // Rescue pass runs deterministically.
            let rescue = GenerateRequest {
                system: system.clone(),
                user: prompts::rescue_user(&user, &last_error.to_string()),
                schema_name: <T as StructuredOutput>::schema_name(),
                schema: T::output_schema(),
                temperature: 0.0,
                max_retries: self.ai.max_retries,
            };

            match self
                .attempt::<T>(&rescue, now, cancel, &mut usage, &mut model_calls)
                .await
            {
                Ok(output) => {
                    self.events.emit(&EngineEvent::RepairSuccess {
                        job_id,
                        stage: T::STAGE,
                    });
                    return Ok(AgentOutcome {
                        output,
                        usage,
                        model_calls,
                    });
                }
                Err(err) => {
                    self.events.emit(&EngineEvent::RepairFailure {
                        job_id,
                        stage: T::STAGE,
                        message: err.to_string(),
                    });
                    last_error = err;
                    if !last_error.is_repairable() {
                        break;
                    }
                }
            }
        }

        Err(last_error)
    }
}

/// Produces an [`ExecutionPlan`] for one cycle.
pub struct Planner<'a> {
    pub core: AgentCore<'a>,
}

impl Planner<'_> {
    pub async fn plan(
        &self,
        context: &JobContext,
        environment: cadence_api::SystemEnvironment,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome<ExecutionPlan>, ModelError> {
        let trimmed = optimize_context(context, self.core.prompt);
        let system = prompts::planner_system(environment);
        let user = prompts::planner_user(&trimmed, now);

        let outcome = self
            .core
            .generate_validated::<PlanOutput>(context.job.id, system, user, now, cancel)
            .await?;

        let plan = into_plan(outcome.output, &outcome.usage);
        Ok(AgentOutcome {
            output: plan,
            usage: outcome.usage,
            model_calls: outcome.model_calls,
        })
    }
}

/// Produces a [`ScheduleDecision`] after execution.
pub struct Scheduler<'a> {
    pub core: AgentCore<'a>,
}

impl Scheduler<'_> {
    pub async fn schedule(
        &self,
        context: &JobContext,
        results: &[EndpointExecutionResult],
        summary: &ExecutionSummary,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome<ScheduleDecision>, ModelError> {
        let trimmed = optimize_context(context, self.core.prompt);
        let system = prompts::scheduler_system();
        let user = prompts::scheduler_user(&trimmed, results, summary, now);

        let outcome = self
            .core
            .generate_validated::<ScheduleOutput>(context.job.id, system, user, now, cancel)
            .await?;

        let decision = into_decision(outcome.output, &outcome.usage)?;
        Ok(AgentOutcome {
            output: decision,
            usage: outcome.usage,
            model_calls: outcome.model_calls,
        })
    }
}

fn into_plan(output: PlanOutput, usage: &TokenUsage) -> ExecutionPlan {
    // Semantics already dropped unparseable or past values.
    let preliminary = output
        .preliminary_next_run_at
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc));

    ExecutionPlan {
        endpoints_to_call: output.endpoints_to_call,
        execution_strategy: output.execution_strategy,
        concurrency_limit: output.concurrency_limit,
        preliminary_next_run_at: preliminary,
        reasoning: output.reasoning,
        confidence: output.confidence,
        usage: (!usage.is_zero()).then_some(*usage),
    }
}

fn into_decision(
    output: ScheduleOutput,
    usage: &TokenUsage,
) -> Result<ScheduleDecision, ModelError> {
    // Semantics guarantee the timestamp parses by this point.
    let next_run_at = DateTime::parse_from_rfc3339(&output.next_run_at)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            ModelError::SemanticViolation(format!(
                "nextRunAt {:?} is unparseable: {e}",
                output.next_run_at
            ))
        })?;

    Ok(ScheduleDecision {
        next_run_at,
        reasoning: output.reasoning,
        confidence: output.confidence,
        recommended_actions: output.recommended_actions,
        usage: (!usage.is_zero()).then_some(*usage),
    })
}

fn to_token_usage(usage: Usage) -> TokenUsage {
    TokenUsage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        reasoning_tokens: usage.reasoning_tokens,
        cached_input_tokens: usage.cached_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_output_schema_declares_camel_case_fields() {
        let schema = PlanOutput::output_schema();
        let text = serde_json::to_string(&schema).unwrap();
        assert!(text.contains("endpointsToCall"));
        assert!(text.contains("executionStrategy"));
        assert!(text.contains("concurrencyLimit"));
        assert!(!text.contains("usage"), "usage is attached post-call, not model-authored");
    }

    #[test]
    fn schedule_output_schema_bounds_confidence() {
        let schema = ScheduleOutput::output_schema();
        let text = serde_json::to_string(&schema).unwrap();
        assert!(text.contains("nextRunAt"));
        assert!(text.contains("recommendedActions"));
    }

    #[test]
    fn into_plan_parses_preliminary_timestamp() {
        let future = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        let output = PlanOutput {
            endpoints_to_call: vec![],
            execution_strategy: ExecutionStrategy::Sequential,
            concurrency_limit: None,
            preliminary_next_run_at: Some(future),
            reasoning: "r".into(),
            confidence: 0.5,
        };
        let plan = into_plan(output, &TokenUsage::default());
        assert!(plan.preliminary_next_run_at.is_some());
        assert!(plan.usage.is_none(), "zero usage is omitted");
    }

    #[test]
    fn into_decision_surfaces_usage() {
        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 10,
            total_tokens: 20,
            ..Default::default()
        };
        let output = ScheduleOutput {
            next_run_at: (Utc::now() + chrono::Duration::hours(1)).to_rfc3339(),
            reasoning: "r".into(),
            confidence: 0.7,
            recommended_actions: None,
        };
        let decision = into_decision(output, &usage).unwrap();
        assert_eq!(decision.usage.unwrap().total_tokens, 20);
    }
}
