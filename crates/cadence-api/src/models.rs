//! Domain entities exchanged with the scheduler façade.
//!
//! All types serialize with camelCase field names, matching the JSON bodies
//! of the collaborator REST routes.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Active,
    Paused,
    Archived,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Archived => "ARCHIVED",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "PAUSED" => Ok(Self::Paused),
            "ARCHIVED" => Ok(Self::Archived),
            other => Err(EnumParseError::new("job status", other)),
        }
    }
}

/// Per-cycle execution status reported back to the façade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            other => Err(EnumParseError::new("execution status", other)),
        }
    }
}

/// Role of a job message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        };
        f.write_str(s)
    }
}

impl FromStr for MessageRole {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            other => Err(EnumParseError::new("message role", other)),
        }
    }
}

/// HTTP method of a job endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "PATCH")]
    Patch,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "HEAD")]
    Head,
}

impl HttpMethod {
    /// Whether parameters travel in the query string instead of the body.
    pub fn is_get_like(self) -> bool {
        matches!(self, Self::Get | Self::Head)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
        };
        f.write_str(s)
    }
}

impl FromStr for HttpMethod {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "HEAD" => Ok(Self::Head),
            other => Err(EnumParseError::new("http method", other)),
        }
    }
}

/// Execution strategy chosen by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    #[default]
    Sequential,
    Parallel,
    Mixed,
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Mixed => "mixed",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStrategy {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            "mixed" => Ok(Self::Mixed),
            other => Err(EnumParseError::new("execution strategy", other)),
        }
    }
}

/// Severity derived from a cycle's endpoint failure ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    #[default]
    None,
    Warn,
    Critical,
}

impl fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Warn => "warn",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Engine response to an escalation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryAction {
    #[default]
    None,
    BackoffOnly,
    ReduceConcurrency,
    DisableEndpoint,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "NONE",
            Self::BackoffOnly => "BACKOFF_ONLY",
            Self::ReduceConcurrency => "REDUCE_CONCURRENCY",
            Self::DisableEndpoint => "DISABLE_ENDPOINT",
        };
        f.write_str(s)
    }
}

/// Advisory action type attached to a schedule decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedActionType {
    RetryFailedEndpoints,
    PauseJob,
    ModifyFrequency,
    NotifyUser,
    AdjustTimeout,
}

/// Priority of a recommended action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ActionPriority {
    Low,
    Medium,
    High,
}

/// Deployment environment the job executes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SystemEnvironment {
    #[default]
    Production,
    Development,
    Test,
}

impl FromStr for SystemEnvironment {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "production" => Ok(Self::Production),
            "development" => Ok(Self::Development),
            "test" => Ok(Self::Test),
            other => Err(EnumParseError::new("system environment", other)),
        }
    }
}

/// Error returned when parsing an invalid enum wire value.
#[derive(Debug, Clone)]
pub struct EnumParseError {
    kind: &'static str,
    value: String,
}

impl EnumParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for EnumParseError {}

// ---------------------------------------------------------------------------
// Token accounting
// ---------------------------------------------------------------------------

/// Token usage counters, either for a single model call or cumulative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
}

impl TokenUsage {
    /// Accumulate another usage record into this one.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
        self.cached_input_tokens += other.cached_input_tokens;
    }

    pub fn is_zero(&self) -> bool {
        self.total_tokens == 0 && self.input_tokens == 0 && self.output_tokens == 0
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// A user-defined job: a natural-language definition plus a set of HTTP
/// endpoints, scheduled adaptively by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub definition: String,
    pub status: JobStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub locked: bool,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub user_id: String,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub default_headers: Option<HashMap<String, String>>,
}

/// An HTTP endpoint owned by a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub id: String,
    pub job_id: Uuid,
    pub name: String,
    pub url: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// JSON schema describing the parameters the endpoint accepts.
    #[serde(default)]
    pub request_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub request_size_limit: Option<usize>,
    #[serde(default)]
    pub response_size_limit: Option<usize>,
    #[serde(default)]
    pub fire_and_forget: bool,
    #[serde(default)]
    pub default_headers: Option<HashMap<String, String>>,
}

/// One part of a structured message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text { text: String },
    Image { image: String },
    File { data: String, media_type: String },
    ToolCall { tool_name: String, input: serde_json::Value },
    Reasoning { text: String },
    RedactedReasoning { data: String },
}

/// Message content: a plain string or an array of structured parts.
///
/// The engine only discriminates string vs. structured; parts are carried
/// opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<MessagePart>),
}

impl MessageContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Parts(_) => None,
        }
    }
}

/// An append-only record in a job's conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: MessageRole,
    pub content: MessageContent,
    #[serde(default)]
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-execution usage record for an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointUsage {
    pub endpoint_id: String,
    pub timestamp: DateTime<Utc>,
    pub request_size: usize,
    pub response_size: usize,
    pub execution_time_ms: u64,
    pub status_code: u16,
    pub success: bool,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Everything the engine needs to process one job for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobContext {
    pub job: Job,
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub endpoint_usage: Vec<EndpointUsage>,
}

// ---------------------------------------------------------------------------
// Planner / scheduler outputs
// ---------------------------------------------------------------------------

/// One endpoint invocation requested by the planner.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlannedCall {
    pub endpoint_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
    #[serde(default)]
    pub critical: bool,
}

/// The planner's decision for a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub endpoints_to_call: Vec<PlannedCall>,
    pub execution_strategy: ExecutionStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preliminary_next_run_at: Option<DateTime<Utc>>,
    pub reasoning: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// Outcome of one endpoint invocation (including all retry attempts).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointExecutionResult {
    pub endpoint_id: String,
    pub success: bool,
    /// 0 when the transport failed before any response arrived.
    pub status_code: u16,
    pub execution_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_content: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub request_size: usize,
    pub response_size: usize,
    #[serde(default)]
    pub truncated: bool,
    pub attempts: u32,
    #[serde(default)]
    pub aborted: bool,
}

/// Aggregate outcome of one job cycle's endpoint executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_duration_ms: u64,
    pub success_count: usize,
    pub failure_count: usize,
    pub aborted_count: usize,
    pub escalation_level: EscalationLevel,
    pub recovery_action: RecoveryAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_endpoints: Option<Vec<String>>,
}

/// Advisory action the scheduler may attach to a decision.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedAction {
    #[serde(rename = "type")]
    pub action_type: RecommendedActionType,
    pub details: String,
    pub priority: ActionPriority,
}

/// The scheduler's decision for when the job should next run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDecision {
    pub next_run_at: DateTime<Utc>,
    pub reasoning: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_actions: Option<Vec<RecommendedAction>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
