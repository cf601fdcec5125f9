//! Scripted language model: returns canned responses in order and records
//! every request it sees.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use cadence_llm::{GenerateRequest, GenerateResponse, LanguageModel, ModelError, ModelResult, Usage};

/// A recorded request, for assertions on prompt composition.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub system: String,
    pub user: String,
    pub schema_name: String,
    pub temperature: f32,
}

/// Scripted [`LanguageModel`]. Pops one scripted response per `generate`
/// call; runs dry with an error once the script is exhausted.
#[derive(Default)]
pub struct ScriptedModel {
    script: Mutex<VecDeque<ModelResult<GenerateResponse>>>,
    seen: Mutex<Vec<SeenRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a JSON value as the next successful response.
    pub fn push_value(&self, value: serde_json::Value) {
        self.push_value_with_usage(value, Usage::default());
    }

    /// Queue a JSON value with explicit token usage.
    pub fn push_value_with_usage(&self, value: serde_json::Value, usage: Usage) {
        self.script
            .lock()
            .unwrap()
            .push_back(Ok(GenerateResponse { value, usage }));
    }

    /// Queue an error as the next response.
    pub fn push_error(&self, error: ModelError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    /// Requests observed so far.
    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }

    /// Number of `generate` calls made.
    pub fn call_count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(&self, request: &GenerateRequest) -> ModelResult<GenerateResponse> {
        self.seen.lock().unwrap().push(SeenRequest {
            system: request.system.clone(),
            user: request.user.clone(),
            schema_name: request.schema_name.clone(),
            temperature: request.temperature,
        });
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::Unknown("scripted model ran dry".to_string())))
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}
