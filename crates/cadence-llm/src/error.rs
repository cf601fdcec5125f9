//! Model-call error taxonomy.
//!
//! The bracketed category prefix in each message is part of the contract:
//! callers surface it verbatim in persisted job errors, and the repair path
//! keys off [`ModelError::is_repairable`].

use thiserror::Error;

/// Result type for language-model operations.
pub type ModelResult<T> = std::result::Result<T, ModelError>;

/// Errors from a structured-output model call.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The response arrived but could not be parsed against the schema.
    #[error("[schema_parse_error] {0}")]
    SchemaParse(String),

    /// The response parsed but violated a semantic rule.
    #[error("[semantic_violation] {0}")]
    SemanticViolation(String),

    #[error("[timeout] {0}")]
    Timeout(String),

    #[error("[rate_limit] {0}")]
    RateLimit(String),

    #[error("[auth_error] {0}")]
    Auth(String),

    #[error("[network] {0}")]
    Network(String),

    #[error("[unknown] {0}")]
    Unknown(String),
}

impl ModelError {
    /// Category slug matching the bracketed prefix.
    pub fn category(&self) -> &'static str {
        match self {
            Self::SchemaParse(_) => "schema_parse_error",
            Self::SemanticViolation(_) => "semantic_violation",
            Self::Timeout(_) => "timeout",
            Self::RateLimit(_) => "rate_limit",
            Self::Auth(_) => "auth_error",
            Self::Network(_) => "network",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Whether a corrective re-prompt can plausibly fix this failure.
    ///
    /// Only malformed or semantically invalid responses are worth a rescue
    /// prompt; transport and auth failures are not the model's fault.
    pub fn is_repairable(&self) -> bool {
        matches!(self, Self::SchemaParse(_) | Self::SemanticViolation(_))
    }

    /// Whether the provider call itself is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::RateLimit(_) | Self::Network(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_matches_message_prefix() {
        let cases: Vec<ModelError> = vec![
            ModelError::SchemaParse("x".into()),
            ModelError::SemanticViolation("x".into()),
            ModelError::Timeout("x".into()),
            ModelError::RateLimit("x".into()),
            ModelError::Auth("x".into()),
            ModelError::Network("x".into()),
            ModelError::Unknown("x".into()),
        ];
        for err in cases {
            let expected = format!("[{}]", err.category());
            assert!(
                err.to_string().starts_with(&expected),
                "message {:?} should start with {}",
                err.to_string(),
                expected
            );
        }
    }

    #[test]
    fn only_malformed_responses_are_repairable() {
        assert!(ModelError::SchemaParse("bad json".into()).is_repairable());
        assert!(ModelError::SemanticViolation("cycle".into()).is_repairable());
        assert!(!ModelError::RateLimit("429".into()).is_repairable());
        assert!(!ModelError::Auth("401".into()).is_repairable());
    }

    #[test]
    fn transport_failures_are_transient() {
        assert!(ModelError::Timeout("t".into()).is_transient());
        assert!(ModelError::RateLimit("r".into()).is_transient());
        assert!(ModelError::Network("n".into()).is_transient());
        assert!(!ModelError::SchemaParse("p".into()).is_transient());
        assert!(!ModelError::Auth("a".into()).is_transient());
    }
}
