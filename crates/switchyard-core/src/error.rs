//! Error types for Switchyard

use thiserror::Error;

/// Result type alias using Switchyard's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Switchyard error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Config errors (E100-E199)
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown policy '{0}'. Registered policies: epsilon_greedy, lin_ts, bootstrap_ucb, neural_ucb.")]
    UnknownPolicy(String),

    // Arm errors (E200-E299)
    #[error("Arm '{0}' is not registered.")]
    UnknownArm(String),

    #[error("No candidate arms available: {0}")]
    NoCandidates(String),

    // Policy errors (E300-E399)
    #[error("Policy '{policy}' numerical failure: {reason}")]
    PolicyNumerical { policy: String, reason: String },

    #[error("Policy '{0}' is unavailable")]
    PolicyUnavailable(String),

    // Cache errors (E400-E499)
    #[error("Invalid embedding: {0}")]
    InvalidEmbedding(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    // Experiment errors (E500-E599)
    #[error("Experiment '{0}' not found")]
    ExperimentNotFound(String),

    #[error("Experiment '{id}' cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Experiment '{0}' is not ready to advance: {1}")]
    NotReadyToAdvance(String, String),

    // Runtime errors (E600-E699)
    #[error("Deadline exceeded during {0}")]
    DeadlineExceeded(&'static str),

    #[error("Reward updater is not running")]
    UpdaterStopped,

    // Input errors (E700-E799)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Storage errors (E800-E899)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a numerical failure for the given policy
    pub fn numerical(policy: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PolicyNumerical {
            policy: policy.into(),
            reason: reason.into(),
        }
    }

    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "E100",
            Self::UnknownPolicy(_) => "E101",
            Self::UnknownArm(_) => "E200",
            Self::NoCandidates(_) => "E201",
            Self::PolicyNumerical { .. } => "E300",
            Self::PolicyUnavailable(_) => "E301",
            Self::InvalidEmbedding(_) => "E400",
            Self::EmbeddingFailed(_) => "E401",
            Self::ExperimentNotFound(_) => "E500",
            Self::InvalidTransition { .. } => "E501",
            Self::NotReadyToAdvance(..) => "E502",
            Self::DeadlineExceeded(_) => "E600",
            Self::UpdaterStopped => "E601",
            Self::InvalidInput(_) => "E700",
            Self::Database(_) => "E800",
            Self::Serialization(_) => "E801",
            Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::UnknownPolicy(name) => Some(format!(
                "check `routing.default_policy` and experiment variants for '{}'",
                name
            )),
            Self::UnknownArm(id) => Some(format!("add an [[arms]] entry with id = \"{}\"", id)),
            Self::InvalidEmbedding(_) => {
                Some("embeddings must be non-empty, finite and non-zero".to_string())
            }
            Self::DeadlineExceeded(_) => Some("raise `routing.decision_budget_ms`".to_string()),
            _ => None,
        }
    }

    /// Whether the error should trigger a per-decision fallback to the baseline
    pub fn is_policy_failure(&self) -> bool {
        matches!(
            self,
            Self::PolicyNumerical { .. } | Self::PolicyUnavailable(_) | Self::DeadlineExceeded(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Config("x".into()).code(), "E100");
        assert_eq!(Error::numerical("lin_ts", "singular").code(), "E300");
        assert_eq!(Error::DeadlineExceeded("propose").code(), "E600");
    }

    #[test]
    fn test_unknown_policy_suggestion() {
        let error = Error::UnknownPolicy("magic".to_string());
        assert!(error.to_string().contains("magic"));
        assert!(error.suggestion().unwrap().contains("magic"));
    }

    #[test]
    fn test_policy_failure_classification() {
        assert!(Error::numerical("lin_ts", "nan").is_policy_failure());
        assert!(Error::DeadlineExceeded("propose").is_policy_failure());
        assert!(!Error::InvalidEmbedding("zero norm".into()).is_policy_failure());
    }
}
