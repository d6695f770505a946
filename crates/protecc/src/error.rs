use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProteccError {
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid profile: {0}")]
    InvalidProfile(String),

    #[error("compile failed: {0}")]
    CompileFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ruleset parse error: {0}")]
    Ruleset(#[from] serde_yaml::Error),
}

impl ProteccError {
    pub(crate) fn pattern(pattern: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }
}
