use thiserror::Error;

/// Failure classes the orchestrator distinguishes. Everything else travels as
/// plain `anyhow` context; callers classify with `downcast_ref::<DramaError>()`.
#[derive(Debug, Error)]
pub enum DramaError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Provider error ({provider}): {message}")]
    Provider { provider: &'static str, message: String },

    #[error("Parse error in {stage} output: {message}")]
    Parse { stage: &'static str, message: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Media toolchain error: {0}")]
    MediaToolchain(String),
}

impl DramaError {
    pub fn provider(provider: &'static str, message: impl Into<String>) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
        }
    }
}

/// True when `err` carries a [`DramaError::NotFound`] anywhere in its chain.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|e| matches!(e.downcast_ref::<DramaError>(), Some(DramaError::NotFound(_))))
}

/// True when `err` carries a [`DramaError::Validation`] anywhere in its chain.
pub fn is_validation(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|e| matches!(e.downcast_ref::<DramaError>(), Some(DramaError::Validation(_))))
}
