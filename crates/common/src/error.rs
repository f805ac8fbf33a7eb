use thiserror::Error;

/// Top-level error type shared across the orchestrator's subsystems.
#[derive(Debug, Error)]
pub enum PodscaleError {
    #[error("store error: {0}")]
    Store(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("demand oracle error: {0}")]
    DemandOracle(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Internal(String),
}

impl PodscaleError {
    /// Transient errors are safe to retry within the current cycle's budget.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Provider(_) | Self::DemandOracle(_) | Self::Timeout(_)
        )
    }

    /// Fatal errors mean the dependency cannot be used at all; the control
    /// loop should skip the action that needed it for this cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::CircuitOpen(_))
    }

    /// Hard-dependency errors (store, provider) warrant tripping that
    /// dependency's circuit breaker.
    pub fn is_hard_dependency(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Provider(_))
    }
}

pub type Result<T> = std::result::Result<T, PodscaleError>;
