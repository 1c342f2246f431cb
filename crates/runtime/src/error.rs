use crate::config::ConfigError;
use aiops_core::{AgentMode, ClassifiedError, ErrorCategory};
use aiops_memory::StoreError;
use aiops_providers::ProviderError;
use aiops_tools::RegistryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Conversation store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Tool registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Tool registry was built for {registry:?} mode but the turn runs in {requested:?} mode")]
    ModeMismatch {
        registry: AgentMode,
        requested: AgentMode,
    },

    #[error("Turn cancelled")]
    Cancelled,
}

impl RuntimeError {
    /// Single classification point for everything that ends a turn.
    pub fn classify(&self) -> ClassifiedError {
        let message = self.to_string();
        match self {
            RuntimeError::Provider(e) => e.classify(),
            RuntimeError::Store(StoreError::InvalidKey) => {
                ClassifiedError::new(ErrorCategory::Deterministic, message)
                    .with_code("INVALID_SESSION")
            }
            RuntimeError::Store(_) => {
                ClassifiedError::new(ErrorCategory::Transient, message).with_code("STORE_ERROR")
            }
            RuntimeError::Config(_) | RuntimeError::Registry(_) => {
                ClassifiedError::new(ErrorCategory::Deterministic, message)
            }
            RuntimeError::ModeMismatch { .. } => {
                ClassifiedError::new(ErrorCategory::Deterministic, message)
                    .with_code("MODE_MISMATCH")
            }
            RuntimeError::Cancelled => ClassifiedError::new(ErrorCategory::Cancelled, message),
        }
    }
}
