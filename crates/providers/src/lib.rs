//! Streaming LLM backends behind one adapter contract.

pub mod anthropic;
pub mod breaker;
pub mod client;
pub mod config;
pub mod error;
pub mod gemini;
pub mod openai;
pub mod streaming;
pub mod traits;

pub use client::{Backend, ProviderClient};
pub use config::{ProviderConfig, ProviderKind};
pub use error::ProviderError;
pub use traits::{
    CompletionRequest, FinishReason, ProviderAdapter, ProviderStream, StreamEvent, Usage,
};
