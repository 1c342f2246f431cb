//! Shared domain model for the investigation agent runtime.
//!
//! Every other crate in the workspace speaks in these types: the generic
//! message/part conversation model, tool outcomes, safety levels, the fix-mode
//! scope, and the error taxonomy that the orchestrator surfaces to callers.

pub mod error;
pub mod sse;
pub mod tokens;
pub mod types;

pub use error::{ClassifiedError, ErrorCategory};
pub use tokens::estimate_tokens;
pub use tokio_util::sync::CancellationToken;
pub use types::*;
