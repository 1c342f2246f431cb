//! Turn orchestration for the investigation agent.
//!
//! An [`AgentContext`] is built once per process from [`AgentConfig`]. Each
//! session composes a tool registry through it, and each user message runs
//! one turn through the [`Orchestrator`], which streams model output to an
//! [`EventSink`], executes requested tools under the turn's budget and
//! authorization rules, and persists the finished exchange.

pub mod classifier;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod evidence;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod prompt;

pub use classifier::{ClassifiedResponse, ClassifierState, ResponseClassifier};
pub use config::{load_agent_config, AgentConfig, ConfigError, TurnConfig};
pub use context::AgentContext;
pub use error::RuntimeError;
pub use events::{ActivityEvent, ActivityStatus, AgentEvent, ChannelSink, EventSink};
pub use evidence::{extract_evidence, EvidenceEvent};
pub use logging::init_tracing;
pub use orchestrator::{Orchestrator, StopReason, TurnOutcome, TurnRequest};
pub use prompt::build_system_prompt;
