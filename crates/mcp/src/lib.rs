//! Client for remote tool servers speaking the Model Context Protocol.
//!
//! Connections try the streamable HTTP transport first and fall back to the
//! older HTTP+SSE transport. Transports are created through a
//! [`TransportFactory`] so callers (and tests) can supply their own.

pub mod client;
pub mod error;
pub mod http;
pub mod transport;
pub mod types;

pub use client::{McpClient, ServerInfo};
pub use error::McpError;
pub use http::HttpTransportFactory;
pub use transport::{Transport, TransportFactory, TransportKind};
pub use types::{CallToolResult, RemoteToolInfo, ToolAnnotations, PROTOCOL_VERSION};
