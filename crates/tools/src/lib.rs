pub mod function;
pub mod registry;
pub mod remote;
pub mod traits;

pub use function::FnTool;
pub use registry::{ExecutionOptions, RegistryError, ToolRegistry};
pub use remote::{
    discover_tools, remote_tool_name, split_remote_tool_name, RemoteTimeouts, RemoteTool,
    RemoteToolServer,
};
pub use traits::{Tool, ToolError};
