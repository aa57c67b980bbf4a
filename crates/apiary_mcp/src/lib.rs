pub mod stdio;
pub mod supervisor;
pub mod types;

pub use stdio::StdioConnection;
pub use supervisor::{McpSupervisor, CONNECT_TIMEOUT, TOOL_CALL_TIMEOUT};
pub use types::{
    McpServerRecord, McpServerStatus, McpTool, StdioRequest, StdioResponse, ToolOutcome,
    MCP_PROTOCOL_VERSION,
};
