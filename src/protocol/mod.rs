pub mod a2a;
pub mod capabilities;
pub mod methods;
pub mod request;
pub mod response;

pub use capabilities::{
    InitializeResult, ListKind, McpCapabilities, Prompt, PromptArgument, PromptsCapability,
    Resource, ResourcesCapability, ServerInfo, Tool, ToolsCapability,
};
pub use methods::MethodParams;
pub use request::{
    CancelledParams, ClientInfo, CompleteParams, CompletionRef, GetPromptParams, Implementation,
    InitializeParams, JsonRpcNotification, JsonRpcRequest, PaginatedParams, ResourceParams, RpcId,
    ToolCallParams,
};
pub use response::{
    CallToolResult, Content, JsonRpcError, JsonRpcResponse, McpErrorCode, ResourceReference,
    ResponsePayload,
};

/// Protocol revision the proxy requests and advertises.
pub const PROTOCOL_VERSION_LATEST: &str = "2025-06-18";

/// Older revisions still accepted from clients and downstream servers.
pub const PROTOCOL_VERSIONS_COMPATIBLE: &[&str] = &["2025-03-26", "2024-11-05"];
