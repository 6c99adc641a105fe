//! Client for a JSON-RPC-over-SSE tool hub.
//!
//! The crate discovers the tools and resources a hub exposes, keeps sessions
//! per endpoint, and invokes tools with timeout tiers, retries and session
//! repair. Remote failures surface as [`ToolOutput::Failure`] values.

pub mod config;
pub mod error;
pub mod protocol;
pub mod schema;
pub mod session;
pub mod transports;
pub mod types;

pub mod executor;
pub mod manager;
pub mod resource;
pub mod tool_index;

pub use config::*;
pub use error::{classify, FailureClass, McpError, Result};
pub use executor::{normalize_arguments, CallReply, CallRequest, ResourceRequest, ToolBackend, ToolInvoker};
pub use manager::ToolClient;
pub use protocol::{ClientState, HubConnector, McpProtocolClient, McpTransport};
pub use resource::ResourceReader;
pub use schema::{ArgDefault, ArgField, ArgKind, ArgumentModel};
pub use session::{CallerId, SessionId, SessionProbe, SessionStore};
pub use tool_index::{ResourceHandle, ToolHandle, ToolIndex};
pub use transports::{SseTransport, TransportOptions};
pub use types::*;
