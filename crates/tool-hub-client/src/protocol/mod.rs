pub mod backend;
pub mod client;
pub mod models;

pub use backend::HubConnector;
pub use client::{ClientState, McpProtocolClient, McpTransport};
pub use models::*;
