use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum McpError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Protocol error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("Tool reported an error: {0}")]
    ToolReported(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Server disconnected")]
    Disconnected,

    #[error("Client shut down")]
    Cancelled,

    #[error("{} concurrent failures, first: {}", .0.len(), .0.first().map(|e| e.to_string()).unwrap_or_default())]
    Aggregate(Vec<McpError>),
}

impl McpError {
    /// Unwraps grouped failures to the first underlying cause.
    pub fn root_cause(self) -> McpError {
        match self {
            McpError::Aggregate(errors) => match errors.into_iter().next() {
                Some(first) => first.root_cause(),
                None => McpError::Transport("empty failure group".to_string()),
            },
            other => other,
        }
    }

    /// Builds an error from a set of task failures, avoiding a wrapper when
    /// there is only one.
    pub fn from_group(mut errors: Vec<McpError>) -> McpError {
        match errors.len() {
            0 => McpError::Disconnected,
            1 => errors.remove(0),
            _ => McpError::Aggregate(errors),
        }
    }
}

impl From<serde_json::Error> for McpError {
    fn from(e: serde_json::Error) -> Self {
        McpError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for McpError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            McpError::Timeout(e.to_string())
        } else if e.is_connect() {
            McpError::Connection(e.to_string())
        } else {
            McpError::Transport(e.to_string())
        }
    }
}

impl From<url::ParseError> for McpError {
    fn from(e: url::ParseError) -> Self {
        McpError::InvalidConfig(format!("Invalid URL: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, McpError>;

/// How the invocation engine should react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transport,
    Timeout,
    Protocol,
    UnknownTool,
    /// HTTP 400: the session became invalid.
    Session,
    /// HTTP 409, detected by status or message content.
    Conflict,
}

impl FailureClass {
    pub fn is_retriable(&self) -> bool {
        !matches!(self, FailureClass::UnknownTool)
    }
}

// JSON-RPC "method not found"
const METHOD_NOT_FOUND: i64 = -32601;

fn mentions_unknown_tool(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("unknown tool") || lower.contains("tool not found")
}

// A bare "409" also turns up in ports, ids and bodies, so it only counts
// next to a status marker.
fn mentions_conflict(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("conflict")
        || ["http 409", "status 409", "status: 409", "409 conflict"]
            .iter()
            .any(|marker| lower.contains(marker))
}

pub fn classify(error: &McpError) -> FailureClass {
    match error {
        McpError::Aggregate(errors) => errors
            .first()
            .map(classify)
            .unwrap_or(FailureClass::Transport),
        McpError::Http { status: 400, .. } => FailureClass::Session,
        McpError::Http { status: 409, .. } => FailureClass::Conflict,
        McpError::Timeout(_) => FailureClass::Timeout,
        McpError::ToolNotFound(_) => FailureClass::UnknownTool,
        McpError::Protocol { code, message } => {
            if *code == METHOD_NOT_FOUND || mentions_unknown_tool(message) {
                FailureClass::UnknownTool
            } else if mentions_conflict(message) {
                FailureClass::Conflict
            } else {
                FailureClass::Protocol
            }
        }
        McpError::ToolReported(message) => {
            if mentions_unknown_tool(message) {
                FailureClass::UnknownTool
            } else {
                FailureClass::Protocol
            }
        }
        other => {
            if mentions_conflict(&other.to_string()) {
                FailureClass::Conflict
            } else {
                FailureClass::Transport
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_unwraps_nested_groups() {
        let err = McpError::Aggregate(vec![
            McpError::Aggregate(vec![McpError::Timeout("inner".to_string())]),
            McpError::Disconnected,
        ]);
        match err.root_cause() {
            McpError::Timeout(msg) => assert_eq!(msg, "inner"),
            other => panic!("unexpected root cause: {:?}", other),
        }
    }

    #[test]
    fn test_from_group_avoids_wrapper_for_single_error() {
        let err = McpError::from_group(vec![McpError::Disconnected]);
        assert!(matches!(err, McpError::Disconnected));
    }

    #[test]
    fn test_classify_http_statuses() {
        let bad_request = McpError::Http { status: 400, body: String::new() };
        let conflict = McpError::Http { status: 409, body: String::new() };
        let server = McpError::Http { status: 502, body: String::new() };
        assert_eq!(classify(&bad_request), FailureClass::Session);
        assert_eq!(classify(&conflict), FailureClass::Conflict);
        assert_eq!(classify(&server), FailureClass::Transport);
    }

    #[test]
    fn test_classify_conflict_by_message() {
        let err = McpError::Transport("server answered 409 Conflict".to_string());
        assert_eq!(classify(&err), FailureClass::Conflict);

        let status = McpError::Transport("upstream returned status 409".to_string());
        assert_eq!(classify(&status), FailureClass::Conflict);
    }

    #[test]
    fn test_stray_409_digits_are_not_a_conflict() {
        let port = McpError::Http {
            status: 502,
            body: "bad gateway from http://10.0.0.7:4090/mcp".to_string(),
        };
        let id = McpError::Connection("request 4091-409 reset by peer".to_string());
        assert_eq!(classify(&port), FailureClass::Transport);
        assert_eq!(classify(&id), FailureClass::Transport);
    }

    #[test]
    fn test_unknown_tool_is_not_retriable() {
        let err = McpError::Protocol {
            code: -32601,
            message: "no such method".to_string(),
        };
        assert_eq!(classify(&err), FailureClass::UnknownTool);
        assert!(!classify(&err).is_retriable());

        let reported = McpError::ToolReported("Unknown tool: geo.nowhere".to_string());
        assert_eq!(classify(&reported), FailureClass::UnknownTool);
    }

    #[test]
    fn test_generic_protocol_error_is_retriable() {
        let err = McpError::Protocol {
            code: -32603,
            message: "upstream exploded".to_string(),
        };
        assert_eq!(classify(&err), FailureClass::Protocol);
        assert!(classify(&err).is_retriable());
    }

    #[test]
    fn test_classify_aggregate_uses_first_cause() {
        let err = McpError::Aggregate(vec![
            McpError::Timeout("slow".to_string()),
            McpError::Http { status: 400, body: String::new() },
        ]);
        assert_eq!(classify(&err), FailureClass::Timeout);
    }
}
