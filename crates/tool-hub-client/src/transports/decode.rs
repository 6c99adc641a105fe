//! SSE frame decoding and POST body shape detection.
//!
//! POST answers arrive either as an SSE-framed body (`event: message` /
//! `data: {...}`) or as a bare JSON document. Everything that needs to tell
//! the two apart goes through [`decode_post_body`].

use eventsource_stream::{Event, Eventsource};
use futures::{stream, StreamExt};
use serde_json::Value;
use std::convert::Infallible;

use crate::error::{McpError, Result};

/// One complete SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

impl SseFrame {
    pub fn is_message(&self) -> bool {
        self.event.is_empty() || self.event == "message"
    }

    pub fn is_endpoint(&self) -> bool {
        self.event == "endpoint"
    }

    pub fn json(&self) -> Result<Value> {
        serde_json::from_str(&self.data).map_err(|e| {
            McpError::Serialization(format!("Invalid SSE data for event '{}': {}", self.event, e))
        })
    }
}

impl From<Event> for SseFrame {
    fn from(event: Event) -> Self {
        Self {
            event: event.event,
            data: event.data,
        }
    }
}

/// Splits an already buffered SSE body into events, using the same parser
/// as the live stream. A trailing event without its blank line is flushed.
pub async fn decode_sse(text: &str) -> Result<Vec<SseFrame>> {
    let body = format!("{}\n\n", text);
    let mut events = stream::iter([Ok::<_, Infallible>(body)]).eventsource();

    let mut frames = Vec::new();
    while let Some(event) = events.next().await {
        let event =
            event.map_err(|e| McpError::Serialization(format!("Invalid SSE body: {}", e)))?;
        frames.push(SseFrame::from(event));
    }
    Ok(frames)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyShape {
    Empty,
    Sse,
    Json,
}

fn detect_shape(content_type: Option<&str>, body: &str) -> BodyShape {
    let trimmed = body.trim_start();
    if trimmed.is_empty() {
        return BodyShape::Empty;
    }
    // An unambiguous body beats the header; servers mislabel these.
    if trimmed.starts_with("event:") || trimmed.starts_with("data:") || trimmed.starts_with(':') {
        return BodyShape::Sse;
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return BodyShape::Json;
    }
    match content_type {
        Some(ct) if ct.to_ascii_lowercase().starts_with("text/event-stream") => BodyShape::Sse,
        _ => BodyShape::Json,
    }
}

/// Decodes a POST response body into the JSON-RPC messages it carries.
/// Batched JSON arrays are flattened.
pub async fn decode_post_body(content_type: Option<&str>, body: &str) -> Result<Vec<Value>> {
    match detect_shape(content_type, body) {
        BodyShape::Empty => Ok(Vec::new()),
        BodyShape::Sse => decode_sse(body)
            .await?
            .into_iter()
            .filter(SseFrame::is_message)
            .map(|frame| frame.json())
            .collect(),
        BodyShape::Json => {
            let value: Value = serde_json::from_str(body.trim())
                .map_err(|e| McpError::Serialization(format!("Invalid JSON body: {}", e)))?;
            Ok(match value {
                Value::Array(items) => items,
                single => vec![single],
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn decodes_single_event() {
        let frames = decode_sse("event: message\ndata: {\"jsonrpc\":\"2.0\"}\n\n")
            .await
            .unwrap();
        assert_eq!(
            frames,
            vec![SseFrame {
                event: "message".to_string(),
                data: "{\"jsonrpc\":\"2.0\"}".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn multiline_data_decodes_like_single_line() {
        let split = "event: message\ndata: {\"jsonrpc\": \"2.0\",\ndata: \"id\": 3,\ndata: \"result\": {\"ok\": true}}\n\n";
        let single = "event: message\ndata: {\"jsonrpc\": \"2.0\", \"id\": 3, \"result\": {\"ok\": true}}\n\n";

        let split_frames = decode_sse(split).await.unwrap();
        let single_frames = decode_sse(single).await.unwrap();
        assert_eq!(split_frames.len(), 1);
        assert_eq!(split_frames[0].json().unwrap(), single_frames[0].json().unwrap());

        let inline = decode_post_body(Some("text/event-stream"), split).await.unwrap();
        assert_eq!(inline, vec![json!({"jsonrpc": "2.0", "id": 3, "result": {"ok": true}})]);
    }

    #[tokio::test]
    async fn endpoint_event_and_comments() {
        let frames = decode_sse(": keep-alive\r\nevent: endpoint\r\ndata: /messages?session_id=abc\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_endpoint());
        assert_eq!(frames[0].data, "/messages?session_id=abc");
    }

    #[tokio::test]
    async fn trailing_event_without_blank_line_is_flushed() {
        let frames = decode_sse("data: {\"a\":1}").await.unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_message());
    }

    #[tokio::test]
    async fn post_body_sse_shape() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n";
        let messages = decode_post_body(Some("text/event-stream"), body).await.unwrap();
        assert_eq!(messages, vec![json!({"jsonrpc": "2.0", "id": 1, "result": {}})]);
    }

    #[tokio::test]
    async fn post_body_bare_json_shape() {
        let body = "{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"content\":[]}}";
        let messages = decode_post_body(Some("application/json"), body).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["id"], 3);
    }

    #[tokio::test]
    async fn post_body_sniffs_without_content_type() {
        let sse = "event: message\ndata: {\"id\":1}\n\n";
        assert_eq!(decode_post_body(None, sse).await.unwrap(), vec![json!({"id": 1})]);
        assert_eq!(
            decode_post_body(None, "  {\"id\":2}").await.unwrap(),
            vec![json!({"id": 2})]
        );
    }

    #[tokio::test]
    async fn post_body_mislabelled_sse_is_still_decoded() {
        let sse = "event: message\ndata: {\"id\":1}\n\n";
        assert_eq!(
            decode_post_body(Some("application/json"), sse).await.unwrap(),
            vec![json!({"id": 1})]
        );
    }

    #[tokio::test]
    async fn post_body_empty_and_batch() {
        assert!(decode_post_body(Some("application/json"), "")
            .await
            .unwrap()
            .is_empty());
        let batch = decode_post_body(None, "[{\"id\":1},{\"id\":2}]").await.unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn post_body_invalid_json_is_an_error() {
        assert!(decode_post_body(Some("application/json"), "{not json").await.is_err());
        let bad_sse = "event: message\ndata: {bad\n\n";
        assert!(matches!(
            decode_post_body(Some("text/event-stream"), bad_sse).await,
            Err(McpError::Serialization(_))
        ));
    }
}
