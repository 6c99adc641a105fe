pub mod decode;
pub mod sse;

pub use decode::{decode_post_body, decode_sse, SseFrame};
pub use sse::{SseTransport, TransportOptions};
