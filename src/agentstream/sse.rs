//! Server-Sent Events framing for the turn stream.
//!
//! The wire contract per frame is strict: one `event:` line naming the
//! [`StreamEvent`](crate::event::StreamEvent) kind, one `data:` line per
//! source line of the JSON payload (so payloads containing newlines keep
//! their framing), and a terminating blank line. A comment line
//! `: heartbeat` keeps idle connections alive.
//!
//! [`encode_frame`] is the pure framing function used by the unit tests;
//! [`to_sse_event`] adapts an event onto axum's SSE response type, which
//! performs the same line splitting and flushes after every frame.
//!
//! # Example
//!
//! ```rust
//! use agentstream::event::StreamEvent;
//! use agentstream::sse::encode_frame;
//!
//! let frame = encode_frame(&StreamEvent::data("hi"));
//! assert!(frame.starts_with("event: data\n"));
//! assert!(frame.ends_with("\n\n"));
//! ```

use axum::http::header::{HeaderName, HeaderValue, CACHE_CONTROL, CONNECTION};
use axum::response::sse::Event;

use crate::agentstream::event::StreamEvent;

/// Comment frame sent periodically on idle streams.
pub const HEARTBEAT_COMMENT: &str = "heartbeat";

/// Seconds between heartbeat comments on an open stream.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// Render one event as a raw SSE frame.
///
/// The payload is JSON-encoded and handed to [`encode_raw_frame`]. Compact
/// JSON contains no literal newlines, but the splitting is kept in the one
/// place so payloads from other encoders stay correctly framed.
pub fn encode_frame(event: &StreamEvent) -> String {
    encode_raw_frame(event.kind(), &event.payload().to_string())
}

/// Frame arbitrary text under the given event kind: one `data:` line per
/// source line, terminated by a blank line.
pub fn encode_raw_frame(kind: &str, data: &str) -> String {
    let mut frame = String::with_capacity(data.len() + 32);
    frame.push_str("event: ");
    frame.push_str(kind);
    frame.push('\n');
    for line in data.split('\n') {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    frame
}

/// Render the keep-alive comment frame (`: heartbeat`).
pub fn encode_heartbeat() -> String {
    format!(": {}\n\n", HEARTBEAT_COMMENT)
}

/// Adapt an event onto axum's SSE [`Event`] type.
///
/// axum applies the identical multi-line `data:` splitting and flushes
/// each frame, so the wire bytes match [`encode_frame`].
pub fn to_sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.kind())
        .data(event.payload().to_string())
}

/// Response headers required on the stream endpoint beyond the
/// `text/event-stream` content type axum already sets: cache disabled,
/// connection kept alive, reverse-proxy buffering disabled.
pub fn stream_headers() -> [(HeaderName, HeaderValue); 3] {
    [
        (CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        (CONNECTION, HeaderValue::from_static("keep-alive")),
        (
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        ),
    ]
}
