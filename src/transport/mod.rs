//! The network seam.
//!
//! Streaming code only needs a status, a few response headers and a way to
//! pull body chunks. [`HttpTransport`] does this over HTTP, or over a
//! WebSocket for requests that stream their input; [`MockTransport`] plays
//! back scripted responses.

#[cfg(feature = "http")]
pub mod http;
pub mod mock;
#[cfg(feature = "http")]
mod socket;

#[cfg(feature = "http")]
pub use http::HttpTransport;
pub use mock::{MockConnection, MockTransport};

use crate::error::Result;

/// JSON messages sent one by one while the response streams back.
pub type MessageStream = Box<dyn Iterator<Item = serde_json::Value> + Send>;

/// Request body variants used by the generation endpoints.
pub enum RequestBody {
    Json(serde_json::Value),
    /// One file part plus plain text fields.
    Multipart {
        fields: Vec<(String, String)>,
        file_field: String,
        file_name: String,
        bytes: Vec<u8>,
    },
    /// A WebSocket exchange: each value is sent as one text message, and
    /// each text message received is read back as one line of the body.
    Socket(MessageStream),
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBody::Json(value) => f.debug_tuple("Json").field(value).finish(),
            RequestBody::Multipart {
                fields,
                file_field,
                bytes,
                ..
            } => f
                .debug_struct("Multipart")
                .field("fields", fields)
                .field("file_field", file_field)
                .field("bytes", &bytes.len())
                .finish(),
            RequestBody::Socket(_) => f.write_str("Socket(..)"),
        }
    }
}

/// A call to the generation API: a POST, or a WebSocket for [`RequestBody::Socket`].
#[derive(Debug)]
pub struct ApiRequest {
    /// Path below the API endpoint, starting with `/`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn new(path: impl Into<String>, body: RequestBody) -> Self {
        Self {
            path: path.into(),
            query: Vec::new(),
            body,
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// An open response whose body can be read incrementally.
pub trait Connection: Send {
    fn status(&self) -> u16;

    /// Case-insensitive response header lookup.
    fn header(&self, name: &str) -> Option<String>;

    /// Read up to `max_len` body bytes. `Ok(None)` at the end of the body.
    fn read_chunk(&mut self, max_len: usize) -> Result<Option<Vec<u8>>>;

    fn is_success(&self) -> bool {
        (200..300).contains(&self.status())
    }

    /// Drain the rest of the body, at most `limit` bytes, as lossy text.
    fn read_text(&mut self, limit: usize) -> String {
        let mut body = Vec::new();
        while body.len() < limit {
            match self.read_chunk(limit - body.len()) {
                Ok(Some(chunk)) => body.extend_from_slice(&chunk),
                Ok(None) | Err(_) => break,
            }
        }
        String::from_utf8_lossy(&body).into_owned()
    }
}

/// Opens connections. Returns once response headers are available.
pub trait Transport: Send + Sync {
    fn open(&self, request: ApiRequest) -> Result<Box<dyn Connection>>;
}
