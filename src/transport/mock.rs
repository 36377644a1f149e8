//! Scripted transport for tests and offline use.

use super::{ApiRequest, Connection, RequestBody, Transport};
use crate::error::{Result, VoxError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// A response served by [`MockTransport`], body delivered in fixed chunks.
#[derive(Debug, Clone, Default)]
pub struct MockConnection {
    status: u16,
    headers: Vec<(String, String)>,
    chunks: VecDeque<Vec<u8>>,
    /// Error returned after the scripted chunks are exhausted.
    fail_after: Option<String>,
    chunk_delay: Duration,
}

impl MockConnection {
    /// A 200 response with `body` split into `chunk_size`-byte pieces.
    pub fn ok(body: &[u8], chunk_size: usize) -> Self {
        Self {
            status: 200,
            chunks: body.chunks(chunk_size.max(1)).map(<[u8]>::to_vec).collect(),
            ..Self::default()
        }
    }

    /// A response with the given status and a text body.
    pub fn http_status(status: u16, body: &str) -> Self {
        Self {
            status,
            chunks: VecDeque::from([body.as_bytes().to_vec()]),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Break the body with a transport error once the chunks run out.
    pub fn failing_after_chunks(mut self, message: &str) -> Self {
        self.fail_after = Some(message.to_string());
        self
    }

    /// Sleep before every chunk, simulating a slow network.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }
}

impl Connection for MockConnection {
    fn status(&self) -> u16 {
        self.status
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }

    fn read_chunk(&mut self, max_len: usize) -> Result<Option<Vec<u8>>> {
        if !self.chunk_delay.is_zero() {
            thread::sleep(self.chunk_delay);
        }
        match self.chunks.pop_front() {
            Some(mut chunk) => {
                if chunk.len() > max_len {
                    let rest = chunk.split_off(max_len.max(1));
                    self.chunks.push_front(rest);
                }
                Ok(Some(chunk))
            }
            None => match self.fail_after.take() {
                Some(message) => Err(VoxError::NetworkFailure { message }),
                None => Ok(None),
            },
        }
    }
}

/// What the mock saw for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub path: String,
    pub query: Vec<(String, String)>,
    /// JSON body, or every message of a socket exchange collected into an array.
    pub json: Option<serde_json::Value>,
    pub multipart_fields: Vec<(String, String)>,
}

enum Scripted {
    Respond(MockConnection),
    Refuse(String),
}

/// Serves scripted responses in order and records every request.
#[derive(Clone, Default)]
pub struct MockTransport {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    open_delay: Duration,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("requests", &self.requests().len())
            .finish_non_exhaustive()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next response.
    pub fn respond(self, connection: MockConnection) -> Self {
        self.lock_script().push_back(Scripted::Respond(connection));
        self
    }

    /// Queue a failure to connect.
    pub fn refuse(self, message: &str) -> Self {
        self.lock_script()
            .push_back(Scripted::Refuse(message.to_string()));
        self
    }

    /// Delay every `open` call, as if waiting for response headers.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Scripted>> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for MockTransport {
    fn open(&self, request: ApiRequest) -> Result<Box<dyn Connection>> {
        let (json, multipart_fields) = match request.body {
            RequestBody::Json(value) => (Some(value), Vec::new()),
            RequestBody::Multipart { fields, .. } => (None, fields),
            RequestBody::Socket(messages) => {
                (Some(serde_json::Value::Array(messages.collect())), Vec::new())
            }
        };
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedRequest {
                path: request.path,
                query: request.query,
                json,
                multipart_fields,
            });

        if !self.open_delay.is_zero() {
            thread::sleep(self.open_delay);
        }

        match self.lock_script().pop_front() {
            Some(Scripted::Respond(connection)) => Ok(Box::new(connection)),
            Some(Scripted::Refuse(message)) => Err(VoxError::NetworkFailure { message }),
            None => Err(VoxError::NetworkFailure {
                message: "no scripted response left".to_string(),
            }),
        }
    }
}
