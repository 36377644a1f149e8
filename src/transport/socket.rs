//! WebSocket exchange for requests that stream their input.
//!
//! Outgoing messages are produced on a separate thread, since the text
//! source may block while it waits for more tokens. The connection sends
//! whatever is ready between short reads, and hands every received text
//! message back as one newline-terminated line of the body.

use super::{Connection, MessageStream};
use crate::error::{Result, VoxError};
use crossbeam_channel::{Receiver, TryRecvError, unbounded};
use reqwest::header::HeaderMap;
use std::io;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;
use tungstenite::client::IntoClientRequest;
use tungstenite::http::{HeaderName, HeaderValue};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

/// How long a read waits before pending outgoing messages are sent.
const SEND_POLL: Duration = Duration::from_millis(20);

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

/// Switch an `http(s)` request URL to the matching socket scheme.
pub(super) fn socket_url(mut url: reqwest::Url) -> Result<reqwest::Url> {
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(VoxError::NetworkFailure {
                message: format!("no socket scheme for '{}'", other),
            });
        }
    };
    if url.set_scheme(scheme).is_err() {
        return Err(VoxError::NetworkFailure {
            message: format!("cannot switch {} to {}", url, scheme),
        });
    }
    Ok(url)
}

/// Open the socket and start sending `messages`.
///
/// A refused upgrade is returned as a connection carrying the HTTP status
/// and error body, like any other non-2xx response.
pub(super) fn open(
    url: reqwest::Url,
    headers: &HeaderMap,
    read_timeout: Duration,
    messages: MessageStream,
) -> Result<Box<dyn Connection>> {
    let mut upgrade = url.as_str().into_client_request().map_err(socket_error)?;
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_str().as_bytes())
            .map_err(|e| VoxError::Other(format!("invalid header name: {}", e)))?;
        let value = HeaderValue::from_bytes(value.as_bytes())
            .map_err(|e| VoxError::Other(format!("invalid header value: {}", e)))?;
        upgrade.headers_mut().insert(name, value);
    }

    let (socket, response) = match tungstenite::connect(upgrade) {
        Ok(connected) => connected,
        Err(tungstenite::Error::Http(response)) => {
            tracing::warn!(status = %response.status(), "socket upgrade refused");
            return Ok(Box::new(RefusedUpgrade {
                status: response.status().as_u16(),
                headers: header_pairs(response.headers()),
                body: response.body().clone().unwrap_or_default(),
            }));
        }
        Err(e) => return Err(socket_error(e)),
    };
    tracing::debug!(status = %response.status(), "socket open");

    let mut connection = SocketConnection {
        socket,
        headers: header_pairs(response.headers()),
        outgoing: spawn_sender(messages),
        sending: true,
        read_timeout,
        line: Vec::new(),
        offset: 0,
        closed: false,
    };
    connection.set_read_timeout(Some(SEND_POLL))?;
    Ok(Box::new(connection))
}

/// Serialize messages on their own thread, so a slow text source never
/// holds up reading audio.
fn spawn_sender(messages: MessageStream) -> Receiver<String> {
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        for message in messages {
            let text = message.to_string();
            if tx.send(text).is_err() {
                tracing::debug!("socket closed before input finished");
                break;
            }
        }
    });
    rx
}

fn socket_error(error: tungstenite::Error) -> VoxError {
    VoxError::NetworkFailure {
        message: error.to_string(),
    }
}

fn header_pairs(headers: &tungstenite::http::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn find_header(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.clone())
}

struct SocketConnection {
    socket: Socket,
    headers: Vec<(String, String)>,
    outgoing: Receiver<String>,
    /// Input messages may still arrive from the sender thread.
    sending: bool,
    read_timeout: Duration,
    /// Current received message, newline included.
    line: Vec<u8>,
    offset: usize,
    closed: bool,
}

impl SocketConnection {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let result = match self.socket.get_ref() {
            MaybeTlsStream::Plain(stream) => stream.set_read_timeout(timeout),
            MaybeTlsStream::Rustls(stream) => stream.sock.set_read_timeout(timeout),
            _ => Ok(()),
        };
        result.map_err(|e| VoxError::NetworkFailure {
            message: e.to_string(),
        })
    }

    /// Send every message the sender thread has ready.
    fn send_ready(&mut self) -> Result<()> {
        while self.sending {
            match self.outgoing.try_recv() {
                Ok(text) => self.socket.send(Message::text(text)).map_err(socket_error)?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    tracing::debug!("input finished, waiting for remaining audio");
                    self.sending = false;
                    self.set_read_timeout(Some(self.read_timeout))?;
                }
            }
        }
        Ok(())
    }
}

impl Connection for SocketConnection {
    /// An upgraded socket reports 200.
    fn status(&self) -> u16 {
        200
    }

    fn header(&self, name: &str) -> Option<String> {
        find_header(&self.headers, name)
    }

    fn read_chunk(&mut self, max_len: usize) -> Result<Option<Vec<u8>>> {
        loop {
            if self.offset < self.line.len() {
                let end = (self.offset + max_len.max(1)).min(self.line.len());
                let chunk = self.line[self.offset..end].to_vec();
                self.offset = end;
                return Ok(Some(chunk));
            }
            if self.closed {
                return Ok(None);
            }

            self.send_ready()?;
            match self.socket.read() {
                Ok(Message::Text(text)) => {
                    self.line = text.as_bytes().to_vec();
                    self.line.push(b'\n');
                    self.offset = 0;
                }
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "socket closed by server");
                    self.closed = true;
                }
                Ok(Message::Binary(bytes)) => {
                    tracing::debug!(len = bytes.len(), "ignoring binary socket message");
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(e))
                    if self.sending
                        && matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    self.closed = true;
                }
                Err(e) => return Err(socket_error(e)),
            }
        }
    }
}

/// A handshake the server answered with an HTTP error.
struct RefusedUpgrade {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Connection for RefusedUpgrade {
    fn status(&self) -> u16 {
        self.status
    }

    fn header(&self, name: &str) -> Option<String> {
        find_header(&self.headers, name)
    }

    fn read_chunk(&mut self, max_len: usize) -> Result<Option<Vec<u8>>> {
        if self.body.is_empty() {
            return Ok(None);
        }
        let n = max_len.max(1).min(self.body.len());
        Ok(Some(self.body.drain(..n).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request_url(endpoint: &str) -> reqwest::Url {
        reqwest::Url::parse_with_params(
            &format!("{}/text-to-speech/v/stream-input", endpoint),
            &[("model_id", "eleven_multilingual_v2"), ("enable_ssml_parsing", "false")],
        )
        .unwrap()
    }

    #[test]
    fn test_socket_url_switches_scheme() {
        let url = socket_url(request_url("https://api.elevenlabs.io/v1")).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/v1/text-to-speech/v/stream-input");
        assert_eq!(
            url.query(),
            Some("model_id=eleven_multilingual_v2&enable_ssml_parsing=false")
        );

        let url = socket_url(request_url("http://localhost:8080")).unwrap();
        assert_eq!(url.scheme(), "ws");
    }

    #[test]
    fn test_socket_url_rejects_other_schemes() {
        assert!(matches!(
            socket_url(request_url("ftp://example.com")),
            Err(VoxError::NetworkFailure { .. })
        ));
    }

    #[test]
    fn test_sender_serializes_in_order_then_closes() {
        let messages = vec![json!({"text": " "}), json!({"text": "Hi "}), json!({"text": ""})];
        let rx = spawn_sender(Box::new(messages.into_iter()));
        let sent: Vec<String> = rx.iter().collect();
        assert_eq!(
            sent,
            vec![r#"{"text":" "}"#, r#"{"text":"Hi "}"#, r#"{"text":""}"#]
        );
    }

    #[test]
    fn test_refused_upgrade_reads_back_error_body() {
        let mut refused = RefusedUpgrade {
            status: 403,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: br#"{"detail":"quota exceeded"}"#.to_vec(),
        };
        assert!(!refused.is_success());
        assert_eq!(refused.header("content-type").as_deref(), Some("application/json"));
        assert!(refused.read_text(4096).contains("quota exceeded"));
        assert_eq!(refused.read_chunk(16).unwrap(), None);
    }

    #[test]
    fn test_unreachable_socket_is_network_failure() {
        let url = socket_url(request_url("http://127.0.0.1:1")).unwrap();
        let result = open(
            url,
            &HeaderMap::new(),
            Duration::from_secs(1),
            Box::new(std::iter::empty()),
        );
        assert!(matches!(result, Err(VoxError::NetworkFailure { .. })));
    }
}
