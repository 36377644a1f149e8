//! HTTP transport over the reqwest blocking client.
//!
//! Requests that stream their input go over a WebSocket to the same host
//! instead, with the same headers.

use super::{ApiRequest, Connection, RequestBody, Transport, socket};
use crate::config::ApiConfig;
use crate::error::{Result, VoxError};
use reqwest::blocking::{Client, Response, multipart};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::io::Read;
use std::time::Duration;

/// Sends generation requests to the configured endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    headers: HeaderMap,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(network)?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            headers: HeaderMap::new(),
            timeout,
        })
    }

    /// Attach a header to every request, e.g. an API key supplied by the caller.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| VoxError::Other(
            format!("invalid header name '{}': {}", name, e),
        ))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| VoxError::Other(format!("invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Transport for HttpTransport {
    fn open(&self, request: ApiRequest) -> Result<Box<dyn Connection>> {
        let url = format!("{}{}", self.endpoint, request.path);
        let url = reqwest::Url::parse_with_params(&url, &request.query).map_err(|e| {
            VoxError::NetworkFailure {
                message: format!("invalid request URL {}: {}", url, e),
            }
        })?;

        tracing::debug!(%url, body = ?request.body, "opening generation request");

        let builder = match request.body {
            RequestBody::Socket(messages) => {
                let url = socket::socket_url(url)?;
                return socket::open(url, &self.headers, self.timeout, messages);
            }
            RequestBody::Json(value) => self.client.post(url).json(&value),
            RequestBody::Multipart {
                fields,
                file_field,
                file_name,
                bytes,
            } => {
                let mut form = multipart::Form::new();
                for (key, value) in fields {
                    form = form.text(key, value);
                }
                form = form.part(file_field, multipart::Part::bytes(bytes).file_name(file_name));
                self.client.post(url).multipart(form)
            }
        };

        let builder = builder.headers(self.headers.clone());
        let response = builder.send().map_err(network)?;
        Ok(Box::new(HttpConnection { response }))
    }
}

fn network(error: reqwest::Error) -> VoxError {
    VoxError::NetworkFailure {
        message: error.to_string(),
    }
}

struct HttpConnection {
    response: Response,
}

impl Connection for HttpConnection {
    fn status(&self) -> u16 {
        self.response.status().as_u16()
    }

    fn header(&self, name: &str) -> Option<String> {
        self.response
            .headers()
            .get(name.to_ascii_lowercase().as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    fn read_chunk(&mut self, max_len: usize) -> Result<Option<Vec<u8>>> {
        let mut chunk = vec![0u8; max_len.max(1)];
        let n = self.response.read(&mut chunk).map_err(|e| VoxError::NetworkFailure {
            message: e.to_string(),
        })?;
        if n == 0 {
            return Ok(None);
        }
        chunk.truncate(n);
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_trims_trailing_slash() {
        let config = ApiConfig {
            endpoint: "http://localhost:9/v1/".to_string(),
            timeout_secs: 5,
        };
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(transport.endpoint(), "http://localhost:9/v1");
    }

    #[test]
    fn test_with_header_rejects_invalid_name() {
        let transport = HttpTransport::new(&ApiConfig::default()).unwrap();
        assert!(transport.clone().with_header("bad header", "x").is_err());
        assert!(transport.with_header("xi-api-key", "secret").is_ok());
    }

    #[test]
    fn test_unreachable_endpoint_is_network_failure() {
        let config = ApiConfig {
            endpoint: "http://127.0.0.1:1".to_string(),
            timeout_secs: 2,
        };
        let transport = HttpTransport::new(&config).unwrap();
        let request = ApiRequest::new("/text-to-speech/x/stream", RequestBody::Json(json!({})));
        match transport.open(request) {
            Err(VoxError::NetworkFailure { .. }) => {}
            Err(other) => panic!("Expected NetworkFailure, got {:?}", other),
            Ok(_) => panic!("Expected NetworkFailure, got a connection"),
        }
    }
}
