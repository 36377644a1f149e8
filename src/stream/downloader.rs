//! Response body to [`StreamBuffer`].

use super::StreamBuffer;
use crate::config::StreamConfig;
use crate::error::{Result, VoxError};
use crate::transcript::Alignment;
use crate::transport::Connection;
use base64::{Engine as _, engine::general_purpose};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Error bodies are truncated to this many bytes.
const ERROR_DETAIL_LIMIT: usize = 4096;

/// How audio is carried in the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// The body is the audio stream itself.
    Raw,
    /// Newline-delimited JSON messages with base64 audio and alignment.
    JsonLines,
}

/// Summary of a finished download.
#[derive(Debug, Default)]
pub struct DownloadReport {
    /// Audio bytes appended to the buffer.
    pub bytes: usize,
    /// Body reads performed.
    pub chunks: usize,
    /// Alignment of each message, in arrival order.
    pub alignments: Vec<Alignment>,
    pub cancelled: bool,
}

#[derive(Deserialize)]
struct BodyMessage {
    #[serde(default, alias = "audio")]
    audio_base64: Option<String>,
    #[serde(default)]
    alignment: Option<serde_json::Value>,
    #[serde(default, rename = "normalizedAlignment")]
    normalized_alignment: Option<serde_json::Value>,
    #[serde(default, rename = "isFinal")]
    is_final: Option<bool>,
}

/// Pulls one response body into a stream buffer.
#[derive(Debug)]
pub struct Downloader {
    buffer: StreamBuffer,
    framing: BodyFraming,
    chunk_size: usize,
    cancel: Arc<AtomicBool>,
}

impl Downloader {
    pub fn new(
        buffer: StreamBuffer,
        framing: BodyFraming,
        config: &StreamConfig,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            buffer,
            framing,
            chunk_size: config.download_chunk_size.max(1),
            cancel,
        }
    }

    /// Read the body to completion.
    ///
    /// Success marks the buffer done; any error marks it failed so the decoder
    /// stops waiting.
    pub fn run(&self, connection: &mut dyn Connection) -> Result<DownloadReport> {
        let result = self.pump(connection);
        match &result {
            Ok(report) => {
                tracing::debug!(
                    bytes = report.bytes,
                    chunks = report.chunks,
                    cancelled = report.cancelled,
                    "download finished"
                );
                self.buffer.finish();
            }
            Err(e) => {
                tracing::warn!(error = %e, "download failed");
                self.buffer.fail(e.to_string());
            }
        }
        result
    }

    fn pump(&self, connection: &mut dyn Connection) -> Result<DownloadReport> {
        if !connection.is_success() {
            return Err(VoxError::HttpStatus {
                status: connection.status(),
                detail: connection.read_text(ERROR_DETAIL_LIMIT),
            });
        }

        let mut report = DownloadReport::default();
        let mut partial_line = Vec::new();

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                report.cancelled = true;
                return Ok(report);
            }
            let Some(chunk) = connection.read_chunk(self.chunk_size)? else {
                break;
            };
            report.chunks += 1;

            match self.framing {
                BodyFraming::Raw => {
                    report.bytes += chunk.len();
                    self.buffer.append(&chunk);
                }
                BodyFraming::JsonLines => {
                    partial_line.extend_from_slice(&chunk);
                    while let Some(end) = partial_line.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = partial_line.drain(..=end).collect();
                        if self.handle_line(&line, &mut report)? {
                            return Ok(report);
                        }
                    }
                }
            }
        }

        if self.framing == BodyFraming::JsonLines {
            self.handle_line(&partial_line, &mut report)?;
        }
        Ok(report)
    }

    /// Returns true when the message marks the end of the body.
    fn handle_line(&self, line: &[u8], report: &mut DownloadReport) -> Result<bool> {
        if line.iter().all(u8::is_ascii_whitespace) {
            return Ok(false);
        }
        let message: BodyMessage = serde_json::from_slice(line)?;

        if let Some(alignment) = message.normalized_alignment.or(message.alignment) {
            report.alignments.push(Alignment::from_value(alignment)?);
        }

        if let Some(audio) = message.audio_base64 {
            let bytes = general_purpose::STANDARD
                .decode(audio.trim())
                .map_err(|e| VoxError::Decode {
                    message: format!("invalid base64 audio in response: {}", e),
                })?;
            report.bytes += bytes.len();
            self.buffer.append(&bytes);
        }

        Ok(message.is_final.unwrap_or(false))
    }
}
