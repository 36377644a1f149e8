//! Error types for voxstream.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoxError {
    // Configuration errors
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Invalid output format '{format}': {message}")]
    InvalidOutputFormat { format: String, message: String },

    // Request dispatch errors
    #[error("Request {request_id} failed before a connection was established: {message}")]
    AdmissionFailure { request_id: String, message: String },

    #[error("Network failure: {message}")]
    NetworkFailure { message: String },

    #[error("Server returned HTTP {status}: {detail}")]
    HttpStatus { status: u16, detail: String },

    #[error("Malformed JSON in response: {0}")]
    MalformedJson(#[from] serde_json::Error),

    // Decoding errors
    #[error("Audio decoding failed: {message}")]
    Decode { message: String },

    // Playback errors
    #[error("Playback underrun: the output queue ran dry while the stream was still active")]
    RealtimeUnderrun,

    #[error("Playback stalled: no room in the playback queue after {waited_ms} ms")]
    PlaybackStalled { waited_ms: u64 },

    #[error("Audio device not found: {device}")]
    AudioDeviceNotFound { device: String },

    #[error("Audio output failed: {message}")]
    AudioOutput { message: String },

    #[error("Stream cancelled")]
    Cancelled,

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl VoxError {
    /// True for errors that end a stream because the server or the network
    /// misbehaved, as opposed to local playback or configuration problems.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            VoxError::NetworkFailure { .. }
                | VoxError::HttpStatus { .. }
                | VoxError::AdmissionFailure { .. }
                | VoxError::MalformedJson(_)
        )
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VoxError>;
