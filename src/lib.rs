//! voxstream - streaming speech generation
//!
//! Requests speech from a TTS web service and turns the response into audio
//! while it is still downloading: blocks of samples are decoded as soon as
//! enough bytes have arrived and can be played in real time.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod admission;
pub mod audio;
pub mod config;
pub mod defaults;
pub mod error;
pub mod format;
pub mod generation;
pub mod pending;
pub mod playback;
pub mod stream;
pub mod transcript;
pub mod transport;

// Entry point
pub use generation::{
    AudioHandle, Delivery, GenerationInfo, GenerationOptions, InputStreamOptions, Prompt,
    SpeechClient, StreamingAudio, VoiceSettings,
};

// Streaming core
pub use admission::{AdmissionGate, Ticket};
pub use stream::{Block, IncrementalDecoder, StreamBuffer};
pub use transcript::{TranscriptEvent, TranscriptReceiver, UnitKind};

// Playback
pub use playback::{AudioOutput, MockOutput, PlaybackControl, PlaybackOptions, PlaybackOutcome};

// Transport
pub use transport::{Connection, MockTransport, Transport};
#[cfg(feature = "http")]
pub use transport::HttpTransport;

// Error handling
pub use error::{Result, VoxError};

// Config
pub use config::{Config, StreamConfig};
pub use format::{Codec, OutputFormat};
pub use pending::Pending;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
