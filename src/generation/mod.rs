//! Generation requests: prompts, options, and the client that runs them.

pub mod chunker;
pub mod client;
pub mod request;

pub use chunker::TextChunker;
pub use client::SpeechClient;
pub use request::{PreparedRequest, build_request};

use crate::config::StreamConfig;
use crate::error::{Result, VoxError};
use crate::format::OutputFormat;
use crate::pending::Pending;
use crate::playback::{PlaybackControl, PlaybackOptions, StreamSummary};
use crate::stream::Block;
use crate::transcript::{TranscriptReceiver, UnitKind};
use crate::transport::Connection;
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// What to generate speech from.
pub enum Prompt {
    Text(String),
    /// Source speech for speech-to-speech conversion.
    Audio(Vec<u8>),
    /// Text fragments produced over time, e.g. by a language model.
    TokenStream(Box<dyn Iterator<Item = String> + Send>),
}

impl std::fmt::Debug for Prompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Prompt::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Prompt::Audio(bytes) => write!(f, "Audio({} bytes)", bytes.len()),
            Prompt::TokenStream(_) => f.write_str("TokenStream(..)"),
        }
    }
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Prompt::Text(text.to_string())
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Prompt::Text(text)
    }
}

/// Voice parameters sent with a request. Overrides the voice's stored settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    pub stability: f64,
    pub similarity_boost: f64,
    pub style: Option<f64>,
    pub use_speaker_boost: Option<bool>,
}

impl VoiceSettings {
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = json!({
            "stability": self.stability,
            "similarity_boost": self.similarity_boost,
        });
        if let Some(style) = self.style {
            value["style"] = json!(style);
        }
        if let Some(boost) = self.use_speaker_boost {
            value["use_speaker_boost"] = json!(boost);
        }
        value
    }

    fn validate(&self) -> Result<()> {
        let fields = [
            ("stability", Some(self.stability)),
            ("similarity_boost", Some(self.similarity_boost)),
            ("style", self.style),
        ];
        for (key, value) in fields {
            if let Some(value) = value
                && !(0.0..=1.0).contains(&value)
            {
                return Err(VoxError::ConfigInvalidValue {
                    key: key.to_string(),
                    message: format!("{} is outside 0.0..=1.0", value),
                });
            }
        }
        Ok(())
    }
}

/// Settings for token-stream generations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputStreamOptions {
    /// Ask the server to start generating before a schedule threshold is hit.
    pub try_trigger_generation: bool,
    /// Characters buffered server-side before each audio chunk, 50..=500 each.
    pub chunk_length_schedule: Vec<u32>,
    pub enable_ssml_parsing: bool,
}

impl Default for InputStreamOptions {
    fn default() -> Self {
        Self {
            try_trigger_generation: false,
            chunk_length_schedule: vec![125],
            enable_ssml_parsing: false,
        }
    }
}

/// Per-generation options.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    /// Model to use; text and speech-to-speech defaults differ.
    pub model_id: Option<String>,
    pub output_format: OutputFormat,
    /// `optimize_streaming_latency`, 0..=4.
    pub latency_optimization: Option<u8>,
    pub voice_settings: Option<VoiceSettings>,
    /// Request ids of generations spoken before this one.
    pub previous_request_ids: Vec<String>,
    /// Request ids of generations spoken after this one.
    pub next_request_ids: Vec<String>,
    pub previous_text: Option<String>,
    pub next_text: Option<String>,
    /// Request character alignment with the audio (text prompts).
    pub with_timestamps: bool,
    /// Transcript event unit.
    pub granularity: UnitKind,
    pub input_stream: InputStreamOptions,
    /// Replaces the client's stream settings for this generation only.
    pub stream: Option<StreamConfig>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            model_id: None,
            output_format: OutputFormat::default(),
            latency_optimization: None,
            voice_settings: None,
            previous_request_ids: Vec::new(),
            next_request_ids: Vec::new(),
            previous_text: None,
            next_text: None,
            with_timestamps: false,
            granularity: UnitKind::Character,
            input_stream: InputStreamOptions::default(),
            stream: None,
        }
    }
}

impl GenerationOptions {
    pub fn validate(&self) -> Result<()> {
        if let Some(level) = self.latency_optimization
            && level > 4
        {
            return Err(VoxError::ConfigInvalidValue {
                key: "latency_optimization".to_string(),
                message: format!("{} is outside 0..=4", level),
            });
        }
        if let Some(settings) = &self.voice_settings {
            settings.validate()?;
        }
        if let Some(bad) = self
            .input_stream
            .chunk_length_schedule
            .iter()
            .find(|len| !(50..=500).contains(*len))
        {
            return Err(VoxError::ConfigInvalidValue {
                key: "chunk_length_schedule".to_string(),
                message: format!("{} is outside 50..=500", bad),
            });
        }
        if let Some(stream) = &self.stream {
            stream.validate()?;
        }
        Ok(())
    }
}

/// Metadata from the response headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationInfo {
    pub history_item_id: Option<String>,
    /// Server-assigned id, usable in `previous_request_ids` of a later request.
    pub request_id: Option<String>,
    pub tts_latency_ms: Option<String>,
    pub character_cost: Option<u64>,
}

impl GenerationInfo {
    pub fn from_connection(connection: &dyn Connection) -> Self {
        Self {
            history_item_id: connection.header("history-item-id"),
            request_id: connection.header("request-id"),
            tts_latency_ms: connection.header("tts-latency-ms"),
            character_cost: connection
                .header("character-cost")
                .and_then(|cost| cost.trim().parse().ok()),
        }
    }
}

/// How the audio should be handed back.
#[derive(Debug)]
pub enum Delivery {
    /// Wait for the whole body; PCM and µ-law are wrapped as WAV.
    Buffered,
    /// Decode while downloading, optionally playing as blocks arrive.
    Streamed { playback: Option<PlaybackOptions> },
}

impl Delivery {
    pub fn streamed() -> Self {
        Delivery::Streamed { playback: None }
    }

    pub fn played(options: PlaybackOptions) -> Self {
        Delivery::Streamed {
            playback: Some(options),
        }
    }
}

/// The audio side of a generation.
#[derive(Debug)]
pub enum AudioHandle {
    Buffered(Pending<Vec<u8>>),
    Streaming(StreamingAudio),
}

impl AudioHandle {
    pub fn into_buffered(self) -> Option<Pending<Vec<u8>>> {
        match self {
            AudioHandle::Buffered(audio) => Some(audio),
            AudioHandle::Streaming(_) => None,
        }
    }

    pub fn into_streaming(self) -> Option<StreamingAudio> {
        match self {
            AudioHandle::Streaming(stream) => Some(stream),
            AudioHandle::Buffered(_) => None,
        }
    }
}

/// A generation that is being decoded, and possibly played, right now.
#[derive(Debug)]
pub struct StreamingAudio {
    pub(crate) request_id: String,
    pub(crate) blocks: Receiver<Block>,
    pub(crate) transcript: Option<TranscriptReceiver>,
    pub(crate) playback: Option<PlaybackControl>,
    pub(crate) outcome: Pending<StreamSummary>,
    pub(crate) cancel: Arc<AtomicBool>,
}

impl StreamingAudio {
    /// Client-side key used for admission, not the server's request id.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Decoded blocks in stream order. Empty when the stream is being played.
    pub fn blocks(&self) -> &Receiver<Block> {
        &self.blocks
    }

    /// Timing events, for generations that return alignment.
    pub fn transcript(&self) -> Option<&TranscriptReceiver> {
        self.transcript.as_ref()
    }

    pub fn playback(&self) -> Option<&PlaybackControl> {
        self.playback.as_ref()
    }

    /// Stop downloading, decoding and playing.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(control) = &self.playback {
            control.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Terminal result, available without consuming the handle.
    pub fn outcome(&self) -> &Pending<StreamSummary> {
        &self.outcome
    }

    /// Block until the stream has ended.
    pub fn wait(self) -> Result<StreamSummary> {
        self.outcome.wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockConnection;

    #[test]
    fn test_default_options_are_valid() {
        let options = GenerationOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.output_format.to_string(), crate::defaults::OUTPUT_FORMAT);
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let options = GenerationOptions {
            latency_optimization: Some(5),
            ..GenerationOptions::default()
        };
        assert!(options.validate().is_err());

        let options = GenerationOptions {
            voice_settings: Some(VoiceSettings {
                stability: 1.5,
                similarity_boost: 0.5,
                style: None,
                use_speaker_boost: None,
            }),
            ..GenerationOptions::default()
        };
        match options.validate() {
            Err(VoxError::ConfigInvalidValue { key, .. }) => assert_eq!(key, "stability"),
            other => panic!("Expected ConfigInvalidValue, got {:?}", other),
        }

        let mut options = GenerationOptions::default();
        options.input_stream.chunk_length_schedule = vec![120, 20];
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_generation_info_from_headers() {
        let connection = MockConnection::ok(b"", 1)
            .with_header("history-item-id", "hist-1")
            .with_header("Request-Id", "req-9")
            .with_header("tts-latency-ms", "212")
            .with_header("character-cost", " 42 ");

        let info = GenerationInfo::from_connection(&connection);
        assert_eq!(info.history_item_id.as_deref(), Some("hist-1"));
        assert_eq!(info.request_id.as_deref(), Some("req-9"));
        assert_eq!(info.tts_latency_ms.as_deref(), Some("212"));
        assert_eq!(info.character_cost, Some(42));
    }

    #[test]
    fn test_prompt_conversions() {
        assert!(matches!(Prompt::from("hi"), Prompt::Text(t) if t == "hi"));
        assert_eq!(format!("{:?}", Prompt::Audio(vec![0; 3])), "Audio(3 bytes)");
    }
}
