//! Default configuration constants for voxstream.
//!
//! Shared by `StreamConfig`, `ApiConfig` and the generation options so every
//! entry point agrees on the same tunables.

/// Frames per playback block.
///
/// Also the buffer size requested from the output device, so one sink
/// callback consumes exactly one block.
pub const BLOCK_SIZE: usize = 2048;

/// Maximum bytes pulled from the response body per read.
pub const DOWNLOAD_CHUNK_SIZE: usize = 4096;

/// Number of decoded blocks the playback queue holds.
///
/// Playback does not start until the queue has filled once, so this is
/// also the pre-roll before the first sample is heard.
pub const BUFFER_DEPTH: usize = 8;

/// Generation requests allowed to be establishing a connection at once.
pub const MAX_IN_FLIGHT: usize = 2;

/// Blocks' worth of bytes the decoder may consume without producing a
/// single frame before the stream is declared broken.
pub const DECODE_RETRY_LIMIT: u32 = 64;

/// Consecutive playback queue timeouts tolerated before the stream fails.
pub const PUT_RETRY_LIMIT: u32 = 3;

/// Base URL of the generation API.
pub const API_ENDPOINT: &str = "https://api.elevenlabs.io/v1";

/// Request timeout in seconds. Generations can be long, so this is generous.
pub const REQUEST_TIMEOUT_SECS: u64 = 900;

/// Output format requested when the caller does not pick one.
pub const OUTPUT_FORMAT: &str = "mp3_44100_128";

/// Model used for text generations when none is given.
pub const TTS_MODEL: &str = "eleven_multilingual_v2";

/// Model used for speech-to-speech generations when none is given.
pub const STS_MODEL: &str = "eleven_multilingual_sts_v2";

/// How long the feeder waits on the stream buffer before re-checking the
/// cancellation flag, in milliseconds.
pub const READY_POLL_MS: u64 = 100;
