//! Output format strings such as `mp3_44100_128`, `pcm_24000` and `ulaw_8000`.
//!
//! The codec decides which decoder path a stream takes: containers go through
//! the incremental container decoder, raw PCM and µ-law are framed directly.

use crate::error::{Result, VoxError};
use std::fmt;
use std::str::FromStr;

/// Audio codec requested from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    /// MPEG layer 3 in a header-bearing container.
    Mp3,
    /// Signed 16-bit little-endian mono PCM without any header.
    Pcm,
    /// 8-bit G.711 µ-law mono without any header.
    Ulaw,
}

impl Codec {
    fn as_str(&self) -> &'static str {
        match self {
            Codec::Mp3 => "mp3",
            Codec::Pcm => "pcm",
            Codec::Ulaw => "ulaw",
        }
    }
}

/// Parsed output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputFormat {
    pub codec: Codec,
    pub sample_rate: u32,
    pub bitrate_kbps: Option<u32>,
}

impl OutputFormat {
    pub fn new(codec: Codec, sample_rate: u32) -> Self {
        Self {
            codec,
            sample_rate,
            bitrate_kbps: None,
        }
    }

    /// True when the stream carries a header that must be parsed before decoding.
    pub fn is_container(&self) -> bool {
        matches!(self.codec, Codec::Mp3)
    }

    /// Bytes per sample for headerless formats, `None` for containers.
    pub fn sample_width(&self) -> Option<usize> {
        match self.codec {
            Codec::Mp3 => None,
            Codec::Pcm => Some(2),
            Codec::Ulaw => Some(1),
        }
    }

    /// File extension used as a probe hint.
    pub fn extension(&self) -> &'static str {
        self.codec.as_str()
    }
}

impl Default for OutputFormat {
    /// `mp3_44100_128`, the server's own default.
    fn default() -> Self {
        Self {
            codec: Codec::Mp3,
            sample_rate: 44100,
            bitrate_kbps: Some(128),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.codec.as_str(), self.sample_rate)?;
        if let Some(bitrate) = self.bitrate_kbps {
            write!(f, "_{}", bitrate)?;
        }
        Ok(())
    }
}

impl FromStr for OutputFormat {
    type Err = VoxError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |message: &str| VoxError::InvalidOutputFormat {
            format: s.to_string(),
            message: message.to_string(),
        };

        let lower = s.trim().to_lowercase();
        let mut parts = lower.split('_');

        let codec = match parts.next() {
            Some("mp3") => Codec::Mp3,
            Some("pcm") => Codec::Pcm,
            Some("ulaw") => Codec::Ulaw,
            _ => return Err(invalid("unknown codec")),
        };

        let sample_rate = parts
            .next()
            .ok_or_else(|| invalid("missing sample rate"))?
            .parse::<u32>()
            .map_err(|_| invalid("sample rate is not a number"))?;
        if sample_rate == 0 {
            return Err(invalid("sample rate must be positive"));
        }

        let bitrate_kbps = match parts.next() {
            Some(bitrate) => Some(
                bitrate
                    .parse::<u32>()
                    .map_err(|_| invalid("bitrate is not a number"))?,
            ),
            None => None,
        };

        if parts.next().is_some() {
            return Err(invalid("too many components"));
        }

        Ok(Self {
            codec,
            sample_rate,
            bitrate_kbps,
        })
    }
}
