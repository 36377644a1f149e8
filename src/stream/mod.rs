//! Network bytes to decoded audio blocks.
//!
//! [`Downloader`] appends response bytes to a [`StreamBuffer`]; the
//! [`IncrementalDecoder`] turns whatever has arrived so far into fixed-size
//! [`Block`]s, retrying header parsing and reopening the container when the
//! growing stream runs out mid-packet.

pub mod buffer;
pub mod decoder;
pub mod downloader;

pub use buffer::{BufferSource, StreamBuffer};
pub use decoder::{BlockPoll, IncrementalDecoder, RawEncoding};
pub use downloader::{BodyFraming, DownloadReport, Downloader};

/// Decoding progress of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No container header parsed yet.
    AwaitingHeader,
    /// Producing full blocks.
    Decoding,
    /// Download finished, serving the remainder.
    Draining,
    /// Every frame delivered.
    Done,
    /// Unrecoverable error.
    Failed,
}

/// A unit of decoded audio handed to playback.
///
/// `samples` is interleaved. All blocks of a stream hold `block_size`
/// frames except possibly the last, which has `is_final` set.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
    pub index: u64,
    pub is_final: bool,
}

impl Block {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }
}
