//! Incremental decoding of a stream that is still downloading.
//!
//! Containers are parsed with symphonia over a [`BufferSource`]. A reader
//! that hits the end of the buffered bytes mid-packet cannot be resumed, so
//! it is dropped and reopened later against the longer buffer, positioned at
//! the exact frame already delivered. Headerless PCM and µ-law are framed
//! directly by sample width.

use super::{Block, StreamBuffer, StreamState};
use crate::config::StreamConfig;
use crate::error::{Result, VoxError};
use crate::format::{Codec, OutputFormat};
use std::io;
use std::time::Duration;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Result of asking the decoder for the next block.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockPoll {
    Block(Block),
    /// Not enough bytes yet. Wait with [`IncrementalDecoder::wait_ready`] and poll again.
    Pending,
    /// Every block has been delivered.
    Finished,
}

/// Headerless sample encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEncoding {
    /// Signed 16-bit little-endian.
    Pcm16,
    /// G.711 µ-law, one byte per sample.
    Ulaw,
}

impl RawEncoding {
    pub fn sample_width(&self) -> usize {
        match self {
            RawEncoding::Pcm16 => 2,
            RawEncoding::Ulaw => 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Framing {
    Container { hint: &'static str },
    Raw(RawEncoding),
}

enum Fill {
    Progress,
    Starved,
    Ended,
}

/// Pulls fixed-size blocks out of a [`StreamBuffer`] as bytes arrive.
pub struct IncrementalDecoder {
    buffer: StreamBuffer,
    framing: Framing,
    block_size: usize,
    stall_bytes: usize,
    state: StreamState,
    reader: Option<ContainerReader>,
    carry: Option<u8>,
    pending: Vec<f32>,
    channels: u16,
    sample_rate: u32,
    /// Frames decoded so far, including those still in `pending`.
    position: u64,
    next_index: u64,
    header_retries: u32,
    reopens: u32,
    /// Bytes the reader had consumed when frames were last produced.
    progress_cursor: usize,
    failure: Option<String>,
}

impl std::fmt::Debug for IncrementalDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalDecoder")
            .field("framing", &self.framing)
            .field("state", &self.state)
            .field("position", &self.position)
            .field("next_index", &self.next_index)
            .finish_non_exhaustive()
    }
}

impl IncrementalDecoder {
    /// Pick the decoding path for a server output format.
    pub fn for_format(buffer: StreamBuffer, format: &OutputFormat, config: &StreamConfig) -> Self {
        let mut decoder = match format.codec {
            Codec::Mp3 => Self::container(buffer, format.extension(), config),
            Codec::Pcm => Self::raw(buffer, RawEncoding::Pcm16, format.sample_rate, config),
            Codec::Ulaw => Self::raw(buffer, RawEncoding::Ulaw, format.sample_rate, config),
        };
        decoder.sample_rate = format.sample_rate;
        decoder
    }

    /// Decode a header-bearing container. `hint` is a file extension such as `mp3`.
    pub fn container(buffer: StreamBuffer, hint: &'static str, config: &StreamConfig) -> Self {
        Self::new(buffer, Framing::Container { hint }, 0, config)
    }

    /// Frame headerless mono samples.
    pub fn raw(
        buffer: StreamBuffer,
        encoding: RawEncoding,
        sample_rate: u32,
        config: &StreamConfig,
    ) -> Self {
        let mut decoder = Self::new(buffer, Framing::Raw(encoding), sample_rate, config);
        decoder.state = StreamState::Decoding;
        decoder
    }

    fn new(buffer: StreamBuffer, framing: Framing, sample_rate: u32, config: &StreamConfig) -> Self {
        let block_size = config.block_size.max(1);
        Self {
            buffer,
            framing,
            block_size,
            stall_bytes: block_size.saturating_mul(config.decode_retry_limit.max(1) as usize),
            state: StreamState::AwaitingHeader,
            reader: None,
            carry: None,
            pending: Vec::new(),
            channels: 1,
            sample_rate,
            position: 0,
            next_index: 0,
            header_retries: 0,
            reopens: 0,
            progress_cursor: 0,
            failure: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Sample rate of the decoded audio, 0 while a container header is unparsed.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Header parse attempts that failed for lack of data.
    pub fn header_retries(&self) -> u32 {
        self.header_retries
    }

    /// Times the container was reopened after running dry mid-packet.
    pub fn reopens(&self) -> u32 {
        self.reopens
    }

    /// Unread bytes needed before another block can be attempted.
    pub fn ready_threshold(&self) -> usize {
        match self.framing {
            Framing::Container { .. } => self.block_size,
            Framing::Raw(encoding) => self.block_size * encoding.sample_width(),
        }
    }

    /// Block until polling again is worthwhile or `timeout` elapses.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        if self.state == StreamState::AwaitingHeader {
            self.buffer.wait_header_ready(timeout)
        } else {
            self.buffer
                .wait_block_available(self.ready_threshold(), timeout)
        }
    }

    /// Produce the next block if enough audio has arrived.
    ///
    /// Never blocks. Errors move the decoder to [`StreamState::Failed`].
    pub fn poll_block(&mut self) -> Result<BlockPoll> {
        match self.state {
            StreamState::Done => return Ok(BlockPoll::Finished),
            StreamState::Failed => {
                return Err(VoxError::Decode {
                    message: self
                        .failure
                        .clone()
                        .unwrap_or_else(|| "stream already failed".to_string()),
                });
            }
            _ => {}
        }

        match self.advance() {
            Ok(poll) => Ok(poll),
            Err(e) => {
                tracing::error!(error = %e, position = self.position, "stream decoding failed");
                self.state = StreamState::Failed;
                self.failure = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn advance(&mut self) -> Result<BlockPoll> {
        loop {
            if self.buffered_frames() >= self.block_size {
                return Ok(BlockPoll::Block(self.take_block(self.block_size, false)));
            }

            if self.state == StreamState::Draining {
                self.state = StreamState::Done;
                let frames = self.buffered_frames();
                if frames == 0 {
                    return Ok(BlockPoll::Finished);
                }
                return Ok(BlockPoll::Block(self.take_block(frames, true)));
            }

            if let Some(message) = self.buffer.failure() {
                return Err(VoxError::NetworkFailure { message });
            }

            let fill = match self.framing {
                Framing::Container { hint } => self.fill_container(hint)?,
                Framing::Raw(encoding) => self.fill_raw(encoding),
            };
            match fill {
                Fill::Progress => {}
                Fill::Starved => return Ok(BlockPoll::Pending),
                Fill::Ended => {
                    tracing::debug!(frames = self.position, "download complete, draining");
                    self.state = StreamState::Draining;
                }
            }
        }
    }

    fn fill_container(&mut self, hint: &'static str) -> Result<Fill> {
        // Snapshot before reading: an end-of-data error only means the real
        // end if the download had already finished when the read started.
        let done_before = self.buffer.is_download_done();
        let observed_tail = self.buffer.tail();

        if self.reader.is_none() {
            match ContainerReader::open(&self.buffer, hint, self.position) {
                Ok(reader) => {
                    if self.state == StreamState::AwaitingHeader {
                        tracing::debug!(
                            retries = self.header_retries,
                            bytes = observed_tail,
                            "stream header parsed"
                        );
                        self.state = StreamState::Decoding;
                    } else {
                        self.reopens += 1;
                    }
                    if let Some(channels) = reader.channels {
                        self.channels = channels;
                    }
                    if let Some(rate) = reader.sample_rate {
                        self.sample_rate = rate;
                    }
                    self.reader = Some(reader);
                }
                Err(e) if !done_before => {
                    if self.state == StreamState::AwaitingHeader {
                        self.header_retries += 1;
                        self.buffer.clear_header_ready(observed_tail);
                        tracing::debug!(
                            attempt = self.header_retries,
                            bytes = observed_tail,
                            error = %e,
                            "header not parseable yet"
                        );
                    }
                    return self.starve();
                }
                Err(e) if self.state != StreamState::AwaitingHeader && is_end_of_data(&e) => {
                    return Ok(Fill::Ended);
                }
                Err(e) => {
                    return Err(VoxError::Decode {
                        message: format!("cannot open audio stream: {}", e),
                    });
                }
            }
        }

        let Some(reader) = self.reader.as_mut() else {
            return Ok(Fill::Starved);
        };

        match reader.next_frames(self.position, &mut self.pending) {
            Ok(frames) => {
                if frames > 0 {
                    self.position += frames as u64;
                    self.progress_cursor = self.buffer.cursor();
                    if let Some(channels) = reader.channels {
                        self.channels = channels;
                    }
                    if let Some(rate) = reader.sample_rate {
                        self.sample_rate = rate;
                    }
                }
                Ok(Fill::Progress)
            }
            Err(e) if is_end_of_data(&e) => {
                if done_before {
                    return Ok(Fill::Ended);
                }
                tracing::debug!(
                    position = self.position,
                    bytes = observed_tail,
                    "ran out of bytes mid-packet, reopening on next data"
                );
                self.reader = None;
                self.starve()
            }
            Err(SymphoniaError::ResetRequired) => {
                self.reader = None;
                Ok(Fill::Progress)
            }
            Err(e) => Err(VoxError::Decode {
                message: e.to_string(),
            }),
        }
    }

    /// Record that the reader ran dry. Fails once more than the stall
    /// allowance was consumed since frames were last produced.
    fn starve(&mut self) -> Result<Fill> {
        // A reader only runs dry at the tail, so the cursor covers what it read.
        let consumed = self.buffer.cursor();
        self.buffer.mark_starved();
        let stalled = consumed.saturating_sub(self.progress_cursor);
        if stalled > self.stall_bytes {
            return Err(VoxError::NetworkFailure {
                message: format!("{} bytes consumed without decodable audio", stalled),
            });
        }
        Ok(Fill::Starved)
    }

    fn fill_raw(&mut self, encoding: RawEncoding) -> Fill {
        let done_before = self.buffer.is_download_done();
        let mut bytes = vec![0u8; self.ready_threshold()];
        let n = self.buffer.read(&mut bytes);
        if n == 0 {
            if !done_before {
                return Fill::Starved;
            }
            if self.carry.take().is_some() {
                tracing::debug!("dropping trailing half sample");
            }
            return Fill::Ended;
        }
        bytes.truncate(n);

        let before = self.pending.len();
        match encoding {
            RawEncoding::Ulaw => self
                .pending
                .extend(bytes.iter().map(|&b| ulaw_to_linear(b) as f32 / 32768.0)),
            RawEncoding::Pcm16 => {
                let mut iter = bytes.into_iter();
                if let Some(low) = self.carry.take()
                    && let Some(high) = iter.next()
                {
                    self.pending
                        .push(i16::from_le_bytes([low, high]) as f32 / 32768.0);
                }
                let rest: Vec<u8> = iter.collect();
                let mut pairs = rest.chunks_exact(2);
                for pair in &mut pairs {
                    self.pending
                        .push(i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0);
                }
                self.carry = pairs.remainder().first().copied();
            }
        }
        self.position += (self.pending.len() - before) as u64;
        Fill::Progress
    }

    fn buffered_frames(&self) -> usize {
        self.pending.len() / self.channels.max(1) as usize
    }

    fn take_block(&mut self, frames: usize, is_final: bool) -> Block {
        let count = frames * self.channels.max(1) as usize;
        let samples: Vec<f32> = self.pending.drain(..count).collect();
        let block = Block {
            samples,
            channels: self.channels,
            sample_rate: self.sample_rate,
            index: self.next_index,
            is_final,
        };
        self.next_index += 1;
        block
    }
}

fn is_end_of_data(error: &SymphoniaError) -> bool {
    matches!(error, SymphoniaError::IoError(e) if e.kind() == io::ErrorKind::UnexpectedEof)
}

/// G.711 µ-law expansion to 16-bit linear.
pub(crate) fn ulaw_to_linear(byte: u8) -> i16 {
    let value = !byte;
    let exponent = (value >> 4) & 0x07;
    let mantissa = (value & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + 0x84) << exponent) - 0x84;
    if value & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// One symphonia format reader and codec over the buffer.
struct ContainerReader {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    channels: Option<u16>,
    sample_rate: Option<u32>,
}

impl ContainerReader {
    /// Probe the buffer from byte 0 and position the reader at frame `position`.
    fn open(
        buffer: &StreamBuffer,
        hint: &str,
        position: u64,
    ) -> std::result::Result<Self, SymphoniaError> {
        let mut reader = Self::probe(buffer, hint)?;
        if position == 0 {
            return Ok(reader);
        }

        let seek = reader.format.seek(
            SeekMode::Accurate,
            SeekTo::TimeStamp {
                ts: position,
                track_id: reader.track_id,
            },
        );
        match seek {
            Ok(seeked) if seeked.actual_ts <= position => {
                reader.decoder.reset();
                Ok(reader)
            }
            _ => {
                // Decode from the start and discard what was already delivered.
                tracing::debug!(position, "seek unavailable, decoding from start");
                Self::probe(buffer, hint)
            }
        }
    }

    fn probe(buffer: &StreamBuffer, hint: &str) -> std::result::Result<Self, SymphoniaError> {
        let source = buffer
            .source()
            .map_err(|e| SymphoniaError::IoError(io::Error::other(e.to_string())))?;
        let stream = MediaSourceStream::new(Box::new(source), Default::default());

        let mut probe_hint = Hint::new();
        probe_hint.with_extension(hint);

        let probed = symphonia::default::get_probe().format(
            &probe_hint,
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(SymphoniaError::Unsupported("no audio track"))?;
        let track_id = track.id;
        let channels = track.codec_params.channels.map(|c| c.count() as u16);
        let sample_rate = track.codec_params.sample_rate;
        let decoder =
            symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

        Ok(Self {
            format,
            decoder,
            track_id,
            channels,
            sample_rate,
        })
    }

    /// Decode one packet, appending only frames at or after `position`.
    /// Returns the number of frames appended.
    fn next_frames(
        &mut self,
        position: u64,
        out: &mut Vec<f32>,
    ) -> std::result::Result<usize, SymphoniaError> {
        let packet = self.format.next_packet()?;
        if packet.track_id() != self.track_id {
            return Ok(0);
        }

        let decoded = match self.decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(message)) => {
                tracing::debug!(reason = message, ts = packet.ts(), "skipping undecodable packet");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let spec = *decoded.spec();
        let frames = decoded.frames();
        if frames == 0 {
            return Ok(0);
        }
        let channels = spec.channels.count().max(1);
        self.channels = Some(channels as u16);
        self.sample_rate = Some(spec.rate);

        let mut samples = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        samples.copy_interleaved_ref(decoded);

        let already = position.saturating_sub(packet.ts()).min(frames as u64) as usize;
        out.extend_from_slice(&samples.samples()[already * channels..frames * channels]);
        Ok(frames - already)
    }
}
