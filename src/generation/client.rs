//! Runs generations end to end.
//!
//! `begin_generation` does the cheap work on the caller's thread (request
//! construction and taking a place in the admission queue) and hands the
//! rest to worker threads:
//!
//! - the download worker waits for admission, opens the connection, resolves
//!   the metadata and pulls the body into the stream buffer;
//! - the feeder decodes blocks and queues them for playback or the caller;
//! - the playback thread, if requested, plays the queue once primed.
//!
//! The feeder thread also collects every worker's result into the stream's
//! single terminal outcome.

use super::{
    AudioHandle, Delivery, GenerationInfo, GenerationOptions, Prompt, StreamingAudio,
    build_request,
};
use crate::admission::{AdmissionGate, Ticket};
use crate::audio::wav::wrap_output;
use crate::config::StreamConfig;
use crate::error::{Result, VoxError};
use crate::format::OutputFormat;
use crate::pending::{Pending, Resolver, pending};
use crate::playback::{
    Feeder, PlaybackControl, PlaybackOptions, PlaybackOutcome, StreamSummary, playback_queue,
    spawn_player,
};
use crate::stream::{BodyFraming, Downloader, IncrementalDecoder, StreamBuffer};
use crate::transcript::{TranscriptCollector, TranscriptSender, UnitKind, transcript_channel};
use crate::transport::{ApiRequest, Connection, Transport};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

/// Error bodies are truncated to this many bytes.
const ERROR_DETAIL_LIMIT: usize = 4096;

/// Entry point for generating speech.
pub struct SpeechClient {
    transport: Arc<dyn Transport>,
    gate: RwLock<Arc<AdmissionGate>>,
    stream_config: RwLock<StreamConfig>,
    sequence: AtomicU64,
    /// Output device for playback options that do not name one.
    default_device: Option<String>,
}

impl std::fmt::Debug for SpeechClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechClient")
            .field("stream_config", &self.stream_config())
            .field("in_flight", &self.admission().in_flight())
            .field("queued", &self.admission().queued())
            .finish_non_exhaustive()
    }
}

impl SpeechClient {
    /// A client with the default stream settings.
    pub fn new(transport: impl Transport + 'static) -> Self {
        let config = StreamConfig::default();
        Self {
            transport: Arc::new(transport),
            gate: RwLock::new(AdmissionGate::new(config.max_in_flight)),
            stream_config: RwLock::new(config),
            sequence: AtomicU64::new(0),
            default_device: None,
        }
    }

    pub fn with_stream_config(transport: impl Transport + 'static, config: StreamConfig) -> Result<Self> {
        config.validate()?;
        let client = Self::new(transport);
        *client.write_config() = config;
        *client.gate.write().unwrap_or_else(PoisonError::into_inner) =
            AdmissionGate::new(config.max_in_flight);
        Ok(client)
    }

    /// An HTTP client for the configured endpoint.
    ///
    /// Requests carry no credentials. To authenticate, build the transport
    /// with [`HttpTransport::with_header`](crate::transport::HttpTransport::with_header)
    /// and pass it to [`with_stream_config`](Self::with_stream_config).
    #[cfg(feature = "http")]
    pub fn from_config(config: &crate::config::Config) -> Result<Self> {
        config.validate()?;
        let transport = crate::transport::HttpTransport::new(&config.api)?;
        let client = Self::with_stream_config(transport, config.stream)?;
        Ok(match &config.playback.device {
            Some(device) => client.with_default_device(device.clone()),
            None => client,
        })
    }

    /// Play on `device` unless the playback options name another.
    pub fn with_default_device(mut self, device: impl Into<String>) -> Self {
        self.default_device = Some(device.into());
        self
    }

    /// Settings copied into every new stream.
    pub fn stream_config(&self) -> StreamConfig {
        *self
            .stream_config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the settings for streams started from now on.
    ///
    /// Running streams keep the settings they started with. A new
    /// `max_in_flight` takes effect with a fresh admission queue; requests
    /// already queued finish under the old limit.
    pub fn set_stream_config(&self, config: StreamConfig) -> Result<()> {
        config.validate()?;
        let previous = std::mem::replace(&mut *self.write_config(), config);
        if previous.max_in_flight != config.max_in_flight {
            tracing::debug!(
                from = previous.max_in_flight,
                to = config.max_in_flight,
                "admission limit changed"
            );
            *self.gate.write().unwrap_or_else(PoisonError::into_inner) =
                AdmissionGate::new(config.max_in_flight);
        }
        Ok(())
    }

    /// The admission queue new requests are placed in.
    pub fn admission(&self) -> Arc<AdmissionGate> {
        Arc::clone(&self.gate.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Start a generation.
    ///
    /// Returns as soon as the request holds its place in the admission queue,
    /// so consecutive calls are dispatched in call order. Request failures
    /// arrive through the metadata future and the audio handle. Only
    /// foreground playback blocks, until the audio has finished playing.
    pub fn begin_generation(
        &self,
        voice_id: &str,
        prompt: Prompt,
        options: GenerationOptions,
        delivery: Delivery,
    ) -> Result<(AudioHandle, Pending<GenerationInfo>)> {
        let config = options.stream.unwrap_or_else(|| self.stream_config());
        let prepared = build_request(voice_id, prompt, &options)?;

        let request_id = format!(
            "{}-{}",
            voice_id,
            self.sequence.fetch_add(1, Ordering::Relaxed)
        );
        let ticket = self.admission().enqueue(request_id.clone());
        tracing::debug!(
            request = %request_id,
            order = ticket.order(),
            path = %prepared.request.path,
            "generation queued"
        );

        let (info_resolver, info) = pending();
        let job = Job {
            ticket,
            transport: Arc::clone(&self.transport),
            request: prepared.request,
            framing: prepared.framing,
            format: prepared.format,
            timestamps: prepared.timestamps,
            config,
            info: info_resolver,
        };

        let audio = match delivery {
            Delivery::Buffered => AudioHandle::Buffered(start_buffered(job)),
            Delivery::Streamed { mut playback } => {
                if let Some(playback) = playback.as_mut()
                    && playback.device.is_none()
                {
                    playback.device = self.default_device.clone();
                }
                let (stream, foreground) =
                    start_streamed(job, request_id, options.granularity, playback)?;
                if let Some(control) = foreground {
                    let outcome = control.wait();
                    tracing::debug!(?outcome, "foreground playback returned");
                }
                AudioHandle::Streaming(stream)
            }
        };
        Ok((audio, info))
    }

    fn write_config(&self) -> std::sync::RwLockWriteGuard<'_, StreamConfig> {
        self.stream_config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Everything a worker needs to run one request.
struct Job {
    ticket: Ticket,
    transport: Arc<dyn Transport>,
    request: ApiRequest,
    framing: BodyFraming,
    format: OutputFormat,
    timestamps: bool,
    config: StreamConfig,
    info: Resolver<GenerationInfo>,
}

/// Wait for admission, open the request and resolve the metadata.
///
/// A non-2xx response is turned into `HttpStatus` here so that both the
/// metadata and the audio report it.
fn connect(
    ticket: Ticket,
    transport: &dyn Transport,
    request: ApiRequest,
    info: Resolver<GenerationInfo>,
) -> Result<Box<dyn Connection>> {
    let mut connection = match ticket.admit(|| transport.open(request)) {
        Ok(connection) => connection,
        Err(e) => {
            info.resolve(Err(duplicate(&e)));
            return Err(e);
        }
    };

    if !connection.is_success() {
        let status = connection.status();
        let detail = connection.read_text(ERROR_DETAIL_LIMIT);
        tracing::warn!(status, detail = %detail, "generation request rejected");
        info.resolve(Err(VoxError::HttpStatus {
            status,
            detail: detail.clone(),
        }));
        return Err(VoxError::HttpStatus { status, detail });
    }

    info.resolve(Ok(GenerationInfo::from_connection(connection.as_ref())));
    Ok(connection)
}

/// Same failure, for a second receiver.
fn duplicate(error: &VoxError) -> VoxError {
    match error {
        VoxError::AdmissionFailure {
            request_id,
            message,
        } => VoxError::AdmissionFailure {
            request_id: request_id.clone(),
            message: message.clone(),
        },
        VoxError::HttpStatus { status, detail } => VoxError::HttpStatus {
            status: *status,
            detail: detail.clone(),
        },
        other => VoxError::NetworkFailure {
            message: other.to_string(),
        },
    }
}

fn start_buffered(job: Job) -> Pending<Vec<u8>> {
    let (resolver, audio) = pending();
    thread::spawn(move || {
        let result = run_buffered(job);
        if let Err(e) = &result {
            tracing::warn!(error = %e, "buffered generation failed");
        }
        resolver.resolve(result);
    });
    audio
}

fn run_buffered(job: Job) -> Result<Vec<u8>> {
    let Job {
        ticket,
        transport,
        request,
        framing,
        format,
        config,
        info,
        ..
    } = job;

    let mut connection = connect(ticket, transport.as_ref(), request, info)?;
    let buffer = StreamBuffer::new();
    let report = Downloader::new(
        buffer.clone(),
        framing,
        &config,
        Arc::new(AtomicBool::new(false)),
    )
    .run(connection.as_mut())?;
    tracing::debug!(bytes = report.bytes, "buffered generation downloaded");
    wrap_output(buffer.snapshot(), &format)
}

fn start_streamed(
    job: Job,
    request_id: String,
    granularity: UnitKind,
    playback: Option<PlaybackOptions>,
) -> Result<(StreamingAudio, Option<PlaybackControl>)> {
    let config = job.config;
    let buffer = StreamBuffer::new();
    let cancel = Arc::new(AtomicBool::new(false));
    let decoder = IncrementalDecoder::for_format(buffer.clone(), &job.format, &config);
    let mut feeder = Feeder::new(decoder, Arc::clone(&cancel));
    let (blocks_tx, blocks_rx) = crossbeam_channel::unbounded();

    let mut foreground = None;
    let mut player = None;
    let (queue, control) = match playback {
        Some(mut options) => {
            let output = options.take_output(config.block_size)?;
            if let Some(processor) = options.processor.take() {
                feeder = feeder.with_processor(processor);
            }
            let (queue_tx, queue_rx) = playback_queue(&config);
            let control = PlaybackControl::new();
            player = Some(spawn_player(
                queue_rx,
                output,
                options.on_start.take(),
                options.on_end.take(),
                control.clone(),
            ));
            if !options.run_in_background {
                foreground = Some(control.clone());
            }
            (Some(queue_tx), Some(control))
        }
        None => {
            feeder = feeder.with_tap(blocks_tx);
            (None, None)
        }
    };

    let (transcript_tx, transcript_rx) = if job.timestamps {
        let (tx, rx) = transcript_channel();
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    let download = {
        let buffer = buffer.clone();
        let cancel = Arc::clone(&cancel);
        thread::spawn(move || download_stream(job, buffer, cancel, transcript_tx, granularity))
    };

    let (resolver, outcome) = pending();
    {
        let cancel = Arc::clone(&cancel);
        let control = control.clone();
        let request_id = request_id.clone();
        thread::spawn(move || {
            let fed = feeder.run(queue);
            if fed.is_err() {
                // Stop the download before its next chunk.
                cancel.store(true, Ordering::SeqCst);
            }
            let downloaded = join(download);
            let played = control.as_ref().map(PlaybackControl::wait);
            if let Some(player) = player
                && player.join().is_err()
            {
                tracing::error!(request = %request_id, "playback thread panicked");
            }

            let result = settle(fed, downloaded, played);
            match &result {
                Ok(summary) => tracing::debug!(
                    request = %request_id,
                    blocks = summary.blocks,
                    frames = summary.frames,
                    "stream finished"
                ),
                Err(e) => tracing::error!(request = %request_id, error = %e, "stream failed"),
            }
            resolver.resolve(result);
        });
    }

    let stream = StreamingAudio {
        request_id,
        blocks: blocks_rx,
        transcript: transcript_rx,
        playback: control,
        outcome,
        cancel,
    };
    Ok((stream, foreground))
}

fn download_stream(
    job: Job,
    buffer: StreamBuffer,
    cancel: Arc<AtomicBool>,
    transcript: Option<TranscriptSender>,
    granularity: UnitKind,
) -> Result<()> {
    let Job {
        ticket,
        transport,
        request,
        framing,
        format,
        config,
        info,
        ..
    } = job;

    let mut connection = match connect(ticket, transport.as_ref(), request, info) {
        Ok(connection) => connection,
        Err(e) => {
            buffer.fail(e.to_string());
            return Err(e);
        }
    };

    let report = Downloader::new(buffer, framing, &config, cancel).run(connection.as_mut())?;

    if let Some(sender) = transcript
        && !report.cancelled
    {
        let mut collector = TranscriptCollector::new(granularity, format.sample_rate);
        for alignment in report.alignments {
            collector.push(alignment);
        }
        let reported = collector.reported_units();
        sender.publish(reported, collector.finish());
    }
    Ok(())
}

/// Pick the one result a stream reports.
///
/// A failed download is the root cause of anything downstream; after that,
/// playback problems outrank what the feeder saw, since a dead sink makes
/// the feeder fail too.
fn settle(
    fed: Result<StreamSummary>,
    downloaded: Result<()>,
    played: Option<PlaybackOutcome>,
) -> Result<StreamSummary> {
    downloaded?;
    match played {
        Some(PlaybackOutcome::Underrun) => Err(VoxError::RealtimeUnderrun),
        Some(PlaybackOutcome::Failed(message)) => Err(VoxError::AudioOutput { message }),
        Some(PlaybackOutcome::Aborted) => Err(VoxError::Cancelled),
        Some(PlaybackOutcome::Completed) | None => fed,
    }
}

fn join(handle: JoinHandle<Result<()>>) -> Result<()> {
    handle
        .join()
        .unwrap_or_else(|_| Err(VoxError::Other("worker thread panicked".to_string())))
}
