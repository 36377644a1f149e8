//! Real-time playback of decoded blocks.
//!
//! A feeder thread pushes blocks into a bounded queue; a playback thread
//! waits for the queue to prime, then hands a [`PlaybackSink`] to an
//! [`AudioOutput`] that pulls from it at the device's cadence.

pub mod buffer;
pub mod control;
pub mod feeder;
pub mod output;
pub mod sink;

pub use buffer::{BlockReceiver, BlockSender, Pop, playback_queue};
pub use control::{PlaybackControl, PlaybackOutcome};
pub use feeder::{BlockProcessor, Feeder, StreamSummary};
#[cfg(feature = "cpal-audio")]
pub use output::CpalOutput;
pub use output::{AudioOutput, MockOutput, list_output_devices};
pub use sink::{PlaybackSink, SinkStatus};

use crate::defaults;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Callback run on the playback thread.
pub type PlaybackHook = Box<dyn FnOnce() + Send>;

/// How a streamed generation should be played.
#[derive(Default)]
pub struct PlaybackOptions {
    /// Return from `begin_generation` right away instead of after playback.
    pub run_in_background: bool,
    /// Output device by name; the system default when `None`.
    pub device: Option<String>,
    /// Runs once the queue is primed, just before the first sample plays.
    pub on_start: Option<PlaybackHook>,
    /// Runs after playback ended, whatever the outcome.
    pub on_end: Option<PlaybackHook>,
    /// Applied to each block before it is queued.
    pub processor: Option<Box<dyn BlockProcessor>>,
    /// Replaces the audio device, e.g. with a [`MockOutput`].
    pub output: Option<Box<dyn AudioOutput>>,
}

impl std::fmt::Debug for PlaybackOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackOptions")
            .field("run_in_background", &self.run_in_background)
            .field("device", &self.device)
            .field("on_start", &self.on_start.is_some())
            .field("on_end", &self.on_end.is_some())
            .field("processor", &self.processor.is_some())
            .field("output", &self.output.is_some())
            .finish()
    }
}

impl PlaybackOptions {
    pub fn foreground() -> Self {
        Self::default()
    }

    pub fn background() -> Self {
        Self {
            run_in_background: true,
            ..Self::default()
        }
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn on_start(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_start = Some(Box::new(hook));
        self
    }

    pub fn on_end(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_end = Some(Box::new(hook));
        self
    }

    pub fn with_processor(mut self, processor: impl BlockProcessor + 'static) -> Self {
        self.processor = Some(Box::new(processor));
        self
    }

    pub fn with_output(mut self, output: impl AudioOutput + 'static) -> Self {
        self.output = Some(Box::new(output));
        self
    }

    /// The configured output, or the named/default device.
    pub(crate) fn take_output(&mut self, block_size: usize) -> crate::error::Result<Box<dyn AudioOutput>> {
        match self.output.take() {
            Some(output) => Ok(output),
            None => default_output(self.device.as_deref(), block_size),
        }
    }
}

#[cfg(feature = "cpal-audio")]
fn default_output(device: Option<&str>, block_size: usize) -> crate::error::Result<Box<dyn AudioOutput>> {
    Ok(Box::new(CpalOutput::new(device, block_size)))
}

#[cfg(not(feature = "cpal-audio"))]
fn default_output(_device: Option<&str>, _block_size: usize) -> crate::error::Result<Box<dyn AudioOutput>> {
    Err(crate::error::VoxError::AudioOutput {
        message: "built without the cpal-audio feature".to_string(),
    })
}

/// Start the playback thread.
///
/// The thread waits until `queue` is primed (or `control` is aborted), then
/// plays through `output` and records the outcome on `control`.
pub fn spawn_player(
    queue: BlockReceiver,
    mut output: Box<dyn AudioOutput>,
    on_start: Option<PlaybackHook>,
    on_end: Option<PlaybackHook>,
    control: PlaybackControl,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let poll = Duration::from_millis(defaults::READY_POLL_MS);
        while !queue.wait_primed(poll) {
            if control.is_aborted() {
                if let Some(hook) = on_end {
                    hook();
                }
                control.mark_finished(PlaybackOutcome::Aborted);
                return;
            }
        }
        tracing::debug!(queued = queue.len(), "playback starting");

        if let Some(hook) = on_start {
            hook();
        }
        let outcome = match output.play(PlaybackSink::new(queue), &control) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, "playback failed");
                PlaybackOutcome::Failed(e.to_string())
            }
        };
        if let Some(hook) = on_end {
            hook();
        }
        control.mark_finished(outcome);
    })
}
