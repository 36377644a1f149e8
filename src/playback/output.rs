//! Audio output devices.
//!
//! An [`AudioOutput`] drives a [`PlaybackSink`] at the device's cadence until
//! the sink reports the end of the stream, an underrun, or the caller aborts.

use super::control::{PlaybackControl, PlaybackOutcome};
use super::sink::{PlaybackSink, SinkStatus};
use crate::error::Result;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// Something that plays sink output in real time.
pub trait AudioOutput: Send {
    /// Play until the sink stops or `control` is aborted.
    fn play(&mut self, sink: PlaybackSink, control: &PlaybackControl) -> Result<PlaybackOutcome>;
}

/// Records everything the sink produces, one callback at a time.
///
/// Useful for tests and for rendering a stream without a sound card.
#[derive(Debug, Clone)]
pub struct MockOutput {
    frames_per_callback: usize,
    pace: Duration,
    captured: Arc<Mutex<Vec<f32>>>,
    callbacks: Arc<Mutex<usize>>,
}

impl MockOutput {
    /// Each callback asks for `frames_per_callback` frames and returns at once.
    pub fn new(frames_per_callback: usize) -> Self {
        Self {
            frames_per_callback: frames_per_callback.max(1),
            pace: Duration::ZERO,
            captured: Arc::new(Mutex::new(Vec::new())),
            callbacks: Arc::new(Mutex::new(0)),
        }
    }

    /// Sleep between callbacks, like a device running at a fixed rate.
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    /// All samples written so far, silence padding included.
    pub fn captured(&self) -> Vec<f32> {
        self.captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn callbacks(&self) -> usize {
        *self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AudioOutput for MockOutput {
    fn play(&mut self, mut sink: PlaybackSink, control: &PlaybackControl) -> Result<PlaybackOutcome> {
        let Some((channels, _)) = sink.prepare() else {
            return Ok(PlaybackOutcome::Completed);
        };
        let mut buffer = vec![0.0f32; self.frames_per_callback * channels.max(1) as usize];

        loop {
            if control.is_aborted() {
                return Ok(PlaybackOutcome::Aborted);
            }
            let status = sink.fill(&mut buffer);
            self.captured
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(&buffer);
            *self.callbacks.lock().unwrap_or_else(PoisonError::into_inner) += 1;

            match status {
                SinkStatus::Continue => {
                    if !self.pace.is_zero() {
                        thread::sleep(self.pace);
                    }
                }
                SinkStatus::Stop => return Ok(PlaybackOutcome::Completed),
                SinkStatus::Abort => return Ok(PlaybackOutcome::Underrun),
            }
        }
    }
}

#[cfg(feature = "cpal-audio")]
pub use device::{CpalOutput, list_output_devices};

#[cfg(not(feature = "cpal-audio"))]
pub fn list_output_devices() -> Result<Vec<String>> {
    Err(crate::error::VoxError::AudioOutput {
        message: "built without the cpal-audio feature".to_string(),
    })
}

#[cfg(feature = "cpal-audio")]
mod device {
    use super::*;
    use crate::defaults;
    use crate::error::VoxError;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use crossbeam_channel::{RecvTimeoutError, Sender, bounded};

    /// Run a closure with stderr pointed at /dev/null.
    ///
    /// Backend probing in cpal prints ALSA/JACK noise that is harmless.
    ///
    /// # Safety
    /// Saves and restores fd 2 with `dup`/`dup2`. Only sound while no other
    /// thread is redirecting stderr at the same time.
    fn with_suppressed_stderr<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        unsafe {
            let saved_fd = libc::dup(2);
            let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
            if saved_fd >= 0 && devnull >= 0 {
                libc::dup2(devnull, 2);
                libc::close(devnull);
            }

            let result = f();

            if saved_fd >= 0 {
                libc::dup2(saved_fd, 2);
                libc::close(saved_fd);
            }
            result
        }
    }

    /// Names of the available output devices.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let devices = with_suppressed_stderr(|| cpal::default_host().output_devices());
        let devices = devices.map_err(|e| VoxError::AudioOutput {
            message: format!("Failed to enumerate output devices: {}", e),
        })?;
        Ok(devices.filter_map(|device| device.name().ok()).collect())
    }

    fn open_device(name: Option<&str>) -> Result<cpal::Device> {
        with_suppressed_stderr(|| {
            let host = cpal::default_host();
            match name {
                Some(name) => {
                    let devices = host.output_devices().map_err(|e| VoxError::AudioOutput {
                        message: format!("Failed to enumerate output devices: {}", e),
                    })?;
                    for device in devices {
                        if let Ok(device_name) = device.name()
                            && device_name == name
                        {
                            return Ok(device);
                        }
                    }
                    Err(VoxError::AudioDeviceNotFound {
                        device: name.to_string(),
                    })
                }
                None => host
                    .default_output_device()
                    .ok_or_else(|| VoxError::AudioDeviceNotFound {
                        device: "default".to_string(),
                    }),
            }
        })
    }

    /// Spent blocks the callback can hand back between two drains.
    const SPENT_BLOCKS: usize = 64;

    enum DeviceEvent {
        Status(SinkStatus),
        Error(String),
        Aborted,
    }

    /// Plays through a cpal output stream.
    ///
    /// The stream is opened at the channel count and sample rate of the first
    /// block, with a device buffer of one block where the backend allows it.
    #[derive(Debug, Clone)]
    pub struct CpalOutput {
        device: Option<String>,
        block_size: usize,
    }

    impl CpalOutput {
        pub fn new(device: Option<&str>, block_size: usize) -> Self {
            Self {
                device: device.map(str::to_string),
                block_size: block_size.max(1),
            }
        }

        fn build_stream(
            device: &cpal::Device,
            config: &cpal::StreamConfig,
            sink: &Arc<Mutex<PlaybackSink>>,
            events: &Sender<DeviceEvent>,
        ) -> std::result::Result<cpal::Stream, cpal::BuildStreamError> {
            let sink = Arc::clone(sink);
            let status_tx = events.clone();
            let error_tx = events.clone();
            device.build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    // Uncontended: only this callback touches the sink once playing.
                    let status = match sink.try_lock() {
                        Ok(mut sink) => sink.fill(data),
                        Err(_) => {
                            data.fill(0.0);
                            SinkStatus::Continue
                        }
                    };
                    // A full channel means the control loop already has a terminal status.
                    if status != SinkStatus::Continue {
                        status_tx.try_send(DeviceEvent::Status(status)).ok();
                    }
                },
                move |err| {
                    tracing::warn!(error = %err, "audio output stream error");
                    error_tx.try_send(DeviceEvent::Error(err.to_string())).ok();
                },
                None,
            )
        }
    }

    impl AudioOutput for CpalOutput {
        fn play(
            &mut self,
            mut sink: PlaybackSink,
            control: &PlaybackControl,
        ) -> Result<PlaybackOutcome> {
            let Some((channels, sample_rate)) = sink.prepare() else {
                return Ok(PlaybackOutcome::Completed);
            };
            let device = open_device(self.device.as_deref())?;
            let (spent_tx, spent_rx) = bounded(SPENT_BLOCKS);
            sink.return_spent(spent_tx);
            let sink = Arc::new(Mutex::new(sink));
            let (events_tx, events_rx) = bounded(4);

            let mut config = cpal::StreamConfig {
                channels,
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Fixed(self.block_size as u32),
            };
            let stream = match Self::build_stream(&device, &config, &sink, &events_tx) {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(error = %e, "fixed buffer size rejected, using device default");
                    config.buffer_size = cpal::BufferSize::Default;
                    Self::build_stream(&device, &config, &sink, &events_tx).map_err(|e| {
                        VoxError::AudioOutput {
                            message: format!(
                                "Failed to open {}ch/{}Hz output stream: {}",
                                channels, sample_rate, e
                            ),
                        }
                    })?
                }
            };
            stream.play().map_err(|e| VoxError::AudioOutput {
                message: format!("Failed to start output stream: {}", e),
            })?;

            let block_duration =
                Duration::from_secs_f64(self.block_size as f64 / sample_rate.max(1) as f64);
            let poll = Duration::from_millis(defaults::READY_POLL_MS);

            let abort_tx = events_tx.clone();
            control.on_abort(move || {
                abort_tx.try_send(DeviceEvent::Aborted).ok();
            });

            let outcome = loop {
                // Freed here rather than on the audio thread.
                spent_rx.try_iter().for_each(drop);
                if control.is_aborted() {
                    break Ok(PlaybackOutcome::Aborted);
                }
                match events_rx.recv_timeout(poll) {
                    Ok(DeviceEvent::Aborted) => break Ok(PlaybackOutcome::Aborted),
                    Ok(DeviceEvent::Status(SinkStatus::Stop)) => {
                        // Let the device drain the last buffer it was handed.
                        thread::sleep(block_duration);
                        break Ok(PlaybackOutcome::Completed);
                    }
                    Ok(DeviceEvent::Status(SinkStatus::Abort)) => {
                        break Ok(PlaybackOutcome::Underrun);
                    }
                    Ok(DeviceEvent::Status(SinkStatus::Continue))
                    | Err(RecvTimeoutError::Timeout) => {}
                    Ok(DeviceEvent::Error(message)) => {
                        break Err(VoxError::AudioOutput { message });
                    }
                    Err(RecvTimeoutError::Disconnected) => break Ok(PlaybackOutcome::Completed),
                }
            };

            if let Err(e) = stream.pause() {
                tracing::debug!(error = %e, "failed to pause output stream");
            }
            drop(stream);
            outcome
        }
    }

}
