//! Moves decoded blocks from the decoder into the playback queue.

use super::buffer::BlockSender;
use crate::defaults;
use crate::error::{Result, VoxError};
use crate::stream::{Block, BlockPoll, IncrementalDecoder};
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Hook applied to every block before it is queued, e.g. gain or a visualiser tap.
pub trait BlockProcessor: Send {
    fn process(&mut self, block: &mut Block);
}

impl<F> BlockProcessor for F
where
    F: FnMut(&mut Block) + Send,
{
    fn process(&mut self, block: &mut Block) {
        self(block)
    }
}

/// Totals for a finished stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub blocks: u64,
    /// Sample frames delivered, final partial block included.
    pub frames: u64,
    pub sample_rate: u32,
    pub channels: u16,
    /// Header parse attempts that failed for lack of data.
    pub header_retries: u32,
    /// Times the container reader was reopened after running dry mid-packet.
    pub reopens: u32,
}

impl StreamSummary {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames as f64 / self.sample_rate as f64)
    }
}

/// Drives an [`IncrementalDecoder`] to the end of its stream.
pub struct Feeder {
    decoder: IncrementalDecoder,
    cancel: Arc<AtomicBool>,
    tap: Option<Sender<Block>>,
    processor: Option<Box<dyn BlockProcessor>>,
}

impl std::fmt::Debug for Feeder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feeder")
            .field("decoder", &self.decoder)
            .field("tap", &self.tap.is_some())
            .field("processor", &self.processor.is_some())
            .finish()
    }
}

impl Feeder {
    pub fn new(decoder: IncrementalDecoder, cancel: Arc<AtomicBool>) -> Self {
        Self {
            decoder,
            cancel,
            tap: None,
            processor: None,
        }
    }

    /// Also send every block to `tap`. A receiver that went away is ignored.
    pub fn with_tap(mut self, tap: Sender<Block>) -> Self {
        self.tap = Some(tap);
        self
    }

    pub fn with_processor(mut self, processor: Box<dyn BlockProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    fn send_tap(&mut self, block: Block) {
        if let Some(tap) = &self.tap
            && tap.send(block).is_err()
        {
            tracing::debug!("block receiver dropped, no longer tapping");
            self.tap = None;
        }
    }

    /// Decode until the stream ends, pushing blocks into `queue` if given.
    ///
    /// The queue sender is dropped on return, which is how the sink learns
    /// the stream is over.
    pub fn run(mut self, mut queue: Option<BlockSender>) -> Result<StreamSummary> {
        let poll = Duration::from_millis(defaults::READY_POLL_MS);
        let mut summary = StreamSummary::default();

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                tracing::debug!(blocks = summary.blocks, "feeder cancelled");
                return Err(VoxError::Cancelled);
            }

            match self.decoder.poll_block()? {
                BlockPoll::Block(mut block) => {
                    if let Some(processor) = self.processor.as_mut() {
                        processor.process(&mut block);
                    }
                    summary.blocks += 1;
                    summary.frames += block.frames() as u64;

                    match queue.as_mut() {
                        Some(queue) => {
                            if self.tap.is_some() {
                                self.send_tap(block.clone());
                            }
                            queue.put(block, &self.cancel)?;
                        }
                        None => self.send_tap(block),
                    }
                }
                BlockPoll::Pending => {
                    self.decoder.wait_ready(poll);
                }
                BlockPoll::Finished => break,
            }
        }

        summary.sample_rate = self.decoder.sample_rate();
        summary.channels = self.decoder.channels();
        summary.header_retries = self.decoder.header_retries();
        summary.reopens = self.decoder.reopens();
        tracing::debug!(
            blocks = summary.blocks,
            frames = summary.frames,
            header_retries = summary.header_retries,
            reopens = summary.reopens,
            "stream fully decoded"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::playback::buffer::{Pop, playback_queue};
    use crate::stream::{RawEncoding, StreamBuffer};
    use std::thread;

    fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn config() -> StreamConfig {
        StreamConfig {
            block_size: 4,
            buffer_depth: 16,
            ..StreamConfig::default()
        }
    }

    fn pcm_feeder(buffer: &StreamBuffer, cancel: Arc<AtomicBool>) -> Feeder {
        let decoder = IncrementalDecoder::raw(buffer.clone(), RawEncoding::Pcm16, 8000, &config());
        Feeder::new(decoder, cancel)
    }

    #[test]
    fn test_feeds_queue_and_tap_in_order() {
        let buffer = StreamBuffer::new();
        buffer.append(&pcm_bytes(&[16384; 10]));
        buffer.finish();

        let (queue_tx, queue_rx) = playback_queue(&config());
        let (tap_tx, tap_rx) = crossbeam_channel::unbounded();
        let summary = pcm_feeder(&buffer, Arc::new(AtomicBool::new(false)))
            .with_tap(tap_tx)
            .run(Some(queue_tx))
            .unwrap();

        assert_eq!(summary.blocks, 3);
        assert_eq!(summary.frames, 10);
        assert_eq!(summary.sample_rate, 8000);
        assert_eq!(summary.channels, 1);

        let tapped: Vec<u64> = tap_rx.iter().map(|b| b.index).collect();
        assert_eq!(tapped, vec![0, 1, 2]);

        let mut queued = Vec::new();
        while let Pop::Block(block) = queue_rx.try_pop() {
            queued.push((block.index, block.frames(), block.is_final));
        }
        assert_eq!(queued, vec![(0, 4, false), (1, 4, false), (2, 2, true)]);
        assert_eq!(queue_rx.try_pop(), Pop::Finished);
    }

    #[test]
    fn test_processor_sees_every_block() {
        let buffer = StreamBuffer::new();
        buffer.append(&pcm_bytes(&[16384; 8]));
        buffer.finish();

        let (tap_tx, tap_rx) = crossbeam_channel::unbounded();
        pcm_feeder(&buffer, Arc::new(AtomicBool::new(false)))
            .with_tap(tap_tx)
            .with_processor(Box::new(|block: &mut Block| {
                block.samples.iter_mut().for_each(|s| *s *= 0.5);
            }))
            .run(None)
            .unwrap();

        for block in tap_rx.iter() {
            assert!(block.samples.iter().all(|&s| s == 0.25));
        }
    }

    #[test]
    fn test_waits_for_producer() {
        let buffer = StreamBuffer::new();
        let producer = buffer.clone();
        let handle = thread::spawn(move || {
            for _ in 0..3 {
                thread::sleep(Duration::from_millis(5));
                producer.append(&pcm_bytes(&[1000; 4]));
            }
            producer.finish();
        });

        let summary = pcm_feeder(&buffer, Arc::new(AtomicBool::new(false)))
            .run(None)
            .unwrap();
        handle.join().unwrap();
        assert_eq!(summary.frames, 12);
        assert_eq!(summary.blocks, 3);
    }

    #[test]
    fn test_cancel_stops_feeder() {
        let buffer = StreamBuffer::new();
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            flag.store(true, Ordering::Relaxed);
        });

        let result = pcm_feeder(&buffer, cancel).run(None);
        handle.join().unwrap();
        assert!(matches!(result, Err(VoxError::Cancelled)));
    }

    #[test]
    fn test_failed_download_surfaces_as_error() {
        let buffer = StreamBuffer::new();
        buffer.append(&pcm_bytes(&[1; 4]));
        buffer.fail("connection reset");

        let result = pcm_feeder(&buffer, Arc::new(AtomicBool::new(false))).run(None);
        assert!(matches!(result, Err(VoxError::NetworkFailure { .. })));
    }

    #[test]
    fn test_summary_duration() {
        let summary = StreamSummary {
            frames: 16000,
            sample_rate: 8000,
            ..StreamSummary::default()
        };
        assert_eq!(summary.duration(), Duration::from_secs(2));
        assert_eq!(StreamSummary::default().duration(), Duration::ZERO);
    }
}
