//! The real-time consumer.
//!
//! [`PlaybackSink::fill`] runs inside the audio callback: it never blocks,
//! never allocates after the first block, and reports an empty queue while
//! the stream is still running as an underrun rather than waiting. Spent
//! blocks can be handed back through [`PlaybackSink::return_spent`] so their
//! buffers are freed off the audio thread.

use super::buffer::{BlockReceiver, Pop};
use crate::stream::Block;
use crossbeam_channel::Sender;

/// What the audio subsystem should do after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStatus {
    Continue,
    /// The stream ended; this buffer is the last one.
    Stop,
    /// The queue ran dry mid-stream.
    Abort,
}

/// Copies queued blocks into device buffers.
#[derive(Debug)]
pub struct PlaybackSink {
    queue: BlockReceiver,
    current: Option<Block>,
    offset: usize,
    terminal: Option<SinkStatus>,
    samples_played: u64,
    spent: Option<Sender<Block>>,
}

impl PlaybackSink {
    pub fn new(queue: BlockReceiver) -> Self {
        Self {
            queue,
            current: None,
            offset: 0,
            terminal: None,
            samples_played: 0,
            spent: None,
        }
    }

    /// Send fully played blocks to `spent` instead of dropping them.
    ///
    /// The callback never waits on it: a block that does not fit in a
    /// bounded channel is dropped in place.
    pub fn return_spent(&mut self, spent: Sender<Block>) {
        self.spent = Some(spent);
    }

    /// Pull the first block so its channel count and rate are known before
    /// the output stream is opened. `None` if the stream produced no audio.
    pub fn prepare(&mut self) -> Option<(u16, u32)> {
        if self.current.is_none()
            && let Pop::Block(block) = self.queue.try_pop()
        {
            self.current = Some(block);
            self.offset = 0;
        }
        self.current
            .as_ref()
            .map(|block| (block.channels, block.sample_rate))
    }

    /// Interleaved samples written so far, silence padding excluded.
    pub fn samples_played(&self) -> u64 {
        self.samples_played
    }

    /// Fill `out` with the next samples. Never blocks.
    ///
    /// Whatever cannot be filled is set to silence. Once `Stop` or `Abort`
    /// is returned, every later call returns it again with silence.
    pub fn fill(&mut self, out: &mut [f32]) -> SinkStatus {
        if let Some(status) = self.terminal {
            out.fill(0.0);
            return status;
        }

        let mut written = 0;
        while written < out.len() {
            if self.current.is_none() {
                match self.queue.try_pop() {
                    Pop::Block(block) => {
                        self.current = Some(block);
                        self.offset = 0;
                    }
                    Pop::Empty => return self.end(out, written, SinkStatus::Abort),
                    Pop::Finished => return self.end(out, written, SinkStatus::Stop),
                }
            }

            let Some(block) = self.current.as_ref() else {
                continue;
            };
            let available = &block.samples[self.offset..];
            let n = available.len().min(out.len() - written);
            out[written..written + n].copy_from_slice(&available[..n]);
            written += n;
            self.offset += n;
            self.samples_played += n as u64;

            if self.offset >= block.samples.len() {
                let is_final = block.is_final;
                self.offset = 0;
                if let Some(block) = self.current.take() {
                    self.release(block);
                }
                if is_final {
                    return self.end(out, written, SinkStatus::Stop);
                }
            }
        }
        SinkStatus::Continue
    }

    fn release(&self, block: Block) {
        if let Some(spent) = &self.spent {
            spent.try_send(block).ok();
        }
    }

    fn end(&mut self, out: &mut [f32], written: usize, status: SinkStatus) -> SinkStatus {
        out[written..].fill(0.0);
        if status == SinkStatus::Abort {
            tracing::error!(
                played = self.samples_played,
                "playback queue empty while the stream is still active"
            );
        } else {
            tracing::debug!(played = self.samples_played, "playback reached end of stream");
        }
        self.terminal = Some(status);
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::playback::buffer::playback_queue;
    use std::sync::atomic::AtomicBool;

    fn block(samples: Vec<f32>, index: u64, is_final: bool) -> Block {
        Block {
            samples,
            channels: 1,
            sample_rate: 8000,
            index,
            is_final,
        }
    }

    fn queue_of(blocks: Vec<Block>, close: bool) -> (Option<crate::playback::BlockSender>, PlaybackSink) {
        let config = StreamConfig {
            buffer_depth: 16,
            ..StreamConfig::default()
        };
        let (mut tx, rx) = playback_queue(&config);
        let cancel = AtomicBool::new(false);
        for b in blocks {
            tx.put(b, &cancel).unwrap();
        }
        let tx = if close {
            drop(tx);
            None
        } else {
            Some(tx)
        };
        (tx, PlaybackSink::new(rx))
    }

    #[test]
    fn test_full_blocks_are_copied_verbatim() {
        let (_tx, mut sink) = queue_of(
            vec![
                block(vec![0.1, 0.2, 0.3, 0.4], 0, false),
                block(vec![0.5, 0.6, 0.7, 0.8], 1, false),
            ],
            false,
        );

        let mut out = [9.0f32; 4];
        assert_eq!(sink.fill(&mut out), SinkStatus::Continue);
        assert_eq!(out, [0.1, 0.2, 0.3, 0.4]);
        assert_eq!(sink.fill(&mut out), SinkStatus::Continue);
        assert_eq!(out, [0.5, 0.6, 0.7, 0.8]);
    }

    #[test]
    fn test_short_final_block_is_padded_and_stops() {
        let (_tx, mut sink) = queue_of(
            vec![
                block(vec![0.5; 4], 0, false),
                block(vec![0.25, 0.75], 1, true),
            ],
            true,
        );

        let mut out = [9.0f32; 4];
        assert_eq!(sink.fill(&mut out), SinkStatus::Continue);
        assert_eq!(sink.fill(&mut out), SinkStatus::Stop);
        assert_eq!(out, [0.25, 0.75, 0.0, 0.0]);
        assert_eq!(sink.samples_played(), 6);

        assert_eq!(sink.fill(&mut out), SinkStatus::Stop);
        assert_eq!(out, [0.0; 4]);
    }

    #[test]
    fn test_empty_queue_while_active_aborts() {
        let (_tx, mut sink) = queue_of(vec![block(vec![0.5; 4], 0, false)], false);

        let mut out = [9.0f32; 4];
        assert_eq!(sink.fill(&mut out), SinkStatus::Continue);
        assert_eq!(sink.fill(&mut out), SinkStatus::Abort);
        assert_eq!(out, [0.0; 4]);
        // Stays aborted even though the feeder is alive.
        assert_eq!(sink.fill(&mut out), SinkStatus::Abort);
    }

    #[test]
    fn test_finished_queue_stops_with_silence() {
        let (_tx, mut sink) = queue_of(vec![block(vec![0.5; 4], 0, false)], true);
        let mut out = [9.0f32; 4];
        assert_eq!(sink.fill(&mut out), SinkStatus::Continue);
        assert_eq!(sink.fill(&mut out), SinkStatus::Stop);
        assert_eq!(out, [0.0; 4]);
    }

    #[test]
    fn test_callback_shorter_than_block_carries_remainder() {
        let (_tx, mut sink) = queue_of(
            vec![
                block(vec![1.0, 2.0, 3.0, 4.0], 0, false),
                block(vec![5.0, 6.0], 1, true),
            ],
            true,
        );

        let mut out = [0.0f32; 3];
        assert_eq!(sink.fill(&mut out), SinkStatus::Continue);
        assert_eq!(out, [1.0, 2.0, 3.0]);
        assert_eq!(sink.fill(&mut out), SinkStatus::Continue);
        assert_eq!(out, [4.0, 5.0, 6.0]);
        assert_eq!(sink.fill(&mut out), SinkStatus::Stop);
    }

    #[test]
    fn test_callback_longer_than_block_spans_blocks() {
        let (_tx, mut sink) = queue_of(
            vec![block(vec![1.0, 2.0], 0, false), block(vec![3.0, 4.0], 1, false)],
            false,
        );
        let mut out = [0.0f32; 4];
        assert_eq!(sink.fill(&mut out), SinkStatus::Continue);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_prepare_reports_format_without_losing_samples() {
        let (_tx, mut sink) = queue_of(vec![block(vec![0.5; 4], 0, true)], true);
        assert_eq!(sink.prepare(), Some((1, 8000)));

        let mut out = [0.0f32; 4];
        assert_eq!(sink.fill(&mut out), SinkStatus::Stop);
        assert_eq!(out, [0.5; 4]);
    }

    #[test]
    fn test_prepare_on_empty_stream() {
        let (_tx, mut sink) = queue_of(Vec::new(), true);
        assert_eq!(sink.prepare(), None);
    }

    #[test]
    fn test_spent_blocks_are_handed_back() {
        let (_tx, mut sink) = queue_of(
            vec![
                block(vec![1.0, 2.0], 0, false),
                block(vec![3.0, 4.0, 5.0], 1, false),
                block(vec![6.0], 2, true),
            ],
            true,
        );
        let (spent_tx, spent_rx) = crossbeam_channel::bounded(4);
        sink.return_spent(spent_tx);

        let mut out = [0.0f32; 4];
        assert_eq!(sink.fill(&mut out), SinkStatus::Continue);
        // The second block is only half played.
        let spent: Vec<u64> = spent_rx.try_iter().map(|b| b.index).collect();
        assert_eq!(spent, vec![0]);

        assert_eq!(sink.fill(&mut out), SinkStatus::Stop);
        let spent: Vec<u64> = spent_rx.try_iter().map(|b| b.index).collect();
        assert_eq!(spent, vec![1, 2]);
    }

    #[test]
    fn test_full_return_channel_does_not_block() {
        let (_tx, mut sink) = queue_of(
            vec![block(vec![1.0], 0, false), block(vec![2.0], 1, false)],
            true,
        );
        let (spent_tx, spent_rx) = crossbeam_channel::bounded(1);
        sink.return_spent(spent_tx);

        let mut out = [0.0f32; 2];
        assert_eq!(sink.fill(&mut out), SinkStatus::Continue);
        assert_eq!(out, [1.0, 2.0]);
        assert_eq!(spent_rx.try_iter().count(), 1);
    }
}
