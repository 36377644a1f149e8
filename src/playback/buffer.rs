//! Bounded block queue between the feeder and the real-time sink.

use crate::config::StreamConfig;
use crate::error::{Result, VoxError};
use crate::stream::Block;
use crossbeam_channel::{
    Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, bounded,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Create a queue holding `config.buffer_depth` blocks.
pub fn playback_queue(config: &StreamConfig) -> (BlockSender, BlockReceiver) {
    let (tx, rx) = bounded(config.buffer_depth.max(1));
    let (primed_tx, primed_rx) = bounded(1);
    (
        BlockSender {
            tx,
            primed: Some(primed_tx),
            config: *config,
        },
        BlockReceiver {
            rx,
            primed: primed_rx,
        },
    )
}

/// Feeder half. Dropping it tells the sink the stream is finished.
#[derive(Debug)]
pub struct BlockSender {
    tx: Sender<Block>,
    primed: Option<Sender<()>>,
    config: StreamConfig,
}

impl BlockSender {
    /// Queue a block, waiting for room.
    ///
    /// Each wait lasts one full queue of audio. After `put_retry_limit`
    /// consecutive timeouts the stream is declared stalled.
    pub fn put(&mut self, block: Block, cancel: &AtomicBool) -> Result<()> {
        let timeout = self.config.put_timeout(block.sample_rate);
        let limit = self.config.put_retry_limit.max(1);
        let mut block = block;
        let mut timeouts = 0u32;

        loop {
            match self.tx.send_timeout(block, timeout) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(returned)) => {
                    timeouts += 1;
                    if cancel.load(Ordering::Relaxed) {
                        return Err(VoxError::Cancelled);
                    }
                    if timeouts >= limit {
                        let waited = timeout * timeouts;
                        tracing::error!(waited_ms = waited.as_millis() as u64, "playback queue stalled");
                        return Err(VoxError::PlaybackStalled {
                            waited_ms: waited.as_millis() as u64,
                        });
                    }
                    tracing::warn!(attempt = timeouts, "playback queue full, retrying");
                    block = returned;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(VoxError::AudioOutput {
                        message: "playback ended before the stream finished".to_string(),
                    });
                }
            }
        }

        if self.tx.is_full() {
            self.signal_primed();
        }
        Ok(())
    }

    /// Blocks currently queued.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    fn signal_primed(&mut self) {
        if let Some(primed) = self.primed.take() {
            tracing::debug!(blocks = self.tx.len(), "playback queue primed");
            // Capacity one and sent once, so this cannot fail.
            primed.try_send(()).ok();
        }
    }
}

impl Drop for BlockSender {
    fn drop(&mut self) {
        // A stream shorter than the queue still has to start playing.
        self.signal_primed();
    }
}

/// Outcome of a non-blocking pop.
#[derive(Debug, Clone, PartialEq)]
pub enum Pop {
    Block(Block),
    /// Nothing queued but the feeder is still running.
    Empty,
    /// Nothing queued and the feeder is gone.
    Finished,
}

/// Sink half.
#[derive(Debug)]
pub struct BlockReceiver {
    rx: Receiver<Block>,
    primed: Receiver<()>,
}

impl BlockReceiver {
    /// Wait until the queue first filled or the feeder finished.
    pub fn wait_primed(&self, timeout: Duration) -> bool {
        match self.primed.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    /// Never blocks.
    pub fn try_pop(&self) -> Pop {
        match self.rx.try_recv() {
            Ok(block) => Pop::Block(block),
            Err(TryRecvError::Empty) => Pop::Empty,
            Err(TryRecvError::Disconnected) => Pop::Finished,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.rx.capacity().unwrap_or(0)
    }
}
