//! Word and character timing for generated speech.
//!
//! Alignment metadata arrives inside the response body in one of two JSON
//! shapes (seconds-based or millisecond-based). Each message's times are
//! relative to its own audio segment, so the collector offsets every segment
//! by where the previous one ended. The finished batch is published once,
//! after the body completes, on a channel read independently of the audio.

use crate::error::{Result, VoxError};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Unit of a transcript event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    #[default]
    Character,
    Word,
}

/// One timed unit of the spoken text.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    pub text: String,
    pub kind: UnitKind,
    pub start_ms: f64,
    pub end_ms: f64,
    /// Start position in sample frames.
    pub audio_frame: u64,
}

/// One aligned character, times relative to its segment.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedChar {
    pub text: String,
    pub start_ms: f64,
    pub end_ms: f64,
}

/// Alignment for one audio segment.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Alignment {
    pub chars: Vec<AlignedChar>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AlignmentWire {
    Seconds {
        characters: Vec<String>,
        character_start_times_seconds: Vec<f64>,
        character_end_times_seconds: Vec<f64>,
    },
    Millis {
        chars: Vec<String>,
        #[serde(rename = "charStartTimesMs")]
        char_start_times_ms: Vec<f64>,
        #[serde(rename = "charDurationsMs")]
        char_durations_ms: Vec<f64>,
    },
}

impl Alignment {
    /// Parse either alignment shape.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let wire: AlignmentWire = serde_json::from_value(value)?;
        let (characters, starts, ends): (Vec<String>, Vec<f64>, Vec<f64>) = match wire {
            AlignmentWire::Seconds {
                characters,
                character_start_times_seconds,
                character_end_times_seconds,
            } => (
                characters,
                character_start_times_seconds
                    .iter()
                    .map(|s| s * 1000.0)
                    .collect(),
                character_end_times_seconds
                    .iter()
                    .map(|s| s * 1000.0)
                    .collect(),
            ),
            AlignmentWire::Millis {
                chars,
                char_start_times_ms,
                char_durations_ms,
            } => {
                let ends = char_start_times_ms
                    .iter()
                    .zip(&char_durations_ms)
                    .map(|(start, duration)| start + duration)
                    .collect();
                if char_durations_ms.len() != char_start_times_ms.len() {
                    return Err(mismatched_lengths());
                }
                (chars, char_start_times_ms, ends)
            }
        };

        if characters.len() != starts.len() || characters.len() != ends.len() {
            return Err(mismatched_lengths());
        }

        Ok(Self {
            chars: characters
                .into_iter()
                .zip(starts)
                .zip(ends)
                .map(|((text, start_ms), end_ms)| AlignedChar {
                    text,
                    start_ms,
                    end_ms,
                })
                .collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }
}

fn mismatched_lengths() -> VoxError {
    VoxError::MalformedJson(<serde_json::Error as serde::de::Error>::custom(
        "alignment arrays have different lengths",
    ))
}

/// Accumulates segment alignments into absolute, monotonic events.
#[derive(Debug)]
pub struct TranscriptCollector {
    granularity: UnitKind,
    sample_rate: u32,
    offset_ms: f64,
    chars: Vec<AlignedChar>,
    /// Every character's text as announced, before any clamping or merging.
    announced: String,
    announced_chars: usize,
}

impl TranscriptCollector {
    pub fn new(granularity: UnitKind, sample_rate: u32) -> Self {
        Self {
            granularity,
            sample_rate,
            offset_ms: 0.0,
            chars: Vec::new(),
            announced: String::new(),
            announced_chars: 0,
        }
    }

    /// Add one segment. Its times are shifted by the end of the previous segment.
    pub fn push(&mut self, alignment: Alignment) {
        let Some(last) = alignment.chars.last() else {
            return;
        };
        let next_offset = self.offset_ms + last.end_ms;
        self.announced_chars += alignment.len();
        for unit in &alignment.chars {
            self.announced.push_str(&unit.text);
        }

        let mut floor = self.chars.last().map(|c| c.start_ms).unwrap_or(0.0);
        for unit in alignment.chars {
            let start_ms = (unit.start_ms + self.offset_ms).max(floor);
            let end_ms = (unit.end_ms + self.offset_ms).max(start_ms);
            floor = start_ms;
            self.chars.push(AlignedChar {
                text: unit.text,
                start_ms,
                end_ms,
            });
        }
        self.offset_ms = next_offset.max(self.offset_ms);
    }

    /// Characters collected so far.
    pub fn char_count(&self) -> usize {
        self.chars.len()
    }

    /// Units the alignment metadata announces in this collector's granularity:
    /// every aligned character, or the whitespace-separated words they spell.
    pub fn reported_units(&self) -> usize {
        match self.granularity {
            UnitKind::Character => self.announced_chars,
            UnitKind::Word => self.announced.split_whitespace().count(),
        }
    }

    /// Produce the final event list in the configured granularity.
    pub fn finish(self) -> Vec<TranscriptEvent> {
        let rate = self.sample_rate as f64;
        let event = |text: String, kind, start_ms: f64, end_ms: f64| TranscriptEvent {
            text,
            kind,
            start_ms,
            end_ms,
            audio_frame: (start_ms * rate / 1000.0).round().max(0.0) as u64,
        };

        match self.granularity {
            UnitKind::Character => self
                .chars
                .into_iter()
                .map(|c| event(c.text, UnitKind::Character, c.start_ms, c.end_ms))
                .collect(),
            UnitKind::Word => {
                let mut words = Vec::new();
                let mut current: Option<(String, f64, f64)> = None;
                for c in self.chars {
                    if c.text.chars().all(char::is_whitespace) {
                        if let Some((text, start, end)) = current.take() {
                            words.push(event(text, UnitKind::Word, start, end));
                        }
                        continue;
                    }
                    match current.as_mut() {
                        Some((text, _, end)) => {
                            text.push_str(&c.text);
                            *end = end.max(c.end_ms);
                        }
                        None => current = Some((c.text, c.start_ms, c.end_ms)),
                    }
                }
                if let Some((text, start, end)) = current {
                    words.push(event(text, UnitKind::Word, start, end));
                }
                words
            }
        }
    }
}

/// Create the publishing and consuming halves of a transcript channel.
pub fn transcript_channel() -> (TranscriptSender, TranscriptReceiver) {
    let (tx, rx) = unbounded();
    let reported = Arc::new(OnceLock::new());
    (
        TranscriptSender {
            tx,
            reported: Arc::clone(&reported),
        },
        TranscriptReceiver { rx, reported },
    )
}

/// Publishes one generation's events.
#[derive(Debug)]
pub struct TranscriptSender {
    tx: Sender<TranscriptEvent>,
    reported: Arc<OnceLock<usize>>,
}

impl TranscriptSender {
    /// Send the whole batch and close the channel.
    ///
    /// `reported_units` is the count announced by the alignment metadata,
    /// exposed to the receiver alongside the events.
    pub fn publish(self, reported_units: usize, events: Vec<TranscriptEvent>) {
        if self.reported.set(reported_units).is_err() {
            tracing::warn!("transcript already published");
        }
        if reported_units != events.len() {
            tracing::warn!(
                reported = reported_units,
                events = events.len(),
                "transcript does not match the reported units"
            );
        }
        tracing::debug!(events = events.len(), "publishing transcript");
        for event in events {
            if self.tx.send(event).is_err() {
                break;
            }
        }
    }
}

/// FIFO of transcript events, independent of the audio blocks.
///
/// The channel closes after the batch, or without any events if the
/// generation failed.
#[derive(Debug, Clone)]
pub struct TranscriptReceiver {
    rx: Receiver<TranscriptEvent>,
    reported: Arc<OnceLock<usize>>,
}

impl TranscriptReceiver {
    /// Block until the next event. `None` once the channel is closed and drained.
    pub fn recv(&self) -> Option<TranscriptEvent> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<TranscriptEvent, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<TranscriptEvent> {
        self.rx.try_recv().ok()
    }

    /// Blocking iterator until the channel closes.
    pub fn iter(&self) -> impl Iterator<Item = TranscriptEvent> + '_ {
        self.rx.iter()
    }

    /// Units announced by the alignment metadata, once published.
    pub fn reported_units(&self) -> Option<usize> {
        self.reported.get().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seconds_alignment(text: &str, step: f64) -> Alignment {
        let characters: Vec<String> = text.chars().map(String::from).collect();
        let starts: Vec<f64> = (0..characters.len()).map(|i| i as f64 * step).collect();
        let ends: Vec<f64> = starts.iter().map(|s| s + step).collect();
        Alignment::from_value(json!({
            "characters": characters,
            "character_start_times_seconds": starts,
            "character_end_times_seconds": ends,
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_seconds_shape() {
        let alignment = seconds_alignment("hi", 0.1);
        assert_eq!(alignment.len(), 2);
        assert_eq!(alignment.chars[1].text, "i");
        assert!((alignment.chars[1].start_ms - 100.0).abs() < 1e-9);
        assert!((alignment.chars[1].end_ms - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_millis_shape() {
        let alignment = Alignment::from_value(json!({
            "chars": ["o", "k"],
            "charStartTimesMs": [0, 40],
            "charDurationsMs": [40, 60],
        }))
        .unwrap();
        assert_eq!(alignment.chars[1].start_ms, 40.0);
        assert_eq!(alignment.chars[1].end_ms, 100.0);
    }

    #[test]
    fn test_mismatched_lengths_are_malformed() {
        let result = Alignment::from_value(json!({
            "chars": ["a", "b"],
            "charStartTimesMs": [0],
            "charDurationsMs": [10, 10],
        }));
        assert!(matches!(result, Err(VoxError::MalformedJson(_))));
    }

    #[test]
    fn test_unknown_shape_is_malformed() {
        let result = Alignment::from_value(json!({ "letters": ["a"] }));
        assert!(matches!(result, Err(VoxError::MalformedJson(_))));
    }

    #[test]
    fn test_segments_are_offset_and_monotonic() {
        let mut collector = TranscriptCollector::new(UnitKind::Character, 1000);
        collector.push(seconds_alignment("ab ", 0.05));
        collector.push(seconds_alignment("cd", 0.05));

        let events = collector.finish();
        assert_eq!(events.len(), 5);
        for pair in events.windows(2) {
            assert!(pair[1].start_ms >= pair[0].start_ms);
        }
        // Second segment starts where the first ended.
        assert!((events[3].start_ms - 150.0).abs() < 1e-9);
        assert_eq!(events[3].audio_frame, 150);
        assert!(events.iter().all(|e| e.end_ms >= e.start_ms));
    }

    #[test]
    fn test_out_of_order_times_are_clamped() {
        let mut collector = TranscriptCollector::new(UnitKind::Character, 8000);
        collector.push(
            Alignment::from_value(json!({
                "chars": ["x", "y", "z"],
                "charStartTimesMs": [50, 20, 80],
                "charDurationsMs": [10, 0, 10],
            }))
            .unwrap(),
        );
        let starts: Vec<f64> = collector.finish().iter().map(|e| e.start_ms).collect();
        assert_eq!(starts, vec![50.0, 50.0, 80.0]);
    }

    #[test]
    fn test_word_granularity_groups_on_whitespace() {
        let mut collector = TranscriptCollector::new(UnitKind::Word, 1000);
        collector.push(seconds_alignment("hello big ", 0.01));
        collector.push(seconds_alignment("world", 0.01));

        let events = collector.finish();
        let words: Vec<&str> = events.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(words, vec!["hello", "big", "world"]);
        assert!(events.iter().all(|e| e.kind == UnitKind::Word));
        assert!((events[0].end_ms - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_channel_publishes_batch_and_closes() {
        let (sender, receiver) = transcript_channel();
        assert_eq!(receiver.reported_units(), None);

        let mut collector = TranscriptCollector::new(UnitKind::Character, 1000);
        collector.push(seconds_alignment("abc", 0.1));
        sender.publish(collector.reported_units(), collector.finish());

        assert_eq!(receiver.reported_units(), Some(3));
        let texts: Vec<String> = receiver.iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
        assert!(receiver.recv().is_none());
    }

    #[test]
    fn test_reported_units_follow_granularity() {
        let mut characters = TranscriptCollector::new(UnitKind::Character, 1000);
        let mut words = TranscriptCollector::new(UnitKind::Word, 1000);
        for collector in [&mut characters, &mut words] {
            collector.push(seconds_alignment("one tw", 0.01));
            collector.push(seconds_alignment("o three ", 0.01));
        }
        assert_eq!(characters.reported_units(), 14);
        assert_eq!(words.reported_units(), 3);

        let texts: Vec<String> = words.finish().into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_receiver_reports_announced_count_not_event_count() {
        let (sender, receiver) = transcript_channel();
        let mut collector = TranscriptCollector::new(UnitKind::Character, 1000);
        collector.push(seconds_alignment("abcd", 0.1));
        let events: Vec<TranscriptEvent> = collector.finish().into_iter().take(2).collect();

        sender.publish(4, events);

        assert_eq!(receiver.reported_units(), Some(4));
        assert_eq!(receiver.iter().count(), 2);
    }

    #[test]
    fn test_dropped_sender_closes_channel_empty() {
        let (sender, receiver) = transcript_channel();
        drop(sender);
        assert_eq!(
            receiver.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Disconnected)
        );
        assert_eq!(receiver.reported_units(), None);
    }
}
