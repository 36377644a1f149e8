//! Buffer, decoder, feeder and sink wired together by hand.

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;
use voxstream::playback::{Feeder, playback_queue, spawn_player};
use voxstream::stream::{
    BlockPoll, BodyFraming, Downloader, IncrementalDecoder, StreamBuffer, StreamState,
};
use voxstream::transport::MockConnection;
use voxstream::{MockOutput, PlaybackControl, PlaybackOutcome, StreamConfig, VoxError};

const BLOCK_SIZE: usize = 256;

/// 22.05 kHz mono MPEG-2 layer III, 45 frames.
const MP3: &[u8] = include_bytes!("fixtures/short.mp3");

fn wav_bytes(frames: usize, sample_rate: u32) -> (Vec<u8>, Vec<f32>) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let samples: Vec<i16> = (0..frames).map(|i| ((i * 37) % 2000) as i16 - 1000).collect();
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &sample in &samples {
            writer.write_sample(sample).unwrap();
        }
        writer.finalize().unwrap();
    }
    let expected = samples.iter().map(|&s| s as f32 / 32768.0).collect();
    (cursor.into_inner(), expected)
}

fn config(buffer_depth: usize) -> StreamConfig {
    StreamConfig {
        block_size: BLOCK_SIZE,
        buffer_depth,
        ..StreamConfig::default()
    }
}

#[test]
fn three_byte_chunks_play_ten_blocks_with_padded_tail() {
    let frames = 9 * BLOCK_SIZE + 100;
    let (bytes, expected) = wav_bytes(frames, 8000);
    let config = config(16);
    let buffer = StreamBuffer::new();
    let cancel = Arc::new(AtomicBool::new(false));

    let (queue_tx, queue_rx) = playback_queue(&config);
    let output = MockOutput::new(BLOCK_SIZE);
    let control = PlaybackControl::new();
    let player = spawn_player(
        queue_rx,
        Box::new(output.clone()),
        None,
        None,
        control.clone(),
    );

    // The first appends are slow so the header is attempted before it is complete.
    let producer = {
        let buffer = buffer.clone();
        thread::spawn(move || {
            for (i, piece) in bytes.chunks(3).enumerate() {
                if i < 30 {
                    thread::sleep(Duration::from_millis(2));
                }
                buffer.append(piece);
            }
            buffer.finish();
        })
    };

    let decoder = IncrementalDecoder::container(buffer, "wav", &config);
    let summary = Feeder::new(decoder, cancel).run(Some(queue_tx)).unwrap();
    producer.join().unwrap();

    assert_eq!(summary.blocks, 10);
    assert_eq!(summary.frames, frames as u64);
    assert_eq!(summary.sample_rate, 8000);
    assert!(summary.header_retries >= 1);

    assert_eq!(control.wait(), PlaybackOutcome::Completed);
    player.join().unwrap();

    let captured = output.captured();
    assert_eq!(captured.len(), 10 * BLOCK_SIZE);
    for (played, want) in captured.iter().zip(&expected) {
        assert!((played - want).abs() < 1e-4);
    }
    assert!(captured[frames..].iter().all(|&s| s == 0.0));
}

#[test]
fn downloader_feeds_decoder_across_threads() {
    let (bytes, _) = wav_bytes(4 * BLOCK_SIZE, 16000);
    let config = config(8);
    let buffer = StreamBuffer::new();
    let cancel = Arc::new(AtomicBool::new(false));

    let download = {
        let downloader = Downloader::new(
            buffer.clone(),
            BodyFraming::Raw,
            &config,
            Arc::clone(&cancel),
        );
        thread::spawn(move || {
            let mut connection = MockConnection::ok(&bytes, 5);
            downloader.run(&mut connection)
        })
    };

    let decoder = IncrementalDecoder::container(buffer, "wav", &config);
    let (tap_tx, tap_rx) = crossbeam_channel::unbounded();
    let summary = Feeder::new(decoder, cancel)
        .with_tap(tap_tx)
        .run(None)
        .unwrap();

    let report = download.join().unwrap().unwrap();
    assert!(!report.cancelled);
    assert_eq!(summary.blocks, 4);
    assert_eq!(tap_rx.iter().count(), 4);
}

#[test]
fn network_failure_mid_body_fails_the_feeder() {
    let (bytes, _) = wav_bytes(8 * BLOCK_SIZE, 16000);
    let config = config(8);
    let buffer = StreamBuffer::new();
    let cancel = Arc::new(AtomicBool::new(false));

    let mut connection =
        MockConnection::ok(&bytes[..1000], 100).failing_after_chunks("connection reset");
    let downloader = Downloader::new(buffer.clone(), BodyFraming::Raw, &config, Arc::clone(&cancel));
    assert!(downloader.run(&mut connection).is_err());

    let decoder = IncrementalDecoder::container(buffer, "wav", &config);
    let err = Feeder::new(decoder, cancel).run(None).unwrap_err();
    match err {
        VoxError::NetworkFailure { message } => assert!(message.contains("connection reset")),
        other => panic!("Expected NetworkFailure, got {:?}", other),
    }
}

/// Decode the mp3 fixture fed `chunk` bytes at a time, polling after every append.
fn decode_mp3(chunk: usize) -> (Vec<f32>, IncrementalDecoder) {
    let config = StreamConfig {
        block_size: 512,
        decode_retry_limit: 100_000,
        ..StreamConfig::default()
    };
    let buffer = StreamBuffer::new();
    let mut decoder = IncrementalDecoder::container(buffer.clone(), "mp3", &config);
    let mut samples = Vec::new();

    for piece in MP3.chunks(chunk) {
        buffer.append(piece);
        while let BlockPoll::Block(block) = decoder.poll_block().unwrap() {
            samples.extend(block.samples);
        }
    }
    buffer.finish();
    while let BlockPoll::Block(block) = decoder.poll_block().unwrap() {
        samples.extend(block.samples);
    }
    assert_eq!(decoder.state(), StreamState::Done);
    (samples, decoder)
}

#[test]
fn mp3_output_does_not_depend_on_chunk_size() {
    let (expected, whole) = decode_mp3(MP3.len());
    assert_eq!(expected.len(), 25920);
    assert_eq!(whole.sample_rate(), 22050);
    assert_eq!(whole.reopens(), 0);

    for chunk in [1, 3, 97, 1000] {
        let (samples, decoder) = decode_mp3(chunk);
        assert_eq!(samples.len(), expected.len(), "chunk size {}", chunk);
        assert!(samples == expected, "chunk size {} changed the audio", chunk);
        assert!(decoder.reopens() > 0, "chunk size {} never reopened", chunk);
    }
}

#[test]
fn mp3_header_is_retried_until_complete() {
    let (_, decoder) = decode_mp3(1);
    assert!(decoder.header_retries() >= 1);
}
