//! WAV wrapping of headerless generation output.
//!
//! Buffered PCM and µ-law responses carry no header, so they are returned to
//! callers as 16-bit mono WAV files. Container formats pass through untouched.

use crate::error::{Result, VoxError};
use crate::format::{Codec, OutputFormat};
use crate::stream::decoder::ulaw_to_linear;
use std::io::Cursor;

fn wav_error(e: hound::Error) -> VoxError {
    VoxError::Decode {
        message: format!("Failed to write WAV data: {}", e),
    }
}

/// Write 16-bit mono samples as a complete WAV file.
pub fn samples_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(wav_error)?;
    for &sample in samples {
        writer.write_sample(sample).map_err(wav_error)?;
    }
    writer.finalize().map_err(wav_error)?;
    Ok(cursor.into_inner())
}

/// Signed 16-bit little-endian PCM to WAV. A trailing odd byte is dropped.
pub fn pcm_to_wav(bytes: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let samples: Vec<i16> = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    samples_to_wav(&samples, sample_rate)
}

/// G.711 µ-law to 16-bit WAV.
pub fn ulaw_to_wav(bytes: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let samples: Vec<i16> = bytes.iter().map(|&b| ulaw_to_linear(b)).collect();
    samples_to_wav(&samples, sample_rate)
}

/// Bytes as a caller should receive them for `format`.
pub fn wrap_output(bytes: Vec<u8>, format: &OutputFormat) -> Result<Vec<u8>> {
    match format.codec {
        Codec::Mp3 => Ok(bytes),
        Codec::Pcm => pcm_to_wav(&bytes, format.sample_rate),
        Codec::Ulaw => ulaw_to_wav(&bytes, format.sample_rate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_back(wav: &[u8]) -> (hound::WavSpec, Vec<i16>) {
        let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        let spec = reader.spec();
        let samples = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        (spec, samples)
    }

    #[test]
    fn test_pcm_to_wav_keeps_samples_and_rate() {
        let samples = [0i16, 1000, -1000, i16::MAX, i16::MIN];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

        let (spec, decoded) = read_back(&pcm_to_wav(&bytes, 24000).unwrap());
        assert_eq!(spec.sample_rate, 24000);
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(decoded, samples);
    }

    #[test]
    fn test_pcm_odd_trailing_byte_dropped() {
        let (_, decoded) = read_back(&pcm_to_wav(&[0x10, 0x00, 0xFF], 16000).unwrap());
        assert_eq!(decoded, vec![16]);
    }

    #[test]
    fn test_ulaw_to_wav_expands_each_byte() {
        let (spec, decoded) = read_back(&ulaw_to_wav(&[0xFF, 0x7F, 0x00], 8000).unwrap());
        assert_eq!(spec.sample_rate, 8000);
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0], 0);
        assert!(decoded[2] < -30000);
    }

    #[test]
    fn test_mp3_passes_through() {
        let format: OutputFormat = "mp3_44100_128".parse().unwrap();
        let bytes = vec![0xFF, 0xFB, 0x90, 0x00];
        assert_eq!(wrap_output(bytes.clone(), &format).unwrap(), bytes);
    }

    #[test]
    fn test_empty_pcm_is_a_valid_wav() {
        let (_, decoded) = read_back(&pcm_to_wav(&[], 22050).unwrap());
        assert!(decoded.is_empty());
    }
}
