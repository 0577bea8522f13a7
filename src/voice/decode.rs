//! Audio fragment formats and decoding to mono f32 samples

use std::io::Cursor;

use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

/// Resampler input chunk size
const RESAMPLE_CHUNK: usize = 1024;

/// Encoding of a synthesized audio payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    /// Raw little-endian signed 16-bit mono PCM
    Pcm16 {
        /// Declared sample rate
        sample_rate: u32,
    },
    /// WAV container
    Wav,
    /// MP3 stream
    Mp3,
}

impl AudioFormat {
    /// Short label for logs and the conversation log
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pcm16 { .. } => "pcm",
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
        }
    }
}

/// Synthesized audio for one sentence fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFragment {
    /// Sequence index of the sentence fragment this audio was derived from
    pub seq: u64,
    /// Payload encoding
    pub format: AudioFormat,
    /// Encoded payload
    pub bytes: Vec<u8>,
}

/// Audio decoded and resampled for playback
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFragment {
    /// Sequence index of the sentence fragment
    pub seq: u64,
    /// Source encoding, kept for logs
    pub format: AudioFormat,
    /// Mono samples at the playback rate
    pub samples: Vec<f32>,
}

impl AudioFragment {
    /// Decode to mono samples at `target_rate`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the payload is malformed or unsupported
    pub fn decode(&self, target_rate: u32) -> Result<DecodedFragment> {
        Ok(DecodedFragment {
            seq: self.seq,
            format: self.format,
            samples: decode_fragment(self, target_rate)?,
        })
    }
}

/// Decode a fragment to mono samples at `target_rate`
///
/// # Errors
///
/// Returns [`Error::Decode`] if the payload is malformed or unsupported
pub fn decode_fragment(fragment: &AudioFragment, target_rate: u32) -> Result<Vec<f32>> {
    let (samples, rate) = match fragment.format {
        AudioFormat::Pcm16 { sample_rate } => (decode_pcm16(&fragment.bytes)?, sample_rate),
        AudioFormat::Wav => decode_wav(&fragment.bytes)?,
        AudioFormat::Mp3 => decode_mp3(&fragment.bytes)?,
    };

    resample(samples, rate, target_rate)
}

/// Convert raw i16 little-endian PCM to f32
fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(Error::Decode(format!(
            "PCM payload has odd length {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect())
}

/// Decode a WAV container, averaging channels to mono
#[allow(clippy::cast_precision_loss)]
fn decode_wav(bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| Error::Decode(format!("WAV header: {e}")))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Decode(format!("WAV samples: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Decode(format!("WAV samples: {e}")))?
        }
    };

    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok((mono, spec.sample_rate))
}

/// Decode MP3 bytes, averaging stereo to mono
fn decode_mp3(mp3_data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = None;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate.get_or_insert(frame.sample_rate);

                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Decode(format!("MP3 decode error: {e}"))),
        }
    }

    let rate = sample_rate
        .and_then(|r| u32::try_from(r).ok())
        .ok_or_else(|| Error::Decode("MP3 payload contains no frames".to_string()))?;

    Ok((samples, rate))
}

/// Resample mono samples from `from` Hz to `to` Hz
///
/// # Errors
///
/// Returns error if the resampler cannot be built for the rate pair
pub fn resample(samples: Vec<f32>, from: u32, to: u32) -> Result<Vec<f32>> {
    if from == to || samples.is_empty() {
        return Ok(samples);
    }
    if from == 0 || to == 0 {
        return Err(Error::Decode(format!("invalid sample rate {from} -> {to}")));
    }

    let mut resampler = FftFixedIn::<f32>::new(from as usize, to as usize, RESAMPLE_CHUNK, 2, 1)
        .map_err(|e| Error::Decode(format!("resampler: {e}")))?;

    let expected = samples.len() * to as usize / from as usize;
    let mut out = Vec::with_capacity(expected + RESAMPLE_CHUNK);
    let mut pos = 0;

    while pos + resampler.input_frames_next() <= samples.len() {
        let take = resampler.input_frames_next();
        let block = [&samples[pos..pos + take]];
        let chunk = resampler
            .process(&block[..], None)
            .map_err(|e| Error::Decode(format!("resample: {e}")))?;
        out.extend_from_slice(&chunk[0]);
        pos += take;
    }

    if pos < samples.len() {
        let tail = [&samples[pos..]];
        let chunk = resampler
            .process_partial(Some(&tail[..]), None)
            .map_err(|e| Error::Decode(format!("resample: {e}")))?;
        out.extend_from_slice(&chunk[0]);
    }

    tracing::trace!(from, to, input = samples.len(), output = out.len(), "resampled");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(format: AudioFormat, bytes: Vec<u8>) -> AudioFragment {
        AudioFragment {
            seq: 1,
            format,
            bytes,
        }
    }

    #[test]
    fn test_pcm16_conversion() {
        let bytes: Vec<u8> = [0_i16, 16384, -32768]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let samples =
            decode_fragment(&fragment(AudioFormat::Pcm16 { sample_rate: 24000 }, bytes), 24000)
                .unwrap();

        assert_eq!(samples.len(), 3);
        assert!(samples[0].abs() < f32::EPSILON);
        assert!((samples[1] - 0.5).abs() < f32::EPSILON);
        assert!((samples[2] + 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_pcm16_odd_length_rejected() {
        let result = decode_fragment(
            &fragment(AudioFormat::Pcm16 { sample_rate: 24000 }, vec![0, 1, 2]),
            24000,
        );
        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[test]
    fn test_garbage_mp3_rejected() {
        let result = decode_fragment(&fragment(AudioFormat::Mp3, b"not audio".to_vec()), 24000);
        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[test]
    fn test_resample_changes_length() {
        let samples = vec![0.0_f32; 16000];
        let out = resample(samples, 16000, 24000).unwrap();
        // FFT resampler adds some delay padding; length is close to 1.5x
        assert!(out.len() >= 23000, "got {}", out.len());
    }
}
