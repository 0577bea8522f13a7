//! Audio capture from microphone

use std::sync::{Arc, Mutex, PoisonError};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};

use crate::{Error, Result};

/// Default capture sample rate (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Default frame size in samples (30ms at 16kHz)
pub const FRAME_SIZE: usize = 480;

/// A fixed-size block of mono samples with its position in the capture stream
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Monotonically increasing sequence number
    pub seq: u64,
    /// Mono samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
}

/// Cuts a sample stream into fixed-size frames
///
/// Leftover samples that don't fill a frame are carried into the next push.
#[derive(Debug)]
pub struct FrameSplitter {
    frame_size: usize,
    pending: Vec<f32>,
    next_seq: u64,
}

impl FrameSplitter {
    /// Create a splitter producing frames of `frame_size` samples
    #[must_use]
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size: frame_size.max(1),
            pending: Vec::with_capacity(frame_size),
            next_seq: 0,
        }
    }

    /// Append samples, returning every frame that is now complete
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);

        let complete = self.pending.len() / self.frame_size;
        let mut frames = Vec::with_capacity(complete);
        let mut rest = self.pending.split_off(complete * self.frame_size);
        std::mem::swap(&mut rest, &mut self.pending);

        for chunk in rest.chunks_exact(self.frame_size) {
            frames.push(AudioFrame {
                seq: self.next_seq,
                samples: chunk.to_vec(),
            });
            self.next_seq += 1;
        }

        frames
    }

    /// Discard carried-over samples (sequence numbering continues)
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Microphone input on the default device
///
/// Samples collected by the device callback wait in a shared buffer until
/// [`take_buffer`](Self::take_buffer) drains them.
pub struct AudioCapture {
    device: cpal::Device,
    config: StreamConfig,
    captured: Arc<Mutex<Vec<f32>>>,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Open the default input device for mono capture at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if there is no input device or it has no mono config
    /// covering the requested rate
    pub fn with_sample_rate(sample_rate: u32) -> Result<Self> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let config = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && (c.min_sample_rate()..=c.max_sample_rate()).contains(&SampleRate(sample_rate))
            })
            .ok_or_else(|| {
                Error::Audio(format!("no mono input config at {sample_rate} Hz"))
            })?
            .with_sample_rate(SampleRate(sample_rate))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            "input device opened"
        );

        Ok(Self {
            device,
            config,
            captured: Arc::new(Mutex::new(Vec::new())),
            stream: None,
        })
    }

    /// Start the input stream (no-op when already running)
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be built or started
    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let captured = Arc::clone(&self.captured);
        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    captured
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(data);
                },
                |err| tracing::error!(error = %err, "input stream error"),
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    /// Drop the input stream; captured samples stay until taken
    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("input stream closed");
        }
    }

    /// Drain every sample captured since the last call
    #[must_use]
    pub fn take_buffer(&self) -> Vec<f32> {
        std::mem::take(&mut *self.captured.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Capture sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }
}

/// Convert f32 samples to 16-bit mono WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splitter_carries_remainder() {
        let mut splitter = FrameSplitter::new(4);

        let frames = splitter.push(&[0.1; 6]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].seq, 0);

        let frames = splitter.push(&[0.2; 6]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].seq, 1);
        assert_eq!(frames[1].seq, 2);
        // First frame of the second push starts with the carried samples
        assert!((frames[0].samples[0] - 0.1).abs() < f32::EPSILON);
        assert!((frames[0].samples[2] - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_splitter_short_push() {
        let mut splitter = FrameSplitter::new(480);
        assert!(splitter.push(&[0.0; 100]).is_empty());
        assert_eq!(splitter.push(&[0.0; 380]).len(), 1);
    }
}
