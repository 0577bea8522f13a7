//! Microphone listener
//!
//! Runs capture on a dedicated thread: raw samples are cut into frames, fed
//! through the [`CaptureGate`], and collected into utterances. Speech
//! transitions go out on one channel as they happen; finished utterances on
//! another.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc;

use super::capture::{AudioCapture, FrameSplitter};
use super::gate::{CaptureGate, GateConfig, SpeechEvent, UtteranceBuffer};
use crate::{Error, Result};

/// How often the capture buffer is drained
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Frames kept from before speech start
const DEFAULT_PRE_ROLL_FRAMES: usize = 5;

/// Listener settings
#[derive(Debug, Clone, Copy)]
pub struct ListenerConfig {
    /// Gate parameters
    pub gate: GateConfig,
    /// Capture sample rate
    pub sample_rate: u32,
    /// Samples per frame
    pub frame_size: usize,
    /// Frames kept from before speech start
    pub pre_roll_frames: usize,
    /// Utterances shorter than this are dropped
    pub min_utterance: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            gate: GateConfig::default(),
            sample_rate: super::SAMPLE_RATE,
            frame_size: super::FRAME_SIZE,
            pre_roll_frames: DEFAULT_PRE_ROLL_FRAMES,
            min_utterance: Duration::from_millis(300),
        }
    }
}

/// A finished utterance
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Mono samples
    pub samples: Vec<f32>,
    /// Sample rate of `samples`
    pub sample_rate: u32,
}

impl Utterance {
    /// Length of the utterance
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate.max(1)))
    }
}

/// Frame splitting, gating and utterance collection without a device
pub struct FrameProcessor {
    splitter: FrameSplitter,
    gate: CaptureGate,
    utterance: UtteranceBuffer,
    sample_rate: u32,
    min_samples: usize,
}

impl FrameProcessor {
    /// Create a processor reporting speech transitions on `events`
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn new(config: &ListenerConfig, events: mpsc::UnboundedSender<SpeechEvent>) -> Self {
        let min_samples =
            (config.min_utterance.as_secs_f64() * f64::from(config.sample_rate)) as usize;

        Self {
            splitter: FrameSplitter::new(config.frame_size),
            gate: CaptureGate::new(config.gate, events),
            utterance: UtteranceBuffer::new(config.pre_roll_frames),
            sample_rate: config.sample_rate,
            min_samples,
        }
    }

    /// Feed raw samples, returning any utterances completed by them
    pub fn feed(&mut self, samples: &[f32]) -> Vec<Utterance> {
        let mut done = Vec::new();

        for frame in self.splitter.push(samples) {
            let active = self.gate.process(&frame);
            if let Some(samples) = self.utterance.push(frame, active) {
                if samples.len() < self.min_samples {
                    tracing::debug!(samples = samples.len(), "utterance too short, dropped");
                    continue;
                }
                done.push(Utterance {
                    samples,
                    sample_rate: self.sample_rate,
                });
            }
        }

        done
    }

    /// Reset the gate and drop partial audio
    pub fn reset(&mut self) {
        self.gate.reset();
        self.utterance.clear();
        self.splitter.clear();
    }

    /// Check if the gate currently reports speech
    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.gate.is_speaking()
    }
}

/// Handle to the capture thread
pub struct Listener {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Listener {
    /// Open the default input device and start listening
    ///
    /// # Errors
    ///
    /// Returns error if the input device cannot be opened
    pub fn spawn(
        config: ListenerConfig,
        events: mpsc::UnboundedSender<SpeechEvent>,
        utterances: mpsc::UnboundedSender<Utterance>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("duplex-listener".to_string())
            .spawn(move || {
                let mut capture = match AudioCapture::with_sample_rate(config.sample_rate)
                    .and_then(|mut c| c.start().map(|()| c))
                {
                    Ok(capture) => {
                        let _ = ready_tx.send(Ok(()));
                        capture
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let mut processor = FrameProcessor::new(&config, events);
                tracing::info!(sample_rate = config.sample_rate, "listening");

                while !thread_stop.load(Ordering::Relaxed) {
                    std::thread::sleep(POLL_INTERVAL);

                    for utterance in processor.feed(&capture.take_buffer()) {
                        tracing::debug!(
                            duration_ms = utterance.duration().as_millis(),
                            "utterance captured"
                        );
                        if utterances.send(utterance).is_err() {
                            thread_stop.store(true, Ordering::Relaxed);
                            break;
                        }
                        processor.reset();
                    }
                }

                capture.stop();
                tracing::debug!("listener stopped");
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::Audio("listener thread exited during startup".to_string()))??;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop capturing and join the thread
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::warn!("listener thread panicked");
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::gate::SpeechEventKind;

    fn config() -> ListenerConfig {
        ListenerConfig {
            gate: GateConfig {
                threshold: 0.05,
                activation_frames: 2,
                silence_frames: 3,
            },
            sample_rate: 1000,
            frame_size: 10,
            pre_roll_frames: 1,
            min_utterance: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_feed_yields_utterance_and_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut processor = FrameProcessor::new(&config(), tx);

        assert!(processor.feed(&[0.0; 20]).is_empty());
        assert!(processor.feed(&[0.5; 50]).is_empty());
        assert!(processor.is_speaking());

        let done = processor.feed(&[0.0; 30]);
        assert_eq!(done.len(), 1);
        // First loud frame via pre-roll, four active frames, three quiet frames
        assert_eq!(done[0].samples.len(), 80);

        assert_eq!(rx.try_recv().unwrap().kind, SpeechEventKind::SpeechStart);
        assert_eq!(rx.try_recv().unwrap().kind, SpeechEventKind::SpeechEnd);
    }

    #[test]
    fn test_short_utterance_dropped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut config = config();
        config.min_utterance = Duration::from_secs(1);
        let mut processor = FrameProcessor::new(&config, tx);

        processor.feed(&[0.5; 50]);
        assert!(processor.feed(&[0.0; 30]).is_empty());
    }
}
