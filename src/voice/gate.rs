//! Capture gate (energy-based voice activity detection)
//!
//! Turns a continuous stream of [`AudioFrame`]s into discrete
//! [`SpeechEvent`]s. A frame is "loud" when its RMS energy exceeds the
//! configured threshold. Two counters add hysteresis in both directions:
//!
//! - `activation_frames` consecutive loud frames are needed before
//!   `SpeechStart` fires; any quiet frame in between resets the count.
//! - `silence_frames` consecutive quiet frames are needed before `SpeechEnd`
//!   fires; any loud frame in between resets the count. Speech is still
//!   reported active during this grace period.

use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::mpsc;

use super::AudioFrame;

/// Default RMS threshold for a frame to count as speech
pub const DEFAULT_THRESHOLD: f32 = 0.01;

/// Default consecutive loud frames before speech starts
pub const DEFAULT_ACTIVATION_FRAMES: u32 = 3;

/// Default consecutive quiet frames before speech ends (~0.9s at 30ms frames)
pub const DEFAULT_SILENCE_FRAMES: u32 = 30;

/// Tunable gate parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateConfig {
    /// RMS energy a frame must exceed to count as loud (0.0 - 1.0)
    pub threshold: f32,

    /// Consecutive loud frames required to fire `SpeechStart`
    pub activation_frames: u32,

    /// Consecutive quiet frames required to fire `SpeechEnd`
    pub silence_frames: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            activation_frames: DEFAULT_ACTIVATION_FRAMES,
            silence_frames: DEFAULT_SILENCE_FRAMES,
        }
    }
}

/// State of the capture gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// No speech, no pending loud frames
    Idle,
    /// Counting consecutive loud frames toward activation
    Activating,
    /// Speech in progress (including the silence grace period)
    Speaking,
}

/// Kind of speech transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechEventKind {
    /// The user started talking
    SpeechStart,
    /// The user stopped talking
    SpeechEnd,
}

/// A speech transition emitted by the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechEvent {
    /// Transition kind
    pub kind: SpeechEventKind,
    /// When the transition was detected
    pub at: Instant,
}

impl SpeechEvent {
    fn now(kind: SpeechEventKind) -> Self {
        Self {
            kind,
            at: Instant::now(),
        }
    }

    /// Whether this is a `SpeechStart`
    #[must_use]
    pub fn is_start(&self) -> bool {
        self.kind == SpeechEventKind::SpeechStart
    }
}

/// Energy-threshold voice activity detector with hysteresis
pub struct CaptureGate {
    config: GateConfig,
    speaking: bool,
    activation_count: u32,
    silence_count: u32,
    events: mpsc::UnboundedSender<SpeechEvent>,
}

impl CaptureGate {
    /// Create a gate that reports transitions on `events`
    #[must_use]
    pub fn new(config: GateConfig, events: mpsc::UnboundedSender<SpeechEvent>) -> Self {
        tracing::debug!(
            threshold = config.threshold,
            activation_frames = config.activation_frames,
            silence_frames = config.silence_frames,
            "capture gate initialized"
        );

        Self {
            config,
            speaking: false,
            activation_count: 0,
            silence_count: 0,
            events,
        }
    }

    /// Process one frame
    ///
    /// Returns true while speech is active, including the silence grace
    /// period after the last loud frame.
    pub fn process(&mut self, frame: &AudioFrame) -> bool {
        let energy = rms(&frame.samples);

        if energy > self.config.threshold {
            self.silence_count = 0;
            if !self.speaking {
                self.activation_count += 1;
                if self.activation_count >= self.config.activation_frames {
                    self.speaking = true;
                    self.activation_count = 0;
                    tracing::debug!(seq = frame.seq, energy, "speech start");
                    self.emit(SpeechEventKind::SpeechStart);
                }
            }
            return self.speaking;
        }

        self.activation_count = 0;

        if !self.speaking {
            return false;
        }

        self.silence_count += 1;
        if self.silence_count >= self.config.silence_frames {
            self.speaking = false;
            self.silence_count = 0;
            tracing::debug!(seq = frame.seq, "speech end");
            self.emit(SpeechEventKind::SpeechEnd);
            return false;
        }

        tracing::trace!(seq = frame.seq, silence = self.silence_count, "speech grace period");
        true
    }

    /// Force the gate back to idle and zero both counters
    pub const fn reset(&mut self) {
        self.speaking = false;
        self.activation_count = 0;
        self.silence_count = 0;
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> GateState {
        if self.speaking {
            GateState::Speaking
        } else if self.activation_count > 0 {
            GateState::Activating
        } else {
            GateState::Idle
        }
    }

    /// Check if speech is currently active
    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Gate parameters
    #[must_use]
    pub const fn config(&self) -> &GateConfig {
        &self.config
    }

    fn emit(&self, kind: SpeechEventKind) {
        if self.events.send(SpeechEvent::now(kind)).is_err() {
            tracing::trace!(?kind, "speech event dropped, no receiver");
        }
    }
}

/// Collects the audio of one utterance
///
/// Keeps a short pre-roll of recent frames so the loud frames that were
/// counted toward activation are not lost, then records every frame while
/// the gate reports speech.
pub struct UtteranceBuffer {
    pre_roll: VecDeque<AudioFrame>,
    pre_roll_frames: usize,
    samples: Vec<f32>,
    recording: bool,
}

impl UtteranceBuffer {
    /// Create a buffer keeping `pre_roll_frames` frames before speech start
    #[must_use]
    pub fn new(pre_roll_frames: usize) -> Self {
        Self {
            pre_roll: VecDeque::with_capacity(pre_roll_frames + 1),
            pre_roll_frames,
            samples: Vec::new(),
            recording: false,
        }
    }

    /// Feed a frame along with the gate's verdict for it
    ///
    /// Returns the completed utterance when speech has just ended.
    pub fn push(&mut self, frame: AudioFrame, active: bool) -> Option<Vec<f32>> {
        if active {
            if !self.recording {
                self.recording = true;
                for earlier in self.pre_roll.drain(..) {
                    self.samples.extend_from_slice(&earlier.samples);
                }
            }
            self.samples.extend_from_slice(&frame.samples);
            return None;
        }

        if self.recording {
            self.recording = false;
            self.samples.extend_from_slice(&frame.samples);
            return Some(std::mem::take(&mut self.samples));
        }

        self.pre_roll.push_back(frame);
        while self.pre_roll.len() > self.pre_roll_frames {
            self.pre_roll.pop_front();
        }
        None
    }

    /// Whether an utterance is being recorded
    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.recording
    }

    /// Drop any partial utterance and pre-roll
    pub fn clear(&mut self) {
        self.pre_roll.clear();
        self.samples.clear();
        self.recording = false;
    }
}

/// Calculate RMS energy of audio samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
