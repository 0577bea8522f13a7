//! Voice processing module
//!
//! Handles audio capture, speech gating, fragment decoding, and playback.
//! Transcription and synthesis backends live in [`crate::providers`].

mod capture;
mod decode;
mod gate;
mod listener;
mod playback;

pub use capture::{AudioCapture, AudioFrame, FRAME_SIZE, FrameSplitter, SAMPLE_RATE, samples_to_wav};
pub use decode::{AudioFormat, AudioFragment, DecodedFragment, decode_fragment, resample};
pub use gate::{
    CaptureGate, DEFAULT_ACTIVATION_FRAMES, DEFAULT_SILENCE_FRAMES, DEFAULT_THRESHOLD, GateConfig,
    GateState, SpeechEvent, SpeechEventKind, UtteranceBuffer, rms,
};
pub use listener::{FrameProcessor, Listener, ListenerConfig, Utterance};
pub use playback::{PLAYBACK_SAMPLE_RATE, PlaybackEvent, PlaybackQueue, Renderer};
