//! Duplex Voice - real-time spoken conversation pipeline
//!
//! This library provides the core of a full-duplex voice assistant:
//! - Capture gating (energy-based speech detection with hysteresis)
//! - Streaming replies cut into sentences and synthesized concurrently
//! - Ordered, interruptible playback with barge-in
//! - STT/LLM/TTS provider backends
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │   Microphone → Capture Gate → Utterance → STT       │
//! └────────────────────┬────────────────────────────────┘
//!                      │ user text        ▲ SpeechStart (barge-in)
//! ┌────────────────────▼──────────────────┴─────────────┐
//! │                   Coordinator                        │
//! │   LLM stream → Segmenter → Synthesis Dispatcher     │
//! └────────────────────┬────────────────────────────────┘
//!                      │ ordered audio fragments
//! ┌────────────────────▼────────────────────────────────┐
//! │              Playback Queue → Speaker               │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod providers;
pub mod voice;

pub use config::Config;
pub use daemon::Daemon;
pub use db::{ConversationRepo, DbConn, DbPool};
pub use error::{Error, Result};
pub use pipeline::{Coordinator, TurnOutcome, TurnSummary};
