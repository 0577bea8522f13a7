//! Turn lifecycle and reporting

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::segmenter::SentenceFragment;
use crate::Result;

/// Terminal state of a turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "error", rename_all = "lowercase")]
pub enum TurnOutcome {
    /// Reply generated and played to the end
    Completed,
    /// Cut short by barge-in, abort or shutdown
    Interrupted,
    /// Generation failed; whatever was produced was still played
    Failed(String),
}

impl TurnOutcome {
    /// Short label for logs and storage
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for TurnOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(error) => write!(f, "failed: {error}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Per-stage timings of a turn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnTimings {
    /// Turn start to first generated token
    pub first_token: Option<Duration>,
    /// Turn start to end of generation
    pub generation: Option<Duration>,
    /// Sum of per-sentence synthesis time
    pub synthesis: Duration,
    /// Turn start to first audible fragment
    pub first_audio: Option<Duration>,
    /// Turn start to terminal state
    pub total: Duration,
}

/// Provider identifiers recorded with a turn
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderIds {
    /// Transcription provider, if the input was spoken
    pub stt: Option<String>,
    /// Generation provider
    pub llm: String,
    /// Synthesis provider (`none` in text-only mode)
    pub tts: String,
}

/// Report of one finished turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnSummary {
    /// Turn identifier
    pub id: Uuid,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// What the user said
    pub user_text: String,
    /// What the assistant generated (partial when interrupted or failed)
    pub assistant_text: String,
    /// Providers used
    pub providers: ProviderIds,
    /// Sentences produced
    pub sentences: u64,
    /// Audio fragments handed to playback
    pub audio_fragments: u64,
    /// Sentences whose synthesis failed
    pub failed_fragments: u64,
    /// Terminal state
    pub outcome: TurnOutcome,
    /// Stage timings
    pub timings: TurnTimings,
}

/// Progress of a running turn, for observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// Generated text arrived
    Delta(String),
    /// A sentence was cut and sent for synthesis
    Sentence(SentenceFragment),
    /// A fragment was handed to playback
    AudioQueued {
        /// Sequence index
        seq: u64,
    },
    /// A fragment's synthesis failed and was skipped
    FragmentFailed {
        /// Sequence index
        seq: u64,
        /// Failure description
        error: String,
    },
    /// The turn reached its terminal state
    Finished(TurnSummary),
}

/// Destination for finished turn summaries
///
/// A failing sink never changes a turn's outcome.
pub trait ConversationSink: Send + Sync {
    /// Store a finished turn
    ///
    /// # Errors
    ///
    /// Returns error if the summary cannot be stored
    fn record(&self, summary: &TurnSummary) -> Result<()>;
}

/// State of one user-utterance to assistant-reply cycle
#[derive(Debug)]
pub struct Turn {
    id: Uuid,
    cancel: CancellationToken,
    started: Instant,
    started_at: DateTime<Utc>,
    user_text: String,
    fragments: Vec<SentenceFragment>,
    assistant_text: String,
    first_token: Option<Instant>,
    generation_end: Option<Instant>,
    first_audio: Option<Instant>,
    audio_fragments: u64,
    failed_fragments: u64,
}

impl Turn {
    /// Start a turn whose cancellation follows `parent`
    #[must_use]
    pub fn new(user_text: impl Into<String>, parent: &CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            cancel: parent.child_token(),
            started: Instant::now(),
            started_at: Utc::now(),
            user_text: user_text.into(),
            fragments: Vec::new(),
            assistant_text: String::new(),
            first_token: None,
            generation_end: None,
            first_audio: None,
            audio_fragments: 0,
            failed_fragments: 0,
        }
    }

    /// Turn identifier
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// When the turn started
    #[must_use]
    pub const fn started(&self) -> Instant {
        self.started
    }

    /// The turn's cancellation token
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel the turn
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Check if the turn has been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record generated text
    pub fn push_text(&mut self, text: &str) {
        if self.first_token.is_none() {
            self.first_token = Some(Instant::now());
        }
        self.assistant_text.push_str(text);
    }

    /// Record a sentence sent for synthesis
    pub fn push_fragment(&mut self, fragment: SentenceFragment) {
        self.fragments.push(fragment);
    }

    /// Sentences produced so far
    #[must_use]
    pub fn fragments(&self) -> &[SentenceFragment] {
        &self.fragments
    }

    /// Generated text so far
    #[must_use]
    pub fn assistant_text(&self) -> &str {
        &self.assistant_text
    }

    /// Mark the end of generation
    pub fn generation_finished(&mut self) {
        if self.generation_end.is_none() {
            self.generation_end = Some(Instant::now());
        }
    }

    /// Count a fragment handed to playback
    pub const fn audio_queued(&mut self) {
        self.audio_fragments += 1;
    }

    /// Fragments handed to playback so far
    #[must_use]
    pub const fn audio_fragments(&self) -> u64 {
        self.audio_fragments
    }

    /// Count a failed fragment
    pub const fn fragment_failed(&mut self) {
        self.failed_fragments += 1;
    }

    /// Mark the first fragment becoming audible
    pub fn audio_started(&mut self) {
        if self.first_audio.is_none() {
            self.first_audio = Some(Instant::now());
        }
    }

    /// Close the turn and build its report
    #[must_use]
    pub fn finish(
        self,
        outcome: TurnOutcome,
        synthesis: Duration,
        providers: ProviderIds,
    ) -> TurnSummary {
        let since_start = |mark: Option<Instant>| mark.map(|at| at.duration_since(self.started));

        let timings = TurnTimings {
            first_token: since_start(self.first_token),
            generation: since_start(self.generation_end),
            synthesis,
            first_audio: since_start(self.first_audio),
            total: self.started.elapsed(),
        };

        TurnSummary {
            id: self.id,
            started_at: self.started_at,
            user_text: self.user_text,
            assistant_text: self.assistant_text.trim().to_string(),
            providers,
            sentences: self.fragments.len() as u64,
            audio_fragments: self.audio_fragments,
            failed_fragments: self.failed_fragments,
            outcome,
            timings,
        }
    }
}
