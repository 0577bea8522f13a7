//! Daemon - the duplex voice service
//!
//! Wires the microphone listener, transcription and the pipeline
//! coordinator into a conversation loop that runs until Ctrl-C.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::db::{self, ConversationRepo, DbPool};
use crate::pipeline::{Coordinator, TurnEvent, TurnSummary};
use crate::providers::resolve_backends;
use crate::voice::{Listener, PlaybackQueue, SpeechEvent, Utterance};
use crate::{Config, Error, Result};

/// The duplex daemon - listens, replies and yields to barge-in
pub struct Daemon {
    config: Config,
    db: Option<DbPool>,
}

impl Daemon {
    /// Create a new daemon instance
    ///
    /// # Errors
    ///
    /// Returns error if the conversation log cannot be opened
    pub fn new(config: Config) -> Result<Self> {
        let db = if config.conversation.log {
            let path = config.database_path();
            let pool = db::init(&path)?;
            tracing::info!(path = %path.display(), "conversation log opened");
            Some(pool)
        } else {
            None
        };

        Ok(Self { config, db })
    }

    /// The conversation log, when enabled
    #[must_use]
    pub const fn db(&self) -> Option<&DbPool> {
        self.db.as_ref()
    }

    /// Run the conversation loop until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if providers cannot be resolved or an audio device
    /// cannot be opened
    pub async fn run(self) -> Result<()> {
        let shutdown = shutdown_on_ctrl_c();
        let mut coordinator = self.coordinator(true, shutdown.clone())?;

        let (speech_tx, mut speech_rx) = mpsc::unbounded_channel();
        let (utterance_tx, mut utterances) = mpsc::unbounded_channel();
        let mut listener = Listener::spawn(self.config.listener(), speech_tx, utterance_tx)?;

        tracing::info!(
            stt = %self.config.providers.stt,
            llm = %self.config.providers.llm,
            tts = %self.config.providers.tts,
            "duplex ready - start talking"
        );

        let result = loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::info!("shutdown requested");
                    break Ok(());
                }
                Some(event) = speech_rx.recv() => {
                    tracing::trace!(kind = ?event.kind, "speech while idle");
                }
                utterance = utterances.recv() => {
                    let Some(utterance) = utterance else {
                        break Err(Error::Pipeline("listener stopped unexpectedly".to_string()));
                    };
                    handle_utterance(&mut coordinator, &utterance, &mut speech_rx).await;
                    if !self.config.conversation.barge_in {
                        drop_heard_during_reply(&mut utterances);
                    }
                }
            }
        };

        listener.stop();
        coordinator.shutdown();
        result
    }

    /// Run a single turn from typed text and wait for it to play out
    ///
    /// # Errors
    ///
    /// Returns error if providers cannot be resolved or the output device
    /// cannot be opened
    pub async fn say(&self, text: &str) -> Result<TurnSummary> {
        let shutdown = shutdown_on_ctrl_c();
        let mut coordinator = self.coordinator(false, shutdown)?;

        // Held open so the coordinator never sees a closed speech channel
        let (_speech_tx, mut speech_rx) = mpsc::unbounded_channel::<SpeechEvent>();
        let summary = coordinator.run_turn(text, &mut speech_rx).await;

        coordinator.shutdown();
        Ok(summary)
    }

    /// Build a coordinator with an open output device
    fn coordinator(&self, spoken: bool, shutdown: CancellationToken) -> Result<Coordinator> {
        let mut backends = resolve_backends(&self.config)?;
        if !spoken {
            backends.transcriber = None;
        }

        let playback = PlaybackQueue::open(self.config.playback.sample_rate)?;
        playback.set_volume(self.config.playback.volume);

        let mut coordinator =
            Coordinator::new(backends, playback, self.config.coordinator(), shutdown)
                .with_events(spawn_event_log());
        if let Some(pool) = &self.db {
            coordinator = coordinator.with_sink(Arc::new(ConversationRepo::new(pool.clone())));
        }
        Ok(coordinator)
    }
}

/// Discard utterances captured while the reply was playing
///
/// With barge-in off these are mostly the assistant's own voice.
fn drop_heard_during_reply(utterances: &mut mpsc::UnboundedReceiver<Utterance>) -> usize {
    let mut dropped = 0;
    while utterances.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        tracing::debug!(dropped, "utterances during reply discarded");
    }
    dropped
}

/// Transcribe an utterance and answer it
async fn handle_utterance(
    coordinator: &mut Coordinator,
    utterance: &Utterance,
    speech: &mut mpsc::UnboundedReceiver<SpeechEvent>,
) {
    let text = match coordinator.transcribe(utterance).await {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, "STT failed");
            return;
        }
    };

    if text.is_empty() {
        tracing::debug!(
            duration_ms = utterance.duration().as_millis(),
            "empty transcript, ignored"
        );
        return;
    }

    tracing::info!(transcript = %text, "heard");
    let summary = coordinator.run_turn(&text, speech).await;
    tracing::debug!(turn = %summary.id, outcome = %summary.outcome, "turn done");
}

/// Token cancelled on Ctrl-C
fn shutdown_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    shutdown
}

/// Log assistant output as it is produced
fn spawn_event_log() -> mpsc::UnboundedSender<TurnEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                TurnEvent::Sentence(fragment) => {
                    tracing::info!(seq = fragment.seq, text = %fragment.text, "assistant");
                }
                TurnEvent::FragmentFailed { seq, error } => {
                    tracing::warn!(seq, error = %error, "sentence skipped");
                }
                TurnEvent::Delta(_) | TurnEvent::AudioQueued { .. } | TurnEvent::Finished(_) => {}
            }
        }
    });
    tx
}
