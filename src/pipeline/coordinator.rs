//! Pipeline coordinator
//!
//! Owns the playback queue and runs one turn at a time: generated text is
//! segmented as it streams, each sentence is synthesized concurrently, and
//! ordered audio is fed to playback while generation is still going. A
//! `SpeechStart` that arrives after the turn began is barge-in: playback is
//! cut, the turn's token is cancelled and nothing more is forwarded.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{StreamExt, stream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::dispatcher::{Delivery, DispatchStats, SynthesisDispatcher};
use super::segmenter::{Segmenter, SentenceFragment};
use super::turn::{ConversationSink, ProviderIds, Turn, TurnEvent, TurnOutcome, TurnSummary};
use crate::providers::{ChatMessage, Generator, Synthesizer, TextStream, Transcriber};
use crate::voice::{PlaybackEvent, PlaybackQueue, SpeechEvent, Utterance, samples_to_wav};
use crate::{Error, Result};

/// Default number of history messages kept
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Resolved backends for the pipeline
pub struct Backends {
    /// Speech-to-text (absent when input is typed)
    pub transcriber: Option<Arc<dyn Transcriber>>,
    /// Reply generation
    pub generator: Arc<dyn Generator>,
    /// Speech synthesis (absent in text-only mode)
    pub synthesizer: Option<Arc<dyn Synthesizer>>,
}

/// Coordinator settings
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// System prompt sent with every request
    pub system_prompt: String,
    /// Maximum history messages kept (user and assistant)
    pub history_limit: usize,
    /// Cut the reply when the user starts speaking
    pub barge_in: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            barge_in: true,
        }
    }
}

/// Cancels whichever turn is currently running
#[derive(Clone, Default)]
pub struct TurnAborter {
    current: Arc<Mutex<Option<CancellationToken>>>,
}

impl TurnAborter {
    /// Abort the running turn, returning whether one was running
    pub fn abort(&self) -> bool {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        current.as_ref().is_some_and(|token| {
            token.cancel();
            true
        })
    }

    fn set(&self, token: Option<CancellationToken>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = token;
    }
}

/// Why the streaming phase stopped
enum Interrupt {
    /// The user started speaking
    BargeIn,
    /// The turn's token was cancelled from outside
    Cancelled,
}

/// Runs turns end to end
pub struct Coordinator {
    backends: Backends,
    playback: PlaybackQueue,
    playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
    config: CoordinatorConfig,
    history: VecDeque<ChatMessage>,
    shutdown: CancellationToken,
    aborter: TurnAborter,
    events: Option<mpsc::UnboundedSender<TurnEvent>>,
    sink: Option<Arc<dyn ConversationSink>>,
}

impl Coordinator {
    /// Create a coordinator that owns `playback`
    ///
    /// Cancelling `shutdown` interrupts the running turn and every later one.
    #[must_use]
    pub fn new(
        backends: Backends,
        playback: PlaybackQueue,
        config: CoordinatorConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let playback_events = playback.subscribe();
        Self {
            backends,
            playback,
            playback_events,
            config,
            history: VecDeque::new(),
            shutdown,
            aborter: TurnAborter::default(),
            events: None,
            sink: None,
        }
    }

    /// Report turn progress on `events`
    #[must_use]
    pub fn with_events(mut self, events: mpsc::UnboundedSender<TurnEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Store finished turns in `sink`
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ConversationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Handle for aborting the running turn from elsewhere
    #[must_use]
    pub fn aborter(&self) -> TurnAborter {
        self.aborter.clone()
    }

    /// The playback queue
    #[must_use]
    pub const fn playback(&self) -> &PlaybackQueue {
        &self.playback
    }

    /// The resolved backends
    #[must_use]
    pub const fn backends(&self) -> &Backends {
        &self.backends
    }

    /// Conversation history, oldest first
    pub fn history(&self) -> impl Iterator<Item = &ChatMessage> {
        self.history.iter()
    }

    /// Forget the conversation history
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Transcribe a captured utterance
    ///
    /// # Errors
    ///
    /// Returns error if there is no transcriber or transcription fails
    pub async fn transcribe(&self, utterance: &Utterance) -> Result<String> {
        let transcriber = self
            .backends
            .transcriber
            .as_ref()
            .ok_or_else(|| Error::Stt("no transcriber configured".to_string()))?;

        let wav = samples_to_wav(&utterance.samples, utterance.sample_rate)?;
        transcriber.transcribe(&wav).await
    }

    /// Interrupt playback and release the output device
    pub fn shutdown(&mut self) {
        self.shutdown.cancel();
        self.playback.destroy();
    }

    /// Run one turn for `user_text`
    ///
    /// Speech events are read from `speech` for barge-in; only a
    /// `SpeechStart` detected after the turn began counts. Never fails: the
    /// outcome is reported in the summary.
    #[allow(clippy::too_many_lines)]
    pub async fn run_turn(
        &mut self,
        user_text: &str,
        speech: &mut mpsc::UnboundedReceiver<SpeechEvent>,
    ) -> TurnSummary {
        let mut turn = Turn::new(user_text, &self.shutdown);
        let cancel = turn.cancel_token().clone();
        self.aborter.set(Some(cancel.clone()));

        while self.playback_events.try_recv().is_ok() {}
        self.push_history(ChatMessage::user(user_text));

        tracing::info!(turn = %turn.id(), user_text, "turn started");

        let (mut dispatcher, mut deliveries) = match &self.backends.synthesizer {
            Some(synthesizer) => {
                let (dispatcher, deliveries) = SynthesisDispatcher::new(
                    Arc::clone(synthesizer),
                    self.playback.sample_rate(),
                    cancel.clone(),
                );
                (Some(dispatcher), Some(deliveries))
            }
            None => (None, None),
        };

        let mut generation = self.start_generation();
        let mut segmenter = Segmenter::new();
        let mut failure: Option<String> = None;
        let mut generating = true;
        let mut flushed = false;
        let mut delivering = deliveries.is_some();
        let mut interrupted: Option<Interrupt> = None;

        while generating || delivering {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    interrupted = Some(Interrupt::Cancelled);
                    break;
                }
                Some(event) = speech.recv() => {
                    if self.is_barge_in(&event, &turn) {
                        interrupted = Some(Interrupt::BargeIn);
                        break;
                    }
                }
                Some(event) = self.playback_events.recv() => {
                    if matches!(event, PlaybackEvent::Started { .. }) {
                        turn.audio_started();
                    }
                }
                delivery = recv_delivery(&mut deliveries), if delivering => match delivery {
                    Some(delivery) => self.deliver(&mut turn, delivery),
                    None => delivering = false,
                },
                item = generation.next(), if generating => match item {
                    Some(Ok(delta)) => {
                        turn.push_text(&delta.text);
                        self.emit(TurnEvent::Delta(delta.text.clone()));
                        for fragment in segmenter.push(&delta.text) {
                            self.submit(&mut turn, dispatcher.as_mut(), fragment);
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(turn = %turn.id(), error = %e, "generation failed");
                        failure = Some(e.to_string());
                        generating = false;
                    }
                    None => generating = false,
                },
            }

            if !generating && !flushed {
                flushed = true;
                turn.generation_finished();
                if let Some(fragment) = segmenter.finish() {
                    self.submit(&mut turn, dispatcher.as_mut(), fragment);
                }
                if let Some(dispatcher) = dispatcher.as_mut() {
                    dispatcher.close();
                }
            }
        }

        if interrupted.is_none() && turn.audio_fragments() > 0 {
            interrupted = self.wait_for_playback(&mut turn, &cancel, speech).await;
        }

        if let Some(reason) = &interrupted {
            turn.cancel();
            self.playback.interrupt();
            match reason {
                Interrupt::BargeIn => tracing::info!(turn = %turn.id(), "barge-in, turn interrupted"),
                Interrupt::Cancelled => tracing::info!(turn = %turn.id(), "turn cancelled"),
            }
        }

        let stats = match dispatcher {
            Some(dispatcher) => dispatcher.drain().await,
            None => DispatchStats::default(),
        };

        let outcome = match (interrupted, failure) {
            (Some(_), _) => TurnOutcome::Interrupted,
            (None, Some(error)) => TurnOutcome::Failed(error),
            (None, None) => TurnOutcome::Completed,
        };

        self.aborter.set(None);
        self.finish(turn, outcome, &stats)
    }

    /// Wait for queued audio to play out, still watching for barge-in
    async fn wait_for_playback(
        &mut self,
        turn: &mut Turn,
        cancel: &CancellationToken,
        speech: &mut mpsc::UnboundedReceiver<SpeechEvent>,
    ) -> Option<Interrupt> {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Some(Interrupt::Cancelled),
                Some(event) = speech.recv() => {
                    if self.is_barge_in(&event, turn) {
                        return Some(Interrupt::BargeIn);
                    }
                }
                Some(event) = self.playback_events.recv() => {
                    if matches!(event, PlaybackEvent::Started { .. }) {
                        turn.audio_started();
                    }
                }
                () = self.playback.wait_idle() => return None,
            }
        }
    }

    /// Whether `event` should cut the running turn
    ///
    /// Only a `SpeechStart` detected after the turn began counts.
    fn is_barge_in(&self, event: &SpeechEvent, turn: &Turn) -> bool {
        if !event.is_start() || event.at < turn.started() {
            return false;
        }
        if !self.config.barge_in {
            tracing::trace!(turn = %turn.id(), "speech during reply ignored, barge-in off");
            return false;
        }
        true
    }

    /// Start the generation stream for the current history
    ///
    /// The initial request runs inside the stream so it can be abandoned
    /// like any other part of generation.
    fn start_generation(&self) -> TextStream {
        let generator = Arc::clone(&self.backends.generator);
        let system_prompt = self.config.system_prompt.clone();
        let history: Vec<ChatMessage> = self.history.iter().cloned().collect();

        Box::pin(
            stream::once(async move { generator.generate(&system_prompt, &history).await })
                .flat_map(|started| match started {
                    Ok(deltas) => deltas,
                    Err(e) => Box::pin(stream::iter([Err(e)])) as TextStream,
                }),
        )
    }

    fn submit(
        &self,
        turn: &mut Turn,
        dispatcher: Option<&mut SynthesisDispatcher>,
        fragment: SentenceFragment,
    ) {
        tracing::debug!(seq = fragment.seq, text = %fragment.text, "sentence ready");
        self.emit(TurnEvent::Sentence(fragment.clone()));
        turn.push_fragment(fragment.clone());

        if let Some(dispatcher) = dispatcher {
            dispatcher.submit(fragment);
        }
    }

    fn deliver(&self, turn: &mut Turn, delivery: Delivery) {
        if turn.is_cancelled() {
            return;
        }

        match delivery {
            Delivery::Audio(fragment) => {
                let seq = fragment.seq;
                match self.playback.enqueue_decoded(fragment) {
                    Ok(()) => {
                        turn.audio_queued();
                        self.emit(TurnEvent::AudioQueued { seq });
                    }
                    Err(e) => tracing::warn!(seq, error = %e, "fragment not queued"),
                }
            }
            Delivery::Failed { seq, error } => {
                turn.fragment_failed();
                self.emit(TurnEvent::FragmentFailed { seq, error });
            }
        }
    }

    fn finish(&mut self, turn: Turn, outcome: TurnOutcome, stats: &DispatchStats) -> TurnSummary {
        let providers = ProviderIds {
            stt: self
                .backends
                .transcriber
                .as_ref()
                .map(|t| t.name().to_string()),
            llm: self.backends.generator.name().to_string(),
            tts: self
                .backends
                .synthesizer
                .as_ref()
                .map_or_else(|| "none".to_string(), |s| s.name().to_string()),
        };

        let summary = turn.finish(outcome, stats.synthesis, providers);

        if !summary.assistant_text.is_empty() {
            self.push_history(ChatMessage::assistant(summary.assistant_text.clone()));
        }

        tracing::info!(
            turn = %summary.id,
            outcome = %summary.outcome,
            sentences = summary.sentences,
            audio = summary.audio_fragments,
            failed = summary.failed_fragments,
            first_token_ms = millis(summary.timings.first_token),
            generation_ms = millis(summary.timings.generation),
            synthesis_ms = summary.timings.synthesis.as_millis(),
            first_audio_ms = millis(summary.timings.first_audio),
            total_ms = summary.timings.total.as_millis(),
            "turn finished"
        );

        if let Some(sink) = &self.sink
            && let Err(e) = sink.record(&summary)
        {
            tracing::warn!(turn = %summary.id, error = %e, "failed to record turn");
        }

        self.emit(TurnEvent::Finished(summary.clone()));
        summary
    }

    fn push_history(&mut self, message: ChatMessage) {
        self.history.push_back(message);
        while self.history.len() > self.config.history_limit.max(1) {
            self.history.pop_front();
        }
    }

    fn emit(&self, event: TurnEvent) {
        if let Some(events) = &self.events {
            // Observer gone is fine
            let _ = events.send(event);
        }
    }
}

/// Receive from an optional delivery channel, pending forever when absent
async fn recv_delivery(deliveries: &mut Option<mpsc::UnboundedReceiver<Delivery>>) -> Option<Delivery> {
    match deliveries {
        Some(deliveries) => deliveries.recv().await,
        None => std::future::pending().await,
    }
}

fn millis(duration: Option<Duration>) -> Option<u128> {
    duration.map(|d| d.as_millis())
}
