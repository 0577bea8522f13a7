//! Shared test utilities
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;

use duplex_voice::pipeline::{Backends, TextDelta};
use duplex_voice::providers::{
    ChatMessage, Generator, SynthesizedAudio, Synthesizer, TextStream, Transcriber,
};
use duplex_voice::voice::{AudioFormat, AudioFragment, PLAYBACK_SAMPLE_RATE, Renderer};
use duplex_voice::{DbPool, Error, Result, db};

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Raw PCM fragment of `samples` samples at the playback rate
#[must_use]
pub fn pcm_fragment(seq: u64, samples: usize) -> AudioFragment {
    AudioFragment {
        seq,
        format: AudioFormat::Pcm16 {
            sample_rate: PLAYBACK_SAMPLE_RATE,
        },
        bytes: pcm_bytes(samples),
    }
}

fn pcm_bytes(samples: usize) -> Vec<u8> {
    std::iter::repeat_n(8192_i16.to_le_bytes(), samples)
        .flatten()
        .collect()
}

/// Pull samples through a headless queue in the background, like a device
pub fn drive(renderer: Renderer) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0.0; 240];
        loop {
            renderer.render(&mut buf, 1);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
}

/// Generator that replays a fixed list of deltas
pub struct ScriptedGenerator {
    deltas: Vec<String>,
    delay: Duration,
    fail_after: Option<usize>,
    fail_on_start: bool,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedGenerator {
    pub fn new(deltas: &[&str]) -> Self {
        Self {
            deltas: deltas.iter().map(ToString::to_string).collect(),
            delay: Duration::ZERO,
            fail_after: None,
            fail_on_start: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Pause before each delta
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// End the stream with an error after `n` deltas
    #[must_use]
    pub const fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Reject the request outright
    #[must_use]
    pub const fn failing_on_start(mut self) -> Self {
        self.fail_on_start = true;
        self
    }

    /// Histories passed to each call
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, _system_prompt: &str, history: &[ChatMessage]) -> Result<TextStream> {
        self.calls.lock().unwrap().push(history.to_vec());
        if self.fail_on_start {
            return Err(Error::Llm("rate limited".to_string()));
        }

        let delay = self.delay;
        let take = self.fail_after.unwrap_or(self.deltas.len());
        let mut items: Vec<Result<TextDelta>> = self
            .deltas
            .iter()
            .take(take)
            .enumerate()
            .map(|(i, text)| {
                Ok(TextDelta {
                    index: i as u64,
                    text: text.clone(),
                })
            })
            .collect();
        if self.fail_after.is_some() {
            items.push(Err(Error::Llm("connection reset".to_string())));
        }

        Ok(Box::pin(futures::stream::iter(items).then(move |item| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            item
        })))
    }
}

/// Synthesizer with per-sentence latency and failures
///
/// Sentences not listed take `default_delay`. Output is PCM at the playback
/// rate, `samples` samples long.
pub struct ScriptedSynthesizer {
    delays: HashMap<String, Duration>,
    default_delay: Duration,
    failing: Vec<String>,
    panicking: Vec<String>,
    garbled: Vec<String>,
    samples: usize,
    started: Mutex<Vec<String>>,
}

impl ScriptedSynthesizer {
    pub fn new() -> Self {
        Self {
            delays: HashMap::new(),
            default_delay: Duration::ZERO,
            failing: Vec::new(),
            panicking: Vec::new(),
            garbled: Vec::new(),
            samples: 480,
            started: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_delay(mut self, text: &str, delay: Duration) -> Self {
        self.delays.insert(text.to_string(), delay);
        self
    }

    #[must_use]
    pub const fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    #[must_use]
    pub fn failing_on(mut self, text: &str) -> Self {
        self.failing.push(text.to_string());
        self
    }

    /// Panic instead of returning for `text`
    #[must_use]
    pub fn panicking_on(mut self, text: &str) -> Self {
        self.panicking.push(text.to_string());
        self
    }

    /// Return an MP3 payload that can't be decoded for `text`
    #[must_use]
    pub fn garbled_on(mut self, text: &str) -> Self {
        self.garbled.push(text.to_string());
        self
    }

    #[must_use]
    pub const fn with_samples(mut self, samples: usize) -> Self {
        self.samples = samples;
        self
    }

    /// Sentences in the order synthesis started
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl Synthesizer for ScriptedSynthesizer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
        self.started.lock().unwrap().push(text.to_string());

        let delay = self.delays.get(text).copied().unwrap_or(self.default_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.failing.iter().any(|f| f == text) {
            return Err(Error::Tts(format!("voice unavailable for '{text}'")));
        }
        if self.panicking.iter().any(|p| p == text) {
            panic!("voice model crashed on '{text}'");
        }
        if self.garbled.iter().any(|g| g == text) {
            return Ok(SynthesizedAudio {
                format: AudioFormat::Mp3,
                bytes: vec![0x13, 0x37, 0x00],
            });
        }

        Ok(SynthesizedAudio {
            format: AudioFormat::Pcm16 {
                sample_rate: PLAYBACK_SAMPLE_RATE,
            },
            bytes: pcm_bytes(self.samples),
        })
    }
}

/// Transcriber returning a fixed transcript
pub struct FixedTranscriber(pub &'static str);

#[async_trait]
impl Transcriber for FixedTranscriber {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn transcribe(&self, wav: &[u8]) -> Result<String> {
        if wav.len() <= 44 {
            return Err(Error::Stt("empty audio".to_string()));
        }
        Ok(self.0.to_string())
    }
}

/// Backends built from test doubles
pub fn backends(
    generator: Arc<ScriptedGenerator>,
    synthesizer: Option<Arc<ScriptedSynthesizer>>,
) -> Backends {
    Backends {
        transcriber: Some(Arc::new(FixedTranscriber("hello there"))),
        generator,
        synthesizer: synthesizer.map(|s| s as Arc<dyn Synthesizer>),
    }
}

/// Collect every item of a stream
pub async fn collect<S: futures::Stream + Unpin>(stream: S) -> Vec<S::Item> {
    stream.collect().await
}
