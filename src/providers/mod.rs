//! Transcription, generation and synthesis backends
//!
//! Each concern has one trait and one concrete client whose provider is a
//! closed enum. The kind is chosen from configuration once, when the
//! [`Backends`] are resolved; after that every call goes straight to the
//! selected provider.

mod llm;
mod stt;
mod tts;

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

pub use llm::{ChatClient, ChatMessage, ChatRole, SseEvent, parse_sse_line};
pub use stt::SpeechToText;
pub use tts::{CartesiaOptions, GoogleVoiceOptions, TextToSpeech, VoiceOptions};

use crate::config::Config;
use crate::pipeline::{Backends, TextDelta};
use crate::voice::AudioFormat;
use crate::{Error, Result};

/// Lazily produced reply text
pub type TextStream = Pin<Box<dyn Stream<Item = Result<TextDelta>> + Send>>;

/// Audio returned by a synthesis backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedAudio {
    /// Payload encoding
    pub format: AudioFormat,
    /// Encoded payload
    pub bytes: Vec<u8>,
}

/// Speech-to-text backend
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Provider identifier for logs and the conversation log
    fn name(&self) -> &str;

    /// Transcribe a 16-bit mono WAV payload
    async fn transcribe(&self, wav: &[u8]) -> Result<String>;
}

/// Streaming text generation backend
#[async_trait]
pub trait Generator: Send + Sync {
    /// Provider identifier for logs and the conversation log
    fn name(&self) -> &str;

    /// Start generating a reply to `history`
    ///
    /// Errors before the first delta are returned directly; errors after it
    /// arrive as an `Err` item and end the stream.
    async fn generate(&self, system_prompt: &str, history: &[ChatMessage]) -> Result<TextStream>;
}

/// Text-to-speech backend
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Provider identifier for logs and the conversation log
    fn name(&self) -> &str;

    /// Synthesize one sentence
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio>;
}

macro_rules! provider_kind {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($(#[$vmeta])* #[serde(rename = $label)] $variant),+
        }

        impl $name {
            /// Configuration label
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($label => Ok(Self::$variant),)+
                    other => Err(Error::Config(format!(
                        concat!("unknown ", stringify!($name), " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

provider_kind!(
    /// Transcription provider
    SttKind {
        /// `OpenAI` Whisper
        Whisper => "whisper",
        /// Deepgram prerecorded
        Deepgram => "deepgram",
    }
);

provider_kind!(
    /// Generation provider
    LlmKind {
        /// Groq (`OpenAI`-compatible)
        Groq => "groq",
        /// `OpenAI` chat completions
        OpenAi => "openai",
        /// Anthropic messages
        Anthropic => "anthropic",
    }
);

provider_kind!(
    /// Synthesis provider
    TtsKind {
        /// `OpenAI` speech
        OpenAi => "openai",
        /// Deepgram Aura
        Deepgram => "deepgram",
        /// Cartesia Sonic
        Cartesia => "cartesia",
        /// Google Cloud text-to-speech
        Google => "google",
        /// `ElevenLabs`
        ElevenLabs => "elevenlabs",
        /// Self-hosted HTTP endpoint
        SelfHosted => "selfhosted",
        /// Text only, no synthesis
        None => "none",
    }
);

/// Copy a key out of configuration, failing if it is missing or blank
fn require_key(key: Option<&SecretString>, what: &str) -> Result<SecretString> {
    match key {
        Some(key) if !key.expose_secret().trim().is_empty() => {
            Ok(SecretString::from(key.expose_secret().to_owned()))
        }
        _ => Err(Error::Config(format!("{what} API key required"))),
    }
}

/// Build the configured backends
///
/// # Errors
///
/// Returns error if a selected provider is missing its credentials or
/// endpoint
pub fn resolve_backends(config: &Config) -> Result<Backends> {
    let providers = &config.providers;
    let keys = &config.api_keys;

    let stt_key = match providers.stt {
        SttKind::Whisper => require_key(keys.openai.as_ref(), "OpenAI")?,
        SttKind::Deepgram => require_key(keys.deepgram.as_ref(), "Deepgram")?,
    };
    let transcriber = SpeechToText::new(providers.stt, stt_key, providers.stt_model.clone());

    let llm_key = match providers.llm {
        LlmKind::Groq => require_key(keys.groq.as_ref(), "Groq")?,
        LlmKind::OpenAi => require_key(keys.openai.as_ref(), "OpenAI")?,
        LlmKind::Anthropic => require_key(keys.anthropic.as_ref(), "Anthropic")?,
    };
    let generator = ChatClient::new(providers.llm, llm_key, providers.llm_model.clone());

    let synthesizer = resolve_synthesizer(config)?;

    tracing::info!(
        stt = %providers.stt,
        llm = %providers.llm,
        tts = %providers.tts,
        "providers resolved"
    );

    Ok(Backends {
        transcriber: Some(Arc::new(transcriber)),
        generator: Arc::new(generator),
        synthesizer,
    })
}

/// Build the configured synthesizer, `None` in text-only mode
///
/// # Errors
///
/// Returns error if the selected provider is missing its credentials or
/// endpoint
pub fn resolve_synthesizer(config: &Config) -> Result<Option<Arc<dyn Synthesizer>>> {
    let providers = &config.providers;
    let keys = &config.api_keys;

    let key = match providers.tts {
        TtsKind::None => return Ok(None),
        TtsKind::SelfHosted => None,
        TtsKind::OpenAi => Some(require_key(keys.openai.as_ref(), "OpenAI")?),
        TtsKind::Deepgram => Some(require_key(keys.deepgram.as_ref(), "Deepgram")?),
        TtsKind::Cartesia => Some(require_key(keys.cartesia.as_ref(), "Cartesia")?),
        TtsKind::Google => Some(require_key(keys.google_tts.as_ref(), "Google TTS")?),
        TtsKind::ElevenLabs => Some(require_key(keys.elevenlabs.as_ref(), "ElevenLabs")?),
    };

    Ok(Some(Arc::new(TextToSpeech::new(
        providers.tts,
        key,
        config.voice.clone(),
        providers.tts_self_hosted_url.as_deref(),
    )?)))
}
