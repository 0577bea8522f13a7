//! Configuration management for the duplex voice pipeline

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::pipeline::{CoordinatorConfig, DEFAULT_HISTORY_LIMIT};
use crate::providers::{LlmKind, SttKind, TtsKind, VoiceOptions};
use crate::voice::{
    FRAME_SIZE, GateConfig, ListenerConfig, PLAYBACK_SAMPLE_RATE, SAMPLE_RATE,
};
use crate::{Error, Result};

use self::file::DuplexConfigFile;

/// Default instructions for the assistant
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly voice assistant. \
Be concise and conversational. Keep responses to 2-3 sentences.";

/// Pipeline configuration
#[derive(Debug)]
pub struct Config {
    /// Capture gate tuning
    pub gate: GateConfig,

    /// Microphone capture
    pub capture: CaptureConfig,

    /// Speaker output
    pub playback: PlaybackConfig,

    /// Provider selection
    pub providers: ProvidersConfig,

    /// Per-provider voice options
    pub voice: VoiceOptions,

    /// Conversation behaviour
    pub conversation: ConversationConfig,

    /// API keys
    pub api_keys: ApiKeys,

    /// Path to data directory (conversation log)
    pub data_dir: PathBuf,
}

/// Microphone capture configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Capture sample rate in Hz
    pub sample_rate: u32,
    /// Samples per gate frame
    pub frame_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            frame_size: FRAME_SIZE,
        }
    }
}

/// Speaker output configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackConfig {
    /// Output sample rate in Hz
    pub sample_rate: u32,
    /// Output gain (0.0 - 1.0)
    pub volume: f32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: PLAYBACK_SAMPLE_RATE,
            volume: 1.0,
        }
    }
}

/// Provider selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvidersConfig {
    /// Transcription provider
    pub stt: SttKind,
    /// Generation provider
    pub llm: LlmKind,
    /// Synthesis provider (`none` for text-only replies)
    pub tts: TtsKind,
    /// STT model override
    pub stt_model: Option<String>,
    /// LLM model override
    pub llm_model: Option<String>,
    /// Base URL of a self-hosted TTS server
    pub tts_self_hosted_url: Option<String>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            stt: SttKind::Deepgram,
            llm: LlmKind::Groq,
            tts: TtsKind::Cartesia,
            stt_model: None,
            llm_model: None,
            tts_self_hosted_url: None,
        }
    }
}

/// Conversation behaviour
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationConfig {
    /// Instructions sent with every generation request
    pub system_prompt: String,
    /// Messages kept as generation context
    pub history_limit: usize,
    /// Write finished turns to the conversation log
    pub log: bool,
    /// Let user speech cut off the reply; off means half-duplex, where
    /// speech heard during a turn is ignored
    pub barge_in: bool,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            log: true,
            barge_in: true,
        }
    }
}

/// API keys for external services
#[derive(Debug, Default)]
pub struct ApiKeys {
    pub openai: Option<SecretString>,
    pub anthropic: Option<SecretString>,
    pub groq: Option<SecretString>,
    pub deepgram: Option<SecretString>,
    pub cartesia: Option<SecretString>,
    pub google_tts: Option<SecretString>,
    pub elevenlabs: Option<SecretString>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gate: GateConfig::default(),
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
            providers: ProvidersConfig::default(),
            voice: VoiceOptions::default(),
            conversation: ConversationConfig::default(),
            api_keys: ApiKeys::default(),
            data_dir: default_data_dir(),
        }
    }
}

/// Default data directory: `~/.local/share/duplex/`
fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".local/share/duplex"),
        |d| d.data_dir().join("duplex"),
    )
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if a provider name is unknown or a value is out of range
    pub fn load() -> Result<Self> {
        Self::from_sources(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a provider name is unknown or a value is out of range
    pub fn from_sources(
        fc: DuplexConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let default = Self::default();
        let env_str = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let gate = GateConfig {
            threshold: parse_env(&env, "DUPLEX_VAD_THRESHOLD")?
                .or(fc.gate.threshold)
                .unwrap_or(default.gate.threshold),
            activation_frames: parse_env(&env, "DUPLEX_VAD_ACTIVATION_FRAMES")?
                .or(fc.gate.activation_frames)
                .unwrap_or(default.gate.activation_frames),
            silence_frames: parse_env(&env, "DUPLEX_VAD_SILENCE_FRAMES")?
                .or(fc.gate.silence_frames)
                .unwrap_or(default.gate.silence_frames),
        };

        let capture = CaptureConfig {
            sample_rate: fc.capture.sample_rate.unwrap_or(default.capture.sample_rate),
            frame_size: fc.capture.frame_size.unwrap_or(default.capture.frame_size),
        };

        let playback = PlaybackConfig {
            sample_rate: fc.playback.sample_rate.unwrap_or(default.playback.sample_rate),
            volume: parse_env(&env, "DUPLEX_VOLUME")?
                .or(fc.playback.volume)
                .unwrap_or(default.playback.volume),
        };

        let providers = ProvidersConfig {
            stt: env_str("DUPLEX_STT_PROVIDER")
                .or(fc.providers.stt)
                .map_or(Ok(default.providers.stt), |s| s.parse())?,
            llm: env_str("DUPLEX_LLM_PROVIDER")
                .or(fc.providers.llm)
                .map_or(Ok(default.providers.llm), |s| s.parse())?,
            tts: env_str("DUPLEX_TTS_PROVIDER")
                .or(fc.providers.tts)
                .map_or(Ok(default.providers.tts), |s| s.parse())?,
            stt_model: env_str("DUPLEX_STT_MODEL").or(fc.providers.stt_model),
            llm_model: env_str("DUPLEX_LLM_MODEL").or(fc.providers.llm_model),
            tts_self_hosted_url: env_str("DUPLEX_TTS_URL").or(fc.providers.tts_self_hosted_url),
        };

        let conversation = ConversationConfig {
            system_prompt: env_str("DUPLEX_SYSTEM_PROMPT")
                .or(fc.conversation.system_prompt)
                .unwrap_or(default.conversation.system_prompt),
            history_limit: parse_env(&env, "DUPLEX_HISTORY_LIMIT")?
                .or(fc.conversation.history_limit)
                .unwrap_or(default.conversation.history_limit),
            log: parse_env(&env, "DUPLEX_LOG_CONVERSATIONS")?
                .or(fc.conversation.log)
                .unwrap_or(default.conversation.log),
            barge_in: parse_env(&env, "DUPLEX_BARGE_IN")?
                .or(fc.conversation.barge_in)
                .unwrap_or(default.conversation.barge_in),
        };

        // Load API keys (env > toml > None)
        let key = |var: &str, file: Option<String>| {
            env(var)
                .filter(|v| !v.trim().is_empty())
                .or(file)
                .map(SecretString::from)
        };
        let api_keys = ApiKeys {
            openai: key("OPENAI_API_KEY", fc.api_keys.openai),
            anthropic: key("ANTHROPIC_API_KEY", fc.api_keys.anthropic),
            groq: key("GROQ_API_KEY", fc.api_keys.groq),
            deepgram: key("DEEPGRAM_API_KEY", fc.api_keys.deepgram),
            cartesia: key("CARTESIA_API_KEY", fc.api_keys.cartesia),
            google_tts: key("GOOGLE_TTS_API_KEY", fc.api_keys.google_tts),
            elevenlabs: key("ELEVENLABS_API_KEY", fc.api_keys.elevenlabs),
        };

        let data_dir = env_str("DUPLEX_DATA_DIR")
            .or(fc.data_dir)
            .map_or(default.data_dir, PathBuf::from);

        let config = Self {
            gate,
            capture,
            playback,
            providers,
            voice: fc.voice.unwrap_or(default.voice),
            conversation,
            api_keys,
            data_dir,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        let threshold = self.gate.threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(Error::Config(format!(
                "gate threshold must be in (0, 1], got {threshold}"
            )));
        }
        if self.gate.activation_frames == 0 || self.gate.silence_frames == 0 {
            return Err(Error::Config(
                "gate activation and silence frame counts must be positive".to_string(),
            ));
        }
        if self.capture.sample_rate == 0 || self.playback.sample_rate == 0 {
            return Err(Error::Config("sample rates must be positive".to_string()));
        }
        if self.capture.frame_size == 0 {
            return Err(Error::Config("frame size must be positive".to_string()));
        }
        let volume = self.playback.volume;
        if !(0.0..=1.0).contains(&volume) {
            return Err(Error::Config(format!(
                "volume must be in [0, 1], got {volume}"
            )));
        }
        if self.providers.tts == TtsKind::SelfHosted && self.providers.tts_self_hosted_url.is_none() {
            return Err(Error::Config(
                "selfhosted TTS requires tts_self_hosted_url (DUPLEX_TTS_URL)".to_string(),
            ));
        }
        Ok(())
    }

    /// Listener settings derived from the gate and capture sections
    #[must_use]
    pub fn listener(&self) -> ListenerConfig {
        ListenerConfig {
            gate: self.gate,
            sample_rate: self.capture.sample_rate,
            frame_size: self.capture.frame_size,
            ..ListenerConfig::default()
        }
    }

    /// Coordinator settings derived from the conversation section
    #[must_use]
    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            system_prompt: self.conversation.system_prompt.clone(),
            history_limit: self.conversation.history_limit,
            barge_in: self.conversation.barge_in,
        }
    }

    /// Path of the conversation log database
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("conversations.db")
    }

    /// Gate silence window as wall-clock time
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn silence_window(&self) -> Duration {
        let frame_ms =
            self.capture.frame_size as u64 * 1000 / u64::from(self.capture.sample_rate.max(1));
        Duration::from_millis(frame_ms * u64::from(self.gate.silence_frames))
    }
}

/// Parse an optional environment value
fn parse_env<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("invalid value for {key}: '{value}'"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_sources(DuplexConfigFile::default(), env(&[])).unwrap();
        assert_eq!(config.gate, GateConfig::default());
        assert_eq!(config.providers.tts, TtsKind::Cartesia);
        assert_eq!(config.conversation.history_limit, DEFAULT_HISTORY_LIMIT);
        assert!(config.api_keys.groq.is_none());
    }

    #[test]
    fn test_env_overrides_file() {
        let fc = file::parse(
            r#"
            [providers]
            llm = "anthropic"

            [api_keys]
            groq = "from-file"
            "#,
        )
        .unwrap();
        let config = Config::from_sources(
            fc,
            env(&[("DUPLEX_LLM_PROVIDER", "groq"), ("GROQ_API_KEY", "from-env")]),
        )
        .unwrap();

        assert_eq!(config.providers.llm, LlmKind::Groq);
        assert_eq!(
            config.api_keys.groq.as_ref().map(|k| k.expose_secret().to_string()),
            Some("from-env".to_string())
        );
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = Config::from_sources(
            DuplexConfigFile::default(),
            env(&[("DUPLEX_TTS_PROVIDER", "polly")]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validate_ranges() {
        let mut config = Config::default();
        config.gate.threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.gate.silence_frames = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.playback.volume = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.providers.tts = TtsKind::SelfHosted;
        assert!(config.validate().is_err());
        config.providers.tts_self_hosted_url = Some("http://localhost:8000".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_barge_in_toggle() {
        let config = Config::from_sources(DuplexConfigFile::default(), env(&[])).unwrap();
        assert!(config.coordinator().barge_in);

        let fc = file::parse("[conversation]\nbarge_in = false\n").unwrap();
        let config = Config::from_sources(fc, env(&[])).unwrap();
        assert!(!config.coordinator().barge_in);

        let fc = file::parse("[conversation]\nbarge_in = false\n").unwrap();
        let config = Config::from_sources(fc, env(&[("DUPLEX_BARGE_IN", "true")])).unwrap();
        assert!(config.conversation.barge_in);

        let bad = Config::from_sources(
            DuplexConfigFile::default(),
            env(&[("DUPLEX_BARGE_IN", "maybe")]),
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_silence_window() {
        let config = Config::default();
        // 480 samples at 16 kHz = 30ms, 30 frames
        assert_eq!(config.silence_window(), Duration::from_millis(900));
    }
}
