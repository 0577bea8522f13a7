//! TOML configuration file loading
//!
//! Supports `~/.config/duplex/config.toml` as a persistent config source.
//! Every field is optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::providers::VoiceOptions;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DuplexConfigFile {
    /// Capture gate tuning
    #[serde(default)]
    pub gate: GateFileConfig,

    /// Microphone capture
    #[serde(default)]
    pub capture: CaptureFileConfig,

    /// Speaker output
    #[serde(default)]
    pub playback: PlaybackFileConfig,

    /// Provider selection
    #[serde(default)]
    pub providers: ProvidersFileConfig,

    /// Per-provider voice options
    #[serde(default)]
    pub voice: Option<VoiceOptions>,

    /// Conversation behaviour
    #[serde(default)]
    pub conversation: ConversationFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,

    /// Directory for the conversation log
    pub data_dir: Option<String>,
}

/// `[gate]`
#[derive(Debug, Default, Deserialize)]
pub struct GateFileConfig {
    /// RMS threshold (0.0 - 1.0)
    pub threshold: Option<f32>,
    /// Loud frames before speech starts
    pub activation_frames: Option<u32>,
    /// Quiet frames before speech ends
    pub silence_frames: Option<u32>,
}

/// `[capture]`
#[derive(Debug, Default, Deserialize)]
pub struct CaptureFileConfig {
    pub sample_rate: Option<u32>,
    pub frame_size: Option<usize>,
}

/// `[playback]`
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    pub sample_rate: Option<u32>,
    /// Output gain (0.0 - 1.0)
    pub volume: Option<f32>,
}

/// `[providers]`
///
/// Kinds stay strings here so a typo is reported as a config error instead
/// of silently discarding the whole file.
#[derive(Debug, Default, Deserialize)]
pub struct ProvidersFileConfig {
    /// "whisper" or "deepgram"
    pub stt: Option<String>,
    /// "groq", "openai" or "anthropic"
    pub llm: Option<String>,
    /// "openai", "deepgram", "cartesia", "google", "elevenlabs", "selfhosted" or "none"
    pub tts: Option<String>,
    pub stt_model: Option<String>,
    pub llm_model: Option<String>,
    /// Base URL of a self-hosted TTS server
    pub tts_self_hosted_url: Option<String>,
}

/// `[conversation]`
#[derive(Debug, Default, Deserialize)]
pub struct ConversationFileConfig {
    pub system_prompt: Option<String>,
    /// Messages kept as generation context
    pub history_limit: Option<usize>,
    /// Write finished turns to the conversation log
    pub log: Option<bool>,
    /// Let user speech cut off the reply
    pub barge_in: Option<bool>,
}

/// `[api_keys]`
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub anthropic: Option<String>,
    pub groq: Option<String>,
    pub deepgram: Option<String>,
    pub cartesia: Option<String>,
    pub google_tts: Option<String>,
    pub elevenlabs: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `DuplexConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> DuplexConfigFile {
    config_file_path().map_or_else(DuplexConfigFile::default, |path| load_from(&path))
}

/// Load a config file from an explicit path, falling back to defaults
pub fn load_from(path: &Path) -> DuplexConfigFile {
    if !path.exists() {
        return DuplexConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match parse(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                DuplexConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            DuplexConfigFile::default()
        }
    }
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the TOML is malformed or has unknown sections
pub fn parse(content: &str) -> crate::Result<DuplexConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Return the config file path: `~/.config/duplex/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("duplex").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file() {
        let file = parse(
            r#"
            [gate]
            threshold = 0.02

            [providers]
            tts = "none"

            [voice]
            openai_voice = "alloy"
            "#,
        )
        .unwrap();

        assert_eq!(file.gate.threshold, Some(0.02));
        assert!(file.gate.silence_frames.is_none());
        assert_eq!(file.providers.tts.as_deref(), Some("none"));
        assert_eq!(file.voice.unwrap().openai_voice, "alloy");
    }

    #[test]
    fn test_unknown_section_rejected() {
        assert!(parse("[channels]\ndiscord = true\n").is_err());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let file = load_from(&dir.path().join("missing.toml"));
        assert!(file.providers.stt.is_none());
        assert!(file.data_dir.is_none());
    }
}
