//! Configuration layering tests

use std::collections::HashMap;
use std::path::PathBuf;

use duplex_voice::config::{Config, file};
use duplex_voice::providers::{LlmKind, SttKind, TtsKind, resolve_backends};
use duplex_voice::voice::GateConfig;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

const FILE: &str = r#"
data_dir = "/tmp/duplex-test"

[gate]
threshold = 0.03
activation_frames = 4
silence_frames = 20

[capture]
frame_size = 320

[playback]
volume = 0.5

[providers]
stt = "whisper"
llm = "openai"
tts = "none"
llm_model = "gpt-4o"

[conversation]
system_prompt = "You are a pirate."
history_limit = 6
log = false

[api_keys]
openai = "sk-test"
"#;

#[test]
fn test_file_values_applied() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, FILE).unwrap();

    let config = Config::from_sources(file::load_from(&path), env(&[])).unwrap();

    assert_eq!(
        config.gate,
        GateConfig {
            threshold: 0.03,
            activation_frames: 4,
            silence_frames: 20,
        }
    );
    assert_eq!(config.capture.frame_size, 320);
    assert!((config.playback.volume - 0.5).abs() < f32::EPSILON);
    assert_eq!(config.providers.stt, SttKind::Whisper);
    assert_eq!(config.providers.llm, LlmKind::OpenAi);
    assert_eq!(config.providers.tts, TtsKind::None);
    assert_eq!(config.providers.llm_model.as_deref(), Some("gpt-4o"));
    assert_eq!(config.conversation.system_prompt, "You are a pirate.");
    assert!(!config.conversation.log);
    assert_eq!(config.data_dir, PathBuf::from("/tmp/duplex-test"));

    let listener = config.listener();
    assert_eq!(listener.frame_size, 320);
    assert_eq!(listener.gate.activation_frames, 4);
    assert_eq!(config.coordinator().history_limit, 6);

    // Whisper, OpenAI and text-only all run on the one key
    let backends = resolve_backends(&config).unwrap();
    assert_eq!(backends.generator.name(), "openai");
    assert!(backends.synthesizer.is_none());
}

#[test]
fn test_env_beats_file() {
    let config = Config::from_sources(
        file::parse(FILE).unwrap(),
        env(&[
            ("DUPLEX_VAD_THRESHOLD", "0.05"),
            ("DUPLEX_TTS_PROVIDER", "openai"),
            ("DUPLEX_HISTORY_LIMIT", "2"),
            ("DUPLEX_DATA_DIR", "/var/lib/duplex"),
        ]),
    )
    .unwrap();

    assert!((config.gate.threshold - 0.05).abs() < f32::EPSILON);
    assert_eq!(config.gate.activation_frames, 4);
    assert_eq!(config.providers.tts, TtsKind::OpenAi);
    assert_eq!(config.conversation.history_limit, 2);
    assert_eq!(config.database_path(), PathBuf::from("/var/lib/duplex/conversations.db"));
}

#[test]
fn test_blank_env_values_ignored() {
    let config = Config::from_sources(
        file::parse(FILE).unwrap(),
        env(&[("DUPLEX_LLM_PROVIDER", "  "), ("OPENAI_API_KEY", "")]),
    )
    .unwrap();

    assert_eq!(config.providers.llm, LlmKind::OpenAi);
    assert!(config.api_keys.openai.is_some());
}

#[test]
fn test_invalid_values_rejected() {
    let bad_number = Config::from_sources(
        file::DuplexConfigFile::default(),
        env(&[("DUPLEX_VAD_SILENCE_FRAMES", "lots")]),
    );
    assert!(bad_number.is_err());

    let out_of_range = Config::from_sources(
        file::parse("[gate]\nthreshold = 2.0\n").unwrap(),
        env(&[]),
    );
    assert!(out_of_range.is_err());

    let unknown_kind = Config::from_sources(
        file::parse("[providers]\nstt = \"vosk\"\n").unwrap(),
        env(&[]),
    );
    assert!(unknown_kind.is_err());
}

#[test]
fn test_malformed_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[gate\nthreshold = ").unwrap();

    let config = Config::from_sources(file::load_from(&path), env(&[])).unwrap();
    assert_eq!(config.gate, GateConfig::default());
    assert_eq!(config.providers.tts, TtsKind::Cartesia);
}
