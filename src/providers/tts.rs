//! Text-to-speech clients

use async_trait::async_trait;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{SynthesizedAudio, Synthesizer, TtsKind};
use crate::voice::AudioFormat;
use crate::{Error, Result};

/// Cartesia API version header value
const CARTESIA_VERSION: &str = "2025-04-16";

/// Sample rate requested from providers that let us choose
const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Cartesia generation options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CartesiaOptions {
    /// Voice identifier
    pub voice_id: String,
    /// Model identifier
    pub model: String,
    /// Speaking rate (1.0 is normal)
    pub speed: f32,
    /// Emotion controls, e.g. `positivity:high`
    pub emotion: Vec<String>,
}

impl Default for CartesiaOptions {
    fn default() -> Self {
        Self {
            voice_id: "95d51f79-c397-46f9-b49a-23763d3eaa2d".to_string(),
            model: "sonic-3".to_string(),
            speed: 1.0,
            emotion: Vec::new(),
        }
    }
}

/// Google Cloud voice selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoogleVoiceOptions {
    /// Voice name, e.g. `en-IN-Standard-A`
    pub voice_name: String,
    /// Language code; derived from the voice name when unset
    pub language_code: Option<String>,
}

impl Default for GoogleVoiceOptions {
    fn default() -> Self {
        Self {
            voice_name: "en-IN-Standard-A".to_string(),
            language_code: None,
        }
    }
}

impl GoogleVoiceOptions {
    /// Language code to send with the request
    #[must_use]
    pub fn language(&self) -> String {
        self.language_code.clone().unwrap_or_else(|| {
            self.voice_name
                .splitn(3, '-')
                .take(2)
                .collect::<Vec<_>>()
                .join("-")
        })
    }
}

/// Per-provider voice settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceOptions {
    /// `OpenAI` voice
    pub openai_voice: String,
    /// `OpenAI` TTS model
    pub openai_model: String,
    /// `OpenAI` speaking rate
    pub openai_speed: f32,
    /// Deepgram Aura voice model
    pub deepgram_voice: String,
    /// Cartesia settings
    pub cartesia: CartesiaOptions,
    /// Google settings
    pub google: GoogleVoiceOptions,
    /// `ElevenLabs` voice identifier
    pub elevenlabs_voice_id: String,
    /// `ElevenLabs` model
    pub elevenlabs_model: String,
}

impl Default for VoiceOptions {
    fn default() -> Self {
        Self {
            openai_voice: "nova".to_string(),
            openai_model: "tts-1".to_string(),
            openai_speed: 1.0,
            deepgram_voice: "aura-2-asteria-en".to_string(),
            cartesia: CartesiaOptions::default(),
            google: GoogleVoiceOptions::default(),
            elevenlabs_voice_id: "21m00Tcm4TlvDq8ikWAM".to_string(),
            elevenlabs_model: "eleven_monolingual_v1".to_string(),
        }
    }
}

#[derive(Deserialize)]
struct GoogleResponse {
    #[serde(rename = "audioContent")]
    audio_content: String,
}

/// Synthesizes speech from text
pub struct TextToSpeech {
    client: reqwest::Client,
    kind: TtsKind,
    api_key: Option<SecretString>,
    options: VoiceOptions,
    endpoint: Option<url::Url>,
}

impl TextToSpeech {
    /// Create a client for `kind`
    ///
    /// `api_key` is required for hosted providers, `self_hosted_url` for
    /// [`TtsKind::SelfHosted`].
    ///
    /// # Errors
    ///
    /// Returns error for [`TtsKind::None`], a missing key or a missing or
    /// invalid endpoint
    pub fn new(
        kind: TtsKind,
        api_key: Option<SecretString>,
        options: VoiceOptions,
        self_hosted_url: Option<&str>,
    ) -> Result<Self> {
        let endpoint = match kind {
            TtsKind::None => {
                return Err(Error::Config("text-only mode has no synthesizer".to_string()));
            }
            TtsKind::SelfHosted => {
                let base = self_hosted_url.ok_or_else(|| {
                    Error::Config("self-hosted TTS requires providers.tts_self_hosted_url".to_string())
                })?;
                let endpoint = url::Url::parse(&format!("{}/tts", base.trim_end_matches('/')))
                    .map_err(|e| Error::Config(format!("invalid self-hosted TTS URL: {e}")))?;
                Some(endpoint)
            }
            _ => {
                if api_key.is_none() {
                    return Err(Error::Config(format!("{kind} TTS requires an API key")));
                }
                None
            }
        };

        Ok(Self {
            client: reqwest::Client::new(),
            kind,
            api_key,
            options,
            endpoint,
        })
    }

    fn key(&self) -> Result<&str> {
        self.api_key
            .as_ref()
            .map(|key| key.expose_secret())
            .ok_or_else(|| Error::Tts(format!("{} API key missing", self.kind)))
    }

    /// Body for the Cartesia bytes endpoint
    fn cartesia_body(&self, text: &str) -> serde_json::Value {
        let options = &self.options.cartesia;
        let mut body = json!({
            "transcript": text,
            "model_id": options.model,
            "voice": { "mode": "id", "id": options.voice_id },
            "output_format": {
                "container": "wav",
                "sample_rate": OUTPUT_SAMPLE_RATE,
                "encoding": "pcm_s16le",
            },
        });

        let mut generation = serde_json::Map::new();
        if (options.speed - 1.0).abs() > f32::EPSILON {
            generation.insert("speed".to_string(), json!(options.speed));
        }
        if !options.emotion.is_empty() {
            generation.insert("emotion".to_string(), json!(options.emotion));
        }
        if !generation.is_empty() {
            body["generation_config"] = serde_json::Value::Object(generation);
        }

        body
    }

    fn request(&self, text: &str) -> Result<reqwest::RequestBuilder> {
        let options = &self.options;

        let request = match self.kind {
            TtsKind::OpenAi => self
                .client
                .post("https://api.openai.com/v1/audio/speech")
                .bearer_auth(self.key()?)
                .json(&json!({
                    "model": options.openai_model,
                    "input": text,
                    "voice": options.openai_voice,
                    "speed": options.openai_speed,
                    "response_format": "mp3",
                })),
            TtsKind::Deepgram => self
                .client
                .post("https://api.deepgram.com/v1/speak")
                .query(&[("model", options.deepgram_voice.as_str()), ("encoding", "mp3")])
                .header("Authorization", format!("Token {}", self.key()?))
                .json(&json!({ "text": text })),
            TtsKind::Cartesia => self
                .client
                .post("https://api.cartesia.ai/tts/bytes")
                .header("X-API-Key", self.key()?)
                .header("Cartesia-Version", CARTESIA_VERSION)
                .json(&self.cartesia_body(text)),
            TtsKind::Google => self
                .client
                .post("https://texttospeech.googleapis.com/v1/text:synthesize")
                .query(&[("key", self.key()?)])
                .json(&json!({
                    "input": { "text": text },
                    "voice": {
                        "languageCode": options.google.language(),
                        "name": options.google.voice_name,
                    },
                    "audioConfig": {
                        "audioEncoding": "MP3",
                        "sampleRateHertz": OUTPUT_SAMPLE_RATE,
                    },
                })),
            TtsKind::ElevenLabs => self
                .client
                .post(format!(
                    "https://api.elevenlabs.io/v1/text-to-speech/{}",
                    options.elevenlabs_voice_id
                ))
                .header("xi-api-key", self.key()?)
                .json(&json!({
                    "text": text,
                    "model_id": options.elevenlabs_model,
                })),
            TtsKind::SelfHosted => {
                let endpoint = self
                    .endpoint
                    .clone()
                    .ok_or_else(|| Error::Tts("self-hosted endpoint missing".to_string()))?;
                self.client
                    .post(endpoint)
                    .json(&json!({ "text": text, "language": "English" }))
            }
            TtsKind::None => return Err(Error::Tts("text-only mode".to_string())),
        };

        Ok(request)
    }

    const fn format(&self) -> AudioFormat {
        match self.kind {
            TtsKind::Cartesia | TtsKind::SelfHosted => AudioFormat::Wav,
            _ => AudioFormat::Mp3,
        }
    }
}

#[async_trait]
impl Synthesizer for TextToSpeech {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
        let response = self.request(text)?.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("{} TTS error {status}: {body}", self.kind)));
        }

        let bytes = if self.kind == TtsKind::Google {
            let body: GoogleResponse = response.json().await?;
            base64::engine::general_purpose::STANDARD
                .decode(body.audio_content)
                .map_err(|e| Error::Tts(format!("invalid audioContent: {e}")))?
        } else {
            response.bytes().await?.to_vec()
        };

        tracing::debug!(
            provider = %self.kind,
            chars = text.len(),
            audio_bytes = bytes.len(),
            "speech synthesized"
        );

        Ok(SynthesizedAudio {
            format: self.format(),
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Option<SecretString> {
        Some(SecretString::from("k".to_string()))
    }

    #[test]
    fn test_google_language_from_voice_name() {
        let options = GoogleVoiceOptions::default();
        assert_eq!(options.language(), "en-IN");

        let explicit = GoogleVoiceOptions {
            voice_name: "en-US-Wavenet-D".to_string(),
            language_code: Some("en-GB".to_string()),
        };
        assert_eq!(explicit.language(), "en-GB");
    }

    #[test]
    fn test_cartesia_generation_config_only_when_needed() {
        let tts = TextToSpeech::new(TtsKind::Cartesia, key(), VoiceOptions::default(), None).unwrap();
        let body = tts.cartesia_body("hi");
        assert!(body.get("generation_config").is_none());
        assert_eq!(body["output_format"]["container"], "wav");

        let mut options = VoiceOptions::default();
        options.cartesia.speed = 1.2;
        options.cartesia.emotion = vec!["positivity:high".to_string()];
        let tts = TextToSpeech::new(TtsKind::Cartesia, key(), options, None).unwrap();
        let body = tts.cartesia_body("hi");
        assert_eq!(body["generation_config"]["emotion"][0], "positivity:high");
    }

    #[test]
    fn test_construction_requirements() {
        assert!(TextToSpeech::new(TtsKind::None, key(), VoiceOptions::default(), None).is_err());
        assert!(TextToSpeech::new(TtsKind::OpenAi, None, VoiceOptions::default(), None).is_err());
        assert!(TextToSpeech::new(TtsKind::SelfHosted, None, VoiceOptions::default(), None).is_err());

        let tts = TextToSpeech::new(
            TtsKind::SelfHosted,
            None,
            VoiceOptions::default(),
            Some("http://localhost:8000/"),
        )
        .unwrap();
        assert_eq!(tts.endpoint.unwrap().as_str(), "http://localhost:8000/tts");
        assert_eq!(
            TextToSpeech::new(TtsKind::Google, key(), VoiceOptions::default(), None)
                .unwrap()
                .format(),
            AudioFormat::Mp3
        );
    }
}
