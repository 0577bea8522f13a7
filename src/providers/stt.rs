//! Speech-to-text clients

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use super::{SttKind, Transcriber};
use crate::{Error, Result};

/// Transcribes recorded utterances with one batch request each
pub struct SpeechToText {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    kind: SttKind,
}

impl SpeechToText {
    /// Create a client for `kind`, using the provider's default model when
    /// `model` is `None`
    #[must_use]
    pub fn new(kind: SttKind, api_key: SecretString, model: Option<String>) -> Self {
        let model = model.unwrap_or_else(|| {
            match kind {
                SttKind::Whisper => "whisper-1",
                SttKind::Deepgram => "nova-2",
            }
            .to_string()
        });

        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            kind,
        }
    }

    fn request(&self, wav: &[u8]) -> Result<reqwest::RequestBuilder> {
        let request = match self.kind {
            SttKind::Whisper => {
                let file = reqwest::multipart::Part::bytes(wav.to_vec())
                    .file_name("utterance.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?;
                let form = reqwest::multipart::Form::new()
                    .part("file", file)
                    .text("model", self.model.clone());

                self.client
                    .post("https://api.openai.com/v1/audio/transcriptions")
                    .bearer_auth(self.api_key.expose_secret())
                    .multipart(form)
            }
            SttKind::Deepgram => self
                .client
                .post("https://api.deepgram.com/v1/listen")
                .query(&[("model", self.model.as_str()), ("punctuate", "true")])
                .header(
                    reqwest::header::AUTHORIZATION,
                    format!("Token {}", self.api_key.expose_secret()),
                )
                .header(reqwest::header::CONTENT_TYPE, "audio/wav")
                .body(wav.to_vec()),
        };
        Ok(request)
    }
}

/// Pull the transcript out of a provider response body
///
/// A well-formed response with no alternatives is an empty transcript.
fn transcript_from(kind: SttKind, body: &Value) -> Option<String> {
    match kind {
        SttKind::Whisper => body.get("text")?.as_str().map(str::to_string),
        SttKind::Deepgram => {
            let channels = body.pointer("/results/channels")?.as_array()?;
            Some(
                channels
                    .first()
                    .and_then(|c| c.pointer("/alternatives/0/transcript"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            )
        }
    }
}

#[async_trait]
impl Transcriber for SpeechToText {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    async fn transcribe(&self, wav: &[u8]) -> Result<String> {
        tracing::debug!(provider = %self.kind, audio_bytes = wav.len(), "transcribing");

        let response = self.request(wav)?.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(provider = %self.kind, %status, "transcription failed");
            return Err(Error::Stt(format!("{} API error {status}: {body}", self.kind)));
        }

        let body: Value = response.json().await?;
        let transcript = transcript_from(self.kind, &body)
            .ok_or_else(|| Error::Stt(format!("{} response has no transcript", self.kind)))?;

        let transcript = transcript.trim().to_string();
        tracing::info!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_default_models() {
        let key = || SecretString::from("k".to_string());
        assert_eq!(SpeechToText::new(SttKind::Whisper, key(), None).model, "whisper-1");
        assert_eq!(SpeechToText::new(SttKind::Deepgram, key(), None).model, "nova-2");
        assert_eq!(
            SpeechToText::new(SttKind::Deepgram, key(), Some("nova-3".to_string())).name(),
            "deepgram"
        );
    }

    #[test]
    fn test_transcript_extraction() {
        let whisper = json!({ "text": " turn it up " });
        assert_eq!(
            transcript_from(SttKind::Whisper, &whisper).as_deref(),
            Some(" turn it up ")
        );

        let deepgram = json!({
            "results": { "channels": [{ "alternatives": [{ "transcript": "hi", "confidence": 0.9 }] }] }
        });
        assert_eq!(transcript_from(SttKind::Deepgram, &deepgram).as_deref(), Some("hi"));

        let silent = json!({ "results": { "channels": [] } });
        assert_eq!(transcript_from(SttKind::Deepgram, &silent).as_deref(), Some(""));

        assert_eq!(transcript_from(SttKind::Whisper, &json!({ "error": "x" })), None);
    }
}
