use super::{DialogueInput, SpeechContext, TtsClient, VoiceSettings};
use crate::core::error::DramaError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use url::Url;

fn default_base_url() -> String {
    "https://api.elevenlabs.io".to_string()
}
fn default_dialogue_model() -> String {
    "eleven_v3".to_string()
}
fn default_speech_model() -> String {
    "eleven_multilingual_v2".to_string()
}
fn default_output_format() -> String {
    "mp3_44100_128".to_string()
}
fn default_dialogue_char_limit() -> usize {
    2000
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ElevenLabsConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_dialogue_model")]
    pub dialogue_model: String,
    #[serde(default = "default_speech_model")]
    pub speech_model: String,
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default = "default_dialogue_char_limit")]
    pub dialogue_char_limit: usize,
    #[serde(default)]
    pub voice_settings: VoiceSettings,
}

pub struct ElevenLabsClient {
    config: ElevenLabsConfig,
    base_url: Url,
    client: reqwest::Client,
}

impl ElevenLabsClient {
    pub fn new(config: ElevenLabsConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| DramaError::Configuration(format!("Invalid ElevenLabs base_url: {}", e)))?;
        Ok(Self {
            config,
            base_url,
            client: reqwest::Client::new(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DramaError::Configuration("ElevenLabs base_url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        url.query_pairs_mut()
            .append_pair("output_format", &self.config.output_format);
        Ok(url)
    }

    async fn post_for_audio<T: Serialize + ?Sized>(&self, url: Url, body: &T) -> Result<Vec<u8>> {
        debug!("POST {}", url.path());
        let resp = self
            .client
            .post(url)
            .header("xi-api-key", &self.config.api_key)
            .header("Accept", "audio/mpeg")
            .json(body)
            .send()
            .await
            .context("ElevenLabs request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(DramaError::provider("elevenlabs", format!("{}: {}", status, error_text)).into());
        }

        let bytes = resp.bytes().await.context("Failed to read ElevenLabs audio")?;
        if bytes.is_empty() {
            return Err(DramaError::provider("elevenlabs", "empty audio response").into());
        }
        Ok(bytes.to_vec())
    }
}

#[derive(Serialize)]
struct DialogueRequest<'a> {
    inputs: &'a [DialogueInput],
    model_id: &'a str,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: &'a VoiceSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_text: Option<&'a str>,
}

#[async_trait]
impl TtsClient for ElevenLabsClient {
    async fn synthesize_dialogue(&self, inputs: &[DialogueInput]) -> Result<Vec<u8>> {
        let url = self.endpoint(&["v1", "text-to-dialogue"])?;
        let body = DialogueRequest {
            inputs,
            model_id: &self.config.dialogue_model,
        };
        self.post_for_audio(url, &body).await
    }

    async fn synthesize(
        &self,
        text: &str,
        voice_id: &str,
        settings: &VoiceSettings,
        context: &SpeechContext,
    ) -> Result<Vec<u8>> {
        let url = self.endpoint(&["v1", "text-to-speech", voice_id])?;
        let body = SpeechRequest {
            text,
            model_id: &self.config.speech_model,
            voice_settings: settings,
            previous_text: context.previous_text.as_deref(),
            next_text: context.next_text.as_deref(),
        };
        self.post_for_audio(url, &body).await
    }

    fn dialogue_char_limit(&self) -> usize {
        self.config.dialogue_char_limit
    }

    fn voice_settings(&self) -> VoiceSettings {
        self.config.voice_settings.clone()
    }
}
