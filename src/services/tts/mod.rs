use crate::core::error::DramaError;
use anyhow::Result;
use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};

pub mod elevenlabs;

fn default_provider() -> String {
    "elevenlabs".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TtsConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub elevenlabs: Option<elevenlabs::ElevenLabsConfig>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            elevenlabs: None,
        }
    }
}

fn default_stability() -> f32 {
    0.5
}
fn default_similarity_boost() -> f32 {
    0.75
}
fn default_style() -> f32 {
    0.3
}
fn default_speaker_boost() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct VoiceSettings {
    #[serde(default = "default_stability")]
    pub stability: f32,
    #[serde(default = "default_similarity_boost")]
    pub similarity_boost: f32,
    #[serde(default = "default_style")]
    pub style: f32,
    #[serde(default = "default_speaker_boost")]
    pub use_speaker_boost: bool,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: default_stability(),
            similarity_boost: default_similarity_boost(),
            style: default_style(),
            use_speaker_boost: default_speaker_boost(),
        }
    }
}

/// One turn of a multi-speaker request.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct DialogueInput {
    pub text: String,
    pub voice_id: String,
}

/// Neighbouring text that keeps single-line intonation consistent with the
/// surrounding dialogue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpeechContext {
    pub previous_text: Option<String>,
    pub next_text: Option<String>,
}

#[async_trait]
pub trait TtsClient: Send + Sync {
    /// Renders several speakers in one request and returns encoded audio.
    async fn synthesize_dialogue(&self, inputs: &[DialogueInput]) -> Result<Vec<u8>>;

    /// Renders one line in one voice.
    async fn synthesize(
        &self,
        text: &str,
        voice_id: &str,
        settings: &VoiceSettings,
        context: &SpeechContext,
    ) -> Result<Vec<u8>>;

    /// Largest total text length a single dialogue request accepts.
    fn dialogue_char_limit(&self) -> usize {
        2000
    }

    fn voice_settings(&self) -> VoiceSettings {
        VoiceSettings::default()
    }
}

pub fn create_tts_client(config: &TtsConfig) -> Result<Box<dyn TtsClient>> {
    info!("Initializing TTS client for provider: {}", config.provider);
    match config.provider.as_str() {
        "elevenlabs" => {
            let cfg = config
                .elevenlabs
                .clone()
                .ok_or_else(|| DramaError::Configuration("ElevenLabs config missing".to_string()))?;
            if cfg.api_key.trim().is_empty() {
                return Err(DramaError::Configuration("ElevenLabs api_key is empty".to_string()).into());
            }
            Ok(Box::new(elevenlabs::ElevenLabsClient::new(cfg)?))
        }
        other => Err(DramaError::Configuration(format!("Unknown TTS provider: {}", other)).into()),
    }
}
