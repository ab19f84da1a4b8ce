use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::error::DramaError;
use crate::core::state::CharacterConstraints;
use crate::services::authoring::AuthoringConfig;
use crate::services::llm::LlmConfig;
use crate::services::tts::TtsConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_data")]
    pub data_folder: String,

    #[serde(default = "default_sfx")]
    pub sfx_folder: String,

    #[serde(default = "default_voices_file")]
    pub voices_file: String,

    #[serde(default)]
    pub unattended: bool,

    /// Story to produce when running unattended.
    #[serde(default)]
    pub request: Option<RequestConfig>,

    pub llm: LlmConfig,

    #[serde(default)]
    pub authoring: AuthoringConfig,

    pub tts: TtsConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AudioConfig {
    #[serde(default = "default_scene_pause")]
    pub scene_pause_seconds: f64,
    #[serde(default = "default_sfx_pause")]
    pub sfx_pause_seconds: f64,
    #[serde(default = "default_line_pause")]
    pub line_pause_seconds: f64,

    #[serde(default = "default_loudness_target")]
    pub loudness_target: f64,
    #[serde(default = "default_true_peak")]
    pub true_peak: f64,
    #[serde(default = "default_loudness_range")]
    pub loudness_range: f64,

    #[serde(default = "default_fade_in")]
    pub fade_in_seconds: f64,
    #[serde(default = "default_fade_out")]
    pub fade_out_seconds: f64,

    #[serde(default = "default_bitrate")]
    pub bitrate: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            scene_pause_seconds: default_scene_pause(),
            sfx_pause_seconds: default_sfx_pause(),
            line_pause_seconds: default_line_pause(),
            loudness_target: default_loudness_target(),
            true_peak: default_true_peak(),
            loudness_range: default_loudness_range(),
            fade_in_seconds: default_fade_in(),
            fade_out_seconds: default_fade_out(),
            bitrate: default_bitrate(),
            sample_rate: default_sample_rate(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RequestConfig {
    pub prompt: String,
    #[serde(default = "default_age")]
    pub age: u32,
    #[serde(default)]
    pub hero: Option<String>,
    #[serde(default)]
    pub side_characters: Vec<String>,
}

impl RequestConfig {
    pub fn constraints(&self) -> CharacterConstraints {
        CharacterConstraints {
            hero: self.hero.clone(),
            side_characters: self.side_characters.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OrchestratorConfig {
    #[serde(default = "default_job_retention")]
    pub job_retention_seconds: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            job_retention_seconds: default_job_retention(),
        }
    }
}

fn default_data() -> String {
    "data".to_string()
}
fn default_sfx() -> String {
    "sfx".to_string()
}
fn default_voices_file() -> String {
    "voices.yml".to_string()
}
fn default_scene_pause() -> f64 {
    1.2
}
fn default_sfx_pause() -> f64 {
    0.4
}
fn default_line_pause() -> f64 {
    0.35
}
fn default_loudness_target() -> f64 {
    -16.0
}
fn default_true_peak() -> f64 {
    -1.5
}
fn default_loudness_range() -> f64 {
    11.0
}
fn default_fade_in() -> f64 {
    1.0
}
fn default_fade_out() -> f64 {
    2.0
}
fn default_bitrate() -> String {
    "192k".to_string()
}
fn default_sample_rate() -> u32 {
    44100
}
fn default_job_retention() -> u64 {
    3600
}
fn default_age() -> u32 {
    6
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.yml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(content)?)
    }

    /// The configured story for unattended runs, which never prompt.
    pub fn unattended_request(&self) -> Result<&RequestConfig> {
        let request = self.request.as_ref().ok_or_else(|| {
            DramaError::Configuration("unattended runs need a `request` section with a prompt".to_string())
        })?;
        if request.prompt.trim().is_empty() {
            return Err(DramaError::Configuration("request.prompt must not be empty".to_string()).into());
        }
        Ok(request)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.data_folder)?;
        fs::create_dir_all(&self.sfx_folder)?;
        Ok(())
    }
}
