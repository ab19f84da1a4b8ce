//! Hand-written collaborators shared by the unit tests.

use crate::core::error::DramaError;
use crate::core::state::{Archetype, Character, CharacterType, Gender, Line, Scene, Script, ScriptLine, SfxLine};
use crate::services::llm::{LlmClient, LlmRequest, LlmResponse};
use crate::services::media::{LoudnessTargets, MediaToolchain};
use crate::services::tts::{DialogueInput, SpeechContext, TtsClient, VoiceSettings};
use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

fn character(name: &str, gender: Gender, age: u32, kind: CharacterType, species: &str, archetype: Archetype) -> Character {
    Character {
        name: name.to_string(),
        gender,
        age,
        kind,
        species: species.to_string(),
        archetype,
        emoji: String::new(),
        description: String::new(),
    }
}

fn say(speaker: &str, text: String, emotion: &str) -> ScriptLine {
    ScriptLine::Dialogue(Line {
        speaker: speaker.to_string(),
        text,
        emotion: emotion.to_string(),
    })
}

/// A narrator introduction followed by `rounds` exchanges between a knight
/// and a dragon, split over two scenes; the second scene opens with a door.
pub fn sample_script(rounds: usize) -> Script {
    let first_half = rounds / 2;
    let mut scene_one = vec![say(
        "Narrator",
        "Es war einmal ein Ritter namens Bruno und ein Drache namens Ember.".to_string(),
        "calm",
    )];
    let mut scene_two = vec![ScriptLine::Sfx(SfxLine {
        sfx_id: "door_creak".to_string(),
        duration_seconds: 1.5,
    })];
    for i in 0..rounds {
        let scene = if i < first_half { &mut scene_one } else { &mut scene_two };
        scene.push(say("Bruno", format!("Ich bringe dir dein Ei zurück, Runde {}.", i), "proud"));
        scene.push(say("Ember", format!("Danke, lieber Ritter, Runde {}!", i), "happy"));
    }

    Script {
        title: "Das verlorene Drachenei".to_string(),
        summary: "Ein Ritter bringt ein Drachenei zurück.".to_string(),
        characters: vec![
            character("Narrator", Gender::Male, 45, CharacterType::Human, "human", Archetype::Wise),
            character("Bruno", Gender::Male, 40, CharacterType::Human, "human", Archetype::Kind),
            character("Ember", Gender::Female, 6, CharacterType::Creature, "dragon", Archetype::Funny),
        ],
        scenes: vec![Scene { lines: scene_one }, Scene { lines: scene_two }],
    }
}

pub fn sample_script_json(rounds: usize) -> String {
    serde_json::to_string(&sample_script(rounds)).expect("script serializes")
}

/// Answers each stage by recognizing its system instruction.
#[derive(Debug)]
pub struct MockLlmClient {
    pub requests: Arc<Mutex<Vec<LlmRequest>>>,
    author: String,
    review: String,
    revision: Option<String>,
    optimizer: Option<String>,
    fail_author: bool,
}

impl MockLlmClient {
    pub fn new(author: String) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            author,
            review: r#"{"approved": true, "issues": []}"#.to_string(),
            revision: None,
            optimizer: None,
            fail_author: false,
        }
    }

    pub fn failing() -> Self {
        let mut mock = Self::new(String::new());
        mock.fail_author = true;
        mock
    }

    pub fn with_review(mut self, review: impl Into<String>) -> Self {
        self.review = review.into();
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn with_optimizer(mut self, optimizer: impl Into<String>) -> Self {
        self.optimizer = Some(optimizer.into());
        self
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn call(&self, request: &LlmRequest) -> Result<LlmResponse> {
        self.requests.lock().unwrap().push(request.clone());

        let text = if request.system.contains("You are an editor") {
            self.review.clone()
        } else if request.system.contains("You revise an existing script") {
            self.revision.clone().unwrap_or_else(|| self.author.clone())
        } else if request.system.contains("Change only emotion values") {
            self.optimizer.clone().unwrap_or_else(|| self.author.clone())
        } else if self.fail_author {
            return Err(DramaError::provider("mock", "quota exceeded").into());
        } else {
            self.author.clone()
        };

        Ok(LlmResponse {
            text,
            tokens_in: 100,
            tokens_out: 50,
        })
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }
}

pub struct MockTtsClient {
    pub should_fail: bool,
    pub char_limit: usize,
    pub dialogue_calls: Arc<Mutex<Vec<Vec<DialogueInput>>>>,
    pub speech_calls: Arc<Mutex<Vec<(String, String, SpeechContext)>>>,
}

impl MockTtsClient {
    pub fn new(char_limit: usize) -> Self {
        Self {
            should_fail: false,
            char_limit,
            dialogue_calls: Arc::new(Mutex::new(Vec::new())),
            speech_calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing() -> Self {
        let mut mock = Self::new(2000);
        mock.should_fail = true;
        mock
    }
}

#[async_trait]
impl TtsClient for MockTtsClient {
    async fn synthesize_dialogue(&self, inputs: &[DialogueInput]) -> Result<Vec<u8>> {
        if self.should_fail {
            return Err(DramaError::provider("mock", "Mock TTS error").into());
        }
        self.dialogue_calls.lock().unwrap().push(inputs.to_vec());
        Ok(inputs.iter().flat_map(|i| i.text.bytes()).collect())
    }

    async fn synthesize(
        &self,
        text: &str,
        voice_id: &str,
        _settings: &VoiceSettings,
        context: &SpeechContext,
    ) -> Result<Vec<u8>> {
        if self.should_fail {
            return Err(DramaError::provider("mock", "Mock TTS error").into());
        }
        self.speech_calls
            .lock()
            .unwrap()
            .push((text.to_string(), voice_id.to_string(), context.clone()));
        Ok(format!("{}:{}", voice_id, text).into_bytes())
    }

    fn dialogue_char_limit(&self) -> usize {
        self.char_limit
    }
}

/// Mono 16-bit PCM WAV carrying `payload` as sample data.
pub fn wav_bytes(payload: &[u8]) -> Vec<u8> {
    let mut data = payload.to_vec();
    if data.len() % 2 == 1 {
        data.push(0);
    }
    let mut wav = b"RIFF".to_vec();
    wav.extend_from_slice(&(36 + data.len() as u32).to_le_bytes());
    wav.extend_from_slice(b"WAVEfmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&44100u32.to_le_bytes());
    wav.extend_from_slice(&88200u32.to_le_bytes());
    wav.extend_from_slice(&2u16.to_le_bytes());
    wav.extend_from_slice(&16u16.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&(data.len() as u32).to_le_bytes());
    wav.extend_from_slice(&data);
    wav
}

/// Byte-level stand-in for ffmpeg; records the operations it performs.
pub struct MockMedia {
    pub calls: Arc<Mutex<Vec<String>>>,
    pub fail_concat: bool,
}

impl MockMedia {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            fail_concat: false,
        }
    }

    pub fn failing_concat() -> Self {
        let mut mock = Self::new();
        mock.fail_concat = true;
        mock
    }

    fn record(&self, op: &str) {
        self.calls.lock().unwrap().push(op.to_string());
    }
}

#[async_trait]
impl MediaToolchain for MockMedia {
    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        self.record("concat");
        if self.fail_concat {
            return Err(DramaError::MediaToolchain("Mock concat error".to_string()).into());
        }
        let mut joined = Vec::new();
        for input in inputs {
            joined.extend(tokio::fs::read(input).await?);
        }
        tokio::fs::write(output, joined).await?;
        Ok(())
    }

    async fn normalize_loudness(&self, input: &Path, output: &Path, _targets: &LoudnessTargets) -> Result<()> {
        self.record("normalize");
        tokio::fs::copy(input, output).await?;
        Ok(())
    }

    async fn fade(&self, input: &Path, output: &Path, _fade_in: f64, _fade_out: f64) -> Result<()> {
        self.record("fade");
        tokio::fs::copy(input, output).await?;
        Ok(())
    }

    async fn probe_duration(&self, input: &Path) -> Result<f64> {
        self.record("probe");
        Ok(tokio::fs::metadata(input).await?.len() as f64 / 1000.0)
    }

    async fn decode_to_wav(&self, input: &Path, output: &Path) -> Result<()> {
        self.record("decode_to_wav");
        let bytes = tokio::fs::read(input).await?;
        tokio::fs::write(output, wav_bytes(&bytes)).await?;
        Ok(())
    }

    async fn encode_mp3(&self, input: &Path, output: &Path) -> Result<()> {
        self.record("encode_mp3");
        tokio::fs::copy(input, output).await?;
        Ok(())
    }

    async fn silence(&self, seconds: f64, output: &Path) -> Result<()> {
        self.record("silence");
        tokio::fs::write(output, vec![0u8; (seconds * 100.0) as usize]).await?;
        Ok(())
    }
}
