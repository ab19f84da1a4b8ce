use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const NARRATOR_NAME: &str = "Narrator";

pub fn is_narrator(name: &str) -> bool {
    let name = name.trim();
    name.eq_ignore_ascii_case("narrator") || name.eq_ignore_ascii_case("erzähler")
}

// --- Character attributes ---
// Model output is loose about casing and vocabulary, so these deserialize from
// any string and fall back to the default variant.

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Gender {
    #[default]
    Male,
    Female,
}

impl From<String> for Gender {
    fn from(s: String) -> Self {
        match s.trim().to_lowercase().as_str() {
            "female" | "f" | "weiblich" | "w" => Gender::Female,
            _ => Gender::Male,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum CharacterType {
    #[default]
    Human,
    Creature,
}

impl From<String> for CharacterType {
    fn from(s: String) -> Self {
        match s.trim().to_lowercase().as_str() {
            "creature" | "animal" | "monster" | "kreatur" | "tier" => CharacterType::Creature,
            _ => CharacterType::Human,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Archetype {
    #[default]
    Kind,
    Funny,
    Evil,
    Wise,
}

impl From<String> for Archetype {
    fn from(s: String) -> Self {
        match s.trim().to_lowercase().as_str() {
            "funny" | "lustig" => Archetype::Funny,
            "evil" | "böse" | "villain" => Archetype::Evil,
            "wise" | "weise" => Archetype::Wise,
            _ => Archetype::Kind,
        }
    }
}

// --- Script ---

fn default_age() -> u32 {
    30
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Character {
    pub name: String,
    #[serde(default)]
    pub gender: Gender,
    #[serde(default = "default_age")]
    pub age: u32,
    #[serde(default, rename = "type")]
    pub kind: CharacterType,
    #[serde(default)]
    pub species: String,
    #[serde(default)]
    pub archetype: Archetype,
    #[serde(default)]
    pub emoji: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Line {
    pub speaker: String,
    pub text: String,
    #[serde(default)]
    pub emotion: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SfxLine {
    pub sfx_id: String,
    #[serde(default)]
    pub duration_seconds: f64,
}

/// A scene entry. `sfxId` marks a sound effect, `speaker` marks dialogue.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum ScriptLine {
    Sfx(SfxLine),
    Dialogue(Line),
}

impl ScriptLine {
    pub fn as_dialogue(&self) -> Option<&Line> {
        match self {
            ScriptLine::Dialogue(line) => Some(line),
            ScriptLine::Sfx(_) => None,
        }
    }

    pub fn is_sfx(&self) -> bool {
        matches!(self, ScriptLine::Sfx(_))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Scene {
    #[serde(default)]
    pub lines: Vec<ScriptLine>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Script {
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub characters: Vec<Character>,
    #[serde(default)]
    pub scenes: Vec<Scene>,
}

/// Stable identifier of a line inside a story.
pub fn line_id(scene_index: usize, position: usize) -> String {
    format!("s{:02}-l{:03}", scene_index, position)
}

/// A line together with where it sits in the script.
#[derive(Clone, Debug, PartialEq)]
pub struct PlacedLine<'a> {
    pub id: String,
    pub scene_index: usize,
    pub position: usize,
    pub line: &'a ScriptLine,
}

impl Script {
    pub fn character(&self, name: &str) -> Option<&Character> {
        self.characters.iter().find(|c| c.name == name)
    }

    pub fn narrator(&self) -> Option<&Character> {
        self.characters.iter().find(|c| is_narrator(&c.name))
    }

    pub fn flatten(&self) -> Vec<PlacedLine<'_>> {
        self.scenes
            .iter()
            .enumerate()
            .flat_map(|(scene_index, scene)| {
                scene
                    .lines
                    .iter()
                    .enumerate()
                    .map(move |(position, line)| PlacedLine {
                        id: line_id(scene_index, position),
                        scene_index,
                        position,
                        line,
                    })
            })
            .collect()
    }

    pub fn dialogue_count(&self) -> usize {
        self.scenes
            .iter()
            .flat_map(|s| s.lines.iter())
            .filter(|l| !l.is_sfx())
            .count()
    }
}

pub type VoiceMap = BTreeMap<String, String>;

// --- Generation state ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    WaitingForScript,
    Preview,
    GeneratingAudio,
    Done,
    Error,
}

impl GenerationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, GenerationStatus::Done | GenerationStatus::Error)
    }

    fn can_move_to(self, next: GenerationStatus) -> bool {
        use GenerationStatus::*;
        matches!(
            (self, next),
            (WaitingForScript, Preview)
                | (WaitingForScript, Error)
                | (Preview, GeneratingAudio)
                | (Preview, Error)
                | (GeneratingAudio, Done)
                | (GeneratingAudio, Error)
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GenerationState {
    pub status: GenerationStatus,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl GenerationState {
    pub fn waiting() -> Self {
        Self {
            status: GenerationStatus::WaitingForScript,
            progress: None,
            error: None,
            started_at: Some(Utc::now()),
            completed_at: None,
        }
    }

    pub fn transition(&mut self, next: GenerationStatus) -> Result<()> {
        if !self.status.can_move_to(next) {
            bail!("Illegal status transition {:?} -> {:?}", self.status, next);
        }
        self.status = next;
        self.progress = None;
        match next {
            GenerationStatus::GeneratingAudio => {
                self.started_at = Some(Utc::now());
                self.completed_at = None;
            }
            GenerationStatus::Preview | GenerationStatus::Done | GenerationStatus::Error => {
                self.completed_at = Some(Utc::now());
            }
            GenerationStatus::WaitingForScript => {}
        }
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(GenerationStatus::Error)?;
        self.error = Some(message.into());
        Ok(())
    }

    pub fn set_progress(&mut self, progress: impl Into<String>) -> Result<()> {
        if self.status.is_terminal() {
            bail!("Cannot report progress on a {:?} job", self.status);
        }
        self.progress = Some(progress.into());
        Ok(())
    }
}

// --- Pipeline log ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ReviewIssue {
    #[serde(default)]
    pub severity: String,
    pub description: String,
}

impl ReviewIssue {
    pub fn is_minor(&self) -> bool {
        self.severity.eq_ignore_ascii_case("minor")
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ReviewResult {
    pub approved: bool,
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StageRecord {
    pub agent: String,
    pub model: String,
    pub duration_ms: u64,
    pub tokens: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_result: Option<ReviewResult>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PipelineLog {
    pub stages: Vec<StageRecord>,
    pub total_tokens: TokenUsage,
}

impl PipelineLog {
    pub fn push(&mut self, record: StageRecord) {
        self.total_tokens.input += record.tokens.input;
        self.total_tokens.output += record.tokens.output;
        self.stages.push(record);
    }
}

// --- Durable story record ---

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct CharacterConstraints {
    #[serde(default)]
    pub hero: Option<String>,
    #[serde(default)]
    pub side_characters: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StoryRequest {
    pub prompt: String,
    pub age: u32,
    #[serde(default)]
    pub constraints: CharacterConstraints,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CharacterRow {
    pub name: String,
    pub voice_id: Option<String>,
    pub emoji: String,
    pub gender: Gender,
    pub archetype: Archetype,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LineKind {
    Dialogue,
    Sfx,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LineRow {
    pub line_id: String,
    pub scene_index: usize,
    pub position: usize,
    pub kind: LineKind,
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub emotion: Option<String>,
    #[serde(default)]
    pub sfx_id: Option<String>,
    pub audio_ref: String,
    #[serde(default)]
    pub audio_ready: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StoryRecord {
    pub id: String,
    pub request: StoryRequest,
    pub generation: GenerationState,
    #[serde(default)]
    pub script: Option<Script>,
    #[serde(default)]
    pub voice_map: Option<VoiceMap>,
    #[serde(default)]
    pub pipeline_log: Option<PipelineLog>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub audio_ref: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub characters: Vec<CharacterRow>,
    #[serde(default)]
    pub lines: Vec<LineRow>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoryRecord {
    pub fn new(id: String, request: StoryRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            request,
            generation: GenerationState::waiting(),
            script: None,
            voice_map: None,
            pipeline_log: None,
            title: None,
            audio_ref: None,
            duration_seconds: None,
            characters: Vec::new(),
            lines: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}
