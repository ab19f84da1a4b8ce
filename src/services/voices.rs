use crate::core::state::{is_narrator, Archetype, Character, CharacterType, Gender, VoiceMap};
use anyhow::{bail, Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

const GENDER_MISMATCH: i32 = -100;
const TYPE_UNSUPPORTED: i32 = -50;
const AGE_MATCH: i32 = 10;
const TYPE_MATCH: i32 = 5;
const ARCHETYPE_MATCH: i32 = 5;

fn yes() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SupportedTypes {
    #[serde(default = "yes")]
    pub human: bool,
    #[serde(default)]
    pub creature: bool,
}

impl Default for SupportedTypes {
    fn default() -> Self {
        Self {
            human: true,
            creature: false,
        }
    }
}

impl SupportedTypes {
    pub fn supports(&self, kind: CharacterType) -> bool {
        match kind {
            CharacterType::Human => self.human,
            CharacterType::Creature => self.creature,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Voice {
    pub id: String,
    pub name: String,
    pub gender: Gender,
    pub age_min: u32,
    pub age_max: u32,
    #[serde(default)]
    pub supported_types: SupportedTypes,
    #[serde(default)]
    pub archetype: Option<Archetype>,
    #[serde(default = "yes")]
    pub active: bool,
    #[serde(default)]
    pub category: String,
}

/// The configured voices plus the one reserved for the narrator.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VoicePool {
    pub narrator_voice_id: String,
    pub voices: Vec<Voice>,
}

impl VoicePool {
    /// Keeps active voices only, in stable (category, name) order.
    pub fn new(narrator_voice_id: impl Into<String>, voices: Vec<Voice>) -> Self {
        let mut voices: Vec<Voice> = voices.into_iter().filter(|v| v.active).collect();
        voices.sort_by(|a, b| a.category.cmp(&b.category).then_with(|| a.name.cmp(&b.name)));
        Self {
            narrator_voice_id: narrator_voice_id.into(),
            voices,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read voice pool {}", path.display()))?;
        let raw: VoicePool = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse voice pool {}", path.display()))?;
        if raw.narrator_voice_id.trim().is_empty() {
            bail!("Voice pool {} has no narrator_voice_id", path.display());
        }
        Ok(Self::new(raw.narrator_voice_id, raw.voices))
    }

    pub fn get(&self, id: &str) -> Option<&Voice> {
        self.voices.iter().find(|v| v.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        id == self.narrator_voice_id || self.get(id).is_some()
    }

    /// Every voice except the narrator's, in pool order.
    fn cast_voices(&self) -> impl Iterator<Item = &Voice> {
        self.voices.iter().filter(move |v| v.id != self.narrator_voice_id)
    }
}

pub fn score_voice(character: &Character, voice: &Voice) -> i32 {
    if character.gender != voice.gender {
        return GENDER_MISMATCH;
    }
    if !voice.supported_types.supports(character.kind) {
        return TYPE_UNSUPPORTED;
    }

    let age = character.age as i64;
    let age_score = if age >= voice.age_min as i64 && age <= voice.age_max as i64 {
        AGE_MATCH as i64
    } else if age < voice.age_min as i64 {
        -(voice.age_min as i64 - age)
    } else {
        -(age - voice.age_max as i64)
    };

    let mut score = age_score.clamp(i32::MIN as i64, i32::MAX as i64) as i32 + TYPE_MATCH;
    if voice.archetype == Some(character.archetype) {
        score += ARCHETYPE_MATCH;
    }
    score
}

fn best_voice<'a>(
    character: &Character,
    candidates: impl Iterator<Item = &'a Voice>,
) -> Option<(&'a Voice, i32)> {
    let mut best: Option<(&Voice, i32)> = None;
    for voice in candidates {
        let score = score_voice(character, voice);
        if score <= 0 {
            continue;
        }
        // Strictly greater keeps the earliest voice in pool order on ties.
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((voice, score));
        }
    }
    best
}

/// Matches characters to voices in declared order.
///
/// The narrator always gets the pool's narrator voice. Everyone else gets the
/// best positive-scoring voice nobody has yet; when none qualifies the whole
/// pool is scored again with reuse allowed. Characters with no positive match
/// stay unassigned.
pub fn assign_voices(characters: &[Character], pool: &VoicePool) -> VoiceMap {
    let mut map = VoiceMap::new();
    let mut used: HashSet<&str> = HashSet::new();

    for character in characters {
        if map.contains_key(&character.name) {
            continue;
        }
        if is_narrator(&character.name) {
            map.insert(character.name.clone(), pool.narrator_voice_id.clone());
            continue;
        }

        let fresh = best_voice(
            character,
            pool.cast_voices().filter(|v| !used.contains(v.id.as_str())),
        );
        let chosen = fresh.or_else(|| {
            let reused = best_voice(character, pool.cast_voices());
            if let Some((voice, _)) = reused {
                debug!("Reusing voice {} for {}", voice.id, character.name);
            }
            reused
        });

        match chosen {
            Some((voice, score)) => {
                debug!("Assigned {} -> {} (score {})", character.name, voice.id, score);
                used.insert(voice.id.as_str());
                map.insert(character.name.clone(), voice.id.clone());
            }
            None => warn!("No suitable voice for character {}", character.name),
        }
    }

    map
}
