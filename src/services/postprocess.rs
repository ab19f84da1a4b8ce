//! Deterministic clean-up applied to every authored script before preview.

use crate::core::state::{
    is_narrator, Archetype, Character, CharacterType, Gender, Script, ScriptLine, NARRATOR_NAME,
};
use crate::services::prompts::AgeBand;
use log::warn;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static LEADING_SOUND_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:(?:hi){2,}|(?:ha){2,}|(?:he){2,}|(?:ho){2,}|(?:hu){2,}|hm+|ähm|äh|öhm|uff|puh|brr+|grr+|ps+t|juhu|hui)\b",
    )
    .expect("valid regex")
});

const NARRATOR_EMOJI: &str = "📖";

const SPECIES_EMOJI: &[(&str, &str)] = &[
    ("dragon", "🐉"),
    ("drache", "🐉"),
    ("unicorn", "🦄"),
    ("einhorn", "🦄"),
    ("cat", "🐱"),
    ("katze", "🐱"),
    ("dog", "🐶"),
    ("hund", "🐶"),
    ("fox", "🦊"),
    ("fuchs", "🦊"),
    ("owl", "🦉"),
    ("eule", "🦉"),
    ("bear", "🐻"),
    ("bär", "🐻"),
    ("rabbit", "🐰"),
    ("hase", "🐰"),
    ("mouse", "🐭"),
    ("maus", "🐭"),
    ("horse", "🐴"),
    ("pferd", "🐴"),
    ("frog", "🐸"),
    ("frosch", "🐸"),
    ("wolf", "🐺"),
    ("lion", "🦁"),
    ("löwe", "🦁"),
    ("bird", "🐦"),
    ("vogel", "🐦"),
    ("fish", "🐟"),
    ("fisch", "🐟"),
    ("robot", "🤖"),
    ("roboter", "🤖"),
    ("ghost", "👻"),
    ("gespenst", "👻"),
    ("troll", "🧌"),
    ("fairy", "🧚"),
    ("fee", "🧚"),
    ("elf", "🧝"),
];

// Longer words first where one contains the other ("königin" / "könig").
const ROLE_EMOJI: &[(&str, &str)] = &[
    ("queen", "👸"),
    ("königin", "👸"),
    ("princess", "👸"),
    ("prinzessin", "👸"),
    ("king", "🤴"),
    ("könig", "🤴"),
    ("prince", "🤴"),
    ("prinz", "🤴"),
    ("knight", "🛡️"),
    ("ritter", "🛡️"),
    ("pirate", "🏴\u{200d}☠️"),
    ("pirat", "🏴\u{200d}☠️"),
    ("witch", "🧙\u{200d}♀️"),
    ("hexe", "🧙\u{200d}♀️"),
    ("wizard", "🧙"),
    ("zauberer", "🧙"),
    ("detective", "🕵️"),
    ("detektiv", "🕵️"),
    ("astronaut", "🧑\u{200d}🚀"),
    ("doctor", "🧑\u{200d}⚕️"),
    ("arzt", "🧑\u{200d}⚕️"),
    ("ärztin", "🧑\u{200d}⚕️"),
    ("teacher", "🧑\u{200d}🏫"),
    ("lehrer", "🧑\u{200d}🏫"),
    ("farmer", "🧑\u{200d}🌾"),
    ("bauer", "🧑\u{200d}🌾"),
];

/// Removes a leading sound word ("Hihihi", "Hmm", "Äh") from `text`.
/// A line that is nothing but sound words keeps its original text.
pub fn scrub_onomatopoeia(text: &str) -> String {
    let scrubbed = LEADING_SOUND_WORD.replace(text, "");
    let scrubbed = scrubbed.trim();
    if scrubbed.is_empty() || scrubbed.chars().all(|c| c.is_ascii_punctuation() || c.is_whitespace()) {
        return text.trim().to_string();
    }
    scrubbed.to_string()
}

pub fn narrator_character() -> Character {
    Character {
        name: NARRATOR_NAME.to_string(),
        gender: Gender::Male,
        age: 45,
        kind: CharacterType::Human,
        species: "human".to_string(),
        archetype: Archetype::Wise,
        emoji: NARRATOR_EMOJI.to_string(),
        description: "Tells the story".to_string(),
    }
}

fn synthesized_character(name: &str) -> Character {
    Character {
        name: name.to_string(),
        gender: Gender::default(),
        age: 30,
        kind: CharacterType::Human,
        species: "human".to_string(),
        archetype: Archetype::default(),
        emoji: String::new(),
        description: String::new(),
    }
}

pub fn emoji_for(character: &Character) -> String {
    if is_narrator(&character.name) {
        return NARRATOR_EMOJI.to_string();
    }

    let species = character.species.trim().to_lowercase();
    if let Some((_, e)) = SPECIES_EMOJI.iter().find(|(k, _)| *k == species) {
        return e.to_string();
    }
    if !species.is_empty() {
        if let Some((_, e)) = SPECIES_EMOJI.iter().find(|(k, _)| species.contains(k)) {
            return e.to_string();
        }
    }

    let traits = format!("{} {}", character.name, character.description).to_lowercase();
    if let Some((_, e)) = ROLE_EMOJI.iter().find(|(k, _)| traits.contains(k)) {
        return e.to_string();
    }

    match (character.age, character.gender) {
        (0..=12, Gender::Male) => "👦",
        (0..=12, Gender::Female) => "👧",
        (13..=59, Gender::Male) => "👨",
        (13..=59, Gender::Female) => "👩",
        (_, Gender::Male) => "👴",
        (_, Gender::Female) => "👵",
    }
    .to_string()
}

/// Drops blank lines and empty scenes, merges duplicate characters, and
/// rewrites speakers to the canonical character name. Speakers without a
/// character get one synthesized.
fn normalize_structure(script: &mut Script, warnings: &mut Vec<String>) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut characters = Vec::with_capacity(script.characters.len());
    for mut character in std::mem::take(&mut script.characters) {
        character.name = character.name.trim().to_string();
        if character.name.is_empty() {
            continue;
        }
        let key = character.name.to_lowercase();
        if seen.contains_key(&key) {
            warnings.push(format!("Duplicate character {} removed", character.name));
            continue;
        }
        seen.insert(key, characters.len());
        characters.push(character);
    }
    script.characters = characters;

    if script.narrator().is_none() {
        script.characters.insert(0, narrator_character());
    }
    let narrator = script
        .narrator()
        .map(|c| c.name.clone())
        .unwrap_or_else(|| NARRATOR_NAME.to_string());

    let mut canonical: HashMap<String, String> = script
        .characters
        .iter()
        .map(|c| (c.name.to_lowercase(), c.name.clone()))
        .collect();

    for scene in &mut script.scenes {
        scene.lines.retain(|line| match line {
            ScriptLine::Dialogue(l) => !l.text.trim().is_empty(),
            ScriptLine::Sfx(s) => !s.sfx_id.trim().is_empty(),
        });
        for line in &mut scene.lines {
            let ScriptLine::Dialogue(line) = line else {
                continue;
            };
            line.text = line.text.trim().to_string();
            let speaker = line.speaker.trim();
            let resolved = if speaker.is_empty() || is_narrator(speaker) {
                narrator.clone()
            } else if let Some(name) = canonical.get(&speaker.to_lowercase()) {
                name.clone()
            } else {
                warnings.push(format!("Speaker {} has no character entry; added one", speaker));
                let character = synthesized_character(speaker);
                canonical.insert(speaker.to_lowercase(), character.name.clone());
                script.characters.push(character);
                speaker.to_string()
            };
            line.speaker = resolved;
        }
    }

    let before = script.scenes.len();
    script.scenes.retain(|s| !s.lines.is_empty());
    if script.scenes.len() < before {
        warnings.push(format!("Dropped {} empty scene(s)", before - script.scenes.len()));
    }
}

pub fn quality_warnings(script: &Script, band: AgeBand) -> Vec<String> {
    let mut warnings = Vec::new();

    let lines = script.dialogue_count();
    if lines < band.min_lines() {
        warnings.push(format!(
            "Script has {} lines, below the minimum of {} for this age",
            lines,
            band.min_lines()
        ));
    }

    let mut narrated = String::new();
    let mut introduced: Vec<&str> = Vec::new();
    for placed in script.flatten() {
        let Some(line) = placed.line.as_dialogue() else {
            continue;
        };
        if is_narrator(&line.speaker) {
            narrated.push_str(&line.text.to_lowercase());
            narrated.push('\n');
            continue;
        }
        if introduced.contains(&line.speaker.as_str()) {
            continue;
        }
        introduced.push(&line.speaker);
        if !narrated.contains(&line.speaker.to_lowercase()) {
            warnings.push(format!(
                "{} speaks at {} before the narrator introduces them",
                line.speaker, placed.id
            ));
        }
    }
    warnings
}

/// Runs the whole clean-up in place and returns the warnings it produced.
pub fn post_process(script: &mut Script, band: AgeBand) -> Vec<String> {
    let mut warnings = Vec::new();
    normalize_structure(script, &mut warnings);

    for scene in &mut script.scenes {
        for line in &mut scene.lines {
            if let ScriptLine::Dialogue(line) = line {
                if !is_narrator(&line.speaker) {
                    line.text = scrub_onomatopoeia(&line.text);
                }
            }
        }
    }

    // Display emoji come from the lookup chain only; model suggestions are discarded.
    for character in &mut script.characters {
        character.emoji = emoji_for(character);
    }

    warnings.extend(quality_warnings(script, band));
    for w in &warnings {
        warn!("{}", w);
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{Line, Scene, SfxLine};

    fn say(speaker: &str, text: &str) -> ScriptLine {
        ScriptLine::Dialogue(Line {
            speaker: speaker.to_string(),
            text: text.to_string(),
            emotion: "neutral".to_string(),
        })
    }

    fn person(name: &str, gender: Gender, age: u32, species: &str, description: &str) -> Character {
        Character {
            name: name.to_string(),
            gender,
            age,
            kind: CharacterType::Human,
            species: species.to_string(),
            archetype: Archetype::Kind,
            emoji: String::new(),
            description: description.to_string(),
        }
    }

    #[test]
    fn test_scrub_leading_sound_word() {
        assert_eq!(scrub_onomatopoeia("Hihihi, das ist lustig!"), ", das ist lustig!");
        assert_eq!(scrub_onomatopoeia("Hmmm... ich weiß nicht."), "... ich weiß nicht.");
        assert_eq!(scrub_onomatopoeia("Äh, wo bin ich?"), ", wo bin ich?");
        assert_eq!(scrub_onomatopoeia("Hier ist es."), "Hier ist es.");
        // "Hilfe" is a word, not a sound.
        assert_eq!(scrub_onomatopoeia("Hilfe!"), "Hilfe!");
    }

    #[test]
    fn test_scrub_never_empties_a_line() {
        assert_eq!(scrub_onomatopoeia("Hahaha!"), "Hahaha!");
        assert_eq!(scrub_onomatopoeia("Hmm"), "Hmm");
    }

    #[test]
    fn test_emoji_chain() {
        let dragon = person("Ember", Gender::Male, 5, "Dragon", "");
        assert_eq!(emoji_for(&dragon), "🐉");
        let baby = person("Pip", Gender::Male, 5, "baby dragon", "");
        assert_eq!(emoji_for(&baby), "🐉");
        let queen = person("Alma", Gender::Female, 40, "human", "die gütige Königin");
        assert_eq!(emoji_for(&queen), "👸");
        let knight = person("Sir Bruno", Gender::Male, 40, "human", "a brave knight");
        assert_eq!(emoji_for(&knight), "🛡️");
        let girl = person("Lena", Gender::Female, 8, "human", "");
        assert_eq!(emoji_for(&girl), "👧");
        let grandpa = person("Opa", Gender::Male, 70, "", "");
        assert_eq!(emoji_for(&grandpa), "👴");
        assert_eq!(emoji_for(&narrator_character()), "📖");
    }

    #[test]
    fn test_post_process_normalizes_structure() {
        let mut script = Script {
            title: "T".to_string(),
            summary: String::new(),
            characters: vec![person("Max", Gender::Male, 8, "human", "")],
            scenes: vec![
                Scene { lines: vec![] },
                Scene {
                    lines: vec![
                        say("Erzähler", "Das ist Max. Und das ist Lena."),
                        say("max", "Hihihi, das ist lustig!"),
                        say("Lena", "Hallo Max."),
                        say("Max", "   "),
                        ScriptLine::Sfx(SfxLine {
                            sfx_id: "door_creak".to_string(),
                            duration_seconds: 1.0,
                        }),
                    ],
                },
            ],
        };

        let warnings = post_process(&mut script, AgeBand::Young);

        assert_eq!(script.scenes.len(), 1);
        assert_eq!(script.scenes[0].lines.len(), 4);
        assert!(script.narrator().is_some());
        assert!(script.character("Lena").is_some());

        let max_line = script.scenes[0].lines[1].as_dialogue().unwrap();
        assert_eq!(max_line.speaker, "Max");
        assert_eq!(max_line.text, ", das ist lustig!");
        let narrator_line = script.scenes[0].lines[0].as_dialogue().unwrap();
        assert_eq!(narrator_line.speaker, NARRATOR_NAME);

        for line in script.scenes.iter().flat_map(|s| &s.lines) {
            if let Some(l) = line.as_dialogue() {
                assert!(script.character(&l.speaker).is_some(), "{} has no character", l.speaker);
            }
        }
        assert!(warnings.iter().any(|w| w.contains("Lena")));
        assert!(warnings.iter().any(|w| w.contains("below the minimum")));
        assert!(script.characters.iter().all(|c| !c.emoji.is_empty()));
    }

    #[test]
    fn test_model_emoji_is_replaced_by_lookup() {
        let mut ember = person("Ember", Gender::Female, 6, "dragon", "");
        ember.emoji = "🐱".to_string();
        let mut script = Script {
            title: "T".to_string(),
            summary: String::new(),
            characters: vec![ember],
            scenes: vec![Scene {
                lines: vec![say(NARRATOR_NAME, "Das ist Ember."), say("Ember", "Hallo!")],
            }],
        };

        post_process(&mut script, AgeBand::Young);
        assert_eq!(script.character("Ember").unwrap().emoji, "🐉");
    }

    #[test]
    fn test_introduction_check() {
        let script = Script {
            title: "T".to_string(),
            summary: String::new(),
            characters: vec![
                narrator_character(),
                person("Max", Gender::Male, 8, "human", ""),
                person("Lena", Gender::Female, 8, "human", ""),
            ],
            scenes: vec![Scene {
                lines: vec![
                    say(NARRATOR_NAME, "Max wohnt am Meer."),
                    say("Max", "Hallo!"),
                    say("Lena", "Wer bist du?"),
                ],
            }],
        };
        let warnings = quality_warnings(&script, AgeBand::Young);
        assert!(warnings.iter().any(|w| w.starts_with("Lena speaks at s00-l002")));
        assert!(!warnings.iter().any(|w| w.starts_with("Max")));
    }
}
