use crate::core::state::{CharacterConstraints, ReviewIssue, NARRATOR_NAME};
use crate::services::sfx::SfxEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgeBand {
    Young,
    Mid,
    Old,
}

impl AgeBand {
    pub fn for_age(age: u32) -> Self {
        match age {
            0..=6 => AgeBand::Young,
            7..=9 => AgeBand::Mid,
            _ => AgeBand::Old,
        }
    }

    pub fn min_lines(self) -> usize {
        match self {
            AgeBand::Young => 40,
            AgeBand::Mid => 60,
            AgeBand::Old => 80,
        }
    }

    fn vocabulary(self) -> &'static str {
        match self {
            AgeBand::Young => "very simple words, short sentences of at most ten words, no abstract terms",
            AgeBand::Mid => "everyday words, sentences of moderate length, explain any unusual word through context",
            AgeBand::Old => "rich but clear vocabulary, varied sentence length, figurative language is welcome",
        }
    }

    fn tone(self) -> &'static str {
        match self {
            AgeBand::Young => "warm, playful and reassuring; conflicts are small and resolved kindly; nothing scary",
            AgeBand::Mid => "adventurous and funny; mild suspense is fine if it resolves well",
            AgeBand::Old => "exciting with real stakes and emotional depth; villains may be menacing but never gory",
        }
    }
}

const BASE_RULES: &str = "You write radio plays for children. The story is told through dialogue \
and a narrator. Every character speaks in their own voice and personality. Show, do not tell: \
the narrator sets scenes and bridges time, characters carry the action.\n\
Rules:\n\
1. Before a character speaks for the first time, the narrator introduces them by name.\n\
2. Do not start lines with sound words such as \"Hihihi\", \"Hmm\" or \"Äh\"; express feelings through the emotion field.\n\
3. Write numbers as words.\n\
4. Each scene has a clear place and purpose; end with a satisfying resolution.\n";

fn format_contract() -> String {
    format!(
        "Output format: return ONLY one JSON object, no commentary, matching exactly:\n\
{{\n\
  \"title\": string,\n\
  \"summary\": string (two sentences),\n\
  \"characters\": [{{\"name\": string, \"gender\": \"male\"|\"female\", \"age\": number, \
\"type\": \"human\"|\"creature\", \"species\": string, \"archetype\": \"kind\"|\"funny\"|\"evil\"|\"wise\", \
\"description\": string}}],\n\
  \"scenes\": [{{\"lines\": [ {{\"speaker\": string, \"text\": string, \"emotion\": string}} \
| {{\"sfxId\": string, \"durationSeconds\": number}} ]}}]\n\
}}\n\
The characters list must contain \"{}\". Every speaker must be a character name.",
        NARRATOR_NAME
    )
}

fn constraints_block(constraints: &CharacterConstraints) -> String {
    let hero = match &constraints.hero {
        Some(name) if !name.trim().is_empty() => format!("The hero is named \"{}\".", name.trim()),
        _ => "Invent a fitting hero.".to_string(),
    };
    let sides: Vec<&str> = constraints
        .side_characters
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    let sides = if sides.is_empty() {
        "Invent one or two side characters.".to_string()
    } else {
        format!("Include these side characters: {}.", sides.join(", "))
    };
    format!("Characters: {} {}", hero, sides)
}

fn sfx_block(catalog: &[SfxEntry]) -> String {
    if catalog.is_empty() {
        return "Do not use sound effects.".to_string();
    }
    let mut block = String::from(
        "You may add sound effect lines, sparingly, using only these ids:\n",
    );
    for entry in catalog {
        if entry.description.is_empty() {
            block.push_str(&format!("- {}\n", entry.id));
        } else {
            block.push_str(&format!("- {}: {}\n", entry.id, entry.description));
        }
    }
    block
}

pub fn author_system(
    band: AgeBand,
    constraints: &CharacterConstraints,
    catalog: &[SfxEntry],
    language: &str,
) -> String {
    format!(
        "{}\n\
Audience: vocabulary: {}. Tone: {}.\n\
Length: at least {} dialogue lines (narrator lines count).\n\
Language: write all text in {}.\n\
{}\n\
{}\n\
{}",
        BASE_RULES,
        band.vocabulary(),
        band.tone(),
        band.min_lines(),
        language,
        constraints_block(constraints),
        sfx_block(catalog),
        format_contract()
    )
}

pub fn author_user(prompt: &str, age: u32) -> String {
    format!(
        "Write a radio play for a {}-year-old listener about:\n{}",
        age,
        prompt.trim()
    )
}

pub const REVIEWER_SYSTEM: &str = "You are an editor of children's radio plays. Check the script \
for: characters speaking before the narrator introduced them, age-inappropriate content, \
inconsistent character names, plot holes, lines starting with sound words, and scripts that \
are too short. Reply with ONLY a JSON object: \
{\"approved\": boolean, \"issues\": [{\"severity\": \"minor\"|\"major\"|\"critical\", \"description\": string}]}. \
Approve when only minor issues remain.";

pub fn reviewer_user(script_json: &str, band: AgeBand) -> String {
    format!(
        "Minimum length for this audience: {} lines.\nScript:\n{}",
        band.min_lines(),
        script_json
    )
}

pub fn revision_system(band: AgeBand, language: &str) -> String {
    format!(
        "{}\nYou revise an existing script so that every listed issue is fixed. Keep everything \
that works. Keep at least {} lines. Language: {}.\n{}",
        BASE_RULES,
        band.min_lines(),
        language,
        format_contract()
    )
}

pub fn revision_user(script_json: &str, issues: &[ReviewIssue]) -> String {
    let list: Vec<String> = issues
        .iter()
        .map(|i| {
            if i.severity.is_empty() {
                format!("- {}", i.description)
            } else {
                format!("- [{}] {}", i.severity, i.description)
            }
        })
        .collect();
    format!("Issues:\n{}\n\nScript:\n{}", list.join("\n"), script_json)
}

pub fn optimizer_system(instruction: &str) -> String {
    format!(
        "{}\nChange only emotion values and the wording of numbers, dates and units. Never \
add, remove or reorder lines, scenes or characters.\n{}",
        instruction.trim(),
        format_contract()
    )
}

pub fn optimizer_user(script_json: &str) -> String {
    format!("Script:\n{}", script_json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_age_bands() {
        assert_eq!(AgeBand::for_age(3), AgeBand::Young);
        assert_eq!(AgeBand::for_age(6), AgeBand::Young);
        assert_eq!(AgeBand::for_age(7), AgeBand::Mid);
        assert_eq!(AgeBand::for_age(9), AgeBand::Mid);
        assert_eq!(AgeBand::for_age(10), AgeBand::Old);
        assert_eq!(AgeBand::Young.min_lines(), 40);
        assert_eq!(AgeBand::Old.min_lines(), 80);
    }

    #[test]
    fn test_author_system_mentions_constraints_and_catalog() {
        let constraints = CharacterConstraints {
            hero: Some("Max".to_string()),
            side_characters: vec!["Lena".to_string(), " ".to_string()],
        };
        let catalog = vec![SfxEntry {
            id: "door_creak".to_string(),
            description: "an old wooden door".to_string(),
            file: "door.mp3".to_string(),
        }];
        let system = author_system(AgeBand::Young, &constraints, &catalog, "German");
        assert!(system.contains("at least 40 dialogue lines"));
        assert!(system.contains("The hero is named \"Max\""));
        assert!(system.contains("side characters: Lena."));
        assert!(system.contains("- door_creak: an old wooden door"));
        assert!(system.contains("\"sfxId\""));
        assert!(system.contains("German"));
    }

    #[test]
    fn test_without_constraints_the_model_invents() {
        let system = author_system(AgeBand::Old, &CharacterConstraints::default(), &[], "English");
        assert!(system.contains("Invent a fitting hero."));
        assert!(system.contains("Do not use sound effects."));
    }

    #[test]
    fn test_revision_user_lists_issues() {
        let issues = vec![
            ReviewIssue {
                severity: "major".to_string(),
                description: "Lena speaks before she is introduced".to_string(),
            },
            ReviewIssue {
                severity: String::new(),
                description: "too short".to_string(),
            },
        ];
        let user = revision_user("{}", &issues);
        assert!(user.starts_with("Issues:\n- [major] Lena speaks before she is introduced\n- too short"));
    }
}
