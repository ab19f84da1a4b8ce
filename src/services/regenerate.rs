//! Narrow edits to a finished story: swap a character's voice or rewrite one
//! line, then rebuild the track from per-line audio.

use crate::core::error::DramaError;
use crate::core::state::{is_narrator, LineKind, ScriptLine, StoryRecord, VoiceMap};
use crate::core::store::path_str;
use crate::services::production::{character_rows, AudioProducer, Segment, SegmentKind};
use crate::services::voices::VoicePool;
use anyhow::Result;
use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

fn invalid(message: impl Into<String>) -> anyhow::Error {
    DramaError::Validation(message.into()).into()
}

/// Points `character` at `voice_id` and returns the ids of the lines it speaks.
pub fn apply_voice_swap(
    record: &mut StoryRecord,
    character: &str,
    voice_id: &str,
    pool: &VoicePool,
) -> Result<HashSet<String>> {
    let script = record
        .script
        .as_ref()
        .ok_or_else(|| invalid(format!("Story {} has no script", record.id)))?;
    let name = script
        .characters
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(character.trim()))
        .map(|c| c.name.clone())
        .ok_or_else(|| invalid(format!("Unknown character {}", character)))?;
    if is_narrator(&name) {
        return Err(invalid("The narrator voice cannot be changed"));
    }
    if voice_id == pool.narrator_voice_id {
        return Err(invalid(format!("Voice {} is reserved for the narrator", voice_id)));
    }
    if !pool.contains(voice_id) {
        return Err(invalid(format!("Unknown voice {}", voice_id)));
    }

    record
        .voice_map
        .get_or_insert_with(VoiceMap::new)
        .insert(name.clone(), voice_id.to_string());
    for row in record.characters.iter_mut().filter(|r| r.name == name) {
        row.voice_id = Some(voice_id.to_string());
    }

    Ok(record
        .lines
        .iter()
        .filter(|l| l.kind == LineKind::Dialogue && l.speaker.as_deref() == Some(name.as_str()))
        .map(|l| l.line_id.clone())
        .collect())
}

/// Rewrites one dialogue line in both the script and its row.
pub fn apply_line_replacement(
    record: &mut StoryRecord,
    line_id: &str,
    text: &str,
    emotion: Option<&str>,
) -> Result<HashSet<String>> {
    let text = text.trim();
    if text.is_empty() {
        return Err(invalid("Line text must not be empty"));
    }
    let row = record
        .lines
        .iter_mut()
        .find(|l| l.line_id == line_id)
        .ok_or_else(|| invalid(format!("Unknown line {}", line_id)))?;
    if row.kind != LineKind::Dialogue {
        return Err(invalid(format!("Line {} is a sound effect", line_id)));
    }

    let line = record
        .script
        .as_mut()
        .and_then(|s| s.scenes.get_mut(row.scene_index))
        .and_then(|scene| scene.lines.get_mut(row.position))
        .and_then(|line| match line {
            ScriptLine::Dialogue(line) => Some(line),
            ScriptLine::Sfx(_) => None,
        })
        .ok_or_else(|| invalid(format!("Line {} is missing from the script", line_id)))?;

    line.text = text.to_string();
    row.text = Some(text.to_string());
    if let Some(emotion) = emotion {
        line.emotion = emotion.trim().to_string();
        row.emotion = Some(line.emotion.clone());
    }
    Ok(HashSet::from([line_id.to_string()]))
}

impl AudioProducer {
    /// Re-records the `dirty` lines, plus any line without stored audio, and
    /// re-masters the whole story from per-line files. New takes stay in the
    /// work dir until mastering succeeds, so a failed rebuild leaves the stored
    /// line audio and the final track as they were.
    pub async fn rebuild(&self, record: &mut StoryRecord, dirty: &HashSet<String>) -> Result<()> {
        let script = record
            .script
            .as_ref()
            .ok_or_else(|| invalid(format!("Story {} has no script", record.id)))?;
        let empty = VoiceMap::new();
        let voice_map = record.voice_map.as_ref().unwrap_or(&empty);

        let mut stale = HashSet::new();
        let mut dialogue = 0;
        for (index, row) in record.lines.iter().enumerate() {
            if row.kind != LineKind::Dialogue {
                continue;
            }
            dialogue += 1;
            if dirty.contains(&row.line_id)
                || !row.audio_ready
                || !tokio::fs::try_exists(&row.audio_ref).await.unwrap_or(false)
            {
                stale.insert(index);
            }
        }
        info!("Rebuilding {}: {} of {} lines to record", record.id, stale.len(), dialogue);

        let work = self.store.work_dir(&record.id);
        self.store.clear_work_dir(&record.id).await?;
        tokio::fs::create_dir_all(&work).await?;

        let takes: HashMap<usize, PathBuf> = self
            .record_lines(&record.lines, voice_map, &stale, Some(&work))
            .await?
            .into_iter()
            .collect();

        let mut segments = Vec::with_capacity(record.lines.len());
        for (index, row) in record.lines.iter().enumerate() {
            match row.kind {
                LineKind::Dialogue => segments.push(Segment {
                    path: takes
                        .get(&index)
                        .cloned()
                        .unwrap_or_else(|| PathBuf::from(&row.audio_ref)),
                    kind: SegmentKind::Line { scene: row.scene_index },
                }),
                LineKind::Sfx => {
                    let sfx_id = row.sfx_id.as_deref().unwrap_or_default();
                    match self.sfx.resolve(sfx_id).await? {
                        Some(path) => segments.push(Segment {
                            path,
                            kind: SegmentKind::Sfx,
                        }),
                        None => warn!("Sound effect {} not found; skipping {}", sfx_id, row.line_id),
                    }
                }
            }
        }

        let mastered = work.join("mastered.mp3");
        let duration = self.master(&work, &segments, &mastered).await?;

        for (&index, take) in &takes {
            let target = PathBuf::from(&record.lines[index].audio_ref);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(take, &target).await?;
            record.lines[index].audio_ready = true;
        }
        let final_path = self.store.final_audio_path(&record.id);
        tokio::fs::rename(&mastered, &final_path).await?;
        self.store.clear_work_dir(&record.id).await?;

        record.characters = character_rows(script, voice_map);
        record.audio_ref = Some(path_str(&final_path));
        record.duration_seconds = Some(duration);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::AudioConfig;
    use crate::core::error::is_validation;
    use crate::core::io::NativeStorage;
    use crate::core::state::{Gender, StoryRequest};
    use crate::core::store::StoryStore;
    use crate::services::sfx::LocalSfxLibrary;
    use crate::services::testing::{sample_script, MockMedia, MockTtsClient};
    use crate::services::voices::{SupportedTypes, Voice};
    use crate::services::NoProgress;
    use std::path::Path;
    use std::sync::Arc;

    fn pool() -> VoicePool {
        let voice = |id: &str| Voice {
            id: id.to_string(),
            name: id.to_string(),
            gender: Gender::Male,
            age_min: 0,
            age_max: 99,
            supported_types: SupportedTypes::default(),
            archetype: None,
            active: true,
            category: String::new(),
        };
        VoicePool::new("narr", vec![voice("v-bruno"), voice("v-ember"), voice("v-new")])
    }

    async fn produced_record(producer: &AudioProducer) -> Result<StoryRecord> {
        let mut record = StoryRecord::new(
            "story-1".to_string(),
            StoryRequest {
                prompt: "p".to_string(),
                age: 6,
                constraints: Default::default(),
            },
        );
        record.script = Some(sample_script(4));
        record.voice_map = Some(
            [("Narrator", "narr"), ("Bruno", "v-bruno"), ("Ember", "v-ember")]
                .into_iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
        );
        let produced = producer.produce(&record, &NoProgress).await?;
        record.lines = produced.lines;
        record.characters = produced.characters;
        record.audio_ref = Some(produced.audio_ref);
        record.duration_seconds = Some(produced.duration_seconds);
        Ok(record)
    }

    #[test]
    fn test_invalid_edits_are_rejected() -> Result<()> {
        let mut record = StoryRecord::new(
            "x".to_string(),
            StoryRequest {
                prompt: "p".to_string(),
                age: 6,
                constraints: Default::default(),
            },
        );
        record.script = Some(sample_script(2));
        let pool = pool();

        for (character, voice) in [("Narrator", "v-new"), ("Ghost", "v-new"), ("Bruno", "nope"), ("Bruno", "narr")] {
            let err = apply_voice_swap(&mut record, character, voice, &pool).unwrap_err();
            assert!(is_validation(&err), "{} -> {} should be rejected", character, voice);
        }
        assert!(is_validation(&apply_line_replacement(&mut record, "s09-l000", "Hi", None).unwrap_err()));
        Ok(())
    }

    fn producer(store: StoryStore, tts: MockTtsClient, media: MockMedia) -> AudioProducer {
        AudioProducer::new(
            Arc::new(tts),
            Arc::new(LocalSfxLibrary::empty()),
            Arc::new(media),
            store,
            AudioConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_line_replacement_records_only_that_line() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = StoryStore::new(temp_dir.path(), Arc::new(NativeStorage::new()));
        let tts = MockTtsClient::new(2000);
        let speech_calls = tts.speech_calls.clone();
        let producer = producer(store, tts, MockMedia::new());
        let mut record = produced_record(&producer).await?;
        speech_calls.lock().unwrap().clear();

        let dirty = apply_line_replacement(&mut record, "s00-l001", "Hier ist dein Ei!", Some("warm"))?;
        producer.rebuild(&mut record, &dirty).await?;

        let script_line = record.script.as_ref().unwrap().scenes[0].lines[1].as_dialogue().unwrap().clone();
        assert_eq!(script_line.text, "Hier ist dein Ei!");
        assert_eq!(script_line.emotion, "warm");
        assert_eq!(std::fs::read_to_string(&record.lines[1].audio_ref)?, "v-bruno:Hier ist dein Ei!");
        assert!(Path::new(record.audio_ref.as_ref().unwrap()).exists());

        // The edited line carries its neighbours as context.
        let calls = speech_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (text, voice, context) = &calls[0];
        assert_eq!(text, "Hier ist dein Ei!");
        assert_eq!(voice, "v-bruno");
        assert!(context.previous_text.as_deref().unwrap().starts_with("Es war einmal"));
        assert!(context.next_text.as_deref().unwrap().starts_with("Danke"));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_line_audio_is_recorded_again() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = StoryStore::new(temp_dir.path(), Arc::new(NativeStorage::new()));
        let tts = MockTtsClient::new(2000);
        let speech_calls = tts.speech_calls.clone();
        let producer = producer(store, tts, MockMedia::new());
        let mut record = produced_record(&producer).await?;
        speech_calls.lock().unwrap().clear();

        std::fs::remove_file(&record.lines[0].audio_ref)?;
        producer.rebuild(&mut record, &HashSet::new()).await?;

        assert_eq!(speech_calls.lock().unwrap().len(), 1);
        assert!(Path::new(&record.lines[0].audio_ref).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_voice_swap_only_touches_that_character() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = StoryStore::new(temp_dir.path(), Arc::new(NativeStorage::new()));
        let tts = MockTtsClient::new(2000);
        let speech_calls = tts.speech_calls.clone();
        let producer = producer(store, tts, MockMedia::new());
        let mut record = produced_record(&producer).await?;
        speech_calls.lock().unwrap().clear();

        let dirty = apply_voice_swap(&mut record, "ember", "v-new", &pool())?;
        producer.rebuild(&mut record, &dirty).await?;

        let calls = speech_calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        assert!(calls.iter().all(|(_, voice, _)| voice == "v-new"));
        assert_eq!(record.voice_map.as_ref().unwrap()["Ember"], "v-new");
        let ember = record.characters.iter().find(|c| c.name == "Ember").unwrap();
        assert_eq!(ember.voice_id.as_deref(), Some("v-new"));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_rebuild_keeps_stored_line_audio() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = StoryStore::new(temp_dir.path(), Arc::new(NativeStorage::new()));
        let working = producer(store.clone(), MockTtsClient::new(2000), MockMedia::new());
        let record = produced_record(&working).await?;
        let final_audio = std::fs::read(record.audio_ref.as_ref().unwrap())?;

        let broken = producer(store, MockTtsClient::new(2000), MockMedia::failing_concat());
        let mut edited = record.clone();
        let dirty = apply_line_replacement(&mut edited, "s00-l001", "NEUER TEXT", None)?;
        assert!(broken.rebuild(&mut edited, &dirty).await.is_err());

        let line = &record.lines[1];
        assert_eq!(std::fs::read_to_string(&line.audio_ref)?, "v-bruno:Ich bringe dir dein Ei zurück, Runde 0.");
        assert!(edited.lines[1].audio_ready);
        assert_eq!(std::fs::read(record.audio_ref.as_ref().unwrap())?, final_audio);

        // A later clean rebuild of the unedited record records nothing new.
        let tts = MockTtsClient::new(2000);
        let speech_calls = tts.speech_calls.clone();
        let mut unchanged = record.clone();
        producer(working.store.clone(), tts, MockMedia::new())
            .rebuild(&mut unchanged, &HashSet::new())
            .await?;
        assert!(speech_calls.lock().unwrap().is_empty());
        Ok(())
    }
}
