//! Turns a confirmed script into one mastered audio file.

use crate::core::config::AudioConfig;
use crate::core::error::DramaError;
use crate::core::state::{
    is_narrator, CharacterRow, Line, LineKind, LineRow, PlacedLine, Script, ScriptLine, StoryRecord, VoiceMap,
};
use crate::core::store::{path_str, StoryStore};
use crate::services::media::{LoudnessTargets, MediaToolchain};
use crate::services::sfx::SfxLibrary;
use crate::services::tts::{DialogueInput, SpeechContext, TtsClient};
use crate::services::ProgressReporter;
use crate::utils::audio::concat_wav_files;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum Chunk<'a> {
    /// A maximal run of dialogue lines.
    Dialogue(Vec<PlacedLine<'a>>),
    Sfx(PlacedLine<'a>),
}

/// Splits the flattened script into synthesis chunks, preserving order.
/// Only a sound effect ends a dialogue run.
pub fn partition(script: &Script) -> Vec<Chunk<'_>> {
    let mut chunks = Vec::new();
    let mut run: Vec<PlacedLine<'_>> = Vec::new();

    for placed in script.flatten() {
        if placed.line.is_sfx() {
            if !run.is_empty() {
                chunks.push(Chunk::Dialogue(std::mem::take(&mut run)));
            }
            chunks.push(Chunk::Sfx(placed));
        } else {
            run.push(placed);
        }
    }
    if !run.is_empty() {
        chunks.push(Chunk::Dialogue(run));
    }
    chunks
}

pub fn tagged_text(line: &Line) -> String {
    let emotion = line.emotion.trim();
    if emotion.is_empty() {
        line.text.clone()
    } else {
        format!("[{}] {}", emotion, line.text)
    }
}

/// Greedy split into requests of at most `limit` characters. A line is never
/// split; a single line longer than the limit travels alone.
pub fn split_for_limit(inputs: Vec<DialogueInput>, limit: usize) -> Vec<Vec<DialogueInput>> {
    let mut parts: Vec<Vec<DialogueInput>> = Vec::new();
    let mut current: Vec<DialogueInput> = Vec::new();
    let mut size = 0;

    for input in inputs {
        let len = input.text.chars().count();
        if !current.is_empty() && size + len > limit {
            parts.push(std::mem::take(&mut current));
            size = 0;
        }
        size += len;
        current.push(input);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Resolves the voice for `speaker`; characters left unassigned fall back to
/// the narrator's voice.
pub fn voice_for(speaker: &str, voice_map: &VoiceMap) -> Result<String> {
    if let Some(voice) = voice_map.get(speaker) {
        return Ok(voice.clone());
    }
    if let Some((_, voice)) = voice_map.iter().find(|(name, _)| is_narrator(name)) {
        warn!("{} has no voice; using the narrator's", speaker);
        return Ok(voice.clone());
    }
    Err(DramaError::Validation(format!("No voice for speaker {}", speaker)).into())
}

pub fn character_rows(script: &Script, voice_map: &VoiceMap) -> Vec<CharacterRow> {
    script
        .characters
        .iter()
        .map(|c| CharacterRow {
            name: c.name.clone(),
            voice_id: voice_map.get(&c.name).cloned(),
            emoji: c.emoji.clone(),
            gender: c.gender,
            archetype: c.archetype,
        })
        .collect()
}

pub fn line_rows(script: &Script, store: &StoryStore, story_id: &str) -> Vec<LineRow> {
    script
        .flatten()
        .into_iter()
        .map(|p| {
            let audio_ref = path_str(&store.line_audio_path(story_id, &p.id));
            match p.line {
                ScriptLine::Dialogue(line) => LineRow {
                    line_id: p.id,
                    scene_index: p.scene_index,
                    position: p.position,
                    kind: LineKind::Dialogue,
                    speaker: Some(line.speaker.clone()),
                    text: Some(line.text.clone()),
                    emotion: Some(line.emotion.clone()),
                    sfx_id: None,
                    audio_ref,
                    audio_ready: false,
                },
                ScriptLine::Sfx(sfx) => LineRow {
                    line_id: p.id,
                    scene_index: p.scene_index,
                    position: p.position,
                    kind: LineKind::Sfx,
                    speaker: None,
                    text: None,
                    emotion: None,
                    sfx_id: Some(sfx.sfx_id.clone()),
                    audio_ref,
                    audio_ready: false,
                },
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum SegmentKind {
    /// A multi-speaker dialogue chunk from production.
    Dialogue,
    /// One line's own recording, used when rebuilding.
    Line { scene: usize },
    Sfx,
}

#[derive(Debug, Clone)]
pub(crate) struct Segment {
    pub path: PathBuf,
    pub kind: SegmentKind,
}

pub(crate) fn pause_between(prev: SegmentKind, next: SegmentKind, audio: &AudioConfig) -> f64 {
    match (prev, next) {
        (SegmentKind::Sfx, _) | (_, SegmentKind::Sfx) => audio.sfx_pause_seconds,
        (SegmentKind::Line { scene: a }, SegmentKind::Line { scene: b }) if a == b => audio.line_pause_seconds,
        _ => audio.scene_pause_seconds,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProducedStory {
    pub audio_ref: String,
    pub duration_seconds: f64,
    pub characters: Vec<CharacterRow>,
    pub lines: Vec<LineRow>,
}

pub struct AudioProducer {
    pub(crate) tts: Arc<dyn TtsClient>,
    pub(crate) sfx: Arc<dyn SfxLibrary>,
    pub(crate) media: Arc<dyn MediaToolchain>,
    pub(crate) store: StoryStore,
    pub(crate) audio: AudioConfig,
}

impl AudioProducer {
    pub fn new(
        tts: Arc<dyn TtsClient>,
        sfx: Arc<dyn SfxLibrary>,
        media: Arc<dyn MediaToolchain>,
        store: StoryStore,
        audio: AudioConfig,
    ) -> Self {
        Self {
            tts,
            sfx,
            media,
            store,
            audio,
        }
    }

    pub async fn produce(&self, record: &StoryRecord, progress: &dyn ProgressReporter) -> Result<ProducedStory> {
        let script = record
            .script
            .as_ref()
            .ok_or_else(|| DramaError::Validation(format!("Story {} has no script", record.id)))?;
        let empty = VoiceMap::new();
        let voice_map = record.voice_map.as_ref().unwrap_or(&empty);

        let work = self.store.work_dir(&record.id);
        self.store.clear_work_dir(&record.id).await?;
        tokio::fs::create_dir_all(&work).await?;

        let chunks = partition(script);
        let total = chunks.len();
        info!("Producing {} ({} chunks)", record.id, total);
        progress.report(format!("0/{} chunks", total)).await;

        let mut segments = Vec::with_capacity(total);
        for (i, chunk) in chunks.iter().enumerate() {
            let (kind, path) = match chunk {
                Chunk::Dialogue(lines) => (
                    SegmentKind::Dialogue,
                    Some(self.render_dialogue(&work, i, lines, voice_map).await?),
                ),
                Chunk::Sfx(placed) => (SegmentKind::Sfx, self.copy_sfx(&work, i, placed).await?),
            };
            if let Some(path) = path {
                segments.push(Segment { path, kind });
            }
            progress.report(format!("{}/{} chunks", i + 1, total)).await;
        }

        let final_path = self.store.final_audio_path(&record.id);
        let duration_seconds = self.master(&work, &segments, &final_path).await?;
        self.store.clear_work_dir(&record.id).await?;

        // Every dialogue line also gets its own recording for playback and edits.
        let mut lines = line_rows(script, &self.store, &record.id);
        let wanted: HashSet<usize> = (0..lines.len()).filter(|&i| lines[i].kind == LineKind::Dialogue).collect();
        progress.report(format!("Recording {} lines", wanted.len())).await;
        for (index, _) in self.record_lines(&lines, voice_map, &wanted, None).await? {
            lines[index].audio_ready = true;
        }

        Ok(ProducedStory {
            audio_ref: path_str(&final_path),
            duration_seconds,
            characters: character_rows(script, voice_map),
            lines,
        })
    }

    /// Synthesizes the dialogue rows at `wanted` one at a time, with the
    /// neighbouring dialogue as context. Audio goes to `staging` when given,
    /// otherwise straight to each row's `audio_ref`.
    pub(crate) async fn record_lines(
        &self,
        rows: &[LineRow],
        voice_map: &VoiceMap,
        wanted: &HashSet<usize>,
        staging: Option<&Path>,
    ) -> Result<Vec<(usize, PathBuf)>> {
        let dialogue: Vec<usize> = (0..rows.len()).filter(|&i| rows[i].kind == LineKind::Dialogue).collect();
        let text_at = |i: usize| rows[i].text.clone().filter(|t| !t.is_empty());
        let settings = self.tts.voice_settings();

        let mut written = Vec::with_capacity(wanted.len());
        for (n, &index) in dialogue.iter().enumerate() {
            if !wanted.contains(&index) {
                continue;
            }
            let row = &rows[index];
            let voice_id = voice_for(row.speaker.as_deref().unwrap_or_default(), voice_map)?;
            let context = SpeechContext {
                previous_text: n.checked_sub(1).and_then(|p| text_at(dialogue[p])),
                next_text: dialogue.get(n + 1).and_then(|&i| text_at(i)),
            };
            let audio = self
                .tts
                .synthesize(row.text.as_deref().unwrap_or_default(), &voice_id, &settings, &context)
                .await
                .with_context(|| format!("Failed to record line {}", row.line_id))?;

            let path = match staging {
                Some(dir) => dir.join(format!("line_{}.mp3", row.line_id)),
                None => PathBuf::from(&row.audio_ref),
            };
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, audio).await?;
            written.push((index, path));
        }
        debug!("Recorded {} individual lines", written.len());
        Ok(written)
    }

    async fn render_dialogue(
        &self,
        work: &Path,
        index: usize,
        lines: &[PlacedLine<'_>],
        voice_map: &VoiceMap,
    ) -> Result<PathBuf> {
        let mut inputs = Vec::with_capacity(lines.len());
        for placed in lines {
            if let Some(line) = placed.line.as_dialogue() {
                inputs.push(DialogueInput {
                    text: tagged_text(line),
                    voice_id: voice_for(&line.speaker, voice_map)?,
                });
            }
        }

        let output = work.join(format!("chunk_{:03}.mp3", index));
        let parts = split_for_limit(inputs, self.tts.dialogue_char_limit());
        if parts.len() == 1 {
            let audio = self.tts.synthesize_dialogue(&parts[0]).await?;
            tokio::fs::write(&output, audio).await?;
            return Ok(output);
        }

        debug!("Chunk {} needs {} requests", index, parts.len());
        let mut wavs = Vec::with_capacity(parts.len());
        for (j, part) in parts.iter().enumerate() {
            let encoded = work.join(format!("chunk_{:03}_part_{:02}.mp3", index, j));
            tokio::fs::write(&encoded, self.tts.synthesize_dialogue(part).await?).await?;
            let wav = encoded.with_extension("wav");
            self.media.decode_to_wav(&encoded, &wav).await?;
            wavs.push(wav);
        }

        let joined = work.join(format!("chunk_{:03}.wav", index));
        let target = joined.clone();
        tokio::task::spawn_blocking(move || concat_wav_files(&wavs, &target))
            .await
            .context("WAV join task panicked")??;
        self.media.encode_mp3(&joined, &output).await?;
        Ok(output)
    }

    async fn copy_sfx(&self, work: &Path, index: usize, placed: &PlacedLine<'_>) -> Result<Option<PathBuf>> {
        let ScriptLine::Sfx(sfx) = placed.line else {
            return Ok(None);
        };
        let Some(source) = self.sfx.resolve(&sfx.sfx_id).await? else {
            warn!("Sound effect {} not found; skipping {}", sfx.sfx_id, placed.id);
            return Ok(None);
        };
        let ext = source.extension().and_then(|e| e.to_str()).unwrap_or("mp3");
        let target = work.join(format!("chunk_{:03}.{}", index, ext));
        tokio::fs::copy(&source, &target)
            .await
            .with_context(|| format!("Failed to copy sound effect {}", source.display()))?;
        Ok(Some(target))
    }

    /// Joins segments with pauses, normalizes loudness, applies fades and
    /// writes `output`. Returns the probed duration in seconds.
    pub(crate) async fn master(&self, work: &Path, segments: &[Segment], output: &Path) -> Result<f64> {
        if segments.is_empty() {
            return Err(DramaError::MediaToolchain("No audio to master".to_string()).into());
        }

        let mut silences: HashMap<u64, PathBuf> = HashMap::new();
        let mut inputs = Vec::with_capacity(segments.len() * 2);
        for (i, segment) in segments.iter().enumerate() {
            if i > 0 {
                let pause = pause_between(segments[i - 1].kind, segment.kind, &self.audio);
                if pause > 0.0 {
                    let millis = (pause * 1000.0).round() as u64;
                    let path = match silences.get(&millis) {
                        Some(path) => path.clone(),
                        None => {
                            let path = work.join(format!("silence_{}ms.mp3", millis));
                            self.media.silence(pause, &path).await?;
                            silences.insert(millis, path.clone());
                            path
                        }
                    };
                    inputs.push(path);
                }
            }
            inputs.push(segment.path.clone());
        }

        let combined = work.join("combined.mp3");
        let normalized = work.join("normalized.mp3");
        self.media.concat(&inputs, &combined).await?;
        let targets = LoudnessTargets {
            integrated: self.audio.loudness_target,
            true_peak: self.audio.true_peak,
            range: self.audio.loudness_range,
        };
        self.media.normalize_loudness(&combined, &normalized, &targets).await?;

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.media
            .fade(&normalized, output, self.audio.fade_in_seconds, self.audio.fade_out_seconds)
            .await?;

        let duration = self.media.probe_duration(output).await?;
        info!("Mastered {} ({:.1}s)", output.display(), duration);
        Ok(duration)
    }
}
