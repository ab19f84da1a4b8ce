use crate::core::config::Config;
use crate::core::error::DramaError;
use crate::core::io::NativeStorage;
use crate::core::state::{
    is_narrator, CharacterConstraints, CharacterRow, GenerationStatus, Script, StoryRecord, StoryRequest, VoiceMap,
};
use crate::core::store::StoryStore;
use crate::services::authoring::ScriptAuthoring;
use crate::services::llm::create_llm;
use crate::services::media::FfmpegToolchain;
use crate::services::production::{character_rows, AudioProducer};
use crate::services::regenerate::{apply_line_replacement, apply_voice_swap};
use crate::services::sfx::{LocalSfxLibrary, SfxLibrary};
use crate::services::tts::create_tts_client;
use crate::services::voices::{assign_voices, VoicePool};
use crate::services::ProgressReporter;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorySummary {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub audio_ref: Option<String>,
    pub duration_seconds: Option<f64>,
    pub characters: Vec<CharacterRow>,
    pub line_count: usize,
    pub completed_at: Option<DateTime<Utc>>,
}

/// What a caller sees for a story id, derived from the durable record alone.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusView {
    NotFound,
    WaitingForScript { progress: Option<String> },
    Preview { script: Script, voice_map: VoiceMap },
    GeneratingAudio { progress: Option<String> },
    Done { summary: StorySummary },
    Error { message: String },
}

impl StatusView {
    pub fn from_record(record: Option<&StoryRecord>) -> Self {
        let Some(record) = record else {
            return StatusView::NotFound;
        };
        let generation = &record.generation;
        match generation.status {
            GenerationStatus::WaitingForScript => StatusView::WaitingForScript {
                progress: generation.progress.clone(),
            },
            GenerationStatus::Preview => match &record.script {
                Some(script) => StatusView::Preview {
                    script: script.clone(),
                    voice_map: record.voice_map.clone().unwrap_or_default(),
                },
                None => StatusView::Error {
                    message: "Preview has no script".to_string(),
                },
            },
            GenerationStatus::GeneratingAudio => StatusView::GeneratingAudio {
                progress: generation.progress.clone(),
            },
            GenerationStatus::Done => StatusView::Done {
                summary: StorySummary {
                    id: record.id.clone(),
                    title: record.title.clone().unwrap_or_default(),
                    summary: record.script.as_ref().map(|s| s.summary.clone()).unwrap_or_default(),
                    audio_ref: record.audio_ref.clone(),
                    duration_seconds: record.duration_seconds,
                    characters: record.characters.clone(),
                    line_count: record.lines.len(),
                    completed_at: generation.completed_at,
                },
            },
            GenerationStatus::Error => StatusView::Error {
                message: generation.error.clone().unwrap_or_else(|| "Unknown error".to_string()),
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StatusView::Done { .. } | StatusView::Error { .. } | StatusView::NotFound)
    }
}

struct CachedJob {
    lock: Arc<tokio::sync::Mutex<()>>,
    terminal_since: Option<Instant>,
}

struct Inner {
    store: StoryStore,
    authoring: ScriptAuthoring,
    producer: AudioProducer,
    voices: VoicePool,
    jobs: Mutex<HashMap<String, CachedJob>>,
    retention: Duration,
}

impl Inner {
    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, CachedJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.jobs()
            .entry(id.to_string())
            .or_insert_with(|| CachedJob {
                lock: Arc::new(tokio::sync::Mutex::new(())),
                terminal_since: None,
            })
            .lock
            .clone()
    }

    /// Key lock for a story that exists on disk; unknown ids never enter the cache.
    async fn lock_existing(&self, id: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let cached = self.jobs().get(id).map(|job| job.lock.clone());
        if let Some(lock) = cached {
            return Ok(lock);
        }
        if !self.store.exists(id).await? {
            return Err(DramaError::NotFound(format!("story {}", id)).into());
        }
        Ok(self.lock_for(id))
    }

    fn mark_terminal(&self, id: &str) {
        if let Some(job) = self.jobs().get_mut(id) {
            job.terminal_since.get_or_insert_with(Instant::now);
        }
    }

    /// Loads the record under its key lock, requires `expected` status, applies `f` and saves.
    async fn update<F>(&self, id: &str, expected: Option<GenerationStatus>, f: F) -> Result<()>
    where
        F: FnOnce(&mut StoryRecord) -> Result<()> + Send,
    {
        let lock = self.lock_existing(id).await?;
        let _guard = lock.lock().await;

        let mut record = self.load_in(id, expected).await?;
        f(&mut record)?;
        if record.generation.status.is_terminal() {
            self.mark_terminal(id);
        }
        self.store.save(&mut record).await
    }

    /// Loads a record and checks its status. Terminal records mark their
    /// cache entry so it can age out.
    async fn load_in(&self, id: &str, expected: Option<GenerationStatus>) -> Result<StoryRecord> {
        let record = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| DramaError::NotFound(format!("story {}", id)))?;
        if record.generation.status.is_terminal() {
            self.mark_terminal(id);
        }
        if let Some(expected) = expected {
            if record.generation.status != expected {
                return Err(DramaError::NotFound(format!(
                    "story {} is not {:?}",
                    id, expected
                ))
                .into());
            }
        }
        Ok(record)
    }

    async fn run_authoring(self: Arc<Self>, id: String) {
        let request = match self.store.load(&id).await {
            Ok(Some(record)) => record.request,
            Ok(None) => {
                warn!("Story {} vanished before authoring", id);
                return;
            }
            Err(e) => {
                error!("Failed to load story {}: {:#}", id, e);
                return;
            }
        };

        let reporter = RecordProgress {
            inner: self.clone(),
            id: id.clone(),
        };
        let result = match self.authoring.run(&request, &reporter).await {
            Ok(authored) => {
                reporter.report("Assigning voices".to_string()).await;
                let voice_map = assign_voices(&authored.script.characters, &self.voices);
                self.update(&id, Some(GenerationStatus::WaitingForScript), move |r| {
                    r.title = Some(authored.script.title.clone());
                    r.characters = character_rows(&authored.script, &voice_map);
                    r.script = Some(authored.script);
                    r.voice_map = Some(voice_map);
                    r.pipeline_log = Some(authored.log);
                    r.generation.transition(GenerationStatus::Preview)
                })
                .await
            }
            Err(e) => {
                error!("Authoring failed for {}: {:#}", id, e);
                let message = format!("{:#}", e);
                self.update(&id, None, move |r| r.generation.fail(message)).await
            }
        };

        match result {
            Ok(()) => info!("Story {} is ready for preview", id),
            Err(e) => error!("Failed to record authoring outcome for {}: {:#}", id, e),
        }
    }

    async fn run_production(self: Arc<Self>, id: String) {
        let record = match self.store.load(&id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("Story {} vanished before production", id);
                return;
            }
            Err(e) => {
                error!("Failed to load story {}: {:#}", id, e);
                return;
            }
        };

        let reporter = RecordProgress {
            inner: self.clone(),
            id: id.clone(),
        };
        let result = match self.producer.produce(&record, &reporter).await {
            Ok(produced) => {
                self.update(&id, Some(GenerationStatus::GeneratingAudio), move |r| {
                    r.audio_ref = Some(produced.audio_ref);
                    r.duration_seconds = Some(produced.duration_seconds);
                    r.characters = produced.characters;
                    r.lines = produced.lines;
                    r.generation.transition(GenerationStatus::Done)
                })
                .await
            }
            Err(e) => {
                error!("Production failed for {}: {:#}", id, e);
                let message = format!("{:#}", e);
                self.update(&id, None, move |r| r.generation.fail(message)).await
            }
        };

        match result {
            Ok(()) => info!("Story {} is done", id),
            Err(e) => error!("Failed to record production outcome for {}: {:#}", id, e),
        }
    }
}

/// Writes progress into the durable record.
struct RecordProgress {
    inner: Arc<Inner>,
    id: String,
}

#[async_trait]
impl ProgressReporter for RecordProgress {
    async fn report(&self, progress: String) {
        debug!("{}: {}", self.id, progress);
        let result = self
            .inner
            .update(&self.id, None, move |r| r.generation.set_progress(progress))
            .await;
        if let Err(e) = result {
            warn!("Could not record progress for {}: {:#}", self.id, e);
        }
    }
}

/// Drives stories through authoring, preview, production and edits.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        store: StoryStore,
        authoring: ScriptAuthoring,
        producer: AudioProducer,
        voices: VoicePool,
        retention: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                authoring,
                producer,
                voices,
                jobs: Mutex::new(HashMap::new()),
                retention,
            }),
        }
    }

    /// Wires the real providers, the local sound library and ffmpeg from `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let llm = create_llm(&config.llm)?;
        let tts = create_tts_client(&config.tts)?;
        let sfx = LocalSfxLibrary::open(&config.sfx_folder)?;
        let voices = VoicePool::load(Path::new(&config.voices_file))?;
        let store = StoryStore::new(&config.data_folder, Arc::new(NativeStorage::new()));

        let authoring = ScriptAuthoring::new(Arc::from(llm), config.authoring.clone(), sfx.catalog().to_vec())?;
        let producer = AudioProducer::new(
            Arc::from(tts),
            Arc::new(sfx),
            Arc::new(FfmpegToolchain::new(&config.audio.bitrate, config.audio.sample_rate)),
            store.clone(),
            config.audio.clone(),
        );
        Ok(Self::new(
            store,
            authoring,
            producer,
            voices,
            Duration::from_secs(config.orchestrator.job_retention_seconds),
        ))
    }

    pub fn voices(&self) -> &VoicePool {
        &self.inner.voices
    }

    pub async fn submit(&self, prompt: &str, age: u32, constraints: CharacterConstraints) -> Result<String> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(DramaError::Validation("prompt must not be empty".to_string()).into());
        }
        self.purge_expired();

        let id = Uuid::new_v4().to_string();
        let mut record = StoryRecord::new(
            id.clone(),
            StoryRequest {
                prompt: prompt.to_string(),
                age,
                constraints,
            },
        );
        self.inner
            .store
            .save(&mut record)
            .await
            .context("Failed to create story record")?;
        self.inner.lock_for(&id);
        info!("Submitted story {} (age {})", id, age);

        let inner = self.inner.clone();
        let job_id = id.clone();
        tokio::spawn(async move { inner.run_authoring(job_id).await });
        Ok(id)
    }

    /// Accepts the preview and starts production. Anything but a story in
    /// preview is `NotFound`, so a second confirm cannot start production twice.
    pub async fn confirm(&self, id: &str) -> Result<()> {
        self.inner
            .update(id, Some(GenerationStatus::Preview), |r| {
                r.generation.transition(GenerationStatus::GeneratingAudio)
            })
            .await?;
        info!("Story {} confirmed", id);

        let inner = self.inner.clone();
        let job_id = id.to_string();
        tokio::spawn(async move { inner.run_production(job_id).await });
        Ok(())
    }

    pub async fn get_status(&self, id: &str) -> Result<StatusView> {
        let record = self.inner.store.load(id).await?;
        Ok(StatusView::from_record(record.as_ref()))
    }

    /// Re-points one character at another voice while the story is in preview.
    pub async fn update_voice_map(&self, id: &str, character: &str, voice_id: &str) -> Result<()> {
        let voices = &self.inner.voices;
        self.inner
            .update(id, Some(GenerationStatus::Preview), |r| {
                let script = r
                    .script
                    .as_ref()
                    .ok_or_else(|| DramaError::Validation("preview has no script".to_string()))?;
                let name = script
                    .characters
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(character.trim()))
                    .map(|c| c.name.clone())
                    .ok_or_else(|| DramaError::Validation(format!("Unknown character {}", character)))?;
                if is_narrator(&name) {
                    return Err(DramaError::Validation("The narrator voice cannot be changed".to_string()).into());
                }
                if voice_id == voices.narrator_voice_id || !voices.contains(voice_id) {
                    return Err(DramaError::Validation(format!("Voice {} is not available", voice_id)).into());
                }

                let voice_map = r.voice_map.get_or_insert_with(VoiceMap::new);
                voice_map.insert(name, voice_id.to_string());
                r.characters = character_rows(script, voice_map);
                Ok(())
            })
            .await
    }

    /// Gives a character of a finished story a new voice and rebuilds the track.
    pub async fn swap_voice(&self, id: &str, character: &str, voice_id: &str) -> Result<()> {
        let lock = self.inner.lock_existing(id).await?;
        let _guard = lock.lock().await;

        let mut record = self.inner.load_in(id, Some(GenerationStatus::Done)).await?;
        let dirty = apply_voice_swap(&mut record, character, voice_id, &self.inner.voices)?;
        self.inner.producer.rebuild(&mut record, &dirty).await?;
        self.inner.store.save(&mut record).await?;
        info!("Story {}: {} now speaks with {}", id, character, voice_id);
        Ok(())
    }

    /// Rewrites one line of a finished story and rebuilds the track.
    pub async fn replace_line(&self, id: &str, line_id: &str, text: &str, emotion: Option<&str>) -> Result<()> {
        let lock = self.inner.lock_existing(id).await?;
        let _guard = lock.lock().await;

        let mut record = self.inner.load_in(id, Some(GenerationStatus::Done)).await?;
        let dirty = apply_line_replacement(&mut record, line_id, text, emotion)?;
        self.inner.producer.rebuild(&mut record, &dirty).await?;
        self.inner.store.save(&mut record).await?;
        info!("Story {}: replaced line {}", id, line_id);
        Ok(())
    }

    /// Picks up stories a previous process left mid-flight: authoring and
    /// production both start over from the durable record. Returns the
    /// number of resumed jobs.
    pub async fn recover(&self) -> Result<usize> {
        let mut resumed = 0;
        for id in self.inner.store.list_ids().await? {
            let record = match self.inner.store.load(&id).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Skipping unreadable story {}: {:#}", id, e);
                    continue;
                }
            };
            let inner = self.inner.clone();
            match record.generation.status {
                GenerationStatus::WaitingForScript => {
                    inner.lock_for(&id);
                    tokio::spawn(async move { inner.run_authoring(id).await });
                }
                GenerationStatus::GeneratingAudio => {
                    inner.lock_for(&id);
                    tokio::spawn(async move { inner.run_production(id).await });
                }
                _ => continue,
            }
            resumed += 1;
        }
        if resumed > 0 {
            info!("Resumed {} interrupted stories", resumed);
        }
        Ok(resumed)
    }

    /// Ids currently held in the job cache; diagnostics only.
    pub fn active_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.jobs().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drops cached terminal jobs older than the retention window that nobody holds.
    pub fn purge_expired(&self) -> usize {
        let retention = self.inner.retention;
        let mut jobs = self.inner.jobs();
        let before = jobs.len();
        jobs.retain(|_, job| {
            let expired = job.terminal_since.is_some_and(|t| t.elapsed() >= retention);
            !(expired && Arc::strong_count(&job.lock) == 1)
        });
        let purged = before - jobs.len();
        if purged > 0 {
            debug!("Purged {} finished jobs from the cache", purged);
        }
        purged
    }
}
