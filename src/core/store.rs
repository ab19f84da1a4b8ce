use crate::core::error::DramaError;
use crate::core::io::Storage;
use crate::core::state::StoryRecord;
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Story ids become directory names, so only canonical UUIDs are accepted.
pub fn is_story_id(id: &str) -> bool {
    Uuid::parse_str(id).is_ok_and(|u| u.hyphenated().to_string() == id)
}

/// Durable story records, one JSON document per story id.
///
/// Layout under the data folder:
/// `stories/<id>/record.json`, `stories/<id>/work/` (scratch audio),
/// `stories/<id>/lines/<line_id>.mp3`, `stories/<id>/story.mp3`.
#[derive(Clone)]
pub struct StoryStore {
    root: PathBuf,
    storage: Arc<dyn Storage>,
}

impl StoryStore {
    pub fn new(data_folder: impl Into<PathBuf>, storage: Arc<dyn Storage>) -> Self {
        Self {
            root: data_folder.into(),
            storage,
        }
    }

    pub fn story_dir(&self, id: &str) -> PathBuf {
        self.root.join("stories").join(id)
    }

    pub fn work_dir(&self, id: &str) -> PathBuf {
        self.story_dir(id).join("work")
    }

    pub fn line_audio_path(&self, id: &str, line_id: &str) -> PathBuf {
        self.story_dir(id).join("lines").join(format!("{}.mp3", line_id))
    }

    pub fn final_audio_path(&self, id: &str) -> PathBuf {
        self.story_dir(id).join("story.mp3")
    }

    fn record_path(&self, id: &str) -> String {
        path_str(&self.story_dir(id).join("record.json"))
    }

    pub async fn exists(&self, id: &str) -> Result<bool> {
        if !is_story_id(id) {
            return Ok(false);
        }
        self.storage.exists(&self.record_path(id)).await
    }

    /// `None` for unknown ids, including strings that are not story ids.
    pub async fn load(&self, id: &str) -> Result<Option<StoryRecord>> {
        if !self.exists(id).await? {
            return Ok(None);
        }
        let path = self.record_path(id);
        let bytes = self.storage.read(&path).await?;
        let record = serde_json::from_slice(&bytes)
            .with_context(|| format!("Corrupt story record {}", path))?;
        Ok(Some(record))
    }

    /// Persists the whole record (state, script, character rows, line rows) in one atomic write.
    pub async fn save(&self, record: &mut StoryRecord) -> Result<()> {
        if !is_story_id(&record.id) {
            return Err(DramaError::Validation(format!("{:?} is not a story id", record.id)).into());
        }
        record.updated_at = Utc::now();
        let content = serde_json::to_vec_pretty(record)?;
        self.storage
            .write_atomic(&self.record_path(&record.id), &content)
            .await
    }

    pub async fn list_ids(&self) -> Result<Vec<String>> {
        let stories = path_str(&self.root.join("stories"));
        let entries = self.storage.list(&stories).await?;
        Ok(entries
            .iter()
            .filter_map(|e| Path::new(e).file_name())
            .map(|n| n.to_string_lossy().to_string())
            .filter(|id| is_story_id(id))
            .collect())
    }

    pub async fn clear_work_dir(&self, id: &str) -> Result<()> {
        self.storage.delete(&path_str(&self.work_dir(id))).await
    }
}

pub fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
