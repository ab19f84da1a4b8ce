use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const AUDIO_EXTENSIONS: [&str; 3] = ["mp3", "wav", "ogg"];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SfxEntry {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub file: String,
}

#[async_trait]
pub trait SfxLibrary: Send + Sync {
    /// Local file for `sfx_id`, or `None` when the library has no such effect.
    async fn resolve(&self, sfx_id: &str) -> Result<Option<PathBuf>>;

    /// Effects offered to the author stage.
    fn catalog(&self) -> &[SfxEntry];
}

/// Sound effects stored in one directory, described by an optional
/// `catalog.json`; without a catalog every audio file is an effect named by
/// its file stem.
pub struct LocalSfxLibrary {
    root: PathBuf,
    entries: Vec<SfxEntry>,
}

impl LocalSfxLibrary {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let catalog_path = root.join("catalog.json");

        let entries = if catalog_path.exists() {
            let content = fs::read_to_string(&catalog_path)
                .with_context(|| format!("Failed to read {}", catalog_path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", catalog_path.display()))?
        } else {
            scan_directory(&root)?
        };

        info!("Loaded {} sound effects from {}", entries.len(), root.display());
        Ok(Self { root, entries })
    }

    pub fn empty() -> Self {
        Self {
            root: PathBuf::new(),
            entries: Vec::new(),
        }
    }
}

fn scan_directory(root: &Path) -> Result<Vec<SfxEntry>> {
    let mut entries = Vec::new();
    if !root.is_dir() {
        warn!("Sound effect folder {} does not exist", root.display());
        return Ok(entries);
    }
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        let is_audio = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| AUDIO_EXTENSIONS.contains(&e.to_lowercase().as_str()));
        if !is_audio {
            continue;
        }
        if let (Some(stem), Some(name)) = (path.file_stem(), path.file_name()) {
            entries.push(SfxEntry {
                id: stem.to_string_lossy().to_string(),
                description: String::new(),
                file: name.to_string_lossy().to_string(),
            });
        }
    }
    entries.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(entries)
}

fn is_safe_id(sfx_id: &str) -> bool {
    !sfx_id.is_empty() && !sfx_id.contains(['/', '\\']) && !sfx_id.contains("..")
}

#[async_trait]
impl SfxLibrary for LocalSfxLibrary {
    async fn resolve(&self, sfx_id: &str) -> Result<Option<PathBuf>> {
        if !is_safe_id(sfx_id) {
            return Ok(None);
        }

        if let Some(entry) = self.entries.iter().find(|e| e.id == sfx_id) {
            let path = self.root.join(&entry.file);
            if tokio::fs::try_exists(&path).await? {
                return Ok(Some(path));
            }
            warn!("Catalog entry {} points to missing file {}", sfx_id, path.display());
            return Ok(None);
        }

        for ext in AUDIO_EXTENSIONS {
            let path = self.root.join(format!("{}.{}", sfx_id, ext));
            if tokio::fs::try_exists(&path).await? {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    fn catalog(&self) -> &[SfxEntry] {
        &self.entries
    }
}
