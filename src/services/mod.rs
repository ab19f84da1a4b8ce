use async_trait::async_trait;

pub mod authoring;
pub mod json_repair;
pub mod llm;
pub mod media;
pub mod postprocess;
pub mod production;
pub mod prompts;
pub mod regenerate;
pub mod sfx;
#[cfg(test)]
pub(crate) mod testing;
pub mod tts;
pub mod voices;
pub mod workflow;

/// Receives human-readable progress while a job runs.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, progress: String);
}

/// Discards progress.
pub struct NoProgress;

#[async_trait]
impl ProgressReporter for NoProgress {
    async fn report(&self, _progress: String) {}
}
