//! Script authoring: author, reviewer, optional revision and optional
//! TTS-optimizer, followed by deterministic post-processing.

use crate::core::error::DramaError;
use crate::core::state::{PipelineLog, ReviewIssue, ReviewResult, Script, StageRecord, StoryRequest, TokenUsage};
use crate::services::json_repair::{parse_with_fallback, ParseOutcome};
use crate::services::llm::{LlmClient, LlmRequest, LlmResponse};
use crate::services::postprocess::post_process;
use crate::services::prompts::{self, AgeBand};
use crate::services::sfx::SfxEntry;
use crate::services::ProgressReporter;
use anyhow::{Context, Result};
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

fn default_max_tokens() -> u32 {
    8192
}
fn default_temperature() -> f32 {
    0.7
}
fn default_language() -> String {
    "German".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StageSettings {
    /// Falls back to the provider's configured model.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub thinking_budget: Option<u32>,
}

fn default_author() -> StageSettings {
    StageSettings {
        model: None,
        max_tokens: 16000,
        temperature: 0.9,
        thinking_budget: Some(4096),
    }
}
fn default_reviewer() -> StageSettings {
    StageSettings {
        model: None,
        max_tokens: 4000,
        temperature: 0.2,
        thinking_budget: None,
    }
}
fn default_revision() -> StageSettings {
    StageSettings {
        model: None,
        max_tokens: 16000,
        temperature: 0.7,
        thinking_budget: Some(2048),
    }
}
fn default_optimizer() -> StageSettings {
    StageSettings {
        model: None,
        max_tokens: 16000,
        temperature: 0.3,
        thinking_budget: None,
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuthoringConfig {
    #[serde(default = "default_author")]
    pub author: StageSettings,
    #[serde(default = "default_reviewer")]
    pub reviewer: StageSettings,
    #[serde(default = "default_revision")]
    pub revision: StageSettings,
    #[serde(default = "default_optimizer")]
    pub optimizer: StageSettings,
    /// Text file with the TTS-optimizer instruction; the stage is skipped without it.
    #[serde(default)]
    pub optimizer_instruction_file: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
}

impl Default for AuthoringConfig {
    fn default() -> Self {
        Self {
            author: default_author(),
            reviewer: default_reviewer(),
            revision: default_revision(),
            optimizer: default_optimizer(),
            optimizer_instruction_file: None,
            language: default_language(),
        }
    }
}

fn approved_by_default() -> bool {
    true
}

// Reviewers sometimes return bare strings instead of issue objects.
#[derive(Deserialize)]
struct RawReview {
    #[serde(default = "approved_by_default")]
    approved: bool,
    #[serde(default)]
    issues: Vec<RawIssue>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawIssue {
    Text(String),
    Detailed {
        #[serde(default)]
        severity: String,
        #[serde(alias = "issue", alias = "message")]
        description: String,
    },
}

impl From<RawReview> for ReviewResult {
    fn from(raw: RawReview) -> Self {
        ReviewResult {
            approved: raw.approved,
            issues: raw
                .issues
                .into_iter()
                .map(|i| match i {
                    RawIssue::Text(description) => ReviewIssue {
                        severity: String::new(),
                        description,
                    },
                    RawIssue::Detailed { severity, description } => ReviewIssue { severity, description },
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthoredScript {
    pub script: Script,
    pub log: PipelineLog,
    pub warnings: Vec<String>,
}

fn parse_stage<T: DeserializeOwned>(stage: &'static str, raw: &str) -> Result<T> {
    let outcome = parse_with_fallback(raw);
    if let ParseOutcome::RepairedOk(_, repair) = &outcome {
        info!("Recovered {} output ({:?})", stage, repair);
    }
    outcome.into_result(stage)
}

fn has_dialogue(script: &Script) -> bool {
    script.dialogue_count() > 0
}

fn line_shape(script: &Script) -> Vec<usize> {
    script.scenes.iter().map(|s| s.lines.len()).collect()
}

pub struct ScriptAuthoring {
    llm: Arc<dyn LlmClient>,
    config: AuthoringConfig,
    optimizer_instruction: Option<String>,
    sfx_catalog: Vec<SfxEntry>,
}

impl ScriptAuthoring {
    pub fn new(llm: Arc<dyn LlmClient>, config: AuthoringConfig, sfx_catalog: Vec<SfxEntry>) -> Result<Self> {
        let optimizer_instruction = match &config.optimizer_instruction_file {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read optimizer instruction {}", path))?;
                Some(text).filter(|t| !t.trim().is_empty())
            }
            None => None,
        };
        Ok(Self {
            llm,
            config,
            optimizer_instruction,
            sfx_catalog,
        })
    }

    pub fn with_optimizer_instruction(mut self, instruction: Option<String>) -> Self {
        self.optimizer_instruction = instruction;
        self
    }

    async fn call_stage(
        &self,
        agent: &str,
        settings: &StageSettings,
        system: String,
        user: String,
    ) -> Result<(LlmResponse, StageRecord)> {
        let model = settings
            .model
            .clone()
            .unwrap_or_else(|| self.llm.default_model().to_string());
        let request = LlmRequest {
            model: model.clone(),
            system,
            user,
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            thinking_budget: settings.thinking_budget,
        };

        let started = Instant::now();
        let response = self
            .llm
            .call(&request)
            .await
            .with_context(|| format!("{} stage failed", agent))?;
        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "{} stage finished in {} ms ({} in / {} out tokens)",
            agent, duration_ms, response.tokens_in, response.tokens_out
        );

        let record = StageRecord {
            agent: agent.to_string(),
            model,
            duration_ms,
            tokens: TokenUsage {
                input: response.tokens_in,
                output: response.tokens_out,
            },
            review_result: None,
        };
        Ok((response, record))
    }

    pub async fn run(&self, request: &StoryRequest, progress: &dyn ProgressReporter) -> Result<AuthoredScript> {
        let band = AgeBand::for_age(request.age);
        let mut log = PipelineLog::default();

        // 1. Author
        progress.report("Writing script".to_string()).await;
        let system = prompts::author_system(band, &request.constraints, &self.sfx_catalog, &self.config.language);
        let user = prompts::author_user(&request.prompt, request.age);
        let (response, record) = self.call_stage("author", &self.config.author, system, user).await?;
        log.push(record);
        let mut script: Script = parse_stage("author", &response.text)?;
        if !has_dialogue(&script) {
            return Err(DramaError::Parse {
                stage: "author",
                message: "script contains no dialogue lines".to_string(),
            }
            .into());
        }

        // 2. Reviewer
        progress.report("Reviewing script".to_string()).await;
        let script_json = serde_json::to_string_pretty(&script)?;
        let (response, mut record) = self
            .call_stage(
                "reviewer",
                &self.config.reviewer,
                prompts::REVIEWER_SYSTEM.to_string(),
                prompts::reviewer_user(&script_json, band),
            )
            .await?;
        let review: ReviewResult = match parse_stage::<RawReview>("reviewer", &response.text) {
            Ok(raw) => raw.into(),
            Err(e) => {
                warn!("Treating review as approved: {:#}", e);
                ReviewResult {
                    approved: true,
                    issues: Vec::new(),
                }
            }
        };
        record.review_result = Some(review.clone());
        log.push(record);

        // 3. Revision
        let blocking: Vec<ReviewIssue> = review.issues.iter().filter(|i| !i.is_minor()).cloned().collect();
        if !review.approved && !blocking.is_empty() {
            progress.report("Revising script".to_string()).await;
            let (response, record) = self
                .call_stage(
                    "revision",
                    &self.config.revision,
                    prompts::revision_system(band, &self.config.language),
                    prompts::revision_user(&script_json, &review.issues),
                )
                .await?;
            log.push(record);
            match parse_stage::<Script>("revision", &response.text) {
                Ok(revised) if has_dialogue(&revised) => script = revised,
                Ok(_) => warn!("Revision returned an empty script; keeping the original"),
                Err(e) => warn!("Keeping the original script: {:#}", e),
            }
        } else {
            info!("Review approved the script ({} issues)", review.issues.len());
        }

        // 4. TTS optimizer
        if let Some(instruction) = &self.optimizer_instruction {
            progress.report("Optimizing for speech".to_string()).await;
            let (response, record) = self
                .call_stage(
                    "optimizer",
                    &self.config.optimizer,
                    prompts::optimizer_system(instruction),
                    prompts::optimizer_user(&serde_json::to_string_pretty(&script)?),
                )
                .await?;
            log.push(record);
            match parse_stage::<Script>("optimizer", &response.text) {
                Ok(optimized) if line_shape(&optimized) == line_shape(&script) => script = optimized,
                Ok(_) => warn!("Optimizer changed the script structure; keeping the previous version"),
                Err(e) => warn!("Keeping the previous script: {:#}", e),
            }
        }

        let warnings = post_process(&mut script, band);
        info!(
            "Authored \"{}\": {} lines, {} characters, {} tokens",
            script.title,
            script.dialogue_count(),
            script.characters.len(),
            log.total_tokens.input + log.total_tokens.output
        );

        Ok(AuthoredScript { script, log, warnings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{is_narrator, CharacterConstraints};
    use crate::services::testing::{sample_script_json, MockLlmClient};
    use crate::services::NoProgress;

    fn request(age: u32) -> StoryRequest {
        StoryRequest {
            prompt: "a knight returns a lost dragon egg".to_string(),
            age,
            constraints: CharacterConstraints::default(),
        }
    }

    fn authoring(llm: MockLlmClient) -> ScriptAuthoring {
        ScriptAuthoring::new(Arc::new(llm), AuthoringConfig::default(), Vec::new()).unwrap()
    }

    #[tokio::test]
    async fn test_approved_script_skips_revision() -> Result<()> {
        let llm = MockLlmClient::new(sample_script_json(20));
        let requests = llm.requests.clone();
        let result = authoring(llm).run(&request(6), &NoProgress).await?;

        let agents: Vec<&str> = result.log.stages.iter().map(|s| s.agent.as_str()).collect();
        assert_eq!(agents, vec!["author", "reviewer"]);
        assert!(result.script.dialogue_count() >= 40);
        assert!(result.script.narrator().is_some());
        assert_eq!(result.log.total_tokens.input, 200);

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].thinking_budget, Some(4096));
        assert_eq!(requests[0].model, "mock-model");
        assert!(requests[0].system.contains("at least 40 dialogue lines"));
        Ok(())
    }

    #[tokio::test]
    async fn test_major_issue_triggers_revision() -> Result<()> {
        let llm = MockLlmClient::new(sample_script_json(20))
            .with_review(r#"{"approved": false, "issues": [{"severity": "major", "description": "too scary"}]}"#)
            .with_revision(sample_script_json(25));
        let result = authoring(llm).run(&request(6), &NoProgress).await?;

        let agents: Vec<&str> = result.log.stages.iter().map(|s| s.agent.as_str()).collect();
        assert_eq!(agents, vec!["author", "reviewer", "revision"]);
        assert!(!result.log.stages[1].review_result.as_ref().unwrap().approved);
        // 25 rounds of 2 lines plus the introduction.
        assert_eq!(result.script.dialogue_count(), 51);
        Ok(())
    }

    #[tokio::test]
    async fn test_minor_issues_only_do_not_revise() -> Result<()> {
        let llm = MockLlmClient::new(sample_script_json(20))
            .with_review(r#"{"approved": false, "issues": [{"severity": "minor", "description": "typo"}]}"#);
        let result = authoring(llm).run(&request(6), &NoProgress).await?;
        assert_eq!(result.log.stages.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_unparseable_stages_fail_open() -> Result<()> {
        let llm = MockLlmClient::new(sample_script_json(20))
            .with_review("I liked it a lot!")
            .with_optimizer("sorry, no JSON today");
        let result = authoring(llm)
            .with_optimizer_instruction(Some("Make it sound natural.".to_string()))
            .run(&request(6), &NoProgress)
            .await?;

        let agents: Vec<&str> = result.log.stages.iter().map(|s| s.agent.as_str()).collect();
        assert_eq!(agents, vec!["author", "reviewer", "optimizer"]);
        assert!(result.log.stages[1].review_result.as_ref().unwrap().approved);
        assert_eq!(result.script.dialogue_count(), 41);
        Ok(())
    }

    #[tokio::test]
    async fn test_string_issues_are_accepted() -> Result<()> {
        let llm = MockLlmClient::new(sample_script_json(20))
            .with_review("```json\n{\"approved\": false, \"issues\": [\"Ember is never introduced\"]}\n```")
            .with_revision("not json");
        let result = authoring(llm).run(&request(6), &NoProgress).await?;
        let review = result.log.stages[1].review_result.clone().unwrap();
        assert_eq!(review.issues[0].description, "Ember is never introduced");
        assert_eq!(result.log.stages.len(), 3);
        assert_eq!(result.script.dialogue_count(), 41);
        Ok(())
    }

    #[tokio::test]
    async fn test_author_parse_failure_is_fatal() {
        let llm = MockLlmClient::new("Once upon a time...".to_string());
        let err = authoring(llm).run(&request(6), &NoProgress).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DramaError>(),
            Some(DramaError::Parse { stage: "author", .. })
        ));
    }

    #[tokio::test]
    async fn test_every_character_is_introduced_by_the_narrator() -> Result<()> {
        let llm = MockLlmClient::new(sample_script_json(20));
        let result = authoring(llm).run(&request(6), &NoProgress).await?;
        assert!(!result.warnings.iter().any(|w| w.contains("before the narrator")));

        let script = &result.script;
        for character in script.characters.iter().filter(|c| !is_narrator(&c.name)) {
            let lines: Vec<_> = script.flatten().into_iter().filter_map(|p| p.line.as_dialogue()).collect();
            let first = lines.iter().position(|l| l.speaker == character.name).unwrap();
            assert!(lines[..first]
                .iter()
                .any(|l| is_narrator(&l.speaker) && l.text.contains(&character.name)));
        }
        Ok(())
    }
}
