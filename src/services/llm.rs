use crate::core::error::DramaError;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

// --- Config ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "gemini", "openai" or "ollama"
    pub gemini: Option<GeminiConfig>,
    pub openai: Option<OpenAIConfig>,
    pub ollama: Option<OllamaConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

// --- Collaborator contract ---

#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub thinking_budget: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LlmResponse {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn call(&self, request: &LlmRequest) -> Result<LlmResponse>;

    /// Model used when a stage does not name one.
    fn default_model(&self) -> &str;
}

fn require_key(provider: &str, key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(DramaError::Configuration(format!("{} api_key is empty", provider)).into());
    }
    Ok(())
}

pub fn create_llm(config: &LlmConfig) -> Result<Box<dyn LlmClient>> {
    match config.provider.as_str() {
        "gemini" => {
            let cfg = config
                .gemini
                .as_ref()
                .ok_or_else(|| DramaError::Configuration("Gemini config missing".to_string()))?;
            require_key("Gemini", &cfg.api_key)?;
            Ok(Box::new(GeminiClient::new(&cfg.api_key, &cfg.model)))
        }
        "openai" => {
            let cfg = config
                .openai
                .as_ref()
                .ok_or_else(|| DramaError::Configuration("OpenAI config missing".to_string()))?;
            require_key("OpenAI", &cfg.api_key)?;
            Ok(Box::new(OpenAIClient::new(
                &cfg.api_key,
                &cfg.model,
                cfg.base_url.as_deref(),
            )))
        }
        "ollama" => {
            let cfg = config
                .ollama
                .as_ref()
                .ok_or_else(|| DramaError::Configuration("Ollama config missing".to_string()))?;
            Ok(Box::new(OllamaClient::new(&cfg.base_url, &cfg.model)))
        }
        other => Err(DramaError::Configuration(format!("Unknown LLM provider: {}", other)).into()),
    }
}

// --- Gemini ---

#[derive(Debug)]
struct GeminiClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    system_instruction: GeminiSystemInstruction,
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<GeminiThinkingConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiThinkingConfig {
    thinking_budget: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    thought: bool,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    thoughts_token_count: u64,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

impl GeminiClient {
    /// The key travels in a header so it never shows up in transport errors.
    fn build_request(&self, request: &LlmRequest) -> Result<reqwest::Request> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            request.model
        );

        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: request.user.clone(),
                }],
            }],
            system_instruction: GeminiSystemInstruction {
                parts: vec![GeminiPart {
                    text: request.system.clone(),
                }],
            },
            generation_config: GeminiGenerationConfig {
                max_output_tokens: request.max_tokens,
                temperature: request.temperature,
                thinking_config: request
                    .thinking_budget
                    .map(|thinking_budget| GeminiThinkingConfig { thinking_budget }),
            },
        };

        Ok(self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request_body)
            .build()?)
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn call(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let http_request = self.build_request(request)?;
        let resp = self
            .client
            .execute(http_request)
            .await
            .context("Gemini request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await?;
            return Err(DramaError::provider("gemini", format!("{}: {}", status, error_text)).into());
        }

        let response_text = resp.text().await?;
        let result: GeminiResponse = serde_json::from_str(&response_text).map_err(|e| {
            DramaError::provider(
                "gemini",
                format!("Failed to parse response: {}. Body: {}", e, response_text),
            )
        })?;
        parse_gemini_response(result)
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}

fn parse_gemini_response(result: GeminiResponse) -> Result<LlmResponse> {
    if let Some(err) = result.error {
        return Err(DramaError::provider("gemini", err.message).into());
    }

    let usage = result.usage_metadata.unwrap_or_default();
    let first = result
        .candidates
        .as_ref()
        .and_then(|c| c.first())
        .ok_or_else(|| DramaError::provider("gemini", "response has no candidates"))?;

    let text: String = first
        .content
        .iter()
        .flat_map(|c| c.parts.iter())
        .filter(|p| !p.thought)
        .map(|p| p.text.as_str())
        .collect();

    if text.is_empty() {
        let reason = first.finish_reason.as_deref().unwrap_or("UNKNOWN");
        return Err(DramaError::provider(
            "gemini",
            format!("response empty. Finish reason: {}", reason),
        )
        .into());
    }

    Ok(LlmResponse {
        text,
        tokens_in: usage.prompt_token_count,
        tokens_out: usage.candidates_token_count + usage.thoughts_token_count,
    })
}

// --- OpenAI ---

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(api_key: &str, model: &str, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    max_completion_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct OpenAIUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn call(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", self.base_url);

        // The chat completions API has no thinking-budget knob; the hint is dropped.
        let request_body = OpenAIRequest {
            model: request.model.clone(),
            messages: vec![
                OpenAIMessage {
                    role: "system".to_string(),
                    content: request.system.clone(),
                },
                OpenAIMessage {
                    role: "user".to_string(),
                    content: request.user.clone(),
                },
            ],
            max_completion_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await
            .context("OpenAI request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await?;
            return Err(DramaError::provider("openai", format!("{}: {}", status, error_text)).into());
        }

        let result: OpenAIResponse = resp
            .json()
            .await
            .map_err(|e| DramaError::provider("openai", e.to_string()))?;
        let usage = result.usage.unwrap_or_default();
        let content = result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!(DramaError::provider("openai", "response empty or missing content")))?;

        Ok(LlmResponse {
            text: content,
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
        })
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}

// --- Ollama ---

#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    num_predict: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessageResponse,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

#[derive(Deserialize)]
struct OllamaMessageResponse {
    content: String,
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn call(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/api/chat", self.base_url);

        let request_body = OllamaRequest {
            model: request.model.clone(),
            messages: vec![
                OpenAIMessage {
                    role: "system".to_string(),
                    content: request.system.clone(),
                },
                OpenAIMessage {
                    role: "user".to_string(),
                    content: request.user.clone(),
                },
            ],
            stream: false,
            options: OllamaOptions {
                num_predict: request.max_tokens,
                temperature: request.temperature,
            },
        };

        let resp = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .context("Ollama request failed")?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(DramaError::provider("ollama", error_text).into());
        }

        let result: OllamaResponse = resp
            .json()
            .await
            .map_err(|e| DramaError::provider("ollama", e.to_string()))?;
        Ok(LlmResponse {
            text: result.message.content,
            tokens_in: result.prompt_eval_count,
            tokens_out: result.eval_count,
        })
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::DramaError;

    #[test]
    fn test_gemini_response_parsing_safety_block() {
        let json = r#"{
            "candidates": [
                {
                    "finishReason": "SAFETY",
                    "index": 0
                }
            ]
        }"#;

        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        let err = parse_gemini_response(result).unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
        assert!(matches!(
            err.downcast_ref::<DramaError>(),
            Some(DramaError::Provider { .. })
        ));
    }

    #[test]
    fn test_gemini_response_skips_thought_parts_and_counts_tokens() {
        let json = r#"{
            "candidates": [
                {
                    "content": {
                        "parts": [
                            { "text": "thinking...", "thought": true },
                            { "text": "{\"title\": \"x\"}" }
                        ],
                        "role": "model"
                    },
                    "finishReason": "STOP"
                }
            ],
            "usageMetadata": {
                "promptTokenCount": 120,
                "candidatesTokenCount": 30,
                "thoughtsTokenCount": 12
            }
        }"#;

        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        let response = parse_gemini_response(result).unwrap();
        assert_eq!(response.text, "{\"title\": \"x\"}");
        assert_eq!(response.tokens_in, 120);
        assert_eq!(response.tokens_out, 42);
    }

    #[test]
    fn test_gemini_request_serializes_thinking_budget() {
        let body = GeminiRequest {
            contents: vec![],
            system_instruction: GeminiSystemInstruction { parts: vec![] },
            generation_config: GeminiGenerationConfig {
                max_output_tokens: 1000,
                temperature: 0.5,
                thinking_config: Some(GeminiThinkingConfig { thinking_budget: 256 }),
            },
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            256
        );
        assert!(value.get("systemInstruction").is_some());
    }

    #[test]
    fn test_gemini_key_stays_out_of_the_url() {
        let client = GeminiClient::new("SECRETKEY123", "gemini-2.5-pro");
        let request = LlmRequest {
            model: "gemini-2.5-pro".to_string(),
            system: "sys".to_string(),
            user: "user".to_string(),
            max_tokens: 100,
            temperature: 0.5,
            thinking_budget: None,
        };

        let http_request = client.build_request(&request).unwrap();
        assert!(!http_request.url().as_str().contains("SECRETKEY123"));
        assert!(http_request.url().as_str().ends_with("gemini-2.5-pro:generateContent"));
        assert_eq!(http_request.headers()["x-goog-api-key"], "SECRETKEY123");
    }

    #[test]
    fn test_openai_response_parsing_success() {
        let json = r#"{
            "id": "chatcmpl-123",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Hello there"
                },
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": 9,
                "completion_tokens": 12,
                "total_tokens": 21
            }
        }"#;

        let result: OpenAIResponse = serde_json::from_str(json).unwrap();
        assert_eq!(result.choices[0].message.content.as_deref(), Some("Hello there"));
        assert_eq!(result.usage.unwrap().completion_tokens, 12);
    }

    #[test]
    fn test_missing_credentials_is_configuration_error() {
        let config = LlmConfig {
            provider: "gemini".to_string(),
            gemini: Some(GeminiConfig {
                api_key: "  ".to_string(),
                model: "m".to_string(),
            }),
            openai: None,
            ollama: None,
        };
        let err = create_llm(&config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DramaError>(),
            Some(DramaError::Configuration(_))
        ));

        let config = LlmConfig {
            provider: "openai".to_string(),
            gemini: None,
            openai: None,
            ollama: None,
        };
        assert!(create_llm(&config).is_err());
    }
}
