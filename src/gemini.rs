use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;

const DEFAULT_GENERATE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Text generation engine: system prompt and user message in, text out
#[allow(async_fn_in_trait)]
pub trait Generator {
    async fn generate(&self, system_prompt: &str, user_message: &str) -> Result<String>;
}

/// Configuration for Gemini API
#[derive(Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    /// Base URL of the models endpoint, without the model name
    pub generate_url: String,
    pub model: String,
}

impl GeminiConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("GEMINI_API_KEY").context("GEMINI_API_KEY not set")?;
        let generate_url =
            env::var("GEMINI_GENERATE_URL").unwrap_or_else(|_| DEFAULT_GENERATE_URL.to_string());
        let model = env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        Ok(GeminiConfig {
            api_key,
            generate_url,
            model,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/{}:generateContent?key={}",
            self.generate_url.trim_end_matches('/'),
            self.model,
            self.api_key
        )
    }
}

/// Client for interacting with Gemini API
#[derive(Clone)]
pub struct GeminiClient {
    config: GeminiConfig,
    client: reqwest::Client,
}

impl GeminiClient {
    /// Create a new Gemini client
    pub fn new(config: GeminiConfig) -> Self {
        let client = reqwest::Client::new();
        GeminiClient { config, client }
    }
}

impl Generator for GeminiClient {
    async fn generate(&self, system_prompt: &str, user_message: &str) -> Result<String> {
        let request = GenerateRequest::new(system_prompt, user_message);

        let response = self
            .client
            .post(self.config.endpoint())
            .json(&request)
            .send()
            .await
            .context("Failed to reach the generation API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow::anyhow!(
                "API request failed: {} {}",
                status,
                error_text
            ));
        }

        let response_data: GenerateResponse = response.json().await?;

        response_data
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| anyhow::anyhow!("No response generated"))
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    system_instruction: Instruction<'a>,
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

impl<'a> GenerateRequest<'a> {
    fn new(system_prompt: &'a str, user_message: &'a str) -> Self {
        GenerateRequest {
            system_instruction: Instruction {
                parts: vec![Part {
                    text: system_prompt,
                }],
            },
            contents: vec![Content {
                parts: vec![Part { text: user_message }],
                role: "user",
            }],
            generation_config: GenerationConfig {
                temperature: 0.2,
                top_p: 0.8,
                top_k: 40,
                max_output_tokens: 1024,
            },
        }
    }
}

#[derive(Serialize)]
struct Instruction<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
    role: &'static str,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    candidates: Vec<Candidate>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: ResponseContent,
}

#[derive(Deserialize, Debug)]
struct ResponseContent {
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    text: String,
}
