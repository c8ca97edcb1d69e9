//! LLM text generation for PR descriptions and tree summaries.
//!
//! One prompt in, one completion out. Provider failures surface as errors
//! carrying the HTTP status — callers decide whether that aborts (explicit
//! summary request) or degrades (PR body falls back to `--fill`).

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Value, json};

use crate::config::{AiConfig, AiProvider};

/// Generate a PR description from the branch title and its diff against the
/// base branch.
pub async fn generate_pr_body(
    config: &AiConfig,
    http: &reqwest::Client,
    title: &str,
    diff: &str,
) -> Result<String> {
    let prompt = pr_body_prompt(title, diff);
    complete(config, http, &prompt).await
}

/// One-off generation with an instruction and free-form context, used for
/// tree status summaries.
pub async fn generate_text(
    config: &AiConfig,
    http: &reqwest::Client,
    instruction: &str,
    context: &str,
) -> Result<String> {
    let prompt = format!("{instruction}\n\n{context}");
    complete(config, http, &prompt).await
}

fn pr_body_prompt(title: &str, diff: &str) -> String {
    format!(
        "Write a pull request description for the following changes. Be concise. \
         Use markdown. Start with a short summary paragraph, then a bullet list of \
         key changes if needed. Do not include a title.\n\n\
         PR title: {title}\n\nDiff:\n{diff}"
    )
}

async fn complete(config: &AiConfig, http: &reqwest::Client, prompt: &str) -> Result<String> {
    match config.provider {
        AiProvider::Anthropic => anthropic(config, http, prompt).await,
        AiProvider::OpenAi => openai(config, http, prompt).await,
        AiProvider::Gemini => gemini(config, http, prompt).await,
    }
}

async fn anthropic(config: &AiConfig, http: &reqwest::Client, prompt: &str) -> Result<String> {
    let response = http
        .post("https://api.anthropic.com/v1/messages")
        .header("x-api-key", &config.api_key)
        .header("anthropic-version", "2023-06-01")
        .json(&json!({
            "model": config.model,
            "max_tokens": 1024,
            "temperature": 0.3,
            "messages": [{ "role": "user", "content": prompt }],
        }))
        .send()
        .await
        .context("Anthropic API request failed")?;
    if !response.status().is_success() {
        bail!("Anthropic API error: {}", response.status());
    }
    let body: Value = response.json().await?;
    extract_text(&body, "/content/0/text")
}

async fn openai(config: &AiConfig, http: &reqwest::Client, prompt: &str) -> Result<String> {
    let response = http
        .post("https://api.openai.com/v1/chat/completions")
        .bearer_auth(&config.api_key)
        .json(&json!({
            "model": config.model,
            "max_tokens": 1024,
            "temperature": 0.3,
            "messages": [
                { "role": "system", "content": "You write concise pull request descriptions." },
                { "role": "user", "content": prompt },
            ],
        }))
        .send()
        .await
        .context("OpenAI API request failed")?;
    if !response.status().is_success() {
        bail!("OpenAI API error: {}", response.status());
    }
    let body: Value = response.json().await?;
    extract_text(&body, "/choices/0/message/content")
}

async fn gemini(config: &AiConfig, http: &reqwest::Client, prompt: &str) -> Result<String> {
    let url = format!(
        "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
        config.model, config.api_key
    );
    let response = http
        .post(url)
        .json(&json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": { "temperature": 0.3, "maxOutputTokens": 1024 },
        }))
        .send()
        .await
        .context("Gemini API request failed")?;
    if !response.status().is_success() {
        bail!("Gemini API error: {}", response.status());
    }
    let body: Value = response.json().await?;
    extract_text(&body, "/candidates/0/content/parts/0/text")
}

fn extract_text(body: &Value, pointer: &str) -> Result<String> {
    body.pointer(pointer)
        .and_then(Value::as_str)
        .map(|text| text.trim().to_string())
        .ok_or_else(|| anyhow!("provider response missing completion text"))
}
