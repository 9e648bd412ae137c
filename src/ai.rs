/*
 * Meeting Recorder CLI - Gemini Client
 * Copyright (c) 2024 Meeting Recorder Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};

use crate::config::GeminiConfig;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Thin client for the Gemini REST API: search-grounded answers for the
/// in-meeting agent, plain and structured completions for the summarizer,
/// and embeddings for the vector indexer.
pub struct GeminiClient {
    client: Client,
    config: GeminiConfig,
    base_url: String,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig) -> Self {
        Self {
            client: Client::new(),
            config: config.clone(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Point the client at a different host (tests).
    pub fn with_base_url(config: &GeminiConfig, base_url: &str) -> Self {
        Self {
            client: Client::new(),
            config: config.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Answer a spoken question with Google Search grounding enabled,
    /// returning text cleaned for speech.
    pub async fn answer_with_search(&self, question: &str) -> Result<String> {
        let body = json!({
            "contents": [{ "parts": [{ "text": question }] }],
            "tools": [{ "google_search": {} }],
        });
        let response = self.generate(&self.config.model, body).await?;
        let answer = clean_model_text(&extract_text(&response));
        if answer.is_empty() {
            return Err(anyhow!("Gemini returned no response text"));
        }
        Ok(answer)
    }

    /// Single-prompt freeform completion.
    pub async fn complete(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
        });
        let response = self.generate(&self.config.model, body).await?;
        let text = extract_text(&response);
        if text.is_empty() {
            return Err(anyhow!("Gemini returned no response text"));
        }
        Ok(text.trim().to_string())
    }

    /// Completion with strict JSON output enforced through the response
    /// schema. Returns the parsed JSON value.
    pub async fn complete_structured(&self, prompt: &str, schema: Value) -> Result<Value> {
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "response_mime_type": "application/json",
                "response_schema": schema,
            },
        });
        let response = self.generate(&self.config.model, body).await?;
        let text = extract_text(&response);
        serde_json::from_str(&text)
            .with_context(|| format!("Gemini structured output was not valid JSON: {}", text))
    }

    /// Embed a text window for vector indexing.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!(
            "{}/v1beta/models/{}:embedContent?key={}",
            self.base_url, self.config.embedding_model, self.config.api_key
        );
        let body = json!({
            "model": format!("models/{}", self.config.embedding_model),
            "content": { "parts": [{ "text": text }] },
        });

        let response = self.client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!("Gemini embedding API error: {}", error_text));
        }

        let payload: Value = response.json().await?;
        let values = payload
            .pointer("/embedding/values")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("Embedding response missing values"))?;

        values
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| anyhow!("Non-numeric embedding value"))
            })
            .collect()
    }

    async fn generate(&self, model: &str, body: Value) -> Result<Value> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, model, self.config.api_key
        );

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Gemini request failed")?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!("Gemini API error: {}", error_text));
        }

        response.json().await.context("Gemini response was not JSON")
    }
}

/// Join the text parts of every candidate in a generateContent response.
fn extract_text(response: &Value) -> String {
    let mut out = String::new();
    if let Some(candidates) = response.get("candidates").and_then(Value::as_array) {
        for candidate in candidates {
            if let Some(parts) = candidate.pointer("/content/parts").and_then(Value::as_array) {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        out.push_str(text);
                        out.push('\n');
                    }
                }
            }
        }
    }
    out.trim().to_string()
}

/// Clean model output for speech or display: markdown syntax, bullets and
/// excess whitespace removed.
pub fn clean_model_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let markdown = Regex::new(r"[*_`#>]+").unwrap();
    let bullets = Regex::new(r"(?m)^[\s•\-]+").unwrap();
    let breaks = Regex::new(r"[\n\t]+").unwrap();
    let spaces = Regex::new(r"\s{2,}").unwrap();

    let cleaned = markdown.replace_all(text, "");
    let cleaned = bullets.replace_all(&cleaned, "");
    let cleaned = breaks.replace_all(&cleaned, " ");
    let cleaned = spaces.replace_all(&cleaned, " ");
    cleaned.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(server_url: &str) -> GeminiClient {
        let config = GeminiConfig {
            api_key: "test-key".to_string(),
            model: "gemini-2.5-flash".to_string(),
            embedding_model: "text-embedding-004".to_string(),
        };
        GeminiClient::with_base_url(&config, server_url)
    }

    #[test]
    fn cleaning_strips_markdown_and_bullets() {
        let raw = "**Answer:**\n- first point\n- second point\n\n`code` _em_";
        assert_eq!(
            clean_model_text(raw),
            "Answer: first point second point code em"
        );
    }

    #[test]
    fn cleaning_collapses_whitespace() {
        assert_eq!(clean_model_text("a\n\n\tb   c"), "a b c");
        assert_eq!(clean_model_text(""), "");
    }

    #[test]
    fn extract_text_joins_candidate_parts() {
        let response = serde_json::json!({
            "candidates": [
                { "content": { "parts": [{ "text": "one" }, { "text": "two" }] } }
            ]
        });
        assert_eq!(extract_text(&response), "one\ntwo");
        assert_eq!(extract_text(&serde_json::json!({})), "");
    }

    #[tokio::test]
    async fn answer_with_search_cleans_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock(
                "POST",
                "/v1beta/models/gemini-2.5-flash:generateContent?key=test-key",
            )
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "candidates": [{
                        "content": { "parts": [{ "text": "**The answer** is 42." }] }
                    }]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = test_client(&server.url());
        let answer = client.answer_with_search("meaning of life?").await.unwrap();
        assert_eq!(answer, "The answer is 42.");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn api_error_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock(
                "POST",
                "/v1beta/models/gemini-2.5-flash:generateContent?key=test-key",
            )
            .with_status(429)
            .with_body("quota exceeded")
            .create_async()
            .await;

        let client = test_client(&server.url());
        let err = client.complete("hi").await.unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn structured_completion_parses_json() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock(
                "POST",
                "/v1beta/models/gemini-2.5-flash:generateContent?key=test-key",
            )
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "candidates": [{
                        "content": { "parts": [{ "text": "{\"overview\": \"short\"}" }] }
                    }]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = test_client(&server.url());
        let value = client
            .complete_structured("summarize", serde_json::json!({"type": "object"}))
            .await
            .unwrap();
        assert_eq!(value["overview"], "short");
    }

    #[tokio::test]
    async fn structured_completion_rejects_non_json() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock(
                "POST",
                "/v1beta/models/gemini-2.5-flash:generateContent?key=test-key",
            )
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "candidates": [{
                        "content": { "parts": [{ "text": "not json at all" }] }
                    }]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = test_client(&server.url());
        assert!(client
            .complete_structured("summarize", serde_json::json!({"type": "object"}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn embeddings_are_parsed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock(
                "POST",
                "/v1beta/models/text-embedding-004:embedContent?key=test-key",
            )
            .with_status(200)
            .with_body(
                serde_json::json!({ "embedding": { "values": [0.1, -0.2, 0.3] } }).to_string(),
            )
            .create_async()
            .await;

        let client = test_client(&server.url());
        let embedding = client.embed("chunk text").await.unwrap();
        assert_eq!(embedding.len(), 3);
        assert!((embedding[1] + 0.2).abs() < 1e-6);
    }

    #[tokio::test]
    async fn malformed_embedding_payload_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock(
                "POST",
                "/v1beta/models/text-embedding-004:embedContent?key=test-key",
            )
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client = test_client(&server.url());
        assert!(client.embed("chunk text").await.is_err());
    }
}
