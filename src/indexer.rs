/*
 * Meeting Recorder CLI - Vector Indexer
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
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::ai::GeminiClient;
use crate::config::QdrantConfig;
use crate::summarizer::chunk_transcript;

pub const INDEX_CHUNK_SIZE: usize = 1000;
pub const INDEX_CHUNK_OVERLAP: usize = 200;

/// A retrieved transcript window with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk_index: usize,
    pub text: String,
    pub score: f64,
}

/// Embeds overlapping transcript windows and upserts them into a remote
/// Qdrant collection. Point ids derive from `(meeting_id, chunk_index)`,
/// so re-indexing a meeting replaces its old vectors instead of
/// duplicating them.
pub struct VectorIndexer {
    client: Client,
    config: QdrantConfig,
    ai: Arc<GeminiClient>,
}

impl VectorIndexer {
    pub fn new(config: &QdrantConfig, ai: Arc<GeminiClient>) -> Self {
        Self {
            client: Client::new(),
            config: config.clone(),
            ai,
        }
    }

    /// Index the transcript text for one meeting. Returns how many chunks
    /// were upserted.
    pub async fn index_meeting(&self, meeting_id: &str, transcript_text: &str) -> Result<usize> {
        let chunks = chunk_transcript(transcript_text, INDEX_CHUNK_SIZE, INDEX_CHUNK_OVERLAP);
        if chunks.is_empty() {
            tracing::warn!("Nothing to index for meeting {}", meeting_id);
            return Ok(0);
        }

        let mut points = Vec::with_capacity(chunks.len());
        for (chunk_index, chunk) in chunks.iter().enumerate() {
            let embedding = self
                .ai
                .embed(chunk)
                .await
                .with_context(|| format!("Embedding chunk {} failed", chunk_index))?;

            if points.is_empty() {
                self.ensure_collection(embedding.len()).await?;
            }

            points.push(json!({
                "id": point_id(meeting_id, chunk_index),
                "vector": embedding,
                "payload": {
                    "meeting_id": meeting_id,
                    "chunk_index": chunk_index,
                    "text": chunk,
                },
            }));
        }

        let url = format!(
            "{}/collections/{}/points?wait=true",
            self.config.url, self.config.collection
        );
        let response = self
            .client
            .put(&url)
            .json(&json!({ "points": points }))
            .send()
            .await
            .context("Vector upsert request failed")?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!("Vector upsert failed: {}", error_text));
        }

        tracing::info!(
            "Indexed {} chunk(s) for meeting {} into {}",
            points.len(),
            meeting_id,
            self.config.collection
        );
        Ok(points.len())
    }

    /// Similarity search scoped to one meeting, for the downstream QA chain.
    pub async fn search(
        &self,
        meeting_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let embedding = self.ai.embed(query).await.context("Query embedding failed")?;

        let url = format!(
            "{}/collections/{}/points/search",
            self.config.url, self.config.collection
        );
        let body = json!({
            "vector": embedding,
            "limit": limit,
            "with_payload": true,
            "filter": {
                "must": [{ "key": "meeting_id", "match": { "value": meeting_id } }]
            },
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Vector search request failed")?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!("Vector search failed: {}", error_text));
        }

        let payload: Value = response.json().await.context("Search response was not JSON")?;
        let hits = payload
            .get("result")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("Search response missing result array"))?;

        let mut chunks = Vec::with_capacity(hits.len());
        for hit in hits {
            chunks.push(ScoredChunk {
                chunk_index: hit
                    .pointer("/payload/chunk_index")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize,
                text: hit
                    .pointer("/payload/text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                score: hit.get("score").and_then(Value::as_f64).unwrap_or(0.0),
            });
        }
        Ok(chunks)
    }

    /// Create the collection on first use; later calls see it exists.
    async fn ensure_collection(&self, dimension: usize) -> Result<()> {
        let url = format!("{}/collections/{}", self.config.url, self.config.collection);

        let response = self.client.get(&url).send().await.context("Collection check failed")?;
        if response.status().is_success() {
            return Ok(());
        }

        tracing::info!(
            "Creating collection {} (dim {})",
            self.config.collection,
            dimension
        );
        let body = json!({
            "vectors": { "size": dimension, "distance": "Cosine" }
        });
        let response = self
            .client
            .put(&url)
            .json(&body)
            .send()
            .await
            .context("Collection create failed")?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!("Collection create failed: {}", error_text));
        }
        Ok(())
    }
}

/// Deterministic UUIDv5 point id for `(meeting_id, chunk_index)`; identical
/// input always maps to the same point, which is what makes re-indexing
/// idempotent.
fn point_id(meeting_id: &str, chunk_index: usize) -> String {
    let name = format!("{}:{}", meeting_id, chunk_index);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}
