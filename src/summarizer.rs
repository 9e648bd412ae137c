/*
 * Meeting Recorder CLI - Summarizer Pipeline
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

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::ai::GeminiClient;
use crate::types::{MeetingSummary, MergedSegment};

pub const SUMMARY_CHUNK_SIZE: usize = 1000;
pub const SUMMARY_CHUNK_OVERLAP: usize = 100;

/// Full pipeline: chunk the transcript, summarize each chunk freeform,
/// then merge the chunk summaries into the structured MeetingSummary.
/// Only the merge step enforces structured output.
pub async fn generate_meeting_summary(
    ai: &GeminiClient,
    transcript_text: &str,
) -> Result<MeetingSummary> {
    let chunks = chunk_transcript(transcript_text, SUMMARY_CHUNK_SIZE, SUMMARY_CHUNK_OVERLAP);
    tracing::info!("Summarizing transcript in {} chunk(s)", chunks.len());

    let mut chunk_summaries = Vec::with_capacity(chunks.len());
    for (index, chunk) in chunks.iter().enumerate() {
        let prompt = format!(
            "You are an expert meeting assistant.\n\
             Summarize the following transcript chunk into concise notes.\n\
             Include:\n\
             - Timestamps\n\
             - Speaker names\n\
             - Bullet points for actions or important points\n\n\
             Transcript chunk:\n{}",
            chunk
        );
        let summary = ai
            .complete(&prompt)
            .await
            .with_context(|| format!("Chunk {} summary failed", index + 1))?;
        chunk_summaries.push(summary);
    }

    let merge_prompt = format!(
        "You are an expert meeting assistant.\n\
         You have the following chunk summaries. Merge them into a full meeting summary.\n\
         Overview:\n\
         - One concise paragraph summarizing the key points.\n\
         Notes:\n\
         - Group by topic or agenda time\n\
         - Include start_time and end_time for each topic\n\
         - Include speaker names in bullet points\n\
         Action Items:\n\
         - Extract tasks\n\
         - Group by assignee if possible\n\
         - Include timestamps if possible\n\n\
         Chunk Summaries:\n{}",
        chunk_summaries.join("\n")
    );

    let merged = ai
        .complete_structured(&merge_prompt, summary_schema())
        .await
        .context("Summary merge failed")?;

    serde_json::from_value(merged).context("Summary did not match the expected shape")
}

/// Render the merged transcript as plain text for summarization and
/// indexing: one "[start - end] speaker: text" line per segment.
pub fn render_transcript(segments: &[MergedSegment]) -> String {
    segments
        .iter()
        .map(|s| {
            format!(
                "[{} - {}] {}: {}",
                s.start_timestamp, s.end_timestamp, s.speaker_name, s.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split text into overlapping windows, preferring newline then space
/// boundaries near the window end so sentences survive the cut.
pub fn chunk_transcript(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    if chars.len() <= chunk_size {
        let only = text.trim().to_string();
        return if only.is_empty() { Vec::new() } else { vec![only] };
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let hard_end = (start + chunk_size).min(chars.len());
        let mut split = hard_end;

        if hard_end < chars.len() {
            // Look for a boundary in the back half of the window.
            let window_start = start + chunk_size / 2;
            let newline = (window_start..hard_end).rev().find(|&i| chars[i] == '\n');
            let space = (window_start..hard_end).rev().find(|&i| chars[i] == ' ');
            if let Some(pos) = newline.or(space) {
                split = pos + 1;
            }
        }

        let chunk: String = chars[start..split].iter().collect();
        let chunk = chunk.trim().to_string();
        if !chunk.is_empty() {
            chunks.push(chunk);
        }

        if split >= chars.len() {
            break;
        }
        let next = split.saturating_sub(overlap);
        // Overlap must never stall the walk.
        start = if next > start { next } else { split };
    }

    chunks
}

/// Gemini response schema for the structured merge step.
fn summary_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "overview": { "type": "STRING" },
            "notes": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "topic": { "type": "STRING" },
                        "start_time": { "type": "STRING" },
                        "end_time": { "type": "STRING" },
                        "items": { "type": "ARRAY", "items": { "type": "STRING" } }
                    },
                    "required": ["topic", "start_time", "end_time", "items"]
                }
            },
            "action_items": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "assignee": { "type": "STRING" },
                        "items": { "type": "ARRAY", "items": { "type": "STRING" } }
                    },
                    "required": ["items"]
                }
            }
        },
        "required": ["overview", "notes", "action_items"]
    })
}
