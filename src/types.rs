/*
 * Meeting Recorder CLI - Rust Edition
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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;

/// Job input payload: which meeting to join and on whose behalf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetRequest {
    pub meet_url: String,
    #[serde(default = "default_guest_name")]
    pub guest_name: String,
    pub user_id: String,
}

fn default_guest_name() -> String {
    "Bot Recorder".to_string()
}

impl MeetRequest {
    /// Meeting key used in scratch/blob paths, derived from the URL
    /// (e.g. "https://meet.google.com/abc-defg-hij" -> "abc-defg-hij").
    pub fn meet_key(&self) -> String {
        url::Url::parse(&self.meet_url)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "meeting".to_string())
    }
}

/// A caption-derived utterance. Finalized once by the caption scraper and
/// never mutated afterwards. Timestamps are elapsed time from meeting start,
/// formatted as MM:SS (or HH:MM:SS past the first hour).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Utterance {
    pub speaker_name: String,
    pub text: String,
    pub start_timestamp: String,
    pub end_timestamp: String,
}

/// An ASR-derived utterance with an opaque diarization label (e.g. "spk_0").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiarizedUtterance {
    pub speaker_label: String,
    pub text: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

/// One row of the merged transcript: the i-th caption utterance paired with
/// the i-th diarized utterance, keeping the human name from the captions and
/// the diarization label from the ASR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedSegment {
    pub id: usize,
    pub speaker_label: String,
    pub speaker_name: String,
    pub text: String,
    pub start_timestamp: String,
    pub end_timestamp: String,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NoteItem {
    pub topic: String,
    pub start_time: String,
    pub end_time: String,
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    pub items: Vec<String>,
}

/// Structured meeting summary produced by the merge step of the summarizer
/// pipeline. Strictly a tree; no cross-references between entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeetingSummary {
    pub overview: String,
    pub notes: Vec<NoteItem>,
    pub action_items: Vec<ActionItem>,
}

/// Informational per-speaker talk-time statistics. May be absent from a
/// record without breaking any downstream consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerStats {
    pub segments: usize,
    pub total_duration: f64,
    pub total_words: usize,
    pub total_characters: usize,
    pub percentage_of_time: f64,
    pub avg_segment_duration: f64,
}

/// Boundary object handed to external persistence once the pipeline is done.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingRecord {
    pub meeting_url: String,
    pub user_id: String,
    pub participants: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub transcript: Vec<DiarizedUtterance>,
    pub captions: Vec<Utterance>,
    pub merged: Vec<MergedSegment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<MeetingSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker_stats: Option<HashMap<String, SpeakerStats>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_blob_key: Option<String>,
    /// Per-field error tags for the non-fatal pipeline steps
    /// (e.g. "summary" -> "...", "index" -> "...").
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub errors: HashMap<String, String>,
}

/// Receipt returned by the blob store boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub status: String,
    pub key: String,
}

/// Events published by the caption scraper, consumed by the meet agent.
/// A wake-phrase finalization emits `Wake` immediately before its
/// `Utterance`; `BargeIn` is raised when a speaker keeps talking while the
/// bot is playing audio.
#[derive(Debug, Clone)]
pub enum CaptionEvent {
    Wake { speaker_name: String },
    Utterance(Utterance),
    BargeIn { speaker_name: String },
}

pub type CaptionEventSender = mpsc::Sender<CaptionEvent>;
pub type CaptionEventReceiver = mpsc::Receiver<CaptionEvent>;

/// Error taxonomy for a meeting job. The orchestrator classifies terminal
/// outcomes with this enum; everything below it returns `anyhow::Result`.
#[derive(Debug, thiserror::Error)]
pub enum MeetingError {
    #[error("Precondition failure: {0}")]
    Precondition(String),

    #[error("Not admitted to the meeting: {0}")]
    NotAdmitted(String),

    #[error("Capture degraded: {0}")]
    CaptureDegraded(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Transcription failure: {0}")]
    Transcription(String),

    #[error("Summarization failure: {0}")]
    Summarization(String),

    #[error("Indexing failure: {0}")]
    Indexing(String),

    #[error("Storage failure: {0}")]
    Storage(String),
}

/// Final job status as reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobStatus {
    Complete,
    NotAdmitted,
    TranscriptionFailure,
    Failed(String),
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Complete => write!(f, "complete"),
            JobStatus::NotAdmitted => write!(f, "not_admitted"),
            JobStatus::TranscriptionFailure => write!(f, "transcription_failure"),
            JobStatus::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Parse an elapsed timestamp in "HH:MM:SS", "MM:SS" or "SS" form into
/// seconds. Returns None for anything else.
pub fn parse_timestamp(ts: &str) -> Option<u64> {
    let parts: Vec<&str> = ts.trim().split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }

    let mut seconds: u64 = 0;
    for part in &parts {
        if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        seconds = seconds * 60 + part.parse::<u64>().ok()?;
    }
    Some(seconds)
}

/// Format elapsed seconds as "MM:SS" below one hour and "HH:MM:SS" above.
/// `format_timestamp(parse_timestamp(x))` is idempotent for both forms.
pub fn format_timestamp(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minute_second_form() {
        assert_eq!(parse_timestamp("00:02"), Some(2));
        assert_eq!(parse_timestamp("01:30"), Some(90));
        assert_eq!(parse_timestamp("12"), Some(12));
    }

    #[test]
    fn parses_hour_form() {
        assert_eq!(parse_timestamp("01:00:05"), Some(3605));
        assert_eq!(parse_timestamp("00:59:59"), Some(3599));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("1:2:3:4"), None);
        assert_eq!(parse_timestamp("abc"), None);
        assert_eq!(parse_timestamp("1:-2"), None);
    }

    #[test]
    fn formats_below_and_above_an_hour() {
        assert_eq!(format_timestamp(2), "00:02");
        assert_eq!(format_timestamp(90), "01:30");
        assert_eq!(format_timestamp(3605), "01:00:05");
    }

    #[test]
    fn parse_format_round_trip_is_idempotent() {
        for ts in ["00:02", "1:30", "01:00:05", "59:59", "00:00"] {
            let once = format_timestamp(parse_timestamp(ts).unwrap());
            let twice = format_timestamp(parse_timestamp(&once).unwrap());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn meet_key_strips_url_parts() {
        let req = MeetRequest {
            meet_url: "https://meet.google.com/abc-defg-hij?hs=122".to_string(),
            guest_name: "Bot Recorder".to_string(),
            user_id: "user-1".to_string(),
        };
        assert_eq!(req.meet_key(), "abc-defg-hij");
    }
}
