/*
 * Meeting Recorder CLI - Transcript Merge
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

use std::collections::HashMap;

use crate::types::{
    parse_timestamp, DiarizedUtterance, MergedSegment, SpeakerStats, Utterance,
};

/// Pair the i-th caption utterance with the i-th diarized utterance in
/// temporal order. Captions carry the human names, the ASR carries the
/// diarization labels and cleaner text; keeping both lets downstream
/// consumers reconcile names to labels.
///
/// When the lists differ in length, the tail of the longer one is left out
/// of the merged view; the raw arrays stay on the meeting record.
pub fn merge_transcripts(
    captions: &[Utterance],
    diarized: &[DiarizedUtterance],
) -> Vec<MergedSegment> {
    let len = captions.len().min(diarized.len());
    let mut segments = Vec::with_capacity(len);

    for i in 0..len {
        let caption = &captions[i];
        let asr = &diarized[i];

        let start = parse_timestamp(&caption.start_timestamp).unwrap_or(0);
        let end = parse_timestamp(&caption.end_timestamp).unwrap_or(start);
        let duration_seconds = end.saturating_sub(start) as f64;

        let text = if asr.text.trim().is_empty() {
            caption.text.trim().to_string()
        } else {
            asr.text.trim().to_string()
        };

        let speaker_label = if asr.speaker_label.is_empty() {
            "Unknown".to_string()
        } else {
            asr.speaker_label.clone()
        };

        segments.push(MergedSegment {
            id: i + 1,
            speaker_label,
            speaker_name: caption.speaker_name.clone(),
            text,
            start_timestamp: caption.start_timestamp.clone(),
            end_timestamp: caption.end_timestamp.clone(),
            duration_seconds,
        });
    }

    segments
}

/// Collapse consecutive diarized utterances that share a speaker label:
/// the end advances and the texts join with a single space. Feeding the
/// output back through is a no-op.
pub fn merge_diarized(utterances: Vec<DiarizedUtterance>) -> Vec<DiarizedUtterance> {
    let mut merged: Vec<DiarizedUtterance> = Vec::with_capacity(utterances.len());

    for utterance in utterances {
        match merged.last_mut() {
            Some(last) if last.speaker_label == utterance.speaker_label => {
                last.end_ms = last.end_ms.max(utterance.end_ms);
                if !utterance.text.is_empty() {
                    if !last.text.is_empty() {
                        last.text.push(' ');
                    }
                    last.text.push_str(&utterance.text);
                }
            }
            _ => merged.push(utterance),
        }
    }

    merged
}

/// Per-speaker talk statistics over the merged transcript. Informational;
/// the record is valid without them.
pub fn speaker_stats(segments: &[MergedSegment]) -> HashMap<String, SpeakerStats> {
    let mut stats: HashMap<String, SpeakerStats> = HashMap::new();

    for segment in segments {
        let entry = stats
            .entry(segment.speaker_name.clone())
            .or_insert_with(|| SpeakerStats {
                segments: 0,
                total_duration: 0.0,
                total_words: 0,
                total_characters: 0,
                percentage_of_time: 0.0,
                avg_segment_duration: 0.0,
            });
        entry.segments += 1;
        entry.total_duration += segment.duration_seconds;
        entry.total_words += segment.text.split_whitespace().count();
        entry.total_characters += segment.text.chars().count();
    }

    let total_time: f64 = stats.values().map(|s| s.total_duration).sum();
    for entry in stats.values_mut() {
        entry.percentage_of_time = if total_time > 0.0 {
            entry.total_duration / total_time * 100.0
        } else {
            0.0
        };
        entry.avg_segment_duration = if entry.segments > 0 {
            entry.total_duration / entry.segments as f64
        } else {
            0.0
        };
    }

    stats
}
