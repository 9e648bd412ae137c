/*
 * Meeting Recorder CLI - Job Orchestrator
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
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::MeetAgent;
use crate::ai::GeminiClient;
use crate::asr::AsrClient;
use crate::audio_output::AudioOutputManager;
use crate::bridge::PageAudioBridge;
use crate::browser::chromium::ChromiumMeetPage;
use crate::browser::driver::MeetDriver;
use crate::browser::MeetPage;
use crate::captions::CaptionScraper;
use crate::config::Config;
use crate::indexer::VectorIndexer;
use crate::merge::{merge_transcripts, speaker_stats};
use crate::sink::SinkRouter;
use crate::storage::{BlobStore, MeetingStore};
use crate::summarizer::{generate_meeting_summary, render_transcript};
use crate::tts::{SpeechStreamer, TtsStreamClient};
use crate::types::{
    DiarizedUtterance, JobStatus, MeetRequest, MeetingError, MeetingRecord, Utterance,
};

/// Everything the live phase hands to the post-hoc pipeline.
pub struct CaptureArtifacts {
    pub captions: Vec<Utterance>,
    pub audio_file: PathBuf,
    pub start_time: DateTime<Utc>,
    /// Non-fatal degradations collected along the way.
    pub errors: HashMap<String, String>,
}

/// Serializes one meeting lifecycle: capture, transcription, merge,
/// summary, indexing, persistence and scratch cleanup. Owns every
/// transient object and tears them down in reverse construction order on
/// all exit paths.
pub struct MeetingJob {
    config: Config,
    asr: AsrClient,
    ai: Arc<GeminiClient>,
    indexer: VectorIndexer,
    meeting_store: Arc<dyn MeetingStore>,
    blob_store: Arc<dyn BlobStore>,
}

impl MeetingJob {
    pub fn new(
        config: Config,
        meeting_store: Arc<dyn MeetingStore>,
        blob_store: Arc<dyn BlobStore>,
    ) -> Self {
        let asr = AsrClient::new(&config.deepgram);
        let ai = Arc::new(GeminiClient::new(&config.gemini));
        let indexer = VectorIndexer::new(&config.qdrant, Arc::clone(&ai));
        Self {
            config,
            asr,
            ai,
            indexer,
            meeting_store,
            blob_store,
        }
    }

    /// Construction with pre-built clients (tests point them at local
    /// servers).
    pub fn with_clients(
        config: Config,
        asr: AsrClient,
        ai: Arc<GeminiClient>,
        indexer: VectorIndexer,
        meeting_store: Arc<dyn MeetingStore>,
        blob_store: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            config,
            asr,
            ai,
            indexer,
            meeting_store,
            blob_store,
        }
    }

    /// Run the whole job. `NotAdmitted` and `Precondition` record nothing;
    /// every later failure still tries to preserve the raw audio and clean
    /// the scratch directory.
    pub async fn run(
        &self,
        request: &MeetRequest,
        cancel: CancellationToken,
    ) -> Result<JobStatus, MeetingError> {
        let start_time = Utc::now();
        let scratch = self
            .config
            .scratch_root
            .join(&request.user_id)
            .join(request.meet_key())
            .join(start_time.format("%Y%m%dT%H%M%SZ").to_string());
        std::fs::create_dir_all(&scratch)
            .map_err(|e| MeetingError::Precondition(format!("scratch dir: {}", e)))?;

        tracing::info!("Meeting job started, scratch at {}", scratch.display());

        let page = ChromiumMeetPage::launch(
            &self.config.browser,
            &self.config.capture.sink_name,
            &scratch.join("chrome_profile"),
        )
        .await
        .map_err(|e| MeetingError::Precondition(format!("browser launch: {}", e)))?;
        let page: Arc<dyn MeetPage> = Arc::new(page);

        if let Err(e) = PageAudioBridge::install(&page).await {
            tracing::warn!("Audio bridge install failed, agent will be silent: {}", e);
        }

        let driver = MeetDriver::new(Arc::clone(&page));
        let capture = self
            .capture_session(request, Arc::clone(&page), &driver, &scratch, start_time, &cancel)
            .await;
        driver.close().await;

        let outcome = match capture {
            Ok(artifacts) => self
                .process_capture(request, artifacts)
                .await
                .map_err(|e| MeetingError::Storage(e.to_string())),
            Err(e) => Err(e),
        };

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            tracing::warn!("Scratch cleanup failed for {}: {}", scratch.display(), e);
        }

        outcome
    }

    /// The live phase: join, route audio, scrape captions, run the agent,
    /// and hold the call open until it ends or the budget elapses.
    async fn capture_session(
        &self,
        request: &MeetRequest,
        page: Arc<dyn MeetPage>,
        driver: &MeetDriver,
        scratch: &Path,
        start_time: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CaptureArtifacts, MeetingError> {
        driver
            .open(&request.meet_url, &request.guest_name)
            .await
            .map_err(|e| MeetingError::NotAdmitted(e.to_string()))?;

        let admitted = driver
            .wait_for_admission(self.config.browser.admission_timeout)
            .await
            .unwrap_or(false);
        if !admitted {
            return Err(MeetingError::NotAdmitted(
                "host did not admit within the timeout".to_string(),
            ));
        }

        let mut errors = HashMap::new();

        if let Err(e) = driver.enable_captions().await {
            errors.insert("captions".to_string(), e.to_string());
        }

        // Audio capture: sink routing failures degrade, never abort.
        let mut sink = SinkRouter::new(self.config.capture.clone());
        let audio_file = scratch.join("meeting_audio.wav");
        if let Err(e) = sink.ensure_sink().await {
            tracing::warn!("Virtual sink unavailable: {}", e);
            errors.insert("capture_sink".to_string(), e.to_string());
        }
        match sink.route_browser_streams().await {
            Ok(true) => {}
            Ok(false) => {
                errors.insert(
                    "capture_route".to_string(),
                    "no browser stream matched; audio may be silent".to_string(),
                );
            }
            Err(e) => {
                errors.insert("capture_route".to_string(), e.to_string());
            }
        }
        if let Err(e) = sink.start_recorder(&audio_file).await {
            tracing::warn!("Recorder failed to start: {}", e);
            errors.insert("capture_recorder".to_string(), e.to_string());
        }

        // Playback path and the two event-driven tasks.
        let bridge = Arc::new(PageAudioBridge::new(Arc::clone(&page)));
        let audio = Arc::new(AudioOutputManager::new(bridge, self.config.audio.clone()));

        let (event_tx, event_rx) = mpsc::channel(64);
        let scraper = CaptionScraper::new(
            Arc::clone(&page),
            Arc::clone(&audio),
            event_tx,
            self.config.agent.wake_phrase.clone(),
            self.config.browser.caption_poll_interval,
            self.config.browser.caption_stable_time,
        );

        let session_cancel = cancel.child_token();
        let scraper_handle = tokio::spawn(scraper.run(session_cancel.clone()));

        let speech: Arc<dyn SpeechStreamer> = Arc::new(TtsStreamClient::new(
            &self.config.deepgram,
            self.config.audio.output_sample_rate,
        ));
        let agent = MeetAgent::new(
            Arc::clone(&audio),
            speech,
            Arc::clone(&self.ai),
            self.config.agent.clone(),
            self.config.audio.output_sample_rate,
        );
        let agent_handle = tokio::spawn(agent.run(event_rx, session_cancel.clone()));

        driver
            .keep_alive(Duration::from_secs(self.config.record_seconds), cancel)
            .await;

        // Teardown, reverse construction order.
        session_cancel.cancel();
        if let Err(e) = agent_handle.await {
            tracing::warn!("Agent task join failed: {}", e);
        }
        let captions = match scraper_handle.await {
            Ok(captions) => captions,
            Err(e) => {
                tracing::warn!("Scraper task join failed: {}", e);
                Vec::new()
            }
        };
        audio.stop().await;
        if let Err(e) = sink.stop().await {
            tracing::warn!("Recorder stop failed: {}", e);
        }

        tracing::info!("Capture finished with {} caption utterance(s)", captions.len());

        Ok(CaptureArtifacts {
            captions,
            audio_file,
            start_time,
            errors,
        })
    }

    /// The post-hoc pipeline: ASR, merge, summary + index in parallel,
    /// blob upload, persistence. ASR failure is fatal but still preserves
    /// the raw audio and the captions.
    pub async fn process_capture(
        &self,
        request: &MeetRequest,
        artifacts: CaptureArtifacts,
    ) -> Result<JobStatus> {
        let CaptureArtifacts {
            captions,
            audio_file,
            start_time,
            mut errors,
        } = artifacts;

        let blob_key = format!(
            "{}/{}/{}/meeting_audio.wav",
            request.user_id,
            request.meet_key(),
            start_time.format("%Y%m%dT%H%M%SZ")
        );
        let participants = distinct_speakers(&captions);

        let transcript = match self.asr.transcribe(&audio_file).await {
            Ok(transcript) => transcript,
            Err(e) => {
                tracing::error!("Transcription failed: {}", e);
                errors.insert("transcription".to_string(), e.to_string());

                // Preserve what we have: the raw audio and the captions.
                let audio_blob_key = self.upload_best_effort(&audio_file, &blob_key).await;
                let record = MeetingRecord {
                    meeting_url: request.meet_url.clone(),
                    user_id: request.user_id.clone(),
                    participants,
                    start_time,
                    transcript: Vec::new(),
                    captions,
                    merged: Vec::new(),
                    summary: None,
                    speaker_stats: None,
                    audio_blob_key,
                    errors,
                };
                if let Err(e) = self.meeting_store.save_meeting(&record).await {
                    tracing::error!("Partial record save failed: {}", e);
                }
                return Ok(JobStatus::TranscriptionFailure);
            }
        };

        let merged = merge_transcripts(&captions, &transcript);
        let stats = speaker_stats(&merged);
        let transcript_text = if merged.is_empty() {
            render_diarized(&transcript)
        } else {
            render_transcript(&merged)
        };
        let meeting_id = request.meet_key();

        // Both steps only read the transcript.
        let (summary_result, index_result) = tokio::join!(
            generate_meeting_summary(&self.ai, &transcript_text),
            self.indexer.index_meeting(&meeting_id, &transcript_text)
        );

        let summary = match summary_result {
            Ok(summary) => Some(summary),
            Err(e) => {
                tracing::warn!("Summarization failed: {}", e);
                errors.insert("summary".to_string(), e.to_string());
                None
            }
        };
        if let Err(e) = index_result {
            tracing::warn!("Indexing failed: {}", e);
            errors.insert("index".to_string(), e.to_string());
        }

        let audio_blob_key = self.upload_best_effort(&audio_file, &blob_key).await;
        if audio_blob_key.is_none() {
            errors.insert("audio_upload".to_string(), "blob upload failed".to_string());
        }

        let record = MeetingRecord {
            meeting_url: request.meet_url.clone(),
            user_id: request.user_id.clone(),
            participants,
            start_time,
            transcript,
            captions,
            merged,
            summary,
            speaker_stats: Some(stats),
            audio_blob_key,
            errors,
        };

        self.meeting_store
            .save_meeting(&record)
            .await
            .context("Meeting record persistence failed")?;

        Ok(JobStatus::Complete)
    }

    async fn upload_best_effort(&self, audio_file: &Path, key: &str) -> Option<String> {
        match self.blob_store.upload(audio_file, key).await {
            Ok(receipt) => Some(receipt.key),
            Err(e) => {
                tracing::error!("Audio upload failed: {}", e);
                None
            }
        }
    }
}

fn distinct_speakers(captions: &[Utterance]) -> Vec<String> {
    let mut seen = Vec::new();
    for caption in captions {
        if !seen.contains(&caption.speaker_name) {
            seen.push(caption.speaker_name.clone());
        }
    }
    seen
}

/// Fallback transcript rendering when no captions were captured.
fn render_diarized(transcript: &[DiarizedUtterance]) -> String {
    transcript
        .iter()
        .map(|u| {
            format!(
                "[{} - {}] {}: {}",
                crate::types::format_timestamp(u.start_ms / 1000),
                crate::types::format_timestamp(u.end_ms / 1000),
                u.speaker_label,
                u.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
