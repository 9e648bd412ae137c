/*
 * Meeting Recorder CLI - ASR Client
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
use serde_json::Value;
use std::path::Path;

use crate::config::DeepgramConfig;
use crate::merge::merge_diarized;
use crate::types::DiarizedUtterance;

const DEFAULT_BASE_URL: &str = "https://api.deepgram.com";

/// Post-hoc transcription of the recorded meeting audio with speaker
/// diarization and punctuation. Runs once per meeting after capture ends.
pub struct AsrClient {
    client: Client,
    config: DeepgramConfig,
    base_url: String,
}

impl AsrClient {
    pub fn new(config: &DeepgramConfig) -> Self {
        Self {
            client: Client::new(),
            config: config.clone(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(config: &DeepgramConfig, base_url: &str) -> Self {
        Self {
            client: Client::new(),
            config: config.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Upload the WAV file and return the ordered diarized utterances.
    /// Consecutive utterances from the same speaker are merged.
    pub async fn transcribe(&self, audio_file: &Path) -> Result<Vec<DiarizedUtterance>> {
        let file_data = tokio::fs::read(audio_file)
            .await
            .with_context(|| format!("Failed to read audio file {}", audio_file.display()))?;

        let url = format!(
            "{}/v1/listen?model={}&diarize=true&punctuate=true&utterances=true",
            self.base_url, self.config.asr_model
        );

        tracing::info!(
            "Transcribing {} ({} bytes) with diarization",
            audio_file.display(),
            file_data.len()
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.config.api_key))
            .header("Content-Type", "audio/wav")
            .body(file_data)
            .send()
            .await
            .context("ASR request failed")?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!("ASR API error: {}", error_text));
        }

        let payload: Value = response.json().await.context("ASR response was not JSON")?;
        let utterances = parse_utterances(&payload)?;
        tracing::info!("ASR produced {} merged utterance(s)", utterances.len());
        Ok(utterances)
    }
}

/// Map the provider payload to typed utterances once, at the boundary.
fn parse_utterances(payload: &Value) -> Result<Vec<DiarizedUtterance>> {
    let raw = payload
        .pointer("/results/utterances")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("ASR payload missing results.utterances"))?;

    let mut utterances = Vec::with_capacity(raw.len());
    for entry in raw {
        let start = entry
            .get("start")
            .and_then(Value::as_f64)
            .ok_or_else(|| anyhow!("ASR utterance missing start"))?;
        let end = entry
            .get("end")
            .and_then(Value::as_f64)
            .ok_or_else(|| anyhow!("ASR utterance missing end"))?;
        let transcript = entry
            .get("transcript")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let speaker = entry.get("speaker").and_then(Value::as_u64).unwrap_or(0);

        utterances.push(DiarizedUtterance {
            speaker_label: format!("spk_{}", speaker),
            text: transcript.trim().to_string(),
            start_ms: (start * 1000.0).round() as u64,
            end_ms: (end * 1000.0).round() as u64,
        });
    }

    Ok(merge_diarized(utterances))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_config() -> DeepgramConfig {
        DeepgramConfig {
            api_key: "dg-key".to_string(),
            tts_model: "aura-2-thalia-en".to_string(),
            asr_model: "nova-2".to_string(),
            tts_deadline: std::time::Duration::from_secs(60),
        }
    }

    fn write_fake_wav(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("meeting_audio.wav");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"RIFF0000WAVEfmt ").unwrap();
        path
    }

    #[tokio::test]
    async fn transcription_maps_and_merges_utterances() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock(
                "POST",
                "/v1/listen?model=nova-2&diarize=true&punctuate=true&utterances=true",
            )
            .match_header("Authorization", "Token dg-key")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "results": { "utterances": [
                        { "start": 0.5, "end": 1.5, "transcript": "Hello everyone.", "speaker": 0 },
                        { "start": 1.5, "end": 2.5, "transcript": "Welcome to the sync.", "speaker": 0 },
                        { "start": 3.0, "end": 4.0, "transcript": "Thanks.", "speaker": 1 }
                    ]}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let wav = write_fake_wav(&dir);

        let client = AsrClient::with_base_url(&test_config(), &server.url());
        let utterances = client.transcribe(&wav).await.unwrap();

        assert_eq!(utterances.len(), 2);
        assert_eq!(utterances[0].speaker_label, "spk_0");
        assert_eq!(utterances[0].text, "Hello everyone. Welcome to the sync.");
        assert_eq!(utterances[0].start_ms, 500);
        assert_eq!(utterances[0].end_ms, 2500);
        assert_eq!(utterances[1].speaker_label, "spk_1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn api_error_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock(
                "POST",
                "/v1/listen?model=nova-2&diarize=true&punctuate=true&utterances=true",
            )
            .with_status(400)
            .with_body("corrupt audio")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let wav = write_fake_wav(&dir);

        let client = AsrClient::with_base_url(&test_config(), &server.url());
        let err = client.transcribe(&wav).await.unwrap_err();
        assert!(err.to_string().contains("corrupt audio"));
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock(
                "POST",
                "/v1/listen?model=nova-2&diarize=true&punctuate=true&utterances=true",
            )
            .with_status(200)
            .with_body("{\"results\": {}}")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let wav = write_fake_wav(&dir);

        let client = AsrClient::with_base_url(&test_config(), &server.url());
        let err = client.transcribe(&wav).await.unwrap_err();
        assert!(err.to_string().contains("results.utterances"));
    }

    #[tokio::test]
    async fn missing_file_fails_before_any_request() {
        let client = AsrClient::with_base_url(&test_config(), "http://127.0.0.1:1");
        let err = client
            .transcribe(Path::new("/nonexistent/audio.wav"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read audio file"));
    }
}
