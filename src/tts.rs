/*
 * Meeting Recorder CLI - TTS Stream Client
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
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::audio_output::{f32_to_pcm16, pcm16_to_f32, AudioOutputManager, PcmResampler};
use crate::config::DeepgramConfig;

const DEFAULT_WS_BASE: &str = "wss://api.deepgram.com";

/// Deepgram streams linear16 PCM at 48 kHz.
pub const TTS_SAMPLE_RATE: u32 = 48000;

/// Seam between the agent and the synthesis transport, so agent behavior
/// is testable without a network socket.
#[async_trait]
pub trait SpeechStreamer: Send + Sync {
    /// Synthesize `text` and stream it through the audio manager. Returns
    /// once the remote stream has closed and playback has been stopped.
    async fn speak(&self, text: &str, manager: &AudioOutputManager) -> Result<()>;
}

/// WebSocket client for Deepgram's Speak API. Sends one text payload plus
/// a flush, then forwards the binary PCM frames to the audio manager in
/// streaming mode, resampling when the output rate differs from 48 kHz.
pub struct TtsStreamClient {
    config: DeepgramConfig,
    output_sample_rate: u32,
    ws_base: String,
}

impl TtsStreamClient {
    pub fn new(config: &DeepgramConfig, output_sample_rate: u32) -> Self {
        Self {
            config: config.clone(),
            output_sample_rate,
            ws_base: DEFAULT_WS_BASE.to_string(),
        }
    }

    fn speak_url(&self) -> String {
        format!(
            "{}/v1/speak?model={}&encoding=linear16&sample_rate={}",
            self.ws_base, self.config.tts_model, TTS_SAMPLE_RATE
        )
    }

    async fn stream_session(&self, text: &str, manager: &AudioOutputManager) -> Result<()> {
        let mut request = self
            .speak_url()
            .into_client_request()
            .context("Invalid TTS URL")?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Token {}", self.config.api_key))
                .context("Invalid API key header")?,
        );

        tracing::debug!("Connecting to Deepgram TTS WebSocket");
        let (ws, _response) = connect_async(request)
            .await
            .context("TTS WebSocket connection failed")?;
        let (mut write, mut read) = ws.split();

        // Connection open: switch the manager into streaming mode before
        // any audio arrives.
        manager.start_stream().await;

        write
            .send(Message::Text(
                json!({ "type": "Speak", "text": text }).to_string(),
            ))
            .await
            .context("Failed to send Speak frame")?;
        write
            .send(Message::Text(json!({ "type": "Flush" }).to_string()))
            .await
            .context("Failed to send Flush frame")?;

        let mut resampler = if self.output_sample_rate != TTS_SAMPLE_RATE {
            Some(PcmResampler::new(TTS_SAMPLE_RATE, self.output_sample_rate)?)
        } else {
            None
        };

        let mut closed_cleanly = false;
        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Binary(data)) => {
                    if !manager.is_playing() {
                        // Barge-in stopped the manager; stop feeding it.
                        tracing::info!("Playback stopped mid-stream, abandoning TTS frames");
                        break;
                    }
                    let chunk = convert_frame(&data, &mut resampler)?;
                    if !chunk.is_empty() {
                        manager.push(chunk).await;
                    }
                }
                Ok(Message::Text(payload)) => {
                    let kind = serde_json::from_str::<serde_json::Value>(&payload)
                        .ok()
                        .and_then(|v| v.get("type").and_then(|t| t.as_str().map(String::from)))
                        .unwrap_or_default();
                    match kind.as_str() {
                        "Flushed" => {
                            tracing::debug!("TTS flush acknowledged");
                            let _ = write
                                .send(Message::Text(json!({ "type": "Close" }).to_string()))
                                .await;
                            closed_cleanly = true;
                            break;
                        }
                        "Error" => {
                            return Err(anyhow!("TTS stream error: {}", payload));
                        }
                        _ => tracing::debug!("TTS control frame: {}", kind),
                    }
                }
                Ok(Message::Close(_)) => {
                    closed_cleanly = true;
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(anyhow!("TTS WebSocket receive failed: {}", e));
                }
            }
        }

        // Push out whatever the resampler still holds, close the queue,
        // and let the queued tail play before the worker is torn down.
        if manager.is_playing() {
            if let Some(resampler) = resampler.as_mut() {
                let tail = f32_to_pcm16(&resampler.flush()?);
                if !tail.is_empty() {
                    manager.push(tail).await;
                }
            }
            manager.finish_stream().await;
            manager.wait_idle().await;
        }

        if !closed_cleanly {
            // Early end (barge-in or EOF) is a normal outcome, not an error.
            tracing::debug!("TTS stream ended without close handshake");
        }
        Ok(())
    }
}

#[async_trait]
impl SpeechStreamer for TtsStreamClient {
    async fn speak(&self, text: &str, manager: &AudioOutputManager) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }

        let result =
            tokio::time::timeout(self.config.tts_deadline, self.stream_session(text, manager))
                .await;

        // The manager is stopped on every exit path: close, error, deadline.
        manager.stop().await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow!(
                "TTS session exceeded {:?} deadline",
                self.config.tts_deadline
            )),
        }
    }
}

/// Convert one 48 kHz binary frame to the manager's output rate.
fn convert_frame(data: &[u8], resampler: &mut Option<PcmResampler>) -> Result<Vec<u8>> {
    match resampler {
        None => Ok(data.to_vec()),
        Some(resampler) => {
            let samples = pcm16_to_f32(data);
            let resampled = resampler.process(&samples)?;
            Ok(f32_to_pcm16(&resampled))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> DeepgramConfig {
        DeepgramConfig {
            api_key: "dg-key".to_string(),
            tts_model: "aura-2-thalia-en".to_string(),
            asr_model: "nova-2".to_string(),
            tts_deadline: std::time::Duration::from_secs(5),
        }
    }

    #[test]
    fn speak_url_requests_linear16_at_48k() {
        let client = TtsStreamClient::new(&test_config(), 44100);
        let url = client.speak_url();
        assert!(url.starts_with("wss://api.deepgram.com/v1/speak?"));
        assert!(url.contains("model=aura-2-thalia-en"));
        assert!(url.contains("encoding=linear16"));
        assert!(url.contains("sample_rate=48000"));
    }

    #[test]
    fn frames_pass_through_at_native_rate() {
        let mut resampler = None;
        let data = vec![1u8, 0, 2, 0, 3, 0];
        let out = convert_frame(&data, &mut resampler).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn frames_are_resampled_when_rates_differ() {
        let mut resampler = Some(PcmResampler::new(48000, 16000).unwrap());
        // 48000 samples of silence: one second in, roughly a third out.
        let data = vec![0u8; 48000 * 2];
        let mut out = convert_frame(&data, &mut resampler).unwrap();
        out.extend(f32_to_pcm16(&resampler.unwrap().flush().unwrap()));
        let out_samples = out.len() / 2;
        assert!(
            (12000..=20000).contains(&out_samples),
            "unexpected sample count {}",
            out_samples
        );
    }
}
