/*
 * Meeting Recorder CLI - Meet Agent
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

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ai::GeminiClient;
use crate::audio_output::{mp3_to_pcm, AudioOutputManager, SAMPLE_WIDTH};
use crate::config::AgentConfig;
use crate::tts::SpeechStreamer;
use crate::types::{CaptionEvent, CaptionEventReceiver};

#[derive(Debug, Clone, Copy, PartialEq)]
enum AgentState {
    Idle,
    Acknowledging,
    AwaitingQuery,
    Responding,
}

/// The in-meeting voice assistant. Consumes the caption event stream
/// strictly serially: a wake phrase triggers a spoken acknowledgment, the
/// next finalized utterance becomes the question, and the answer is
/// streamed back into the call. A barge-in preempts whatever is playing
/// and resets to Idle.
pub struct MeetAgent {
    audio: Arc<AudioOutputManager>,
    speech: Arc<dyn SpeechStreamer>,
    ai: Arc<GeminiClient>,
    config: AgentConfig,
    sample_rate: u32,
}

impl MeetAgent {
    pub fn new(
        audio: Arc<AudioOutputManager>,
        speech: Arc<dyn SpeechStreamer>,
        ai: Arc<GeminiClient>,
        config: AgentConfig,
        sample_rate: u32,
    ) -> Self {
        Self {
            audio,
            speech,
            ai,
            config,
            sample_rate,
        }
    }

    pub async fn run(self, mut events: CaptionEventReceiver, cancel: CancellationToken) {
        let mut state = AgentState::Idle;
        let mut playback: Option<JoinHandle<Result<()>>> = None;

        tracing::info!("Meet agent listening for '{}'", self.config.wake_phrase);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(handle) = playback.take() {
                        handle.abort();
                    }
                    self.audio.stop().await;
                    break;
                }

                result = await_playback(&mut playback) => {
                    playback = None;
                    if let Err(e) = result {
                        tracing::warn!("Agent playback task failed: {}", e);
                        state = AgentState::Idle;
                    } else {
                        state = match state {
                            AgentState::Acknowledging => {
                                tracing::info!("Acknowledgment done, awaiting the question");
                                AgentState::AwaitingQuery
                            }
                            AgentState::Responding => {
                                tracing::info!("Response played, back to idle");
                                AgentState::Idle
                            }
                            other => other,
                        };
                    }
                }

                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::debug!("Caption event channel closed, agent exiting");
                        if let Some(handle) = playback.take() {
                            handle.abort();
                        }
                        self.audio.stop().await;
                        break;
                    };
                    self.handle_event(event, &mut state, &mut playback).await;
                }
            }
        }

        tracing::info!("Meet agent stopped");
    }

    async fn handle_event(
        &self,
        event: CaptionEvent,
        state: &mut AgentState,
        playback: &mut Option<JoinHandle<Result<()>>>,
    ) {
        match event {
            CaptionEvent::Wake { speaker_name } => {
                if *state == AgentState::Idle && !self.audio.is_playing() {
                    tracing::info!("Wake phrase from {}, acknowledging", speaker_name);
                    *state = AgentState::Acknowledging;
                    *playback = Some(self.spawn_acknowledgment());
                } else {
                    tracing::debug!("Wake ignored in state {:?}", state);
                }
            }

            CaptionEvent::Utterance(utterance) => {
                if *state == AgentState::AwaitingQuery && playback.is_none() {
                    tracing::info!(
                        "Question from {}: {}",
                        utterance.speaker_name,
                        utterance.text
                    );
                    *state = AgentState::Responding;
                    *playback = Some(self.spawn_response(utterance.text));
                }
            }

            CaptionEvent::BargeIn { speaker_name } => {
                if matches!(*state, AgentState::Acknowledging | AgentState::Responding) {
                    tracing::info!("Barge-in from {}, yielding the floor", speaker_name);
                    if let Some(handle) = playback.take() {
                        // Cancelling pending LLM work is best-effort; a late
                        // result is simply discarded with the task.
                        handle.abort();
                    }
                    self.audio.stop().await;
                    *state = AgentState::Idle;
                }
            }
        }
    }

    /// Speak the fixed acknowledgment: the configured local MP3 asset when
    /// present (buffered playback), otherwise streamed TTS.
    fn spawn_acknowledgment(&self) -> JoinHandle<Result<()>> {
        let audio = Arc::clone(&self.audio);
        let speech = Arc::clone(&self.speech);
        let text = self.config.acknowledgment.clone();
        let asset = self.config.acknowledgment_mp3.clone();
        let sample_rate = self.sample_rate;

        tokio::spawn(async move {
            if let Some(path) = asset {
                match tokio::fs::read(&path).await {
                    Ok(bytes) => {
                        let pcm = mp3_to_pcm(&bytes, sample_rate)?;
                        // 1-second frames
                        let chunk_size = sample_rate as usize * SAMPLE_WIDTH;
                        audio.play(pcm, chunk_size).await?;
                        audio.wait_idle().await;
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Acknowledgment asset {} unreadable ({}), falling back to TTS",
                            path.display(),
                            e
                        );
                    }
                }
            }
            speech.speak(&text, &audio).await
        })
    }

    /// Ask the LLM and stream the answer; on failure stream the apology.
    fn spawn_response(&self, question: String) -> JoinHandle<Result<()>> {
        let audio = Arc::clone(&self.audio);
        let speech = Arc::clone(&self.speech);
        let ai = Arc::clone(&self.ai);
        let apology = self.config.apology.clone();

        tokio::spawn(async move {
            let answer = match ai.answer_with_search(&question).await {
                Ok(answer) => answer,
                Err(e) => {
                    tracing::warn!("LLM request failed: {}", e);
                    apology
                }
            };
            speech.speak(&answer, &audio).await
        })
    }
}

/// Await the active playback task, or park forever when there is none so
/// the surrounding select only fires for real completions.
async fn await_playback(playback: &mut Option<JoinHandle<Result<()>>>) -> Result<()> {
    match playback {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(anyhow!("Playback task panicked: {}", e)),
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_output::PcmSink;
    use crate::config::{AudioConfig, GeminiConfig};
    use crate::types::{CaptionEventSender, Utterance};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct NullSink;

    #[async_trait]
    impl PcmSink for NullSink {
        async fn write(&self, _pcm: &[u8], _sample_rate: u32, _channels: u16) -> Result<()> {
            Ok(())
        }
    }

    struct FakeSpeech {
        spoken: StdMutex<Vec<String>>,
        hold: Duration,
    }

    impl FakeSpeech {
        fn new(hold: Duration) -> Arc<Self> {
            Arc::new(Self {
                spoken: StdMutex::new(Vec::new()),
                hold,
            })
        }

        fn spoken(&self) -> Vec<String> {
            self.spoken.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SpeechStreamer for FakeSpeech {
        async fn speak(&self, text: &str, manager: &AudioOutputManager) -> Result<()> {
            self.spoken.lock().unwrap().push(text.to_string());
            manager.start_stream().await;
            tokio::time::sleep(self.hold).await;
            manager.stop().await;
            Ok(())
        }
    }

    fn audio_manager() -> Arc<AudioOutputManager> {
        Arc::new(AudioOutputManager::new(
            Arc::new(NullSink),
            AudioConfig {
                output_sample_rate: 16000,
                channels: 1,
                chunk_delay_ms: 5,
                stream_queue_capacity: 8,
            },
        ))
    }

    fn agent_config() -> AgentConfig {
        AgentConfig {
            wake_phrase: "hello meeting assistant".to_string(),
            acknowledgment: "Yes, tell me. I'm listening.".to_string(),
            apology: "I'm sorry, I couldn't fetch an answer right now.".to_string(),
            acknowledgment_mp3: None,
        }
    }

    fn gemini(base_url: &str) -> Arc<GeminiClient> {
        let config = GeminiConfig {
            api_key: "test-key".to_string(),
            model: "gemini-2.5-flash".to_string(),
            embedding_model: "text-embedding-004".to_string(),
        };
        Arc::new(GeminiClient::with_base_url(&config, base_url))
    }

    fn utterance(speaker: &str, text: &str) -> CaptionEvent {
        CaptionEvent::Utterance(Utterance {
            speaker_name: speaker.to_string(),
            text: text.to_string(),
            start_timestamp: "00:05".to_string(),
            end_timestamp: "00:05".to_string(),
        })
    }

    async fn start_agent(
        speech: Arc<FakeSpeech>,
        audio: Arc<AudioOutputManager>,
        ai: Arc<GeminiClient>,
    ) -> (CaptionEventSender, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let agent = MeetAgent::new(audio, speech, ai, agent_config(), 16000);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(agent.run(rx, cancel));
        (tx, handle)
    }

    #[tokio::test]
    async fn wake_then_question_produces_ack_and_answer() {
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
                        "content": { "parts": [{ "text": "It ships on Friday." }] }
                    }]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let speech = FakeSpeech::new(Duration::from_millis(30));
        let (tx, handle) = start_agent(speech.clone(), audio_manager(), gemini(&server.url())).await;

        tx.send(CaptionEvent::Wake {
            speaker_name: "Bob".to_string(),
        })
        .await
        .unwrap();
        // The wake utterance itself arrives right behind the wake event and
        // must not be treated as the question.
        tx.send(utterance("Bob", "hello meeting assistant")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(utterance("Bob", "when do we ship")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        drop(tx);
        handle.await.unwrap();

        let spoken = speech.spoken();
        assert_eq!(
            spoken,
            vec![
                "Yes, tell me. I'm listening.".to_string(),
                "It ships on Friday.".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn llm_failure_speaks_the_apology() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock(
                "POST",
                "/v1beta/models/gemini-2.5-flash:generateContent?key=test-key",
            )
            .with_status(500)
            .with_body("internal error")
            .create_async()
            .await;

        let speech = FakeSpeech::new(Duration::from_millis(20));
        let (tx, handle) = start_agent(speech.clone(), audio_manager(), gemini(&server.url())).await;

        tx.send(CaptionEvent::Wake {
            speaker_name: "Bob".to_string(),
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        tx.send(utterance("Bob", "anything")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        drop(tx);
        handle.await.unwrap();

        let spoken = speech.spoken();
        assert_eq!(spoken.len(), 2);
        assert!(spoken[1].contains("couldn't fetch an answer"));
    }

    /// Barge-in while acknowledging aborts playback and skips
    /// AwaitingQuery entirely.
    #[tokio::test]
    async fn barge_in_during_ack_returns_to_idle() {
        let server = mockito::Server::new_async().await;
        let speech = FakeSpeech::new(Duration::from_secs(5));
        let audio = audio_manager();
        let (tx, handle) = start_agent(speech.clone(), audio.clone(), gemini(&server.url())).await;

        tx.send(CaptionEvent::Wake {
            speaker_name: "Alice".to_string(),
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(audio.is_playing());

        tx.send(CaptionEvent::BargeIn {
            speaker_name: "Alice".to_string(),
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!audio.is_playing());

        // Back to Idle: a follow-up utterance is not taken as a question.
        tx.send(utterance("Alice", "this is not a question")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        drop(tx);
        handle.await.unwrap();
        assert_eq!(speech.spoken().len(), 1);
    }

    #[tokio::test]
    async fn wake_is_ignored_while_audio_plays() {
        let server = mockito::Server::new_async().await;
        let speech = FakeSpeech::new(Duration::from_millis(20));
        let audio = audio_manager();
        audio.start_stream().await;

        let (tx, handle) = start_agent(speech.clone(), audio.clone(), gemini(&server.url())).await;
        tx.send(CaptionEvent::Wake {
            speaker_name: "Alice".to_string(),
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        drop(tx);
        handle.await.unwrap();
        assert!(speech.spoken().is_empty());
    }

    #[tokio::test]
    async fn cancellation_stops_agent_and_playback() {
        let server = mockito::Server::new_async().await;
        let speech = FakeSpeech::new(Duration::from_secs(10));
        let audio = audio_manager();

        let (tx, rx) = mpsc::channel(16);
        let agent = MeetAgent::new(
            audio.clone(),
            speech.clone(),
            gemini(&server.url()),
            agent_config(),
            16000,
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(agent.run(rx, cancel.clone()));

        tx.send(CaptionEvent::Wake {
            speaker_name: "Alice".to_string(),
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        cancel.cancel();
        handle.await.unwrap();
        assert!(!audio.is_playing());
    }
}
