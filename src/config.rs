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

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use dirs::home_dir;

#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate the page bridge plays at.
    pub output_sample_rate: u32,
    pub channels: u16,
    /// Sleep between buffered-mode chunks.
    pub chunk_delay_ms: u64,
    /// Bound of the streaming-mode chunk queue.
    pub stream_queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Name of the PulseAudio null sink the browser audio is routed to.
    pub sink_name: String,
    /// Sample rate of the recorded WAV.
    pub record_sample_rate: u32,
    pub route_retries: u32,
    pub route_retry_delay_ms: u64,
}

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub chrome_binary: Option<String>,
    pub headless: bool,
    pub admission_timeout: Duration,
    pub caption_poll_interval: Duration,
    pub caption_stable_time: Duration,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub wake_phrase: String,
    pub acknowledgment: String,
    pub apology: String,
    /// Optional local MP3 played as the acknowledgment instead of TTS.
    pub acknowledgment_mp3: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DeepgramConfig {
    pub api_key: String,
    pub tts_model: String,
    pub asr_model: String,
    pub tts_deadline: Duration,
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub embedding_model: String,
}

#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub collection: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub audio: AudioConfig,
    pub capture: CaptureConfig,
    pub browser: BrowserConfig,
    pub agent: AgentConfig,
    pub deepgram: DeepgramConfig,
    pub gemini: GeminiConfig,
    pub qdrant: QdrantConfig,
    pub scratch_root: PathBuf,
    pub data_dir: PathBuf,
    /// Default per-job recording budget in seconds.
    pub record_seconds: u64,
}

impl Config {
    pub async fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        dotenv::dotenv().ok();

        let deepgram_api_key = env::var("DEEPGRAM_API_KEY")
            .context("DEEPGRAM_API_KEY environment variable not found")?;

        let gemini_api_key = env::var("GEMINI_API_KEY")
            .context("GEMINI_API_KEY environment variable not found")?;

        let output_sample_rate = env::var("AUDIO_OUTPUT_SAMPLE_RATE")
            .unwrap_or_else(|_| "44100".to_string())
            .parse::<u32>()
            .unwrap_or(44100);

        let chunk_delay_ms = env::var("AUDIO_CHUNK_DELAY_MS")
            .unwrap_or_else(|_| "100".to_string())
            .parse::<u64>()
            .unwrap_or(100);

        let stream_queue_capacity = env::var("AUDIO_STREAM_QUEUE")
            .unwrap_or_else(|_| "64".to_string())
            .parse::<usize>()
            .unwrap_or(64);

        let audio = AudioConfig {
            output_sample_rate,
            channels: 1,
            chunk_delay_ms,
            stream_queue_capacity,
        };

        let sink_name = env::var("MEET_SINK_NAME").unwrap_or_else(|_| "meet_sink".to_string());

        let record_sample_rate = env::var("RECORD_SAMPLE_RATE")
            .unwrap_or_else(|_| "16000".to_string())
            .parse::<u32>()
            .unwrap_or(16000);

        let route_retries = env::var("SINK_ROUTE_RETRIES")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u32>()
            .unwrap_or(10);

        let route_retry_delay_ms = env::var("SINK_ROUTE_RETRY_DELAY_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse::<u64>()
            .unwrap_or(1000);

        let capture = CaptureConfig {
            sink_name,
            record_sample_rate,
            route_retries,
            route_retry_delay_ms,
        };

        let admission_timeout_secs = env::var("ADMISSION_TIMEOUT_SECS")
            .unwrap_or_else(|_| "120".to_string())
            .parse::<u64>()
            .unwrap_or(120);

        let caption_poll_ms = env::var("CAPTION_POLL_MS")
            .unwrap_or_else(|_| "1500".to_string())
            .parse::<u64>()
            .unwrap_or(1500);

        let caption_stable_ms = env::var("CAPTION_STABLE_MS")
            .unwrap_or_else(|_| "1500".to_string())
            .parse::<u64>()
            .unwrap_or(1500);

        let browser = BrowserConfig {
            chrome_binary: env::var("CHROME_BINARY").ok(),
            headless: env::var("CHROME_HEADLESS")
                .map(|v| v != "0" && v.to_lowercase() != "false")
                .unwrap_or(true),
            admission_timeout: Duration::from_secs(admission_timeout_secs),
            caption_poll_interval: Duration::from_millis(caption_poll_ms),
            caption_stable_time: Duration::from_millis(caption_stable_ms),
        };

        let agent = AgentConfig {
            wake_phrase: env::var("WAKE_PHRASE")
                .unwrap_or_else(|_| "hello meeting assistant".to_string())
                .to_lowercase(),
            acknowledgment: env::var("AGENT_ACKNOWLEDGMENT")
                .unwrap_or_else(|_| "Yes, tell me. I'm listening.".to_string()),
            apology: env::var("AGENT_APOLOGY").unwrap_or_else(|_| {
                "I'm sorry, I couldn't fetch an answer right now.".to_string()
            }),
            acknowledgment_mp3: env::var("AGENT_ACK_MP3").ok().map(PathBuf::from),
        };

        let tts_deadline_secs = env::var("TTS_DEADLINE_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse::<u64>()
            .unwrap_or(60);

        let deepgram = DeepgramConfig {
            api_key: deepgram_api_key,
            tts_model: env::var("DEEPGRAM_TTS_MODEL")
                .unwrap_or_else(|_| "aura-2-thalia-en".to_string()),
            asr_model: env::var("DEEPGRAM_ASR_MODEL").unwrap_or_else(|_| "nova-2".to_string()),
            tts_deadline: Duration::from_secs(tts_deadline_secs),
        };

        let gemini = GeminiConfig {
            api_key: gemini_api_key,
            model: env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.5-flash".to_string()),
            embedding_model: env::var("GEMINI_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-004".to_string()),
        };

        let qdrant = QdrantConfig {
            url: env::var("QDRANT_URL").unwrap_or_else(|_| "http://localhost:6333".to_string()),
            collection: env::var("QDRANT_COLLECTION").unwrap_or_else(|_| "meetings".to_string()),
        };

        let scratch_root = env::var("SCRATCH_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                home_dir()
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".meeting-recorder")
                    .join("scratch")
            });

        let data_dir = env::var("DATA_DIR").map(PathBuf::from).unwrap_or_else(|_| {
            home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".meeting-recorder")
                .join("data")
        });

        let record_seconds = env::var("RECORD_SECONDS")
            .unwrap_or_else(|_| "300".to_string())
            .parse::<u64>()
            .unwrap_or(300);

        // Ensure working directories exist
        std::fs::create_dir_all(&scratch_root).context("Failed to create scratch directory")?;
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(Config {
            audio,
            capture,
            browser,
            agent,
            deepgram,
            gemini,
            qdrant,
            scratch_root,
            data_dir,
            record_seconds,
        })
    }
}
