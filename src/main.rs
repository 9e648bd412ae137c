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
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::*;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use meeting_recorder::config::Config;
use meeting_recorder::orchestrator::{CaptureArtifacts, MeetingJob};
use meeting_recorder::storage::{FsBlobStore, JsonMeetingStore};
use meeting_recorder::types::{JobStatus, MeetRequest, MeetingError, Utterance};

/// Meeting Recorder CLI - unattended Google Meet capture with a live voice assistant
#[derive(Parser)]
#[command(name = "meeting-recorder")]
#[command(version = "0.1.0")]
#[command(about = "Joins a Google Meet as a guest bot, records and transcribes it, and answers questions by voice")]
#[command(long_about = "
Meeting Recorder CLI - Rust Edition

Joins a Google Meet session as an unattended guest, captures the mixed
meeting audio through a virtual sink, stabilizes the on-screen captions
into a live transcript, and runs a wake-phrase voice assistant inside the
call. After the meeting it produces a diarized transcript, a merged
speaker-attributed timeline, a structured summary, and a vector index for
later question answering.
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a meeting, record it, and run the full pipeline
    Run {
        /// Google Meet URL to join
        #[arg(long)]
        meet_url: String,

        /// Display name for the guest bot
        #[arg(long, default_value = "Bot Recorder")]
        guest_name: String,

        /// Owner of the resulting meeting record
        #[arg(long)]
        user_id: String,

        /// Recording budget in seconds (defaults to RECORD_SECONDS or 300)
        #[arg(long)]
        record_seconds: Option<u64>,
    },

    /// Run the post-meeting pipeline on an already-recorded audio file
    Process {
        /// Path to the recorded WAV file
        audio: PathBuf,

        /// Optional JSON file with the caption utterances from the meeting
        #[arg(long)]
        captions: Option<PathBuf>,

        /// Meeting URL for the stored record
        #[arg(long, default_value = "unknown")]
        meet_url: String,

        /// Owner of the resulting meeting record
        #[arg(long, default_value = "local")]
        user_id: String,
    },

    /// Show configuration and dependency status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            meet_url,
            guest_name,
            user_id,
            record_seconds,
        } => {
            setup_logging().await?;
            let mut config = Config::load().await?;
            if let Some(seconds) = record_seconds {
                config.record_seconds = seconds;
            }

            let request = MeetRequest {
                meet_url,
                guest_name,
                user_id,
            };
            run_meeting_job(config, request).await?;
        }

        Commands::Process {
            audio,
            captions,
            meet_url,
            user_id,
        } => {
            setup_logging().await?;
            let config = Config::load().await?;
            process_recording(config, audio, captions, meet_url, user_id).await?;
        }

        Commands::Status => {
            show_status().await?;
        }
    }

    Ok(())
}

async fn run_meeting_job(config: Config, request: MeetRequest) -> Result<()> {
    let meeting_store = Arc::new(JsonMeetingStore::new(config.data_dir.join("meetings")));
    let blob_store = Arc::new(FsBlobStore::new(config.data_dir.join("blobs")));
    let job = MeetingJob::new(config, meeting_store, blob_store);

    // Ctrl+C initiates the same graceful shutdown as the recording budget.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n{}", "Shutting down, finishing the pipeline...".yellow());
            signal_cancel.cancel();
        }
    });

    println!("{} {}", "Joining meeting:".green().bold(), request.meet_url);

    match job.run(&request, cancel).await {
        Ok(JobStatus::Complete) => {
            println!("{}", "Meeting recorded and processed successfully".green().bold());
            Ok(())
        }
        Ok(status) => {
            println!("{} {}", "Job finished with status:".yellow().bold(), status);
            Ok(())
        }
        Err(MeetingError::NotAdmitted(reason)) => {
            println!(
                "{} {} ({})",
                "Job finished with status:".yellow().bold(),
                JobStatus::NotAdmitted,
                reason
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {}", "Meeting job failed:".red().bold(), e);
            Err(e.into())
        }
    }
}

async fn process_recording(
    config: Config,
    audio: PathBuf,
    captions_file: Option<PathBuf>,
    meet_url: String,
    user_id: String,
) -> Result<()> {
    match hound::WavReader::open(&audio) {
        Ok(reader) => {
            let spec = reader.spec();
            let seconds = reader.duration() as f64 / spec.sample_rate as f64;
            tracing::info!(
                "Input audio: {} Hz, {} channel(s), {:.1}s",
                spec.sample_rate,
                spec.channels,
                seconds
            );
        }
        Err(e) => tracing::warn!("Could not inspect WAV header: {}", e),
    }

    let captions: Vec<Utterance> = match captions_file {
        Some(path) => {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read captions file {}", path.display()))?;
            serde_json::from_str(&raw).context("Captions file is not a valid utterance list")?
        }
        None => Vec::new(),
    };

    let meeting_store = Arc::new(JsonMeetingStore::new(config.data_dir.join("meetings")));
    let blob_store = Arc::new(FsBlobStore::new(config.data_dir.join("blobs")));
    let job = MeetingJob::new(config, meeting_store, blob_store);

    let request = MeetRequest {
        meet_url,
        guest_name: "Bot Recorder".to_string(),
        user_id,
    };
    let artifacts = CaptureArtifacts {
        captions,
        audio_file: audio,
        start_time: Utc::now(),
        errors: HashMap::new(),
    };

    let status = job.process_capture(&request, artifacts).await?;
    println!("{} {}", "Processing finished:".green().bold(), status);
    Ok(())
}

async fn show_status() -> Result<()> {
    println!("{}", "Meeting Recorder status".bold());
    println!();

    let chrome = binary_available("google-chrome").await
        || binary_available("chromium").await
        || binary_available("chromium-browser").await;
    let pactl = binary_available("pactl").await;
    let ffmpeg = binary_available("ffmpeg").await;

    println!("   Chrome/Chromium: {}", status_mark(chrome));
    println!("   PulseAudio (pactl): {}", status_mark(pactl));
    println!("   ffmpeg: {}", status_mark(ffmpeg));
    println!(
        "   DEEPGRAM_API_KEY: {}",
        status_mark(std::env::var("DEEPGRAM_API_KEY").is_ok())
    );
    println!(
        "   GEMINI_API_KEY: {}",
        status_mark(std::env::var("GEMINI_API_KEY").is_ok())
    );
    println!(
        "   QDRANT_URL: {}",
        std::env::var("QDRANT_URL").unwrap_or_else(|_| "http://localhost:6333 (default)".to_string())
    );
    println!();

    if !chrome {
        println!("{}", "Chrome is required for joining meetings".yellow());
    }
    if !pactl || !ffmpeg {
        println!(
            "{}",
            "PulseAudio and ffmpeg are required for audio capture".yellow()
        );
    }

    Ok(())
}

fn status_mark(ok: bool) -> ColoredString {
    if ok {
        "ok".green()
    } else {
        "missing".red()
    }
}

async fn binary_available(name: &str) -> bool {
    tokio::process::Command::new("which")
        .arg(name)
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

async fn setup_logging() -> Result<()> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let log_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".meeting-recorder")
        .join("logs");

    std::fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "meeting-recorder.log");

    // File gets everything; stderr only surfaces errors to the user.
    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_filter(
                    EnvFilter::from_default_env()
                        .add_directive("meeting_recorder=debug".parse()?)
                        .add_directive("info".parse()?),
                ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_target(false)
                .with_thread_ids(false)
                .compact()
                .with_filter(
                    EnvFilter::from_default_env()
                        .add_directive("meeting_recorder=error".parse()?)
                        .add_directive("error".parse()?),
                ),
        );

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    tracing::info!("Logging initialized, files under {}", log_dir.display());
    Ok(())
}
