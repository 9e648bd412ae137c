/*
 * Meeting Recorder CLI - Sink Router
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
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::{sleep, Duration};

use crate::config::CaptureConfig;

/// Routes the browser's playback streams onto a named PulseAudio null sink
/// and records the sink's monitor to a mono 16 kHz WAV file. Owns the
/// recorder process; terminates it on cleanup.
pub struct SinkRouter {
    config: CaptureConfig,
    recorder: Option<tokio::process::Child>,
    output_file: Option<PathBuf>,
}

impl SinkRouter {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            recorder: None,
            output_file: None,
        }
    }

    /// Load a null sink with the configured name when none exists yet.
    pub async fn ensure_sink(&self) -> Result<()> {
        let output = Command::new("pactl")
            .args(["list", "short", "sinks"])
            .output()
            .await
            .context("Failed to run pactl")?;

        let listing = String::from_utf8_lossy(&output.stdout);
        if listing
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(self.config.sink_name.as_str()))
        {
            tracing::debug!("Sink {} already present", self.config.sink_name);
            return Ok(());
        }

        let module_arg = format!("sink_name={}", self.config.sink_name);
        let status = Command::new("pactl")
            .args(["load-module", "module-null-sink", &module_arg])
            .status()
            .await
            .context("Failed to load null sink module")?;

        if !status.success() {
            return Err(anyhow!("pactl load-module failed for {}", self.config.sink_name));
        }
        tracing::info!("Created virtual sink {}", self.config.sink_name);
        Ok(())
    }

    /// Find the browser's playback streams and move them onto the virtual
    /// sink. The meeting may not have produced audio yet, so this retries;
    /// returns false when nothing could be matched (capture degrades to
    /// silence, the job continues).
    pub async fn route_browser_streams(&self) -> Result<bool> {
        for attempt in 1..=self.config.route_retries {
            let output = Command::new("pactl")
                .args(["list", "sink-inputs"])
                .output()
                .await
                .context("Failed to list sink inputs")?;

            let listing = String::from_utf8_lossy(&output.stdout);
            let indices = parse_browser_sink_inputs(&listing);

            if !indices.is_empty() {
                let mut moved = 0usize;
                for index in &indices {
                    let status = Command::new("pactl")
                        .args([
                            "move-sink-input",
                            &index.to_string(),
                            &self.config.sink_name,
                        ])
                        .status()
                        .await
                        .context("Failed to move sink input")?;
                    if status.success() {
                        moved += 1;
                    } else {
                        tracing::warn!("Could not move sink input #{}", index);
                    }
                }
                if moved > 0 {
                    tracing::info!(
                        "Routed {} browser stream(s) to {} on attempt {}",
                        moved,
                        self.config.sink_name,
                        attempt
                    );
                    return Ok(true);
                }
            }

            tracing::debug!(
                "No browser sink input yet (attempt {}/{})",
                attempt,
                self.config.route_retries
            );
            sleep(Duration::from_millis(self.config.route_retry_delay_ms)).await;
        }

        tracing::warn!(
            "No browser audio stream matched after {} attempts; recording the empty monitor",
            self.config.route_retries
        );
        Ok(false)
    }

    /// Start an ffmpeg process reading the sink monitor and writing mono
    /// 16-bit PCM to `output`.
    pub async fn start_recorder(&mut self, output: &Path) -> Result<()> {
        if self.recorder.is_some() {
            return Err(anyhow!("Recorder is already running"));
        }

        let monitor = format!("{}.monitor", self.config.sink_name);
        let mut ffmpeg_cmd = Command::new("ffmpeg");
        ffmpeg_cmd
            .args([
                "-y",
                "-f",
                "pulse",
                "-i",
                &monitor,
                "-ac",
                "1",
                "-ar",
                &self.config.record_sample_rate.to_string(),
                "-acodec",
                "pcm_s16le",
                &output.to_string_lossy(),
            ])
            .stdin(Stdio::piped()) // 'q' on stdin stops ffmpeg cleanly
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::info!(
            "Recording {} -> {} at {} Hz",
            monitor,
            output.display(),
            self.config.record_sample_rate
        );

        let mut process = ffmpeg_cmd.spawn().context("Failed to start ffmpeg recorder")?;

        // Catch immediate startup failures (bad device, missing pulse).
        sleep(Duration::from_millis(1000)).await;
        match process.try_wait() {
            Ok(Some(status)) => {
                let stderr = if let Some(mut stderr) = process.stderr.take() {
                    use tokio::io::AsyncReadExt;
                    let mut buf = Vec::new();
                    let _ = stderr.read_to_end(&mut buf).await;
                    String::from_utf8_lossy(&buf).to_string()
                } else {
                    "No error output".to_string()
                };
                return Err(anyhow!(
                    "ffmpeg recorder exited immediately with {:?}: {}",
                    status,
                    stderr
                ));
            }
            Ok(None) => {
                tracing::debug!("ffmpeg recorder running");
            }
            Err(e) => {
                tracing::warn!("Could not check recorder status: {}", e);
            }
        }

        self.recorder = Some(process);
        self.output_file = Some(output.to_path_buf());
        Ok(())
    }

    /// Stop the recorder and wait for the WAV file to be finalized.
    pub async fn stop(&mut self) -> Result<Option<PathBuf>> {
        let Some(mut process) = self.recorder.take() else {
            return Ok(self.output_file.take());
        };

        if let Some(mut stdin) = process.stdin.take() {
            use tokio::io::AsyncWriteExt;
            let _ = stdin.write_all(b"q\n").await;
            let _ = stdin.flush().await;
        }

        tokio::select! {
            result = process.wait() => {
                match result {
                    Ok(status) => {
                        tracing::info!("Recorder exited with status: {:?}", status);
                    }
                    Err(e) => {
                        tracing::warn!("Error waiting for recorder: {}", e);
                    }
                }
            }
            _ = sleep(Duration::from_secs(5)) => {
                tracing::warn!("Recorder did not exit within 5 seconds, killing it");
                let _ = process.kill().await;
            }
        }

        // Let ffmpeg finish writing the WAV header.
        sleep(Duration::from_millis(500)).await;

        Ok(self.output_file.take())
    }
}

impl Drop for SinkRouter {
    fn drop(&mut self) {
        if let Some(mut process) = self.recorder.take() {
            let _ = process.start_kill();
        }
    }
}

/// Pull the indices of sink inputs that belong to the controlled browser
/// out of `pactl list sink-inputs` output.
fn parse_browser_sink_inputs(listing: &str) -> Vec<u32> {
    let mut indices = Vec::new();
    let mut current: Option<u32> = None;
    let mut matched = false;

    for line in listing.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("Sink Input #") {
            if matched {
                if let Some(index) = current {
                    indices.push(index);
                }
            }
            current = rest.parse::<u32>().ok();
            matched = false;
        } else if trimmed.starts_with("application.name")
            || trimmed.starts_with("application.process.binary")
        {
            let lowered = trimmed.to_lowercase();
            if lowered.contains("chrom") || lowered.contains("google chrome") {
                matched = true;
            }
        }
    }
    if matched {
        if let Some(index) = current {
            indices.push(index);
        }
    }

    indices
}
