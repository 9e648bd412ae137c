/*
 * Meeting Recorder CLI - Audio Output Manager
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
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::config::AudioConfig;

/// 16-bit PCM
pub const SAMPLE_WIDTH: usize = 2;

/// Destination for raw PCM frames. The page audio bridge is the production
/// implementation; tests substitute a recording sink.
#[async_trait]
pub trait PcmSink: Send + Sync {
    async fn write(&self, pcm: &[u8], sample_rate: u32, channels: u16) -> Result<()>;
}

struct PlaybackWorker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    stream_tx: Option<mpsc::Sender<Vec<u8>>>,
}

/// Single playback engine with two modes: buffered (a fixed PCM byte buffer
/// sliced into frames) and streaming (a bounded queue fed by the TTS client).
/// At most one worker is ever active; starting either mode preempts the
/// previous worker, and `stop` does not return until the worker has exited.
pub struct AudioOutputManager {
    sink: Arc<dyn PcmSink>,
    config: AudioConfig,
    playing: Arc<AtomicBool>,
    worker: Mutex<Option<PlaybackWorker>>,
    dropped_chunks: AtomicUsize,
}

impl AudioOutputManager {
    pub fn new(sink: Arc<dyn PcmSink>, config: AudioConfig) -> Self {
        Self {
            sink,
            config,
            playing: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            dropped_chunks: AtomicUsize::new(0),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    /// Buffered mode: preempt any running worker, then play `pcm` in
    /// `chunk_size`-byte frames with the configured inter-chunk delay.
    /// Returns as soon as the worker is started.
    pub async fn play(&self, pcm: Vec<u8>, chunk_size: usize) -> Result<()> {
        if chunk_size == 0 {
            return Err(anyhow!("chunk_size must be non-zero"));
        }
        self.stop().await;

        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let sink = Arc::clone(&self.sink);
        let playing = Arc::clone(&self.playing);
        let sample_rate = self.config.output_sample_rate;
        let channels = self.config.channels;
        let delay = Duration::from_millis(self.config.chunk_delay_ms);

        playing.store(true, Ordering::SeqCst);
        tracing::debug!(
            "Starting buffered playback: {} bytes in {}-byte chunks",
            pcm.len(),
            chunk_size
        );

        let handle = tokio::spawn(async move {
            'frames: for chunk in pcm.chunks(chunk_size) {
                if worker_cancel.is_cancelled() {
                    break;
                }
                if let Err(e) = sink.write(chunk, sample_rate, channels).await {
                    tracing::warn!("Playback sink write failed: {}", e);
                    break;
                }
                tokio::select! {
                    _ = worker_cancel.cancelled() => break 'frames,
                    _ = sleep(delay) => {}
                }
            }
            playing.store(false, Ordering::SeqCst);
            tracing::debug!("Buffered playback worker finished");
        });

        let mut slot = self.worker.lock().await;
        *slot = Some(PlaybackWorker {
            cancel,
            handle,
            stream_tx: None,
        });
        Ok(())
    }

    /// Streaming mode: preempt any running worker and start draining an
    /// internal bounded queue. Each dequeued chunk is played and then the
    /// worker sleeps for the chunk's real duration.
    pub async fn start_stream(&self) {
        self.stop().await;

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(self.config.stream_queue_capacity);
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let sink = Arc::clone(&self.sink);
        let playing = Arc::clone(&self.playing);
        let sample_rate = self.config.output_sample_rate;
        let channels = self.config.channels;

        playing.store(true, Ordering::SeqCst);
        tracing::debug!("Starting streaming playback at {} Hz", sample_rate);

        let handle = tokio::spawn(async move {
            loop {
                let chunk = tokio::select! {
                    _ = worker_cancel.cancelled() => break,
                    chunk = rx.recv() => match chunk {
                        Some(chunk) => chunk,
                        None => break,
                    },
                };
                if chunk.is_empty() {
                    continue;
                }
                let duration = Duration::from_secs_f64(
                    chunk.len() as f64
                        / (sample_rate as f64 * SAMPLE_WIDTH as f64 * channels as f64),
                );
                if let Err(e) = sink.write(&chunk, sample_rate, channels).await {
                    tracing::warn!("Streaming sink write failed: {}", e);
                    break;
                }
                tokio::select! {
                    _ = worker_cancel.cancelled() => break,
                    _ = sleep(duration) => {}
                }
            }
            playing.store(false, Ordering::SeqCst);
            tracing::debug!("Streaming playback worker exited");
        });

        let mut slot = self.worker.lock().await;
        *slot = Some(PlaybackWorker {
            cancel,
            handle,
            stream_tx: Some(tx),
        });
    }

    /// Non-blocking enqueue of a streamed PCM chunk. Returns false when the
    /// queue is full, playback has been stopped, or streaming was never
    /// started; full-queue drops are counted, not fatal.
    pub async fn push(&self, chunk: Vec<u8>) -> bool {
        let slot = self.worker.lock().await;
        let Some(worker) = slot.as_ref() else {
            return false;
        };
        let Some(tx) = worker.stream_tx.as_ref() else {
            return false;
        };
        match tx.try_send(chunk) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped_chunks.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!("Audio stream queue full, dropped chunk ({} total)", dropped);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Close the streaming queue gracefully: no more pushes are accepted,
    /// the worker plays out what is already queued and then exits on its
    /// own. Pair with `wait_idle` to let a stream drain to the end.
    pub async fn finish_stream(&self) {
        let mut slot = self.worker.lock().await;
        if let Some(worker) = slot.as_mut() {
            worker.stream_tx.take();
        }
    }

    /// Stop playback. Remaining frames are dropped, the queue is cleared,
    /// and the worker is joined before this returns, so a caller observing
    /// `stop().await` knows no further frame reaches the sink.
    pub async fn stop(&self) {
        let worker = {
            let mut slot = self.worker.lock().await;
            slot.take()
        };
        if let Some(worker) = worker {
            worker.cancel.cancel();
            // Dropping the sender closes the queue and discards queued chunks.
            drop(worker.stream_tx);
            if let Err(e) = worker.handle.await {
                if !e.is_cancelled() {
                    tracing::warn!("Playback worker join error: {}", e);
                }
            }
        }
        self.playing.store(false, Ordering::SeqCst);
    }

    /// Wait for the current playback (either mode) to drain naturally.
    pub async fn wait_idle(&self) {
        while self.is_playing() {
            sleep(Duration::from_millis(25)).await;
        }
    }

    pub fn dropped_chunks(&self) -> usize {
        self.dropped_chunks.load(Ordering::Relaxed)
    }
}

/// Streaming sample-rate converter. Accumulates input until the sinc
/// resampler has a full frame, so arbitrarily sized network chunks can be
/// pushed through it.
pub struct PcmResampler {
    inner: SincFixedIn<f32>,
    pending: Vec<f32>,
}

impl PcmResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };
        let inner = SincFixedIn::<f32>::new(
            to_rate as f64 / from_rate as f64,
            2.0,
            params,
            1024,
            1, // mono
        )
        .context("Failed to create resampler")?;
        Ok(Self {
            inner,
            pending: Vec::new(),
        })
    }

    /// Push mono samples through the resampler, returning whatever full
    /// output frames are available so far.
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        loop {
            let needed = self.inner.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let frame: Vec<f32> = self.pending.drain(..needed).collect();
            let resampled = self
                .inner
                .process(&[frame], None)
                .map_err(|e| anyhow!("Resampling failed: {}", e))?;
            out.extend_from_slice(&resampled[0]);
        }
        Ok(out)
    }

    /// Drain the tail by zero-padding the last partial frame.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let needed = self.inner.input_frames_next();
        let mut frame = std::mem::take(&mut self.pending);
        frame.resize(needed, 0.0);
        let resampled = self
            .inner
            .process(&[frame], None)
            .map_err(|e| anyhow!("Resampling failed: {}", e))?;
        Ok(resampled[0].clone())
    }
}

/// Little-endian 16-bit PCM bytes -> normalized f32 samples.
pub fn pcm16_to_f32(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(SAMPLE_WIDTH)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
        .collect()
}

/// Normalized f32 samples -> little-endian 16-bit PCM bytes.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * SAMPLE_WIDTH);
    for s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode an MP3 byte buffer to mono 16-bit PCM at the requested sample
/// rate. Pure helper used by buffered playback for local audio assets.
pub fn mp3_to_pcm(mp3_data: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    use symphonia::core::audio::{AudioBufferRef, Signal};
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::errors::Error as SymphoniaError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let cursor = std::io::Cursor::new(mp3_data.to_vec());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());
    let mut hint = Hint::new();
    hint.with_extension("mp3");

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| anyhow!("MP3 probe failed: {}", e))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("No audio track in MP3 data"))?;
    let in_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("Unknown MP3 sample rate"))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| anyhow!("MP3 decoder init failed: {}", e))?;

    let mut mono: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(SymphoniaError::IoError(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(anyhow!("MP3 read error: {}", e)),
        };

        match decoder.decode(&packet) {
            Ok(AudioBufferRef::F32(buf)) => downmix(&mut mono, buf.spec().channels.count(), |c, i| {
                buf.chan(c)[i]
            }, buf.frames()),
            Ok(other) => {
                let spec = *other.spec();
                let frames = other.frames() as u64;
                let mut converted = symphonia::core::audio::AudioBuffer::<f32>::new(frames, spec);
                other.convert(&mut converted);
                let ch = converted.spec().channels.count();
                downmix(&mut mono, ch, |c, i| converted.chan(c)[i], converted.frames());
            }
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(anyhow!("MP3 decode error: {}", e)),
        }
    }

    if mono.is_empty() {
        return Err(anyhow!("Decoded zero samples from MP3 data"));
    }

    let resampled = if in_rate == sample_rate {
        mono
    } else {
        let mut resampler = PcmResampler::new(in_rate, sample_rate)?;
        let mut out = resampler.process(&mono)?;
        out.extend(resampler.flush()?);
        out
    };

    Ok(f32_to_pcm16(&resampled))
}

fn downmix<F: Fn(usize, usize) -> f32>(mono: &mut Vec<f32>, channels: usize, sample: F, frames: usize) {
    if channels == 0 {
        return;
    }
    for i in 0..frames {
        let mut acc = 0.0f32;
        for c in 0..channels {
            acc += sample(c, i);
        }
        mono.push(acc / channels as f32);
    }
}
