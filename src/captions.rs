/*
 * Meeting Recorder CLI - Caption Scraper
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
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::audio_output::AudioOutputManager;
use crate::browser::{CaptionBlock, MeetPage};
use crate::types::{format_timestamp, CaptionEvent, CaptionEventSender, Utterance};

/// Per-speaker partial-caption state. Created on first sighting, replaced
/// wholesale when a returning speaker starts over.
struct TrackerEntry {
    current_text: String,
    last_change: Instant,
    finalized: bool,
}

/// Shared view of "did anyone's caption change recently", readable from the
/// agent without another DOM poll.
#[derive(Clone)]
pub struct SpeakerActivity {
    epoch: Instant,
    last_change_ms: Arc<AtomicU64>,
    window: Duration,
}

impl SpeakerActivity {
    fn new(epoch: Instant, window: Duration) -> Self {
        Self {
            epoch,
            last_change_ms: Arc::new(AtomicU64::new(0)),
            window,
        }
    }

    fn record(&self, now: Instant) {
        let ms = now.duration_since(self.epoch).as_millis() as u64;
        self.last_change_ms.store(ms.max(1), Ordering::Relaxed);
    }

    /// True when some caption changed within the stability window.
    pub fn is_speaker_active(&self) -> bool {
        let last = self.last_change_ms.load(Ordering::Relaxed);
        if last == 0 {
            return false;
        }
        let now_ms = Instant::now().duration_since(self.epoch).as_millis() as u64;
        now_ms.saturating_sub(last) <= self.window.as_millis() as u64
    }
}

/// Polls the caption region, stabilizes partial captions into finalized
/// utterances, and doubles as the wake/barge-in signal source. The tracker
/// map is owned exclusively by this task; everything leaves through the
/// single event channel.
pub struct CaptionScraper {
    page: Arc<dyn MeetPage>,
    audio: Arc<AudioOutputManager>,
    events: CaptionEventSender,
    wake_phrase: String,
    poll_interval: Duration,
    stable_time: Duration,
    meeting_start: Instant,
    activity: SpeakerActivity,
    trackers: HashMap<String, TrackerEntry>,
    last_finalized: HashMap<String, String>,
    utterances: Vec<Utterance>,
}

impl CaptionScraper {
    pub fn new(
        page: Arc<dyn MeetPage>,
        audio: Arc<AudioOutputManager>,
        events: CaptionEventSender,
        wake_phrase: String,
        poll_interval: Duration,
        stable_time: Duration,
    ) -> Self {
        let meeting_start = Instant::now();
        Self {
            page,
            audio,
            events,
            wake_phrase: wake_phrase.to_lowercase(),
            poll_interval,
            stable_time,
            meeting_start,
            activity: SpeakerActivity::new(meeting_start, stable_time),
            trackers: HashMap::new(),
            last_finalized: HashMap::new(),
            utterances: Vec::new(),
        }
    }

    /// Handle for the agent's `is_speaker_active` checks.
    pub fn activity(&self) -> SpeakerActivity {
        self.activity.clone()
    }

    /// Tick until cancelled, then hand back every finalized utterance in
    /// emission order.
    pub async fn run(mut self, cancel: CancellationToken) -> Vec<Utterance> {
        tracing::info!(
            "Caption scraper started (poll {:?}, stable {:?})",
            self.poll_interval,
            self.stable_time
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.poll_interval) => {}
            }
            self.tick(Instant::now()).await;
        }
        tracing::info!(
            "Caption scraper stopped with {} utterances",
            self.utterances.len()
        );
        self.utterances
    }

    async fn tick(&mut self, now: Instant) {
        let blocks = match self.page.caption_blocks().await {
            Ok(Some(blocks)) => blocks,
            Ok(None) => return, // captions not on screen this tick
            Err(e) => {
                tracing::debug!("Caption region read failed: {}", e);
                return;
            }
        };

        for block in merge_adjacent_blocks(blocks) {
            self.track_block(block, now).await;
        }
    }

    async fn track_block(&mut self, block: CaptionBlock, now: Instant) {
        let speaker = block.speaker;
        let text = block.text;
        if text.is_empty() {
            return;
        }

        match self.trackers.get_mut(&speaker) {
            None => {
                self.trackers.insert(
                    speaker,
                    TrackerEntry {
                        current_text: text,
                        last_change: now,
                        finalized: false,
                    },
                );
                self.activity.record(now);
            }
            Some(entry) if entry.current_text != text => {
                let grew = text.len() > entry.current_text.len();
                entry.current_text = text;
                entry.last_change = now;
                entry.finalized = false;
                self.activity.record(now);

                if grew && self.audio.is_playing() {
                    tracing::info!("Barge-in: {} kept talking during playback", speaker);
                    self.audio.stop().await;
                    self.send(CaptionEvent::BargeIn {
                        speaker_name: speaker,
                    })
                    .await;
                }
            }
            Some(entry) => {
                let stable = now.duration_since(entry.last_change) > self.stable_time;
                if !entry.finalized && stable {
                    entry.finalized = true;
                    let full_text = entry.current_text.clone();
                    self.finalize(&speaker, &full_text, now).await;
                }
            }
        }
    }

    /// Promote a stable caption to an immutable utterance. Only the delta
    /// against the previously finalized text is emitted, so a growing
    /// caption never repeats what was already published.
    async fn finalize(&mut self, speaker: &str, full_text: &str, now: Instant) {
        let delta = match self.last_finalized.get(speaker) {
            Some(prior) if full_text.starts_with(prior.as_str()) => {
                let suffix = &full_text[prior.len()..];
                suffix.strip_prefix(". ").unwrap_or(suffix).trim().to_string()
            }
            _ => full_text.trim().to_string(),
        };
        self.last_finalized
            .insert(speaker.to_string(), full_text.to_string());

        if delta.is_empty() {
            return;
        }

        let elapsed = now.duration_since(self.meeting_start).as_secs();
        let timestamp = format_timestamp(elapsed);
        let utterance = Utterance {
            speaker_name: speaker.to_string(),
            text: delta.clone(),
            start_timestamp: timestamp.clone(),
            end_timestamp: timestamp,
        };

        if delta.to_lowercase().contains(&self.wake_phrase) {
            tracing::info!("Wake phrase heard from {}", speaker);
            self.send(CaptionEvent::Wake {
                speaker_name: speaker.to_string(),
            })
            .await;
        }

        tracing::debug!("[{}] {}: {}", utterance.start_timestamp, speaker, delta);
        self.send(CaptionEvent::Utterance(utterance.clone())).await;
        self.utterances.push(utterance);
    }

    async fn send(&self, event: CaptionEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("Caption event receiver gone");
        }
    }
}

/// Concatenate consecutive blocks from the same speaker into one logical
/// block. Non-adjacent repeats stay separate.
fn merge_adjacent_blocks(blocks: Vec<CaptionBlock>) -> Vec<CaptionBlock> {
    let mut merged: Vec<CaptionBlock> = Vec::with_capacity(blocks.len());

    for block in blocks {
        if block.speaker.is_empty() {
            continue;
        }
        match merged.last_mut() {
            Some(last) if last.speaker == block.speaker => {
                if !block.text.is_empty() {
                    if !last.text.is_empty() {
                        last.text.push(' ');
                    }
                    last.text.push_str(&block.text);
                }
            }
            _ => merged.push(block),
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_output::{AudioOutputManager, PcmSink};
    use crate::browser::MockMeetPage;
    use crate::config::AudioConfig;
    use crate::types::CaptionEventReceiver;
    use anyhow::Result;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct NullSink;

    #[async_trait]
    impl PcmSink for NullSink {
        async fn write(&self, _pcm: &[u8], _sample_rate: u32, _channels: u16) -> Result<()> {
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

    fn scraper(
        page: Arc<MockMeetPage>,
        audio: Arc<AudioOutputManager>,
    ) -> (CaptionScraper, CaptionEventReceiver) {
        let (tx, rx) = mpsc::channel(64);
        let scraper = CaptionScraper::new(
            page,
            audio,
            tx,
            "hello meeting assistant".to_string(),
            Duration::from_millis(1500),
            Duration::from_millis(1500),
        );
        (scraper, rx)
    }

    fn drain(rx: &mut CaptionEventReceiver) -> Vec<CaptionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn adjacent_same_speaker_blocks_merge() {
        let merged = merge_adjacent_blocks(vec![
            CaptionBlock::new("Alice", "hi"),
            CaptionBlock::new("Alice", "there"),
            CaptionBlock::new("Bob", "welcome"),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0], CaptionBlock::new("Alice", "hi there"));
        assert_eq!(merged[1], CaptionBlock::new("Bob", "welcome"));
    }

    #[test]
    fn non_adjacent_blocks_stay_separate() {
        let merged = merge_adjacent_blocks(vec![
            CaptionBlock::new("Alice", "one"),
            CaptionBlock::new("Bob", "two"),
            CaptionBlock::new("Alice", "three"),
        ]);
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn empty_speaker_blocks_are_dropped() {
        let merged = merge_adjacent_blocks(vec![
            CaptionBlock::new("", "noise"),
            CaptionBlock::new("Alice", "hi"),
        ]);
        assert_eq!(merged.len(), 1);
    }

    /// A caption that stays identical across ticks finalizes exactly once.
    #[tokio::test]
    async fn stable_caption_finalizes_once() {
        let page = Arc::new(MockMeetPage::new());
        page.set_captions(Some(vec![CaptionBlock::new("Alice", "hello")]));
        let (mut scraper, mut rx) = scraper(page, audio_manager());

        let t0 = scraper.meeting_start + Duration::from_millis(1000);
        scraper.tick(t0).await; // first sighting, no event
        scraper.tick(t0 + Duration::from_millis(1600)).await; // stable -> finalize
        scraper.tick(t0 + Duration::from_millis(3200)).await; // already finalized

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            CaptionEvent::Utterance(u) => {
                assert_eq!(u.speaker_name, "Alice");
                assert_eq!(u.text, "hello");
                assert_eq!(u.start_timestamp, "00:02");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    /// Growth after finalization emits only the suffix, with the
    /// leading ". " stripped.
    #[tokio::test]
    async fn growing_caption_emits_delta() {
        let page = Arc::new(MockMeetPage::new());
        page.set_captions(Some(vec![CaptionBlock::new("Alice", "hello")]));
        let (mut scraper, mut rx) = scraper(page.clone(), audio_manager());

        let t0 = scraper.meeting_start + Duration::from_millis(1000);
        scraper.tick(t0).await;
        scraper.tick(t0 + Duration::from_millis(1600)).await;

        page.set_captions(Some(vec![CaptionBlock::new("Alice", "hello. how are you")]));
        let t1 = t0 + Duration::from_millis(5000);
        scraper.tick(t1).await; // text changed
        scraper.tick(t1 + Duration::from_millis(1600)).await; // stable again

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        match &events[1] {
            CaptionEvent::Utterance(u) => assert_eq!(u.text, "how are you"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    /// A caption replaced before the stability window elapses never emits.
    #[tokio::test]
    async fn unstable_caption_produces_nothing() {
        let page = Arc::new(MockMeetPage::new());
        page.set_captions(Some(vec![CaptionBlock::new("Alice", "hel")]));
        let (mut scraper, mut rx) = scraper(page.clone(), audio_manager());

        let t0 = scraper.meeting_start + Duration::from_millis(1000);
        scraper.tick(t0).await;
        page.set_captions(Some(vec![CaptionBlock::new("Alice", "hello wor")]));
        scraper.tick(t0 + Duration::from_millis(500)).await;
        page.set_captions(Some(vec![CaptionBlock::new("Alice", "hello world today")]));
        scraper.tick(t0 + Duration::from_millis(1000)).await;

        assert!(drain(&mut rx).is_empty());
    }

    /// A returning speaker whose text does not extend the finalized text
    /// re-emits in full.
    #[tokio::test]
    async fn returning_speaker_restarts_delta() {
        let page = Arc::new(MockMeetPage::new());
        page.set_captions(Some(vec![CaptionBlock::new("Alice", "first thought")]));
        let (mut scraper, mut rx) = scraper(page.clone(), audio_manager());

        let t0 = scraper.meeting_start + Duration::from_millis(1000);
        scraper.tick(t0).await;
        scraper.tick(t0 + Duration::from_millis(1600)).await;

        page.set_captions(Some(vec![CaptionBlock::new("Alice", "brand new sentence")]));
        let t1 = t0 + Duration::from_millis(10_000);
        scraper.tick(t1).await;
        scraper.tick(t1 + Duration::from_millis(1600)).await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        match &events[1] {
            CaptionEvent::Utterance(u) => assert_eq!(u.text, "brand new sentence"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn wake_phrase_emits_wake_before_utterance() {
        let page = Arc::new(MockMeetPage::new());
        page.set_captions(Some(vec![CaptionBlock::new(
            "Bob",
            "Hello meeting assistant, are you there",
        )]));
        let (mut scraper, mut rx) = scraper(page, audio_manager());

        let t0 = scraper.meeting_start + Duration::from_millis(1000);
        scraper.tick(t0).await;
        scraper.tick(t0 + Duration::from_millis(1600)).await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], CaptionEvent::Wake { .. }));
        assert!(matches!(events[1], CaptionEvent::Utterance(_)));
    }

    /// Growth during playback stops the audio and raises barge-in.
    #[tokio::test]
    async fn growth_during_playback_raises_barge_in() {
        let page = Arc::new(MockMeetPage::new());
        page.set_captions(Some(vec![CaptionBlock::new("Alice", "so about")]));
        let audio = audio_manager();
        let (mut scraper, mut rx) = scraper(page.clone(), audio.clone());

        let t0 = scraper.meeting_start + Duration::from_millis(1000);
        scraper.tick(t0).await;

        audio.start_stream().await;
        assert!(audio.is_playing());

        page.set_captions(Some(vec![CaptionBlock::new("Alice", "so about that plan")]));
        scraper.tick(t0 + Duration::from_millis(400)).await;

        assert!(!audio.is_playing(), "playback stopped by barge-in");
        let events = drain(&mut rx);
        assert!(matches!(events[0], CaptionEvent::BargeIn { .. }));
    }

    /// Shrinking or rewritten-shorter text does not barge in.
    #[tokio::test]
    async fn shrinking_text_does_not_barge_in() {
        let page = Arc::new(MockMeetPage::new());
        page.set_captions(Some(vec![CaptionBlock::new("Alice", "a long partial caption")]));
        let audio = audio_manager();
        let (mut scraper, mut rx) = scraper(page.clone(), audio.clone());

        let t0 = scraper.meeting_start + Duration::from_millis(1000);
        scraper.tick(t0).await;

        audio.start_stream().await;
        page.set_captions(Some(vec![CaptionBlock::new("Alice", "a long")]));
        scraper.tick(t0 + Duration::from_millis(400)).await;

        assert!(audio.is_playing());
        assert!(drain(&mut rx).is_empty());
        audio.stop().await;
    }

    #[tokio::test]
    async fn missing_region_skips_tick() {
        let page = Arc::new(MockMeetPage::new());
        page.set_captions(None);
        let (mut scraper, mut rx) = scraper(page, audio_manager());

        scraper.tick(scraper.meeting_start + Duration::from_millis(1000)).await;
        assert!(drain(&mut rx).is_empty());
        assert!(scraper.trackers.is_empty());
    }

    #[tokio::test]
    async fn activity_handle_tracks_recent_changes() {
        let page = Arc::new(MockMeetPage::new());
        page.set_captions(Some(vec![CaptionBlock::new("Alice", "words")]));
        let (mut scraper, _rx) = scraper(page, audio_manager());
        let activity = scraper.activity();

        assert!(!activity.is_speaker_active());
        scraper.tick(Instant::now()).await;
        assert!(activity.is_speaker_active());
    }
}
