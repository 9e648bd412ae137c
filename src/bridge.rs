/*
 * Meeting Recorder CLI - Page Audio Bridge
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
use async_trait::async_trait;
use base64::Engine;
use std::sync::Arc;

use crate::audio_output::PcmSink;
use crate::browser::MeetPage;

/// Script injected into every document before any page script runs. It
/// exposes a single global, `window.botOutputManager.playPCMAudio`, which
/// takes base64-encoded 16-bit PCM plus sample rate and channel count,
/// finds the meeting's active RTCPeerConnection and plays the samples into
/// a generated outbound audio track. The page owns the bridge; the Rust
/// side only ever calls this one function.
pub const PAGE_BRIDGE_JS: &str = r#"
(() => {
    if (window.botOutputManager) { return; }

    const state = { generator: null, writer: null, timestampUs: 0 };

    function findPeerConnection() {
        for (const key in window) {
            try {
                if (window[key] instanceof RTCPeerConnection) {
                    return window[key];
                }
            } catch (e) {}
        }
        return null;
    }

    function ensureTrack(sampleRate) {
        if (state.writer) { return true; }
        const pc = findPeerConnection();
        if (!pc) {
            console.warn('botOutputManager: no RTCPeerConnection found');
            return false;
        }
        state.generator = new MediaStreamTrackGenerator({ kind: 'audio' });
        state.writer = state.generator.writable.getWriter();
        pc.addTrack(state.generator);
        return true;
    }

    window.botOutputManager = {
        playPCMAudio: function (b64, sampleRate, channels) {
            if (!ensureTrack(sampleRate)) { return false; }
            const raw = Uint8Array.from(atob(b64), c => c.charCodeAt(0));
            const pcm = new Int16Array(raw.buffer);
            const floats = new Float32Array(pcm.length);
            for (let i = 0; i < pcm.length; i++) {
                floats[i] = pcm[i] / 32768;
            }
            state.writer.write(new AudioData({
                timestamp: state.timestampUs,
                data: floats,
                format: 'f32',
                numberOfFrames: floats.length / channels,
                numberOfChannels: channels,
                sampleRate: sampleRate
            }));
            state.timestampUs += (floats.length / channels) / sampleRate * 1000000;
            return true;
        }
    };
})();
"#;

/// The Audio Output Manager's production sink: base64-encodes each PCM
/// frame and hands it to the in-page bridge.
pub struct PageAudioBridge {
    page: Arc<dyn MeetPage>,
}

impl PageAudioBridge {
    pub fn new(page: Arc<dyn MeetPage>) -> Self {
        Self { page }
    }

    /// Install the bridge script for all future documents on this page.
    /// Must run before the meeting URL is opened.
    pub async fn install(page: &Arc<dyn MeetPage>) -> Result<()> {
        page.add_init_script(PAGE_BRIDGE_JS).await
    }
}

#[async_trait]
impl PcmSink for PageAudioBridge {
    async fn write(&self, pcm: &[u8], sample_rate: u32, channels: u16) -> Result<()> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(pcm);
        let script = format!(
            "window.botOutputManager.playPCMAudio(\"{}\", {}, {})",
            encoded, sample_rate, channels
        );
        let result = self.page.evaluate(&script).await?;
        if result.as_bool() == Some(false) {
            return Err(anyhow!("Page bridge has no peer connection to play into"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::MockMeetPage;
    use serde_json::json;

    #[tokio::test]
    async fn write_encodes_pcm_and_calls_the_global() {
        let page = Arc::new(MockMeetPage::new());
        let bridge = PageAudioBridge::new(page.clone() as Arc<dyn MeetPage>);

        // Mock evaluate returns Null for unknown scripts, which counts as ok.
        bridge.write(&[0x01, 0x02, 0x03, 0x04], 44100, 1).await.unwrap();

        let calls = page.calls();
        let (method, args) = &calls[0];
        assert_eq!(method, "evaluate");
        assert!(args[0].starts_with("window.botOutputManager.playPCMAudio(\""));
        assert!(args[0].contains("44100"));
        // base64 of 01 02 03 04
        assert!(args[0].contains("AQIDBA=="));
    }

    #[tokio::test]
    async fn write_surfaces_missing_peer_connection() {
        let page = Arc::new(MockMeetPage::new());
        let encoded = base64::engine::general_purpose::STANDARD.encode([0u8; 4]);
        let script = format!(
            "window.botOutputManager.playPCMAudio(\"{}\", 44100, 1)",
            encoded
        );
        page.add_eval_result(&script, json!(false));

        let bridge = PageAudioBridge::new(page as Arc<dyn MeetPage>);
        assert!(bridge.write(&[0u8; 4], 44100, 1).await.is_err());
    }

    #[tokio::test]
    async fn install_registers_init_script() {
        let page: Arc<dyn MeetPage> = Arc::new(MockMeetPage::new());
        PageAudioBridge::install(&page).await.unwrap();
    }
}
