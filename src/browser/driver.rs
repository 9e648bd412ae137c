/*
 * Meeting Recorder CLI - Meet Driver
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
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use super::MeetPage;

const MIC_BUTTON: &str = "[role='button'][aria-label*='microphone']";
const CAMERA_BUTTON: &str = "[role='button'][aria-label*='camera']";
const NAME_INPUT: &str = "input[placeholder='Your name']";
const LEAVE_CALL: &str = "[aria-label='Leave call']";
const CAPTIONS_BUTTON: &str = "[aria-label*='captions']";

const ASK_TO_JOIN: &str = "Ask to join";
const JOIN_NOW: &str = "Join now";

/// Script used to spot the waiting-room state. Purely informational; the
/// admission test is the presence of the Leave-call control.
const WAITING_ROOM_JS: &str =
    "document.body.innerText.toLowerCase().includes('asking to be let in')";

/// How often the keep-alive loop re-checks that we are still in the call.
const KEEP_ALIVE_POLL: Duration = Duration::from_secs(2);

/// Drives the meeting page through the guest join flow and holds the
/// session open until it ends.
pub struct MeetDriver {
    page: Arc<dyn MeetPage>,
}

impl MeetDriver {
    pub fn new(page: Arc<dyn MeetPage>) -> Self {
        Self { page }
    }

    /// Open the meeting URL, switch mic and camera off, set the guest name
    /// and request to join. Fails only when no join control exists at all.
    pub async fn open(&self, url: &str, guest_name: &str) -> Result<()> {
        tracing::info!("Opening meeting: {}", url);
        self.page.navigate(url).await?;

        // Give the lobby time to render its controls.
        sleep(Duration::from_secs(5)).await;

        self.disable_media_control(MIC_BUTTON, "microphone").await;
        self.disable_media_control(CAMERA_BUTTON, "camera").await;

        match self.page.exists(NAME_INPUT).await {
            Ok(true) => {
                self.page.fill(NAME_INPUT, guest_name).await?;
                tracing::info!("Guest name set: {}", guest_name);
            }
            _ => tracing::warn!("Guest name input not found, joining unnamed"),
        }

        if self.page.click_button_with_text(ASK_TO_JOIN).await? {
            tracing::info!("Clicked '{}'", ASK_TO_JOIN);
        } else if self.page.click_button_with_text(JOIN_NOW).await? {
            tracing::info!("Clicked '{}'", JOIN_NOW);
        } else {
            return Err(anyhow!("No join control found on the meeting page"));
        }

        Ok(())
    }

    /// Poll until the host admits us (Leave-call control appears) or the
    /// timeout elapses. Returns false when admission never happened.
    pub async fn wait_for_admission(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut reported_pending = false;

        while Instant::now() < deadline {
            if self.page.exists(LEAVE_CALL).await.unwrap_or(false) {
                tracing::info!("Admitted to the meeting");
                return Ok(true);
            }

            if !reported_pending {
                let pending = self
                    .page
                    .evaluate(WAITING_ROOM_JS)
                    .await
                    .ok()
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if pending {
                    tracing::info!("Waiting room: host has not admitted us yet");
                    reported_pending = true;
                }
            }

            sleep(Duration::from_secs(1)).await;
        }

        tracing::warn!("Admission timed out after {:?}", timeout);
        Ok(false)
    }

    /// Turn captions on if they are not already on. Missing control is
    /// logged and tolerated; the captured audio still covers the meeting.
    pub async fn enable_captions(&self) -> Result<()> {
        match self.page.exists(CAPTIONS_BUTTON).await {
            Ok(true) => {
                let pressed = self
                    .page
                    .attribute(CAPTIONS_BUTTON, "aria-pressed")
                    .await
                    .unwrap_or(None);
                if pressed.as_deref() != Some("true") {
                    self.page.click(CAPTIONS_BUTTON).await?;
                    tracing::info!("Captions enabled");
                } else {
                    tracing::info!("Captions already on");
                }
            }
            _ => tracing::warn!("Captions control not found"),
        }
        Ok(())
    }

    /// Stay in the call until it ends, we are removed, the recording budget
    /// elapses or the job is cancelled. A DOM lookup failure mid-call is
    /// treated as end-of-meeting.
    pub async fn keep_alive(&self, max_duration: Duration, cancel: &CancellationToken) {
        let deadline = Instant::now() + max_duration;

        loop {
            if cancel.is_cancelled() {
                tracing::info!("Keep-alive cancelled");
                return;
            }
            if Instant::now() >= deadline {
                tracing::info!("Recording budget of {:?} elapsed", max_duration);
                return;
            }

            match self.page.exists(LEAVE_CALL).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!("Leave-call control gone: meeting ended or we were removed");
                    return;
                }
                Err(e) => {
                    tracing::warn!("DOM lookup failed mid-call, treating as meeting end: {}", e);
                    return;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(KEEP_ALIVE_POLL) => {}
            }
        }
    }

    pub async fn close(&self) {
        if let Err(e) = self.page.close().await {
            tracing::warn!("Failed to close browser: {}", e);
        }
    }

    /// Toggle a pre-join media control off when it reports being on.
    /// Absent controls are tolerated: the meeting may not offer them.
    async fn disable_media_control(&self, selector: &str, label: &str) {
        match self.page.exists(selector).await {
            Ok(true) => {
                let muted = self
                    .page
                    .attribute(selector, "data-is-muted")
                    .await
                    .unwrap_or(None);
                if muted.as_deref() != Some("true") {
                    match self.page.click(selector).await {
                        Ok(()) => tracing::info!("{} disabled", label),
                        Err(e) => tracing::warn!("Could not toggle {}: {}", label, e),
                    }
                } else {
                    tracing::info!("{} already muted", label);
                }
            }
            _ => tracing::warn!("Could not find {} button", label),
        }
    }
}
