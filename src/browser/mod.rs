/*
 * Meeting Recorder CLI - Browser Abstraction
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

pub mod chromium;
pub mod driver;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// One caption entry as read from the meeting page: a speaker name and that
/// speaker's current (possibly partial) text.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionBlock {
    pub speaker: String,
    pub text: String,
}

impl CaptionBlock {
    pub fn new(speaker: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            speaker: speaker.into(),
            text: text.into(),
        }
    }
}

/// Trait abstracting the meeting page. `ChromiumMeetPage` drives a real
/// Chrome over the DevTools protocol; `MockMeetPage` backs the tests.
#[async_trait]
pub trait MeetPage: Send + Sync {
    /// Navigate to the given URL.
    async fn navigate(&self, url: &str) -> Result<()>;

    /// Whether an element matching the CSS selector currently exists.
    async fn exists(&self, selector: &str) -> Result<bool>;

    /// Click the first element matching the CSS selector.
    async fn click(&self, selector: &str) -> Result<()>;

    /// Clear and fill an input element.
    async fn fill(&self, selector: &str, value: &str) -> Result<()>;

    /// Read an attribute of the first matching element.
    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>>;

    /// Click a button by its visible label. Returns false when no such
    /// button is on the page (Meet renders its join controls as text).
    async fn click_button_with_text(&self, text: &str) -> Result<bool>;

    /// Evaluate a JavaScript expression and return its JSON result.
    async fn evaluate(&self, script: &str) -> Result<Value>;

    /// Install a script that runs in every new document before any page
    /// script does.
    async fn add_init_script(&self, script: &str) -> Result<()>;

    /// Read the caption region. None when the region is not on screen.
    async fn caption_blocks(&self) -> Result<Option<Vec<CaptionBlock>>>;

    /// Close the page and the browser behind it.
    async fn close(&self) -> Result<()>;
}

/// A mock meeting page for tests: a settable DOM state table plus a call
/// log for assertions.
#[derive(Default)]
pub struct MockMeetPage {
    present: Mutex<HashSet<String>>,
    attributes: Mutex<HashMap<(String, String), String>>,
    buttons: Mutex<HashSet<String>>,
    eval_results: Mutex<HashMap<String, Value>>,
    /// Caption region states returned tick by tick; the last state repeats.
    caption_ticks: Mutex<VecDeque<Option<Vec<CaptionBlock>>>>,
    current_captions: Mutex<Option<Vec<CaptionBlock>>>,
    call_log: Mutex<Vec<(String, Vec<String>)>>,
    closed: Mutex<bool>,
}

impl MockMeetPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_present(&self, selector: &str) {
        self.present.lock().unwrap().insert(selector.to_string());
    }

    pub fn set_absent(&self, selector: &str) {
        self.present.lock().unwrap().remove(selector);
    }

    pub fn set_attribute(&self, selector: &str, name: &str, value: &str) {
        self.attributes
            .lock()
            .unwrap()
            .insert((selector.to_string(), name.to_string()), value.to_string());
    }

    pub fn set_button(&self, text: &str) {
        self.buttons.lock().unwrap().insert(text.to_string());
    }

    pub fn add_eval_result(&self, script: &str, result: Value) {
        self.eval_results
            .lock()
            .unwrap()
            .insert(script.to_string(), result);
    }

    /// Fix the caption region state until changed again.
    pub fn set_captions(&self, captions: Option<Vec<CaptionBlock>>) {
        *self.current_captions.lock().unwrap() = captions;
    }

    /// Queue caption region states consumed one per scraper tick; after the
    /// queue drains the last state sticks.
    pub fn push_caption_tick(&self, captions: Option<Vec<CaptionBlock>>) {
        self.caption_ticks.lock().unwrap().push_back(captions);
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.call_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.call_log.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }

    fn log_call(&self, method: &str, args: Vec<String>) {
        self.call_log
            .lock()
            .unwrap()
            .push((method.to_string(), args));
    }
}

#[async_trait]
impl MeetPage for MockMeetPage {
    async fn navigate(&self, url: &str) -> Result<()> {
        self.log_call("navigate", vec![url.to_string()]);
        Ok(())
    }

    async fn exists(&self, selector: &str) -> Result<bool> {
        self.log_call("exists", vec![selector.to_string()]);
        Ok(self.present.lock().unwrap().contains(selector))
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.log_call("click", vec![selector.to_string()]);
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<()> {
        self.log_call("fill", vec![selector.to_string(), value.to_string()]);
        Ok(())
    }

    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>> {
        self.log_call("attribute", vec![selector.to_string(), name.to_string()]);
        Ok(self
            .attributes
            .lock()
            .unwrap()
            .get(&(selector.to_string(), name.to_string()))
            .cloned())
    }

    async fn click_button_with_text(&self, text: &str) -> Result<bool> {
        self.log_call("click_button_with_text", vec![text.to_string()]);
        Ok(self.buttons.lock().unwrap().contains(text))
    }

    async fn evaluate(&self, script: &str) -> Result<Value> {
        self.log_call("evaluate", vec![script.to_string()]);
        Ok(self
            .eval_results
            .lock()
            .unwrap()
            .get(script)
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn add_init_script(&self, script: &str) -> Result<()> {
        self.log_call("add_init_script", vec![script.to_string()]);
        Ok(())
    }

    async fn caption_blocks(&self) -> Result<Option<Vec<CaptionBlock>>> {
        self.log_call("caption_blocks", vec![]);
        if let Some(next) = self.caption_ticks.lock().unwrap().pop_front() {
            *self.current_captions.lock().unwrap() = next;
        }
        Ok(self.current_captions.lock().unwrap().clone())
    }

    async fn close(&self) -> Result<()> {
        self.log_call("close", vec![]);
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_tracks_presence() {
        let page = MockMeetPage::new();
        assert!(!page.exists("#leave").await.unwrap());
        page.set_present("#leave");
        assert!(page.exists("#leave").await.unwrap());
        page.set_absent("#leave");
        assert!(!page.exists("#leave").await.unwrap());
    }

    #[tokio::test]
    async fn mock_caption_ticks_advance_then_stick() {
        let page = MockMeetPage::new();
        page.push_caption_tick(None);
        page.push_caption_tick(Some(vec![CaptionBlock::new("Alice", "hi")]));

        assert_eq!(page.caption_blocks().await.unwrap(), None);
        let second = page.caption_blocks().await.unwrap().unwrap();
        assert_eq!(second[0].speaker, "Alice");
        // Queue drained: the last state repeats.
        assert!(page.caption_blocks().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn mock_records_calls() {
        let page = MockMeetPage::new();
        page.navigate("https://meet.google.com/abc").await.unwrap();
        page.fill("input", "Bot").await.unwrap();
        assert_eq!(page.call_count("navigate"), 1);
        let calls = page.calls();
        assert_eq!(calls[1].1, vec!["input", "Bot"]);
    }
}
