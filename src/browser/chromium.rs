/*
 * Meeting Recorder CLI - Chromium Page
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
use futures::StreamExt;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::BrowserConfig;

use super::{CaptionBlock, MeetPage};

/// JS that reads the on-screen caption region. Returns null when the region
/// is absent, otherwise an ordered array of {speaker, text} objects.
const CAPTION_SCRAPE_JS: &str = r#"
(() => {
    const region = document.querySelector('div[aria-label="Captions"], div[jsname="dsyhDe"]');
    if (!region) { return null; }
    const out = [];
    for (const block of region.querySelectorAll(':scope > div')) {
        const nameEl = block.querySelector('.NWpY1d, .zs7s8d, div:first-child');
        const textEl = block.querySelector('.bh44bd, .iTTPOb, div:nth-child(2)');
        const speaker = nameEl ? nameEl.textContent.trim() : '';
        const text = textEl ? textEl.textContent.trim() : '';
        out.push({ speaker: speaker, text: text });
    }
    return out;
})()
"#;

/// A real meeting page backed by chromiumoxide.
///
/// Owns a Chrome/Chromium process and a single page. The CDP event handler
/// runs on its own task for the lifetime of the browser.
pub struct ChromiumMeetPage {
    page: Arc<Mutex<chromiumoxide::Page>>,
    browser: Arc<Mutex<chromiumoxide::Browser>>,
    handler: tokio::task::JoinHandle<()>,
}

impl ChromiumMeetPage {
    /// Launch Chrome configured for unattended meeting capture: media
    /// permission prompts auto-accepted, autoplay allowed, audio routed to
    /// the named PulseAudio sink, per-job profile directory.
    pub async fn launch(
        config: &BrowserConfig,
        sink_name: &str,
        user_data_dir: &Path,
    ) -> Result<Self> {
        // Chrome inherits the process environment; PULSE_SINK pins every
        // stream the browser opens onto the virtual sink.
        std::env::set_var("PULSE_SINK", sink_name);

        let mut builder = chromiumoxide::BrowserConfig::builder();

        if let Some(chrome) = &config.chrome_binary {
            builder = builder.chrome_executable(chrome);
        }
        if config.headless {
            builder = builder.arg("--headless=new");
        }

        builder = builder
            .user_data_dir(user_data_dir)
            .window_size(1280, 720)
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--autoplay-policy=no-user-gesture-required")
            .arg("--use-fake-ui-for-media-stream");

        let browser_config = builder
            .build()
            .map_err(|e| anyhow!("Failed to build browser config: {}", e))?;

        let (browser, mut handler) = chromiumoxide::Browser::launch(browser_config)
            .await
            .context("Failed to launch Chrome")?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::debug!("CDP handler event error: {}", e);
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .context("Failed to create page")?;

        Ok(Self {
            page: Arc::new(Mutex::new(page)),
            browser: Arc::new(Mutex::new(browser)),
            handler: handler_task,
        })
    }
}

#[async_trait]
impl MeetPage for ChromiumMeetPage {
    async fn navigate(&self, url: &str) -> Result<()> {
        let page = self.page.lock().await;
        page.goto(url)
            .await
            .with_context(|| format!("Navigation to {} failed", url))?;
        Ok(())
    }

    async fn exists(&self, selector: &str) -> Result<bool> {
        let page = self.page.lock().await;
        Ok(page.find_element(selector).await.is_ok())
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let page = self.page.lock().await;
        let element = page
            .find_element(selector)
            .await
            .with_context(|| format!("Element not found: {}", selector))?;
        element
            .click()
            .await
            .with_context(|| format!("Click failed: {}", selector))?;
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<()> {
        let page = self.page.lock().await;
        let element = page
            .find_element(selector)
            .await
            .with_context(|| format!("Input not found: {}", selector))?;
        element.click().await.ok();
        element
            .type_str(value)
            .await
            .with_context(|| format!("Typing into {} failed", selector))?;
        Ok(())
    }

    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>> {
        let page = self.page.lock().await;
        let element = page
            .find_element(selector)
            .await
            .with_context(|| format!("Element not found: {}", selector))?;
        element
            .attribute(name)
            .await
            .with_context(|| format!("Attribute {} read failed on {}", name, selector))
    }

    async fn click_button_with_text(&self, text: &str) -> Result<bool> {
        let needle = serde_json::to_string(text)?;
        let script = format!(
            r#"(() => {{
                const candidates = Array.from(document.querySelectorAll('button, [role="button"]'));
                const target = candidates.find(el => (el.innerText || '').trim().startsWith({needle}));
                if (!target) {{ return false; }}
                target.click();
                return true;
            }})()"#
        );
        let page = self.page.lock().await;
        let result = page
            .evaluate(script)
            .await
            .with_context(|| format!("Button lookup for '{}' failed", text))?;
        Ok(result.into_value::<bool>().unwrap_or(false))
    }

    async fn evaluate(&self, script: &str) -> Result<Value> {
        let page = self.page.lock().await;
        let result = page
            .evaluate(script)
            .await
            .context("Script evaluation failed")?;
        Ok(result.into_value::<Value>().unwrap_or(Value::Null))
    }

    async fn add_init_script(&self, script: &str) -> Result<()> {
        use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
        let page = self.page.lock().await;
        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(
            script.to_string(),
        ))
        .await
        .context("Failed to install init script")?;
        Ok(())
    }

    async fn caption_blocks(&self) -> Result<Option<Vec<CaptionBlock>>> {
        let raw = self.evaluate(CAPTION_SCRAPE_JS).await?;
        let Value::Array(entries) = raw else {
            return Ok(None);
        };
        let mut blocks = Vec::with_capacity(entries.len());
        for entry in entries {
            let speaker = entry
                .get("speaker")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let text = entry
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            blocks.push(CaptionBlock { speaker, text });
        }
        Ok(Some(blocks))
    }

    async fn close(&self) -> Result<()> {
        {
            let mut browser = self.browser.lock().await;
            if let Err(e) = browser.close().await {
                tracing::warn!("Browser close failed: {}", e);
            }
            if let Err(e) = browser.wait().await {
                tracing::debug!("Browser wait after close: {}", e);
            }
        }
        self.handler.abort();
        Ok(())
    }
}
