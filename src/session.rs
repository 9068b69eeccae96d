//! Browser session management using chromiumoxide.

use anyhow::{bail, Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetTimezoneOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::{CollectConfig, SiteProfile};
use crate::error::CollectError;

/// Find the Chromium binary path.
pub fn find_chromium() -> Option<PathBuf> {
    // 1. BAZAAR_CHROMIUM_PATH env
    if let Ok(p) = std::env::var("BAZAAR_CHROMIUM_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. ~/.bazaar/chromium/
    if let Some(home) = dirs::home_dir() {
        let candidates = if cfg!(target_os = "macos") {
            vec![
                home.join(".bazaar/chromium/chrome-mac-arm64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".bazaar/chromium/chrome-mac-x64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".bazaar/chromium/chrome"),
            ]
        } else {
            vec![
                home.join(".bazaar/chromium/chrome-linux64/chrome"),
                home.join(".bazaar/chromium/chrome"),
            ]
        };
        for c in candidates {
            if c.exists() {
                return Some(c);
            }
        }
    }

    // 3. System PATH
    for name in ["google-chrome", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    // 4. Common macOS locations
    if cfg!(target_os = "macos") {
        let common =
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

/// A live browser page plus the handler task keeping it alive.
pub struct Session {
    browser: Browser,
    page: Page,
    handler_task: tokio::task::JoinHandle<()>,
}

impl Session {
    /// Launch Chromium and open a blank page with the site's identity
    /// overrides (user agent, accept-language, timezone) applied.
    pub async fn launch(config: &CollectConfig) -> Result<Self> {
        let chrome_path = find_chromium().ok_or(CollectError::ChromiumNotFound)?;

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .window_size(1366, 800)
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .arg("--lang=ru-RU");
        if !config.headful {
            builder = builder.arg("--headless=new");
        } else {
            builder = builder.with_head();
        }
        if let Some(proxy) = &config.proxy {
            builder = builder.arg(format!("--proxy-server={proxy}"));
        }
        let browser_config = builder
            .build()
            .map_err(|e| CollectError::Launch(e.to_string()))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .context("failed to launch Chromium")?;

        // Spawn the handler task
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .context("failed to create page")?;

        let site = &config.site;
        page.execute(
            SetUserAgentOverrideParams::builder()
                .user_agent(site.user_agent.clone())
                .accept_language(site.accept_language.clone())
                .build()
                .map_err(|e| anyhow::anyhow!("user agent params: {e}"))?,
        )
        .await
        .context("setting user agent override")?;
        page.execute(SetTimezoneOverrideParams::new(site.timezone.clone()))
            .await
            .context("setting timezone override")?;

        Ok(Self {
            browser,
            page,
            handler_task,
        })
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Navigate and wait for the load event, bounded by `timeout_ms`.
    pub async fn navigate(&self, url: &str, timeout_ms: u64) -> Result<()> {
        debug!(url, "navigating");
        let result = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.page.goto(url),
        )
        .await;
        match result {
            Ok(Ok(_)) => {
                let _ = self.page.wait_for_navigation().await;
                Ok(())
            }
            Ok(Err(e)) => bail!("navigation to {url} failed: {e}"),
            Err(_) => bail!("navigation to {url} timed out after {timeout_ms}ms"),
        }
    }

    /// Evaluate a script and deserialize its completion value.
    pub async fn execute_js<T: serde::de::DeserializeOwned>(&self, script: &str) -> Result<T> {
        let result = self
            .page
            .evaluate(script)
            .await
            .context("JS execution failed")?;
        result
            .into_value()
            .map_err(|e| anyhow::anyhow!("failed to convert JS result: {e:?}"))
    }

    /// Click cookie banners and city-selection prompts out of the way.
    /// Best-effort: a prompt that never appears is not an error.
    pub async fn dismiss_overlays(&self, site: &SiteProfile) {
        for selector in &site.dismiss_selectors {
            let script = format!(
                "(() => {{ const el = document.querySelector({sel}); \
                 if (el) {{ el.click(); return true; }} return false; }})()",
                sel = js_string(selector)
            );
            match self.execute_js::<bool>(&script).await {
                Ok(true) => debug!(selector, "dismissed overlay"),
                Ok(false) => {}
                Err(e) => warn!(selector, error = %e, "overlay dismiss failed"),
            }
        }
        if !site.dismiss_keywords.is_empty() {
            if let Ok(true) = self.click_by_text(&site.dismiss_keywords).await {
                debug!("dismissed overlay by text");
            }
        }
    }

    /// Number of listing cards currently in the DOM, using the first
    /// selector in the ladder that matches anything.
    pub async fn card_count(&self, site: &SiteProfile) -> Result<usize> {
        let script = format!(
            "(() => {{ for (const sel of {sels}) {{ \
             const n = document.querySelectorAll(sel).length; \
             if (n > 0) return n; }} return 0; }})()",
            sels = js_string_array(&site.card_selectors)
        );
        let n: u64 = self.execute_js(&script).await?;
        Ok(n as usize)
    }

    /// Wait until any card selector matches. A page that never renders a
    /// single card is fatal: nothing downstream can work without markup.
    pub async fn wait_any_cards(&self, site: &SiteProfile, timeout_ms: u64) -> Result<usize> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut round = 0u32;
        loop {
            let n = self.card_count(site).await.unwrap_or(0);
            if n > 0 {
                return Ok(n);
            }
            // Lazy listings sometimes need a nudge (or an overlay out of
            // the way) before the first card attaches.
            round += 1;
            if round % 4 == 0 {
                let _ = self.scroll_to_bottom().await;
                self.dismiss_overlays(site).await;
            }
            if Instant::now() >= deadline {
                let url = self
                    .page
                    .url()
                    .await
                    .ok()
                    .flatten()
                    .map(|u| u.to_string())
                    .unwrap_or_default();
                return Err(CollectError::NoListingRendered { url, timeout_ms }.into());
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Identity snapshot of the rendered cards: product ids where the
    /// markup carries them, hrefs otherwise. An in-place page flip keeps
    /// the card count but swaps identities, so progress detection compares
    /// these sets rather than counts.
    pub async fn visible_identities(&self, site: &SiteProfile) -> Result<Vec<String>> {
        let script = format!(
            "(() => {{ const out = []; for (const sel of {sels}) {{ \
             const els = document.querySelectorAll(sel); \
             if (els.length === 0) continue; \
             for (const el of els) {{ \
             const id = el.getAttribute('data-product-id'); \
             if (id) {{ out.push(id); continue; }} \
             const a = el.closest('a[href]') || el.querySelector('a[href]'); \
             if (a) out.push(a.getAttribute('href')); }} \
             return out; }} return out; }})()",
            sels = js_string_array(&site.card_selectors)
        );
        self.execute_js(&script).await
    }

    /// Wait until the visible-identity set differs from `prev`. Returns the
    /// new snapshot, or `None` on timeout.
    pub async fn wait_identities_changed(
        &self,
        site: &SiteProfile,
        prev: &[String],
        timeout_ms: u64,
    ) -> Option<Vec<String>> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        while Instant::now() < deadline {
            if let Ok(now) = self.visible_identities(site).await {
                if identities_changed(prev, &now) {
                    return Some(now);
                }
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        None
    }

    /// Scroll to the document bottom.
    pub async fn scroll_to_bottom(&self) -> Result<()> {
        self.execute_js::<serde_json::Value>(
            "(() => { window.scrollTo(0, document.body.scrollHeight); return null; })()",
        )
        .await?;
        Ok(())
    }

    /// Click the first visible element matching `selector`, returning
    /// whether anything was clicked.
    pub async fn click_selector(&self, selector: &str) -> Result<bool> {
        let script = format!(
            "(() => {{ for (const el of document.querySelectorAll({sel})) {{ \
             const r = el.getBoundingClientRect(); \
             if (r.width > 0 && r.height > 0 && !el.disabled) {{ \
             el.scrollIntoView({{block: 'center'}}); el.click(); return true; }} }} \
             return false; }})()",
            sel = js_string(selector)
        );
        self.execute_js(&script).await
    }

    /// Click the first visible link or button whose text contains one of
    /// `keywords` (case-insensitive).
    pub async fn click_by_text(&self, keywords: &[String]) -> Result<bool> {
        let script = format!(
            "(() => {{ const kws = {kws}.map(k => k.toLowerCase()); \
             for (const el of document.querySelectorAll('a, button')) {{ \
             const t = (el.textContent || '').trim().toLowerCase(); \
             if (!t) continue; \
             if (kws.some(k => t.includes(k))) {{ \
             const r = el.getBoundingClientRect(); \
             if (r.width > 0 && r.height > 0) {{ \
             el.scrollIntoView({{block: 'center'}}); el.click(); return true; }} }} }} \
             return false; }})()",
            kws = js_string_array(keywords)
        );
        self.execute_js(&script).await
    }

    /// Current page URL.
    pub async fn current_url(&self) -> Result<String> {
        Ok(self
            .page
            .url()
            .await
            .context("failed to get URL")?
            .map(|u| u.to_string())
            .unwrap_or_default())
    }

    pub async fn close(mut self) -> Result<()> {
        let _ = self.page.close().await;
        let _ = self.browser.close().await;
        self.handler_task.abort();
        Ok(())
    }
}

/// Whether `now` holds any identity absent from `prev`, or a different
/// number of them. A reshuffle of the same set is not progress.
pub fn identities_changed(prev: &[String], now: &[String]) -> bool {
    if prev.len() != now.len() {
        return true;
    }
    let prev_set: std::collections::HashSet<&str> = prev.iter().map(String::as_str).collect();
    now.iter().any(|id| !prev_set.contains(id.as_str()))
}

/// Quote a string as a JS literal.
pub fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// Quote a string slice as a JS array literal.
pub fn js_string_array(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn identity_change_sees_equal_count_page_flips() {
        let p1 = ids(&["101", "102"]);
        let p2 = ids(&["103", "104"]);
        assert!(identities_changed(&p1, &p2));
        assert!(identities_changed(&p1, &ids(&["101", "102", "103"])));
    }

    #[test]
    fn identity_change_ignores_reorder() {
        let before = ids(&["101", "102"]);
        assert!(!identities_changed(&before, &ids(&["102", "101"])));
        assert!(!identities_changed(&before, &before));
    }

    #[test]
    fn js_quoting_escapes() {
        assert_eq!(js_string("a\"b"), r#""a\"b""#);
        assert_eq!(
            js_string_array(&["a".to_string(), "b'c".to_string()]),
            r#"["a","b'c"]"#
        );
    }

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn launch_navigate_and_count_cards() {
        let config = CollectConfig::default();
        let session = Session::launch(&config).await.expect("launch failed");
        session
            .navigate(
                "data:text/html,<article data-product-id='1'>One</article>",
                10000,
            )
            .await
            .expect("navigation failed");
        let n = session
            .wait_any_cards(&config.site, 5000)
            .await
            .expect("cards never appeared");
        assert_eq!(n, 1);
        session.close().await.expect("close failed");
    }
}
