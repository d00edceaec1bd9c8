//! The browser-automation capability seam.
//!
//! Everything the control loop needs from a browser is the small set of
//! operations on [`Driver`]. The production implementation drives Chrome
//! through the `eoka` crate; tests implement the trait with a scripted fake so
//! the whole gated workflow runs without a browser.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::catalog::AmbiguityPolicy;
use crate::config::BrowserConfig;
use crate::{Error, Result};

/// A clickable element as reported by the page query, before the catalog
/// assigns indices and labels.
#[derive(Debug, Clone, Deserialize)]
pub struct RawClickable {
    pub selector: String,
    pub text: String,
    pub tag: String,
}

/// Opens a fresh driver handle. This is the `openOrAttach` capability: the
/// controller calls it once per login and owns the returned handle for the
/// rest of the run.
pub type DriverFactory<D> =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<D>> + Send>> + Send + Sync>;

/// Capability set consumed from the browser-automation driver.
///
/// All suspension points are bounded: callers pass navigation timeouts, and
/// implementations must not block indefinitely on any method.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Load a URL in the existing page, reusing cookies.
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()>;

    /// Enumerate visible clickable elements in document order, up to `cap`.
    async fn query_clickable(&self, cap: usize) -> Result<Vec<RawClickable>>;

    /// Re-resolve `selector` against the current page and click.
    ///
    /// Returns the number of elements the selector matched. Zero means no
    /// click was dispatched ("target not present yet", not a fault). Under
    /// [`AmbiguityPolicy::FirstMatch`] the first match is clicked whenever at
    /// least one exists; under [`AmbiguityPolicy::Strict`] nothing is clicked
    /// when more than one matches.
    async fn resolve_and_click(&self, selector: &str, policy: AmbiguityPolicy) -> Result<usize>;

    /// Capture a PNG of the current page.
    async fn capture_screenshot(&self) -> Result<Vec<u8>>;

    /// Opaque cookie/storage blob for the current page, if any.
    async fn storage_state(&self) -> Result<Option<String>>;

    /// Best-effort restore of a previously captured blob.
    async fn restore_storage_state(&self, blob: &str) -> Result<()>;

    /// Cheap probe: is the automation channel still usable?
    async fn is_connected(&self) -> bool;

    /// Current page URL, used to report login progress.
    async fn current_url(&self) -> Result<String>;

    /// Release the browser. Must be safe to call more than once.
    async fn close(&mut self) -> Result<()>;
}

/// Enumerates clickable elements the way the tee-sheet scanner needs them:
/// buttons, links, and button-shaped inputs, visible only, with a selector
/// that survives a reload. Returns a JSON array string.
const SCAN_JS: &str = r#"
(() => {
    const QUERY = 'button, a, input[type="submit"], input[type="button"], [role="button"]';
    const results = [];
    const seen = new Set();

    for (const el of document.querySelectorAll(QUERY)) {
        if (results.length >= __grabit_cap) break;

        const style = getComputedStyle(el);
        if (style.display === 'none' || style.visibility === 'hidden') continue;
        if (el.offsetWidth === 0 && el.offsetHeight === 0) continue;

        let text = (el.innerText || el.value || '').trim().replace(/\s+/g, ' ');
        if (text.length > 80) text = text.substring(0, 80);

        let selector;
        if (el.id) {
            selector = '#' + CSS.escape(el.id);
        } else {
            const parts = [];
            let node = el;
            while (node && node !== document.body && parts.length < 5) {
                let s = node.tagName.toLowerCase();
                if (node.id) {
                    parts.unshift('#' + CSS.escape(node.id));
                    break;
                }
                const parent = node.parentElement;
                if (parent) {
                    const siblings = Array.from(parent.children).filter(c => c.tagName === node.tagName);
                    if (siblings.length > 1) {
                        s += ':nth-of-type(' + (siblings.indexOf(node) + 1) + ')';
                    }
                }
                parts.unshift(s);
                node = parent;
            }
            selector = parts.join(' > ');
        }

        if (seen.has(selector)) continue;
        seen.add(selector);

        results.push({ selector, text, tag: el.tagName.toLowerCase() });
    }

    return JSON.stringify(results);
})()
"#;

/// Clicks the selector's first match (or refuses under strict ambiguity) and
/// reports how many elements matched.
const CLICK_JS: &str = r#"
(() => {
    const matches = document.querySelectorAll(__grabit_selector);
    if (matches.length === 0) return '0';
    if (__grabit_strict && matches.length > 1) return String(matches.length);
    matches[0].click();
    return String(matches.length);
})()
"#;

/// Production driver backed by the `eoka` crate.
pub struct EokaDriver {
    browser: Option<eoka::Browser>,
    page: Option<eoka::Page>,
}

impl EokaDriver {
    /// Launch Chrome with the given browser config.
    pub async fn launch(config: &BrowserConfig) -> Result<Self> {
        let stealth = eoka::StealthConfig {
            headless: config.headless,
            proxy: config.proxy.clone(),
            user_agent: config.user_agent.clone(),
            viewport_width: config.viewport.as_ref().map(|v| v.width).unwrap_or(1280),
            viewport_height: config.viewport.as_ref().map(|v| v.height).unwrap_or(720),
            ..Default::default()
        };

        debug!("launching browser (headless: {})", config.headless);
        let browser = eoka::Browser::launch_with_config(stealth)
            .await
            .map_err(|e| Error::DriverUnavailable(e.to_string()))?;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| Error::DriverUnavailable(e.to_string()))?;

        Ok(Self {
            browser: Some(browser),
            page: Some(page),
        })
    }

    /// Factory handed to the controller; captures the browser config.
    pub fn factory(config: BrowserConfig) -> DriverFactory<Self> {
        Arc::new(move || {
            let config = config.clone();
            Box::pin(async move { EokaDriver::launch(&config).await })
        })
    }

    fn page(&self) -> Result<&eoka::Page> {
        self.page.as_ref().ok_or(Error::SessionLost)
    }
}

fn nav_error(e: eoka::Error) -> Error {
    let msg = e.to_string();
    if msg.to_lowercase().contains("timeout") {
        Error::NavigationTimeout(msg)
    } else {
        Error::Navigation(msg)
    }
}

#[async_trait]
impl Driver for EokaDriver {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()> {
        let page = self.page()?;
        match tokio::time::timeout(timeout, page.goto(url)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(nav_error(e)),
            Err(_) => Err(Error::NavigationTimeout(format!(
                "{} did not load within {}s",
                url,
                timeout.as_secs()
            ))),
        }
    }

    async fn query_clickable(&self, cap: usize) -> Result<Vec<RawClickable>> {
        let page = self.page()?;
        let js = format!("var __grabit_cap = {cap}; {SCAN_JS}");
        let json_str: String = page.evaluate(&js).await.map_err(|e| Error::Driver(e.to_string()))?;
        let raw: Vec<RawClickable> = serde_json::from_str(&json_str)
            .map_err(|e| Error::Driver(format!("scan parse error: {e}")))?;
        Ok(raw)
    }

    async fn resolve_and_click(&self, selector: &str, policy: AmbiguityPolicy) -> Result<usize> {
        let page = self.page()?;
        let sel = serde_json::to_string(selector)
            .map_err(|e| Error::Driver(format!("selector encode error: {e}")))?;
        let strict = matches!(policy, AmbiguityPolicy::Strict);
        let js = format!("var __grabit_selector = {sel}; var __grabit_strict = {strict}; {CLICK_JS}");
        let count_str: String = page.evaluate(&js).await.map_err(|e| Error::Driver(e.to_string()))?;
        count_str
            .parse()
            .map_err(|e| Error::Driver(format!("click count parse error: {e}")))
    }

    async fn capture_screenshot(&self) -> Result<Vec<u8>> {
        let page = self.page()?;
        page.screenshot().await.map_err(|e| Error::Driver(e.to_string()))
    }

    async fn storage_state(&self) -> Result<Option<String>> {
        let page = self.page()?;
        let cookies: String = page
            .evaluate("document.cookie")
            .await
            .map_err(|e| Error::Driver(e.to_string()))?;
        Ok(if cookies.is_empty() { None } else { Some(cookies) })
    }

    async fn restore_storage_state(&self, blob: &str) -> Result<()> {
        let page = self.page()?;
        let encoded = serde_json::to_string(blob)
            .map_err(|e| Error::Driver(format!("state encode error: {e}")))?;
        // Cookie restore only works once the page is on the target origin.
        let js = format!(
            "for (const c of {encoded}.split('; ')) {{ if (c) document.cookie = c; }}"
        );
        page.execute(&js).await.map_err(|e| Error::Driver(e.to_string()))
    }

    async fn is_connected(&self) -> bool {
        match self.page.as_ref() {
            Some(page) => page.evaluate::<bool>("true").await.is_ok(),
            None => false,
        }
    }

    async fn current_url(&self) -> Result<String> {
        let page = self.page()?;
        page.url().await.map_err(|e| Error::Driver(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.page = None;
        if let Some(browser) = self.browser.take() {
            browser.close().await.map_err(|e| Error::Driver(e.to_string()))?;
        }
        Ok(())
    }
}
