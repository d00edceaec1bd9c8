//! Scripted [`Driver`] implementation for tests.
//!
//! Kept in the library (hidden from docs) so both unit tests and the
//! integration suite can exercise the full gated workflow without a browser.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::catalog::AmbiguityPolicy;
use crate::driver::{Driver, DriverFactory, RawClickable};
use crate::{Error, Result};

/// One scripted response to `resolve_and_click`.
#[derive(Debug, Clone)]
pub enum ClickStep {
    /// The selector matched this many elements.
    Matches(usize),
    /// A transient driver failure.
    TransientError(String),
    /// The browser went away; every later call fails with `SessionLost`.
    Lost,
}

/// Behavior script consumed by [`ScriptedDriver`]. Tests can also mutate it
/// mid-run through [`ScriptedDriver::script`].
#[derive(Debug, Clone)]
pub struct Script {
    /// The next N navigations fail with a transient error.
    pub fail_navigations: usize,
    /// Per-call click outcomes; when exhausted, every click matches once.
    pub click_script: VecDeque<ClickStep>,
    /// Elements returned by `query_clickable`.
    pub clickable: Vec<RawClickable>,
    pub storage_state: Option<String>,
    pub current_url: String,
    /// Once true, the automation channel is gone.
    pub lost: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            fail_navigations: 0,
            click_script: VecDeque::new(),
            clickable: Vec::new(),
            storage_state: None,
            current_url: "about:blank".into(),
            lost: false,
        }
    }
}

impl Script {
    pub fn fail_next_navigations(mut self, n: usize) -> Self {
        self.fail_navigations = n;
        self
    }

    pub fn with_storage_state(mut self, blob: &str) -> Self {
        self.storage_state = Some(blob.into());
        self
    }

    pub fn with_current_url(mut self, url: &str) -> Self {
        self.current_url = url.into();
        self
    }

    pub fn with_clickables(mut self, clickable: Vec<RawClickable>) -> Self {
        self.clickable = clickable;
        self
    }

    pub fn with_click_script(mut self, steps: impl IntoIterator<Item = ClickStep>) -> Self {
        self.click_script = steps.into_iter().collect();
        self
    }
}

/// Convenience constructor for scan fixtures.
pub fn clickable(selector: &str, text: &str, tag: &str) -> RawClickable {
    RawClickable {
        selector: selector.into(),
        text: text.into(),
        tag: tag.into(),
    }
}

#[derive(Debug, Default)]
struct Recording {
    navigations: Vec<String>,
    clicks: Vec<String>,
    close_count: usize,
}

/// Shared-state scripted driver. Clones hand out the same script and
/// recording, so a test keeps a handle while the controller owns another.
#[derive(Debug, Clone)]
pub struct ScriptedDriver {
    script: Arc<Mutex<Script>>,
    recording: Arc<Mutex<Recording>>,
}

impl ScriptedDriver {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            recording: Arc::new(Mutex::new(Recording::default())),
        }
    }

    /// A factory that hands out clones sharing this driver's state.
    pub fn factory(&self) -> DriverFactory<Self> {
        let driver = self.clone();
        Arc::new(move || {
            let driver = driver.clone();
            Box::pin(async move { Ok(driver) })
        })
    }

    /// Mutate the script mid-test.
    pub fn script(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.script.lock().unwrap());
    }

    /// URLs navigated to, in order.
    pub fn navigations(&self) -> Vec<String> {
        self.recording.lock().unwrap().navigations.clone()
    }

    /// Selectors that received a dispatched click.
    pub fn clicks(&self) -> Vec<String> {
        self.recording.lock().unwrap().clicks.clone()
    }

    pub fn close_count(&self) -> usize {
        self.recording.lock().unwrap().close_count
    }

    fn check_lost(&self) -> Result<()> {
        if self.script.lock().unwrap().lost {
            Err(Error::SessionLost)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<()> {
        self.check_lost()?;
        self.recording.lock().unwrap().navigations.push(url.to_string());
        let mut script = self.script.lock().unwrap();
        if script.fail_navigations > 0 {
            script.fail_navigations -= 1;
            return Err(Error::Navigation("scripted navigation failure".into()));
        }
        Ok(())
    }

    async fn query_clickable(&self, cap: usize) -> Result<Vec<RawClickable>> {
        self.check_lost()?;
        let script = self.script.lock().unwrap();
        Ok(script.clickable.iter().take(cap).cloned().collect())
    }

    async fn resolve_and_click(&self, selector: &str, policy: AmbiguityPolicy) -> Result<usize> {
        self.check_lost()?;
        let step = {
            let mut script = self.script.lock().unwrap();
            script.click_script.pop_front().unwrap_or(ClickStep::Matches(1))
        };
        match step {
            ClickStep::Matches(n) => {
                let suppressed = matches!(policy, AmbiguityPolicy::Strict) && n > 1;
                if n > 0 && !suppressed {
                    self.recording.lock().unwrap().clicks.push(selector.to_string());
                }
                Ok(n)
            }
            ClickStep::TransientError(msg) => Err(Error::Driver(msg)),
            ClickStep::Lost => {
                self.script.lock().unwrap().lost = true;
                Err(Error::SessionLost)
            }
        }
    }

    async fn capture_screenshot(&self) -> Result<Vec<u8>> {
        self.check_lost()?;
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn storage_state(&self) -> Result<Option<String>> {
        self.check_lost()?;
        Ok(self.script.lock().unwrap().storage_state.clone())
    }

    async fn restore_storage_state(&self, blob: &str) -> Result<()> {
        self.check_lost()?;
        self.script.lock().unwrap().storage_state = Some(blob.to_string());
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        !self.script.lock().unwrap().lost
    }

    async fn current_url(&self) -> Result<String> {
        self.check_lost()?;
        Ok(self.script.lock().unwrap().current_url.clone())
    }

    async fn close(&mut self) -> Result<()> {
        self.recording.lock().unwrap().close_count += 1;
        Ok(())
    }
}
