//! The gated three-step controller: login, scan/select, auto-click.
//!
//! All operator commands and the loop task funnel through one controller. The
//! browser is guarded by an async mutex held for the whole of each operation;
//! a command arriving while another holds it fails fast with [`Error::Busy`]
//! instead of queueing. Workflow state lives behind short-lived std mutexes
//! that are never held across an await.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::catalog::{AmbiguityPolicy, ElementCatalog, Selection};
use crate::clicker::{self, LoopParams, LoopState, LoopTask};
use crate::config::RunConfig;
use crate::driver::{Driver, DriverFactory};
use crate::gate::{GateState, StepGate};
use crate::session::BrowserSession;
use crate::{Error, Result};

struct ControlState {
    gate: StepGate,
    catalog: ElementCatalog,
    selection: Option<Selection>,
    target_url: String,
    interval_secs: u64,
    /// Storage blob rescued from a lost session, restored on the next open.
    saved_storage: Option<String>,
}

/// Drives the whole workflow over one (optional) browser session.
pub struct Controller<D: Driver> {
    factory: DriverFactory<D>,
    session: Arc<AsyncMutex<Option<BrowserSession<D>>>>,
    control: Arc<StdMutex<ControlState>>,
    loop_state: Arc<StdMutex<LoopState>>,
    loop_task: StdMutex<Option<LoopTask>>,
    login_url: String,
    nav_timeout: Duration,
    scan_cap: usize,
    ambiguity: AmbiguityPolicy,
}

impl<D: Driver> Controller<D> {
    pub fn new(factory: DriverFactory<D>, config: &RunConfig) -> Self {
        Self {
            factory,
            session: Arc::new(AsyncMutex::new(None)),
            control: Arc::new(StdMutex::new(ControlState {
                gate: StepGate::new(),
                catalog: ElementCatalog::default(),
                selection: None,
                target_url: config.target_url.clone(),
                interval_secs: config.interval_secs,
                saved_storage: None,
            })),
            loop_state: Arc::new(StdMutex::new(LoopState {
                interval_secs: config.interval_secs,
                ..LoopState::default()
            })),
            loop_task: StdMutex::new(None),
            login_url: config.login_url.clone(),
            nav_timeout: Duration::from_secs(config.navigation_timeout_secs),
            scan_cap: config.scan_cap,
            ambiguity: config.ambiguity,
        }
    }

    /// Step 1: open (or reuse) a browser on the login page. Credential entry
    /// happens manually in that browser; success here only means the session
    /// is usable, which unlocks Step 2.
    pub async fn open_login(&self) -> Result<()> {
        let mut guard = self.session.try_lock().map_err(|_| Error::Busy)?;

        match guard.as_mut() {
            Some(session) if session.is_active() => {
                // Reuse the running browser; just bring the login page back.
                if let Err(e) = session.navigate(&self.login_url, self.nav_timeout).await {
                    warn!("login page reload failed ({e}); browser left open");
                }
            }
            _ => {
                let mut session =
                    BrowserSession::open(&self.factory, &self.login_url, self.nav_timeout).await?;
                let saved = self.control.lock().unwrap().saved_storage.take();
                if let Some(blob) = saved {
                    if let Err(e) = session.restore_storage_state(&blob).await {
                        debug!("storage restore failed: {e}");
                    }
                }
                *guard = Some(session);
            }
        }

        self.control.lock().unwrap().gate.mark_logged_in();
        Ok(())
    }

    /// Step 2a: navigate to the target page and enumerate its clickable
    /// elements. Replaces any previous catalog. An empty catalog is a valid
    /// outcome, not an error.
    pub async fn scan(&self) -> Result<ElementCatalog> {
        self.control.lock().unwrap().gate.require(GateState::Scanned)?;
        let target_url = self.control.lock().unwrap().target_url.clone();

        let mut guard = self.session.try_lock().map_err(|_| Error::Busy)?;
        let session = guard.as_mut().ok_or(Error::SessionLost)?;

        if let Err(e) = session.navigate(&target_url, self.nav_timeout).await {
            if matches!(e, Error::SessionLost) {
                self.lose_session(&mut guard).await;
            }
            return Err(e);
        }

        let raw = match session.driver()?.query_clickable(self.scan_cap).await {
            Ok(raw) => raw,
            Err(Error::SessionLost) => {
                self.lose_session(&mut guard).await;
                return Err(Error::SessionLost);
            }
            Err(e) => return Err(e),
        };

        let catalog = ElementCatalog::from_raw(raw);
        info!("scan found {} clickable element(s)", catalog.len());

        let mut control = self.control.lock().unwrap();
        control.catalog = catalog.clone();
        // A standing selection survives a re-scan; the gate stays armed.
        Ok(catalog)
    }

    /// Step 2b: pick one scanned element as the click target. Pure state
    /// change, no browser traffic. Unlocks Step 3.
    pub fn select(&self, index: usize) -> Result<Selection> {
        let mut control = self.control.lock().unwrap();
        control.gate.require(GateState::Scanned)?;
        let selection = control
            .catalog
            .selection(index)
            .ok_or(Error::UnknownElement(index))?;
        info!("armed on [{index}] \"{}\"", selection.label);
        control.selection = Some(selection.clone());
        control.gate.mark_armed();
        Ok(selection)
    }

    /// One manual click attempt against the armed selection. `Ok(false)` means
    /// the target is not on the page right now, which is not a fault.
    pub async fn test_click(&self) -> Result<bool> {
        let selection = {
            let control = self.control.lock().unwrap();
            control.gate.require(GateState::Armed)?;
            control.selection.clone().ok_or(Error::SessionLost)?
        };

        let mut guard = self.session.try_lock().map_err(|_| Error::Busy)?;
        let session = guard.as_mut().ok_or(Error::SessionLost)?;

        match session
            .driver()?
            .resolve_and_click(&selection.selector, self.ambiguity)
            .await
        {
            Ok(0) => Ok(false),
            Ok(n) if self.ambiguity == AmbiguityPolicy::Strict && n > 1 => {
                Err(Error::AmbiguousTarget(n))
            }
            Ok(_) => {
                info!("test click dispatched to \"{}\"", selection.label);
                Ok(true)
            }
            Err(Error::SessionLost) => {
                self.lose_session(&mut guard).await;
                Err(Error::SessionLost)
            }
            Err(e) => Err(e),
        }
    }

    /// Point later scans and loop runs at a different page. Applies to the
    /// next scan or enable.
    pub fn set_target_url(&self, url: &str) -> Result<()> {
        if url.is_empty() {
            return Err(Error::Config("target_url must not be empty".into()));
        }
        self.control.lock().unwrap().target_url = url.to_string();
        Ok(())
    }

    pub fn target_url(&self) -> String {
        self.control.lock().unwrap().target_url.clone()
    }

    /// Update the loop interval used by the next enable. Zero is rejected.
    pub fn set_interval(&self, secs: u64) -> Result<()> {
        if secs == 0 {
            return Err(Error::InvalidInterval(secs));
        }
        self.control.lock().unwrap().interval_secs = secs;
        Ok(())
    }

    /// Step 3: start the auto-click loop as an independent task. Fails with
    /// [`Error::AlreadyRunning`] when a run is in flight.
    pub fn enable_loop(&self) -> Result<()> {
        let (selection, interval_secs, target_url) = {
            let control = self.control.lock().unwrap();
            control.gate.require(GateState::Armed)?;
            let selection = control.selection.clone().ok_or(Error::SessionLost)?;
            (selection, control.interval_secs, control.target_url.clone())
        };

        let mut task_slot = self.loop_task.lock().unwrap();
        if let Some(task) = task_slot.as_ref() {
            if !task.handle.is_finished() {
                return Err(Error::AlreadyRunning);
            }
        }

        *self.loop_state.lock().unwrap() = LoopState {
            enabled: true,
            interval_secs,
            ..LoopState::default()
        };

        let control = self.control.clone();
        let params = LoopParams {
            session: self.session.clone(),
            state: self.loop_state.clone(),
            target_url,
            selector: selection.selector,
            label: selection.label,
            policy: self.ambiguity,
            interval: Duration::from_secs(interval_secs),
            nav_timeout: self.nav_timeout,
            on_session_lost: Box::new(move |saved| {
                let mut c = control.lock().unwrap();
                c.saved_storage = saved;
                c.gate.reset();
                c.catalog = ElementCatalog::default();
                c.selection = None;
            }),
        };
        *task_slot = Some(clicker::spawn(
            params,
            tokio_util::sync::CancellationToken::new(),
        ));
        Ok(())
    }

    /// Request a stop. Effective at the next tick boundary; an attempt already
    /// in flight runs to completion (and still wins if it clicks). Idempotent.
    pub fn disable_loop(&self) {
        if let Some(task) = self.loop_task.lock().unwrap().as_ref() {
            task.cancel.cancel();
        }
        self.loop_state.lock().unwrap().enabled = false;
    }

    /// Tear everything down: stop the loop, close the browser, re-lock the
    /// gate. Waits for an in-flight attempt to finish.
    pub async fn close(&self) {
        self.disable_loop();
        let mut guard = self.session.lock().await;
        if let Some(mut session) = guard.take() {
            session.close().await;
        }
        let mut control = self.control.lock().unwrap();
        control.gate.reset();
        control.catalog = ElementCatalog::default();
        control.selection = None;
    }

    pub fn gate_state(&self) -> GateState {
        self.control.lock().unwrap().gate.state()
    }

    pub fn loop_state(&self) -> LoopState {
        self.loop_state.lock().unwrap().clone()
    }

    pub fn catalog(&self) -> ElementCatalog {
        self.control.lock().unwrap().catalog.clone()
    }

    pub fn selection(&self) -> Option<Selection> {
        self.control.lock().unwrap().selection.clone()
    }

    pub fn interval_secs(&self) -> u64 {
        self.control.lock().unwrap().interval_secs
    }

    /// Seconds until the next loop tick, or `None` when the loop is idle.
    pub fn seconds_until_next_tick(&self) -> Option<u64> {
        clicker::seconds_until_next_tick(&self.loop_state(), chrono::Utc::now())
    }

    /// Whether the browser has navigated away from the login page. Purely
    /// informational progress signal; never gates anything.
    pub async fn left_login_page(&self) -> bool {
        match self.session.try_lock() {
            Ok(guard) => match guard.as_ref() {
                Some(session) => session.left_login_page().await,
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Wait for the current loop run to finish. Used by the CLI runner.
    pub async fn wait_for_loop(&self) {
        let handle = self.loop_task.lock().unwrap().take();
        if let Some(task) = handle {
            if let Err(e) = task.handle.await {
                warn!("loop task panicked: {e}");
            }
        }
    }

    async fn lose_session(
        &self,
        guard: &mut tokio::sync::MutexGuard<'_, Option<BrowserSession<D>>>,
    ) {
        let mut saved = None;
        if let Some(mut dead) = guard.take() {
            saved = dead.storage_state();
            dead.close().await;
        }
        let mut control = self.control.lock().unwrap();
        control.saved_storage = saved;
        control.gate.reset();
        control.catalog = ElementCatalog::default();
        control.selection = None;
        warn!("session lost; workflow re-locked at step 1");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clicker::LoopOutcome;
    use crate::testkit::{clickable, ClickStep, Script, ScriptedDriver};

    fn config() -> RunConfig {
        RunConfig::parse(
            r#"
login_url: "https://club.example/login"
target_url: "https://club.example/tee-sheet"
interval_secs: 5
"#,
        )
        .unwrap()
    }

    fn booking_script() -> Script {
        Script::default().with_clickables(vec![
            clickable("#book-1", "Book 07:00", "button"),
            clickable("#book-2", "Book 07:30", "button"),
        ])
    }

    #[tokio::test]
    async fn test_steps_are_locked_until_login() {
        let driver = ScriptedDriver::new(booking_script());
        let ctl = Controller::new(driver.factory(), &config());

        assert_eq!(ctl.gate_state(), GateState::LoggedOut);
        assert!(matches!(
            ctl.scan().await.unwrap_err(),
            Error::GateNotSatisfied { .. }
        ));
        assert!(matches!(
            ctl.select(0).unwrap_err(),
            Error::GateNotSatisfied { .. }
        ));
        assert!(matches!(
            ctl.enable_loop().unwrap_err(),
            Error::GateNotSatisfied { .. }
        ));
        // Nothing reached the browser.
        assert!(driver.navigations().is_empty());
    }

    #[tokio::test]
    async fn test_full_progression_to_armed() {
        let driver = ScriptedDriver::new(booking_script());
        let ctl = Controller::new(driver.factory(), &config());

        ctl.open_login().await.unwrap();
        assert_eq!(ctl.gate_state(), GateState::Scanned);

        let catalog = ctl.scan().await.unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(
            driver.navigations(),
            vec![
                "https://club.example/login".to_string(),
                "https://club.example/tee-sheet".to_string(),
            ]
        );

        let selection = ctl.select(1).unwrap();
        assert_eq!(selection.selector, "#book-2");
        assert_eq!(ctl.gate_state(), GateState::Armed);
    }

    #[tokio::test]
    async fn test_select_unknown_index() {
        let driver = ScriptedDriver::new(booking_script());
        let ctl = Controller::new(driver.factory(), &config());
        ctl.open_login().await.unwrap();
        ctl.scan().await.unwrap();

        assert!(matches!(ctl.select(9).unwrap_err(), Error::UnknownElement(9)));
        assert_eq!(ctl.gate_state(), GateState::Scanned, "bad select arms nothing");
    }

    #[tokio::test]
    async fn test_selection_survives_rescan() {
        let driver = ScriptedDriver::new(booking_script());
        let ctl = Controller::new(driver.factory(), &config());
        ctl.open_login().await.unwrap();
        ctl.scan().await.unwrap();
        ctl.select(0).unwrap();

        ctl.scan().await.unwrap();
        assert_eq!(ctl.gate_state(), GateState::Armed);
        assert_eq!(ctl.selection().unwrap().selector, "#book-1");
    }

    #[tokio::test]
    async fn test_test_click_reports_presence() {
        let driver = ScriptedDriver::new(
            booking_script().with_click_script([ClickStep::Matches(0), ClickStep::Matches(1)]),
        );
        let ctl = Controller::new(driver.factory(), &config());
        ctl.open_login().await.unwrap();
        ctl.scan().await.unwrap();
        ctl.select(0).unwrap();

        assert!(!ctl.test_click().await.unwrap());
        assert!(ctl.test_click().await.unwrap());
        assert_eq!(driver.clicks(), vec!["#book-1".to_string()]);
    }

    #[tokio::test]
    async fn test_busy_when_browser_is_held() {
        let driver = ScriptedDriver::new(booking_script());
        let ctl = Controller::new(driver.factory(), &config());
        ctl.open_login().await.unwrap();

        let _held = ctl.session.lock().await;
        assert!(matches!(ctl.scan().await.unwrap_err(), Error::Busy));
        assert!(matches!(ctl.open_login().await.unwrap_err(), Error::Busy));
    }

    #[tokio::test]
    async fn test_set_interval_validation() {
        let driver = ScriptedDriver::new(booking_script());
        let ctl = Controller::new(driver.factory(), &config());

        assert!(matches!(
            ctl.set_interval(0).unwrap_err(),
            Error::InvalidInterval(0)
        ));
        ctl.set_interval(12).unwrap();
        assert_eq!(ctl.interval_secs(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_twice_is_already_running() {
        let steps: Vec<ClickStep> = (0..100).map(|_| ClickStep::Matches(0)).collect();
        let driver = ScriptedDriver::new(booking_script().with_click_script(steps));
        let ctl = Controller::new(driver.factory(), &config());
        ctl.open_login().await.unwrap();
        ctl.scan().await.unwrap();
        ctl.select(0).unwrap();

        ctl.enable_loop().unwrap();
        assert!(matches!(ctl.enable_loop().unwrap_err(), Error::AlreadyRunning));

        ctl.disable_loop();
        ctl.wait_for_loop().await;
        assert_eq!(ctl.loop_state().outcome, LoopOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_clicks_and_can_be_re_enabled() {
        let driver = ScriptedDriver::new(booking_script().with_click_script([
            ClickStep::Matches(0),
            ClickStep::Matches(1),
            ClickStep::Matches(1),
        ]));
        let ctl = Controller::new(driver.factory(), &config());
        ctl.open_login().await.unwrap();
        ctl.scan().await.unwrap();
        ctl.select(0).unwrap();

        ctl.enable_loop().unwrap();
        ctl.wait_for_loop().await;
        assert_eq!(ctl.loop_state().outcome, LoopOutcome::Clicked);
        assert_eq!(ctl.loop_state().attempt_count, 2);

        // A finished run does not block a fresh one.
        ctl.enable_loop().unwrap();
        ctl.wait_for_loop().await;
        assert_eq!(ctl.loop_state().outcome, LoopOutcome::Clicked);
        assert_eq!(ctl.loop_state().attempt_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_lost_in_loop_relocks_workflow() {
        let driver = ScriptedDriver::new(
            booking_script().with_click_script([ClickStep::Matches(0), ClickStep::Lost]),
        );
        let ctl = Controller::new(driver.factory(), &config());
        ctl.open_login().await.unwrap();
        ctl.scan().await.unwrap();
        ctl.select(0).unwrap();

        ctl.enable_loop().unwrap();
        ctl.wait_for_loop().await;

        assert_eq!(ctl.loop_state().outcome, LoopOutcome::Failed);
        assert_eq!(ctl.gate_state(), GateState::LoggedOut);
        assert!(ctl.selection().is_none());
        assert!(ctl.catalog().is_empty());
        assert!(matches!(
            ctl.scan().await.unwrap_err(),
            Error::GateNotSatisfied { .. }
        ));
    }

    #[tokio::test]
    async fn test_scan_session_lost_resets_gate() {
        let driver = ScriptedDriver::new(booking_script());
        let ctl = Controller::new(driver.factory(), &config());
        ctl.open_login().await.unwrap();

        driver.script(|s| s.lost = true);
        assert!(matches!(ctl.scan().await.unwrap_err(), Error::SessionLost));
        assert_eq!(ctl.gate_state(), GateState::LoggedOut);
    }

    #[tokio::test]
    async fn test_set_target_url_applies_to_next_scan() {
        let driver = ScriptedDriver::new(booking_script());
        let ctl = Controller::new(driver.factory(), &config());
        ctl.open_login().await.unwrap();

        ctl.set_target_url("https://club.example/tee-sheet/1/2026/09/06")
            .unwrap();
        ctl.scan().await.unwrap();
        assert_eq!(
            driver.navigations().last().map(String::as_str),
            Some("https://club.example/tee-sheet/1/2026/09/06")
        );

        assert!(ctl.set_target_url("").is_err());
    }

    #[tokio::test]
    async fn test_storage_rescued_from_lost_session_is_restored() {
        let driver = ScriptedDriver::new(
            booking_script().with_storage_state("sid=abc"),
        );
        let ctl = Controller::new(driver.factory(), &config());
        ctl.open_login().await.unwrap();
        ctl.scan().await.unwrap();

        driver.script(|s| s.lost = true);
        assert!(matches!(ctl.scan().await.unwrap_err(), Error::SessionLost));

        // The replacement browser starts without the cookie; reopening pushes
        // the rescued blob back in.
        driver.script(|s| {
            s.lost = false;
            s.storage_state = None;
        });
        ctl.open_login().await.unwrap();

        let mut restored = None;
        driver.script(|s| restored = s.storage_state.clone());
        assert_eq!(restored.as_deref(), Some("sid=abc"));
    }

    #[tokio::test]
    async fn test_close_relocks_and_releases_browser() {
        let driver = ScriptedDriver::new(booking_script());
        let ctl = Controller::new(driver.factory(), &config());
        ctl.open_login().await.unwrap();
        ctl.scan().await.unwrap();
        ctl.select(0).unwrap();

        ctl.close().await;
        assert_eq!(ctl.gate_state(), GateState::LoggedOut);
        assert!(ctl.selection().is_none());
        assert_eq!(driver.close_count(), 1);

        // Close is idempotent.
        ctl.close().await;
        assert_eq!(driver.close_count(), 1);
    }
}
