//! The self-paced auto-click loop (Step 3).
//!
//! One attempt per tick: reload the target page, re-resolve the armed
//! selector, click if present, sleep for the configured interval, repeat.
//! Transient failures are absorbed and retried; only a lost session halts the
//! loop with a failure. A dispatched click is terminal.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::AmbiguityPolicy;
use crate::driver::Driver;
use crate::session::BrowserSession;
use crate::Error;

/// PNG capture taken right after a successful click, as release evidence.
#[derive(Clone)]
pub struct Screenshot {
    pub taken_at: DateTime<Utc>,
    pub png: Vec<u8>,
}

impl std::fmt::Debug for Screenshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Screenshot")
            .field("taken_at", &self.taken_at)
            .field("png_bytes", &self.png.len())
            .finish()
    }
}

/// How a loop run ended (or that it has not ended yet).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Still ticking, or never started.
    Pending,
    /// A click was dispatched to the target. Terminal success.
    Clicked,
    /// The operator disabled the loop before any click landed.
    Stopped,
    /// The session was lost mid-run.
    Failed,
}

impl LoopOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopOutcome::Pending => "pending",
            LoopOutcome::Clicked => "clicked",
            LoopOutcome::Stopped => "stopped",
            LoopOutcome::Failed => "failed",
        }
    }
}

/// Observable state of the loop, readable at any time without blocking on the
/// browser.
#[derive(Debug, Clone)]
pub struct LoopState {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Completed ticks in the current run, the successful one included.
    pub attempt_count: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    /// Message from the most recent absorbed failure, cleared on a clean tick.
    pub last_error: Option<String>,
    pub last_screenshot: Option<Screenshot>,
    pub outcome: LoopOutcome,
}

impl Default for LoopState {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 30,
            attempt_count: 0,
            last_attempt: None,
            last_error: None,
            last_screenshot: None,
            outcome: LoopOutcome::Pending,
        }
    }
}

/// Seconds until the next tick is due. `None` when the loop is not running.
pub fn seconds_until_next_tick(state: &LoopState, now: DateTime<Utc>) -> Option<u64> {
    if !state.enabled {
        return None;
    }
    let last = match state.last_attempt {
        Some(t) => t,
        None => return Some(0),
    };
    let due = last + chrono::Duration::seconds(state.interval_secs as i64);
    let remaining = (due - now).num_seconds();
    Some(remaining.max(0) as u64)
}

/// Handle to a spawned loop run.
pub(crate) struct LoopTask {
    pub cancel: CancellationToken,
    pub handle: JoinHandle<()>,
}

/// Everything one loop run needs, snapshotted at enable time.
pub(crate) struct LoopParams<D: Driver> {
    pub session: Arc<AsyncMutex<Option<BrowserSession<D>>>>,
    pub state: Arc<StdMutex<LoopState>>,
    pub target_url: String,
    pub selector: String,
    pub label: String,
    pub policy: AmbiguityPolicy,
    pub interval: Duration,
    pub nav_timeout: Duration,
    /// Controller hook that re-locks the step gate and drops scan state. The
    /// argument is the dead session's last storage blob, for a faster
    /// re-login.
    pub on_session_lost: Box<dyn FnOnce(Option<String>) + Send>,
}

enum Tick {
    /// No click happened; keep going.
    Missed,
    Clicked(Option<Vec<u8>>),
    Lost,
}

/// Spawn the loop as an independent task. The first attempt runs immediately;
/// each later attempt is paced from the end of the previous one. Cancellation
/// is honored only at tick boundaries.
pub(crate) fn spawn<D: Driver>(params: LoopParams<D>, cancel: CancellationToken) -> LoopTask {
    let token = cancel.clone();
    let handle = tokio::spawn(run(params, token));
    LoopTask { cancel, handle }
}

async fn run<D: Driver>(params: LoopParams<D>, cancel: CancellationToken) {
    let LoopParams {
        session,
        state,
        target_url,
        selector,
        label,
        policy,
        interval,
        nav_timeout,
        on_session_lost,
    } = params;

    info!("auto-click loop started for \"{label}\" every {}s", interval.as_secs());

    loop {
        if cancel.is_cancelled() {
            finish_stopped(&state);
            return;
        }

        let tick = attempt(&session, &state, &target_url, &selector, policy, nav_timeout).await;
        {
            let mut s = state.lock().unwrap();
            s.attempt_count += 1;
            s.last_attempt = Some(Utc::now());
        }

        match tick {
            Tick::Missed => {}
            Tick::Clicked(png) => {
                let mut s = state.lock().unwrap();
                s.outcome = LoopOutcome::Clicked;
                s.enabled = false;
                s.last_error = None;
                s.last_screenshot = png.map(|png| Screenshot {
                    taken_at: Utc::now(),
                    png,
                });
                info!("target clicked after {} attempt(s)", s.attempt_count);
                return;
            }
            Tick::Lost => {
                // Drop the dead session before re-locking the gate.
                let mut saved = None;
                if let Some(mut dead) = session.lock().await.take() {
                    saved = dead.storage_state();
                    dead.close().await;
                }
                on_session_lost(saved);
                let mut s = state.lock().unwrap();
                s.outcome = LoopOutcome::Failed;
                s.enabled = false;
                warn!("auto-click loop failed: session lost");
                return;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                finish_stopped(&state);
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

fn finish_stopped(state: &StdMutex<LoopState>) {
    let mut s = state.lock().unwrap();
    s.enabled = false;
    if s.outcome == LoopOutcome::Pending {
        s.outcome = LoopOutcome::Stopped;
        info!("auto-click loop stopped after {} attempt(s)", s.attempt_count);
    }
}

/// One tick: reload the target page, then try the click. Holds the session
/// lock for the duration, so operator commands arriving mid-attempt see
/// `Busy` rather than queueing.
async fn attempt<D: Driver>(
    session: &AsyncMutex<Option<BrowserSession<D>>>,
    state: &StdMutex<LoopState>,
    target_url: &str,
    selector: &str,
    policy: AmbiguityPolicy,
    nav_timeout: Duration,
) -> Tick {
    let mut guard = session.lock().await;
    let Some(sess) = guard.as_mut() else {
        return Tick::Lost;
    };

    match sess.navigate(target_url, nav_timeout).await {
        Ok(()) => {}
        Err(Error::SessionLost) => return Tick::Lost,
        Err(e) => {
            // A failed reload ends the tick; the next one retries.
            debug!("reload failed, retrying next tick: {e}");
            state.lock().unwrap().last_error = Some(e.to_string());
            return Tick::Missed;
        }
    }

    let driver = match sess.driver() {
        Ok(d) => d,
        Err(_) => return Tick::Lost,
    };

    match driver.resolve_and_click(selector, policy).await {
        Ok(0) => {
            debug!("target not present yet");
            state.lock().unwrap().last_error = None;
            Tick::Missed
        }
        Ok(n) if policy == AmbiguityPolicy::Strict && n > 1 => {
            let msg = Error::AmbiguousTarget(n).to_string();
            debug!("{msg}");
            state.lock().unwrap().last_error = Some(msg);
            Tick::Missed
        }
        Ok(_) => {
            let png = match driver.capture_screenshot().await {
                Ok(png) => Some(png),
                Err(e) => {
                    debug!("screenshot after click failed: {e}");
                    None
                }
            };
            Tick::Clicked(png)
        }
        Err(Error::SessionLost) => Tick::Lost,
        Err(e) => {
            // Anything short of a lost session is absorbed and retried.
            debug!("attempt failed, retrying next tick: {e}");
            state.lock().unwrap().last_error = Some(e.to_string());
            Tick::Missed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{ClickStep, Script, ScriptedDriver};
    use std::sync::atomic::{AtomicBool, Ordering};

    const TIMEOUT: Duration = Duration::from_secs(30);

    async fn session_for(
        driver: &ScriptedDriver,
    ) -> Arc<AsyncMutex<Option<BrowserSession<ScriptedDriver>>>> {
        let session = BrowserSession::open(&driver.factory(), "https://club.example/login", TIMEOUT)
            .await
            .unwrap();
        Arc::new(AsyncMutex::new(Some(session)))
    }

    fn params(
        session: Arc<AsyncMutex<Option<BrowserSession<ScriptedDriver>>>>,
        state: Arc<StdMutex<LoopState>>,
        interval: Duration,
    ) -> LoopParams<ScriptedDriver> {
        LoopParams {
            session,
            state,
            target_url: "https://club.example/tee-sheet".into(),
            selector: "#book-1".into(),
            label: "Book 07:00".into(),
            policy: AmbiguityPolicy::FirstMatch,
            interval,
            nav_timeout: TIMEOUT,
            on_session_lost: Box::new(|_| {}),
        }
    }

    fn enabled_state(interval_secs: u64) -> Arc<StdMutex<LoopState>> {
        Arc::new(StdMutex::new(LoopState {
            enabled: true,
            interval_secs,
            ..LoopState::default()
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_clicks_on_first_tick_when_target_present() {
        let driver = ScriptedDriver::new(
            Script::default().with_click_script([ClickStep::Matches(1)]),
        );
        let session = session_for(&driver).await;
        let state = enabled_state(5);

        let task = spawn(params(session, state.clone(), Duration::from_secs(5)), CancellationToken::new());
        task.handle.await.unwrap();

        let s = state.lock().unwrap();
        assert_eq!(s.outcome, LoopOutcome::Clicked);
        assert!(!s.enabled);
        assert_eq!(s.attempt_count, 1);
        assert!(s.last_screenshot.is_some());
        assert_eq!(driver.clicks(), vec!["#book-1".to_string()]);
        // Login load plus one tick reload.
        assert_eq!(driver.navigations().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reload_ends_the_tick_without_clicking() {
        let driver = ScriptedDriver::new(
            Script::default().with_click_script([ClickStep::Matches(1)]),
        );
        let session = session_for(&driver).await;
        driver.script(|s| s.fail_navigations = 1);
        let state = enabled_state(5);

        let task = spawn(params(session, state.clone(), Duration::from_secs(5)), CancellationToken::new());
        task.handle.await.unwrap();

        let s = state.lock().unwrap();
        assert_eq!(s.outcome, LoopOutcome::Clicked);
        assert_eq!(s.attempt_count, 2, "the failed reload consumed a tick");
        assert_eq!(driver.clicks().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_target_appears() {
        let driver = ScriptedDriver::new(Script::default().with_click_script([
            ClickStep::Matches(0),
            ClickStep::Matches(0),
            ClickStep::Matches(1),
        ]));
        let session = session_for(&driver).await;
        let state = enabled_state(5);

        let task = spawn(params(session, state.clone(), Duration::from_secs(5)), CancellationToken::new());
        task.handle.await.unwrap();

        let s = state.lock().unwrap();
        assert_eq!(s.outcome, LoopOutcome::Clicked);
        assert_eq!(s.attempt_count, 3, "misses and the hit all count");
        assert_eq!(driver.clicks().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_absorbed() {
        let driver = ScriptedDriver::new(Script::default().with_click_script([
            ClickStep::TransientError("protocol hiccup".into()),
            ClickStep::Matches(1),
        ]));
        let session = session_for(&driver).await;
        let state = enabled_state(5);

        let task = spawn(params(session, state.clone(), Duration::from_secs(5)), CancellationToken::new());
        task.handle.await.unwrap();

        let s = state.lock().unwrap();
        assert_eq!(s.outcome, LoopOutcome::Clicked);
        assert_eq!(s.attempt_count, 2);
        assert!(s.last_error.is_none(), "success clears the absorbed error");
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_policy_suppresses_ambiguous_click() {
        let driver = ScriptedDriver::new(Script::default().with_click_script([
            ClickStep::Matches(3),
            ClickStep::Matches(1),
        ]));
        let session = session_for(&driver).await;
        let state = enabled_state(5);

        let mut p = params(session, state.clone(), Duration::from_secs(5));
        p.policy = AmbiguityPolicy::Strict;
        let task = spawn(p, CancellationToken::new());
        task.handle.await.unwrap();

        let s = state.lock().unwrap();
        assert_eq!(s.outcome, LoopOutcome::Clicked);
        assert_eq!(s.attempt_count, 2);
        // The ambiguous tick dispatched nothing.
        assert_eq!(driver.clicks().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_at_tick_boundary() {
        let steps: Vec<ClickStep> = (0..100).map(|_| ClickStep::Matches(0)).collect();
        let driver = ScriptedDriver::new(Script::default().with_click_script(steps));
        let session = session_for(&driver).await;
        let state = enabled_state(5);

        let task = spawn(params(session, state.clone(), Duration::from_secs(5)), CancellationToken::new());
        // Let a couple of ticks complete.
        tokio::time::sleep(Duration::from_secs(7)).await;
        task.cancel.cancel();
        task.handle.await.unwrap();

        let s = state.lock().unwrap();
        assert_eq!(s.outcome, LoopOutcome::Stopped);
        assert!(!s.enabled);
        assert!(s.attempt_count >= 1);
        assert!(driver.clicks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_first_tick() {
        let driver = ScriptedDriver::new(Script::default());
        let session = session_for(&driver).await;
        let state = enabled_state(5);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let task = spawn(params(session, state.clone(), Duration::from_secs(5)), cancel);
        task.handle.await.unwrap();

        let s = state.lock().unwrap();
        assert_eq!(s.outcome, LoopOutcome::Stopped);
        assert_eq!(s.attempt_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_lost_fails_the_run() {
        let driver = ScriptedDriver::new(Script::default().with_click_script([
            ClickStep::Matches(0),
            ClickStep::Lost,
        ]));
        let session = session_for(&driver).await;
        let state = enabled_state(5);
        let reset_ran = Arc::new(AtomicBool::new(false));

        let mut p = params(session.clone(), state.clone(), Duration::from_secs(5));
        let flag = reset_ran.clone();
        p.on_session_lost = Box::new(move |_| flag.store(true, Ordering::SeqCst));
        let task = spawn(p, CancellationToken::new());
        task.handle.await.unwrap();

        assert!(session.lock().await.is_none(), "dead session is dropped");
        let s = state.lock().unwrap();
        assert_eq!(s.outcome, LoopOutcome::Failed);
        assert!(!s.enabled);
        assert!(reset_ran.load(Ordering::SeqCst));
        assert_eq!(driver.close_count(), 1);
    }

    #[test]
    fn test_seconds_until_next_tick() {
        let now = Utc::now();
        let mut state = LoopState::default();
        assert_eq!(seconds_until_next_tick(&state, now), None);

        state.enabled = true;
        assert_eq!(seconds_until_next_tick(&state, now), Some(0));

        state.interval_secs = 30;
        state.last_attempt = Some(now - chrono::Duration::seconds(10));
        assert_eq!(seconds_until_next_tick(&state, now), Some(20));

        state.last_attempt = Some(now - chrono::Duration::seconds(45));
        assert_eq!(seconds_until_next_tick(&state, now), Some(0));
    }
}
