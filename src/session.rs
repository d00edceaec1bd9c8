//! One live browser session, created at login and reused by every later
//! operation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::driver::{Driver, DriverFactory};
use crate::{Error, Result};

/// Owns the driver handle and the latest cookie/storage state.
///
/// "Active" means the automation channel is usable, not that the operator has
/// finished logging in — credential entry happens manually in the opened
/// browser, outside automated control.
#[derive(Debug)]
pub struct BrowserSession<D: Driver> {
    driver: Option<D>,
    login_url: String,
    storage_state: Option<String>,
    last_error: Option<String>,
    opened_at: DateTime<Utc>,
}

impl<D: Driver> BrowserSession<D> {
    /// Launch or attach a browser and show the login page.
    ///
    /// Fails with [`Error::DriverUnavailable`] only when no browser handle
    /// could be obtained. A navigation failure on the way to the login page is
    /// recorded but leaves the session active, so the operator can retry from
    /// an open browser.
    pub async fn open(factory: &DriverFactory<D>, login_url: &str, timeout: Duration) -> Result<Self> {
        let driver = factory().await?;

        let mut session = Self {
            driver: Some(driver),
            login_url: login_url.to_string(),
            storage_state: None,
            last_error: None,
            opened_at: Utc::now(),
        };

        match session.navigate(login_url, timeout).await {
            Ok(()) => info!("login page open: {login_url}"),
            Err(e) => warn!("login page failed to load ({e}); browser left open"),
        }

        Ok(session)
    }

    pub fn is_active(&self) -> bool {
        self.driver.is_some()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Access the driver handle. `SessionLost` once the session is closed.
    pub fn driver(&self) -> Result<&D> {
        self.driver.as_ref().ok_or(Error::SessionLost)
    }

    /// Load a URL in the existing session, reusing cookies.
    ///
    /// Navigation failures are non-fatal: the error is returned and recorded,
    /// and the session stays active. On success the latest storage state is
    /// re-captured so later navigations stay authenticated.
    pub async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()> {
        let driver = self.driver.as_ref().ok_or(Error::SessionLost)?;

        match driver.navigate(url, timeout).await {
            Ok(()) => {
                self.last_error = None;
                // Navigation may have changed cookies; keep the newest blob.
                match driver.storage_state().await {
                    Ok(state) => self.storage_state = state,
                    Err(e) => debug!("storage state capture failed: {e}"),
                }
                Ok(())
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Latest captured cookie/storage blob, if any.
    pub fn storage_state(&self) -> Option<String> {
        self.storage_state.clone()
    }

    /// Push a previously captured blob into the live page, so a fresh session
    /// can pick up where a lost one left off.
    pub async fn restore_storage_state(&mut self, blob: &str) -> Result<()> {
        let driver = self.driver.as_ref().ok_or(Error::SessionLost)?;
        driver.restore_storage_state(blob).await?;
        self.storage_state = Some(blob.to_string());
        Ok(())
    }

    /// Whether the page has navigated away from the login URL yet. Purely
    /// informational: the gate never depends on it.
    pub async fn left_login_page(&self) -> bool {
        let Some(driver) = self.driver.as_ref() else {
            return false;
        };
        match driver.current_url().await {
            Ok(url) => url != self.login_url && !url.to_lowercase().contains("login"),
            Err(_) => false,
        }
    }

    /// Release the browser handle. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            if let Err(e) = driver.close().await {
                warn!("browser close failed: {e}");
            }
            info!("browser session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{Script, ScriptedDriver};
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_open_activates_session() {
        let driver = ScriptedDriver::new(Script::default());
        let session = BrowserSession::open(&driver.factory(), "https://club.example/login", TIMEOUT)
            .await
            .unwrap();
        assert!(session.is_active());
        assert_eq!(
            driver.navigations(),
            vec!["https://club.example/login".to_string()]
        );
    }

    #[tokio::test]
    async fn test_open_fails_when_driver_unreachable() {
        let factory: DriverFactory<ScriptedDriver> = Arc::new(|| {
            Box::pin(async { Err(Error::DriverUnavailable("no chrome binary".into())) })
        });
        let err = BrowserSession::open(&factory, "https://club.example/login", TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DriverUnavailable(_)));
    }

    #[tokio::test]
    async fn test_open_survives_login_page_navigation_failure() {
        let script = Script::default().fail_next_navigations(1);
        let driver = ScriptedDriver::new(script);
        let session = BrowserSession::open(&driver.factory(), "https://club.example/login", TIMEOUT)
            .await
            .unwrap();
        assert!(session.is_active());
        assert!(session.last_error().is_some());
    }

    #[tokio::test]
    async fn test_navigate_records_and_clears_last_error() {
        let driver = ScriptedDriver::new(Script::default());
        let mut session =
            BrowserSession::open(&driver.factory(), "https://club.example/login", TIMEOUT)
                .await
                .unwrap();

        driver.script(|s| s.fail_navigations = 1);
        let err = session
            .navigate("https://club.example/tee-sheet", TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(session.last_error().is_some());
        assert!(session.is_active(), "transient failure must not kill the session");

        session
            .navigate("https://club.example/tee-sheet", TIMEOUT)
            .await
            .unwrap();
        assert!(session.last_error().is_none());
    }

    #[tokio::test]
    async fn test_navigate_refreshes_storage_state() {
        let driver = ScriptedDriver::new(Script::default().with_storage_state("sid=abc"));
        let mut session =
            BrowserSession::open(&driver.factory(), "https://club.example/login", TIMEOUT)
                .await
                .unwrap();
        session
            .navigate("https://club.example/tee-sheet", TIMEOUT)
            .await
            .unwrap();
        assert_eq!(session.storage_state.as_deref(), Some("sid=abc"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let driver = ScriptedDriver::new(Script::default());
        let mut session =
            BrowserSession::open(&driver.factory(), "https://club.example/login", TIMEOUT)
                .await
                .unwrap();
        session.close().await;
        assert!(!session.is_active());
        session.close().await;
        assert!(!session.is_active());
        assert!(matches!(session.driver(), Err(Error::SessionLost)));
        assert_eq!(driver.close_count(), 1);
    }

    #[tokio::test]
    async fn test_left_login_page() {
        let driver = ScriptedDriver::new(
            Script::default().with_current_url("https://club.example/login"),
        );
        let session = BrowserSession::open(&driver.factory(), "https://club.example/login", TIMEOUT)
            .await
            .unwrap();
        assert!(!session.left_login_page().await);

        driver.script(|s| s.current_url = "https://club.example/member/home".into());
        assert!(session.left_login_page().await);
    }
}
