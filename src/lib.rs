//! Session-gated auto-clicker for booking pages.
//!
//! The workflow has three locked steps. Step 1 opens a browser on the login
//! page, where the operator signs in manually. Step 2 scans the target page
//! for clickable elements and arms one of them. Step 3 runs a self-paced loop
//! that re-tries the armed element until it appears, clicks it once, and
//! stops. A step stays locked until the previous one has succeeded, and losing
//! the browser session re-locks everything.
//!
//! The browser is reached through the [`Driver`] trait; production uses
//! [`EokaDriver`] over Chrome, tests use a scripted fake.
//!
//! ```no_run
//! use grabit::{Controller, EokaDriver, RunConfig};
//!
//! # async fn demo() -> grabit::Result<()> {
//! let config = RunConfig::parse(
//!     "login_url: \"https://club.example/login\"\n\
//!      target_url: \"https://club.example/tee-sheet\"\n",
//! )?;
//! let controller = Controller::new(EokaDriver::factory(config.browser.clone()), &config);
//!
//! controller.open_login().await?; // operator logs in by hand
//! let catalog = controller.scan().await?;
//! println!("{}", catalog.listing());
//! controller.select(0)?;
//! controller.enable_loop()?;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod clicker;
pub mod config;
pub mod controller;
pub mod driver;
mod error;
pub mod gate;
pub mod mcp;
pub mod session;

#[doc(hidden)]
pub mod testkit;

pub use catalog::{AmbiguityPolicy, CandidateElement, ElementCatalog, ElementKind, Selection};
pub use clicker::{seconds_until_next_tick, LoopOutcome, LoopState, Screenshot};
pub use config::{BrowserConfig, RunConfig, Viewport};
pub use controller::Controller;
pub use driver::{Driver, DriverFactory, EokaDriver, RawClickable};
pub use error::{Error, Result};
pub use gate::{GateState, StepGate};
pub use session::BrowserSession;
