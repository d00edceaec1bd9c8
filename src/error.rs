use crate::gate::GateState;

/// Result type for grabit operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a grab run.
///
/// Three families, handled differently by the control loop:
/// caller errors ([`GateNotSatisfied`](Error::GateNotSatisfied),
/// [`Busy`](Error::Busy), [`AlreadyRunning`](Error::AlreadyRunning),
/// [`InvalidInterval`](Error::InvalidInterval),
/// [`UnknownElement`](Error::UnknownElement)) are returned synchronously and
/// never retried; transient errors
/// ([`NavigationTimeout`](Error::NavigationTimeout),
/// [`Navigation`](Error::Navigation), [`Driver`](Error::Driver)) are swallowed
/// and retried by the auto-click loop; fatal errors
/// ([`DriverUnavailable`](Error::DriverUnavailable),
/// [`SessionLost`](Error::SessionLost)) force a single state reset and are
/// surfaced to the operator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("browser driver unavailable: {0}")]
    DriverUnavailable(String),

    #[error("browser session lost; log in again")]
    SessionLost,

    #[error("step locked: requires {required:?}")]
    GateNotSatisfied { required: GateState },

    #[error("navigation timed out: {0}")]
    NavigationTimeout(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("auto-click loop is already running")]
    AlreadyRunning,

    #[error("another browser operation is in flight")]
    Busy,

    #[error("interval must be at least 1 second (got {0})")]
    InvalidInterval(u64),

    #[error("no element [{0}] in the current catalog")]
    UnknownElement(usize),

    #[error("selector matched {0} elements under the strict ambiguity policy")]
    AmbiguousTarget(usize),

    #[error("config error: {0}")]
    Config(String),

    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("driver error: {0}")]
    Driver(String),
}

impl Error {
    /// Whether the auto-click loop should absorb this error and retry on the
    /// next tick instead of halting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::NavigationTimeout(_) | Error::Navigation(_) | Error::Driver(_)
        )
    }
}
