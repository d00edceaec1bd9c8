//! Step progression guard: Login → Scan/Select → Auto-click.
//!
//! Every operator action consults the gate before touching the browser. An
//! action invoked while its gate is not satisfied fails with
//! [`Error::GateNotSatisfied`] and performs no side effect.

use crate::{Error, Result};

/// Progression state of the three-step workflow.
///
/// Ordering matters: a gate requirement of `Scanned` is satisfied by both
/// `Scanned` and `Armed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GateState {
    /// No usable browser session. Steps 2 and 3 are locked.
    LoggedOut,
    /// A session is open; scanning and selection are unlocked.
    Scanned,
    /// An element is selected; the auto-click loop is unlocked.
    Armed,
}

/// Forward-only progression guard over [`GateState`].
///
/// The only backward transition is [`reset`](StepGate::reset), taken when the
/// session is closed or lost.
#[derive(Debug)]
pub struct StepGate {
    state: GateState,
}

impl StepGate {
    pub fn new() -> Self {
        Self {
            state: GateState::LoggedOut,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    /// Check that the current state satisfies `required`.
    pub fn require(&self, required: GateState) -> Result<()> {
        if self.state >= required {
            Ok(())
        } else {
            Err(Error::GateNotSatisfied { required })
        }
    }

    /// Unlock Step 2 after a session opened successfully.
    pub fn mark_logged_in(&mut self) {
        if self.state < GateState::Scanned {
            self.state = GateState::Scanned;
        }
    }

    /// Unlock Step 3 after the operator selected an element.
    pub fn mark_armed(&mut self) {
        self.state = GateState::Armed;
    }

    /// Re-lock Steps 2 and 3. Taken on session close or loss.
    pub fn reset(&mut self) {
        self.state = GateState::LoggedOut;
    }
}

impl Default for StepGate {
    fn default() -> Self {
        Self::new()
    }
}
