//! Worker instance lifecycle as an explicit finite-state machine.

use serde::Serialize;

use crate::error::{Error, Result};

/// Lifecycle state of one installed worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Precache population in progress.
    Installing,
    /// Fully installed, held back while an older instance controls the scope.
    Waiting,
    /// Claiming clients and evicting stale cache generations.
    Activating,
    /// Controlling the scope.
    Activated,
    /// Failed to install or superseded. Terminal.
    Redundant,
}

/// Something that happened to a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Precache population succeeded.
    Installed,
    /// Precache population failed.
    InstallFailed,
    /// Leave the waiting state (skip-waiting, first install, or all clients gone).
    Activate,
    /// Claiming and eviction finished.
    ActivationComplete,
    /// A newer instance took this one's place.
    Superseded,
}

impl WorkerState {
    /// Applies `event`, returning the next state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] when `event` is not accepted in
    /// the current state. A redundant instance accepts nothing.
    pub fn next(self, event: LifecycleEvent) -> Result<Self> {
        use LifecycleEvent as E;
        use WorkerState as S;

        match (self, event) {
            (S::Installing, E::Installed) => Ok(S::Waiting),
            (S::Installing, E::InstallFailed) => Ok(S::Redundant),
            (S::Waiting, E::Activate) => Ok(S::Activating),
            (S::Activating, E::ActivationComplete) => Ok(S::Activated),
            (S::Installing | S::Waiting | S::Activating | S::Activated, E::Superseded) => {
                Ok(S::Redundant)
            }
            (from, event) => Err(Error::InvalidTransition { from, event }),
        }
    }

    /// Whether this instance may still receive the activation message.
    #[must_use]
    pub const fn is_waiting(self) -> bool {
        matches!(self, Self::Waiting)
    }

    /// Whether this instance is gone for good.
    #[must_use]
    pub const fn is_redundant(self) -> bool {
        matches!(self, Self::Redundant)
    }
}
