//! Session phases and the transitions allowed between them.
//!
//! ```text
//! Launching ─▶ Initializing ─▶ Authenticating ─┬─▶ Unauthenticated ─▶ Authenticating
//!                   ▲                          └─▶ Authenticated ─▶ Hydrating ─▶ Hydrated
//!                   │                                                               │
//!                 Error ◀── (any phase)          Unauthenticated ◀── SigningOut ◀───┘
//! ```

use crate::error::CacheError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of the application session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Launching,
    Initializing,
    Authenticating,
    Unauthenticated,
    Authenticated,
    Hydrating,
    Hydrated,
    SigningOut,
    Error,
}

impl SessionPhase {
    /// Loading phases are shown for at least the configured minimum
    /// duration before they are left.
    pub fn is_loading(&self) -> bool {
        matches!(
            self,
            SessionPhase::Launching
                | SessionPhase::Initializing
                | SessionPhase::Authenticating
                | SessionPhase::Hydrating
                | SessionPhase::SigningOut
        )
    }

    /// Whether `next` may follow `self`.
    pub fn can_transition_to(&self, next: SessionPhase) -> bool {
        use SessionPhase::*;

        if next == Error {
            return *self != Error;
        }

        matches!(
            (self, next),
            (Launching, Initializing)
                | (Initializing, Authenticating)
                | (Authenticating, Unauthenticated)
                | (Authenticating, Authenticated)
                | (Unauthenticated, Authenticating)
                | (Authenticated, Hydrating)
                | (Authenticated, SigningOut)
                | (Hydrating, Hydrated)
                | (Hydrated, SigningOut)
                | (SigningOut, Unauthenticated)
                | (Error, Initializing)
        )
    }

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Launching => "launching",
            SessionPhase::Initializing => "initializing",
            SessionPhase::Authenticating => "authenticating",
            SessionPhase::Unauthenticated => "unauthenticated",
            SessionPhase::Authenticated => "authenticated",
            SessionPhase::Hydrating => "hydrating",
            SessionPhase::Hydrated => "hydrated",
            SessionPhase::SigningOut => "signing_out",
            SessionPhase::Error => "error",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published state of the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseState {
    /// Current phase
    pub phase: SessionPhase,
    /// When the phase was entered
    pub since: DateTime<Utc>,
    /// Error that caused the phase, if any
    pub last_error: Option<CacheError>,
    /// Signed-in user, while a session exists
    pub user: Option<String>,
}

impl PhaseState {
    pub(crate) fn initial() -> Self {
        Self {
            phase: SessionPhase::Launching,
            since: Utc::now(),
            last_error: None,
            user: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionPhase::*;

    const ALL: [SessionPhase; 9] = [
        Launching,
        Initializing,
        Authenticating,
        Unauthenticated,
        Authenticated,
        Hydrating,
        Hydrated,
        SigningOut,
        Error,
    ];

    #[test]
    fn test_happy_path_is_allowed() {
        let path = [
            Launching,
            Initializing,
            Authenticating,
            Authenticated,
            Hydrating,
            Hydrated,
            SigningOut,
            Unauthenticated,
            Authenticating,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_error_reachable_from_everywhere() {
        for phase in ALL {
            assert_eq!(phase.can_transition_to(Error), phase != Error);
        }
        assert!(Error.can_transition_to(Initializing));
        assert!(!Error.can_transition_to(Hydrated));
    }

    #[test]
    fn test_no_shortcuts() {
        assert!(!Launching.can_transition_to(Hydrated));
        assert!(!Unauthenticated.can_transition_to(Hydrating));
        assert!(!Hydrated.can_transition_to(Unauthenticated));
        assert!(!Hydrating.can_transition_to(SigningOut));
    }

    #[test]
    fn test_loading_phases() {
        let loading: Vec<_> = ALL.into_iter().filter(|p| p.is_loading()).collect();
        assert_eq!(loading, vec![Launching, Initializing, Authenticating, Hydrating, SigningOut]);
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&SigningOut).unwrap(), "\"signing_out\"");
        assert_eq!(SigningOut.to_string(), "signing_out");
    }
}
