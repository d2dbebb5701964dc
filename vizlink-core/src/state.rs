//! Session lifecycle state machine.
//!
//! Validated transitions that return `Result` instead of panicking. The
//! session never retries on its own: `Closed` and `Failed` are terminal
//! until the caller explicitly reconnects — remote render resources are
//! expensive and must not be reacquired silently.

use thiserror::Error;

/// A transition was requested from a state that does not allow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session state transition: {0}")]
pub struct InvalidTransition(pub &'static str);

// ── SessionState ─────────────────────────────────────────────────

/// The lifecycle state of one rendering session.
///
/// ```text
///               ┌───────────────────────────────────────┐
///               ▼                                       │
///  Idle ──► Connecting ──► Negotiating ──► Ready ◄──► Degraded
///               │               │            │            │
///               ▼               ▼            ▼            ▼
///             Failed ◄──────────┘          Closed ◄───────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// Initial state; nothing attempted yet.
    #[default]
    Idle,
    /// Transport connect in flight.
    Connecting,
    /// Socket up; session negotiation sent, waiting for the first frame
    /// or handshake ack.
    Negotiating,
    /// Frames flowing; remote calls permitted.
    Ready,
    /// The transport reported an error but may still be usable; a
    /// subsequent frame recovers to `Ready`.
    Degraded,
    /// Torn down. Terminal until an explicit reconnect.
    Closed,
    /// Connect or negotiation failed. Terminal until an explicit
    /// reconnect.
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Connecting => "Connecting",
            Self::Negotiating => "Negotiating",
            Self::Ready => "Ready",
            Self::Degraded => "Degraded",
            Self::Closed => "Closed",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

impl SessionState {
    /// Remote calls are only permitted here.
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Terminal until the caller reconnects.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// States from which `connect()` may (re-)start.
    pub fn can_connect(self) -> bool {
        matches!(self, Self::Idle | Self::Degraded | Self::Closed | Self::Failed)
    }

    // ── Transitions ──────────────────────────────────────────────

    /// `connect()` called.
    ///
    /// Valid from: `Idle`, `Degraded`, `Closed`, `Failed` (reconnect with
    /// full re-negotiation; the caller discards stale handles first).
    pub fn begin_connect(&mut self) -> Result<(), InvalidTransition> {
        if self.can_connect() {
            *self = Self::Connecting;
            Ok(())
        } else {
            Err(InvalidTransition(
                "connect: session is already connecting or connected",
            ))
        }
    }

    /// Transport connect succeeded; gateway obtained, decoder subscribed.
    ///
    /// Valid from: `Connecting`.
    pub fn negotiated(&mut self) -> Result<(), InvalidTransition> {
        match self {
            Self::Connecting => {
                *self = Self::Negotiating;
                Ok(())
            }
            _ => Err(InvalidTransition("negotiate: not in Connecting state")),
        }
    }

    /// First frame arrived or the handshake call completed; also the
    /// recovery edge out of `Degraded`.
    ///
    /// Valid from: `Negotiating`, `Degraded`.
    pub fn mark_ready(&mut self) -> Result<(), InvalidTransition> {
        match self {
            Self::Negotiating | Self::Degraded => {
                *self = Self::Ready;
                Ok(())
            }
            _ => Err(InvalidTransition(
                "ready: not in Negotiating or Degraded state",
            )),
        }
    }

    /// The transport reported an error while the session was live.
    ///
    /// Valid from: `Ready`.
    pub fn degrade(&mut self) -> Result<(), InvalidTransition> {
        match self {
            Self::Ready => {
                *self = Self::Degraded;
                Ok(())
            }
            _ => Err(InvalidTransition("degrade: not in Ready state")),
        }
    }

    /// Connect or negotiation failed.
    ///
    /// Valid from: `Connecting`, `Negotiating`.
    pub fn fail(&mut self) -> Result<(), InvalidTransition> {
        match self {
            Self::Connecting | Self::Negotiating => {
                *self = Self::Failed;
                Ok(())
            }
            _ => Err(InvalidTransition(
                "fail: not in Connecting or Negotiating state",
            )),
        }
    }

    /// `disconnect()` called or the transport closed.
    ///
    /// Valid from any state; idempotent.
    pub fn close(&mut self) {
        *self = Self::Closed;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_lifecycle() {
        let mut state = SessionState::default();
        assert_eq!(state, SessionState::Idle);

        state.begin_connect().unwrap();
        state.negotiated().unwrap();
        state.mark_ready().unwrap();
        assert!(state.is_ready());

        state.close();
        assert!(state.is_terminal());
    }

    #[test]
    fn degrade_and_recover() {
        let mut state = SessionState::Ready;
        state.degrade().unwrap();
        assert_eq!(state, SessionState::Degraded);

        // A subsequent frame proves the error was transient.
        state.mark_ready().unwrap();
        assert!(state.is_ready());
    }

    #[test]
    fn reconnect_from_terminal_states() {
        for start in [
            SessionState::Degraded,
            SessionState::Closed,
            SessionState::Failed,
        ] {
            let mut state = start;
            state.begin_connect().unwrap();
            assert_eq!(state, SessionState::Connecting);
        }
    }

    #[test]
    fn no_connect_while_live() {
        for start in [
            SessionState::Connecting,
            SessionState::Negotiating,
            SessionState::Ready,
        ] {
            let mut state = start;
            assert!(state.begin_connect().is_err());
            assert_eq!(state, start, "failed transition must not change state");
        }
    }

    #[test]
    fn connect_failure_path() {
        let mut state = SessionState::Idle;
        state.begin_connect().unwrap();
        state.fail().unwrap();
        assert_eq!(state, SessionState::Failed);
        assert!(state.can_connect());
    }

    #[test]
    fn negotiation_rejection_fails() {
        let mut state = SessionState::Negotiating;
        state.fail().unwrap();
        assert_eq!(state, SessionState::Failed);
    }

    #[test]
    fn close_is_valid_everywhere() {
        for start in [
            SessionState::Idle,
            SessionState::Connecting,
            SessionState::Negotiating,
            SessionState::Ready,
            SessionState::Degraded,
            SessionState::Closed,
            SessionState::Failed,
        ] {
            let mut state = start;
            state.close();
            assert_eq!(state, SessionState::Closed);
        }
    }

    #[test]
    fn invalid_transitions_rejected() {
        let mut state = SessionState::Idle;
        assert!(state.negotiated().is_err());
        assert!(state.mark_ready().is_err());
        assert!(state.degrade().is_err());
        assert!(state.fail().is_err());
    }

    #[test]
    fn display_names() {
        assert_eq!(SessionState::Negotiating.to_string(), "Negotiating");
        assert_eq!(SessionState::Degraded.to_string(), "Degraded");
    }
}
