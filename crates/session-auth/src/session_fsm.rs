//! Session state machine using rust-fsm.
//!
//! ## State Diagram
//!
//! ```text
//! ┌─────────────────┐  NoCredential / SignedOut / Expired
//! │     Unknown     │ ─────────────────────────────────────┐
//! └────────┬────────┘                                      │
//!          │ CheckStarted / SignInStarted                  │
//!          ▼                                               ▼
//! ┌─────────────────┐  Failed / SignedOut / Expired ┌─────────────────┐
//! │ Authenticating  │ ────────────────────────────► │ Unauthenticated │
//! └────────┬────────┘                               └────────┬────────┘
//!          │ Established              ▲                      │
//!          ▼                          │ SignedOut / Expired  │ SignInStarted
//! ┌─────────────────┐                 │                      │
//! │  Authenticated  │ ────────────────┘        ──► Authenticating
//! └─────────────────┘
//! ```

use credential_storage::User;
use rust_fsm::*;
use serde::Serialize;

state_machine! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub session_machine(Unknown)

    Unknown => {
        CheckStarted => Authenticating,
        SignInStarted => Authenticating,
        NoCredential => Unauthenticated,
        SignedOut => Unauthenticated,
        Expired => Unauthenticated
    },
    Authenticating => {
        Established => Authenticated,
        Failed => Unauthenticated,
        SignedOut => Unauthenticated,
        Expired => Unauthenticated
    },
    Authenticated => {
        SignedOut => Unauthenticated,
        Expired => Unauthenticated
    },
    Unauthenticated => {
        SignInStarted => Authenticating
    }
}

pub use session_machine::Input as SessionMachineInput;
pub use session_machine::State as SessionMachineState;
pub use session_machine::StateMachine as SessionMachine;

/// Public view of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "user", rename_all = "snake_case")]
pub enum SessionState {
    /// Process start, credentials not checked yet.
    Unknown,
    /// Credential check or sign-in in progress.
    Authenticating,
    /// Signed in.
    Authenticated(User),
    /// Signed out, or the credential became unusable.
    Unauthenticated,
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated(_))
    }

    /// Business calls proceed only from `Unknown` and `Authenticated`.
    pub fn allows_requests(&self) -> bool {
        matches!(self, SessionState::Unknown | SessionState::Authenticated(_))
    }

    pub fn user(&self) -> Option<&User> {
        match self {
            SessionState::Authenticated(user) => Some(user),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Unknown => "unknown",
            SessionState::Authenticating => "authenticating",
            SessionState::Authenticated(_) => "authenticated",
            SessionState::Unauthenticated => "unauthenticated",
        }
    }
}

/// What caused a session transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    CredentialCheck,
    SignIn,
    Established,
    NoCredential,
    SignInFailed,
    ProfileUnavailable,
    SignedOut,
    RefreshFailed,
    Unauthorized,
}

impl TransitionReason {
    /// Machine input that moves the session to `Unauthenticated` for this reason.
    pub(crate) fn exit_input(self) -> SessionMachineInput {
        match self {
            TransitionReason::NoCredential => SessionMachineInput::NoCredential,
            TransitionReason::SignedOut => SessionMachineInput::SignedOut,
            TransitionReason::SignInFailed | TransitionReason::ProfileUnavailable => {
                SessionMachineInput::Failed
            }
            _ => SessionMachineInput::Expired,
        }
    }
}

/// Payload for session state change notifications.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStateChanged {
    pub state: SessionState,
    pub previous: SessionState,
    pub reason: TransitionReason,
}
