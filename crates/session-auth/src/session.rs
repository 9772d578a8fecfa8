//! Process-wide session holder.
//!
//! The only way the session changes is through a machine transition. Every
//! actual change is reported once to the registered listener; repeated
//! requests to leave `Authenticated` after it has already been left are
//! no-ops, so one refresh failure fans out to at most one notification.

use crate::refresh::RefreshOutcome;
use crate::session_fsm::{
    SessionMachine, SessionMachineInput, SessionMachineState, SessionState, SessionStateChanged,
    TransitionReason,
};
use crate::{AuthError, AuthResult};
use credential_storage::{CredentialStore, User};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Callback type for session state change notifications.
pub type SessionListener = Arc<dyn Fn(&SessionStateChanged) + Send + Sync>;

struct SessionInner {
    machine: SessionMachine,
    user: Option<User>,
}

impl SessionInner {
    fn view(&self) -> SessionState {
        match (self.machine.state(), &self.user) {
            (SessionMachineState::Unknown, _) => SessionState::Unknown,
            (SessionMachineState::Authenticating, _) => SessionState::Authenticating,
            (SessionMachineState::Authenticated, Some(user)) => {
                SessionState::Authenticated(user.clone())
            }
            // Authenticated is only ever entered together with a user.
            (SessionMachineState::Authenticated, None) => SessionState::Unauthenticated,
            (SessionMachineState::Unauthenticated, _) => SessionState::Unauthenticated,
        }
    }
}

pub struct Session {
    store: Arc<CredentialStore>,
    inner: Mutex<SessionInner>,
    listener: Mutex<Option<SessionListener>>,
}

impl Session {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self {
            store,
            inner: Mutex::new(SessionInner {
                machine: SessionMachine::new(),
                user: None,
            }),
            listener: Mutex::new(None),
        }
    }

    /// Set a callback to be notified of session state changes.
    pub fn set_listener(&self, listener: SessionListener) {
        *self.listener.lock() = Some(listener);
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().view()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state().is_authenticated()
    }

    pub fn allows_requests(&self) -> bool {
        self.state().allows_requests()
    }

    pub fn user(&self) -> Option<User> {
        self.inner.lock().user.clone()
    }

    /// `Unknown -> Authenticating` for the startup credential check.
    pub fn begin_check(&self) -> AuthResult<SessionState> {
        self.transition(
            &SessionMachineInput::CheckStarted,
            TransitionReason::CredentialCheck,
            None,
        )
    }

    /// `Unknown | Unauthenticated -> Authenticating` for a new sign-in.
    pub fn begin_sign_in(&self) -> AuthResult<SessionState> {
        self.transition(
            &SessionMachineInput::SignInStarted,
            TransitionReason::SignIn,
            None,
        )
    }

    /// `Authenticating -> Authenticated(user)`; the profile is cached for offline starts.
    pub fn establish(&self, user: User) -> AuthResult<SessionState> {
        if let Err(e) = self.store.set_cached_user(&user) {
            warn!(error = %e, "Failed to cache user profile");
        }
        self.transition(
            &SessionMachineInput::Established,
            TransitionReason::Established,
            Some(user),
        )
    }

    /// Leave the current state for `Unauthenticated`.
    ///
    /// Idempotent: returns `false` and notifies nobody when the session is
    /// already unauthenticated. The cached profile is always cleared. For
    /// [`TransitionReason::Unauthorized`] the credential store is cleared too.
    pub fn mark_unauthenticated(&self, reason: TransitionReason) -> bool {
        if let Err(e) = self.store.clear_cached_user() {
            warn!(error = %e, "Failed to clear cached user profile");
        }
        if reason == TransitionReason::Unauthorized {
            if let Err(e) = self.store.clear() {
                warn!(error = %e, "Failed to clear credentials after unauthorized response");
            }
        }

        if *self.inner.lock().machine.state() == SessionMachineState::Unauthenticated {
            debug!(reason = ?reason, "Session already unauthenticated");
            return false;
        }

        match self.transition(&reason.exit_input(), reason, None) {
            Ok(_) => true,
            // Lost a race with another exit.
            Err(_) if self.state() == SessionState::Unauthenticated => false,
            Err(e) => {
                warn!(error = %e, "Could not leave current session state");
                false
            }
        }
    }

    /// React to the outcome of a refresh round.
    ///
    /// Only terminal failures move the session; transient failures and
    /// cancellations leave it where it is.
    pub fn handle_refresh_outcome(&self, outcome: &RefreshOutcome) {
        if let Err(error) = outcome {
            if error.is_terminal() && self.mark_unauthenticated(TransitionReason::RefreshFailed) {
                info!(error = %error, "Session ended by refresh failure");
            }
        }
    }

    /// Transition the machine and notify the listener if the state changed.
    fn transition(
        &self,
        input: &SessionMachineInput,
        reason: TransitionReason,
        user: Option<User>,
    ) -> AuthResult<SessionState> {
        let mut inner = self.inner.lock();
        let previous = inner.view();

        inner.machine.consume(input).map_err(|_| {
            AuthError::InvalidStateTransition(format!(
                "Cannot apply {:?} in state {:?}",
                input,
                inner.machine.state()
            ))
        })?;

        let authenticated = *inner.machine.state() == SessionMachineState::Authenticated;
        let kept = inner.user.take();
        inner.user = if authenticated { user.or(kept) } else { None };
        let state = inner.view();
        drop(inner);

        if state != previous {
            debug!(
                previous = previous.name(),
                state = state.name(),
                reason = ?reason,
                "Session state transition"
            );
            let listener = self.listener.lock().clone();
            if let Some(listener) = listener {
                listener(&SessionStateChanged {
                    state: state.clone(),
                    previous,
                    reason,
                });
            }
        }

        Ok(state)
    }
}
