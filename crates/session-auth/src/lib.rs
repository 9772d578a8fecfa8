//! Authentication core for Keyward clients.
//!
//! This crate provides:
//! - Single-flight access token refresh shared by every concurrent caller
//! - An explicit FSM-based session state with change notifications
//! - An authenticated request gateway that recovers from one 401 per request
//! - CSRF-protected third-party account linking
//! - [`AuthClient`], which wires the pieces together once per process
//!
//! Secrets live in [`credential_storage::CredentialStore`]; nothing in this
//! crate keeps its own copy of a token.

mod client;
mod error;
mod gateway;
mod oauth_link;
mod refresh;
mod session;
mod session_fsm;
mod token_endpoint;
mod transport;

pub use client::{AuthClient, AuthSettings};
pub use error::{AuthError, AuthResult, LinkRejection, RefreshError};
pub use gateway::Gateway;
pub use oauth_link::{LinkCompletion, LinkStart, OAuthLinkManager};
pub use refresh::{RefreshCoordinator, RefreshListener, RefreshOutcome};
pub use session::{Session, SessionListener};
pub use session_fsm::session_machine;
pub use session_fsm::{
    SessionMachine, SessionMachineInput, SessionMachineState, SessionState, SessionStateChanged,
    TransitionReason,
};
pub use token_endpoint::{HttpTokenEndpoint, LoginGrant, TokenEndpoint, TokenGrant};
pub use transport::{resolve_url, ApiRequest, ApiResponse, HttpTransport, Method, ReqwestTransport};
