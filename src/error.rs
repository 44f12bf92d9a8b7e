//! Session error model and mapping helpers.
//! `SessionError` is the classified taxonomy surfaced to callers of explicit operations;
//! `AuthError` and `DirectoryError` are what the external collaborators report.

use thiserror::Error;

use crate::identity::Role;

/// Classified failure of an explicit operation, also carried by `SessionState::Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Invalid email or password. Please check your credentials and try again.")]
    InvalidCredentials,
    #[error("Please confirm your email address before logging in.")]
    EmailUnconfirmed,
    #[error("User profile not found. Please contact support.")]
    ProfileMissing,
    #[error("Account role mismatch. This account is registered as {actual}, but you're trying to log in as {declared}.")]
    RoleMismatch { declared: Role, actual: Role },
    #[error("Network or directory failure: {0}")]
    NetworkOrDirectoryFailure(String),
    #[error("Login failed: {0}")]
    Unknown(String),
    /// The operation was overtaken by a newer session event and committed nothing.
    #[error("Operation superseded by a newer session event")]
    Superseded,
}

/// What the UI should offer for a given failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiHint {
    Retry,
    ContactSupport,
    FixInput,
    None,
}

impl SessionError {
    pub fn code_str(&self) -> &'static str {
        match self {
            SessionError::InvalidCredentials => "invalid_credentials",
            SessionError::EmailUnconfirmed => "email_unconfirmed",
            SessionError::ProfileMissing => "profile_missing",
            SessionError::RoleMismatch { .. } => "role_mismatch",
            SessionError::NetworkOrDirectoryFailure(_) => "network_or_directory_failure",
            SessionError::Unknown(_) => "unknown",
            SessionError::Superseded => "superseded",
        }
    }

    /// Map to the action a UI should offer.
    pub fn ui_hint(&self) -> UiHint {
        match self {
            SessionError::InvalidCredentials | SessionError::EmailUnconfirmed | SessionError::RoleMismatch { .. } => UiHint::FixInput,
            SessionError::ProfileMissing => UiHint::ContactSupport,
            SessionError::NetworkOrDirectoryFailure(_) | SessionError::Unknown(_) => UiHint::Retry,
            SessionError::Superseded => UiHint::None,
        }
    }

    pub fn is_retryable(&self) -> bool { self.ui_hint() == UiHint::Retry }

    /// Classify a gateway failure the way the backend words its messages.
    pub fn from_auth(err: &AuthError) -> Self {
        match err {
            AuthError::Transport(msg) => SessionError::NetworkOrDirectoryFailure(msg.clone()),
            AuthError::Rejected { message, .. } => {
                let lower = message.to_ascii_lowercase();
                if lower.contains("invalid login credentials") {
                    SessionError::InvalidCredentials
                } else if lower.contains("email not confirmed") {
                    SessionError::EmailUnconfirmed
                } else {
                    SessionError::Unknown(message.clone())
                }
            }
        }
    }
}

impl From<AuthError> for SessionError {
    fn from(err: AuthError) -> Self { SessionError::from_auth(&err) }
}

impl From<ResolveError> for SessionError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::ProfileMissing => SessionError::ProfileMissing,
            ResolveError::Directory(e) => SessionError::NetworkOrDirectoryFailure(e.to_string()),
        }
    }
}

/// Failure reported by the identity gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("auth rejected: {message}")]
    Rejected { status: Option<u16>, message: String },
    #[error("auth transport error: {0}")]
    Transport(String),
}

impl AuthError {
    pub fn rejected(message: impl Into<String>) -> Self { AuthError::Rejected { status: None, message: message.into() } }
}

/// Transient directory failure; safe to retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("directory error: {0}")]
pub struct DirectoryError(pub String);

/// Outcome of a failed profile resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no directory record for identity")]
    ProfileMissing,
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

pub type SessionResult<T> = Result<T, SessionError>;
