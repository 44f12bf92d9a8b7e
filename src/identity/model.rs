use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Account role stored in the directory and declared by interactive login flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Doctor,
    Patient,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Doctor => "doctor",
            Role::Patient => "patient",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "doctor" => Ok(Role::Doctor),
            "patient" => Ok(Role::Patient),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Minimal identity returned by the authentication backend, before profile resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawIdentity {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl RawIdentity {
    pub fn new(id: impl Into<String>, email: Option<String>) -> Self { Self { id: id.into(), email } }
}

/// Durable user profile resolved from the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub email: String,
    pub role: Role,
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
}

/// Metadata passed along with sign-up so the directory record can be provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSeed {
    pub display_name: String,
    pub role: Role,
}

/// The single authoritative local session value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Anonymous,
    Authenticating(Option<Role>),
    ResolvingProfile(RawIdentity, Option<Role>),
    Authenticated(Profile),
    Failed(SessionError),
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool { matches!(self, SessionState::Authenticated(_)) }

    /// True while an explicit operation or a profile lookup is in flight.
    pub fn is_loading(&self) -> bool {
        matches!(self, SessionState::Authenticating(_) | SessionState::ResolvingProfile(..))
    }

    pub fn profile(&self) -> Option<&Profile> {
        match self {
            SessionState::Authenticated(p) => Some(p),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Anonymous => "anonymous",
            SessionState::Authenticating(_) => "authenticating",
            SessionState::ResolvingProfile(..) => "resolving_profile",
            SessionState::Authenticated(_) => "authenticated",
            SessionState::Failed(_) => "failed",
        }
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Anonymous => write!(f, "anonymous"),
            SessionState::Authenticating(Some(r)) => write!(f, "authenticating as {}", r),
            SessionState::Authenticating(None) => write!(f, "authenticating"),
            SessionState::ResolvingProfile(raw, _) => write!(f, "resolving profile for {}", raw.id),
            SessionState::Authenticated(p) => write!(f, "authenticated {} ({}, {})", p.display_name, p.role, p.id),
            SessionState::Failed(e) => write!(f, "failed: {}", e.code_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!("Doctor".parse::<Role>().unwrap(), Role::Doctor);
        assert_eq!(" patient ".parse::<Role>().unwrap(), Role::Patient);
        assert!("nurse".parse::<Role>().is_err());
    }

    #[test]
    fn role_serde_is_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Doctor).unwrap(), "\"doctor\"");
        let r: Role = serde_json::from_str("\"patient\"").unwrap();
        assert_eq!(r, Role::Patient);
    }

    #[test]
    fn state_helpers() {
        assert_eq!(SessionState::default(), SessionState::Anonymous);
        assert!(SessionState::Authenticating(Some(Role::Doctor)).is_loading());
        assert!(SessionState::ResolvingProfile(RawIdentity::new("u1", None), None).is_loading());
        let p = Profile { id: "u1".into(), email: "a@x.com".into(), role: Role::Patient, display_name: "A".into(), avatar_ref: None };
        let s = SessionState::Authenticated(p.clone());
        assert!(s.is_authenticated());
        assert_eq!(s.profile(), Some(&p));
        assert_eq!(SessionState::Failed(SessionError::ProfileMissing).label(), "failed");
    }
}
