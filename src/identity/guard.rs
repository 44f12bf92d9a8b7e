use crate::error::SessionError;

use super::model::{Profile, Role};

/// Gate applied to a resolved profile before it may become the authenticated session.
/// Stateless; passive restores carry no declared role and always pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoleGuard;

impl RoleGuard {
    pub fn check(&self, profile: Profile, intended: Option<Role>) -> Result<Profile, SessionError> {
        let Some(declared) = intended else { return Ok(profile); };
        if profile.role == declared {
            Ok(profile)
        } else {
            Err(SessionError::RoleMismatch { declared, actual: profile.role })
        }
    }
}
