use async_trait::async_trait;

use crate::error::AuthError;

use super::listeners::Subscription;
use super::model::{ProfileSeed, RawIdentity};

/// Callback receiving every remote session change: `Some` when a session is (re)established,
/// `None` when it ends.
pub type AuthCallback = Box<dyn Fn(Option<RawIdentity>) + Send + Sync>;

/// The remote authentication backend.
///
/// Explicit operations may also push a notification through `subscribe_auth_events` as a side
/// effect, possibly before the call itself returns. Consumers must tolerate both orders.
#[async_trait]
pub trait IdentityGateway: Send + Sync {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<RawIdentity, AuthError>;

    /// Creates the account; the seed is stored as account metadata for directory provisioning.
    /// Success does not imply a session when the backend requires email confirmation.
    async fn sign_up_with_metadata(&self, email: &str, password: &str, seed: &ProfileSeed) -> Result<RawIdentity, AuthError>;

    /// Starts a browser-based flow. The outcome only ever arrives as a notification.
    async fn initiate_oauth(&self, provider: &str, redirect_target: &str) -> Result<(), AuthError>;

    async fn sign_out(&self) -> Result<(), AuthError>;

    /// Session known to the gateway right now; consulted once at startup.
    async fn current_session(&self) -> Result<Option<RawIdentity>, AuthError>;

    fn subscribe_auth_events(&self, callback: AuthCallback) -> Subscription;
}
