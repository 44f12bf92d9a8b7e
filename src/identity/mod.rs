//! Client-side session synchronization: one authoritative session value fed by explicit
//! auth operations and the backend's session-change stream, gated on the account role.
//! Keep the public surface thin and split implementation across sub-modules.

mod model;
mod listeners;
mod store;
mod resolver;
mod guard;
mod gateway;
mod reconciler;
pub mod rest;
pub mod mock;

pub use model::{Role, RawIdentity, Profile, ProfileSeed, SessionState};
pub use listeners::{Listeners, Subscription};
pub use store::SessionStore;
pub use resolver::{Directory, DirectoryRecord, ProfileResolver};
pub use guard::RoleGuard;
pub use gateway::{AuthCallback, IdentityGateway};
pub use reconciler::{EventReconciler, OpKind, ReconcilerOptions, SessionHandle, SignupOutcome};
