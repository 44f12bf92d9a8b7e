//! In-memory gateway and directory doubles for exercising the session core without a backend.
//!
//! - `MockGateway`: password accounts, signup with optional confirmation, per-email sign-in
//!   gates, OAuth kickoff recording, sign-out counting and failure injection, manual
//!   notification push.
//! - `MockDirectory`: profile records, failure injection, per-id lookup gates and a lookup
//!   counter used to verify single-flight behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{AuthError, DirectoryError};

use super::gateway::{AuthCallback, IdentityGateway};
use super::listeners::{Listeners, Subscription};
use super::model::{ProfileSeed, RawIdentity};
use super::resolver::{Directory, DirectoryRecord};

#[derive(Debug, Clone)]
struct MockAccount {
    password: String,
    identity: RawIdentity,
    confirmed: bool,
}

pub struct MockGateway {
    listeners: Listeners<Option<RawIdentity>>,
    accounts: Mutex<HashMap<String, MockAccount>>,
    session: Mutex<Option<RawIdentity>>,
    /// Push a notification as a side effect of sign-in/sign-up/sign-out, like the hosted SDK does.
    emit_on_auth: AtomicBool,
    require_confirmation: AtomicBool,
    transport_down: AtomicBool,
    sign_out_calls: AtomicUsize,
    sign_out_error: Mutex<Option<AuthError>>,
    oauth_requests: Mutex<Vec<(String, String)>>,
    oauth_error: Mutex<Option<AuthError>>,
    signups: Mutex<Vec<(String, ProfileSeed)>>,
    sign_in_gates: Mutex<HashMap<String, watch::Sender<bool>>>,
    sign_ins: watch::Sender<usize>,
}

impl Default for MockGateway {
    fn default() -> Self { Self::new() }
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            listeners: Listeners::new(),
            accounts: Mutex::new(HashMap::new()),
            session: Mutex::new(None),
            emit_on_auth: AtomicBool::new(true),
            require_confirmation: AtomicBool::new(false),
            transport_down: AtomicBool::new(false),
            sign_out_calls: AtomicUsize::new(0),
            sign_out_error: Mutex::new(None),
            oauth_requests: Mutex::new(Vec::new()),
            oauth_error: Mutex::new(None),
            signups: Mutex::new(Vec::new()),
            sign_in_gates: Mutex::new(HashMap::new()),
            sign_ins: watch::channel(0).0,
        }
    }

    pub fn add_account(&self, email: &str, password: &str, identity_id: &str) -> RawIdentity {
        let identity = RawIdentity::new(identity_id, Some(email.to_string()));
        self.accounts.lock().insert(
            email.to_ascii_lowercase(),
            MockAccount { password: password.to_string(), identity: identity.clone(), confirmed: true },
        );
        identity
    }

    pub fn confirm_email(&self, email: &str) {
        if let Some(acc) = self.accounts.lock().get_mut(&email.to_ascii_lowercase()) { acc.confirmed = true; }
    }

    pub fn set_emit_on_auth(&self, on: bool) { self.emit_on_auth.store(on, Ordering::SeqCst); }
    pub fn set_require_confirmation(&self, on: bool) { self.require_confirmation.store(on, Ordering::SeqCst); }
    pub fn set_transport_down(&self, down: bool) { self.transport_down.store(down, Ordering::SeqCst); }
    pub fn fail_sign_out(&self, err: Option<AuthError>) { *self.sign_out_error.lock() = err; }
    pub fn fail_oauth(&self, err: Option<AuthError>) { *self.oauth_error.lock() = err; }

    /// Seed the remote session without notifying, as if restored before the app started.
    pub fn set_session(&self, identity: Option<RawIdentity>) { *self.session.lock() = identity; }

    /// Change the remote session and push the notification.
    pub fn push(&self, identity: Option<RawIdentity>) {
        *self.session.lock() = identity.clone();
        self.listeners.emit(&identity);
    }

    pub fn session(&self) -> Option<RawIdentity> { self.session.lock().clone() }
    pub fn sign_out_count(&self) -> usize { self.sign_out_calls.load(Ordering::SeqCst) }
    pub fn oauth_requests(&self) -> Vec<(String, String)> { self.oauth_requests.lock().clone() }
    pub fn signups(&self) -> Vec<(String, ProfileSeed)> { self.signups.lock().clone() }
    pub fn subscriber_count(&self) -> usize { self.listeners.len() }

    /// Password sign-ins for `email` stall inside the call until `release_sign_in(email)`.
    pub fn hold_sign_in(&self, email: &str) {
        self.sign_in_gates.lock().insert(email.to_ascii_lowercase(), watch::channel(false).0);
    }

    pub fn release_sign_in(&self, email: &str) {
        if let Some(gate) = self.sign_in_gates.lock().remove(&email.to_ascii_lowercase()) { gate.send_replace(true); }
    }

    /// Resolves once at least `n` password sign-ins have started.
    pub async fn wait_for_sign_ins(&self, n: usize) {
        let mut rx = self.sign_ins.subscribe();
        let _ = rx.wait_for(|c| *c >= n).await;
    }

    fn check_transport(&self) -> Result<(), AuthError> {
        if self.transport_down.load(Ordering::SeqCst) {
            return Err(AuthError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    fn open_session(&self, identity: &RawIdentity) {
        *self.session.lock() = Some(identity.clone());
        if self.emit_on_auth.load(Ordering::SeqCst) {
            self.listeners.emit(&Some(identity.clone()));
        }
    }
}

#[async_trait]
impl IdentityGateway for MockGateway {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<RawIdentity, AuthError> {
        let key = email.to_ascii_lowercase();
        self.sign_ins.send_modify(|c| *c += 1);
        let gate = self.sign_in_gates.lock().get(&key).map(|g| g.subscribe());
        if let Some(mut rx) = gate {
            let _ = rx.wait_for(|open| *open).await;
        }
        self.check_transport()?;
        let acc = self.accounts.lock().get(&key).cloned();
        let Some(acc) = acc else { return Err(AuthError::Rejected { status: Some(400), message: "Invalid login credentials".into() }); };
        if acc.password != password {
            return Err(AuthError::Rejected { status: Some(400), message: "Invalid login credentials".into() });
        }
        if !acc.confirmed {
            return Err(AuthError::Rejected { status: Some(400), message: "Email not confirmed".into() });
        }
        self.open_session(&acc.identity);
        Ok(acc.identity)
    }

    async fn sign_up_with_metadata(&self, email: &str, password: &str, seed: &ProfileSeed) -> Result<RawIdentity, AuthError> {
        self.check_transport()?;
        let key = email.to_ascii_lowercase();
        if self.accounts.lock().contains_key(&key) {
            return Err(AuthError::Rejected { status: Some(422), message: "User already registered".into() });
        }
        let confirmed = !self.require_confirmation.load(Ordering::SeqCst);
        let identity = RawIdentity::new(uuid::Uuid::new_v4().to_string(), Some(email.to_string()));
        self.accounts.lock().insert(key, MockAccount { password: password.to_string(), identity: identity.clone(), confirmed });
        self.signups.lock().push((identity.id.clone(), seed.clone()));
        if confirmed { self.open_session(&identity); }
        Ok(identity)
    }

    async fn initiate_oauth(&self, provider: &str, redirect_target: &str) -> Result<(), AuthError> {
        self.check_transport()?;
        self.oauth_requests.lock().push((provider.to_string(), redirect_target.to_string()));
        match self.oauth_error.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.sign_out_error.lock().clone() { return Err(e); }
        *self.session.lock() = None;
        if self.emit_on_auth.load(Ordering::SeqCst) { self.listeners.emit(&None); }
        Ok(())
    }

    async fn current_session(&self) -> Result<Option<RawIdentity>, AuthError> {
        self.check_transport()?;
        Ok(self.session.lock().clone())
    }

    fn subscribe_auth_events(&self, callback: AuthCallback) -> Subscription {
        self.listeners.add(move |ev: &Option<RawIdentity>| callback(ev.clone()))
    }
}

pub struct MockDirectory {
    records: Mutex<HashMap<String, DirectoryRecord>>,
    failures: Mutex<HashMap<String, String>>,
    gates: Mutex<HashMap<String, watch::Sender<bool>>>,
    lookups: watch::Sender<usize>,
    lookups_by_id: Mutex<HashMap<String, usize>>,
    provisioned: Mutex<Vec<(String, ProfileSeed)>>,
    /// Create a record from the signup seed when `provision` is called.
    auto_provision: AtomicBool,
    provision_error: Mutex<Option<DirectoryError>>,
}

impl Default for MockDirectory {
    fn default() -> Self { Self::new() }
}

impl MockDirectory {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            lookups: watch::channel(0).0,
            lookups_by_id: Mutex::new(HashMap::new()),
            provisioned: Mutex::new(Vec::new()),
            auto_provision: AtomicBool::new(true),
            provision_error: Mutex::new(None),
        }
    }

    pub fn insert(&self, record: DirectoryRecord) { self.records.lock().insert(record.id.clone(), record); }

    pub fn remove(&self, id: &str) { self.records.lock().remove(id); }

    pub fn fail_lookup(&self, id: &str, message: &str) { self.failures.lock().insert(id.to_string(), message.to_string()); }

    pub fn clear_failure(&self, id: &str) { self.failures.lock().remove(id); }

    pub fn set_auto_provision(&self, on: bool) { self.auto_provision.store(on, Ordering::SeqCst); }

    pub fn fail_provision(&self, err: Option<DirectoryError>) { *self.provision_error.lock() = err; }

    /// Lookups for `id` block until `release(id)`.
    pub fn hold(&self, id: &str) { self.gates.lock().insert(id.to_string(), watch::channel(false).0); }

    pub fn release(&self, id: &str) {
        if let Some(gate) = self.gates.lock().remove(id) { gate.send_replace(true); }
    }

    pub fn lookup_count(&self) -> usize { *self.lookups.borrow() }

    pub fn lookups_for(&self, id: &str) -> usize { self.lookups_by_id.lock().get(id).copied().unwrap_or(0) }

    pub fn provisioned(&self) -> Vec<(String, ProfileSeed)> { self.provisioned.lock().clone() }

    /// Resolves once at least `n` lookups have started.
    pub async fn wait_for_lookups(&self, n: usize) {
        let mut rx = self.lookups.subscribe();
        let _ = rx.wait_for(|c| *c >= n).await;
    }
}

#[async_trait]
impl Directory for MockDirectory {
    async fn lookup_profile(&self, identity_id: &str) -> Result<Option<DirectoryRecord>, DirectoryError> {
        *self.lookups_by_id.lock().entry(identity_id.to_string()).or_insert(0) += 1;
        self.lookups.send_modify(|c| *c += 1);

        let gate = self.gates.lock().get(identity_id).map(|g| g.subscribe());
        if let Some(mut rx) = gate {
            let _ = rx.wait_for(|open| *open).await;
        }

        if let Some(msg) = self.failures.lock().get(identity_id).cloned() {
            return Err(DirectoryError(msg));
        }
        Ok(self.records.lock().get(identity_id).cloned())
    }

    async fn provision(&self, identity_id: &str, seed: &ProfileSeed) -> Result<(), DirectoryError> {
        if let Some(e) = self.provision_error.lock().clone() { return Err(e); }
        self.provisioned.lock().push((identity_id.to_string(), seed.clone()));
        if self.auto_provision.load(Ordering::SeqCst) {
            self.insert(DirectoryRecord {
                id: identity_id.to_string(),
                name: Some(seed.display_name.clone()),
                avatar: None,
                email: None,
                role: seed.role,
            });
        }
        Ok(())
    }
}

/// Shared handles for wiring both doubles into the reconciler and keeping them for assertions.
pub fn mock_pair() -> (Arc<MockGateway>, Arc<MockDirectory>) {
    (Arc::new(MockGateway::new()), Arc::new(MockDirectory::new()))
}
