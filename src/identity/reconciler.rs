//! Single writer of the session state.
//!
//! Explicit operations (login, signup, OAuth kickoff, logout) and gateway notifications are
//! funneled through one ordered inbox and applied one at a time by a dedicated task. Every
//! state-altering event bumps a generation counter; profile resolutions run off-task and report
//! back with the generation they were started under, and anything older than the current
//! generation is dropped on arrival.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{AuthError, ResolveError, SessionError, SessionResult};

use super::gateway::IdentityGateway;
use super::guard::RoleGuard;
use super::listeners::Subscription;
use super::model::{Profile, ProfileSeed, RawIdentity, Role, SessionState};
use super::resolver::{Directory, ProfileResolver};
use super::store::SessionStore;

const TARGET: &str = "clinic::session";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    PasswordLogin,
    Signup,
    OAuth,
}

/// Result of a successful signup call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignupOutcome {
    /// The backend opened a session right away and the profile resolved.
    Authenticated(Profile),
    /// Account created; the session arrives later (typically after email confirmation).
    PendingConfirmation(RawIdentity),
}

/// OAuth parameters used by `login_with_oauth`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerOptions {
    pub oauth_provider: String,
    pub redirect_target: String,
    /// How long a started browser flow may hand its declared role to the next session
    /// notification. Past this the flow counts as abandoned.
    pub oauth_intent_ttl: Duration,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            oauth_provider: "google".to_string(),
            redirect_target: "clinic://auth/callback".to_string(),
            oauth_intent_ttl: Duration::from_secs(600),
        }
    }
}

enum Input {
    Begin { kind: OpKind, role: Option<Role>, ack: oneshot::Sender<u64> },
    LoginResult { op: u64, result: Result<RawIdentity, AuthError>, role: Role, reply: oneshot::Sender<SessionResult<Profile>> },
    SignupResult { op: u64, result: Result<RawIdentity, AuthError>, reply: oneshot::Sender<SessionResult<SignupOutcome>> },
    OAuthStarted { op: u64, result: Result<(), AuthError>, reply: oneshot::Sender<SessionResult<()>> },
    Notification(Option<RawIdentity>),
    Logout { ack: oneshot::Sender<bool> },
    Resolved { generation: u64, identity: RawIdentity, role: Option<Role>, outcome: Result<Profile, ResolveError> },
    Flush { ack: oneshot::Sender<()> },
    Shutdown,
}

impl Input {
    fn name(&self) -> &'static str {
        match self {
            Input::Begin { .. } => "begin",
            Input::LoginResult { .. } => "login_result",
            Input::SignupResult { .. } => "signup_result",
            Input::OAuthStarted { .. } => "oauth_started",
            Input::Notification(_) => "notification",
            Input::Logout { .. } => "logout",
            Input::Resolved { .. } => "resolved",
            Input::Flush { .. } => "flush",
            Input::Shutdown => "shutdown",
        }
    }
}

struct Envelope {
    seq: u64,
    input: Input,
}

/// Sending side of the inbox. Sequence tokens are assigned under the same lock as the send,
/// so channel order and token order agree.
#[derive(Clone)]
struct Inbox {
    tx: Arc<Mutex<mpsc::UnboundedSender<Envelope>>>,
    seq: Arc<AtomicU64>,
}

impl Inbox {
    fn post(&self, input: Input) -> bool {
        let tx = self.tx.lock();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        tx.send(Envelope { seq, input }).is_ok()
    }
}

/// Caller waiting on the resolution of the current generation.
enum Waiter {
    Login(oneshot::Sender<SessionResult<Profile>>),
    Signup(oneshot::Sender<SessionResult<SignupOutcome>>),
}

impl Waiter {
    fn settle(self, outcome: &SessionResult<Profile>) {
        match self {
            Waiter::Login(tx) => { let _ = tx.send(outcome.clone()); }
            Waiter::Signup(tx) => { let _ = tx.send(outcome.clone().map(SignupOutcome::Authenticated)); }
        }
    }

    fn supersede(self) { self.settle(&Err(SessionError::Superseded)); }
}

/// Explicit operation that has posted `Begin` and not yet been settled.
#[derive(Debug)]
struct Intent {
    op: u64,
    kind: OpKind,
    role: Option<Role>,
    /// Still waiting for the explicit call itself to return.
    awaiting_result: bool,
    /// Identity pushed by the gateway while the explicit call was in flight.
    observed: Option<RawIdentity>,
    started: Instant,
}

struct Reconciler {
    store: SessionStore,
    state: SessionState,
    gateway: Arc<dyn IdentityGateway>,
    resolver: Arc<ProfileResolver>,
    guard: RoleGuard,
    inbox: Inbox,
    generation: u64,
    intent: Option<Intent>,
    waiters: Vec<Waiter>,
    /// Identity refused locally whose remote session has not ended yet.
    rejected: Option<String>,
    /// Explicit calls abandoned by a logout, a session end or a newer operation while their
    /// gateway call was still running. Their side effects must not be adopted.
    orphans: HashSet<u64>,
    oauth_ttl: Duration,
}

impl Reconciler {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(env) = rx.recv().await {
            if matches!(env.input, Input::Shutdown) { break; }
            debug!(target: TARGET, "inbox seq={} input={} generation={}", env.seq, env.input.name(), self.generation);
            self.apply(env).await;
        }
        for w in self.waiters.drain(..) { w.supersede(); }
        debug!(target: TARGET, "reconciler stopped at generation={}", self.generation);
    }

    async fn apply(&mut self, env: Envelope) {
        match env.input {
            Input::Begin { kind, role, ack } => self.on_begin(env.seq, kind, role, ack),
            Input::LoginResult { op, result, role, reply } => {
                if !self.owns(op) {
                    self.on_orphan_result(op, result.ok()).await;
                    let _ = reply.send(Err(SessionError::Superseded));
                    return;
                }
                let intent = self.intent.take();
                match result {
                    Ok(raw) => self.start_resolution(raw, Some(role), Some(Waiter::Login(reply))),
                    Err(e) => {
                        let err = SessionError::from_auth(&e);
                        info!(target: TARGET, "login failed op={} kind={}", op, err.code_str());
                        self.bump();
                        self.fail(err.clone(), intent.and_then(|i| i.observed)).await;
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Input::SignupResult { op, result, reply } => {
                if !self.owns(op) {
                    self.on_orphan_result(op, result.ok()).await;
                    let _ = reply.send(Err(SessionError::Superseded));
                    return;
                }
                let observed = self.intent.take().and_then(|i| i.observed);
                match result {
                    Ok(raw) => match observed {
                        Some(seen) if seen.id == raw.id => self.start_resolution(seen, None, Some(Waiter::Signup(reply))),
                        _ => {
                            info!(target: TARGET, "signup created id={} awaiting session", raw.id);
                            self.bump();
                            self.commit(SessionState::Anonymous);
                            let _ = reply.send(Ok(SignupOutcome::PendingConfirmation(raw)));
                        }
                    },
                    Err(e) => {
                        let err = SessionError::from_auth(&e);
                        info!(target: TARGET, "signup failed op={} kind={}", op, err.code_str());
                        self.bump();
                        self.fail(err.clone(), observed).await;
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Input::OAuthStarted { op, result, reply } => {
                if !self.owns(op) {
                    self.orphans.remove(&op);
                    let _ = reply.send(Err(SessionError::Superseded));
                    return;
                }
                match result {
                    Ok(()) => {
                        let observed = self.intent.as_mut().and_then(|i| {
                            i.awaiting_result = false;
                            i.observed.take()
                        });
                        let _ = reply.send(Ok(()));
                        if let Some(raw) = observed { self.on_identity(raw); }
                    }
                    Err(e) => {
                        let observed = self.intent.take().and_then(|i| i.observed);
                        let err = SessionError::from_auth(&e);
                        info!(target: TARGET, "oauth kickoff failed op={} kind={}", op, err.code_str());
                        self.bump();
                        self.fail(err.clone(), observed).await;
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Input::Notification(Some(raw)) => self.on_identity(raw),
            Input::Notification(None) => self.on_session_ended(),
            Input::Logout { ack } => {
                // a refused identity whose corrective sign-out failed still holds a remote session
                let active = self.state != SessionState::Anonymous
                    || self.intent.is_some()
                    || !self.waiters.is_empty()
                    || self.rejected.is_some();
                self.abandon_intent();
                self.rejected = None;
                self.bump();
                if self.state != SessionState::Anonymous { self.commit(SessionState::Anonymous); }
                info!(target: TARGET, "logout seq={} active={}", env.seq, active);
                let _ = ack.send(active);
            }
            Input::Resolved { generation, identity, role, outcome } => self.on_resolved(generation, identity, role, outcome).await,
            Input::Flush { ack } => { let _ = ack.send(()); }
            Input::Shutdown => {}
        }
    }

    fn owns(&self, op: u64) -> bool {
        let live = matches!(&self.intent, Some(i) if i.op == op);
        if !live { debug!(target: TARGET, "explicit result op={} superseded", op); }
        live
    }

    fn on_begin(&mut self, seq: u64, kind: OpKind, role: Option<Role>, ack: oneshot::Sender<u64>) {
        self.bump();
        self.abandon_intent();
        // A fresh explicit attempt may legitimately target the identity refused earlier.
        self.rejected = None;
        self.intent = Some(Intent { op: seq, kind, role, awaiting_result: true, observed: None, started: Instant::now() });
        self.commit(SessionState::Authenticating(role));
        let _ = ack.send(seq);
    }

    fn on_identity(&mut self, raw: RawIdentity) {
        if let Some(intent) = self.intent.as_mut() {
            if intent.awaiting_result {
                debug!(target: TARGET, "deferring notification id={} until op={} ({:?}) returns", raw.id, intent.op, intent.kind);
                intent.observed = Some(raw);
                return;
            }
        }
        if !self.orphans.is_empty() {
            debug!(target: TARGET, "ignoring notification id={} while {} abandoned call(s) are outstanding", raw.id, self.orphans.len());
            return;
        }
        if self.rejected.as_deref() == Some(raw.id.as_str()) {
            debug!(target: TARGET, "ignoring notification for rejected id={}", raw.id);
            return;
        }
        match &self.state {
            SessionState::Authenticated(p) if p.id == raw.id => {
                debug!(target: TARGET, "duplicate notification for authenticated id={}", raw.id);
                return;
            }
            SessionState::ResolvingProfile(r, _) if r.id == raw.id => {
                debug!(target: TARGET, "duplicate notification for resolving id={}", raw.id);
                return;
            }
            _ => {}
        }
        // Only an OAuth intent survives to this point; it hands its declared role to the session it produced.
        let role = match self.intent.take() {
            Some(i) if i.started.elapsed() > self.oauth_ttl => {
                info!(target: TARGET, "oauth op={} abandoned; treating id={} as a passive session", i.op, raw.id);
                None
            }
            Some(i) => i.role,
            None => None,
        };
        self.start_resolution(raw, role, None);
    }

    /// Drop the live intent. One still waiting on its gateway call becomes an orphan.
    fn abandon_intent(&mut self) -> Option<Intent> {
        let intent = self.intent.take()?;
        if intent.awaiting_result {
            debug!(target: TARGET, "op={} ({:?}) abandoned mid-call", intent.op, intent.kind);
            self.orphans.insert(intent.op);
        }
        Some(intent)
    }

    /// Result of an abandoned call. A session it opened is not adopted: it is signed out,
    /// unless a newer local session or attempt now owns the gateway.
    async fn on_orphan_result(&mut self, op: u64, opened: Option<RawIdentity>) {
        self.orphans.remove(&op);
        let Some(raw) = opened else { return };
        let local = match &self.state {
            SessionState::Authenticated(p) => Some(p.id.clone()),
            SessionState::ResolvingProfile(r, _) => Some(r.id.clone()),
            _ => None,
        };
        if local.as_deref() == Some(raw.id.as_str()) { return; }
        self.rejected = Some(raw.id.clone());
        let newer = local.is_some() || self.intent.as_ref().is_some_and(|i| i.awaiting_result);
        if newer {
            warn!(target: TARGET, "abandoned op={} opened a session for id={} after a newer one took over", op, raw.id);
            return;
        }
        info!(target: TARGET, "corrective sign-out for id={} opened by abandoned op={}", raw.id, op);
        if let Err(e) = self.gateway.sign_out().await {
            warn!(target: TARGET, "corrective sign-out failed for id={}: {}", raw.id, e);
        }
    }

    fn on_session_ended(&mut self) {
        if let Some(i) = self.abandon_intent() {
            info!(target: TARGET, "remote session ended during op={} ({:?})", i.op, i.kind);
        }
        self.rejected = None;
        self.bump();
        if self.state != SessionState::Anonymous {
            info!(target: TARGET, "remote session ended; clearing local session");
            self.commit(SessionState::Anonymous);
        }
    }

    fn start_resolution(&mut self, raw: RawIdentity, role: Option<Role>, waiter: Option<Waiter>) {
        self.bump();
        self.commit(SessionState::ResolvingProfile(raw.clone(), role));
        if let Some(w) = waiter { self.waiters.push(w); }

        let generation = self.generation;
        let resolver = self.resolver.clone();
        let inbox = self.inbox.clone();
        debug!(target: TARGET, "resolving id={} generation={} role={:?}", raw.id, generation, role);
        tokio::spawn(async move {
            let outcome = resolver.resolve(&raw).await;
            inbox.post(Input::Resolved { generation, identity: raw, role, outcome });
        });
    }

    async fn on_resolved(&mut self, generation: u64, identity: RawIdentity, role: Option<Role>, outcome: Result<Profile, ResolveError>) {
        if generation != self.generation {
            debug!(target: TARGET, "discarding stale resolution id={} generation={} current={}", identity.id, generation, self.generation);
            return;
        }
        let verdict = outcome.map_err(SessionError::from).and_then(|p| self.guard.check(p, role));
        match &verdict {
            Ok(profile) => {
                info!(target: TARGET, "authenticated id={} role={}", profile.id, profile.role);
                self.commit(SessionState::Authenticated(profile.clone()));
            }
            Err(err) => {
                warn!(target: TARGET, "rejecting id={} reason={}", identity.id, err.code_str());
                self.rejected = Some(identity.id.clone());
                self.fail(err.clone(), Some(identity)).await;
            }
        }
        for w in self.waiters.drain(..) { w.settle(&verdict); }
    }

    /// Commit `Failed` then `Anonymous`. When a remote session is known to exist for the
    /// attempt, request a best-effort sign-out before settling.
    async fn fail(&mut self, err: SessionError, remote: Option<RawIdentity>) {
        self.commit(SessionState::Failed(err));
        if let Some(raw) = remote {
            info!(target: TARGET, "corrective sign-out for id={}", raw.id);
            if let Err(e) = self.gateway.sign_out().await {
                warn!(target: TARGET, "corrective sign-out failed for id={}: {}", raw.id, e);
            }
        }
        self.commit(SessionState::Anonymous);
    }

    fn bump(&mut self) {
        self.generation += 1;
        for w in self.waiters.drain(..) { w.supersede(); }
    }

    fn commit(&mut self, next: SessionState) {
        self.state = next.clone();
        self.store.commit(next);
    }
}

struct HandleInner {
    store: SessionStore,
    gateway: Arc<dyn IdentityGateway>,
    resolver: Arc<ProfileResolver>,
    inbox: Inbox,
    options: ReconcilerOptions,
    gateway_sub: Mutex<Option<Subscription>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// UI-facing entry points plus read access to the session store.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<HandleInner>,
}

/// Builder/entry point for the session core.
pub struct EventReconciler;

impl EventReconciler {
    /// Subscribe to the gateway, seed from its current session and start the reconciler task.
    pub async fn start(gateway: Arc<dyn IdentityGateway>, directory: Arc<dyn Directory>, options: ReconcilerOptions) -> SessionHandle {
        let store = SessionStore::new();
        let resolver = Arc::new(ProfileResolver::new(directory));
        let (tx, rx) = mpsc::unbounded_channel();
        let inbox = Inbox { tx: Arc::new(Mutex::new(tx)), seq: Arc::new(AtomicU64::new(0)) };

        let reconciler = Reconciler {
            store: store.clone(),
            state: SessionState::Anonymous,
            gateway: gateway.clone(),
            resolver: resolver.clone(),
            guard: RoleGuard,
            inbox: inbox.clone(),
            generation: 0,
            intent: None,
            waiters: Vec::new(),
            rejected: None,
            orphans: HashSet::new(),
            oauth_ttl: options.oauth_intent_ttl,
        };
        let task = tokio::spawn(reconciler.run(rx));

        let sub = {
            let inbox = inbox.clone();
            gateway.subscribe_auth_events(Box::new(move |ev| { inbox.post(Input::Notification(ev)); }))
        };

        match gateway.current_session().await {
            Ok(Some(raw)) => {
                info!(target: TARGET, "restoring session id={}", raw.id);
                inbox.post(Input::Notification(Some(raw)));
            }
            Ok(None) => {}
            Err(e) => warn!(target: TARGET, "could not read current session at startup: {}", e),
        }

        SessionHandle {
            inner: Arc::new(HandleInner {
                store,
                gateway,
                resolver,
                inbox,
                options,
                gateway_sub: Mutex::new(Some(sub)),
                task: Mutex::new(Some(task)),
            }),
        }
    }
}

fn stopped() -> SessionError { SessionError::Unknown("session reconciler stopped".to_string()) }

impl SessionHandle {
    pub fn store(&self) -> &SessionStore { &self.inner.store }

    pub fn current(&self) -> SessionState { self.inner.store.current() }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SessionState) + Send + Sync + 'static,
    {
        self.inner.store.subscribe(listener)
    }

    pub fn resolver(&self) -> &Arc<ProfileResolver> { &self.inner.resolver }

    /// Wait until the committed state satisfies `pred`.
    pub async fn wait_for<F>(&self, pred: F) -> SessionState
    where
        F: Fn(&SessionState) -> bool,
    {
        let mut rx = self.inner.store.watch();
        let out = match rx.wait_for(|s| pred(s)).await {
            Ok(s) => s.clone(),
            Err(_) => self.current(),
        };
        out
    }

    async fn begin(&self, kind: OpKind, role: Option<Role>) -> SessionResult<u64> {
        let (ack, rx) = oneshot::channel();
        if !self.inner.inbox.post(Input::Begin { kind, role, ack }) { return Err(stopped()); }
        rx.await.map_err(|_| stopped())
    }

    pub async fn login(&self, email: &str, password: &str, role: Role) -> SessionResult<Profile> {
        let op = self.begin(OpKind::PasswordLogin, Some(role)).await?;
        info!(target: TARGET, "login op={} email={} role={}", op, email, role);
        let result = self.inner.gateway.sign_in_with_password(email, password).await;
        let (reply, rx) = oneshot::channel();
        if !self.inner.inbox.post(Input::LoginResult { op, result, role, reply }) { return Err(stopped()); }
        rx.await.unwrap_or_else(|_| Err(stopped()))
    }

    pub async fn signup(&self, email: &str, password: &str, display_name: &str, role: Role) -> SessionResult<SignupOutcome> {
        let op = self.begin(OpKind::Signup, None).await?;
        info!(target: TARGET, "signup op={} email={} role={}", op, email, role);
        let seed = ProfileSeed { display_name: display_name.to_string(), role };
        let result = self.inner.gateway.sign_up_with_metadata(email, password, &seed).await;
        if let Ok(raw) = &result {
            if let Err(e) = self.inner.resolver.directory().provision(&raw.id, &seed).await {
                warn!(target: TARGET, "profile provisioning failed for id={}; signup continues: {}", raw.id, e);
            }
        }
        let (reply, rx) = oneshot::channel();
        if !self.inner.inbox.post(Input::SignupResult { op, result, reply }) { return Err(stopped()); }
        rx.await.unwrap_or_else(|_| Err(stopped()))
    }

    /// Start the browser flow. Returns once the kickoff call completes; the session itself
    /// arrives through the gateway's notification stream and is gated on `role`.
    pub async fn login_with_oauth(&self, role: Role) -> SessionResult<()> {
        let op = self.begin(OpKind::OAuth, Some(role)).await?;
        let opts = &self.inner.options;
        info!(target: TARGET, "oauth op={} provider={} role={}", op, opts.oauth_provider, role);
        let result = self.inner.gateway.initiate_oauth(&opts.oauth_provider, &opts.redirect_target).await;
        let (reply, rx) = oneshot::channel();
        if !self.inner.inbox.post(Input::OAuthStarted { op, result, reply }) { return Err(stopped()); }
        rx.await.unwrap_or_else(|_| Err(stopped()))
    }

    /// Clears the local session first, then asks the backend to end the remote one.
    /// A failing remote sign-out is logged and never surfaces; logging out while already
    /// anonymous does nothing.
    pub async fn logout(&self) -> SessionResult<()> {
        let (ack, rx) = oneshot::channel();
        if !self.inner.inbox.post(Input::Logout { ack }) { return Ok(()); }
        let active = rx.await.unwrap_or(false);
        if active {
            if let Err(e) = self.inner.gateway.sign_out().await {
                warn!(target: TARGET, "remote sign-out failed; local session already cleared: {}", e);
            }
        }
        Ok(())
    }

    /// Returns once every input posted before this call has been applied. Resolutions still
    /// running in the background are not waited for.
    pub async fn flush(&self) {
        let (ack, rx) = oneshot::channel();
        if self.inner.inbox.post(Input::Flush { ack }) { let _ = rx.await; }
    }

    /// Drop the gateway subscription and stop the reconciler task.
    pub async fn shutdown(&self) {
        if let Some(sub) = self.inner.gateway_sub.lock().take() { sub.unsubscribe(); }
        self.inner.inbox.post(Input::Shutdown);
        let task = self.inner.task.lock().take();
        if let Some(t) = task {
            let _ = t.await;
        }
    }
}

#[cfg(test)]
#[path = "reconciler_tests.rs"]
mod reconciler_tests;
