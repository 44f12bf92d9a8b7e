use std::time::Duration;

use super::*;
use crate::identity::mock::{MockDirectory, MockGateway};
use crate::identity::DirectoryRecord;

type History = Arc<Mutex<Vec<SessionState>>>;

struct Rig {
    handle: SessionHandle,
    gateway: Arc<MockGateway>,
    directory: Arc<MockDirectory>,
    history: History,
}

fn record(id: &str, role: Role, name: &str) -> DirectoryRecord {
    DirectoryRecord { id: id.into(), name: Some(name.into()), avatar: None, email: None, role }
}

async fn rig_with(gateway: Arc<MockGateway>, directory: Arc<MockDirectory>) -> Rig {
    rig_with_options(gateway, directory, ReconcilerOptions::default()).await
}

async fn rig_with_options(gateway: Arc<MockGateway>, directory: Arc<MockDirectory>, options: ReconcilerOptions) -> Rig {
    let handle = EventReconciler::start(gateway.clone(), directory.clone(), options).await;
    let history: History = Arc::new(Mutex::new(Vec::new()));
    let _sub = { let h = history.clone(); handle.subscribe(move |s| h.lock().push(s.clone())) };
    Rig { handle, gateway, directory, history }
}

async fn rig() -> Rig { rig_with(Arc::new(MockGateway::new()), Arc::new(MockDirectory::new())).await }

/// Let background resolutions report back, then drain the inbox.
async fn settle(h: &SessionHandle) {
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.flush().await;
}

async fn wait(h: &SessionHandle, pred: impl Fn(&SessionState) -> bool) -> SessionState {
    tokio::time::timeout(Duration::from_secs(5), h.wait_for(pred)).await.expect("state not reached")
}

fn labels(h: &History) -> Vec<&'static str> { h.lock().iter().map(|s| s.label()).collect() }

#[tokio::test]
async fn login_absorbs_side_effect_notification() {
    let r = rig().await;
    let raw = r.gateway.add_account("a@x.com", "pw", "u1");
    r.directory.insert(record("u1", Role::Patient, "A"));

    let p = r.handle.login("a@x.com", "pw", Role::Patient).await.unwrap();
    assert_eq!(p.id, "u1");
    assert_eq!(r.directory.lookup_count(), 1);
    assert_eq!(
        *r.history.lock(),
        vec![
            SessionState::Authenticating(Some(Role::Patient)),
            SessionState::ResolvingProfile(raw, Some(Role::Patient)),
            SessionState::Authenticated(p.clone()),
        ]
    );

    // the backend re-announcing the same session changes nothing
    r.gateway.push(Some(RawIdentity::new("u1", Some("a@x.com".into()))));
    r.handle.flush().await;
    assert_eq!(r.history.lock().len(), 3);
    assert_eq!(r.directory.lookup_count(), 1);
}

#[tokio::test]
async fn late_notification_after_explicit_result_is_a_duplicate() {
    let r = rig().await;
    r.gateway.set_emit_on_auth(false);
    r.gateway.add_account("a@x.com", "pw", "u1");
    r.directory.insert(record("u1", Role::Doctor, "Dr A"));

    r.handle.login("a@x.com", "pw", Role::Doctor).await.unwrap();
    r.gateway.push(Some(RawIdentity::new("u1", None)));
    settle(&r.handle).await;
    assert_eq!(labels(&r.history), vec!["authenticating", "resolving_profile", "authenticated"]);
    assert_eq!(r.directory.lookup_count(), 1);
}

#[tokio::test]
async fn bad_credentials_fail_without_remote_cleanup() {
    let r = rig().await;
    r.gateway.add_account("a@x.com", "pw", "u1");

    let err = r.handle.login("a@x.com", "nope", Role::Patient).await.unwrap_err();
    assert_eq!(err, SessionError::InvalidCredentials);
    assert_eq!(
        *r.history.lock(),
        vec![
            SessionState::Authenticating(Some(Role::Patient)),
            SessionState::Failed(SessionError::InvalidCredentials),
            SessionState::Anonymous,
        ]
    );
    assert_eq!(r.gateway.sign_out_count(), 0);
    assert_eq!(r.directory.lookup_count(), 0);
}

#[tokio::test]
async fn unconfirmed_email_and_transport_errors_are_classified() {
    let r = rig().await;
    r.gateway.set_require_confirmation(true);
    let out = r.handle.signup("b@x.com", "pw", "B", Role::Patient).await.unwrap();
    assert!(matches!(out, SignupOutcome::PendingConfirmation(_)));

    let err = r.handle.login("b@x.com", "pw", Role::Patient).await.unwrap_err();
    assert_eq!(err, SessionError::EmailUnconfirmed);

    r.gateway.set_transport_down(true);
    let err = r.handle.login("b@x.com", "pw", Role::Patient).await.unwrap_err();
    assert!(matches!(err, SessionError::NetworkOrDirectoryFailure(_)));
    assert!(err.is_retryable());
    assert_eq!(r.handle.current(), SessionState::Anonymous);

    // once confirmed, the record provisioned at signup is found
    r.gateway.set_transport_down(false);
    r.gateway.confirm_email("b@x.com");
    let p = r.handle.login("b@x.com", "pw", Role::Patient).await.unwrap();
    assert_eq!(p.display_name, "B");
}

#[tokio::test]
async fn directory_failure_signs_out_and_is_not_retried() {
    let r = rig().await;
    r.gateway.add_account("a@x.com", "pw", "u1");
    r.directory.insert(record("u1", Role::Patient, "A"));
    r.directory.fail_lookup("u1", "503 from directory");

    let err = r.handle.login("a@x.com", "pw", Role::Patient).await.unwrap_err();
    assert!(matches!(err, SessionError::NetworkOrDirectoryFailure(_)));
    assert_eq!(r.gateway.sign_out_count(), 1);
    assert_eq!(r.directory.lookup_count(), 1);
    settle(&r.handle).await;
    assert_eq!(r.handle.current(), SessionState::Anonymous);

    // caller-driven retry succeeds once the directory recovers
    r.directory.clear_failure("u1");
    let p = r.handle.login("a@x.com", "pw", Role::Patient).await.unwrap();
    assert_eq!(p.display_name, "A");
}

#[tokio::test]
async fn startup_restores_existing_session_without_role_gate() {
    let gateway = Arc::new(MockGateway::new());
    let directory = Arc::new(MockDirectory::new());
    gateway.set_session(Some(RawIdentity::new("u9", Some("doc@x.com".into()))));
    directory.insert(record("u9", Role::Doctor, "Dr Nine"));

    let r = rig_with(gateway, directory).await;
    let s = wait(&r.handle, |s| s.is_authenticated()).await;
    let p = s.profile().unwrap();
    assert_eq!(p.role, Role::Doctor);
    assert_eq!(p.email, "doc@x.com");
    assert_eq!(r.gateway.subscriber_count(), 1);
}

#[tokio::test]
async fn startup_with_half_provisioned_account_signs_out() {
    let gateway = Arc::new(MockGateway::new());
    gateway.set_session(Some(RawIdentity::new("ghost", None)));
    let r = rig_with(gateway, Arc::new(MockDirectory::new())).await;

    settle(&r.handle).await;
    settle(&r.handle).await;
    assert_eq!(r.gateway.sign_out_count(), 1);
    assert_eq!(r.gateway.session(), None);
    assert_eq!(r.handle.current(), SessionState::Anonymous);
    assert!(r.history.lock().contains(&SessionState::Failed(SessionError::ProfileMissing)));
}

#[tokio::test]
async fn oauth_session_inherits_declared_role() {
    let r = rig().await;
    r.directory.insert(record("g1", Role::Doctor, "Dr G"));

    r.handle.login_with_oauth(Role::Doctor).await.unwrap();
    assert_eq!(r.handle.current(), SessionState::Authenticating(Some(Role::Doctor)));
    assert_eq!(r.gateway.oauth_requests(), vec![("google".to_string(), "clinic://auth/callback".to_string())]);

    r.gateway.push(Some(RawIdentity::new("g1", Some("g@x.com".into()))));
    let s = wait(&r.handle, |s| !s.is_loading()).await;
    assert_eq!(s.profile().map(|p| p.id.as_str()), Some("g1"));
    assert!(r.history.lock().contains(&SessionState::ResolvingProfile(RawIdentity::new("g1", Some("g@x.com".into())), Some(Role::Doctor))));
}

#[tokio::test]
async fn oauth_session_with_wrong_role_is_rejected() {
    let r = rig().await;
    r.directory.insert(record("g2", Role::Patient, "P"));

    r.handle.login_with_oauth(Role::Doctor).await.unwrap();
    r.gateway.push(Some(RawIdentity::new("g2", None)));
    let s = wait(&r.handle, |s| *s == SessionState::Anonymous).await;
    assert_eq!(s, SessionState::Anonymous);
    settle(&r.handle).await;

    assert_eq!(r.gateway.sign_out_count(), 1);
    assert!(r.history.lock().iter().all(|s| !s.is_authenticated()));
    assert!(r.history.lock().contains(&SessionState::Failed(SessionError::RoleMismatch { declared: Role::Doctor, actual: Role::Patient })));
}

#[tokio::test]
async fn oauth_kickoff_failure_surfaces() {
    let r = rig().await;
    r.gateway.fail_oauth(Some(AuthError::rejected("provider is not enabled")));
    let err = r.handle.login_with_oauth(Role::Patient).await.unwrap_err();
    assert_eq!(err, SessionError::Unknown("provider is not enabled".into()));
    assert_eq!(labels(&r.history), vec!["authenticating", "failed", "anonymous"]);
}

#[tokio::test]
async fn signup_with_immediate_session_authenticates() {
    let r = rig().await;
    let out = r.handle.signup("new@x.com", "pw", "Newbie", Role::Doctor).await.unwrap();
    let SignupOutcome::Authenticated(p) = out else { panic!("expected a session") };
    assert_eq!(p.role, Role::Doctor);
    assert_eq!(p.display_name, "Newbie");
    assert_eq!(p.email, "new@x.com");
    assert_eq!(r.directory.provisioned().len(), 1);
    assert_eq!(r.gateway.signups()[0].1, ProfileSeed { display_name: "Newbie".into(), role: Role::Doctor });
}

#[tokio::test]
async fn signup_awaiting_confirmation_settles_anonymous_even_if_provisioning_fails() {
    let r = rig().await;
    r.gateway.set_require_confirmation(true);
    r.directory.fail_provision(Some(crate::error::DirectoryError("rpc missing".into())));

    let out = r.handle.signup("c@x.com", "pw", "C", Role::Patient).await.unwrap();
    let SignupOutcome::PendingConfirmation(raw) = out else { panic!("expected pending confirmation") };
    assert_eq!(raw.email.as_deref(), Some("c@x.com"));
    assert_eq!(r.handle.current(), SessionState::Anonymous);
    assert!(r.directory.provisioned().is_empty());
}

#[tokio::test]
async fn duplicate_signup_is_reported() {
    let r = rig().await;
    r.gateway.add_account("a@x.com", "pw", "u1");
    let err = r.handle.signup("a@x.com", "pw", "A", Role::Patient).await.unwrap_err();
    assert_eq!(err, SessionError::Unknown("User already registered".into()));
    assert_eq!(r.handle.current(), SessionState::Anonymous);
}

#[tokio::test]
async fn rejected_identity_is_ignored_until_remote_session_ends() {
    let r = rig().await;
    r.gateway.add_account("a@x.com", "pw", "u1");
    r.directory.insert(record("u1", Role::Patient, "A"));
    r.gateway.fail_sign_out(Some(AuthError::Transport("offline".into())));

    let err = r.handle.login("a@x.com", "pw", Role::Doctor).await.unwrap_err();
    assert!(matches!(err, SessionError::RoleMismatch { .. }));
    assert_eq!(r.gateway.sign_out_count(), 1);

    // remote session survived the failed cleanup; its refresh must not sneak in
    r.gateway.push(Some(RawIdentity::new("u1", None)));
    settle(&r.handle).await;
    assert_eq!(r.handle.current(), SessionState::Anonymous);
    assert_eq!(r.directory.lookup_count(), 1);

    // logging out still ends the surviving remote session
    r.gateway.fail_sign_out(None);
    r.handle.logout().await.unwrap();
    assert_eq!(r.gateway.sign_out_count(), 2);
    assert_eq!(r.gateway.session(), None);

    r.gateway.push(Some(RawIdentity::new("u1", None)));
    let s = wait(&r.handle, |s| s.is_authenticated()).await;
    assert_eq!(s.profile().unwrap().role, Role::Patient);
}

#[tokio::test]
async fn logout_mid_resolution_supersedes_login() {
    let r = rig().await;
    r.gateway.add_account("a@x.com", "pw", "u1");
    r.directory.insert(record("u1", Role::Patient, "A"));
    r.directory.hold("u1");

    let login = { let h = r.handle.clone(); tokio::spawn(async move { h.login("a@x.com", "pw", Role::Patient).await }) };
    r.directory.wait_for_lookups(1).await;
    r.handle.logout().await.unwrap();
    assert_eq!(login.await.unwrap(), Err(SessionError::Superseded));

    r.directory.release("u1");
    settle(&r.handle).await;
    assert_eq!(r.handle.current(), SessionState::Anonymous);
    assert!(r.history.lock().iter().all(|s| !s.is_authenticated()));
    assert_eq!(r.gateway.sign_out_count(), 1);
}

#[tokio::test]
async fn logout_clears_locally_even_when_remote_sign_out_fails() {
    let r = rig().await;
    r.gateway.add_account("a@x.com", "pw", "u1");
    r.directory.insert(record("u1", Role::Patient, "A"));
    r.handle.login("a@x.com", "pw", Role::Patient).await.unwrap();

    r.gateway.fail_sign_out(Some(AuthError::Transport("offline".into())));
    assert!(r.handle.logout().await.is_ok());
    assert_eq!(r.handle.current(), SessionState::Anonymous);
    assert_eq!(r.gateway.sign_out_count(), 1);
}

#[tokio::test]
async fn shutdown_unsubscribes_and_stops_accepting_work() {
    let r = rig().await;
    assert_eq!(r.gateway.subscriber_count(), 1);
    r.handle.shutdown().await;
    assert_eq!(r.gateway.subscriber_count(), 0);

    r.gateway.add_account("a@x.com", "pw", "u1");
    let err = r.handle.login("a@x.com", "pw", Role::Patient).await.unwrap_err();
    assert_eq!(err.code_str(), "unknown");
    assert!(r.handle.logout().await.is_ok());
}

#[tokio::test]
async fn logout_during_sign_in_call_wins_and_signs_the_late_session_out() {
    let r = rig().await;
    r.gateway.add_account("p@x.com", "pw", "P1");
    r.directory.insert(record("P1", Role::Patient, "Pat"));
    r.gateway.hold_sign_in("p@x.com");

    let login = { let h = r.handle.clone(); tokio::spawn(async move { h.login("p@x.com", "pw", Role::Doctor).await }) };
    r.gateway.wait_for_sign_ins(1).await;
    r.handle.logout().await.unwrap();
    assert_eq!(r.handle.current(), SessionState::Anonymous);

    // the call completes after the logout and opens a remote session as a side effect
    r.gateway.release_sign_in("p@x.com");
    assert_eq!(login.await.unwrap(), Err(SessionError::Superseded));
    settle(&r.handle).await;

    assert_eq!(r.handle.current(), SessionState::Anonymous);
    assert!(r.history.lock().iter().all(|s| !s.is_authenticated()));
    assert_eq!(r.directory.lookup_count(), 0);
    assert_eq!(r.gateway.session(), None);
    assert_eq!(r.gateway.sign_out_count(), 2);
}

#[tokio::test]
async fn signup_without_provisioned_record_is_rejected() {
    let r = rig().await;
    r.directory.set_auto_provision(false);

    let err = r.handle.signup("n@x.com", "pw", "N", Role::Patient).await.unwrap_err();
    assert_eq!(err, SessionError::ProfileMissing);
    assert_eq!(r.directory.provisioned().len(), 1);
    assert_eq!(r.gateway.sign_out_count(), 1);
    settle(&r.handle).await;
    assert_eq!(r.handle.current(), SessionState::Anonymous);
}

#[tokio::test]
async fn profile_removed_between_sessions_is_missing_on_next_login() {
    let r = rig().await;
    r.gateway.add_account("a@x.com", "pw", "u1");
    r.directory.insert(record("u1", Role::Patient, "A"));
    assert_eq!(r.handle.store().subscriber_count(), 1);

    r.handle.login("a@x.com", "pw", Role::Patient).await.unwrap();
    r.handle.logout().await.unwrap();
    r.directory.remove("u1");

    let err = r.handle.login("a@x.com", "pw", Role::Patient).await.unwrap_err();
    assert_eq!(err, SessionError::ProfileMissing);
    assert_eq!(r.directory.lookup_count(), 2);
    assert_eq!(r.handle.resolver().inflight_count(), 0);
}

#[tokio::test]
async fn abandoned_oauth_flow_stops_gating_later_sessions() {
    let options = ReconcilerOptions { oauth_intent_ttl: Duration::from_millis(10), ..ReconcilerOptions::default() };
    let r = rig_with_options(Arc::new(MockGateway::new()), Arc::new(MockDirectory::new()), options).await;
    r.directory.insert(record("g3", Role::Patient, "P"));

    r.handle.login_with_oauth(Role::Doctor).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    // a session that shows up long after the flow was started is not held to its role
    r.gateway.push(Some(RawIdentity::new("g3", None)));
    let s = wait(&r.handle, |s| !s.is_loading()).await;
    assert_eq!(s.profile().map(|p| p.role), Some(Role::Patient));
    assert_eq!(r.gateway.sign_out_count(), 0);
}
