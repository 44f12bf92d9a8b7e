//! HTTP implementations of the gateway and directory against the hosted backend's auth
//! (`/auth/v1`) and table (`/rest/v1`) endpoints.
//!
//! The session (tokens plus identity) lives in memory only and is shared with the
//! directory so profile reads carry the user's bearer token.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, StatusCode, Url};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{AuthError, DirectoryError};

use super::gateway::{AuthCallback, IdentityGateway};
use super::listeners::{Listeners, Subscription};
use super::model::{ProfileSeed, RawIdentity};
use super::resolver::{Directory, DirectoryRecord};

const TARGET: &str = "clinic::rest";

/// Opens the provider's authorize page; on a device this hands the URL to the browser.
pub type Launcher = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub identity: RawIdentity,
}

type SharedSession = Arc<Mutex<Option<StoredSession>>>;

pub struct RestGateway {
    base: Url,
    client: reqwest::Client,
    anon_key: String,
    session: SharedSession,
    listeners: Listeners<Option<RawIdentity>>,
    launcher: Launcher,
    profile_table: String,
    provision_rpc: Option<String>,
}

impl RestGateway {
    pub fn new(config: &ClientConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let base = Url::parse(&config.backend_url)?;
        let client = reqwest::Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self {
            base,
            client,
            anon_key: config.anon_key.clone(),
            session: Arc::new(Mutex::new(None)),
            listeners: Listeners::new(),
            launcher: Box::new(|url| info!(target: TARGET, "open in a browser to continue: {}", url)),
            profile_table: config.profile_table.clone(),
            provision_rpc: config.provision_rpc.clone(),
        })
    }

    pub fn with_launcher(mut self, launcher: Launcher) -> Self {
        self.launcher = launcher;
        self
    }

    /// Directory client sharing this gateway's HTTP client and session token.
    pub fn directory(&self) -> RestDirectory {
        RestDirectory {
            base: self.base.clone(),
            client: self.client.clone(),
            anon_key: self.anon_key.clone(),
            table: self.profile_table.clone(),
            provision_rpc: self.provision_rpc.clone(),
            session: self.session.clone(),
        }
    }

    pub fn stored_session(&self) -> Option<StoredSession> { self.session.lock().clone() }

    /// Finish the OAuth flow from the redirect deep link carrying the tokens in its fragment.
    pub async fn complete_oauth_redirect(&self, redirect: &str) -> Result<RawIdentity, AuthError> {
        let (access_token, refresh_token) = parse_oauth_fragment(redirect)?;
        let url = self.endpoint("/auth/v1/user")?;
        let user = self.call(Method::GET, url, Some(&access_token), None).await?;
        let identity = identity_from_user(&user).ok_or_else(|| AuthError::rejected("user response carries no id"))?;
        info!(target: TARGET, "oauth redirect completed id={}", identity.id);
        self.store(Some(StoredSession { access_token, refresh_token, identity: identity.clone() }));
        Ok(identity)
    }

    fn endpoint(&self, path_and_query: &str) -> Result<Url, AuthError> {
        self.base.join(path_and_query).map_err(|e| AuthError::Transport(format!("bad endpoint {}: {}", path_and_query, e)))
    }

    fn store(&self, next: Option<StoredSession>) {
        let identity = next.as_ref().map(|s| s.identity.clone());
        *self.session.lock() = next;
        self.listeners.emit(&identity);
    }

    fn bearer(&self) -> Option<String> { self.session.lock().as_ref().map(|s| s.access_token.clone()) }

    async fn call(&self, method: Method, url: Url, bearer: Option<&str>, body: Option<Value>) -> Result<Value, AuthError> {
        let headers = api_headers(&self.anon_key, bearer).map_err(AuthError::Transport)?;
        debug!(target: TARGET, "{} {}", method, url.path());
        let mut req = self.client.request(method, url).headers(headers);
        if let Some(b) = body { req = req.json(&b); }
        let resp = req.send().await.map_err(|e| AuthError::Transport(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| AuthError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(parse_auth_error(status.as_u16(), &text));
        }
        if text.trim().is_empty() { return Ok(Value::Null); }
        serde_json::from_str(&text).map_err(|e| AuthError::Transport(format!("invalid json from auth api: {}", e)))
    }
}

#[async_trait]
impl IdentityGateway for RestGateway {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<RawIdentity, AuthError> {
        let url = self.endpoint("/auth/v1/token?grant_type=password")?;
        let v = self.call(Method::POST, url, None, Some(json!({"email": email, "password": password}))).await?;
        let session = session_from_token_response(&v).ok_or_else(|| AuthError::rejected("token response carries no session"))?;
        let identity = session.identity.clone();
        self.store(Some(session));
        Ok(identity)
    }

    async fn sign_up_with_metadata(&self, email: &str, password: &str, seed: &ProfileSeed) -> Result<RawIdentity, AuthError> {
        let url = self.endpoint("/auth/v1/signup")?;
        let body = json!({
            "email": email,
            "password": password,
            "data": {"name": seed.display_name, "role": seed.role.as_str()},
        });
        let v = self.call(Method::POST, url, None, Some(body)).await?;
        // with confirmation enabled the body is the bare user and no session is opened
        if let Some(session) = session_from_token_response(&v) {
            let identity = session.identity.clone();
            self.store(Some(session));
            return Ok(identity);
        }
        identity_from_user(&v).ok_or_else(|| AuthError::rejected("signup response carries no user"))
    }

    async fn initiate_oauth(&self, provider: &str, redirect_target: &str) -> Result<(), AuthError> {
        let url = authorize_url(&self.base, provider, redirect_target)?;
        (self.launcher)(url.as_str());
        Ok(())
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        let Some(token) = self.bearer() else { return Ok(()); };
        let url = self.endpoint("/auth/v1/logout")?;
        match self.call(Method::POST, url, Some(&token), None).await {
            Ok(_) => {}
            // token already revoked or expired: the remote session is gone either way
            Err(AuthError::Rejected { status: Some(401 | 403 | 404), .. }) => {}
            Err(e) => return Err(e),
        }
        self.store(None);
        Ok(())
    }

    async fn current_session(&self) -> Result<Option<RawIdentity>, AuthError> {
        let Some(token) = self.bearer() else { return Ok(None); };
        let url = self.endpoint("/auth/v1/user")?;
        match self.call(Method::GET, url, Some(&token), None).await {
            Ok(user) => Ok(identity_from_user(&user)),
            Err(AuthError::Rejected { status: Some(401 | 403), .. }) => {
                warn!(target: TARGET, "stored session no longer valid; dropping it");
                *self.session.lock() = None;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn subscribe_auth_events(&self, callback: AuthCallback) -> Subscription {
        self.listeners.add(move |ev: &Option<RawIdentity>| callback(ev.clone()))
    }
}

/// Profile table reader plus the sign-up provisioning RPC.
pub struct RestDirectory {
    base: Url,
    client: reqwest::Client,
    anon_key: String,
    table: String,
    provision_rpc: Option<String>,
    session: SharedSession,
}

impl RestDirectory {
    async fn send(&self, method: Method, url: Url, body: Option<Value>) -> Result<String, DirectoryError> {
        let bearer = self.session.lock().as_ref().map(|s| s.access_token.clone());
        let headers = api_headers(&self.anon_key, bearer.as_deref()).map_err(DirectoryError)?;
        let mut req = self.client.request(method, url).headers(headers);
        if let Some(b) = body { req = req.json(&b); }
        let resp = req.send().await.map_err(|e| DirectoryError(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| DirectoryError(e.to_string()))?;
        if !status.is_success() {
            return Err(DirectoryError(format!("HTTP {}: {}", status.as_u16(), error_message(&text).unwrap_or(text))));
        }
        Ok(text)
    }
}

#[async_trait]
impl Directory for RestDirectory {
    async fn lookup_profile(&self, identity_id: &str) -> Result<Option<DirectoryRecord>, DirectoryError> {
        let url = profile_query_url(&self.base, &self.table, identity_id)?;
        let text = self.send(Method::GET, url, None).await?;
        parse_profile_rows(&text)
    }

    async fn provision(&self, identity_id: &str, seed: &ProfileSeed) -> Result<(), DirectoryError> {
        let Some(rpc) = &self.provision_rpc else { return Ok(()); };
        let url = self.base.join(&format!("/rest/v1/rpc/{}", rpc)).map_err(|e| DirectoryError(e.to_string()))?;
        let body = json!({"id": identity_id, "role": seed.role.as_str(), "name": seed.display_name});
        self.send(Method::POST, url, Some(body)).await?;
        debug!(target: TARGET, "provisioned directory record id={}", identity_id);
        Ok(())
    }
}

fn api_headers(anon_key: &str, bearer: Option<&str>) -> Result<HeaderMap, String> {
    let mut headers = HeaderMap::new();
    headers.insert("apikey", HeaderValue::from_str(anon_key).map_err(|e| format!("invalid api key header: {}", e))?);
    let auth = format!("Bearer {}", bearer.unwrap_or(anon_key));
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&auth).map_err(|e| format!("invalid authorization header: {}", e))?);
    Ok(headers)
}

fn error_message(body: &str) -> Option<String> {
    let v: Value = serde_json::from_str(body).ok()?;
    ["error_description", "msg", "message", "error"]
        .iter()
        .find_map(|k| v.get(*k).and_then(|m| m.as_str()).filter(|m| !m.is_empty()).map(|m| m.to_string()))
}

/// Map a non-success auth API response to `AuthError`, keeping the backend's wording since
/// classification matches on it.
pub fn parse_auth_error(status: u16, body: &str) -> AuthError {
    let message = error_message(body)
        .or_else(|| Some(body.trim().to_string()).filter(|b| !b.is_empty()))
        .unwrap_or_else(|| match StatusCode::from_u16(status).ok().and_then(|s| s.canonical_reason()) {
            Some(reason) => format!("HTTP {} {}", status, reason),
            None => format!("HTTP {}", status),
        });
    AuthError::Rejected { status: Some(status), message }
}

pub fn identity_from_user(user: &Value) -> Option<RawIdentity> {
    let id = user.get("id")?.as_str()?.to_string();
    let email = user.get("email").and_then(|e| e.as_str()).filter(|e| !e.is_empty()).map(|e| e.to_string());
    Some(RawIdentity { id, email })
}

/// Session from a token or signup response: `{access_token, refresh_token, user}`.
pub fn session_from_token_response(v: &Value) -> Option<StoredSession> {
    let access_token = v.get("access_token")?.as_str()?.to_string();
    let refresh_token = v.get("refresh_token").and_then(|t| t.as_str()).map(|t| t.to_string());
    let identity = identity_from_user(v.get("user")?)?;
    Some(StoredSession { access_token, refresh_token, identity })
}

pub fn authorize_url(base: &Url, provider: &str, redirect_target: &str) -> Result<Url, AuthError> {
    let rel = format!(
        "/auth/v1/authorize?provider={}&redirect_to={}",
        urlencoding::encode(provider),
        urlencoding::encode(redirect_target)
    );
    base.join(&rel).map_err(|e| AuthError::Transport(format!("bad authorize url: {}", e)))
}

/// Tokens from a redirect like `clinic://auth/callback#access_token=..&refresh_token=..`.
/// Providers reporting a failure put `error_description` in the same place.
pub fn parse_oauth_fragment(redirect: &str) -> Result<(String, Option<String>), AuthError> {
    let params = redirect
        .split_once('#')
        .or_else(|| redirect.split_once('?'))
        .map(|(_, p)| p)
        .ok_or_else(|| AuthError::rejected("redirect carries no parameters"))?;
    let mut access = None;
    let mut refresh = None;
    let mut failure = None;
    for pair in params.split('&') {
        let Some((k, v)) = pair.split_once('=') else { continue };
        let v = urlencoding::decode(&v.replace('+', " ")).map(|c| c.into_owned()).unwrap_or_else(|_| v.to_string());
        match k {
            "access_token" => access = Some(v),
            "refresh_token" => refresh = Some(v),
            "error_description" => failure = Some(v),
            "error" if failure.is_none() => failure = Some(v),
            _ => {}
        }
    }
    if let Some(msg) = failure { return Err(AuthError::rejected(msg)); }
    let access = access.filter(|a| !a.is_empty()).ok_or_else(|| AuthError::rejected("redirect carries no access token"))?;
    Ok((access, refresh))
}

pub fn profile_query_url(base: &Url, table: &str, identity_id: &str) -> Result<Url, DirectoryError> {
    let rel = format!(
        "/rest/v1/{}?id=eq.{}&select=id,name,avatar,email,role",
        urlencoding::encode(table),
        urlencoding::encode(identity_id)
    );
    base.join(&rel).map_err(|e| DirectoryError(format!("bad profile url: {}", e)))
}

/// Rows from a table query; an empty array means no record.
pub fn parse_profile_rows(body: &str) -> Result<Option<DirectoryRecord>, DirectoryError> {
    let rows: Vec<DirectoryRecord> = serde_json::from_str(body).map_err(|e| DirectoryError(format!("unexpected profile rows: {}", e)))?;
    Ok(rows.into_iter().next())
}
