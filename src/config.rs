//! Client configuration: built-in defaults, overlaid by an optional JSON file, overlaid by
//! `CLINIC_*` environment variables.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::identity::ReconcilerOptions;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the hosted backend, e.g. `https://xyz.example.co`.
    pub backend_url: String,
    /// Public (anon) API key sent as `apikey` on every request.
    pub anon_key: String,
    pub oauth_provider: String,
    /// Deep link the OAuth provider redirects back to.
    pub redirect_target: String,
    pub profile_table: String,
    /// RPC creating the directory record after sign-up; `None` disables provisioning.
    pub provision_rpc: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend_url: String::new(),
            anon_key: String::new(),
            oauth_provider: "google".to_string(),
            redirect_target: "clinic://auth/callback".to_string(),
            profile_table: "users".to_string(),
            provision_rpc: Some("handle_new_user".to_string()),
            request_timeout_ms: 10_000,
        }
    }
}

impl ClientConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Overlay process environment variables.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|k| std::env::var(k).ok())
    }

    /// Overlay values from `lookup`; unset or blank variables leave the field untouched.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(v) = get("CLINIC_BACKEND_URL") { self.backend_url = v; }
        if let Some(v) = get("CLINIC_ANON_KEY") { self.anon_key = v; }
        if let Some(v) = get("CLINIC_OAUTH_PROVIDER") { self.oauth_provider = v; }
        if let Some(v) = get("CLINIC_REDIRECT_TARGET") { self.redirect_target = v; }
        if let Some(v) = get("CLINIC_PROFILE_TABLE") { self.profile_table = v; }
        if let Some(v) = get("CLINIC_PROVISION_RPC") {
            // "none" switches provisioning off
            self.provision_rpc = if v.eq_ignore_ascii_case("none") { None } else { Some(v) };
        }
        if let Some(v) = get("CLINIC_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = v.parse::<u64>().with_context(|| format!("CLINIC_REQUEST_TIMEOUT_MS is not a number: {}", v))?;
        }
        Ok(())
    }

    /// Defaults, then `path` when given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend_url.trim().is_empty() { return Err(anyhow!("backend_url is required (CLINIC_BACKEND_URL)")); }
        if self.anon_key.trim().is_empty() { return Err(anyhow!("anon_key is required (CLINIC_ANON_KEY)")); }
        if self.profile_table.trim().is_empty() { return Err(anyhow!("profile_table must not be empty")); }
        if self.request_timeout_ms == 0 { return Err(anyhow!("request_timeout_ms must be positive")); }
        reqwest::Url::parse(&self.backend_url).with_context(|| format!("invalid backend_url {}", self.backend_url))?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration { Duration::from_millis(self.request_timeout_ms) }

    pub fn reconciler_options(&self) -> ReconcilerOptions {
        ReconcilerOptions {
            oauth_provider: self.oauth_provider.clone(),
            redirect_target: self.redirect_target.clone(),
            ..ReconcilerOptions::default()
        }
    }
}
