use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DirectoryError, ResolveError};

use super::model::{Profile, ProfileSeed, RawIdentity, Role};

/// Row shape of the profile directory (`users` table).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub role: Role,
}

impl DirectoryRecord {
    /// Build the profile; the authenticated identity's email wins over the directory copy.
    pub fn into_profile(self, identity_email: Option<&str>) -> Profile {
        let email = identity_email
            .map(|s| s.to_string())
            .or(self.email)
            .unwrap_or_default();
        Profile {
            id: self.id,
            email,
            role: self.role,
            display_name: self.name.unwrap_or_default(),
            avatar_ref: self.avatar.filter(|a| !a.is_empty()),
        }
    }
}

/// Profile directory consulted after the backend confirms an identity.
#[async_trait]
pub trait Directory: Send + Sync {
    /// `Ok(None)` means the identity is confirmed but no record exists.
    async fn lookup_profile(&self, identity_id: &str) -> Result<Option<DirectoryRecord>, DirectoryError>;

    /// Best-effort creation of the directory record after sign-up.
    async fn provision(&self, _identity_id: &str, _seed: &ProfileSeed) -> Result<(), DirectoryError> { Ok(()) }
}

type Flight = Shared<BoxFuture<'static, Result<Profile, ResolveError>>>;

/// Resolves raw identities to profiles, collapsing concurrent lookups for the same id.
pub struct ProfileResolver {
    directory: Arc<dyn Directory>,
    inflight: Mutex<HashMap<String, (u64, Flight)>>,
    next_flight: AtomicU64,
}

impl ProfileResolver {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory, inflight: Mutex::new(HashMap::new()), next_flight: AtomicU64::new(1) }
    }

    pub fn directory(&self) -> &Arc<dyn Directory> { &self.directory }

    /// Number of identities with a lookup currently in progress.
    pub fn inflight_count(&self) -> usize { self.inflight.lock().len() }

    pub async fn resolve(&self, raw: &RawIdentity) -> Result<Profile, ResolveError> {
        let (flight_id, flight) = {
            let mut map = self.inflight.lock();
            if let Some((fid, f)) = map.get(&raw.id) {
                debug!(target: "clinic::resolver", "joining in-flight lookup id={} flight={}", raw.id, fid);
                (*fid, f.clone())
            } else {
                let fid = self.next_flight.fetch_add(1, Ordering::Relaxed);
                let dir = self.directory.clone();
                let ident = raw.clone();
                let f: Flight = async move { lookup_once(dir, ident).await }.boxed().shared();
                map.insert(raw.id.clone(), (fid, f.clone()));
                (fid, f)
            }
        };
        let out = flight.await;
        // Whoever finishes first retires the flight; later callers start a fresh lookup.
        let mut map = self.inflight.lock();
        if matches!(map.get(&raw.id), Some((fid, _)) if *fid == flight_id) {
            map.remove(&raw.id);
        }
        out
    }
}

async fn lookup_once(dir: Arc<dyn Directory>, raw: RawIdentity) -> Result<Profile, ResolveError> {
    crate::tprintln!("resolver.lookup id={}", raw.id);
    match dir.lookup_profile(&raw.id).await? {
        Some(rec) if rec.id != raw.id => Err(ResolveError::Directory(DirectoryError(format!(
            "directory returned record {} for identity {}",
            rec.id, raw.id
        )))),
        Some(rec) => Ok(rec.into_profile(raw.email.as_deref())),
        None => Err(ResolveError::ProfileMissing),
    }
}

#[cfg(test)]
#[path = "resolver_tests.rs"]
mod resolver_tests;
