//! Upload session storage using Moka.
//!
//! Each session lives until its own expiry; a lookup never returns an expired session.

use std::time::{Duration, Instant};

use chrono::Utc;
use moka::Expiry;
use moka::sync::Cache;
use nimbus_shared::types::UploadSessionId;

use super::session::UploadSession;

/// Default cache capacity (number of sessions).
const DEFAULT_CAPACITY: u64 = 100_000;

/// Evicts each session at its `expires_at`.
struct SessionExpiry;

impl Expiry<UploadSessionId, UploadSession> for SessionExpiry {
    fn expire_after_create(
        &self,
        _key: &UploadSessionId,
        value: &UploadSession,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some((value.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }
}

/// In-flight upload sessions.
///
/// Thread-safe and cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct SessionStore {
    cache: Cache<UploadSessionId, UploadSession>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl SessionStore {
    /// Creates a store with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a store holding at most `max_capacity` sessions.
    #[must_use]
    pub fn with_capacity(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(SessionExpiry)
            .build();
        Self { cache }
    }

    /// Stores or replaces a session.
    pub fn insert(&self, session: UploadSession) {
        self.cache.insert(session.id, session);
    }

    /// Returns a live session.
    #[must_use]
    pub fn get(&self, id: &UploadSessionId) -> Option<UploadSession> {
        let session = self.cache.get(id)?;
        if session.is_expired(Utc::now()) {
            self.cache.invalidate(id);
            return None;
        }
        Some(session)
    }

    /// Removes a session, returning it if it was live.
    pub fn remove(&self, id: &UploadSessionId) -> Option<UploadSession> {
        self.cache
            .remove(id)
            .filter(|session| !session.is_expired(Utc::now()))
    }

    /// Runs cache maintenance tasks.
    pub fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
    }

    /// Returns the approximate number of stored sessions.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
