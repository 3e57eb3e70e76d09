//! Cleanup tasks for uploads whose client may never finish.
//!
//! A sentinel sleeps until the session expires. If nobody disarmed it by then
//! (through completion or cancellation), it releases the backend upload and
//! deletes the placeholder object. Cleanup failures are logged, never raised.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use nimbus_shared::types::SentinelTaskId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::session::UploadSession;
use crate::driver::Driver;

/// Armed sentinel tasks, keyed by task id.
#[derive(Debug, Clone, Default)]
pub struct SentinelTasks {
    armed: Arc<DashMap<SentinelTaskId, CancellationToken>>,
}

impl SentinelTasks {
    /// Empty task set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a sentinel for `session` on the current runtime.
    pub fn arm(&self, driver: Arc<dyn Driver>, session: UploadSession) -> SentinelTaskId {
        let id = SentinelTaskId::new();
        let disarm = CancellationToken::new();
        self.armed.insert(id, disarm.clone());

        let armed = Arc::clone(&self.armed);
        let delay = (session.expires_at - Utc::now())
            .to_std()
            .unwrap_or_default();
        debug!(task_id = %id, session_id = %session.id, expires_at = %session.expires_at, "Upload sentinel armed");

        tokio::spawn(async move {
            tokio::select! {
                () = disarm.cancelled() => {
                    debug!(task_id = %id, session_id = %session.id, "Upload sentinel disarmed");
                }
                () = tokio::time::sleep(delay) => {
                    armed.remove(&id);
                    expire(driver.as_ref(), &session).await;
                }
            }
        });
        id
    }

    /// Stop a sentinel. Returns false if it already fired or never existed.
    pub fn disarm(&self, id: &SentinelTaskId) -> bool {
        match self.armed.remove(id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of sentinels still waiting.
    #[must_use]
    pub fn armed(&self) -> usize {
        self.armed.len()
    }
}

async fn expire(driver: &dyn Driver, session: &UploadSession) {
    info!(session_id = %session.id, path = %session.path, "Upload session expired, releasing storage");

    if let Err(err) = driver.cancel_token(session).await {
        warn!(session_id = %session.id, error = %err, "Failed to cancel expired upload");
    }
    if let Err(err) = driver.delete(std::slice::from_ref(&session.path)).await {
        warn!(session_id = %session.id, path = %session.path, error = %err, "Failed to delete placeholder of expired upload");
    }
}
