//! Per-user exclusion primitives.
//!
//! Two independent mechanisms live here:
//! * [`UserLocks`] serializes Retrieval Memory and preference writes for one user.
//! * [`ActiveRuns`] enforces at most one in-flight workflow per user and fails fast.
//!
//! Neither spans more than one user.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::OrchestratorError;

/// Lazily created async mutex per user id.
#[derive(Debug, Default)]
pub struct UserLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `user_id`'s long-lived state.
    pub async fn lock(&self, user_id: &str) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the DashMap shard is not held across the await.
        let mutex = self
            .locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }
}

/// Bookkeeping for one in-flight workflow.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveRun {
    pub user_id: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

/// Registry of users with a workflow in flight.
#[derive(Debug, Default, Clone)]
pub struct ActiveRuns {
    runs: Arc<DashMap<String, ActiveRun>>,
}

impl ActiveRuns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the run slot for `user_id`, or fail with `AlreadyRunning`.
    ///
    /// The slot is released when the returned guard drops, including when the
    /// owning future is cancelled.
    pub fn try_acquire(&self, user_id: &str, run_id: Uuid) -> Result<RunGuard, OrchestratorError> {
        match self.runs.entry(user_id.to_string()) {
            Entry::Occupied(_) => Err(OrchestratorError::AlreadyRunning {
                user_id: user_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(ActiveRun {
                    user_id: user_id.to_string(),
                    run_id,
                    started_at: Utc::now(),
                });
                Ok(RunGuard {
                    runs: self.runs.clone(),
                    user_id: user_id.to_string(),
                    run_id,
                })
            }
        }
    }

    pub fn is_running(&self, user_id: &str) -> bool {
        self.runs.contains_key(user_id)
    }

    pub fn list(&self) -> Vec<ActiveRun> {
        self.runs.iter().map(|entry| entry.value().clone()).collect()
    }
}

/// Releases the user's run slot on drop.
#[derive(Debug)]
pub struct RunGuard {
    runs: Arc<DashMap<String, ActiveRun>>,
    user_id: String,
    run_id: Uuid,
}

impl RunGuard {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let run_id = self.run_id;
        self.runs.remove_if(&self.user_id, |_, run| run.run_id == run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_rejected_until_release() {
        let runs = ActiveRuns::new();
        let guard = runs.try_acquire("u1", Uuid::new_v4()).unwrap();
        assert!(runs.is_running("u1"));

        let err = runs.try_acquire("u1", Uuid::new_v4()).unwrap_err();
        assert_eq!(err, OrchestratorError::AlreadyRunning { user_id: "u1".into() });

        // Other users are unaffected.
        let _other = runs.try_acquire("u2", Uuid::new_v4()).unwrap();

        drop(guard);
        assert!(!runs.is_running("u1"));
        assert!(runs.try_acquire("u1", Uuid::new_v4()).is_ok());
    }

    #[tokio::test]
    async fn test_user_locks_serialize_same_user() {
        let locks = Arc::new(UserLocks::new());
        let guard = locks.lock("u1").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("u1").await;
            })
        };

        // A different user is never blocked.
        let _g2 = locks.lock("u2").await;
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }
}
