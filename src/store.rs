//! Session store contract and the retrying commit adapter.
//!
//! The store owns deduplication: a tracker that re-offers a session whose
//! acknowledgement was lost produces the same `(start, stop)` key again, and
//! the store reports it as [`RecordOutcome::Duplicate`] instead of saving it
//! twice.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, sync::Arc};
use tokio::{sync::RwLock, time::sleep};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, SyncError},
    types::{Session, SyncConfig},
};

/// Per-record result of a commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordOutcome {
    /// Newly persisted
    Stored,
    /// A record with the same `(start, stop)` was already present
    Duplicate,
    /// Not persisted
    Failed(String),
}

/// Aggregate result of committing one batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReport {
    /// Records newly persisted
    pub stored: usize,
    /// Records the store already held
    pub duplicates: usize,
    /// Records that could not be persisted, with the last reason
    pub failed: Vec<(Session, String)>,
    /// Commit attempts made
    pub attempts: u32,
}

impl CommitReport {
    /// Records now present in the store
    #[must_use]
    pub const fn saved(&self) -> usize {
        self.stored + self.duplicates
    }

    /// Whether every record of the batch is present in the store
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Durable, append-oriented sink for synced sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist an ordered batch; returns one outcome per record, in order
    async fn commit(&self, batch: &[Session]) -> Result<Vec<RecordOutcome>>;

    /// Whether a record with this `(start, stop)` identity is already stored
    async fn contains(&self, start: u32, stop: u32) -> Result<bool>;
}

/// Commit a batch, retrying failed records
///
/// Whole-batch errors are retried as a whole while they are recoverable.
/// Records reported as failed are retried alone, after checking whether the
/// failed write landed anyway. Once part of the batch is stored, a later
/// whole-batch error marks the rest as failed instead of discarding the
/// report. An empty batch is a no-op that never reaches the store.
///
/// # Errors
///
/// Returns the store's error if no record could be accounted for, or
/// [`SyncError::Store`] if the store broke the one-outcome-per-record contract.
pub async fn commit_with_retry<S: SessionStore + ?Sized>(
    store: &S,
    batch: &[Session],
    config: &SyncConfig,
) -> Result<CommitReport> {
    let mut report = CommitReport::default();
    if batch.is_empty() {
        debug!("No sessions to commit");
        return Ok(report);
    }

    let max_attempts = config.commit_retry_attempts.max(1);
    let mut pending = batch.to_vec();

    loop {
        report.attempts += 1;
        info!(
            attempt = report.attempts,
            sessions = pending.len(),
            "Committing sessions"
        );

        match store.commit(&pending).await {
            Ok(outcomes) => {
                if outcomes.len() != pending.len() {
                    return Err(SyncError::Store(format!(
                        "store returned {} outcomes for {} sessions",
                        outcomes.len(),
                        pending.len()
                    )));
                }

                let mut failed = Vec::new();
                for (session, outcome) in pending.iter().zip(outcomes) {
                    match outcome {
                        RecordOutcome::Stored => report.stored += 1,
                        RecordOutcome::Duplicate => report.duplicates += 1,
                        RecordOutcome::Failed(reason) => {
                            warn!(start = session.start, stop = session.stop, %reason, "Session not saved");
                            failed.push((*session, reason));
                        }
                    }
                }

                if failed.is_empty() {
                    info!(
                        stored = report.stored,
                        duplicates = report.duplicates,
                        "Commit finished"
                    );
                    return Ok(report);
                }

                if report.attempts >= max_attempts {
                    warn!(failed = failed.len(), "Giving up on unsaved sessions");
                    report.failed = failed;
                    return Ok(report);
                }

                sleep(config.commit_retry_delay()).await;

                pending.clear();
                for (session, reason) in failed {
                    match store.contains(session.start, session.stop).await {
                        Ok(true) => report.stored += 1,
                        Ok(false) => pending.push(session),
                        Err(e) => {
                            debug!("Lookup before retry failed: {e}; last error: {reason}");
                            pending.push(session);
                        }
                    }
                }
                if pending.is_empty() {
                    return Ok(report);
                }
            }
            Err(e) => {
                if report.attempts >= max_attempts || !e.is_recoverable() {
                    if report.saved() > 0 {
                        warn!(
                            saved = report.saved(),
                            failed = pending.len(),
                            "Commit of remaining sessions failed: {e}"
                        );
                        let reason = e.to_string();
                        report.failed = pending
                            .into_iter()
                            .map(|session| (session, reason.clone()))
                            .collect();
                        return Ok(report);
                    }
                    error!(attempts = report.attempts, "Commit failed: {e}");
                    return Err(e);
                }
                warn!(attempt = report.attempts, "Commit failed, retrying: {e}");
                sleep(config.commit_retry_delay()).await;
            }
        }
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    sessions: Vec<Session>,
    keys: HashSet<(u32, u32)>,
    commits: usize,
}

/// In-memory session store keyed on `(start, stop)`
///
/// Clones share the same storage, so a host can keep a handle while the
/// engine owns another.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemorySessionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored sessions in insertion order
    pub async fn sessions(&self) -> Vec<Session> {
        self.inner.read().await.sessions.clone()
    }

    /// Number of commit calls received
    pub async fn commit_count(&self) -> usize {
        self.inner.read().await.commits
    }

    /// Total steps across stored sessions
    pub async fn total_steps(&self) -> u64 {
        self.inner
            .read()
            .await
            .sessions
            .iter()
            .map(|session| u64::from(session.steps))
            .sum()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn commit(&self, batch: &[Session]) -> Result<Vec<RecordOutcome>> {
        let mut inner = self.inner.write().await;
        inner.commits += 1;

        let outcomes = batch
            .iter()
            .map(|session| {
                if inner.keys.insert(session.key()) {
                    inner.sessions.push(*session);
                    RecordOutcome::Stored
                } else {
                    RecordOutcome::Duplicate
                }
            })
            .collect();
        Ok(outcomes)
    }

    async fn contains(&self, start: u32, stop: u32) -> Result<bool> {
        Ok(self.inner.read().await.keys.contains(&(start, stop)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn sessions(count: u32) -> Vec<Session> {
        (0..count)
            .map(|i| Session::new(1_000 + i * 100, 1_050 + i * 100, 10 * (i + 1)))
            .collect()
    }

    /// Store failing whole batches a fixed number of times
    struct UnavailableStore {
        inner: MemorySessionStore,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl SessionStore for UnavailableStore {
        async fn commit(&self, batch: &[Session]) -> Result<Vec<RecordOutcome>> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SyncError::Store("health store locked".to_string()));
            }
            self.inner.commit(batch).await
        }

        async fn contains(&self, start: u32, stop: u32) -> Result<bool> {
            self.inner.contains(start, stop).await
        }
    }

    /// Store rejecting sessions with an odd step count on the first attempt
    #[derive(Default)]
    struct PickyStore {
        inner: MemorySessionStore,
        attempts: AtomicU32,
        always_reject: bool,
    }

    #[async_trait]
    impl SessionStore for PickyStore {
        async fn commit(&self, batch: &[Session]) -> Result<Vec<RecordOutcome>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = Vec::new();
            for session in batch {
                if session.steps % 20 != 0 && (attempt == 0 || self.always_reject) {
                    outcomes.push(RecordOutcome::Failed("quota exceeded".to_string()));
                } else {
                    outcomes.extend(self.inner.commit(std::slice::from_ref(session)).await?);
                }
            }
            Ok(outcomes)
        }

        async fn contains(&self, start: u32, stop: u32) -> Result<bool> {
            self.inner.contains(start, stop).await
        }
    }

    /// Store saving only the first record, then locking up for good
    #[derive(Default)]
    struct LockingStore {
        inner: MemorySessionStore,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl SessionStore for LockingStore {
        async fn commit(&self, batch: &[Session]) -> Result<Vec<RecordOutcome>> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(SyncError::Store("locked".to_string()));
            }
            let mut outcomes = self.inner.commit(&batch[..1]).await?;
            outcomes.extend(
                batch[1..]
                    .iter()
                    .map(|_| RecordOutcome::Failed("quota exceeded".to_string())),
            );
            Ok(outcomes)
        }

        async fn contains(&self, start: u32, stop: u32) -> Result<bool> {
            self.inner.contains(start, stop).await
        }
    }

    /// Store that is not reachable at all
    struct DetachedStore {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl SessionStore for DetachedStore {
        async fn commit(&self, _batch: &[Session]) -> Result<Vec<RecordOutcome>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::NotConnected)
        }

        async fn contains(&self, _start: u32, _stop: u32) -> Result<bool> {
            Err(SyncError::NotConnected)
        }
    }

    #[test]
    fn test_memory_store_deduplicates_on_start_stop() {
        let store = MemorySessionStore::new();
        let first = Session::new(100, 200, 50);
        let resent = Session::new(100, 200, 50);
        let other = Session::new(300, 400, 70);

        let outcomes = tokio_test::block_on(store.commit(&[first, resent, other])).unwrap();
        assert_eq!(
            outcomes,
            vec![
                RecordOutcome::Stored,
                RecordOutcome::Duplicate,
                RecordOutcome::Stored
            ]
        );
        assert_eq!(tokio_test::block_on(store.sessions()), vec![first, other]);
        assert!(tokio_test::block_on(store.contains(100, 200)).unwrap());
        assert!(!tokio_test::block_on(store.contains(100, 201)).unwrap());
        assert_eq!(tokio_test::block_on(store.total_steps()), 120);
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_noop() {
        let store = MemorySessionStore::new();
        let report = commit_with_retry(&store, &[], &SyncConfig::default())
            .await
            .unwrap();

        assert_eq!(report, CommitReport::default());
        assert_eq!(store.commit_count().await, 0);
    }

    #[tokio::test]
    async fn test_resync_reports_duplicates() {
        let store = MemorySessionStore::new();
        let batch = sessions(3);
        let config = SyncConfig::default();

        let first = commit_with_retry(&store, &batch, &config).await.unwrap();
        assert_eq!(first.stored, 3);

        let second = commit_with_retry(&store, &batch, &config).await.unwrap();
        assert_eq!(second.stored, 0);
        assert_eq!(second.duplicates, 3);
        assert_eq!(second.saved(), 3);
        assert_eq!(store.sessions().await, batch);
    }

    #[tokio::test(start_paused = true)]
    async fn test_whole_batch_failure_is_retried() {
        let store = UnavailableStore {
            inner: MemorySessionStore::new(),
            failures_left: AtomicU32::new(2),
        };
        let batch = sessions(2);

        let report = commit_with_retry(&store, &batch, &SyncConfig::default())
            .await
            .unwrap();
        assert_eq!(report.attempts, 3);
        assert_eq!(report.stored, 2);
        assert!(report.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_whole_batch_failure_exhausts_attempts() {
        let store = UnavailableStore {
            inner: MemorySessionStore::new(),
            failures_left: AtomicU32::new(10),
        };

        let err = commit_with_retry(&store, &sessions(2), &SyncConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
        assert!(store.inner.sessions().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_batch_failure_keeps_partial_report() {
        let store = LockingStore::default();
        let batch = sessions(3);

        let report = commit_with_retry(&store, &batch, &SyncConfig::default())
            .await
            .unwrap();
        assert_eq!(report.attempts, 3);
        assert_eq!(report.stored, 1);
        assert_eq!(report.saved(), 1);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0].0, batch[1]);
        assert_eq!(report.failed[1].0, batch[2]);
        assert!(report.failed[0].1.contains("locked"));
        assert_eq!(store.inner.sessions().await, vec![batch[0]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecoverable_error_is_not_retried() {
        let store = DetachedStore {
            attempts: AtomicU32::new(0),
        };

        let err = commit_with_retry(&store, &sessions(2), &SyncConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotConnected));
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_records_are_retried_alone() {
        let store = PickyStore::default();
        let batch = sessions(3); // steps 10, 20, 30

        let report = commit_with_retry(&store, &batch, &SyncConfig::default())
            .await
            .unwrap();
        assert_eq!(report.attempts, 2);
        assert_eq!(report.stored, 3);
        assert!(report.is_complete());

        let stored = store.inner.sessions().await;
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[0], batch[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_record_failures_are_reported() {
        let store = PickyStore {
            always_reject: true,
            ..Default::default()
        };
        let batch = sessions(3);

        let report = commit_with_retry(&store, &batch, &SyncConfig::default())
            .await
            .unwrap();
        assert_eq!(report.attempts, 3);
        assert_eq!(report.stored, 1);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0].0, batch[0]);
        assert_eq!(report.failed[1].0, batch[2]);
        assert!(!report.is_complete());
    }
}
