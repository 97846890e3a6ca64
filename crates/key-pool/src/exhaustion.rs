//! Quota exhaustion bookkeeping
//!
//! Marks a key unusable once the upstream has reported that its quota is
//! spent. Marking is idempotent and never fails: a secret that no longer
//! matches any record (stale, or already reset) is ignored.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::pool::{KeyPool, KeyStatus};

#[derive(Debug, Clone)]
pub struct ExhaustionTracker {
    pool: Arc<KeyPool>,
}

impl ExhaustionTracker {
    pub fn new(pool: Arc<KeyPool>) -> Self {
        Self { pool }
    }

    /// Mark the record holding `secret` as exhausted.
    ///
    /// Only `Active` records transition; exhausted or errored records are
    /// left as they are. Returns true when a matching record was found.
    pub async fn mark_exhausted(&self, secret: &str) -> bool {
        if secret.trim().is_empty() {
            debug!("ignoring exhaustion report for an empty secret");
            return false;
        }

        let Some(record) = self.pool.find_by_secret(secret).await else {
            debug!("exhaustion report matched no pool record, ignoring");
            return false;
        };

        if record.status() != KeyStatus::Active {
            debug!(
                key_id = record.id(),
                status = record.status().label(),
                "key already inactive"
            );
            return true;
        }

        self.pool
            .set_status(record.id(), KeyStatus::Exhausted)
            .await;
        warn!(
            key_id = record.id(),
            label = record.label(),
            "key marked as exhausted"
        );
        metrics::counter!("pool_keys_exhausted_total", "key" => record.id().to_string())
            .increment(1);
        true
    }

    /// Administrative recovery: every key back to active.
    pub async fn reset_all(&self) {
        self.pool.reset_all().await;
        info!("exhaustion state cleared by reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::CredentialRecord;
    use common::Secret;
    use provider::Capability;

    fn pool() -> Arc<KeyPool> {
        Arc::new(KeyPool::new(vec![
            CredentialRecord::new("a", "Primary", Secret::from("k1"), Capability::ALL),
            CredentialRecord::new("b", "Imaging", Secret::from("k2"), [Capability::Image]),
            CredentialRecord::new("c", "Unconfigured", Secret::empty(), [Capability::Video]),
        ]))
    }

    async fn status_of(pool: &KeyPool, id: &str) -> KeyStatus {
        pool.get_all()
            .await
            .into_iter()
            .find(|r| r.id() == id)
            .map(|r| r.status())
            .unwrap()
    }

    #[tokio::test]
    async fn marks_matching_record_exhausted() {
        let pool = pool();
        let tracker = ExhaustionTracker::new(pool.clone());

        assert!(tracker.mark_exhausted("k2").await);
        assert_eq!(status_of(&pool, "b").await, KeyStatus::Exhausted);
        assert_eq!(status_of(&pool, "a").await, KeyStatus::Active);
    }

    #[tokio::test]
    async fn marking_twice_is_idempotent() {
        let pool = pool();
        let tracker = ExhaustionTracker::new(pool.clone());

        assert!(tracker.mark_exhausted("k1").await);
        assert!(tracker.mark_exhausted("k1").await);
        assert_eq!(status_of(&pool, "a").await, KeyStatus::Exhausted);
    }

    #[tokio::test]
    async fn unknown_secret_is_a_no_op() {
        let pool = pool();
        let tracker = ExhaustionTracker::new(pool.clone());

        assert!(!tracker.mark_exhausted("stale-secret").await);
        for record in pool.get_all().await {
            assert_eq!(record.status(), KeyStatus::Active);
        }
    }

    #[tokio::test]
    async fn empty_secret_never_exhausts_unconfigured_slot() {
        let pool = pool();
        let tracker = ExhaustionTracker::new(pool.clone());

        assert!(!tracker.mark_exhausted("").await);
        assert_eq!(status_of(&pool, "c").await, KeyStatus::Active);
    }

    #[tokio::test]
    async fn errored_key_is_not_downgraded_to_exhausted() {
        let pool = pool();
        pool.set_status("a", KeyStatus::Error).await;
        let tracker = ExhaustionTracker::new(pool.clone());

        assert!(tracker.mark_exhausted("k1").await);
        assert_eq!(status_of(&pool, "a").await, KeyStatus::Error);
    }

    #[tokio::test]
    async fn reset_all_reactivates_exhausted_keys() {
        let pool = pool();
        let tracker = ExhaustionTracker::new(pool.clone());
        tracker.mark_exhausted("k1").await;
        tracker.mark_exhausted("k2").await;

        tracker.reset_all().await;
        assert_eq!(status_of(&pool, "a").await, KeyStatus::Active);
        assert_eq!(status_of(&pool, "b").await, KeyStatus::Active);
    }
}
