//! Capability-based key selection
//!
//! Selection order for a requested capability:
//! 1. Active, configured keys that carry the capability
//! 2. Otherwise active, configured general-purpose keys
//! 3. Otherwise the first record in the pool, unconditionally
//!
//! Among the candidates of step 1 or 2 the least recently used key wins, ties
//! broken by declaration order. The winner is stamped with the current logical
//! time before the write guard is released.

use std::sync::Arc;

use common::Secret;
use provider::Capability;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pool::{CredentialRecord, KeyPool, KeyStatus};

/// A key chosen for one attempt.
///
/// Under total outage this may be the pool's first record even though it is
/// exhausted or unconfigured; callers must check before using it.
#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub id: String,
    pub label: String,
    pub status: KeyStatus,
    pub secret: Secret<String>,
}

impl From<&CredentialRecord> for SelectedKey {
    fn from(record: &CredentialRecord) -> Self {
        Self {
            id: record.id().to_string(),
            label: record.label().to_string(),
            status: record.status(),
            secret: record.secret().clone(),
        }
    }
}

/// Chooses the best eligible key for a capability.
#[derive(Debug, Clone)]
pub struct CapabilityRouter {
    pool: Arc<KeyPool>,
}

impl CapabilityRouter {
    pub fn new(pool: Arc<KeyPool>) -> Self {
        Self { pool }
    }

    /// Select a key for `capability` and mark it used.
    ///
    /// Returns `EmptyPool` only when the pool has no records at all. When no
    /// record is eligible the first record is returned as a last resort and
    /// its timestamp is left untouched.
    pub async fn select_for(&self, capability: Capability) -> Result<SelectedKey> {
        let mut state = self.pool.write().await;
        if state.records.is_empty() {
            return Err(Error::EmptyPool);
        }

        let picked = pick(&state.records, capability);
        match picked {
            Some(idx) => {
                let now = state.tick();
                let record = &mut state.records[idx];
                record.stamp(now);
                debug!(
                    capability = %capability,
                    key_id = record.id(),
                    stamped = now,
                    "selected key"
                );
                Ok(SelectedKey::from(&*record))
            }
            None => {
                let record = &state.records[0];
                warn!(
                    capability = %capability,
                    key_id = record.id(),
                    status = record.status().label(),
                    configured = record.is_configured(),
                    "no eligible key, falling back to first pool record"
                );
                Ok(SelectedKey::from(record))
            }
        }
    }
}

/// Index of the least recently used candidate, specialists before generalists.
fn pick(records: &[CredentialRecord], capability: Capability) -> Option<usize> {
    let mut candidates = eligible(records, |r| r.supports(capability));
    if candidates.is_empty() {
        candidates = eligible(records, CredentialRecord::is_general_purpose);
    }
    // min_by_key keeps the first of equal minimums, i.e. declaration order
    candidates
        .into_iter()
        .min_by_key(|&idx| records[idx].last_used_at())
}

fn eligible(
    records: &[CredentialRecord],
    filter: impl Fn(&CredentialRecord) -> bool,
) -> Vec<usize> {
    records
        .iter()
        .enumerate()
        .filter(|&(_, r)| r.is_eligible() && filter(r))
        .map(|(idx, _)| idx)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENERAL: [Capability; 4] = Capability::ALL;

    fn record(id: &str, secret: &str, capabilities: &[Capability]) -> CredentialRecord {
        CredentialRecord::new(
            id,
            id.to_uppercase(),
            Secret::from(secret),
            capabilities.iter().copied(),
        )
    }

    fn router(records: Vec<CredentialRecord>) -> (Arc<KeyPool>, CapabilityRouter) {
        let pool = Arc::new(KeyPool::new(records));
        (pool.clone(), CapabilityRouter::new(pool))
    }

    async fn last_used(pool: &KeyPool, id: &str) -> u64 {
        pool.get_all()
            .await
            .iter()
            .find(|r| r.id() == id)
            .map(|r| r.last_used_at())
            .unwrap()
    }

    #[tokio::test]
    async fn lru_scenario_alternates_between_general_and_specialist() {
        let (pool, router) = router(vec![
            record("A", "k1", &GENERAL).with_last_used_at(0),
            record("B", "k2", &[Capability::Image]).with_last_used_at(5),
        ]);

        let first = router.select_for(Capability::Image).await.unwrap();
        assert_eq!(first.id, "A");
        assert!(last_used(&pool, "A").await > 5);

        let second = router.select_for(Capability::Image).await.unwrap();
        assert_eq!(second.id, "B");
    }

    #[tokio::test]
    async fn selected_key_is_no_longer_oldest() {
        let (pool, router) = router(vec![
            record("a", "k1", &GENERAL).with_last_used_at(1),
            record("b", "k2", &GENERAL).with_last_used_at(2),
        ]);

        let selected = router.select_for(Capability::Text).await.unwrap();
        assert_eq!(selected.id, "a");
        assert!(last_used(&pool, "a").await > last_used(&pool, "b").await);
    }

    #[tokio::test]
    async fn ties_follow_declaration_order() {
        let (_pool, router) = router(vec![
            record("first", "k1", &GENERAL),
            record("second", "k2", &GENERAL),
            record("third", "k3", &GENERAL),
        ]);

        let order = [
            router.select_for(Capability::Text).await.unwrap().id,
            router.select_for(Capability::Text).await.unwrap().id,
            router.select_for(Capability::Text).await.unwrap().id,
            router.select_for(Capability::Text).await.unwrap().id,
        ];
        assert_eq!(order, ["first", "second", "third", "first"]);
    }

    #[tokio::test]
    async fn empty_secret_never_selected_while_configured_key_exists() {
        let (_pool, router) = router(vec![
            record("blank", "", &GENERAL),
            record("blank-image", "", &[Capability::Image]),
            record("real", "k1", &GENERAL).with_last_used_at(100),
        ]);

        for _ in 0..5 {
            let selected = router.select_for(Capability::Image).await.unwrap();
            assert_eq!(selected.id, "real");
        }
    }

    #[tokio::test]
    async fn specialist_used_when_no_general_key_is_active() {
        let (_pool, router) = router(vec![
            record("core", "k1", &GENERAL).with_status(KeyStatus::Exhausted),
            record("motion", "k2", &[Capability::Video]),
        ]);

        let selected = router.select_for(Capability::Video).await.unwrap();
        assert_eq!(selected.id, "motion");
    }

    #[tokio::test]
    async fn general_purpose_key_serves_capability_without_specialist() {
        let (_pool, router) = router(vec![
            record("imaging", "k1", &[Capability::Image]),
            record("core", "k2", &GENERAL),
        ]);

        let selected = router.select_for(Capability::Speech).await.unwrap();
        assert_eq!(selected.id, "core");
        assert_eq!(selected.status, KeyStatus::Active);
    }

    #[tokio::test]
    async fn fully_exhausted_pool_returns_first_record() {
        let (pool, router) = router(vec![
            record("primary", "k1", &GENERAL).with_status(KeyStatus::Exhausted),
            record("secondary", "k2", &GENERAL).with_status(KeyStatus::Exhausted),
        ]);

        let selected = router.select_for(Capability::Text).await.unwrap();
        assert_eq!(selected.id, "primary");
        assert_eq!(selected.status, KeyStatus::Exhausted);
        // Last resort does not count as a use
        assert_eq!(last_used(&pool, "primary").await, 0);
    }

    #[tokio::test]
    async fn unconfigured_pool_returns_first_record_with_empty_secret() {
        let (_pool, router) = router(vec![
            record("primary", "", &GENERAL),
            record("imaging", "", &[Capability::Image]),
        ]);

        let selected = router.select_for(Capability::Image).await.unwrap();
        assert_eq!(selected.id, "primary");
        assert!(selected.secret.is_blank());
    }

    #[tokio::test]
    async fn zero_records_is_an_error() {
        let (_pool, router) = router(vec![]);
        let err = router.select_for(Capability::Text).await.unwrap_err();
        assert!(matches!(err, Error::EmptyPool));
    }

    #[tokio::test]
    async fn selection_does_not_mutate_identity_fields() {
        let (pool, router) = router(vec![record("a", "k1", &[Capability::Text, Capability::Image])]);
        let before = pool.get_all().await;
        router.select_for(Capability::Text).await.unwrap();
        let after = pool.get_all().await;

        assert_eq!(before[0].id(), after[0].id());
        assert_eq!(before[0].label(), after[0].label());
        assert_eq!(before[0].capabilities(), after[0].capabilities());
        assert!(after[0].secret().matches("k1"));
        assert_eq!(after[0].status(), KeyStatus::Active);
    }

    #[tokio::test]
    async fn concurrent_selections_spread_across_keys() {
        let (_pool, router) = router(vec![
            record("a", "k1", &GENERAL),
            record("b", "k2", &GENERAL),
        ]);

        let mut handles = vec![];
        for _ in 0..4 {
            let router = router.clone();
            handles.push(tokio::spawn(async move {
                router.select_for(Capability::Text).await.unwrap().id
            }));
        }

        let mut ids = vec![];
        for h in handles {
            ids.push(h.await.unwrap());
        }
        let a = ids.iter().filter(|id| *id == "a").count();
        assert_eq!(a, 2, "selections under the write lock must alternate: {ids:?}");
    }
}
