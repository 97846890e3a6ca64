//! Retrying invocation with quota failover
//!
//! Wraps one remote generation call. Each attempt resolves a key (from the
//! pool via the router, or from the caller's personal keys), binds a client
//! to it and runs the operation. A quota failure on a pooled key exhausts the
//! key and starts another attempt with a fresh selection, up to `max_retries`
//! extra attempts. Every other failure is returned to the caller untouched.
//!
//! Per-invocation states:
//! - Attempt(n) → Success
//! - Attempt(n) → quota failure, pooled, n < max_retries → Attempt(n + 1)
//! - Attempt(n) → terminal failure (non-quota, personal key, or budget spent)

use std::future::Future;
use std::sync::Arc;

use common::Secret;
use provider::{Capability, ClientFactory, ProviderError, Workload};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::credential::CredentialSource;
use crate::error::{Error, Result};
use crate::exhaustion::ExhaustionTracker;
use crate::pool::KeyPool;
use crate::router::CapabilityRouter;

/// Extra attempts after the first when a pooled key runs out of quota.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Label reported for caller-supplied keys.
pub const PERSONAL_KEY_LABEL: &str = "Personal Key";

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Published each time the invoker abandons a key and retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailoverEvent {
    pub workload: Workload,
    /// Label of the key that hit its quota
    pub abandoned_label: String,
    /// Zero-based attempt that failed
    pub attempt: u32,
}

/// Key resolved for a single attempt.
struct BoundKey {
    secret: Secret<String>,
    label: String,
}

/// Runs generation calls against the key pool with bounded failover.
pub struct RetryingInvoker<F> {
    pool: Arc<KeyPool>,
    router: CapabilityRouter,
    tracker: ExhaustionTracker,
    factory: F,
    max_retries: u32,
    events: broadcast::Sender<FailoverEvent>,
}

impl<F: ClientFactory> RetryingInvoker<F> {
    pub fn new(pool: Arc<KeyPool>, factory: F, max_retries: u32) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            router: CapabilityRouter::new(pool.clone()),
            tracker: ExhaustionTracker::new(pool.clone()),
            pool,
            factory,
            max_retries,
            events,
        }
    }

    /// Receive failover notifications. Events sent while nobody listens are dropped.
    pub fn subscribe(&self) -> broadcast::Receiver<FailoverEvent> {
        self.events.subscribe()
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Clear exhaustion on every pool key.
    pub async fn reset_pool(&self) {
        self.tracker.reset_all().await;
    }

    /// Run `operation` for `workload`, failing over across pool keys on quota errors.
    ///
    /// The operation is called once per attempt with a client bound to that
    /// attempt's key, so it must be repeatable. Its result is returned as-is.
    pub async fn invoke<T, Op, Fut>(
        &self,
        workload: Workload,
        source: &CredentialSource,
        operation: Op,
    ) -> Result<T>
    where
        Op: Fn(F::Client) -> Fut,
        Fut: Future<Output = provider::Result<T>>,
    {
        let capability = workload.capability();
        let mut attempt: u32 = 0;

        let failure = loop {
            let key = self.resolve(capability, source).await?;
            debug!(workload = %workload, key = %key.label, attempt, "invoking generation call");

            match operation(self.factory.bind(&key.secret)).await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(workload = %workload, key = %key.label, attempt, "generation succeeded after failover");
                    }
                    return Ok(value);
                }
                Err(err) if self.can_fail_over(&err, source, attempt) => {
                    self.tracker.mark_exhausted(key.secret.expose()).await;
                    warn!(
                        workload = %workload,
                        key = %key.label,
                        retries_remaining = self.max_retries - attempt - 1,
                        error = %err,
                        "quota exhausted, failing over to next key"
                    );
                    metrics::counter!("pool_failovers_total", "workload" => workload.as_str())
                        .increment(1);
                    // No subscribers is fine
                    let _ = self.events.send(FailoverEvent {
                        workload,
                        abandoned_label: key.label,
                        attempt,
                    });
                    attempt += 1;
                }
                Err(err) => break err,
            }
        };

        debug!(workload = %workload, attempts = attempt + 1, error = %failure, "generation call failed");
        Err(Error::Provider(failure))
    }

    fn can_fail_over(&self, err: &ProviderError, source: &CredentialSource, attempt: u32) -> bool {
        err.is_quota() && source.is_pooled() && attempt < self.max_retries
    }

    async fn resolve(&self, capability: Capability, source: &CredentialSource) -> Result<BoundKey> {
        match source {
            CredentialSource::Pooled => {
                let selected = self.router.select_for(capability).await?;
                if selected.secret.is_blank() {
                    return Err(Error::MissingCredential(capability));
                }
                Ok(BoundKey {
                    secret: selected.secret,
                    label: selected.label,
                })
            }
            CredentialSource::Personal(keys) => match keys.resolve(capability) {
                Some(secret) => Ok(BoundKey {
                    secret: secret.clone(),
                    label: PERSONAL_KEY_LABEL.to_string(),
                }),
                None => Err(Error::MissingCredential(capability)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::PersonalKeys;
    use crate::pool::{CredentialRecord, KeyStatus};
    use std::sync::Mutex;

    /// Client is just the bound secret, so operations can script per-key outcomes.
    struct EchoFactory;

    impl ClientFactory for EchoFactory {
        type Client = String;

        fn bind(&self, secret: &Secret<String>) -> String {
            secret.expose().clone()
        }
    }

    fn general(id: &str, secret: &str) -> CredentialRecord {
        CredentialRecord::new(id, format!("{id} node"), Secret::from(secret), Capability::ALL)
    }

    fn invoker(records: Vec<CredentialRecord>, max_retries: u32) -> RetryingInvoker<EchoFactory> {
        RetryingInvoker::new(Arc::new(KeyPool::new(records)), EchoFactory, max_retries)
    }

    type CallLog = Arc<Mutex<Vec<String>>>;

    /// Operation that records each bound key and fails with `fail` for keys in `failing`.
    fn scripted(
        log: &CallLog,
        failing: &'static [&'static str],
        fail: ProviderError,
    ) -> impl Fn(String) -> std::future::Ready<provider::Result<String>> {
        let log = log.clone();
        move |key: String| {
            log.lock().unwrap().push(key.clone());
            if failing.contains(&key.as_str()) {
                std::future::ready(Err(fail.clone()))
            } else {
                std::future::ready(Ok(format!("result from {key}")))
            }
        }
    }

    async fn status_of(invoker: &RetryingInvoker<EchoFactory>, id: &str) -> KeyStatus {
        invoker
            .pool()
            .get_all()
            .await
            .into_iter()
            .find(|r| r.id() == id)
            .map(|r| r.status())
            .unwrap()
    }

    fn quota() -> ProviderError {
        ProviderError::QuotaExceeded("429 RESOURCE_EXHAUSTED".into())
    }

    #[tokio::test]
    async fn success_returns_result_unchanged() {
        let invoker = invoker(vec![general("a", "k1")], DEFAULT_MAX_RETRIES);
        let log = CallLog::default();

        let out = invoker
            .invoke(Workload::Text, &CredentialSource::Pooled, scripted(&log, &[], quota()))
            .await
            .unwrap();

        assert_eq!(out, "result from k1");
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn quota_failure_fails_over_to_next_key() {
        let invoker = invoker(vec![general("a", "k1"), general("b", "k2")], DEFAULT_MAX_RETRIES);
        let mut events = invoker.subscribe();
        let log = CallLog::default();

        let out = invoker
            .invoke(Workload::Image, &CredentialSource::Pooled, scripted(&log, &["k1"], quota()))
            .await
            .unwrap();

        assert_eq!(out, "result from k2");
        assert_eq!(*log.lock().unwrap(), vec!["k1", "k2"]);
        assert_eq!(status_of(&invoker, "a").await, KeyStatus::Exhausted);
        assert_eq!(status_of(&invoker, "b").await, KeyStatus::Active);

        let event = events.try_recv().unwrap();
        assert_eq!(
            event,
            FailoverEvent {
                workload: Workload::Image,
                abandoned_label: "a node".into(),
                attempt: 0,
            }
        );
        assert!(events.try_recv().is_err(), "exactly one failover expected");
    }

    #[tokio::test]
    async fn persistent_quota_stops_after_retry_budget() {
        let invoker = invoker(
            vec![
                general("a", "k1"),
                general("b", "k2"),
                general("c", "k3"),
                general("d", "k4"),
            ],
            2,
        );
        let log = CallLog::default();

        let err = invoker
            .invoke(
                Workload::Text,
                &CredentialSource::Pooled,
                scripted(&log, &["k1", "k2", "k3", "k4"], quota()),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Provider(ProviderError::QuotaExceeded(_))));
        assert_eq!(*log.lock().unwrap(), vec!["k1", "k2", "k3"]);
        // The last attempt had no retries left, so its key is not penalized
        assert_eq!(status_of(&invoker, "a").await, KeyStatus::Exhausted);
        assert_eq!(status_of(&invoker, "b").await, KeyStatus::Exhausted);
        assert_eq!(status_of(&invoker, "c").await, KeyStatus::Active);
        assert_eq!(status_of(&invoker, "d").await, KeyStatus::Active);
    }

    #[tokio::test]
    async fn exhausted_pool_retries_on_last_resort_record() {
        let invoker = invoker(vec![general("a", "k1"), general("b", "k2")], 2);
        let log = CallLog::default();

        let err = invoker
            .invoke(
                Workload::Text,
                &CredentialSource::Pooled,
                scripted(&log, &["k1", "k2"], quota()),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Provider(ProviderError::QuotaExceeded(_))));
        // Third attempt lands on the first record once both are exhausted
        assert_eq!(*log.lock().unwrap(), vec!["k1", "k2", "k1"]);
    }

    #[tokio::test]
    async fn non_quota_failure_is_not_retried() {
        let invoker = invoker(vec![general("a", "k1"), general("b", "k2")], 5);
        let mut events = invoker.subscribe();
        let log = CallLog::default();

        let err = invoker
            .invoke(
                Workload::Text,
                &CredentialSource::Pooled,
                scripted(&log, &["k1", "k2"], ProviderError::Validation("bad schema".into())),
            )
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "invalid request: bad schema");
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(status_of(&invoker, "a").await, KeyStatus::Active);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn transport_failure_is_not_retried() {
        let invoker = invoker(vec![general("a", "k1"), general("b", "k2")], 2);
        let log = CallLog::default();

        let err = invoker
            .invoke(
                Workload::Video,
                &CredentialSource::Pooled,
                scripted(&log, &["k1"], ProviderError::Transport("connection reset".into())),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Provider(ProviderError::Transport(_))));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn personal_mode_never_fails_over() {
        let invoker = invoker(vec![general("a", "k1"), general("b", "k2")], 2);
        let mut events = invoker.subscribe();
        let log = CallLog::default();
        let source =
            CredentialSource::Personal(PersonalKeys::new().with_primary(Secret::from("mine")));

        let err = invoker
            .invoke(Workload::Text, &source, scripted(&log, &["mine"], quota()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Provider(ProviderError::QuotaExceeded(_))));
        assert_eq!(*log.lock().unwrap(), vec!["mine"]);
        assert_eq!(status_of(&invoker, "a").await, KeyStatus::Active);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn personal_mode_bypasses_pool_selection() {
        let invoker = invoker(vec![general("a", "k1")], 2);
        let log = CallLog::default();
        let source = CredentialSource::Personal(
            PersonalKeys::new()
                .with_primary(Secret::from("mine"))
                .with_capability(Capability::Speech, Secret::from("mine-tts")),
        );

        let out = invoker
            .invoke(Workload::Speech, &source, scripted(&log, &[], quota()))
            .await
            .unwrap();

        assert_eq!(out, "result from mine-tts");
        let pool = invoker.pool().get_all().await;
        assert_eq!(pool[0].last_used_at(), 0, "pool must not be touched");
    }

    #[tokio::test]
    async fn personal_mode_without_key_is_configuration_error() {
        let invoker = invoker(vec![general("a", "k1")], 2);
        let log = CallLog::default();
        let source = CredentialSource::Personal(
            PersonalKeys::new().with_capability(Capability::Image, Secret::from("img")),
        );

        let err = invoker
            .invoke(Workload::Search, &source, scripted(&log, &[], quota()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::MissingCredential(Capability::Text)));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unconfigured_pool_is_configuration_error() {
        let invoker = invoker(
            vec![
                general("primary-core", ""),
                CredentialRecord::new("imaging", "Imaging", Secret::empty(), [Capability::Image]),
            ],
            2,
        );
        let log = CallLog::default();

        let err = invoker
            .invoke(Workload::Image, &CredentialSource::Pooled, scripted(&log, &[], quota()))
            .await
            .unwrap_err();

        assert!(err.is_configuration());
        assert!(err.to_string().contains("IMAGE"));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_pool_is_configuration_error() {
        let invoker = invoker(vec![], 2);
        let log = CallLog::default();

        let err = invoker
            .invoke(Workload::Text, &CredentialSource::Pooled, scripted(&log, &[], quota()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::EmptyPool));
    }

    #[tokio::test]
    async fn zero_retry_budget_means_single_attempt() {
        let invoker = invoker(vec![general("a", "k1"), general("b", "k2")], 0);
        let log = CallLog::default();

        let err = invoker
            .invoke(Workload::Text, &CredentialSource::Pooled, scripted(&log, &["k1"], quota()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Provider(ProviderError::QuotaExceeded(_))));
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(status_of(&invoker, "a").await, KeyStatus::Active);
    }

    #[tokio::test]
    async fn search_failover_reports_search_workload() {
        let invoker = invoker(vec![general("a", "k1"), general("b", "k2")], 2);
        let mut events = invoker.subscribe();
        let log = CallLog::default();

        invoker
            .invoke(Workload::Search, &CredentialSource::Pooled, scripted(&log, &["k1"], quota()))
            .await
            .unwrap();

        assert_eq!(events.try_recv().unwrap().workload, Workload::Search);
    }

    #[tokio::test]
    async fn reset_pool_reactivates_keys_for_next_call() {
        let invoker = invoker(vec![general("a", "k1"), general("b", "k2")], 2);
        let log = CallLog::default();

        invoker
            .invoke(Workload::Text, &CredentialSource::Pooled, scripted(&log, &["k1"], quota()))
            .await
            .unwrap();
        assert_eq!(status_of(&invoker, "a").await, KeyStatus::Exhausted);

        invoker.reset_pool().await;
        assert_eq!(status_of(&invoker, "a").await, KeyStatus::Active);
    }

    #[tokio::test]
    async fn async_operations_are_awaited_per_attempt() {
        let invoker = invoker(vec![general("a", "k1"), general("b", "k2")], 2);
        let attempts = Arc::new(Mutex::new(0u32));

        let out = invoker
            .invoke(Workload::Speech, &CredentialSource::Pooled, |key: String| {
                let attempts = attempts.clone();
                async move {
                    tokio::task::yield_now().await;
                    *attempts.lock().unwrap() += 1;
                    if key == "k1" {
                        Err(quota())
                    } else {
                        Ok(key.len())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(out, 2);
        assert_eq!(*attempts.lock().unwrap(), 2);
    }
}
