//! Key records and the shared pool registry
//!
//! The pool owns the fixed list of credential records built at startup. Only
//! `status` and `last_used_at` change after construction; ids, labels,
//! secrets and capabilities are immutable for the life of the process.
//!
//! All state sits behind one `RwLock` so that routing (filter, pick, stamp)
//! happens under a single write guard and least-recently-used ordering stays
//! exact when several tasks select concurrently.

use std::collections::BTreeSet;

use common::Secret;
use provider::Capability;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::info;

/// Runtime status of a pool key.
///
/// Transitions:
/// - Active → Exhausted (quota failure detected on the key)
/// - Exhausted/Error → Active (explicit pool reset)
///
/// There is no time-based recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Exhausted,
    Error,
}

impl KeyStatus {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Exhausted => "exhausted",
            KeyStatus::Error => "error",
        }
    }
}

/// One credential in the pool.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    id: String,
    label: String,
    secret: Secret<String>,
    capabilities: BTreeSet<Capability>,
    status: KeyStatus,
    last_used_at: u64,
}

impl CredentialRecord {
    /// Create an active record that has never been selected.
    ///
    /// An empty `secret` marks the slot as unconfigured: the record stays in
    /// the pool for diagnostics but is never eligible for selection.
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        secret: Secret<String>,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            secret,
            capabilities: capabilities.into_iter().collect(),
            status: KeyStatus::Active,
            last_used_at: 0,
        }
    }

    /// Seed the last-use stamp (restored state, tests).
    pub fn with_last_used_at(mut self, last_used_at: u64) -> Self {
        self.last_used_at = last_used_at;
        self
    }

    pub fn with_status(mut self, status: KeyStatus) -> Self {
        self.status = status;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn secret(&self) -> &Secret<String> {
        &self.secret
    }

    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    pub fn status(&self) -> KeyStatus {
        self.status
    }

    pub fn last_used_at(&self) -> u64 {
        self.last_used_at
    }

    /// A non-empty secret is present.
    pub fn is_configured(&self) -> bool {
        !self.secret.is_blank()
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Carries every capability tag.
    pub fn is_general_purpose(&self) -> bool {
        Capability::ALL.iter().all(|c| self.capabilities.contains(c))
    }

    /// Active and configured. Capability filtering is the router's job.
    pub fn is_eligible(&self) -> bool {
        self.status == KeyStatus::Active && self.is_configured()
    }

    pub(crate) fn stamp(&mut self, now: u64) {
        self.last_used_at = now;
    }
}

/// Read-only view of a record for operator display. Never carries the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyDiagnostic {
    pub id: String,
    pub label: String,
    pub status: KeyStatus,
    pub configured: bool,
    pub capabilities: Vec<Capability>,
}

impl From<&CredentialRecord> for KeyDiagnostic {
    fn from(record: &CredentialRecord) -> Self {
        Self {
            id: record.id.clone(),
            label: record.label.clone(),
            status: record.status,
            configured: record.is_configured(),
            capabilities: record.capabilities.iter().copied().collect(),
        }
    }
}

/// Records plus the logical clock used for least-recently-used stamps.
#[derive(Debug)]
pub(crate) struct PoolState {
    pub(crate) records: Vec<CredentialRecord>,
    clock: u64,
}

impl PoolState {
    /// Advance the clock and return the new "now". Always greater than every
    /// stamp issued so far or seeded at construction.
    pub(crate) fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Process-wide registry of credential records.
///
/// Construct once and share via `Arc`. Records keep their declaration order,
/// which is the tie-break order for selection and the last-resort order.
#[derive(Debug)]
pub struct KeyPool {
    state: RwLock<PoolState>,
}

impl KeyPool {
    pub fn new(records: Vec<CredentialRecord>) -> Self {
        let clock = records.iter().map(|r| r.last_used_at).max().unwrap_or(0);
        let configured = records.iter().filter(|r| r.is_configured()).count();
        info!(keys = records.len(), configured, "key pool initialized");
        Self {
            state: RwLock::new(PoolState { records, clock }),
        }
    }

    /// Snapshot of every record.
    pub async fn get_all(&self) -> Vec<CredentialRecord> {
        self.state.read().await.records.clone()
    }

    /// First record whose secret equals `secret`.
    pub async fn find_by_secret(&self, secret: &str) -> Option<CredentialRecord> {
        let state = self.state.read().await;
        state
            .records
            .iter()
            .find(|r| r.secret.matches(secret))
            .cloned()
    }

    /// Set a record's status by id. Returns false if no record has that id.
    pub async fn set_status(&self, id: &str, status: KeyStatus) -> bool {
        let mut state = self.state.write().await;
        match state.records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.status = status;
                true
            }
            None => false,
        }
    }

    /// Return every record to `Active`. Idempotent.
    pub async fn reset_all(&self) {
        let mut state = self.state.write().await;
        for record in state.records.iter_mut() {
            record.status = KeyStatus::Active;
        }
        info!(keys = state.records.len(), "key pool status reset");
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Per-key label, status and capabilities for operator display.
    pub async fn diagnostics(&self) -> Vec<KeyDiagnostic> {
        let state = self.state.read().await;
        state.records.iter().map(KeyDiagnostic::from).collect()
    }

    /// Pool health summary for the health and admin endpoints.
    ///
    /// Status mapping over configured keys: all active → healthy, some
    /// active → degraded, none active (or none configured) → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let state = self.state.read().await;

        let mut configured = 0usize;
        let mut active = 0usize;
        let mut exhausted = 0usize;
        let mut errored = 0usize;

        for record in state.records.iter().filter(|r| r.is_configured()) {
            configured += 1;
            match record.status {
                KeyStatus::Active => active += 1,
                KeyStatus::Exhausted => exhausted += 1,
                KeyStatus::Error => errored += 1,
            }
        }

        let status = if configured > 0 && active == configured {
            "healthy"
        } else if active > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        let keys: Vec<KeyDiagnostic> = state.records.iter().map(KeyDiagnostic::from).collect();

        serde_json::json!({
            "status": status,
            "keys_total": state.records.len(),
            "keys_configured": configured,
            "keys_active": active,
            "keys_exhausted": exhausted,
            "keys_error": errored,
            "keys": keys
        })
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, PoolState> {
        self.state.write().await
    }
}
