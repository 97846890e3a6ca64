//! Admin API key pool with capability routing and quota failover
//!
//! Holds the process-wide set of generation API keys, each tagged with the
//! capabilities it is authorized for. Calls are routed to the least recently
//! used active key that supports the requested capability, and a quota
//! failure on a pooled key exhausts that key and retries on the next one.
//!
//! Key lifecycle:
//! 1. Keys are built once at startup from configuration, status `Active`
//! 2. Router picks an eligible key per capability (specialist, then
//!    general-purpose, then the first record as a last resort)
//! 3. Upstream reports quota exhaustion → key marked `Exhausted`, invoker
//!    fails over while its retry budget lasts
//! 4. Admin reset → every key back to `Active` (no automatic recovery)

pub mod credential;
pub mod error;
pub mod exhaustion;
pub mod invoker;
pub mod pool;
pub mod router;

pub use credential::{CredentialSource, PersonalKeys};
pub use error::{Error, Result};
pub use exhaustion::ExhaustionTracker;
pub use invoker::{DEFAULT_MAX_RETRIES, FailoverEvent, PERSONAL_KEY_LABEL, RetryingInvoker};
pub use pool::{CredentialRecord, KeyDiagnostic, KeyPool, KeyStatus};
pub use router::{CapabilityRouter, SelectedKey};
