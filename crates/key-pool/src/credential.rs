//! Where an invocation gets its key from
//!
//! Pooled callers share the admin pool and benefit from failover. Personal
//! (bring-your-own-key) callers supply their own keys, which bypass the pool
//! entirely; a quota failure on a personal key is always surfaced.

use std::collections::HashMap;

use common::Secret;
use provider::Capability;

/// Credential mode for one invocation.
#[derive(Debug, Clone, Default)]
pub enum CredentialSource {
    #[default]
    Pooled,
    Personal(PersonalKeys),
}

impl CredentialSource {
    pub fn is_pooled(&self) -> bool {
        matches!(self, CredentialSource::Pooled)
    }
}

/// Caller-supplied keys: an optional key per capability plus a primary key
/// used for any capability without its own.
#[derive(Debug, Clone, Default)]
pub struct PersonalKeys {
    primary: Option<Secret<String>>,
    per_capability: HashMap<Capability, Secret<String>>,
}

impl PersonalKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blank values are ignored.
    pub fn with_primary(mut self, secret: Secret<String>) -> Self {
        if !secret.is_blank() {
            self.primary = Some(secret);
        }
        self
    }

    /// Blank values are ignored.
    pub fn with_capability(mut self, capability: Capability, secret: Secret<String>) -> Self {
        if !secret.is_blank() {
            self.per_capability.insert(capability, secret);
        }
        self
    }

    /// The capability-specific key, else the primary key.
    pub fn resolve(&self, capability: Capability) -> Option<&Secret<String>> {
        self.per_capability
            .get(&capability)
            .or(self.primary.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.per_capability.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_source_is_pooled() {
        assert!(CredentialSource::default().is_pooled());
        assert!(!CredentialSource::Personal(PersonalKeys::new()).is_pooled());
    }

    #[test]
    fn capability_key_wins_over_primary() {
        let keys = PersonalKeys::new()
            .with_primary(Secret::from("primary"))
            .with_capability(Capability::Image, Secret::from("image-only"));

        assert!(keys.resolve(Capability::Image).unwrap().matches("image-only"));
        assert!(keys.resolve(Capability::Text).unwrap().matches("primary"));
    }

    #[test]
    fn blank_keys_are_absent() {
        let keys = PersonalKeys::new()
            .with_primary(Secret::from("  "))
            .with_capability(Capability::Video, Secret::empty());

        assert!(keys.is_empty());
        assert!(keys.resolve(Capability::Video).is_none());
    }
}
