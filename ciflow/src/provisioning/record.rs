//! Provisioning records and the per-run ledger.

use crate::core::Capability;
use crate::utils::{now_utc, Timestamp};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// How a capability came to be present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionSource {
    /// The probe found it already installed.
    Probed,
    /// The install sequence ran.
    Installed,
}

/// One installed capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityEntry {
    /// Fingerprint of the recipe that produced it.
    pub fingerprint: String,
    /// How it got there.
    pub source: ProvisionSource,
    /// When it was recorded.
    pub recorded_at: Timestamp,
}

/// Installed capabilities of one execution context instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningRecord {
    /// The context instance id.
    pub context_id: Uuid,
    /// The context name.
    pub context: String,
    /// Recorded capabilities.
    pub capabilities: BTreeMap<Capability, CapabilityEntry>,
}

impl ProvisioningRecord {
    /// Creates an empty record.
    #[must_use]
    pub fn new(context_id: Uuid, context: impl Into<String>) -> Self {
        Self {
            context_id,
            context: context.into(),
            capabilities: BTreeMap::new(),
        }
    }

    /// Returns true if `capability` is recorded.
    #[must_use]
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains_key(&capability)
    }

    /// Returns the entry for `capability`.
    #[must_use]
    pub fn entry(&self, capability: Capability) -> Option<&CapabilityEntry> {
        self.capabilities.get(&capability)
    }
}

/// Per-run map from context id to its record.
///
/// Owned by one run; independent runs never share a ledger.
#[derive(Debug, Default)]
pub struct ProvisioningLedger {
    records: DashMap<Uuid, ProvisioningRecord>,
    locks: DashMap<(Uuid, Capability), Arc<tokio::sync::Mutex<()>>>,
}

impl ProvisioningLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the context's record.
    #[must_use]
    pub fn record(&self, context_id: Uuid) -> Option<ProvisioningRecord> {
        self.records.get(&context_id).map(|r| r.value().clone())
    }

    /// Returns true if `capability` is recorded for the context.
    #[must_use]
    pub fn has(&self, context_id: Uuid, capability: Capability) -> bool {
        self.records
            .get(&context_id)
            .is_some_and(|r| r.has(capability))
    }

    /// Records `capability` for the context and returns the updated record.
    pub fn mark(
        &self,
        context_id: Uuid,
        context: &str,
        capability: Capability,
        fingerprint: String,
        source: ProvisionSource,
    ) -> ProvisioningRecord {
        let mut record = self
            .records
            .entry(context_id)
            .or_insert_with(|| ProvisioningRecord::new(context_id, context));
        record.capabilities.insert(
            capability,
            CapabilityEntry {
                fingerprint,
                source,
                recorded_at: now_utc(),
            },
        );
        record.value().clone()
    }

    /// Forgets everything recorded for a context.
    pub fn forget(&self, context_id: Uuid) {
        self.records.remove(&context_id);
        self.locks.retain(|(id, _), _| *id != context_id);
    }

    /// The lock serializing provisioning of one capability in one context.
    pub(crate) fn lock_for(&self, context_id: Uuid, capability: Capability) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry((context_id, capability))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .value()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_forget() {
        let ledger = ProvisioningLedger::new();
        let id = Uuid::new_v4();
        assert!(!ledger.has(id, Capability::SqlDriver));

        let record = ledger.mark(id, "sql-runner", Capability::SqlDriver, "abc".into(), ProvisionSource::Installed);
        assert!(record.has(Capability::SqlDriver));
        assert_eq!(record.entry(Capability::SqlDriver).unwrap().source, ProvisionSource::Installed);
        assert!(ledger.has(id, Capability::SqlDriver));
        assert!(!ledger.has(Uuid::new_v4(), Capability::SqlDriver));
        assert_eq!(ledger.record(id).unwrap().context, "sql-runner");

        ledger.forget(id);
        assert!(ledger.record(id).is_none());
    }

    #[test]
    fn test_lock_is_shared_per_key() {
        let ledger = ProvisioningLedger::new();
        let id = Uuid::new_v4();
        let a = ledger.lock_for(id, Capability::SqlDriver);
        let b = ledger.lock_for(id, Capability::SqlDriver);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
