//! Shared, injected state for the registry and the oracle.
//!
//! Two tables, each behind its own `RwLock`:
//! - registry tables: records, aggregates, monitored-model index (written only by
//!   [`crate::registry::RecordRegistry`]);
//! - oracle tables: alert states, pending requests, in-flight slots, retired request ids and
//!   callbacks that beat their request's commit (written only by
//!   [`crate::oracle::DecryptionOracle`], except that the registry seeds an unrevealed alert
//!   state when a record is created).
//!
//! Lock order is always registry -> oracle. Every check-and-set happens under one write guard.
//! Nothing is ever removed from the registry tables.

use crate::oracle::PendingRequest;
use crate::registry::{EncryptedRecord, ModelAggregate};
use crate::scoring::AlertState;
use crate::{
    ModelId, MonitorError, PlaintextTriple, RecordId, RequestId, Result, RevealCallback, RevealTarget,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
pub(crate) struct RegistryTables {
    pub(crate) last_record_id: u64,
    pub(crate) records: BTreeMap<RecordId, EncryptedRecord>,
    pub(crate) records_by_model: HashMap<ModelId, Vec<RecordId>>,
    pub(crate) aggregates: HashMap<ModelId, ModelAggregate>,
    /// First-registration order, externally observable through `monitored_models`.
    pub(crate) monitored: Vec<ModelId>,
    pub(crate) monitored_index: HashSet<ModelId>,
}

/// Occupancy of a target's single in-flight slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum InFlight {
    /// Slot claimed; the capability has not answered yet.
    Reserved,
    Pending(RequestId),
}

/// Why a request id left the pending map. Retired ids are never accepted again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retirement {
    Consumed,
    Expired,
    Cancelled,
}

/// A verified callback whose request id the capability has not handed back yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct EarlyReveal {
    pub(crate) callback: RevealCallback,
    pub(crate) plaintext: PlaintextTriple,
}

#[derive(Debug, Default)]
pub(crate) struct OracleTables {
    pub(crate) alerts: HashMap<RecordId, AlertState>,
    pub(crate) pending: HashMap<RequestId, PendingRequest>,
    pub(crate) in_flight: HashMap<RevealTarget, InFlight>,
    pub(crate) retired: HashMap<RequestId, Retirement>,
    pub(crate) metrics_deliveries: HashMap<ModelId, u64>,
    /// At most one entry per outstanding reservation.
    pub(crate) early: HashMap<RequestId, EarlyReveal>,
}

impl OracleTables {
    /// Move `request_id` from pending to retired and free its target's slot.
    pub(crate) fn retire(&mut self, request_id: &RequestId, why: Retirement) -> Option<PendingRequest> {
        let pending = self.pending.remove(request_id)?;
        if self.in_flight.get(&pending.target) == Some(&InFlight::Pending(*request_id)) {
            self.in_flight.remove(&pending.target);
        }
        self.retired.insert(*request_id, why);
        Some(pending)
    }

    /// Slots claimed whose `begin_reveal` call has not returned yet.
    pub(crate) fn reservations(&self) -> usize {
        self.in_flight
            .values()
            .filter(|slot| **slot == InFlight::Reserved)
            .count()
    }

    /// Forget parked callbacks once no reservation could still claim them.
    pub(crate) fn drop_orphaned_early(&mut self) -> usize {
        if self.reservations() > 0 {
            return 0;
        }
        let orphaned = self.early.len();
        self.early.clear();
        orphaned
    }
}

#[derive(Debug, Default)]
pub struct MonitorStore {
    registry: RwLock<RegistryTables>,
    oracle: RwLock<OracleTables>,
}

impl MonitorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn registry_read(&self) -> Result<RwLockReadGuard<'_, RegistryTables>> {
        self.registry
            .read()
            .map_err(|_| MonitorError::StoreUnavailable("registry lock poisoned".into()))
    }

    pub(crate) fn registry_write(&self) -> Result<RwLockWriteGuard<'_, RegistryTables>> {
        self.registry
            .write()
            .map_err(|_| MonitorError::StoreUnavailable("registry lock poisoned".into()))
    }

    pub(crate) fn oracle_read(&self) -> Result<RwLockReadGuard<'_, OracleTables>> {
        self.oracle
            .read()
            .map_err(|_| MonitorError::StoreUnavailable("oracle lock poisoned".into()))
    }

    pub(crate) fn oracle_write(&self) -> Result<RwLockWriteGuard<'_, OracleTables>> {
        self.oracle
            .write()
            .map_err(|_| MonitorError::StoreUnavailable("oracle lock poisoned".into()))
    }

    /// How `request_id` was retired, if it was.
    pub fn retirement(&self, request_id: &RequestId) -> Result<Option<Retirement>> {
        Ok(self.oracle_read()?.retired.get(request_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Hash32;

    fn pending(id: u8, target: RevealTarget) -> PendingRequest {
        PendingRequest {
            request_id: RequestId(Hash32([id; 32])),
            target,
            issued_at_ms: 0,
            expires_at_ms: None,
            requested_by: crate::CallerId::new("op"),
        }
    }

    #[test]
    fn retire_frees_slot_and_remembers_id() {
        let mut t = OracleTables::default();
        let target = RevealTarget::Record(RecordId(1));
        let p = pending(1, target.clone());
        let id = p.request_id;
        t.pending.insert(id, p);
        t.in_flight.insert(target.clone(), InFlight::Pending(id));

        assert!(t.retire(&id, Retirement::Consumed).is_some());
        assert!(t.pending.is_empty());
        assert!(!t.in_flight.contains_key(&target));
        assert_eq!(t.retired.get(&id), Some(&Retirement::Consumed));

        // Second retire is a no-op.
        assert!(t.retire(&id, Retirement::Expired).is_none());
        assert_eq!(t.retired.get(&id), Some(&Retirement::Consumed));
    }

    #[test]
    fn retire_does_not_free_slot_owned_by_other_request() {
        let mut t = OracleTables::default();
        let target = RevealTarget::Record(RecordId(1));
        let stale = pending(1, target.clone());
        let stale_id = stale.request_id;
        t.pending.insert(stale_id, stale);
        t.in_flight.insert(target.clone(), InFlight::Reserved);

        t.retire(&stale_id, Retirement::Expired);
        assert_eq!(t.in_flight.get(&target), Some(&InFlight::Reserved));
    }

    #[test]
    fn parked_callbacks_outlive_only_their_reservations() {
        let mut t = OracleTables::default();
        let target = RevealTarget::Record(RecordId(1));
        t.in_flight.insert(target.clone(), InFlight::Reserved);
        t.early.insert(
            RequestId(Hash32([2; 32])),
            EarlyReveal {
                callback: RevealCallback::Analysis,
                plaintext: PlaintextTriple::new(1, 1, 1),
            },
        );

        assert_eq!(t.reservations(), 1);
        assert_eq!(t.drop_orphaned_early(), 0);
        assert_eq!(t.early.len(), 1);

        t.in_flight.remove(&target);
        assert_eq!(t.drop_orphaned_early(), 1);
        assert!(t.early.is_empty());
    }
}
