//! Encrypted Record Registry.
//!
//! Owns the canonical, append-only store of submitted records and the per-model homomorphic
//! accumulators. Records are immutable after submission; aggregates only ever grow by
//! homomorphic addition.

use crate::ciphertext::{CiphertextHandle, CiphertextTriple};
use crate::config::MonitorConfig;
use crate::events::MonitorEvent;
use crate::metrics::MonitorMetrics;
use crate::scoring::AlertState;
use crate::store::MonitorStore;
use crate::{
    deliver, AuthorizationPolicy, CallerId, Collaborators, HomomorphicEvaluator, ModelId,
    MonitorError, NotificationSink, RecordId, Result,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// One submitted inference record. Never mutated after creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRecord {
    pub id: RecordId,
    pub model_id: ModelId,
    pub encrypted_input: CiphertextHandle,
    pub encrypted_prediction: CiphertextHandle,
    pub encrypted_ground_truth: CiphertextHandle,
    pub created_at_ms: i64,
    pub submitted_by: CallerId,
}

impl EncryptedRecord {
    /// The three handles in reveal order: input, prediction, ground truth.
    pub fn ciphertexts(&self) -> CiphertextTriple {
        CiphertextTriple::new(
            self.encrypted_input.clone(),
            self.encrypted_prediction.clone(),
            self.encrypted_ground_truth.clone(),
        )
    }
}

/// Running homomorphic totals for one model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelAggregate {
    pub encrypted_accuracy_acc: CiphertextHandle,
    pub encrypted_drift_acc: CiphertextHandle,
    pub encrypted_error_acc: CiphertextHandle,
    /// Number of deltas folded in so far. Strictly increases with every update.
    pub update_count: u64,
}

impl ModelAggregate {
    fn identity(zero: CiphertextHandle) -> Self {
        Self {
            encrypted_accuracy_acc: zero.clone(),
            encrypted_drift_acc: zero.clone(),
            encrypted_error_acc: zero,
            update_count: 0,
        }
    }

    /// The three accumulators in reveal order: accuracy, drift, error.
    pub fn ciphertexts(&self) -> CiphertextTriple {
        CiphertextTriple::new(
            self.encrypted_accuracy_acc.clone(),
            self.encrypted_drift_acc.clone(),
            self.encrypted_error_acc.clone(),
        )
    }
}

pub struct RecordRegistry {
    store: Arc<MonitorStore>,
    auth: Arc<dyn AuthorizationPolicy>,
    evaluator: Arc<dyn HomomorphicEvaluator>,
    sink: Arc<dyn NotificationSink>,
    metrics: Arc<MonitorMetrics>,
    max_handle_bytes: usize,
}

impl RecordRegistry {
    pub fn new(store: Arc<MonitorStore>, collaborators: &Collaborators, config: &MonitorConfig) -> Self {
        Self {
            store,
            auth: Arc::clone(&collaborators.auth),
            evaluator: Arc::clone(&collaborators.evaluator),
            sink: Arc::clone(&collaborators.sink),
            metrics: Arc::new(MonitorMetrics::new()),
            max_handle_bytes: config.ciphertext.max_handle_bytes,
        }
    }

    /// Share a metrics instance (e.g. with the oracle and an exporter).
    pub fn with_metrics(mut self, metrics: Arc<MonitorMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Store a new encrypted record and return its id.
    ///
    /// Authorization, id allocation, model registration and alert seeding happen under one
    /// registry+oracle write guard, so concurrent first submissions for the same model register
    /// it exactly once. A failing registration hook aborts before anything is written.
    #[instrument(skip(self, input, prediction, ground_truth), fields(%caller, %model_id))]
    pub fn submit_record(
        &self,
        caller: &CallerId,
        model_id: &ModelId,
        input: CiphertextHandle,
        prediction: CiphertextHandle,
        ground_truth: CiphertextHandle,
        timestamp_ms: i64,
    ) -> Result<RecordId> {
        CiphertextTriple::new(input.clone(), prediction.clone(), ground_truth.clone())
            .check_well_formed(self.max_handle_bytes)?;

        let record_id = {
            let mut registry = self.store.registry_write()?;
            let mut oracle = self.store.oracle_write()?;

            if !self.auth.is_authorized(caller, model_id) {
                self.metrics.unauthorized_attempts.inc();
                warn!("submit refused");
                return Err(MonitorError::Unauthorized {
                    caller: caller.clone(),
                    model_id: model_id.clone(),
                });
            }

            let newly_monitored = !registry.monitored_index.contains(model_id);
            let identity = if newly_monitored {
                Some(ModelAggregate::identity(self.evaluator.zero()?))
            } else {
                None
            };

            let next = registry.last_record_id.checked_add(1).ok_or_else(|| {
                MonitorError::InvalidInput("record id space exhausted".into())
            })?;
            if newly_monitored {
                self.auth.on_model_registered(caller, model_id)?;
            }

            let record_id = RecordId(next);
            registry.last_record_id = next;

            registry.records.insert(
                record_id,
                EncryptedRecord {
                    id: record_id,
                    model_id: model_id.clone(),
                    encrypted_input: input,
                    encrypted_prediction: prediction,
                    encrypted_ground_truth: ground_truth,
                    created_at_ms: timestamp_ms,
                    submitted_by: caller.clone(),
                },
            );
            registry
                .records_by_model
                .entry(model_id.clone())
                .or_default()
                .push(record_id);

            if let Some(aggregate) = identity {
                registry.aggregates.insert(model_id.clone(), aggregate);
                registry.monitored.push(model_id.clone());
                registry.monitored_index.insert(model_id.clone());
                info!("model now monitored");
            }

            oracle.alerts.insert(record_id, AlertState::unrevealed());
            record_id
        };

        self.metrics.records_submitted.inc();
        debug!(%record_id, "record stored");
        deliver(
            self.sink.as_ref(),
            MonitorEvent::RecordRecorded {
                model_id: model_id.clone(),
                record_id,
                timestamp_ms,
            },
        );
        Ok(record_id)
    }

    /// Homomorphically add `deltas` (accuracy, drift, error) into the model's accumulators.
    ///
    /// Not idempotent: every call adds once more.
    #[instrument(skip(self, deltas), fields(%caller, %model_id))]
    pub fn update_aggregate(
        &self,
        caller: &CallerId,
        model_id: &ModelId,
        deltas: &CiphertextTriple,
    ) -> Result<u64> {
        deltas.check_well_formed(self.max_handle_bytes)?;

        let update_count = {
            let mut registry = self.store.registry_write()?;
            if !registry.monitored_index.contains(model_id) {
                return Err(MonitorError::UnknownModel(model_id.clone()));
            }
            if !self.auth.is_authorized(caller, model_id) {
                self.metrics.unauthorized_attempts.inc();
                return Err(MonitorError::Unauthorized {
                    caller: caller.clone(),
                    model_id: model_id.clone(),
                });
            }

            let aggregate = registry
                .aggregates
                .get_mut(model_id)
                .ok_or_else(|| MonitorError::UnknownModel(model_id.clone()))?;

            // Compute all three sums before writing any of them.
            let accuracy = self
                .evaluator
                .add(&aggregate.encrypted_accuracy_acc, &deltas.first)?;
            let drift = self
                .evaluator
                .add(&aggregate.encrypted_drift_acc, &deltas.second)?;
            let error = self
                .evaluator
                .add(&aggregate.encrypted_error_acc, &deltas.third)?;
            let update_count = aggregate.update_count.checked_add(1).ok_or_else(|| {
                MonitorError::InvalidInput("aggregate update counter exhausted".into())
            })?;

            aggregate.encrypted_accuracy_acc = accuracy;
            aggregate.encrypted_drift_acc = drift;
            aggregate.encrypted_error_acc = error;
            aggregate.update_count = update_count;
            update_count
        };

        self.metrics.aggregate_updates.inc();
        debug!(update_count, "aggregate updated");
        Ok(update_count)
    }

    /// Membership query over the monitored-model index.
    ///
    /// Reads as `false` when the store is unavailable; use [`Self::try_is_model_monitored`] to
    /// tell the two apart.
    pub fn is_model_monitored(&self, model_id: &ModelId) -> bool {
        match self.try_is_model_monitored(model_id) {
            Ok(monitored) => monitored,
            Err(err) => {
                warn!(%model_id, error = %err, "monitored-model lookup failed");
                false
            }
        }
    }

    pub fn try_is_model_monitored(&self, model_id: &ModelId) -> Result<bool> {
        Ok(self.store.registry_read()?.monitored_index.contains(model_id))
    }

    /// Monitored models in first-registration order.
    pub fn monitored_models(&self) -> Result<Vec<ModelId>> {
        Ok(self.store.registry_read()?.monitored.clone())
    }

    /// All record ids in allocation order.
    pub fn record_ids(&self) -> Result<Vec<RecordId>> {
        Ok(self.store.registry_read()?.records.keys().copied().collect())
    }

    pub fn records_for_model(&self, model_id: &ModelId) -> Result<Vec<RecordId>> {
        let registry = self.store.registry_read()?;
        if !registry.monitored_index.contains(model_id) {
            return Err(MonitorError::UnknownModel(model_id.clone()));
        }
        Ok(registry
            .records_by_model
            .get(model_id)
            .cloned()
            .unwrap_or_default())
    }

    pub fn record(&self, record_id: RecordId) -> Result<EncryptedRecord> {
        self.store
            .registry_read()?
            .records
            .get(&record_id)
            .cloned()
            .ok_or(MonitorError::UnknownRecord(record_id))
    }

    pub fn aggregate(&self, model_id: &ModelId) -> Result<ModelAggregate> {
        self.store
            .registry_read()?
            .aggregates
            .get(model_id)
            .cloned()
            .ok_or_else(|| MonitorError::UnknownModel(model_id.clone()))
    }

    pub fn record_count(&self) -> Result<usize> {
        Ok(self.store.registry_read()?.records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::ModelAcl;
    use crate::clock::ManualClock;
    use crate::events::MemorySink;
    use crate::simulator::LocalFheSimulator;

    struct Fixture {
        registry: RecordRegistry,
        fhe: Arc<LocalFheSimulator>,
        sink: Arc<MemorySink>,
        store: Arc<MonitorStore>,
    }

    fn fixture_with(config: MonitorConfig) -> Fixture {
        let auth = Arc::new(ModelAcl::new(config.access.open_registration));
        fixture_with_auth(config, auth)
    }

    fn fixture_with_auth(config: MonitorConfig, auth: Arc<dyn AuthorizationPolicy>) -> Fixture {
        let fhe = Arc::new(LocalFheSimulator::new());
        let sink = Arc::new(MemorySink::new());
        let collaborators = Collaborators {
            auth,
            evaluator: fhe.clone(),
            capability: fhe.clone(),
            verifier: Arc::new(fhe.verifier()),
            sink: sink.clone(),
            clock: Arc::new(ManualClock::new(0)),
        };
        let store = Arc::new(MonitorStore::new());
        Fixture {
            registry: RecordRegistry::new(store.clone(), &collaborators, &config),
            fhe,
            sink,
            store,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MonitorConfig::default())
    }

    fn model(s: &str) -> ModelId {
        ModelId::new(s).unwrap()
    }

    fn submit(f: &Fixture, caller: &str, m: &ModelId, values: (u64, u64, u64)) -> Result<RecordId> {
        f.registry.submit_record(
            &CallerId::new(caller),
            m,
            f.fhe.encrypt(values.0).unwrap(),
            f.fhe.encrypt(values.1).unwrap(),
            f.fhe.encrypt(values.2).unwrap(),
            1_700_000_000_000,
        )
    }

    #[test]
    fn ids_are_sequential_and_alerts_start_unrevealed() {
        let f = fixture();
        let m = model("fraud");
        let a = submit(&f, "alice", &m, (1, 2, 3)).unwrap();
        let b = submit(&f, "alice", &m, (4, 5, 6)).unwrap();
        assert_eq!(a, RecordId(1));
        assert_eq!(b, RecordId(2));

        let oracle = f.store.oracle_read().unwrap();
        assert_eq!(oracle.alerts.get(&a), Some(&AlertState::unrevealed()));
        assert_eq!(oracle.alerts.get(&b), Some(&AlertState::unrevealed()));
    }

    #[test]
    fn first_submit_registers_model_once() {
        let f = fixture();
        let m = model("fraud");
        assert!(!f.registry.is_model_monitored(&m));
        submit(&f, "alice", &m, (1, 1, 1)).unwrap();
        assert!(f.registry.is_model_monitored(&m));
        submit(&f, "alice", &m, (1, 1, 1)).unwrap();
        assert_eq!(f.registry.monitored_models().unwrap(), vec![m.clone()]);
        assert_eq!(f.registry.records_for_model(&m).unwrap().len(), 2);
        assert_eq!(f.registry.aggregate(&m).unwrap().update_count, 0);
    }

    #[test]
    fn monitored_models_keep_registration_order() {
        let f = fixture();
        for name in ["zeta", "alpha", "mid"] {
            submit(&f, "alice", &model(name), (1, 1, 1)).unwrap();
        }
        let names: Vec<_> = f
            .registry
            .monitored_models()
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn non_owner_submission_refused() {
        let f = fixture();
        let m = model("fraud");
        submit(&f, "alice", &m, (1, 1, 1)).unwrap();
        let err = submit(&f, "mallory", &m, (1, 1, 1)).unwrap_err();
        assert!(matches!(err, MonitorError::Unauthorized { .. }));
        assert_eq!(f.registry.record_count().unwrap(), 1);
    }

    #[test]
    fn closed_registration_refuses_unclaimed_model() {
        let f = fixture_with(
            MonitorConfig::builder()
                .open_registration(false)
                .build()
                .unwrap(),
        );
        let m = model("fraud");
        assert!(matches!(
            submit(&f, "alice", &m, (1, 1, 1)),
            Err(MonitorError::Unauthorized { .. })
        ));
        assert!(!f.registry.is_model_monitored(&m));
    }

    #[test]
    fn malformed_ciphertext_rejected_before_storage() {
        let f = fixture();
        let m = model("fraud");
        let err = f
            .registry
            .submit_record(
                &CallerId::new("alice"),
                &m,
                CiphertextHandle::from_bytes(Vec::new()),
                f.fhe.encrypt(1).unwrap(),
                f.fhe.encrypt(1).unwrap(),
                0,
            )
            .unwrap_err();
        assert!(matches!(err, MonitorError::MalformedCiphertext(_)));
        assert!(!f.registry.is_model_monitored(&m));
    }

    #[test]
    fn records_are_stored_verbatim() {
        let f = fixture();
        let m = model("fraud");
        let input = f.fhe.encrypt(10).unwrap();
        let id = f
            .registry
            .submit_record(
                &CallerId::new("alice"),
                &m,
                input.clone(),
                f.fhe.encrypt(20).unwrap(),
                f.fhe.encrypt(30).unwrap(),
                42,
            )
            .unwrap();
        let record = f.registry.record(id).unwrap();
        assert_eq!(record.encrypted_input, input);
        assert_eq!(record.created_at_ms, 42);
        assert_eq!(record.submitted_by, CallerId::new("alice"));
        assert!(matches!(
            f.registry.record(RecordId(99)),
            Err(MonitorError::UnknownRecord(_))
        ));
    }

    #[test]
    fn aggregate_updates_accumulate_twice() {
        let f = fixture();
        let m = model("fraud");
        let alice = CallerId::new("alice");
        submit(&f, "alice", &m, (1, 1, 1)).unwrap();

        let deltas = CiphertextTriple::new(
            f.fhe.encrypt(90).unwrap(),
            f.fhe.encrypt(3).unwrap(),
            f.fhe.encrypt(7).unwrap(),
        );
        let before = f.registry.aggregate(&m).unwrap();
        assert_eq!(f.registry.update_aggregate(&alice, &m, &deltas).unwrap(), 1);
        let once = f.registry.aggregate(&m).unwrap();
        assert_eq!(f.registry.update_aggregate(&alice, &m, &deltas).unwrap(), 2);
        let twice = f.registry.aggregate(&m).unwrap();

        assert_ne!(before.encrypted_accuracy_acc, once.encrypted_accuracy_acc);
        assert_ne!(once.encrypted_accuracy_acc, twice.encrypted_accuracy_acc);
        assert_eq!(f.fhe.decrypt(&twice.encrypted_accuracy_acc).unwrap(), 180);
        assert_eq!(f.fhe.decrypt(&twice.encrypted_drift_acc).unwrap(), 6);
        assert_eq!(f.fhe.decrypt(&twice.encrypted_error_acc).unwrap(), 14);
    }

    #[test]
    fn aggregate_update_requires_monitored_model_and_rights() {
        let f = fixture();
        let m = model("fraud");
        let deltas = CiphertextTriple::new(
            f.fhe.encrypt(1).unwrap(),
            f.fhe.encrypt(1).unwrap(),
            f.fhe.encrypt(1).unwrap(),
        );
        assert!(matches!(
            f.registry.update_aggregate(&CallerId::new("alice"), &m, &deltas),
            Err(MonitorError::UnknownModel(_))
        ));
        submit(&f, "alice", &m, (1, 1, 1)).unwrap();
        assert!(matches!(
            f.registry.update_aggregate(&CallerId::new("bob"), &m, &deltas),
            Err(MonitorError::Unauthorized { .. })
        ));
        assert_eq!(f.registry.aggregate(&m).unwrap().update_count, 0);
    }

    #[test]
    fn record_recorded_event_emitted() {
        let f = fixture();
        let m = model("fraud");
        let id = submit(&f, "alice", &m, (1, 1, 1)).unwrap();
        assert_eq!(
            f.sink.events(),
            vec![MonitorEvent::RecordRecorded {
                model_id: m,
                record_id: id,
                timestamp_ms: 1_700_000_000_000,
            }]
        );
    }

    #[test]
    fn concurrent_submissions_get_unique_ids() {
        let f = Arc::new(fixture());
        let m = model("fraud");
        submit(&f, "alice", &m, (1, 1, 1)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let f = Arc::clone(&f);
                let m = m.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| submit(&f, "alice", &m, (1, 2, 3)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<RecordId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 200);
        assert_eq!(f.registry.record_count().unwrap(), 201);
    }

    /// Authorizes everyone but cannot record ownership.
    struct BrokenRegistrar;

    impl AuthorizationPolicy for BrokenRegistrar {
        fn is_authorized(&self, _: &CallerId, _: &ModelId) -> bool {
            true
        }

        fn on_model_registered(&self, _: &CallerId, _: &ModelId) -> Result<()> {
            Err(MonitorError::StoreUnavailable("acl lock poisoned".into()))
        }
    }

    #[test]
    fn failed_registration_hook_stores_nothing() {
        let f = fixture_with_auth(MonitorConfig::default(), Arc::new(BrokenRegistrar));
        let m = model("fraud");

        let err = submit(&f, "alice", &m, (1, 1, 1)).unwrap_err();
        assert!(matches!(err, MonitorError::StoreUnavailable(_)));
        assert!(!f.registry.is_model_monitored(&m));
        assert_eq!(f.registry.record_count().unwrap(), 0);
        assert!(f.registry.monitored_models().unwrap().is_empty());
        assert!(f.store.oracle_read().unwrap().alerts.is_empty());
        assert!(f.sink.events().is_empty());
    }

    #[test]
    fn unavailable_store_is_reported_by_fallible_lookup() {
        let f = fixture();
        let m = model("fraud");
        submit(&f, "alice", &m, (1, 1, 1)).unwrap();

        let store = Arc::clone(&f.store);
        let _ = std::thread::spawn(move || {
            let _guard = store.registry_write().unwrap();
            panic!("poison the registry");
        })
        .join();

        assert!(matches!(
            f.registry.try_is_model_monitored(&m),
            Err(MonitorError::StoreUnavailable(_))
        ));
        assert!(!f.registry.is_model_monitored(&m));
    }
}
