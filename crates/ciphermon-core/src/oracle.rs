//! Decryption Oracle state machine.
//!
//! Per record: `Unanalyzed -> AnalysisRequested -> Revealed` (terminal).
//! Per model: `Idle -> MetricsRequested -> MetricsDelivered`, after which a new request may be
//! issued.
//!
//! Issuing a request is a three step protocol so that no collaborator call happens under the
//! oracle write guard:
//!
//! 1. reserve the target's in-flight slot (check-and-set under one write guard);
//! 2. call [`DecryptionCapability::begin_reveal`] with no lock held;
//! 3. commit the returned id as pending, or release the reservation if the call failed.
//!
//! Completion verifies the proof first, then consumes the request id under one write guard.
//! A consumed, expired or cancelled id is retired and never accepted again.
//!
//! A capability may deliver before step 3 runs. A verified callback for an id that is neither
//! pending nor retired is parked while some reservation is outstanding, and applied by the
//! commit that returns that id. Parked callbacks are bounded by the number of reservations and
//! discarded once none remain.

use crate::ciphertext::CiphertextTriple;
use crate::config::MonitorConfig;
use crate::events::MonitorEvent;
use crate::metrics::MonitorMetrics;
use crate::scoring::{AlertLevel, AlertState, ScoringPolicy};
use crate::store::{EarlyReveal, InFlight, MonitorStore, OracleTables, Retirement};
use crate::{
    deliver, AuthorizationPolicy, CallerId, Clock, Collaborators, DecryptionCapability,
    DecryptionProof, ModelId, ModelMetrics, MonitorError, NotificationSink, PlaintextTriple,
    ProofVerifier, RecordId, RequestId, Result, RevealCallback, RevealTarget,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// A decrypt request awaiting its callback.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub target: RevealTarget,
    pub issued_at_ms: i64,
    /// `None` when request expiry is disabled.
    pub expires_at_ms: Option<i64>,
    pub requested_by: CallerId,
}

impl PendingRequest {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at_ms, Some(deadline) if now_ms >= deadline)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisPhase {
    Unanalyzed,
    AnalysisRequested,
    Revealed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsPhase {
    Idle,
    MetricsRequested,
    MetricsDelivered,
}

/// A consumed reveal, announced once the oracle guard is released.
enum Settled {
    Alert { record_id: RecordId, state: AlertState },
    Metrics { model_id: ModelId },
}

pub struct DecryptionOracle {
    store: Arc<MonitorStore>,
    auth: Arc<dyn AuthorizationPolicy>,
    capability: Arc<dyn DecryptionCapability>,
    verifier: Arc<dyn ProofVerifier>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MonitorMetrics>,
    scoring: ScoringPolicy,
    request_ttl_ms: Option<u64>,
    max_pending_requests: usize,
}

impl DecryptionOracle {
    pub fn new(store: Arc<MonitorStore>, collaborators: &Collaborators, config: &MonitorConfig) -> Self {
        Self {
            store,
            auth: Arc::clone(&collaborators.auth),
            capability: Arc::clone(&collaborators.capability),
            verifier: Arc::clone(&collaborators.verifier),
            sink: Arc::clone(&collaborators.sink),
            clock: Arc::clone(&collaborators.clock),
            metrics: Arc::new(MonitorMetrics::new()),
            scoring: config.scoring.clone(),
            request_ttl_ms: config.oracle.request_ttl_ms,
            max_pending_requests: config.oracle.max_pending_requests,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MonitorMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<MonitorMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Ask the decryption capability to reveal one record's three plaintexts.
    #[instrument(skip(self), fields(%caller, %record_id))]
    pub fn request_analysis(&self, caller: &CallerId, record_id: RecordId) -> Result<RequestId> {
        let target = RevealTarget::Record(record_id);
        let ciphertexts = {
            let registry = self.store.registry_read()?;
            let mut oracle = self.store.oracle_write()?;

            let record = registry
                .records
                .get(&record_id)
                .ok_or(MonitorError::UnknownRecord(record_id))?;
            self.authorize(caller, &record.model_id)?;

            let revealed = oracle
                .alerts
                .get(&record_id)
                .map(|a| a.revealed)
                .ok_or(MonitorError::UnknownRecord(record_id))?;
            if revealed {
                return Err(MonitorError::AlreadyAnalyzed(record_id));
            }
            self.reserve(&mut oracle, &target)?;
            record.ciphertexts()
        };

        let (request_id, settled) =
            self.issue(caller, &target, &ciphertexts, RevealCallback::Analysis)?;
        self.metrics.analyses_requested.inc();
        info!(%request_id, "analysis requested");
        deliver(
            self.sink.as_ref(),
            MonitorEvent::AnalysisRequested {
                record_id,
                request_id,
            },
        );
        if let Some(settled) = settled {
            self.announce(request_id, settled, 0);
        }
        Ok(request_id)
    }

    /// Deliver the plaintexts for an analysis request and reveal the record's alert state.
    ///
    /// The proof is checked before anything else, so a forged callback learns nothing about
    /// which request ids are live and never changes state.
    ///
    /// A callback that arrives while its request is still being issued is parked; the returned
    /// state is written when the issuing call commits the id.
    #[instrument(skip(self, plaintext, proof), fields(%request_id))]
    pub fn complete_analysis(
        &self,
        request_id: RequestId,
        plaintext: PlaintextTriple,
        proof: &DecryptionProof,
    ) -> Result<AlertState> {
        self.check_proof(&request_id, &plaintext, proof)?;
        let now = self.clock.now_ms();

        let (record_id, state, latency_ms) = {
            let mut oracle = self.store.oracle_write()?;
            if park_early(&mut oracle, request_id, RevealCallback::Analysis, plaintext) {
                return Ok(AlertState::revealed(
                    self.scoring.evaluate(&plaintext.analysis_inputs()),
                ));
            }

            let pending = self.live_request(&oracle, &request_id)?;
            let record_id = match pending.target {
                RevealTarget::Record(id) => id,
                RevealTarget::Model(_) => return Err(MonitorError::UnknownRequest(request_id)),
            };

            if pending.is_expired(now) {
                oracle.retire(&request_id, Retirement::Expired);
                self.metrics.pending_requests.set(oracle.pending.len() as u64);
                drop(oracle);
                let expired_at = pending.expires_at_ms.unwrap_or(now);
                return Err(self.expired(request_id, expired_at));
            }

            match oracle.alerts.get(&record_id).map(|a| a.revealed) {
                None => return Err(MonitorError::UnknownRecord(record_id)),
                Some(true) => {
                    oracle.retire(&request_id, Retirement::Consumed);
                    self.metrics.pending_requests.set(oracle.pending.len() as u64);
                    return Err(MonitorError::AlreadyAnalyzed(record_id));
                }
                Some(false) => {}
            }

            let state = self.consume_analysis(&mut oracle, &request_id, record_id, &plaintext);
            (record_id, state, now.saturating_sub(pending.issued_at_ms))
        };

        self.announce(request_id, Settled::Alert { record_id, state }, latency_ms);
        Ok(state)
    }

    /// Ask the decryption capability to reveal a model's aggregate totals.
    #[instrument(skip(self), fields(%caller, %model_id))]
    pub fn request_model_metrics_decryption(
        &self,
        caller: &CallerId,
        model_id: &ModelId,
    ) -> Result<RequestId> {
        let target = RevealTarget::Model(model_id.clone());
        let ciphertexts = {
            let registry = self.store.registry_read()?;
            let mut oracle = self.store.oracle_write()?;

            let aggregate = registry
                .aggregates
                .get(model_id)
                .ok_or_else(|| MonitorError::UnknownModel(model_id.clone()))?;
            self.authorize(caller, model_id)?;
            self.reserve(&mut oracle, &target)?;
            aggregate.ciphertexts()
        };

        let (request_id, settled) =
            self.issue(caller, &target, &ciphertexts, RevealCallback::ModelMetrics)?;
        self.metrics.metrics_requested.inc();
        info!(%request_id, "model metrics requested");
        deliver(
            self.sink.as_ref(),
            MonitorEvent::MetricsRequested {
                model_id: model_id.clone(),
                request_id,
            },
        );
        if let Some(settled) = settled {
            self.announce(request_id, settled, 0);
        }
        Ok(request_id)
    }

    /// Deliver a model's decrypted totals. The values are handed back and never stored.
    #[instrument(skip(self, plaintext, proof), fields(%request_id))]
    pub fn complete_model_metrics_decryption(
        &self,
        request_id: RequestId,
        plaintext: PlaintextTriple,
        proof: &DecryptionProof,
    ) -> Result<ModelMetrics> {
        self.check_proof(&request_id, &plaintext, proof)?;
        let now = self.clock.now_ms();

        let (model_id, latency_ms) = {
            let mut oracle = self.store.oracle_write()?;
            if park_early(&mut oracle, request_id, RevealCallback::ModelMetrics, plaintext) {
                return Ok(plaintext.model_metrics());
            }

            let pending = self.live_request(&oracle, &request_id)?;
            let model_id = match pending.target {
                RevealTarget::Model(ref id) => id.clone(),
                RevealTarget::Record(_) => return Err(MonitorError::UnknownRequest(request_id)),
            };

            if pending.is_expired(now) {
                oracle.retire(&request_id, Retirement::Expired);
                self.metrics.pending_requests.set(oracle.pending.len() as u64);
                drop(oracle);
                let expired_at = pending.expires_at_ms.unwrap_or(now);
                return Err(self.expired(request_id, expired_at));
            }

            self.consume_metrics(&mut oracle, &request_id, &model_id);
            (model_id, now.saturating_sub(pending.issued_at_ms))
        };

        self.announce(request_id, Settled::Metrics { model_id }, latency_ms);
        Ok(plaintext.model_metrics())
    }

    /// Current alert state of a record. Unrevealed records read as zeroed defaults.
    pub fn get_alert(&self, record_id: RecordId) -> Result<AlertState> {
        self.store
            .oracle_read()?
            .alerts
            .get(&record_id)
            .copied()
            .ok_or(MonitorError::UnknownRecord(record_id))
    }

    pub fn analysis_phase(&self, record_id: RecordId) -> Result<AnalysisPhase> {
        let oracle = self.store.oracle_read()?;
        let alert = oracle
            .alerts
            .get(&record_id)
            .ok_or(MonitorError::UnknownRecord(record_id))?;
        if alert.revealed {
            Ok(AnalysisPhase::Revealed)
        } else if oracle.in_flight.contains_key(&RevealTarget::Record(record_id)) {
            Ok(AnalysisPhase::AnalysisRequested)
        } else {
            Ok(AnalysisPhase::Unanalyzed)
        }
    }

    pub fn metrics_phase(&self, model_id: &ModelId) -> Result<MetricsPhase> {
        let registry = self.store.registry_read()?;
        if !registry.monitored_index.contains(model_id) {
            return Err(MonitorError::UnknownModel(model_id.clone()));
        }
        let oracle = self.store.oracle_read()?;
        if oracle
            .in_flight
            .contains_key(&RevealTarget::Model(model_id.clone()))
        {
            Ok(MetricsPhase::MetricsRequested)
        } else if oracle.metrics_deliveries.get(model_id).copied().unwrap_or(0) > 0 {
            Ok(MetricsPhase::MetricsDelivered)
        } else {
            Ok(MetricsPhase::Idle)
        }
    }

    /// Retire every pending request whose deadline has passed, freeing its target.
    #[instrument(skip(self))]
    pub fn expire_stale_requests(&self) -> Result<Vec<RequestId>> {
        let now = self.clock.now_ms();
        let mut expired = {
            let mut oracle = self.store.oracle_write()?;
            let stale: Vec<RequestId> = oracle
                .pending
                .values()
                .filter(|p| p.is_expired(now))
                .map(|p| p.request_id)
                .collect();
            for id in &stale {
                oracle.retire(id, Retirement::Expired);
            }
            self.metrics.pending_requests.set(oracle.pending.len() as u64);
            stale
        };
        expired.sort();

        for request_id in &expired {
            self.metrics.requests_expired.inc();
            deliver(
                self.sink.as_ref(),
                MonitorEvent::RequestExpired {
                    request_id: *request_id,
                },
            );
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired stale requests");
        }
        Ok(expired)
    }

    /// Withdraw a pending request. The caller must be authorized for the target's model.
    #[instrument(skip(self), fields(%caller, %request_id))]
    pub fn cancel_request(&self, caller: &CallerId, request_id: RequestId) -> Result<()> {
        {
            let registry = self.store.registry_read()?;
            let mut oracle = self.store.oracle_write()?;
            let pending = self.live_request(&oracle, &request_id)?;
            let model_id = match &pending.target {
                RevealTarget::Model(id) => id.clone(),
                RevealTarget::Record(id) => registry
                    .records
                    .get(id)
                    .map(|r| r.model_id.clone())
                    .ok_or(MonitorError::UnknownRecord(*id))?,
            };
            self.authorize(caller, &model_id)?;
            oracle.retire(&request_id, Retirement::Cancelled);
            self.metrics.pending_requests.set(oracle.pending.len() as u64);
        }

        self.metrics.requests_cancelled.inc();
        info!("request cancelled");
        deliver(
            self.sink.as_ref(),
            MonitorEvent::RequestCancelled { request_id },
        );
        Ok(())
    }

    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.store.oracle_read()?.pending.len())
    }

    fn authorize(&self, caller: &CallerId, model_id: &ModelId) -> Result<()> {
        if self.auth.is_authorized(caller, model_id) {
            return Ok(());
        }
        self.metrics.unauthorized_attempts.inc();
        warn!(%caller, %model_id, "request refused");
        Err(MonitorError::Unauthorized {
            caller: caller.clone(),
            model_id: model_id.clone(),
        })
    }

    /// Claim `target`'s in-flight slot. Caller holds the oracle write guard.
    fn reserve(&self, oracle: &mut OracleTables, target: &RevealTarget) -> Result<()> {
        if oracle.in_flight.contains_key(target) {
            return Err(MonitorError::AlreadyPending {
                target: target.clone(),
            });
        }
        // Reserved slots count too: each one becomes a pending request on commit.
        if oracle.in_flight.len() >= self.max_pending_requests {
            return Err(MonitorError::TooManyPending {
                limit: self.max_pending_requests,
            });
        }
        oracle.in_flight.insert(target.clone(), InFlight::Reserved);
        Ok(())
    }

    /// Steps 2 and 3 of the issue protocol for a target already reserved.
    ///
    /// Returns the reveal settled by a callback parked for the new id, if one arrived first.
    fn issue(
        &self,
        caller: &CallerId,
        target: &RevealTarget,
        ciphertexts: &CiphertextTriple,
        callback: RevealCallback,
    ) -> Result<(RequestId, Option<Settled>)> {
        let issued = self.capability.begin_reveal(ciphertexts, callback);
        let issued_at_ms = self.clock.now_ms();

        let mut oracle = self.store.oracle_write()?;
        let request_id = match issued {
            Ok(id) => id,
            Err(err) => {
                release(&mut oracle, target);
                warn!(%target, error = %err, "decryption capability refused request");
                return Err(match err {
                    MonitorError::Capability(_) => err,
                    other => MonitorError::Capability(other.to_string()),
                });
            }
        };

        if oracle.pending.contains_key(&request_id) || oracle.retired.contains_key(&request_id) {
            release(&mut oracle, target);
            warn!(%request_id, "decryption capability reused a request id");
            return Err(MonitorError::RequestIdCollision(request_id));
        }

        let expires_at_ms = self
            .request_ttl_ms
            .map(|ttl| issued_at_ms.saturating_add(i64::try_from(ttl).unwrap_or(i64::MAX)));
        oracle.pending.insert(
            request_id,
            PendingRequest {
                request_id,
                target: target.clone(),
                issued_at_ms,
                expires_at_ms,
                requested_by: caller.clone(),
            },
        );
        oracle
            .in_flight
            .insert(target.clone(), InFlight::Pending(request_id));
        debug!(%request_id, %target, ?expires_at_ms, "request pending");

        let parked = oracle.early.remove(&request_id);
        let settled = match parked {
            Some(early) => self.settle_early(&mut oracle, request_id, target, early),
            None => None,
        };
        discard_orphans(&mut oracle);
        self.metrics.pending_requests.set(oracle.pending.len() as u64);
        Ok((request_id, settled))
    }

    /// Apply a callback that was parked before `request_id` was committed.
    fn settle_early(
        &self,
        oracle: &mut OracleTables,
        request_id: RequestId,
        target: &RevealTarget,
        early: EarlyReveal,
    ) -> Option<Settled> {
        match (target, early.callback) {
            (RevealTarget::Record(record_id), RevealCallback::Analysis) => {
                let state =
                    self.consume_analysis(oracle, &request_id, *record_id, &early.plaintext);
                debug!(%request_id, "parked analysis callback applied");
                Some(Settled::Alert {
                    record_id: *record_id,
                    state,
                })
            }
            (RevealTarget::Model(model_id), RevealCallback::ModelMetrics) => {
                self.consume_metrics(oracle, &request_id, model_id);
                debug!(%request_id, "parked metrics callback applied");
                Some(Settled::Metrics {
                    model_id: model_id.clone(),
                })
            }
            _ => {
                warn!(%request_id, %target, "parked callback does not match its request; discarded");
                None
            }
        }
    }

    /// Write the revealed alert and retire the request. Caller holds the oracle write guard.
    fn consume_analysis(
        &self,
        oracle: &mut OracleTables,
        request_id: &RequestId,
        record_id: RecordId,
        plaintext: &PlaintextTriple,
    ) -> AlertState {
        let state = AlertState::revealed(self.scoring.evaluate(&plaintext.analysis_inputs()));
        oracle.alerts.insert(record_id, state);
        oracle.retire(request_id, Retirement::Consumed);
        self.metrics.pending_requests.set(oracle.pending.len() as u64);
        state
    }

    fn consume_metrics(&self, oracle: &mut OracleTables, request_id: &RequestId, model_id: &ModelId) {
        oracle.retire(request_id, Retirement::Consumed);
        *oracle.metrics_deliveries.entry(model_id.clone()).or_insert(0) += 1;
        self.metrics.pending_requests.set(oracle.pending.len() as u64);
    }

    /// Counters, log line and event for a consumed reveal. Runs with no lock held.
    fn announce(&self, request_id: RequestId, settled: Settled, latency_ms: i64) {
        self.metrics.reveal_latency_ms.observe(latency_ms as f64);
        match settled {
            Settled::Alert { record_id, state } => {
                self.metrics.alerts_revealed.inc();
                if state.level == AlertLevel::Critical {
                    self.metrics.critical_alerts.inc();
                }
                if state.needs_retraining {
                    self.metrics.retraining_flags.inc();
                }
                info!(
                    %record_id,
                    score = state.score,
                    level = %state.level,
                    needs_retraining = state.needs_retraining,
                    "alert revealed"
                );
                deliver(
                    self.sink.as_ref(),
                    MonitorEvent::AlertRevealed {
                        record_id,
                        request_id,
                        level: state.level,
                        needs_retraining: state.needs_retraining,
                    },
                );
            }
            Settled::Metrics { model_id } => {
                self.metrics.metrics_delivered.inc();
                info!(%model_id, "model metrics delivered");
                deliver(
                    self.sink.as_ref(),
                    MonitorEvent::MetricsDelivered {
                        model_id,
                        request_id,
                    },
                );
            }
        }
    }

    fn check_proof(
        &self,
        request_id: &RequestId,
        plaintext: &PlaintextTriple,
        proof: &DecryptionProof,
    ) -> Result<()> {
        if self.verifier.verify(request_id, plaintext, proof) {
            return Ok(());
        }
        self.metrics.proof_failures.inc();
        warn!("decryption proof rejected");
        Err(MonitorError::InvalidProof(*request_id))
    }

    fn live_request(&self, oracle: &OracleTables, request_id: &RequestId) -> Result<PendingRequest> {
        match oracle.pending.get(request_id) {
            Some(p) => Ok(p.clone()),
            None => {
                if let Some(why) = oracle.retired.get(request_id) {
                    self.metrics.replays_rejected.inc();
                    warn!(%request_id, retired = ?why, "callback for retired request");
                }
                Err(MonitorError::UnknownRequest(*request_id))
            }
        }
    }

    fn expired(&self, request_id: RequestId, expired_at_ms: i64) -> MonitorError {
        self.metrics.requests_expired.inc();
        warn!(%request_id, expired_at_ms, "callback arrived after expiry");
        deliver(
            self.sink.as_ref(),
            MonitorEvent::RequestExpired { request_id },
        );
        MonitorError::RequestExpired {
            request_id,
            expired_at_ms,
        }
    }
}

/// Drop a reservation that never became a pending request.
fn release(oracle: &mut OracleTables, target: &RevealTarget) {
    if oracle.in_flight.get(target) == Some(&InFlight::Reserved) {
        oracle.in_flight.remove(target);
    }
    discard_orphans(oracle);
}

/// Park a verified callback for an id the capability has not handed back yet.
///
/// Only while a reservation is outstanding, and never for an id that is pending, retired or
/// already parked. Returns whether the callback was parked.
fn park_early(
    oracle: &mut OracleTables,
    request_id: RequestId,
    callback: RevealCallback,
    plaintext: PlaintextTriple,
) -> bool {
    if oracle.pending.contains_key(&request_id)
        || oracle.retired.contains_key(&request_id)
        || oracle.early.contains_key(&request_id)
        || oracle.early.len() >= oracle.reservations()
    {
        return false;
    }
    oracle
        .early
        .insert(request_id, EarlyReveal { callback, plaintext });
    debug!(%request_id, ?callback, "callback parked until its request is committed");
    true
}

fn discard_orphans(oracle: &mut OracleTables) {
    let orphaned = oracle.drop_orphaned_early();
    if orphaned > 0 {
        warn!(orphaned, "discarded parked callbacks for requests that were never issued");
    }
}
