//! Private model-performance monitoring over encrypted inference records.
//!
//! Two components share one injected [`store::MonitorStore`]:
//!
//! - [`registry::RecordRegistry`] owns submitted [`registry::EncryptedRecord`]s, the per-model
//!   homomorphic [`registry::ModelAggregate`]s and the monitored-model index.
//! - [`oracle::DecryptionOracle`] owns pending decrypt requests and the single write point for
//!   each record's [`scoring::AlertState`].
//!
//! Everything cryptographic sits behind the collaborator traits defined here. The core never
//! decrypts anything itself; it only correlates asynchronous reveal callbacks back to their
//! targets, verifies them, and applies the scoring policy exactly once.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub mod access;
pub mod ciphertext;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod event_log;
pub mod events;
pub mod hash;
pub mod metrics;
pub mod observability;
pub mod oracle;
pub mod registry;
pub mod scoring;
pub mod simulator;
pub mod store;

pub use ciphertext::{CiphertextHandle, CiphertextTriple};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MonitorConfig;
pub use crypto::{DecryptionProof, DecryptionProofSigner, Ed25519ProofVerifier};
pub use events::MonitorEvent;
pub use oracle::{AnalysisPhase, DecryptionOracle, MetricsPhase};
pub use registry::RecordRegistry;
pub use scoring::{AlertLevel, AlertState, ScoringPolicy};
pub use store::MonitorStore;

/// Upper bound on the byte length of a model identifier.
pub const MAX_MODEL_ID_LEN: usize = 128;

/// 32-byte hash newtype used for request ids and commitments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes =
            hex::decode(s).map_err(|e| MonitorError::InvalidInput(format!("invalid hex: {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| MonitorError::InvalidInput("hash must be exactly 32 bytes".into()))?;
        Ok(Self(arr))
    }
}

/// Sequential record identifier. Allocated from 1 and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of a monitored model.
///
/// Non-empty, at most [`MAX_MODEL_ID_LEN`] bytes, no control characters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelId(String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(MonitorError::InvalidInput("model id must not be empty".into()));
        }
        if id.len() > MAX_MODEL_ID_LEN {
            return Err(MonitorError::InvalidInput(format!(
                "model id exceeds {MAX_MODEL_ID_LEN} bytes"
            )));
        }
        if id.chars().any(char::is_control) {
            return Err(MonitorError::InvalidInput(
                "model id must not contain control characters".into(),
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ModelId {
    type Error = MonitorError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ModelId> for String {
    fn from(value: ModelId) -> Self {
        value.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the party invoking an operation (wallet address, service principal, ...).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallerId(String);

impl CallerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier issued by the decryption capability for one reveal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub Hash32);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0 .0[..8]))
    }
}

/// What a decrypt request will be correlated back to when its callback lands.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RevealTarget {
    Record(RecordId),
    Model(ModelId),
}

impl fmt::Display for RevealTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevealTarget::Record(id) => write!(f, "record {id}"),
            RevealTarget::Model(id) => write!(f, "model {id}"),
        }
    }
}

/// Which completion entry point the decryption capability must call back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevealCallback {
    Analysis,
    ModelMetrics,
}

/// Three plaintext values delivered by a reveal, in the order the ciphertexts were packaged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaintextTriple(pub [u64; 3]);

impl PlaintextTriple {
    pub fn new(first: u64, second: u64, third: u64) -> Self {
        Self([first, second, third])
    }

    /// Interpret as `(input, prediction, ground_truth)` of one record.
    pub fn analysis_inputs(&self) -> AnalysisInputs {
        AnalysisInputs {
            input: self.0[0],
            prediction: self.0[1],
            ground_truth: self.0[2],
        }
    }

    /// Interpret as `(accuracy, drift, error)` accumulator totals of one model.
    pub fn model_metrics(&self) -> ModelMetrics {
        ModelMetrics {
            accuracy: self.0[0],
            drift: self.0[1],
            error: self.0[2],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisInputs {
    pub input: u64,
    pub prediction: u64,
    pub ground_truth: u64,
}

/// Plaintext view of a model aggregate, handed to the caller and never stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub accuracy: u64,
    pub drift: u64,
    pub error: u64,
}

/// Unified error type for ciphermon core operations.
#[derive(Debug, Error)]
pub enum MonitorError {
    // Access control
    #[error("Caller {caller} is not authorized for model {model_id}")]
    Unauthorized { caller: CallerId, model_id: ModelId },

    // Unknown targets
    #[error("Model {0} is not monitored")]
    UnknownModel(ModelId),

    #[error("Record {0} does not exist")]
    UnknownRecord(RecordId),

    #[error("Request {0} is unknown or already consumed")]
    UnknownRequest(RequestId),

    // State-machine guards
    #[error("Record {0} has already been analyzed")]
    AlreadyAnalyzed(RecordId),

    #[error("A decryption request is already pending for {target}")]
    AlreadyPending { target: RevealTarget },

    #[error("Request {request_id} expired at {expired_at_ms}ms")]
    RequestExpired {
        request_id: RequestId,
        expired_at_ms: i64,
    },

    #[error("Pending request limit of {limit} reached")]
    TooManyPending { limit: usize },

    // Decryption callback authenticity
    #[error("Decryption proof rejected")]
    InvalidProof(RequestId),

    #[error("Decryption capability reissued request id {0}")]
    RequestIdCollision(RequestId),

    // Inputs
    #[error("Malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Collaborators and infrastructure
    #[error("Decryption capability error: {0}")]
    Capability(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Event log error: {0}")]
    EventLog(String),
}

pub type Result<T> = std::result::Result<T, MonitorError>;

/// Decides whether a caller may act on a model.
pub trait AuthorizationPolicy: Send + Sync {
    /// Consulted before submit, aggregate update, analysis and metrics requests.
    fn is_authorized(&self, caller: &CallerId, model_id: &ModelId) -> bool;

    /// Called once, under the registry write lock, before `model_id` becomes monitored.
    ///
    /// An error aborts the submission; nothing is stored.
    fn on_model_registered(&self, _caller: &CallerId, _model_id: &ModelId) -> Result<()> {
        Ok(())
    }
}

/// Additive operations over ciphertext handles.
///
/// Implementations must never require the core to look inside a handle.
pub trait HomomorphicEvaluator: Send + Sync {
    /// Encryption of the additive identity.
    fn zero(&self) -> Result<CiphertextHandle>;

    /// Homomorphic sum `a + b`.
    fn add(&self, a: &CiphertextHandle, b: &CiphertextHandle) -> Result<CiphertextHandle>;
}

/// Asynchronous reveal service.
///
/// Postconditions:
/// - Returns a fresh request id; the plaintext and its proof arrive through the oracle
///   completion call selected by `callback`, possibly on another thread and possibly before
///   this call returns.
pub trait DecryptionCapability: Send + Sync {
    fn begin_reveal(
        &self,
        ciphertexts: &CiphertextTriple,
        callback: RevealCallback,
    ) -> Result<RequestId>;
}

/// Checks that a delivered plaintext is the correct decryption for `request_id`.
pub trait ProofVerifier: Send + Sync {
    /// Must be bound to `request_id` so a proof for one request never verifies for another.
    fn verify(&self, request_id: &RequestId, plaintext: &PlaintextTriple, proof: &DecryptionProof)
        -> bool;
}

/// Fire-and-forget receiver of [`MonitorEvent`]s.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &MonitorEvent) -> Result<()>;
}

/// External collaborators wired into both components.
#[derive(Clone)]
pub struct Collaborators {
    pub auth: Arc<dyn AuthorizationPolicy>,
    pub evaluator: Arc<dyn HomomorphicEvaluator>,
    pub capability: Arc<dyn DecryptionCapability>,
    pub verifier: Arc<dyn ProofVerifier>,
    pub sink: Arc<dyn NotificationSink>,
    pub clock: Arc<dyn Clock>,
}

pub(crate) fn deliver(sink: &dyn NotificationSink, event: MonitorEvent) {
    if let Err(err) = sink.notify(&event) {
        tracing::warn!(event = event.kind(), error = %err, "notification delivery failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_id_rejects_empty_and_oversized() {
        assert!(ModelId::new("").is_err());
        assert!(ModelId::new("x".repeat(MAX_MODEL_ID_LEN + 1)).is_err());
        assert!(ModelId::new("fraud\n").is_err());
        assert_eq!(ModelId::new("fraud-v2").unwrap().as_str(), "fraud-v2");
    }

    #[test]
    fn model_id_deserialization_validates() {
        let ok: ModelId = serde_json::from_str("\"churn\"").unwrap();
        assert_eq!(ok.as_str(), "churn");
        assert!(serde_json::from_str::<ModelId>("\"\"").is_err());
    }

    #[test]
    fn hash_hex_roundtrip_requires_32_bytes() {
        let h = Hash32([0xab; 32]);
        assert_eq!(Hash32::from_hex(&h.to_hex()).unwrap(), h);
        assert!(Hash32::from_hex("abcd").is_err());
        assert!(Hash32::from_hex("zz").is_err());
    }

    #[test]
    fn plaintext_views_follow_packaging_order() {
        let p = PlaintextTriple::new(10, 80, 70);
        let a = p.analysis_inputs();
        assert_eq!((a.input, a.prediction, a.ground_truth), (10, 80, 70));
        let m = p.model_metrics();
        assert_eq!((m.accuracy, m.drift, m.error), (10, 80, 70));
    }

    #[test]
    fn invalid_proof_message_does_not_name_request() {
        let err = MonitorError::InvalidProof(RequestId(Hash32([7; 32])));
        assert_eq!(err.to_string(), "Decryption proof rejected");
    }
}
