//! Local stand-in for an FHE coprocessor and its threshold decryption service.
//!
//! # Security
//!
//! INSECURE. Handles are random tags looked up in an in-process plaintext table. There is no
//! encryption at all. Use only for demos and tests.

use crate::ciphertext::{CiphertextHandle, CiphertextTriple};
use crate::crypto::{DecryptionProof, DecryptionProofSigner, Ed25519ProofVerifier};
use crate::hash::derive_request_id_v1;
use crate::{
    DecryptionCapability, HomomorphicEvaluator, MonitorError, PlaintextTriple, RequestId, Result,
    RevealCallback,
};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

const HANDLE_LEN: usize = 32;

/// A signed reveal ready to be fed into the oracle's completion entry point.
#[derive(Clone, Debug)]
pub struct RevealDelivery {
    pub request_id: RequestId,
    pub callback: RevealCallback,
    pub plaintext: PlaintextTriple,
    pub proof: DecryptionProof,
}

struct RevealJob {
    request_id: RequestId,
    callback: RevealCallback,
    ciphertexts: CiphertextTriple,
}

#[derive(Default)]
struct SimState {
    plaintexts: HashMap<Vec<u8>, u64>,
    next_sequence: u64,
    queued: Vec<RevealJob>,
}

// =============================================================================
// LocalFheSimulator
// =============================================================================

/// Table-backed evaluator and decryption capability.
///
/// Addition wraps modulo 2^64, like a plaintext modulus would.
pub struct LocalFheSimulator {
    state: Mutex<SimState>,
    instance_salt: [u8; 16],
    signer: DecryptionProofSigner,
}

impl LocalFheSimulator {
    pub fn new() -> Self {
        Self::with_signer(DecryptionProofSigner::generate())
    }

    /// Use a fixed proof-signing key, e.g. one loaded from `ciphermon keygen` output.
    pub fn with_signer(signer: DecryptionProofSigner) -> Self {
        let mut instance_salt = [0u8; 16];
        OsRng.fill_bytes(&mut instance_salt);
        Self {
            state: Mutex::new(SimState::default()),
            instance_salt,
            signer,
        }
    }

    /// Verifier matching this simulator's proofs.
    pub fn verifier(&self) -> Ed25519ProofVerifier {
        self.signer.verifier()
    }

    pub fn encrypt(&self, value: u64) -> Result<CiphertextHandle> {
        let mut state = self.lock()?;
        Ok(Self::fresh_handle(&mut state, value))
    }

    pub fn decrypt(&self, handle: &CiphertextHandle) -> Result<u64> {
        let state = self.lock()?;
        lookup(&state, handle)
    }

    /// Number of reveals queued and not yet delivered.
    pub fn queued_reveals(&self) -> Result<usize> {
        Ok(self.lock()?.queued.len())
    }

    /// Decrypt and sign every queued reveal, in request order.
    pub fn deliver_all(&self) -> Result<Vec<RevealDelivery>> {
        let mut state = self.lock()?;
        let jobs = std::mem::take(&mut state.queued);
        let mut out = Vec::with_capacity(jobs.len());
        for job in jobs {
            let [a, b, c] = job.ciphertexts.handles();
            let plaintext =
                PlaintextTriple::new(lookup(&state, a)?, lookup(&state, b)?, lookup(&state, c)?);
            let proof = self.signer.sign_reveal(&job.request_id, &plaintext);
            out.push(RevealDelivery {
                request_id: job.request_id,
                callback: job.callback,
                plaintext,
                proof,
            });
        }
        debug!(count = out.len(), "reveals delivered");
        Ok(out)
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimState>> {
        self.state
            .lock()
            .map_err(|_| MonitorError::Capability("simulator state poisoned".into()))
    }

    fn fresh_handle(state: &mut SimState, value: u64) -> CiphertextHandle {
        let mut tag = vec![0u8; HANDLE_LEN];
        loop {
            OsRng.fill_bytes(&mut tag);
            if !state.plaintexts.contains_key(&tag) {
                break;
            }
        }
        state.plaintexts.insert(tag.clone(), value);
        CiphertextHandle::from_bytes(tag)
    }
}

impl Default for LocalFheSimulator {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup(state: &SimState, handle: &CiphertextHandle) -> Result<u64> {
    state
        .plaintexts
        .get(handle.as_bytes())
        .copied()
        .ok_or_else(|| MonitorError::MalformedCiphertext("handle not issued by this simulator".into()))
}

impl HomomorphicEvaluator for LocalFheSimulator {
    fn zero(&self) -> Result<CiphertextHandle> {
        self.encrypt(0)
    }

    fn add(&self, a: &CiphertextHandle, b: &CiphertextHandle) -> Result<CiphertextHandle> {
        let mut state = self.lock()?;
        let sum = lookup(&state, a)?.wrapping_add(lookup(&state, b)?);
        Ok(Self::fresh_handle(&mut state, sum))
    }
}

impl DecryptionCapability for LocalFheSimulator {
    fn begin_reveal(
        &self,
        ciphertexts: &CiphertextTriple,
        callback: RevealCallback,
    ) -> Result<RequestId> {
        let mut state = self.lock()?;
        for handle in ciphertexts.handles() {
            lookup(&state, handle).map_err(|e| MonitorError::Capability(e.to_string()))?;
        }
        let sequence = state.next_sequence;
        state.next_sequence = sequence
            .checked_add(1)
            .ok_or_else(|| MonitorError::Capability("request sequence exhausted".into()))?;
        let request_id = derive_request_id_v1(&self.instance_salt, sequence);
        state.queued.push(RevealJob {
            request_id,
            callback,
            ciphertexts: ciphertexts.clone(),
        });
        debug!(%request_id, ?callback, "reveal queued");
        Ok(request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProofVerifier;

    #[test]
    fn encryptions_of_equal_values_differ() {
        let sim = LocalFheSimulator::new();
        let a = sim.encrypt(7).unwrap();
        let b = sim.encrypt(7).unwrap();
        assert_ne!(a, b);
        assert_eq!(sim.decrypt(&a).unwrap(), 7);
        assert_eq!(sim.decrypt(&b).unwrap(), 7);
    }

    #[test]
    fn addition_is_homomorphic_and_wraps() {
        let sim = LocalFheSimulator::new();
        let a = sim.encrypt(40).unwrap();
        let b = sim.encrypt(2).unwrap();
        assert_eq!(sim.decrypt(&sim.add(&a, &b).unwrap()).unwrap(), 42);

        let max = sim.encrypt(u64::MAX).unwrap();
        let one = sim.encrypt(1).unwrap();
        assert_eq!(sim.decrypt(&sim.add(&max, &one).unwrap()).unwrap(), 0);
    }

    #[test]
    fn foreign_handles_rejected() {
        let sim = LocalFheSimulator::new();
        let other = LocalFheSimulator::new();
        let foreign = other.encrypt(1).unwrap();
        assert!(matches!(
            sim.decrypt(&foreign),
            Err(MonitorError::MalformedCiphertext(_))
        ));
        let triple = CiphertextTriple::new(foreign.clone(), foreign.clone(), foreign);
        assert!(matches!(
            sim.begin_reveal(&triple, RevealCallback::Analysis),
            Err(MonitorError::Capability(_))
        ));
    }

    #[test]
    fn reveals_are_signed_and_unique() {
        let sim = LocalFheSimulator::new();
        let triple = CiphertextTriple::new(
            sim.encrypt(1).unwrap(),
            sim.encrypt(2).unwrap(),
            sim.encrypt(3).unwrap(),
        );
        let r1 = sim.begin_reveal(&triple, RevealCallback::Analysis).unwrap();
        let r2 = sim
            .begin_reveal(&triple, RevealCallback::ModelMetrics)
            .unwrap();
        assert_ne!(r1, r2);
        assert_eq!(sim.queued_reveals().unwrap(), 2);

        let deliveries = sim.deliver_all().unwrap();
        assert_eq!(sim.queued_reveals().unwrap(), 0);
        assert_eq!(deliveries[0].request_id, r1);
        assert_eq!(deliveries[1].callback, RevealCallback::ModelMetrics);

        let verifier = sim.verifier();
        for d in &deliveries {
            assert_eq!(d.plaintext, PlaintextTriple::new(1, 2, 3));
            assert!(verifier.verify(&d.request_id, &d.plaintext, &d.proof));
        }
        // A proof for one request does not verify for the other.
        assert!(!verifier.verify(&r2, &deliveries[0].plaintext, &deliveries[0].proof));
    }

    #[test]
    fn instances_issue_disjoint_request_ids() {
        let a = LocalFheSimulator::new();
        let b = LocalFheSimulator::new();
        let ta = CiphertextTriple::new(a.zero().unwrap(), a.zero().unwrap(), a.zero().unwrap());
        let tb = CiphertextTriple::new(b.zero().unwrap(), b.zero().unwrap(), b.zero().unwrap());
        assert_ne!(
            a.begin_reveal(&ta, RevealCallback::Analysis).unwrap(),
            b.begin_reveal(&tb, RevealCallback::Analysis).unwrap()
        );
    }
}
