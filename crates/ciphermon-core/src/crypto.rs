//! Ed25519 decryption proofs.
//!
//! The decryption service signs `H(domain || request_id || plaintext)`; the oracle verifies it
//! before any state changes. Binding the request id into the message is what stops a valid
//! proof from being replayed against a different request.
//!
//! # Security
//!
//! - Seeds loaded from hex are zeroized after use.
//! - Never log or expose signing seeds.

use crate::hash::{sha256_domain, REVEAL_PROOF_DOMAIN_V1};
use crate::{MonitorError, PlaintextTriple, ProofVerifier, RequestId, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use zeroize::Zeroize;

/// 32-byte ed25519 public key.
pub type PublicKeyBytes = [u8; 32];

/// 32-byte ed25519 private key seed.
pub type PrivateKeySeed = [u8; 32];

/// Authenticity proof accompanying a reveal callback.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionProof(pub Vec<u8>);

/// Deterministic message a decryption proof signs.
pub fn reveal_message_v1(request_id: &RequestId, plaintext: &PlaintextTriple) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(32 + 3 * 8);
    bytes.extend_from_slice(&request_id.0 .0);
    for value in plaintext.0 {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    sha256_domain(REVEAL_PROOF_DOMAIN_V1, &bytes).0.to_vec()
}

/// Signing half, held by the decryption service.
#[derive(Clone)]
pub struct DecryptionProofSigner {
    signing_key: SigningKey,
}

impl DecryptionProofSigner {
    /// Generate a new random keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: &PrivateKeySeed) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Load from a hex-encoded 32-byte seed.
    pub fn from_hex(hex_seed: &str) -> Result<Self> {
        let mut bytes = hex::decode(hex_seed)
            .map_err(|e| MonitorError::CryptoError(format!("Invalid hex: {e}")))?;

        if bytes.len() != 32 {
            bytes.zeroize();
            return Err(MonitorError::CryptoError(
                "Seed must be exactly 32 bytes".into(),
            ));
        }

        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes);
        bytes.zeroize();

        let signer = Self::from_seed(&seed);
        seed.zeroize();
        Ok(signer)
    }

    /// Hex encoding of the seed, for key export.
    pub fn seed_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn verifier(&self) -> Ed25519ProofVerifier {
        Ed25519ProofVerifier {
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    #[instrument(skip(self, plaintext), fields(request_id = %request_id))]
    pub fn sign_reveal(&self, request_id: &RequestId, plaintext: &PlaintextTriple) -> DecryptionProof {
        let message = reveal_message_v1(request_id, plaintext);
        let signature = self.signing_key.sign(&message);
        debug!("Signed reveal");
        DecryptionProof(signature.to_bytes().to_vec())
    }
}

/// Verifying half, held by the oracle.
#[derive(Clone, Debug)]
pub struct Ed25519ProofVerifier {
    verifying_key: VerifyingKey,
}

impl Ed25519ProofVerifier {
    pub fn from_bytes(bytes: &PublicKeyBytes) -> Result<Self> {
        let verifying_key = VerifyingKey::from_bytes(bytes)
            .map_err(|e| MonitorError::CryptoError(format!("Invalid public key: {e}")))?;
        Ok(Self { verifying_key })
    }

    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key)
            .map_err(|e| MonitorError::CryptoError(format!("Invalid hex: {e}")))?;
        let key_bytes: PublicKeyBytes = bytes.try_into().map_err(|_| {
            MonitorError::CryptoError("Public key must be exactly 32 bytes".into())
        })?;
        Self::from_bytes(&key_bytes)
    }

    pub fn to_bytes(&self) -> PublicKeyBytes {
        self.verifying_key.to_bytes()
    }

    /// Verify a reveal proof.
    ///
    /// # Returns
    /// - `Ok(())` if the signature covers exactly `(request_id, plaintext)`
    /// - `Err(MonitorError::InvalidProof)` otherwise
    pub fn verify_reveal(
        &self,
        request_id: &RequestId,
        plaintext: &PlaintextTriple,
        proof: &DecryptionProof,
    ) -> Result<()> {
        let sig_bytes: [u8; 64] = proof.0.as_slice().try_into().map_err(|_| {
            warn!(len = proof.0.len(), "Invalid proof length");
            MonitorError::InvalidProof(*request_id)
        })?;
        let signature = Signature::from_bytes(&sig_bytes);
        let message = reveal_message_v1(request_id, plaintext);

        self.verifying_key
            .verify(&message, &signature)
            .map_err(|_| MonitorError::InvalidProof(*request_id))
    }
}

impl ProofVerifier for Ed25519ProofVerifier {
    fn verify(
        &self,
        request_id: &RequestId,
        plaintext: &PlaintextTriple,
        proof: &DecryptionProof,
    ) -> bool {
        self.verify_reveal(request_id, plaintext, proof).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Hash32;

    fn rid(b: u8) -> RequestId {
        RequestId(Hash32([b; 32]))
    }

    #[test]
    fn sign_and_verify() {
        let signer = DecryptionProofSigner::generate();
        let verifier = signer.verifier();
        let plaintext = PlaintextTriple::new(100, 90, 92);
        let proof = signer.sign_reveal(&rid(1), &plaintext);
        assert!(verifier.verify(&rid(1), &plaintext, &proof));
    }

    #[test]
    fn proof_is_bound_to_request_id() {
        let signer = DecryptionProofSigner::generate();
        let verifier = signer.verifier();
        let plaintext = PlaintextTriple::new(1, 2, 3);
        let proof = signer.sign_reveal(&rid(1), &plaintext);
        assert!(!verifier.verify(&rid(2), &plaintext, &proof));
    }

    #[test]
    fn proof_is_bound_to_plaintext() {
        let signer = DecryptionProofSigner::generate();
        let verifier = signer.verifier();
        let proof = signer.sign_reveal(&rid(1), &PlaintextTriple::new(1, 2, 3));
        assert!(!verifier.verify(&rid(1), &PlaintextTriple::new(1, 2, 4), &proof));
    }

    #[test]
    fn wrong_key_rejected() {
        let plaintext = PlaintextTriple::new(1, 2, 3);
        let proof = DecryptionProofSigner::generate().sign_reveal(&rid(1), &plaintext);
        let other = DecryptionProofSigner::generate().verifier();
        assert!(!other.verify(&rid(1), &plaintext, &proof));
    }

    #[test]
    fn truncated_proof_rejected() {
        let signer = DecryptionProofSigner::generate();
        let plaintext = PlaintextTriple::new(1, 2, 3);
        let mut proof = signer.sign_reveal(&rid(1), &plaintext);
        proof.0.truncate(10);
        assert!(matches!(
            signer.verifier().verify_reveal(&rid(1), &plaintext, &proof),
            Err(MonitorError::InvalidProof(_))
        ));
    }

    #[test]
    fn hex_seed_roundtrip() {
        let signer = DecryptionProofSigner::generate();
        let restored = DecryptionProofSigner::from_hex(&signer.seed_hex()).unwrap();
        assert_eq!(signer.verifier().to_bytes(), restored.verifier().to_bytes());
        let pk_hex = hex::encode(signer.verifier().to_bytes());
        assert_eq!(
            Ed25519ProofVerifier::from_hex(&pk_hex).unwrap().to_bytes(),
            signer.verifier().to_bytes()
        );
    }

    #[test]
    fn short_seed_rejected() {
        assert!(DecryptionProofSigner::from_hex("abcd").is_err());
        assert!(Ed25519ProofVerifier::from_hex("abcd").is_err());
    }
}
