use crate::{Hash32, RequestId};
use sha2::{Digest, Sha256};

/// Compute a deterministic SHA-256 hash of a byte slice.
pub fn sha256(data: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Hash32(hasher.finalize().into())
}

/// Compute a domain-separated SHA-256 hash: `H(domain || data)`.
pub fn sha256_domain(domain: &[u8], data: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(data);
    Hash32(hasher.finalize().into())
}

// =============================================================================
// Domain separation (v1)
// =============================================================================

/// Domain separation tag for ciphertext handle commitments.
pub const CIPHERTEXT_COMMITMENT_DOMAIN_V1: &[u8] = b"CIPHERMON_CIPHERTEXT_V1";

/// Domain separation tag for decryption proof messages.
pub const REVEAL_PROOF_DOMAIN_V1: &[u8] = b"CIPHERMON_REVEAL_PROOF_V1";

/// Domain separation tag for request id derivation.
pub const REQUEST_ID_DOMAIN_V1: &[u8] = b"CIPHERMON_REQUEST_ID_V1";

/// Domain separation tag for audit log record hashes.
pub const EVENT_LOG_RECORD_DOMAIN_V1: &[u8] = b"CIPHERMON_EVENT_LOG_RECORD_V1";

/// Derive a deterministic request id from a scope context and a sequence number.
///
/// `context` pins the issuing service instance (e.g. a per-deployment salt) so ids from two
/// capabilities never collide by construction.
pub fn derive_request_id_v1(context: &[u8], sequence: u64) -> RequestId {
    let mut hasher = Sha256::new();
    hasher.update(REQUEST_ID_DOMAIN_V1);
    hasher.update((context.len() as u32).to_le_bytes());
    hasher.update(context);
    hasher.update(sequence.to_le_bytes());
    RequestId(Hash32(hasher.finalize().into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_derivation_is_deterministic() {
        let ctx = b"deployment=demo";
        assert_eq!(derive_request_id_v1(ctx, 3), derive_request_id_v1(ctx, 3));
        assert_ne!(derive_request_id_v1(ctx, 3), derive_request_id_v1(ctx, 4));
    }

    #[test]
    fn request_id_derivation_is_context_bound() {
        assert_ne!(derive_request_id_v1(b"a", 1), derive_request_id_v1(b"b", 1));
    }

    #[test]
    fn domain_hash_differs_from_plain_hash() {
        assert_ne!(sha256(b"x"), sha256_domain(REVEAL_PROOF_DOMAIN_V1, b"x"));
    }
}
