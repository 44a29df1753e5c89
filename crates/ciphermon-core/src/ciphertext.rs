//! Opaque ciphertext handles.
//!
//! A handle is whatever bytes the encryption layer hands out. The core only ever copies,
//! stores, length-checks and commits to them; composition goes through
//! [`crate::HomomorphicEvaluator`] and plaintext only through [`crate::DecryptionCapability`].

use crate::hash::{sha256_domain, CIPHERTEXT_COMMITMENT_DOMAIN_V1};
use crate::{Hash32, MonitorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CiphertextHandle(#[serde(with = "hex_bytes")] Vec<u8>);

impl CiphertextHandle {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Domain-separated commitment, safe to log or publish in place of the handle.
    pub fn commitment(&self) -> Hash32 {
        sha256_domain(CIPHERTEXT_COMMITMENT_DOMAIN_V1, &self.0)
    }

    /// Structural check only: non-empty and within `max_bytes`.
    pub fn check_well_formed(&self, max_bytes: usize) -> Result<()> {
        if self.0.is_empty() {
            return Err(MonitorError::MalformedCiphertext("empty handle".into()));
        }
        if self.0.len() > max_bytes {
            return Err(MonitorError::MalformedCiphertext(format!(
                "handle of {} bytes exceeds limit of {max_bytes}",
                self.0.len()
            )));
        }
        Ok(())
    }
}

// Never print handle contents.
impl fmt::Debug for CiphertextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CiphertextHandle({}, {} bytes)",
            hex::encode(&self.commitment().0[..8]),
            self.0.len()
        )
    }
}

/// Three handles packaged together for one reveal or one aggregate update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiphertextTriple {
    pub first: CiphertextHandle,
    pub second: CiphertextHandle,
    pub third: CiphertextHandle,
}

impl CiphertextTriple {
    pub fn new(first: CiphertextHandle, second: CiphertextHandle, third: CiphertextHandle) -> Self {
        Self {
            first,
            second,
            third,
        }
    }

    pub fn handles(&self) -> [&CiphertextHandle; 3] {
        [&self.first, &self.second, &self.third]
    }

    pub fn check_well_formed(&self, max_bytes: usize) -> Result<()> {
        self.handles()
            .iter()
            .try_for_each(|h| h.check_well_formed(max_bytes))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_handle_is_malformed() {
        let h = CiphertextHandle::from_bytes(Vec::new());
        assert!(matches!(
            h.check_well_formed(64),
            Err(MonitorError::MalformedCiphertext(_))
        ));
    }

    #[test]
    fn oversized_handle_is_malformed() {
        let h = CiphertextHandle::from_bytes(vec![1u8; 65]);
        assert!(h.check_well_formed(64).is_err());
        assert!(h.check_well_formed(65).is_ok());
    }

    #[test]
    fn triple_rejects_any_bad_member() {
        let good = CiphertextHandle::from_bytes(vec![1u8; 4]);
        let bad = CiphertextHandle::from_bytes(Vec::new());
        let t = CiphertextTriple::new(good.clone(), good, bad);
        assert!(t.check_well_formed(64).is_err());
    }

    #[test]
    fn debug_output_hides_contents() {
        let h = CiphertextHandle::from_bytes(b"secret-bytes".to_vec());
        let dbg = format!("{h:?}");
        assert!(!dbg.contains(&hex::encode(b"secret-bytes")));
        assert!(dbg.contains("12 bytes"));
    }

    #[test]
    fn serializes_as_hex() {
        let h = CiphertextHandle::from_bytes(vec![0xde, 0xad]);
        assert_eq!(serde_json::to_string(&h).unwrap(), "\"dead\"");
        let back: CiphertextHandle = serde_json::from_str("\"dead\"").unwrap();
        assert_eq!(back, h);
    }
}
