//! Subject Anonymization
//!
//! Wherever a user reference is persisted the engine stores
//! `SHA-256(user_id ‖ process_salt)` truncated to 128 bits, hex-encoded.
//! The salt is fixed at process start so the mapping is stable within a
//! deployment but useless outside it.

use sha2::{Digest, Sha256};

/// Stateless anonymizer carrying the process salt
#[derive(Debug, Clone)]
pub struct Anonymizer {
    salt: Vec<u8>,
}

impl Anonymizer {
    pub fn new(salt: impl AsRef<[u8]>) -> Self {
        Self {
            salt: salt.as_ref().to_vec(),
        }
    }

    /// Anonymized subject id: 32 hex chars (128 bits)
    pub fn anonymize(&self, user_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(user_id.as_bytes());
        hasher.update(&self.salt);
        let digest = hasher.finalize();
        hex::encode(&digest[..16])
    }

    /// Strip PII-bearing keys from free-form metadata before it is
    /// persisted anywhere. Everything not on the allowlist of structural
    /// keys is kept; known identifying keys are dropped.
    pub fn scrub_metadata(&self, metadata: &mut serde_json::Map<String, serde_json::Value>) {
        const PII_KEYS: [&str; 7] = [
            "user_id",
            "subject_name",
            "name",
            "email",
            "phone",
            "address",
            "date_of_birth",
        ];
        for key in PII_KEYS {
            metadata.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_within_salt() {
        let anon = Anonymizer::new("salt-a");
        assert_eq!(anon.anonymize("patient-7"), anon.anonymize("patient-7"));
    }

    #[test]
    fn test_differs_across_salts() {
        let a = Anonymizer::new("salt-a");
        let b = Anonymizer::new("salt-b");
        assert_ne!(a.anonymize("patient-7"), b.anonymize("patient-7"));
    }

    #[test]
    fn test_output_is_128_bits() {
        let anon = Anonymizer::new("salt");
        assert_eq!(anon.anonymize("x").len(), 32);
    }

    #[test]
    fn test_scrub_removes_pii() {
        let anon = Anonymizer::new("salt");
        let mut metadata = serde_json::json!({
            "user_id": "patient-7",
            "email": "p@example.com",
            "paradigm": "motor-imagery",
        })
        .as_object()
        .unwrap()
        .clone();
        anon.scrub_metadata(&mut metadata);
        assert!(!metadata.contains_key("user_id"));
        assert!(!metadata.contains_key("email"));
        assert_eq!(metadata["paradigm"], "motor-imagery");
    }
}
