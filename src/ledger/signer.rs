//! Event Signing
//!
//! Signing strengthens the chain against an attacker who can rewrite
//! every store: hashes alone can be recomputed, signatures cannot. The
//! production path asks an external KMS to sign with an asymmetric key
//! (RSA-PSS or equivalent); the key never leaves the KMS. Development and
//! tests use a local HMAC signer with the same contract.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{EngineError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies event hashes
#[async_trait]
pub trait Signer: Send + Sync {
    /// Key version recorded as `signing_key_id` on signed events
    fn key_id(&self) -> &str;

    async fn sign(&self, digest: &[u8; 32]) -> Result<Vec<u8>>;

    async fn verify(&self, digest: &[u8; 32], signature: &[u8]) -> Result<bool>;
}

// ============================================================================
// Local HMAC signer
// ============================================================================

/// Symmetric stand-in for deployments without a KMS
pub struct HmacSigner {
    key_id: String,
    secret: Vec<u8>,
}

impl HmacSigner {
    pub fn new(key_id: impl Into<String>, secret: impl AsRef<[u8]>) -> Self {
        Self {
            key_id: key_id.into(),
            secret: secret.as_ref().to_vec(),
        }
    }
}

#[async_trait]
impl Signer for HmacSigner {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    async fn sign(&self, digest: &[u8; 32]) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| EngineError::configuration(format!("signer key: {e}")))?;
        mac.update(digest);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    async fn verify(&self, digest: &[u8; 32], signature: &[u8]) -> Result<bool> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| EngineError::configuration(format!("signer key: {e}")))?;
        mac.update(digest);
        Ok(mac.verify_slice(signature).is_ok())
    }
}

// ============================================================================
// Remote KMS signer
// ============================================================================

/// Asymmetric signing through an external KMS. The service account only
/// holds sign/verify permissions; key material stays remote.
pub struct KmsSigner {
    endpoint: String,
    key_id: String,
    client: reqwest::Client,
}

#[derive(serde::Serialize)]
struct SignRequest<'a> {
    key_id: &'a str,
    digest_b64: String,
}

#[derive(serde::Deserialize)]
struct SignResponse {
    signature_b64: String,
}

#[derive(serde::Serialize)]
struct VerifyRequest<'a> {
    key_id: &'a str,
    digest_b64: String,
    signature_b64: String,
}

#[derive(serde::Deserialize)]
struct VerifyResponse {
    valid: bool,
}

impl KmsSigner {
    pub fn new(endpoint: impl Into<String>, key_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            key_id: key_id.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Signer for KmsSigner {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    async fn sign(&self, digest: &[u8; 32]) -> Result<Vec<u8>> {
        use base64::Engine;
        let body = SignRequest {
            key_id: &self.key_id,
            digest_b64: base64::engine::general_purpose::STANDARD.encode(digest),
        };
        let response = self
            .client
            .post(format!("{}/v1/sign", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::transient(format!("kms sign: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::transient(format!(
                "kms sign returned {}",
                response.status()
            )));
        }
        let reply: SignResponse = response
            .json()
            .await
            .map_err(|e| EngineError::transient(format!("kms reply: {e}")))?;
        base64::engine::general_purpose::STANDARD
            .decode(reply.signature_b64)
            .map_err(|e| EngineError::integrity(format!("kms signature encoding: {e}")))
    }

    async fn verify(&self, digest: &[u8; 32], signature: &[u8]) -> Result<bool> {
        use base64::Engine;
        let body = VerifyRequest {
            key_id: &self.key_id,
            digest_b64: base64::engine::general_purpose::STANDARD.encode(digest),
            signature_b64: base64::engine::general_purpose::STANDARD.encode(signature),
        };
        let response = self
            .client
            .post(format!("{}/v1/verify", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::transient(format!("kms verify: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::transient(format!(
                "kms verify returned {}",
                response.status()
            )));
        }
        let reply: VerifyResponse = response
            .json()
            .await
            .map_err(|e| EngineError::transient(format!("kms reply: {e}")))?;
        Ok(reply.valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hmac_sign_verify_round_trip() {
        let signer = HmacSigner::new("local-1", "test-secret");
        let digest = [7u8; 32];
        let signature = signer.sign(&digest).await.unwrap();
        assert!(signer.verify(&digest, &signature).await.unwrap());
    }

    #[tokio::test]
    async fn test_hmac_rejects_wrong_digest() {
        let signer = HmacSigner::new("local-1", "test-secret");
        let signature = signer.sign(&[7u8; 32]).await.unwrap();
        assert!(!signer.verify(&[8u8; 32], &signature).await.unwrap());
    }

    #[tokio::test]
    async fn test_hmac_rejects_wrong_key() {
        let a = HmacSigner::new("local-1", "secret-a");
        let b = HmacSigner::new("local-2", "secret-b");
        let digest = [1u8; 32];
        let signature = a.sign(&digest).await.unwrap();
        assert!(!b.verify(&digest, &signature).await.unwrap());
    }

    #[test]
    fn test_key_id_reported() {
        let signer = HmacSigner::new("local-3", "x");
        assert_eq!(signer.key_id(), "local-3");
    }
}
