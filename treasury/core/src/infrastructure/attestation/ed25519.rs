// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Ed25519-backed attestation (SEAL key discipline).
//!
//! Signatures and public keys travel base64-encoded; key material never
//! leaves this adapter.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand_core::OsRng;

use crate::domain::attestation::{Attestation, AttestationError};

pub struct Ed25519Attestation {
    signing_key: SigningKey,
}

impl Ed25519Attestation {
    /// Generate a fresh keypair from the OS entropy source.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstruct from a 32-byte seed (e.g. loaded from a sealed keystore).
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Base64-encoded verifying key, as carried in participant records.
    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.signing_key.verifying_key().to_bytes())
    }
}

#[async_trait]
impl Attestation for Ed25519Attestation {
    async fn sign(&self, payload: &[u8]) -> Result<String, AttestationError> {
        let signature = self.signing_key.sign(payload);
        Ok(STANDARD.encode(signature.to_bytes()))
    }

    async fn verify(
        &self,
        payload: &[u8],
        signature: &str,
        public_key: &str,
    ) -> Result<bool, AttestationError> {
        let key_bytes = STANDARD
            .decode(public_key)
            .map_err(|e| AttestationError::Malformed(format!("public key is not base64: {e}")))?;
        let key_bytes: [u8; 32] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| AttestationError::Malformed("public key must be 32 bytes".to_string()))?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| AttestationError::Malformed(format!("invalid ed25519 public key: {e}")))?;

        let sig_bytes = STANDARD
            .decode(signature)
            .map_err(|e| AttestationError::Malformed(format!("signature is not base64: {e}")))?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|e| AttestationError::Malformed(format!("invalid ed25519 signature: {e}")))?;

        Ok(verifying_key.verify(payload, &signature).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sign_then_verify_round_trips() {
        let attestation = Ed25519Attestation::generate();
        let payload = b"ch_1:agent-a:10.0:USD";

        let signature = attestation.sign(payload).await.unwrap();
        let public_key = attestation.public_key_base64();

        assert!(attestation
            .verify(payload, &signature, &public_key)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn tampered_payload_fails_verification() {
        let attestation = Ed25519Attestation::generate();
        let signature = attestation.sign(b"ch_1:agent-a:10.0:USD").await.unwrap();
        let public_key = attestation.public_key_base64();

        let verified = attestation
            .verify(b"ch_1:agent-a:99.0:USD", &signature, &public_key)
            .await
            .unwrap();
        assert!(!verified);
    }

    #[tokio::test]
    async fn wrong_key_fails_verification() {
        let signer = Ed25519Attestation::generate();
        let other = Ed25519Attestation::generate();
        let signature = signer.sign(b"payload").await.unwrap();

        let verified = signer
            .verify(b"payload", &signature, &other.public_key_base64())
            .await
            .unwrap();
        assert!(!verified);
    }

    #[tokio::test]
    async fn malformed_material_is_rejected() {
        let attestation = Ed25519Attestation::generate();

        let err = attestation
            .verify(b"payload", "zzz-not-base64!!", &attestation.public_key_base64())
            .await
            .unwrap_err();
        assert!(matches!(err, AttestationError::Malformed(_)));

        let signature = attestation.sign(b"payload").await.unwrap();
        let err = attestation
            .verify(b"payload", &signature, "c2hvcnQ=")
            .await
            .unwrap_err();
        assert!(matches!(err, AttestationError::Malformed(_)));
    }

    #[tokio::test]
    async fn seed_restores_the_same_identity() {
        let seed = [7u8; 32];
        let a = Ed25519Attestation::from_seed(&seed);
        let b = Ed25519Attestation::from_seed(&seed);

        assert_eq!(a.public_key_base64(), b.public_key_base64());
        let signature = a.sign(b"payload").await.unwrap();
        assert!(b
            .verify(b"payload", &signature, &a.public_key_base64())
            .await
            .unwrap());
    }
}
