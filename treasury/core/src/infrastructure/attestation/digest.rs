// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Digest-backed attestation for development and tests.
//!
//! The "signature" is the hex-encoded SHA-256 of the payload, recomputable
//! by any holder of the payload. Not a signature scheme; `public_key` is
//! ignored. Comparison is constant-time so the adapter can stand in for a
//! real signer in integration tests without changing verify semantics.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::domain::attestation::{Attestation, AttestationError};

#[derive(Debug, Default, Clone, Copy)]
pub struct DigestAttestation;

impl DigestAttestation {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Attestation for DigestAttestation {
    async fn sign(&self, payload: &[u8]) -> Result<String, AttestationError> {
        Ok(hex::encode(Sha256::digest(payload)))
    }

    async fn verify(
        &self,
        payload: &[u8],
        signature: &str,
        _public_key: &str,
    ) -> Result<bool, AttestationError> {
        let claimed = hex::decode(signature)
            .map_err(|e| AttestationError::Malformed(format!("signature is not hex: {e}")))?;
        let expected = Sha256::digest(payload);
        Ok(bool::from(expected.as_slice().ct_eq(claimed.as_slice())))
    }
}
