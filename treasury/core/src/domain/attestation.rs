// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Attestation Capability (BC-14)
//!
//! Domain seam for cryptographic signing and verification. The treasury core
//! never touches key material: vouchers, settlement approvals and co-signed
//! channel updates go through an injected [`Attestation`] implementation so
//! the ledger and governance logic stay testable without an HSM or wallet.
//!
//! ## Anti-Corruption Layer
//!
//! Implementations live in [`crate::infrastructure::attestation`]:
//! Ed25519-backed for production-grade signatures, digest-backed for
//! deterministic tests. The application layer treats every call as fallible,
//! applies a timeout, and retries exactly once before surfacing
//! [`crate::domain::error::TreasuryError::AttestationFailure`].

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AttestationError {
    /// The signing backend did not answer (timeout, transport, HSM offline).
    #[error("attestation backend unavailable: {0}")]
    Unavailable(String),

    /// The backend answered but refused to sign or verify.
    #[error("attestation rejected: {0}")]
    Rejected(String),

    /// Key or signature material could not be decoded.
    #[error("malformed attestation material: {0}")]
    Malformed(String),
}

/// Abstract sign/verify capability consumed by channel and voucher
/// operations.
///
/// # Security
///
/// Implementations must perform constant-time signature comparison on
/// `verify`; a timing side-channel here leaks voucher forgeability.
#[async_trait]
pub trait Attestation: Send + Sync {
    /// Sign `payload`, returning an opaque signature string.
    async fn sign(&self, payload: &[u8]) -> Result<String, AttestationError>;

    /// Verify `signature` over `payload` against `public_key`.
    ///
    /// Returns `Ok(false)` for a well-formed signature that does not match;
    /// [`AttestationError::Malformed`] when the material cannot be decoded.
    async fn verify(
        &self,
        payload: &[u8],
        signature: &str,
        public_key: &str,
    ) -> Result<bool, AttestationError>;
}
