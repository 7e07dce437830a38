// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Attestation Adapters
//!
//! Infrastructure implementations of the [`crate::domain::attestation::Attestation`]
//! capability. `Ed25519Attestation` signs with a real keypair; `DigestAttestation`
//! produces deterministic recomputable digests for development and tests.

pub mod digest;
pub mod ed25519;

pub use digest::DigestAttestation;
pub use ed25519::Ed25519Attestation;
