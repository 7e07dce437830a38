// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Treasury Error Taxonomy (BC-14)
//!
//! Every validation failure in the treasury core is recovered locally and
//! returned as a [`TreasuryError`] with a human-readable reason and a stable
//! machine-checkable [`TreasuryError::code`]. Nothing in this crate panics on
//! caller input.
//!
//! [`TreasuryError::EscalationRequired`] is the one non-failure member: the
//! requested operation did not complete, but the caller must treat it as
//! *pending* human review, not rejected.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum TreasuryError {
    /// Unknown channel, stream, participant, rule, session or escalation id.
    #[error("{resource} {id} not found")]
    NotFound { resource: String, id: String },

    /// The operation is not legal in the entity's current lifecycle state.
    #[error("cannot {operation} in state {state}")]
    InvalidState { operation: String, state: String },

    /// Amount, currency, balance, expiry or limit checks failed.
    #[error("policy violation: {reason}")]
    PolicyViolation { reason: String },

    /// Overlapping or contradictory spending-rule constraints.
    #[error("rule conflict: {detail}")]
    ConflictDetected { detail: String },

    /// The circuit breaker tripped; the operation is parked pending a human
    /// decision on the named escalation.
    #[error("escalation {escalation_id} requires human review")]
    EscalationRequired { escalation_id: String },

    /// Signing or verification was unavailable or rejected, after retry.
    #[error("attestation failure: {reason}")]
    AttestationFailure { reason: String },
}

impl TreasuryError {
    pub fn not_found(resource: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }

    pub fn invalid_state(operation: &str, state: impl std::fmt::Debug) -> Self {
        Self::InvalidState {
            operation: operation.to_string(),
            state: format!("{state:?}"),
        }
    }

    pub fn policy(reason: impl Into<String>) -> Self {
        Self::PolicyViolation {
            reason: reason.into(),
        }
    }

    /// Stable code carried in structured rejection payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::PolicyViolation { .. } => "POLICY_VIOLATION",
            Self::ConflictDetected { .. } => "CONFLICT_DETECTED",
            Self::EscalationRequired { .. } => "ESCALATION_REQUIRED",
            Self::AttestationFailure { .. } => "ATTESTATION_FAILURE",
        }
    }
}
