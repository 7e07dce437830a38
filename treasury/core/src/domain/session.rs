// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Session Authorization (BC-14, ADR-120)
//!
//! Time-bounded, scope-limited delegation of a user's spending authority to
//! an agent. A session carries cryptographic credentials plus a list of
//! [`SessionIntent`]s naming exactly which actions (and amounts) the agent
//! may perform; a monotonic nonce provides replay protection.
//!
//! ## Invariants
//!
//! - A session authorizes an action only while ACTIVE and before
//!   `session_expiry` (inclusive).
//! - Session durations are bounded to 1..=168 hours; requests outside the
//!   range are rejected, never adjusted.
//! - Intent amount caps are inclusive: an amount equal to `max_amount`
//!   passes, one cent over rejects.
//! - `increment_nonce` is called exactly once per consumed authorization
//!   use; the nonce never decreases.
//! - Revocation is terminal for the session.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::error::TreasuryError;
use crate::domain::money::Money;

/// Identifier for an authorization session (`sess_<uuid>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(format!("sess_{}", Uuid::new_v4()))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mechanism backing the session's credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionAuthType {
    EphemeralKey,
    DelegatedSignature,
    SmartContract,
    HardwareAttestation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Expired,
    Revoked,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InteractionPattern {
    ServerInitiated,
    ClientInitiated,
}

/// One specific action the user authorized, with optional bounds.
///
/// `merchant_restrictions` and `category_restrictions` are carried for the
/// spending-rule layer; intent matching here checks action, expiry and
/// amount only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionIntent {
    pub intent_id: String,
    /// Action verb this intent covers (e.g. `"purchase"`).
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<Money>,
    pub valid_until: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_restrictions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_restrictions: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SessionIntent {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.valid_until
    }
}

/// Cryptographic material verifying session operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCredential {
    pub credential_id: String,
    /// Base64-encoded public key.
    pub public_key: String,
    #[serde(default = "default_signature_algorithm")]
    pub signature_algorithm: String,
    #[serde(default = "default_key_derivation")]
    pub key_derivation_method: String,
    /// Hardware or platform attestation of key custody, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Request to create a new session authorization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAuthorizationRequest {
    pub user_wallet_address: String,
    pub agent_did: String,
    pub requested_intents: Vec<SessionIntent>,
    /// 1..=168 hours; one day by default.
    #[serde(default = "default_session_duration_hours")]
    pub session_duration_hours: u32,
    #[serde(default = "default_auth_type")]
    pub auth_type: SessionAuthType,
    #[serde(default = "default_interaction_pattern")]
    pub interaction_pattern: InteractionPattern,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Aggregate root for delegated agent spending authority (BC-14, ADR-120).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAuthorization {
    pub session_id: SessionId,
    pub agent_did: String,
    pub user_wallet_address: String,
    pub auth_type: SessionAuthType,
    pub credential: SessionCredential,
    pub intents: Vec<SessionIntent>,
    pub session_expiry: DateTime<Utc>,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revocation_registry_uri: Option<String>,
    /// Proof of delegation from user to agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegation_proof: Option<String>,
    #[serde(default = "default_interaction_pattern")]
    pub interaction_pattern: InteractionPattern,
    /// Replay-protection counter for session operations.
    #[serde(default)]
    pub nonce: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revocation_reason: Option<String>,
}

impl SessionAuthorization {
    /// Grant a session from a request: ACTIVE, expiring after the requested
    /// duration, covering the requested intents.
    ///
    /// Rejects durations outside 1..=168 hours. An invalid request must not
    /// mint any authorization at all.
    pub fn grant(
        request: &SessionAuthorizationRequest,
        credential: SessionCredential,
        now: DateTime<Utc>,
    ) -> Result<Self, TreasuryError> {
        let duration_hours = request.session_duration_hours;
        if !(1..=168).contains(&duration_hours) {
            return Err(TreasuryError::policy(format!(
                "session duration must be between 1 and 168 hours, got {duration_hours}"
            )));
        }
        Ok(Self {
            session_id: SessionId::new(),
            agent_did: request.agent_did.clone(),
            user_wallet_address: request.user_wallet_address.clone(),
            auth_type: request.auth_type,
            credential,
            intents: request.requested_intents.clone(),
            session_expiry: now + Duration::hours(i64::from(duration_hours)),
            status: SessionStatus::Active,
            revocation_registry_uri: None,
            delegation_proof: None,
            interaction_pattern: request.interaction_pattern,
            nonce: 0,
            created_at: now,
            last_used: None,
            revocation_reason: None,
        })
    }

    /// ACTIVE and not past expiry (inclusive at the boundary).
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active && now <= self.session_expiry
    }

    /// First intent covering the action within its amount cap, if any.
    ///
    /// Skips intents whose action differs, which have themselves expired,
    /// or whose cap the amount exceeds (currency mismatch counts as
    /// exceeding). An amount equal to the cap passes.
    pub fn matching_intent(
        &self,
        action: &str,
        amount: Option<&Money>,
        now: DateTime<Utc>,
    ) -> Option<&SessionIntent> {
        if !self.is_valid(now) {
            return None;
        }

        self.intents.iter().find(|intent| {
            if intent.action != action || intent.is_expired(now) {
                return false;
            }
            if let (Some(amount), Some(max)) = (amount, &intent.max_amount) {
                if !amount.same_currency(max) || amount.value > max.value {
                    return false;
                }
            }
            true
        })
    }

    pub fn has_intent_for_action(
        &self,
        action: &str,
        amount: Option<&Money>,
        now: DateTime<Utc>,
    ) -> bool {
        self.matching_intent(action, amount, now).is_some()
    }

    /// All intents that have not expired, for a valid session.
    pub fn get_valid_intents(&self, now: DateTime<Utc>) -> Vec<&SessionIntent> {
        if !self.is_valid(now) {
            return Vec::new();
        }
        self.intents
            .iter()
            .filter(|intent| !intent.is_expired(now))
            .collect()
    }

    /// Advance the replay-protection nonce; called exactly once per
    /// consumed authorization use. Returns the new value.
    pub fn increment_nonce(&mut self, now: DateTime<Utc>) -> u64 {
        self.nonce += 1;
        self.last_used = Some(now);
        self.nonce
    }

    /// Terminal for this session.
    pub fn revoke(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = SessionStatus::Revoked;
        self.revocation_reason = Some(reason.into());
        self.last_used = Some(now);
    }
}

/// Signed list of revoked session ids, republished on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRevocationList {
    #[serde(default)]
    pub revoked_sessions: Vec<SessionId>,
    pub issuer: String,
    pub issued_at: DateTime<Utc>,
    pub next_update: DateTime<Utc>,
    #[serde(default = "default_sequence_number")]
    pub sequence_number: u64,
}

impl SessionRevocationList {
    pub fn new(issuer: impl Into<String>, now: DateTime<Utc>, next_update: DateTime<Utc>) -> Self {
        Self {
            revoked_sessions: Vec::new(),
            issuer: issuer.into(),
            issued_at: now,
            next_update,
            sequence_number: default_sequence_number(),
        }
    }

    pub fn is_revoked(&self, session_id: &SessionId) -> bool {
        self.revoked_sessions.contains(session_id)
    }

    /// Idempotent: re-adding an already revoked session changes nothing.
    pub fn add_revocation(&mut self, session_id: SessionId, now: DateTime<Utc>) {
        if !self.revoked_sessions.contains(&session_id) {
            self.revoked_sessions.push(session_id);
            self.issued_at = now;
            self.sequence_number += 1;
        }
    }
}

fn default_signature_algorithm() -> String {
    "ES256".to_string()
}

fn default_key_derivation() -> String {
    "random".to_string()
}

fn default_session_duration_hours() -> u32 {
    24
}

fn default_auth_type() -> SessionAuthType {
    SessionAuthType::EphemeralKey
}

fn default_interaction_pattern() -> InteractionPattern {
    InteractionPattern::ServerInitiated
}

fn default_sequence_number() -> u64 {
    1
}
