// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Payment Channel Aggregate (BC-14, ADR-118)
//!
//! Domain model for off-chain micropayment channels: a small group of
//! participants (2..=10) lock funds into a shared ledger, exchange signed
//! vouchers instead of on-chain transactions, and settle once at close.
//!
//! ## Channel Lifecycle
//!
//! ```text
//! ChannelOpenRequest
//!   └─ PaymentChannel::open            → OPENING
//!        └─ activate                   → ACTIVE
//!             ├─ apply_payment         (balances move, sequence advances)
//!             ├─ begin_close           → CLOSING ──┐
//!             ├─ settle                → CLOSED ◄──┘ (force / confirmed)
//!             ├─ raise_dispute         → DISPUTED ─ resolve → ACTIVE | CLOSED
//!             └─ expire (sweep)        → EXPIRED
//! ```
//!
//! ## Invariants
//!
//! - The sum of all participants' `current_balance` equals `total_capacity`
//!   after every successful payment (transfers never mint or burn value).
//! - `sequence_number` advances by exactly 1 per successful payment, and the
//!   minted voucher's `nonce` equals the post-payment sequence number.
//! - A failed validation leaves the channel byte-for-byte unchanged; there is
//!   no partially-applied payment.
//! - `current_state_hash` is recomputed from the participant balances on
//!   every mutation and is the value participants co-sign via
//!   [`ChannelUpdate`].

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::error::TreasuryError;
use crate::domain::money::{Money, MONEY_EPSILON};

/// Opaque identifier for a payment channel (`ch_<uuid>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn new() -> Self {
        Self(format!("ch_{}", Uuid::new_v4()))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier for a payment voucher (`voucher_<uuid>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoucherId(pub String);

impl VoucherId {
    pub fn new() -> Self {
        Self(format!("voucher_{}", Uuid::new_v4()))
    }
}

impl std::fmt::Display for VoucherId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier for a channel dispute (`dispute_<uuid>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisputeId(pub String);

impl DisputeId {
    pub fn new() -> Self {
        Self(format!("dispute_{}", Uuid::new_v4()))
    }
}

impl std::fmt::Display for DisputeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier for a co-signable state update (`update_<uuid>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpdateId(pub String);

impl UpdateId {
    pub fn new() -> Self {
        Self(format!("update_{}", Uuid::new_v4()))
    }
}

impl std::fmt::Display for UpdateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a [`PaymentChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// Created, waiting for participant confirmation.
    Opening,
    /// Accepting payments.
    Active,
    /// Cooperative close in progress; settlement recorded, not finalized.
    Closing,
    /// Settled and moved to history. Terminal.
    Closed,
    /// A participant contested the channel state; payments rejected.
    Disputed,
    /// Force-settled by the expiry sweep. Terminal.
    Expired,
}

/// Role a participant plays inside a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    Payer,
    Payee,
    Mediator,
}

/// Reasons a participant may raise a channel dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeReason {
    InvalidState,
    StaleUpdate,
    InvalidSignature,
    InsufficientFunds,
    Timeout,
    FraudAttempt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Open,
    Resolved,
}

/// How a dispute was settled: reinstate the channel or force-settle it at
/// the last agreed balances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeOutcome {
    Reinstate,
    Settle,
}

/// Participant in a payment channel.
///
/// `current_balance.currency` is fixed for the participant's lifetime in the
/// channel; every payment check compares against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelParticipant {
    pub participant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_did: Option<String>,
    /// Wallet address used for on-chain settlement outside this core.
    pub wallet_address: String,
    pub role: ChannelRole,
    /// Public key for co-signature verification on channel updates.
    pub public_key: String,
    pub initial_balance: Money,
    pub current_balance: Money,
}

impl ChannelParticipant {
    /// Build a participant whose current balance starts at its initial
    /// contribution.
    pub fn new(
        participant_id: impl Into<String>,
        wallet_address: impl Into<String>,
        role: ChannelRole,
        public_key: impl Into<String>,
        initial_balance: Money,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            agent_did: None,
            wallet_address: wallet_address.into(),
            role,
            public_key: public_key.into(),
            current_balance: initial_balance.clone(),
            initial_balance,
        }
    }

    pub fn with_agent_did(mut self, did: impl Into<String>) -> Self {
        self.agent_did = Some(did.into());
        self
    }
}

/// Policy governing a channel. Immutable once the channel is OPENING.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPolicy {
    pub max_transaction_amount: Money,
    pub min_transaction_amount: Money,
    /// Window to challenge disputed states (24 hours).
    #[serde(default = "default_dispute_timeout_seconds")]
    pub dispute_timeout_seconds: u64,
    /// Backlog bound on un-co-signed state updates; payments are rejected
    /// once the backlog is full.
    #[serde(default = "default_max_pending_updates")]
    pub max_pending_updates: usize,
    /// Balance threshold triggering automatic settlement.
    pub settlement_threshold: Money,
    /// Transaction fee rate (0.1% default). Carried for settlement layers;
    /// in-channel transfers are fee-free.
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,
    /// Auto-close timeout in seconds (7 days).
    #[serde(default = "default_auto_close_timeout")]
    pub auto_close_timeout: u64,
}

/// Off-chain payment voucher: signed, sequence-numbered evidence of one
/// transfer. Append-only; never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentVoucher {
    pub voucher_id: VoucherId,
    pub channel_id: ChannelId,
    pub from_participant: String,
    pub to_participant: String,
    pub amount: Money,
    /// Monotonic replay-protection nonce; equals the channel's post-payment
    /// sequence number.
    pub nonce: u64,
    /// Running total transferred to `to_participant` within this channel.
    pub cumulative_amount: Money,
    pub timestamp: DateTime<Utc>,
    pub signature: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Co-signable state snapshot minted by every successful payment.
///
/// Updates accumulate on the channel until each participant has signed the
/// new `state_hash`; a fully signed update drains itself and every earlier
/// pending update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelUpdate {
    pub update_id: UpdateId,
    pub channel_id: ChannelId,
    pub sequence_number: u64,
    pub previous_state_hash: String,
    pub new_balances: HashMap<String, Money>,
    #[serde(default)]
    pub included_vouchers: Vec<VoucherId>,
    pub timestamp: DateTime<Utc>,
    /// participant_id → signature over `state_hash`.
    #[serde(default)]
    pub signatures: HashMap<String, String>,
    pub state_hash: String,
}

impl ChannelUpdate {
    pub fn add_signature(&mut self, participant_id: impl Into<String>, signature: impl Into<String>) {
        self.signatures.insert(participant_id.into(), signature.into());
    }

    pub fn is_fully_signed(&self, participants: &[ChannelParticipant]) -> bool {
        participants
            .iter()
            .all(|p| self.signatures.contains_key(&p.participant_id))
    }
}

/// Snapshot of the channel state a dispute contests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContestedState {
    pub state: ChannelState,
    pub sequence_number: u64,
    pub state_hash: String,
    pub balances: HashMap<String, Money>,
}

/// Dispute raised against a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDispute {
    pub dispute_id: DisputeId,
    pub channel_id: ChannelId,
    pub disputing_participant: String,
    pub dispute_reason: DisputeReason,
    pub contested_state: ContestedState,
    #[serde(default)]
    pub evidence: Vec<serde_json::Value>,
    /// Deadline for resolution; an external scheduler applies the default
    /// action once it passes. This core only stores it.
    pub resolution_deadline: DateTime<Utc>,
    pub status: DisputeStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Settlement record written at close, force-close, dispute settlement or
/// expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementInfo {
    pub final_balances: HashMap<String, Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_by: Option<String>,
    pub close_reason: String,
    pub closure_time: DateTime<Utc>,
}

/// Request to open a new two-party channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelOpenRequest {
    pub requesting_participant: ChannelParticipant,
    pub target_participant: ChannelParticipant,
    pub proposed_policy: ChannelPolicy,
    /// Requested channel duration in hours (7 days default).
    #[serde(default = "default_duration_hours")]
    pub duration_hours: u32,
    pub initial_deposit: Money,
    pub purpose: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Request to close a payment channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelCloseRequest {
    pub channel_id: ChannelId,
    pub requesting_participant: String,
    /// Proposed final balances for every participant.
    pub final_balances: HashMap<String, Money>,
    #[serde(default = "default_close_reason")]
    pub reason: String,
    #[serde(default)]
    pub force_close: bool,
    /// Signature authorizing the closure.
    pub signature: String,
}

/// Read-only channel snapshot for status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub channel_id: ChannelId,
    pub state: ChannelState,
    pub participants: Vec<ParticipantSummary>,
    pub total_capacity: Money,
    pub sequence_number: u64,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_expired: bool,
    pub current_state_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispute_info: Option<ChannelDispute>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_info: Option<SettlementInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub id: String,
    pub balance: Money,
    pub role: ChannelRole,
}

/// Data returned by a successful [`PaymentChannel::apply_payment`].
#[derive(Debug, Clone)]
pub struct PaymentApplied {
    pub sequence_number: u64,
    pub previous_state_hash: String,
    pub state_hash: String,
    pub cumulative_to_payee: Money,
}

/// Aggregate root for the micropayment channel ledger (BC-14, ADR-118).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentChannel {
    pub channel_id: ChannelId,
    /// 2..=10 participants, enforced at open.
    pub participants: Vec<ChannelParticipant>,
    pub state: ChannelState,
    pub policy: ChannelPolicy,
    /// Sum of all initial balances; conserved by every transfer.
    pub total_capacity: Money,
    pub current_state_hash: String,
    pub sequence_number: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Un-co-signed state updates, oldest first.
    #[serde(default)]
    pub pending_updates: Vec<ChannelUpdate>,
    /// participant_id → total value received in this channel.
    #[serde(default)]
    pub cumulative_received: HashMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispute_info: Option<ChannelDispute>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_info: Option<SettlementInfo>,
}

impl PaymentChannel {
    /// Build a channel in OPENING state from an open request.
    ///
    /// Enforces the open-time checks (first failure wins):
    /// 1. Requesting and target participants are distinct
    /// 2. All initial balances share the deposit currency
    pub fn open(request: &ChannelOpenRequest, now: DateTime<Utc>) -> Result<Self, TreasuryError> {
        if request.requesting_participant.participant_id
            == request.target_participant.participant_id
        {
            return Err(TreasuryError::policy(
                "requesting and target participants cannot be the same",
            ));
        }

        let participants = vec![
            request.requesting_participant.clone(),
            request.target_participant.clone(),
        ];

        let currency = &request.initial_deposit.currency;
        if participants
            .iter()
            .any(|p| &p.initial_balance.currency != currency)
        {
            return Err(TreasuryError::policy(
                "all participants must fund the channel in a single currency",
            ));
        }

        let total_capacity = Money::new(
            currency.clone(),
            participants.iter().map(|p| p.initial_balance.value).sum(),
        );

        let mut channel = Self {
            channel_id: ChannelId::new(),
            participants,
            state: ChannelState::Opening,
            policy: request.proposed_policy.clone(),
            total_capacity,
            current_state_hash: String::new(),
            sequence_number: 0,
            created_at: now,
            expires_at: now + Duration::hours(i64::from(request.duration_hours)),
            last_activity: now,
            pending_updates: Vec::new(),
            cumulative_received: HashMap::new(),
            dispute_info: None,
            settlement_info: None,
        };
        channel.current_state_hash = channel.compute_state_hash();
        Ok(channel)
    }

    pub fn get_participant(&self, participant_id: &str) -> Option<&ChannelParticipant> {
        self.participants
            .iter()
            .find(|p| p.participant_id == participant_id)
    }

    fn get_participant_mut(&mut self, participant_id: &str) -> Option<&mut ChannelParticipant> {
        self.participants
            .iter_mut()
            .find(|p| p.participant_id == participant_id)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Current total balance across all participants.
    pub fn get_total_balance(&self) -> Money {
        let currency = self
            .participants
            .first()
            .map(|p| p.current_balance.currency.clone())
            .unwrap_or_else(|| "USD".to_string());
        Money::new(
            currency,
            self.participants
                .iter()
                .map(|p| p.current_balance.value)
                .sum(),
        )
    }

    /// Tamper-evident digest over the channel id and each participant's
    /// `participant_id:balance` pair, in participant order.
    pub fn compute_state_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.channel_id.0.as_bytes());
        for participant in &self.participants {
            hasher.update(
                format!(
                    "{}:{}",
                    participant.participant_id, participant.current_balance.value
                )
                .as_bytes(),
            );
        }
        hex::encode(hasher.finalize())
    }

    /// Validate a proposed transfer without mutating anything.
    ///
    /// Checks in order (first failure is returned):
    /// 1. Channel state is ACTIVE
    /// 2. Channel has not expired
    /// 3. Payer exists
    /// 4. Payee exists
    /// 5. Amount currency matches the payer's balance currency
    /// 6. Payer balance covers the amount
    /// 7. Amount within the policy maximum
    /// 8. Amount within the policy minimum
    pub fn can_process_payment(
        &self,
        from_id: &str,
        to_id: &str,
        amount: &Money,
        now: DateTime<Utc>,
    ) -> Result<(), TreasuryError> {
        if self.state != ChannelState::Active {
            return Err(TreasuryError::invalid_state("process payment", self.state));
        }

        if self.is_expired(now) {
            return Err(TreasuryError::policy("channel has expired"));
        }

        let payer = self
            .get_participant(from_id)
            .ok_or_else(|| TreasuryError::not_found("participant", from_id))?;
        if self.get_participant(to_id).is_none() {
            return Err(TreasuryError::not_found("participant", to_id));
        }

        if amount.currency != payer.current_balance.currency {
            return Err(TreasuryError::policy("currency mismatch"));
        }

        if payer.current_balance.value < amount.value {
            return Err(TreasuryError::policy("insufficient balance"));
        }

        if amount.value > self.policy.max_transaction_amount.value {
            return Err(TreasuryError::policy(
                "amount exceeds maximum transaction limit",
            ));
        }

        if amount.value < self.policy.min_transaction_amount.value {
            return Err(TreasuryError::policy(
                "amount below minimum transaction limit",
            ));
        }

        Ok(())
    }

    /// Transition OPENING → ACTIVE after participant confirmation.
    pub fn activate(&mut self, now: DateTime<Utc>) -> Result<(), TreasuryError> {
        if self.state != ChannelState::Opening {
            return Err(TreasuryError::invalid_state("activate", self.state));
        }
        self.state = ChannelState::Active;
        self.last_activity = now;
        Ok(())
    }

    /// Atomically debit the payer, credit the payee and advance the ledger.
    ///
    /// Re-runs [`Self::can_process_payment`] plus the pending-update backlog
    /// check, then mutates; a failure therefore never leaves a partial
    /// application. Mints the co-signable [`ChannelUpdate`] recording the
    /// transition and carrying `voucher_id`.
    pub fn apply_payment(
        &mut self,
        from_id: &str,
        to_id: &str,
        amount: &Money,
        voucher_id: &VoucherId,
        now: DateTime<Utc>,
    ) -> Result<PaymentApplied, TreasuryError> {
        self.can_process_payment(from_id, to_id, amount, now)?;

        if self.pending_updates.len() >= self.policy.max_pending_updates {
            return Err(TreasuryError::policy(
                "pending update backlog is full; co-sign outstanding updates first",
            ));
        }

        let previous_state_hash = self.current_state_hash.clone();

        if let Some(payer) = self.get_participant_mut(from_id) {
            payer.current_balance.value -= amount.value;
        }
        if let Some(payee) = self.get_participant_mut(to_id) {
            payee.current_balance.value += amount.value;
        }

        self.sequence_number += 1;
        self.last_activity = now;
        let state_hash = self.compute_state_hash();
        self.current_state_hash = state_hash.clone();

        let cumulative = self
            .cumulative_received
            .entry(to_id.to_string())
            .or_insert(0.0);
        *cumulative += amount.value;
        let cumulative_to_payee = Money::new(amount.currency.clone(), *cumulative);

        let new_balances = self
            .participants
            .iter()
            .map(|p| (p.participant_id.clone(), p.current_balance.clone()))
            .collect();
        self.pending_updates.push(ChannelUpdate {
            update_id: UpdateId::new(),
            channel_id: self.channel_id.clone(),
            sequence_number: self.sequence_number,
            previous_state_hash: previous_state_hash.clone(),
            new_balances,
            included_vouchers: vec![voucher_id.clone()],
            timestamp: now,
            signatures: HashMap::new(),
            state_hash: state_hash.clone(),
        });

        Ok(PaymentApplied {
            sequence_number: self.sequence_number,
            previous_state_hash,
            state_hash,
            cumulative_to_payee,
        })
    }

    /// Record a participant's signature on a pending update.
    ///
    /// Returns `true` when the update became fully signed; a fully signed
    /// update drains itself and every earlier pending update.
    pub fn sign_pending_update(
        &mut self,
        update_id: &UpdateId,
        participant_id: &str,
        signature: &str,
    ) -> Result<bool, TreasuryError> {
        if self.get_participant(participant_id).is_none() {
            return Err(TreasuryError::not_found("participant", participant_id));
        }
        let participants = self.participants.clone();
        let update = self
            .pending_updates
            .iter_mut()
            .find(|u| &u.update_id == update_id)
            .ok_or_else(|| TreasuryError::not_found("channel update", update_id))?;

        update.add_signature(participant_id, signature);
        if !update.is_fully_signed(&participants) {
            return Ok(false);
        }

        let acknowledged_sequence = update.sequence_number;
        self.pending_updates
            .retain(|u| u.sequence_number > acknowledged_sequence);
        Ok(true)
    }

    /// Check proposed final balances against the channel: the participant
    /// set must match exactly and the sum must equal the capacity within
    /// [`MONEY_EPSILON`].
    pub fn validate_final_balances(
        &self,
        final_balances: &HashMap<String, Money>,
    ) -> Result<(), TreasuryError> {
        let channel_ids: std::collections::HashSet<&str> = self
            .participants
            .iter()
            .map(|p| p.participant_id.as_str())
            .collect();
        let proposed_ids: std::collections::HashSet<&str> =
            final_balances.keys().map(String::as_str).collect();
        if channel_ids != proposed_ids {
            return Err(TreasuryError::policy(
                "final balances must cover exactly the channel's participants",
            ));
        }

        let total_final: f64 = final_balances.values().map(|b| b.value).sum();
        if (total_final - self.total_capacity.value).abs() >= MONEY_EPSILON {
            return Err(TreasuryError::policy(
                "final balances do not sum to the channel capacity",
            ));
        }
        Ok(())
    }

    /// Begin a cooperative close: record settlement, park in CLOSING.
    pub fn begin_close(&mut self, settlement: SettlementInfo) -> Result<(), TreasuryError> {
        if !matches!(self.state, ChannelState::Active | ChannelState::Closing) {
            return Err(TreasuryError::invalid_state("close channel", self.state));
        }
        self.state = ChannelState::Closing;
        self.settlement_info = Some(settlement);
        Ok(())
    }

    /// Finalize settlement: CLOSED, terminal.
    pub fn settle(&mut self, settlement: SettlementInfo) -> Result<(), TreasuryError> {
        if !matches!(self.state, ChannelState::Active | ChannelState::Closing) {
            return Err(TreasuryError::invalid_state("settle channel", self.state));
        }
        self.state = ChannelState::Closed;
        self.settlement_info = Some(settlement);
        self.pending_updates.clear();
        Ok(())
    }

    /// Contest the channel state. Allowed from any non-terminal state that
    /// is not already disputed; the snapshot taken here is the evidence the
    /// resolution works from.
    pub fn raise_dispute(
        &mut self,
        disputing_participant: &str,
        reason: DisputeReason,
        evidence: Vec<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<ChannelDispute, TreasuryError> {
        if matches!(
            self.state,
            ChannelState::Disputed | ChannelState::Closed | ChannelState::Expired
        ) {
            return Err(TreasuryError::invalid_state("dispute channel", self.state));
        }
        if self.get_participant(disputing_participant).is_none() {
            return Err(TreasuryError::not_found(
                "participant",
                disputing_participant,
            ));
        }

        let contested_state = ContestedState {
            state: self.state,
            sequence_number: self.sequence_number,
            state_hash: self.current_state_hash.clone(),
            balances: self
                .participants
                .iter()
                .map(|p| (p.participant_id.clone(), p.current_balance.clone()))
                .collect(),
        };

        let dispute = ChannelDispute {
            dispute_id: DisputeId::new(),
            channel_id: self.channel_id.clone(),
            disputing_participant: disputing_participant.to_string(),
            dispute_reason: reason,
            contested_state,
            evidence,
            resolution_deadline: now
                + Duration::seconds(self.policy.dispute_timeout_seconds as i64),
            status: DisputeStatus::Open,
            created_at: now,
            resolution: None,
            resolved_at: None,
        };

        self.state = ChannelState::Disputed;
        self.dispute_info = Some(dispute.clone());
        Ok(dispute)
    }

    /// Resolve an open dispute: reinstate the channel or force-settle it at
    /// the last known balances.
    pub fn resolve_dispute(
        &mut self,
        outcome: DisputeOutcome,
        resolution: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TreasuryError> {
        if self.state != ChannelState::Disputed {
            return Err(TreasuryError::invalid_state("resolve dispute", self.state));
        }
        let dispute = self
            .dispute_info
            .as_mut()
            .ok_or_else(|| TreasuryError::not_found("dispute", &self.channel_id))?;
        dispute.status = DisputeStatus::Resolved;
        dispute.resolution = Some(resolution.into());
        dispute.resolved_at = Some(now);

        match outcome {
            DisputeOutcome::Reinstate => {
                self.state = ChannelState::Active;
                self.last_activity = now;
            }
            DisputeOutcome::Settle => {
                let settlement = self.settlement_at_current_balances(None, "dispute_settlement", now);
                self.state = ChannelState::Closed;
                self.settlement_info = Some(settlement);
                self.pending_updates.clear();
            }
        }
        Ok(())
    }

    /// Force-settle an expired channel at its last known balances. Terminal.
    pub fn expire(&mut self, now: DateTime<Utc>) {
        let settlement = self.settlement_at_current_balances(None, "expired", now);
        self.state = ChannelState::Expired;
        self.settlement_info = Some(settlement);
        self.pending_updates.clear();
    }

    /// Settlement record at the current balances.
    pub fn settlement_at_current_balances(
        &self,
        closed_by: Option<String>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> SettlementInfo {
        SettlementInfo {
            final_balances: self
                .participants
                .iter()
                .map(|p| (p.participant_id.clone(), p.current_balance.clone()))
                .collect(),
            closed_by,
            close_reason: reason.to_string(),
            closure_time: now,
        }
    }

    /// Read-only snapshot for status queries.
    pub fn status(&self, now: DateTime<Utc>) -> ChannelStatus {
        ChannelStatus {
            channel_id: self.channel_id.clone(),
            state: self.state,
            participants: self
                .participants
                .iter()
                .map(|p| ParticipantSummary {
                    id: p.participant_id.clone(),
                    balance: p.current_balance.clone(),
                    role: p.role,
                })
                .collect(),
            total_capacity: self.total_capacity.clone(),
            sequence_number: self.sequence_number,
            expires_at: self.expires_at,
            last_activity: self.last_activity,
            is_expired: self.is_expired(now),
            current_state_hash: self.current_state_hash.clone(),
            dispute_info: self.dispute_info.clone(),
            settlement_info: self.settlement_info.clone(),
        }
    }
}

fn default_dispute_timeout_seconds() -> u64 {
    86_400
}

fn default_max_pending_updates() -> usize {
    1_000
}

fn default_fee_rate() -> f64 {
    0.001
}

fn default_auto_close_timeout() -> u64 {
    604_800
}

fn default_duration_hours() -> u32 {
    168
}

fn default_close_reason() -> String {
    "normal_closure".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_policy() -> ChannelPolicy {
        ChannelPolicy {
            max_transaction_amount: Money::usd(1000.0),
            min_transaction_amount: Money::usd(0.01),
            dispute_timeout_seconds: default_dispute_timeout_seconds(),
            max_pending_updates: default_max_pending_updates(),
            settlement_threshold: Money::usd(100.0),
            fee_rate: default_fee_rate(),
            auto_close_timeout: default_auto_close_timeout(),
        }
    }

    fn open_request(a_balance: f64, b_balance: f64) -> ChannelOpenRequest {
        ChannelOpenRequest {
            requesting_participant: ChannelParticipant::new(
                "agent-a",
                "0xaaa",
                ChannelRole::Payer,
                "pk-a",
                Money::usd(a_balance),
            ),
            target_participant: ChannelParticipant::new(
                "agent-b",
                "0xbbb",
                ChannelRole::Payee,
                "pk-b",
                Money::usd(b_balance),
            ),
            proposed_policy: test_policy(),
            duration_hours: 168,
            initial_deposit: Money::usd(a_balance),
            purpose: "api metering".to_string(),
            metadata: HashMap::new(),
        }
    }

    fn active_channel(a_balance: f64, b_balance: f64) -> PaymentChannel {
        let now = Utc::now();
        let mut channel = PaymentChannel::open(&open_request(a_balance, b_balance), now).unwrap();
        channel.activate(now).unwrap();
        channel
    }

    #[test]
    fn open_rejects_identical_participants() {
        let mut request = open_request(50.0, 0.0);
        request.target_participant.participant_id = "agent-a".to_string();
        let err = PaymentChannel::open(&request, Utc::now()).unwrap_err();
        assert!(matches!(err, TreasuryError::PolicyViolation { .. }));
    }

    #[test]
    fn open_rejects_mixed_currencies() {
        let mut request = open_request(50.0, 0.0);
        request.target_participant.initial_balance = Money::new("EUR", 10.0);
        request.target_participant.current_balance = Money::new("EUR", 10.0);
        let err = PaymentChannel::open(&request, Utc::now()).unwrap_err();
        assert!(matches!(err, TreasuryError::PolicyViolation { .. }));
    }

    #[test]
    fn open_computes_capacity_and_hash() {
        let channel = PaymentChannel::open(&open_request(50.0, 25.0), Utc::now()).unwrap();
        assert_eq!(channel.state, ChannelState::Opening);
        assert!(channel.total_capacity.approx_eq(&Money::usd(75.0)));
        assert_eq!(channel.current_state_hash, channel.compute_state_hash());
        assert!(!channel.current_state_hash.is_empty());
    }

    #[test]
    fn activate_requires_opening_state() {
        let mut channel = active_channel(50.0, 0.0);
        let err = channel.activate(Utc::now()).unwrap_err();
        assert!(matches!(err, TreasuryError::InvalidState { .. }));
    }

    #[test]
    fn payment_conserves_capacity_and_advances_sequence() {
        let mut channel = active_channel(50.0, 0.0);
        let now = Utc::now();
        let before_hash = channel.current_state_hash.clone();

        let applied = channel
            .apply_payment("agent-a", "agent-b", &Money::usd(10.0), &VoucherId::new(), now)
            .unwrap();

        assert_eq!(applied.sequence_number, 1);
        assert_eq!(applied.previous_state_hash, before_hash);
        assert_ne!(applied.state_hash, before_hash);
        assert!(applied.cumulative_to_payee.approx_eq(&Money::usd(10.0)));
        assert!(channel
            .get_total_balance()
            .approx_eq(&channel.total_capacity));
        assert!(channel
            .get_participant("agent-a")
            .unwrap()
            .current_balance
            .approx_eq(&Money::usd(40.0)));
        assert!(channel
            .get_participant("agent-b")
            .unwrap()
            .current_balance
            .approx_eq(&Money::usd(10.0)));
        assert_eq!(channel.pending_updates.len(), 1);
    }

    #[test]
    fn rejected_payment_leaves_state_untouched() {
        let mut channel = active_channel(50.0, 0.0);
        let now = Utc::now();
        channel
            .apply_payment("agent-a", "agent-b", &Money::usd(10.0), &VoucherId::new(), now)
            .unwrap();
        let snapshot = channel.clone();

        let err = channel
            .apply_payment("agent-a", "agent-b", &Money::usd(45.0), &VoucherId::new(), now)
            .unwrap_err();
        assert!(matches!(err, TreasuryError::PolicyViolation { .. }));
        assert_eq!(channel, snapshot);
    }

    #[test]
    fn validation_order_reports_first_failure() {
        let channel = active_channel(50.0, 0.0);
        let now = Utc::now();

        // Unknown payer wins over the (also wrong) currency.
        let err = channel
            .can_process_payment("ghost", "agent-b", &Money::new("EUR", 5.0), now)
            .unwrap_err();
        assert!(matches!(err, TreasuryError::NotFound { .. }));

        // Currency mismatch wins over insufficient balance.
        let err = channel
            .can_process_payment("agent-a", "agent-b", &Money::new("EUR", 500.0), now)
            .unwrap_err();
        assert_eq!(
            err,
            TreasuryError::policy("currency mismatch"),
        );
    }

    #[test]
    fn payment_rejected_when_expired() {
        let mut channel = active_channel(50.0, 0.0);
        let after_expiry = channel.expires_at + Duration::hours(1);
        let err = channel
            .apply_payment(
                "agent-a",
                "agent-b",
                &Money::usd(1.0),
                &VoucherId::new(),
                after_expiry,
            )
            .unwrap_err();
        assert_eq!(err, TreasuryError::policy("channel has expired"));
    }

    #[test]
    fn payment_rejected_when_update_backlog_full() {
        let mut channel = active_channel(50.0, 0.0);
        channel.policy.max_pending_updates = 2;
        let now = Utc::now();
        for _ in 0..2 {
            channel
                .apply_payment("agent-a", "agent-b", &Money::usd(1.0), &VoucherId::new(), now)
                .unwrap();
        }
        let err = channel
            .apply_payment("agent-a", "agent-b", &Money::usd(1.0), &VoucherId::new(), now)
            .unwrap_err();
        assert!(matches!(err, TreasuryError::PolicyViolation { .. }));
        assert_eq!(channel.sequence_number, 2);
    }

    #[test]
    fn fully_signed_update_drains_backlog() {
        let mut channel = active_channel(50.0, 0.0);
        let now = Utc::now();
        for _ in 0..3 {
            channel
                .apply_payment("agent-a", "agent-b", &Money::usd(1.0), &VoucherId::new(), now)
                .unwrap();
        }
        let second = channel.pending_updates[1].update_id.clone();

        assert!(!channel
            .sign_pending_update(&second, "agent-a", "sig-a")
            .unwrap());
        assert!(channel
            .sign_pending_update(&second, "agent-b", "sig-b")
            .unwrap());
        // Updates 1 and 2 drained, update 3 still pending.
        assert_eq!(channel.pending_updates.len(), 1);
        assert_eq!(channel.pending_updates[0].sequence_number, 3);
    }

    #[test]
    fn final_balances_must_match_participants_and_capacity() {
        let channel = active_channel(50.0, 0.0);

        let mut good = HashMap::new();
        good.insert("agent-a".to_string(), Money::usd(30.0));
        good.insert("agent-b".to_string(), Money::usd(20.0));
        assert!(channel.validate_final_balances(&good).is_ok());

        let mut short = HashMap::new();
        short.insert("agent-a".to_string(), Money::usd(50.0));
        assert!(channel.validate_final_balances(&short).is_err());

        let mut off = HashMap::new();
        off.insert("agent-a".to_string(), Money::usd(30.0));
        off.insert("agent-b".to_string(), Money::usd(21.0));
        assert!(channel.validate_final_balances(&off).is_err());
    }

    #[test]
    fn dispute_snapshots_contested_state_and_blocks_payments() {
        let mut channel = active_channel(50.0, 0.0);
        let now = Utc::now();
        channel
            .apply_payment("agent-a", "agent-b", &Money::usd(5.0), &VoucherId::new(), now)
            .unwrap();

        let dispute = channel
            .raise_dispute("agent-b", DisputeReason::StaleUpdate, Vec::new(), now)
            .unwrap();
        assert_eq!(channel.state, ChannelState::Disputed);
        assert_eq!(dispute.contested_state.sequence_number, 1);
        assert_eq!(
            dispute.resolution_deadline,
            now + Duration::seconds(86_400)
        );

        let err = channel
            .can_process_payment("agent-a", "agent-b", &Money::usd(1.0), now)
            .unwrap_err();
        assert!(matches!(err, TreasuryError::InvalidState { .. }));

        let err = channel
            .raise_dispute("agent-a", DisputeReason::Timeout, Vec::new(), now)
            .unwrap_err();
        assert!(matches!(err, TreasuryError::InvalidState { .. }));
    }

    #[test]
    fn dispute_resolution_reinstates_or_settles() {
        let now = Utc::now();
        let mut channel = active_channel(50.0, 0.0);
        channel
            .raise_dispute("agent-a", DisputeReason::InvalidState, Vec::new(), now)
            .unwrap();
        channel
            .resolve_dispute(DisputeOutcome::Reinstate, "stale evidence", now)
            .unwrap();
        assert_eq!(channel.state, ChannelState::Active);
        assert_eq!(
            channel.dispute_info.as_ref().unwrap().status,
            DisputeStatus::Resolved
        );

        let mut channel = active_channel(50.0, 0.0);
        channel
            .raise_dispute("agent-a", DisputeReason::FraudAttempt, Vec::new(), now)
            .unwrap();
        channel
            .resolve_dispute(DisputeOutcome::Settle, "fraud confirmed", now)
            .unwrap();
        assert_eq!(channel.state, ChannelState::Closed);
        assert!(channel.settlement_info.is_some());
    }

    #[test]
    fn expire_settles_at_last_balances() {
        let mut channel = active_channel(50.0, 0.0);
        let now = Utc::now();
        channel
            .apply_payment("agent-a", "agent-b", &Money::usd(8.0), &VoucherId::new(), now)
            .unwrap();
        channel.expire(now);

        assert_eq!(channel.state, ChannelState::Expired);
        let settlement = channel.settlement_info.unwrap();
        assert_eq!(settlement.close_reason, "expired");
        assert!(settlement.final_balances["agent-a"].approx_eq(&Money::usd(42.0)));
        assert!(settlement.final_balances["agent-b"].approx_eq(&Money::usd(8.0)));
    }

    #[test]
    fn state_serializes_in_snake_case() {
        assert_eq!(
            serde_json::to_value(ChannelState::Opening).unwrap(),
            serde_json::json!("opening")
        );
        assert_eq!(
            serde_json::to_value(DisputeReason::FraudAttempt).unwrap(),
            serde_json::json!("fraud_attempt")
        );
    }
}
