// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::channel::{ChannelId, DisputeId, DisputeOutcome, DisputeReason, UpdateId, VoucherId};
use crate::domain::circuit_breaker::{EscalationDecision, EscalationId, FcbState};
use crate::domain::money::Money;
use crate::domain::session::SessionId;
use crate::domain::streaming::StreamId;

/// Channel lifecycle and payment audit trail (ADR-118).
///
/// Every balance-changing operation on a channel emits exactly one event,
/// carrying enough state for an auditor to replay the channel history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChannelEvent {
    ChannelOpened {
        channel_id: ChannelId,
        participants: Vec<String>,
        capacity: Money,
        opened_at: DateTime<Utc>,
    },
    ChannelActivated {
        channel_id: ChannelId,
        activated_at: DateTime<Utc>,
    },
    PaymentProcessed {
        channel_id: ChannelId,
        voucher_id: VoucherId,
        from_participant: String,
        to_participant: String,
        amount: Money,
        sequence_number: u64,
        state_hash: String,
        processed_at: DateTime<Utc>,
    },
    UpdateAcknowledged {
        channel_id: ChannelId,
        update_id: UpdateId,
        participant_id: String,
        fully_signed: bool,
        acknowledged_at: DateTime<Utc>,
    },
    ChannelClosing {
        channel_id: ChannelId,
        initiated_by: String,
        closing_at: DateTime<Utc>,
    },
    ChannelClosed {
        channel_id: ChannelId,
        closed_by: String,
        close_reason: String,
        final_balances: Vec<(String, Money)>,
        closed_at: DateTime<Utc>,
    },
    ChannelDisputed {
        channel_id: ChannelId,
        dispute_id: DisputeId,
        raised_by: String,
        reason: DisputeReason,
        disputed_at: DateTime<Utc>,
    },
    DisputeResolved {
        channel_id: ChannelId,
        dispute_id: DisputeId,
        outcome: DisputeOutcome,
        resolved_at: DateTime<Utc>,
    },
    ChannelExpired {
        channel_id: ChannelId,
        expired_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamEvent {
    StreamCreated {
        stream_id: StreamId,
        channel_id: ChannelId,
        payer_id: String,
        payee_id: String,
        created_at: DateTime<Utc>,
    },
    StreamVoucherAdded {
        stream_id: StreamId,
        voucher_id: String,
        amount: Money,
        cumulative_amount: Money,
        units_consumed: f64,
        sequence_number: u64,
        added_at: DateTime<Utc>,
    },
    CheckpointCreated {
        stream_id: StreamId,
        checkpoint_id: String,
        sequence_number: u64,
        state_hash: String,
        created_at: DateTime<Utc>,
    },
    StreamPaused {
        stream_id: StreamId,
        reason: String,
        paused_at: DateTime<Utc>,
    },
    StreamResumed {
        stream_id: StreamId,
        resumed_at: DateTime<Utc>,
    },
    StreamCompleted {
        stream_id: StreamId,
        total_amount: Money,
        total_units: f64,
        completed_at: DateTime<Utc>,
    },
    StreamCancelled {
        stream_id: StreamId,
        reason: String,
        cancelled_at: DateTime<Utc>,
    },
    StreamFailed {
        stream_id: StreamId,
        reason: String,
        failed_at: DateTime<Utc>,
    },
}

/// Fiduciary circuit breaker transitions and human escalation outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GovernanceEvent {
    BreakerOpened {
        agent_id: String,
        escalation_id: EscalationId,
        risk_score: f64,
        opened_at: DateTime<Utc>,
    },
    EscalationDecided {
        agent_id: String,
        escalation_id: EscalationId,
        approver_id: String,
        decision: EscalationDecision,
        new_state: FcbState,
        decided_at: DateTime<Utc>,
    },
    EscalationTimedOut {
        agent_id: String,
        escalation_id: EscalationId,
        new_state: FcbState,
        timed_out_at: DateTime<Utc>,
    },
    TransactionBlocked {
        agent_id: String,
        reason: String,
        blocked_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    SessionGranted {
        session_id: SessionId,
        agent_did: String,
        session_expiry: DateTime<Utc>,
        granted_at: DateTime<Utc>,
    },
    SessionRevoked {
        session_id: SessionId,
        reason: String,
        revoked_at: DateTime<Utc>,
    },
}
