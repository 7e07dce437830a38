// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Streaming Payment Sessions (BC-14, ADR-121)
//!
//! Continuous metered billing on top of a payment channel: pay-per-token,
//! pay-per-second or pay-per-request models for inference and real-time
//! services. A session accumulates signed incremental vouchers; checkpoints
//! make long streams resumable.
//!
//! ## Session Lifecycle
//!
//! ```text
//! create_stream → INITIALIZING
//!                    │ first voucher
//!                    ▼
//!                 ACTIVE ◄────────► PAUSED
//!                    │    pause/resume
//!        ┌───────────┼───────────┐
//!        ▼           ▼           ▼
//!    COMPLETED   CANCELLED    FAILED      (terminal)
//! ```
//!
//! ## Invariants
//!
//! - Voucher sequence numbers are contiguous from 1; `cumulative_amount` and
//!   `cumulative_units` never decrease.
//! - Tiered billing is marginal: a usage increment crossing a tier boundary
//!   is split across bands, never charged entirely at one band's rate.
//! - Limit checks are advisory. The session reports the first breached limit
//!   in priority order; callers decide whether to pause or reject.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::channel::ChannelId;
use crate::domain::error::TreasuryError;
use crate::domain::money::Money;

/// Identifier for a streaming session (`stream_<agent>_<counter>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub String);

impl StreamId {
    pub fn new(agent_did: &str, counter: u64) -> Self {
        Self(format!("stream_{agent_did}_{counter}"))
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a stream's usage translates into charges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentRateType {
    PerSecond,
    PerMinute,
    PerHour,
    PerToken,
    PerRequest,
    PerByte,
    PerComputeUnit,
    FlatRate,
    TieredRate,
}

/// Status of a streaming payment session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Initializing,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl StreamStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One band of a tiered rate structure.
///
/// `max_units` of `None` means unbounded; `rate_per_unit` of `None` falls
/// back to the rate's base `rate_amount`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierThreshold {
    #[serde(default)]
    pub min_units: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_units: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_per_unit: Option<f64>,
}

/// Rate structure for a streaming session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRate {
    pub rate_type: PaymentRateType,
    /// Amount charged per unit (or the full amount for FLAT_RATE).
    pub rate_amount: Money,
    /// Advisory floor; recorded for settlement layers, not applied here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_charge: Option<Money>,
    /// Advisory cap; recorded for settlement layers, not applied here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_charge: Option<Money>,
    #[serde(default = "default_billing_frequency")]
    pub billing_frequency_seconds: u64,
    /// What constitutes one unit (tokens, seconds, requests).
    pub unit_description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier_thresholds: Option<Vec<TierThreshold>>,
}

/// Signed evidence of one usage increment within a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamVoucher {
    /// `<stream_id>_<sequence>`.
    pub voucher_id: String,
    pub stream_id: StreamId,
    pub channel_id: ChannelId,
    pub sequence_number: u64,
    pub increment_amount: Money,
    pub cumulative_amount: Money,
    pub units_consumed: f64,
    pub cumulative_units: f64,
    pub rate_applied: PaymentRate,
    pub timestamp: DateTime<Utc>,
    pub signature: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Resumption point for a long-running stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCheckpoint {
    /// `<stream_id>_checkpoint_<voucher-count>`.
    pub checkpoint_id: String,
    pub stream_id: StreamId,
    pub sequence_number: u64,
    pub cumulative_amount: Money,
    pub cumulative_units: f64,
    pub timestamp: DateTime<Utc>,
    /// Digest over the stream position, co-signable by participants.
    pub state_hash: String,
    #[serde(default)]
    pub signatures: HashMap<String, String>,
}

/// Policy governing an automated streaming session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingPaymentPolicy {
    /// Maximum stream duration (1 hour default).
    #[serde(default = "default_max_stream_duration")]
    pub max_stream_duration_seconds: u64,
    #[serde(default = "default_checkpoint_frequency")]
    pub checkpoint_frequency_seconds: u64,
    /// Cumulative amount at which callers should pause the stream.
    pub auto_pause_threshold: Money,
    /// Hard ceiling on the stream's cumulative amount.
    pub max_cumulative_amount: Money,
    #[serde(default)]
    pub rate_adjustment_allowed: bool,
    /// Timeout for resolving streaming disputes (5 minutes).
    #[serde(default = "default_dispute_resolution_timeout")]
    pub dispute_resolution_timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_requirements: Option<HashMap<String, serde_json::Value>>,
}

/// First breached policy limit, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamLimit {
    CumulativeAmountExceeded,
    DurationExceeded,
    AutoPauseThresholdReached,
}

impl std::fmt::Display for StreamLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CumulativeAmountExceeded => write!(f, "cumulative amount exceeds policy limit"),
            Self::DurationExceeded => write!(f, "stream duration exceeds policy limit"),
            Self::AutoPauseThresholdReached => write!(f, "auto-pause threshold reached"),
        }
    }
}

/// Aggregate root for one metered billing session (BC-14, ADR-121).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingPaymentSession {
    pub stream_id: StreamId,
    pub channel_id: ChannelId,
    pub payer_id: String,
    pub payee_id: String,
    pub service_description: String,
    pub rate: PaymentRate,
    pub policy: StreamingPaymentPolicy,
    pub status: StreamStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub current_sequence: u64,
    pub cumulative_amount: Money,
    pub cumulative_units: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checkpoint: Option<PaymentCheckpoint>,
    #[serde(default)]
    pub vouchers: Vec<StreamVoucher>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl StreamingPaymentSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream_id: StreamId,
        channel_id: ChannelId,
        payer_id: impl Into<String>,
        payee_id: impl Into<String>,
        service_description: impl Into<String>,
        rate: PaymentRate,
        policy: StreamingPaymentPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        let cumulative_amount = Money::zero(rate.rate_amount.currency.clone());
        Self {
            stream_id,
            channel_id,
            payer_id: payer_id.into(),
            payee_id: payee_id.into(),
            service_description: service_description.into(),
            rate,
            policy,
            status: StreamStatus::Initializing,
            start_time: now,
            end_time: None,
            current_sequence: 0,
            cumulative_amount,
            cumulative_units: 0.0,
            last_checkpoint: None,
            vouchers: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Charge for the next usage increment without mutating the session.
    pub fn calculate_next_payment(&self, units_consumed: f64) -> Money {
        let currency = self.rate.rate_amount.currency.clone();
        match self.rate.rate_type {
            PaymentRateType::FlatRate => {
                // Full amount once, at the first voucher.
                if self.current_sequence == 0 {
                    self.rate.rate_amount.clone()
                } else {
                    Money::zero(currency)
                }
            }
            PaymentRateType::PerSecond
            | PaymentRateType::PerMinute
            | PaymentRateType::PerHour
            | PaymentRateType::PerToken
            | PaymentRateType::PerRequest
            | PaymentRateType::PerByte
            | PaymentRateType::PerComputeUnit => {
                Money::new(currency, self.rate.rate_amount.value * units_consumed)
            }
            PaymentRateType::TieredRate => self.calculate_tiered_payment(units_consumed),
        }
    }

    /// Marginal tiered charge for moving cumulative usage from `u0` to
    /// `u0 + units_consumed`: each band charges only the units that newly
    /// fell inside it.
    fn calculate_tiered_payment(&self, units_consumed: f64) -> Money {
        let currency = self.rate.rate_amount.currency.clone();
        let Some(tiers) = &self.rate.tier_thresholds else {
            return Money::new(currency, self.rate.rate_amount.value * units_consumed);
        };

        let old_total = self.cumulative_units;
        let new_total = self.cumulative_units + units_consumed;

        let mut total_cost = 0.0;
        for tier in tiers {
            let tier_min = tier.min_units;
            let tier_max = tier.max_units.unwrap_or(f64::INFINITY);
            let tier_rate = tier.rate_per_unit.unwrap_or(self.rate.rate_amount.value);

            let old_in_tier = (old_total.min(tier_max) - tier_min).max(0.0);
            let new_in_tier = (new_total.min(tier_max) - tier_min).max(0.0);

            let increment_in_tier = new_in_tier - old_in_tier;
            if increment_in_tier > 0.0 {
                total_cost += increment_in_tier * tier_rate;
            }
        }

        Money::new(currency, total_cost)
    }

    /// Append a signed usage voucher and advance the session counters.
    ///
    /// The first voucher flips INITIALIZING to ACTIVE; any other state
    /// besides ACTIVE rejects.
    pub fn add_voucher(
        &mut self,
        units_consumed: f64,
        signature: impl Into<String>,
        metadata: HashMap<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<StreamVoucher, TreasuryError> {
        match self.status {
            StreamStatus::Initializing => self.status = StreamStatus::Active,
            StreamStatus::Active => {}
            other => return Err(TreasuryError::invalid_state("add voucher", other)),
        }

        let increment_amount = self.calculate_next_payment(units_consumed);
        let new_cumulative_amount = Money::new(
            self.cumulative_amount.currency.clone(),
            self.cumulative_amount.value + increment_amount.value,
        );
        let new_cumulative_units = self.cumulative_units + units_consumed;

        let voucher = StreamVoucher {
            voucher_id: format!("{}_{}", self.stream_id, self.current_sequence + 1),
            stream_id: self.stream_id.clone(),
            channel_id: self.channel_id.clone(),
            sequence_number: self.current_sequence + 1,
            increment_amount,
            cumulative_amount: new_cumulative_amount.clone(),
            units_consumed,
            cumulative_units: new_cumulative_units,
            rate_applied: self.rate.clone(),
            timestamp: now,
            signature: signature.into(),
            metadata,
        };

        self.vouchers.push(voucher.clone());
        self.current_sequence += 1;
        self.cumulative_amount = new_cumulative_amount;
        self.cumulative_units = new_cumulative_units;

        Ok(voucher)
    }

    /// Snapshot the current stream position for resumption.
    pub fn create_checkpoint(&mut self, now: DateTime<Utc>) -> PaymentCheckpoint {
        let mut hasher = Sha256::new();
        hasher.update(
            format!(
                "{}:{}:{}:{}",
                self.stream_id, self.current_sequence, self.cumulative_amount.value,
                self.cumulative_units
            )
            .as_bytes(),
        );
        let checkpoint = PaymentCheckpoint {
            checkpoint_id: format!("{}_checkpoint_{}", self.stream_id, self.vouchers.len()),
            stream_id: self.stream_id.clone(),
            sequence_number: self.current_sequence,
            cumulative_amount: self.cumulative_amount.clone(),
            cumulative_units: self.cumulative_units,
            timestamp: now,
            state_hash: hex::encode(hasher.finalize()),
            signatures: HashMap::new(),
        };
        self.last_checkpoint = Some(checkpoint.clone());
        checkpoint
    }

    /// Pause an ACTIVE stream, recording the reason.
    pub fn pause_stream(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), TreasuryError> {
        if self.status != StreamStatus::Active {
            return Err(TreasuryError::invalid_state("pause stream", self.status));
        }
        self.status = StreamStatus::Paused;
        self.metadata
            .insert("pause_reason".to_string(), serde_json::json!(reason));
        self.metadata
            .insert("paused_at".to_string(), serde_json::json!(now.to_rfc3339()));
        Ok(())
    }

    /// Resume a PAUSED stream.
    pub fn resume_stream(&mut self, now: DateTime<Utc>) -> Result<(), TreasuryError> {
        if self.status != StreamStatus::Paused {
            return Err(TreasuryError::invalid_state("resume stream", self.status));
        }
        self.status = StreamStatus::Active;
        self.metadata
            .insert("resumed_at".to_string(), serde_json::json!(now.to_rfc3339()));
        Ok(())
    }

    /// Terminal: COMPLETED.
    pub fn complete_stream(&mut self, now: DateTime<Utc>) -> Result<(), TreasuryError> {
        if self.status.is_terminal() {
            return Err(TreasuryError::invalid_state("complete stream", self.status));
        }
        self.status = StreamStatus::Completed;
        self.end_time = Some(now);
        Ok(())
    }

    /// Terminal: CANCELLED.
    pub fn cancel_stream(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), TreasuryError> {
        if self.status.is_terminal() {
            return Err(TreasuryError::invalid_state("cancel stream", self.status));
        }
        self.status = StreamStatus::Cancelled;
        self.end_time = Some(now);
        self.metadata
            .insert("cancel_reason".to_string(), serde_json::json!(reason));
        Ok(())
    }

    /// Terminal: FAILED.
    pub fn fail_stream(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), TreasuryError> {
        if self.status.is_terminal() {
            return Err(TreasuryError::invalid_state("fail stream", self.status));
        }
        self.status = StreamStatus::Failed;
        self.end_time = Some(now);
        self.metadata
            .insert("failure_reason".to_string(), serde_json::json!(reason));
        Ok(())
    }

    /// Advisory policy check. Returns the first breached limit in priority
    /// order, or `None` when the stream is within limits. The session never
    /// self-enforces; callers decide whether to pause, sweep or reject.
    pub fn check_limits(&self, now: DateTime<Utc>) -> Option<StreamLimit> {
        if self.cumulative_amount.value > self.policy.max_cumulative_amount.value {
            return Some(StreamLimit::CumulativeAmountExceeded);
        }

        if self.status == StreamStatus::Active {
            let duration_seconds = (now - self.start_time).num_seconds();
            if duration_seconds > self.policy.max_stream_duration_seconds as i64 {
                return Some(StreamLimit::DurationExceeded);
            }
        }

        if self.cumulative_amount.value >= self.policy.auto_pause_threshold.value {
            return Some(StreamLimit::AutoPauseThresholdReached);
        }

        None
    }

    /// Whether the stream has outlived its policy's duration cap.
    pub fn is_over_duration(&self, now: DateTime<Utc>) -> bool {
        (now - self.start_time).num_seconds() > self.policy.max_stream_duration_seconds as i64
    }
}

fn default_billing_frequency() -> u64 {
    1
}

fn default_max_stream_duration() -> u64 {
    3_600
}

fn default_checkpoint_frequency() -> u64 {
    60
}

fn default_dispute_resolution_timeout() -> u64 {
    300
}
