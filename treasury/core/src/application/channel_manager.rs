// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Channel Manager Application Service
//!
//! Orchestrates payment channel lifecycle operations coordinating:
//! - Domain layer: PaymentChannel aggregate, Attestation trait
//! - Infrastructure layer: ChannelRepository, attestation adapters
//! - Event bus: Publishing ChannelEvents for the audit trail
//!
//! Serialization model: every balance-mutating operation runs under a
//! per-channel `tokio::sync::Mutex` keyed in a `DashMap`, so at most one
//! mutation is in flight per channel while distinct channels proceed in
//! parallel. Snapshot reads bypass the lock and observe pre- or post-state,
//! never an interleaving.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::attestation::Attestation;
use crate::domain::channel::{
    ChannelCloseRequest, ChannelDispute, ChannelId, ChannelOpenRequest, ChannelState,
    ChannelStatus, DisputeOutcome, DisputeReason, PaymentChannel, PaymentVoucher, SettlementInfo,
    UpdateId, VoucherId,
};
use crate::domain::error::TreasuryError;
use crate::domain::events::ChannelEvent;
use crate::domain::money::Money;
use crate::domain::repository::ChannelRepository;
use crate::infrastructure::event_bus::EventBus;

const DEFAULT_ATTESTATION_TIMEOUT: Duration = Duration::from_secs(5);

/// How a cooperative (non-force) close is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClosePolicy {
    /// The first close request settles the channel immediately.
    #[default]
    SingleSigner,
    /// The channel stays CLOSING until a different participant confirms
    /// with a second close request at the same balances.
    RequireCounterparty,
}

/// Aggregated registry statistics across all channels this manager has seen.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreasuryStats {
    pub active_channels: usize,
    pub settled_channels: usize,
    pub total_transactions: u64,
    /// Payment volume per currency code, accumulated per successful payment.
    pub total_volume: HashMap<String, f64>,
}

// ============================================================================
// Service Trait
// ============================================================================

#[async_trait]
pub trait ChannelService: Send + Sync {
    /// Open a new channel in OPENING state; returns its id
    async fn open_channel(&self, request: ChannelOpenRequest) -> Result<ChannelId>;

    /// Move an OPENING channel to ACTIVE
    async fn activate_channel(&self, channel_id: &ChannelId) -> Result<()>;

    /// Process one payment, returning the signed voucher
    async fn process_payment(
        &self,
        channel_id: &ChannelId,
        from_participant: &str,
        to_participant: &str,
        amount: Money,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<PaymentVoucher>;

    /// Record a participant's co-signature on a pending channel update.
    /// Returns true when the update became fully signed (and drained).
    async fn acknowledge_update(
        &self,
        channel_id: &ChannelId,
        update_id: &UpdateId,
        participant_id: &str,
        signature: &str,
    ) -> Result<bool>;

    /// Close a channel per the manager's ClosePolicy; returns the recorded
    /// settlement (final once status reports CLOSED)
    async fn close_channel(&self, request: ChannelCloseRequest) -> Result<SettlementInfo>;

    /// Raise a dispute, freezing payments until resolution
    async fn dispute_channel(
        &self,
        channel_id: &ChannelId,
        disputing_participant: &str,
        reason: DisputeReason,
        evidence: Vec<serde_json::Value>,
    ) -> Result<ChannelDispute>;

    /// Resolve an open dispute: reinstate the channel or settle it
    async fn resolve_dispute(
        &self,
        channel_id: &ChannelId,
        outcome: DisputeOutcome,
        resolution: &str,
    ) -> Result<()>;

    /// Read-only channel snapshot
    async fn get_channel_status(&self, channel_id: &ChannelId) -> Result<ChannelStatus>;

    /// Snapshots of every non-settled channel the participant belongs to
    async fn get_channels_by_participant(
        &self,
        participant_id: &str,
    ) -> Result<Vec<ChannelStatus>>;

    /// Force-settle channels past expiry at their last balances.
    /// Returns the swept channel ids.
    async fn cleanup_expired_channels(&self) -> Result<Vec<ChannelId>>;

    /// Registry statistics (counts, transaction total, volume per currency)
    async fn get_treasury_stats(&self) -> Result<TreasuryStats>;
}

// ============================================================================
// Standard Implementation
// ============================================================================

pub struct StandardChannelService {
    repository: Arc<dyn ChannelRepository>,
    attestation: Arc<dyn Attestation>,
    event_bus: Arc<EventBus>,
    close_policy: ClosePolicy,
    /// Per-channel mutation guards; entries removed when a channel settles.
    locks: DashMap<ChannelId, Arc<Mutex<()>>>,
    counters: Mutex<PaymentCounters>,
    attestation_timeout: Duration,
}

#[derive(Default)]
struct PaymentCounters {
    total_transactions: u64,
    total_volume: HashMap<String, f64>,
}

impl StandardChannelService {
    pub fn new(
        repository: Arc<dyn ChannelRepository>,
        attestation: Arc<dyn Attestation>,
        event_bus: Arc<EventBus>,
        close_policy: ClosePolicy,
    ) -> Self {
        Self {
            repository,
            attestation,
            event_bus,
            close_policy,
            locks: DashMap::new(),
            counters: Mutex::new(PaymentCounters::default()),
            attestation_timeout: DEFAULT_ATTESTATION_TIMEOUT,
        }
    }

    pub fn with_attestation_timeout(mut self, timeout: Duration) -> Self {
        self.attestation_timeout = timeout;
        self
    }

    fn channel_lock(&self, channel_id: &ChannelId) -> Arc<Mutex<()>> {
        self.locks
            .entry(channel_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_channel(&self, channel_id: &ChannelId) -> Result<PaymentChannel> {
        self.repository
            .find_by_id(channel_id)
            .await
            .context("Failed to load channel from repository")?
            .ok_or_else(|| TreasuryError::not_found("channel", channel_id).into())
    }

    /// Sign through the attestation capability with a timeout, retrying
    /// exactly once. A second failure surfaces as AttestationFailure.
    async fn attest_sign(&self, payload: &[u8]) -> Result<String, TreasuryError> {
        let mut last_failure = String::new();
        for attempt in 0..2u8 {
            match tokio::time::timeout(self.attestation_timeout, self.attestation.sign(payload))
                .await
            {
                Ok(Ok(signature)) => return Ok(signature),
                Ok(Err(e)) => {
                    warn!("Attestation sign failed (attempt {}): {}", attempt + 1, e);
                    last_failure = e.to_string();
                }
                Err(_) => {
                    warn!(
                        "Attestation sign timed out after {:?} (attempt {})",
                        self.attestation_timeout,
                        attempt + 1
                    );
                    last_failure = "signing timed out".to_string();
                }
            }
        }
        Err(TreasuryError::AttestationFailure {
            reason: last_failure,
        })
    }

    async fn attest_verify(
        &self,
        payload: &[u8],
        signature: &str,
        public_key: &str,
    ) -> Result<bool, TreasuryError> {
        let mut last_failure = String::new();
        for attempt in 0..2u8 {
            match tokio::time::timeout(
                self.attestation_timeout,
                self.attestation.verify(payload, signature, public_key),
            )
            .await
            {
                Ok(Ok(verified)) => return Ok(verified),
                Ok(Err(e)) => {
                    warn!("Attestation verify failed (attempt {}): {}", attempt + 1, e);
                    last_failure = e.to_string();
                }
                Err(_) => {
                    warn!(
                        "Attestation verify timed out after {:?} (attempt {})",
                        self.attestation_timeout,
                        attempt + 1
                    );
                    last_failure = "verification timed out".to_string();
                }
            }
        }
        Err(TreasuryError::AttestationFailure {
            reason: last_failure,
        })
    }
}

/// True when both settlements name the same participants at the same
/// balances (within [`Money::approx_eq`] tolerance).
fn balances_match(pending: &HashMap<String, Money>, proposed: &HashMap<String, Money>) -> bool {
    pending.len() == proposed.len()
        && pending
            .iter()
            .all(|(id, balance)| proposed.get(id).is_some_and(|b| b.approx_eq(balance)))
}

#[async_trait]
impl ChannelService for StandardChannelService {
    async fn open_channel(&self, request: ChannelOpenRequest) -> Result<ChannelId> {
        let now = Utc::now();
        let channel = PaymentChannel::open(&request, now)?;
        let channel_id = channel.channel_id.clone();

        info!(
            "Opening channel {} between {} and {} (capacity: {} {})",
            channel_id,
            request.requesting_participant.participant_id,
            request.target_participant.participant_id,
            channel.total_capacity.value,
            channel.total_capacity.currency,
        );

        self.repository
            .save(&channel)
            .await
            .context("Failed to save opened channel")?;

        self.event_bus.publish_channel_event(ChannelEvent::ChannelOpened {
            channel_id: channel_id.clone(),
            participants: channel
                .participants
                .iter()
                .map(|p| p.participant_id.clone())
                .collect(),
            capacity: channel.total_capacity.clone(),
            opened_at: now,
        });

        debug!("Channel {} awaiting activation", channel_id);
        Ok(channel_id)
    }

    async fn activate_channel(&self, channel_id: &ChannelId) -> Result<()> {
        let lock = self.channel_lock(channel_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut channel = self.load_channel(channel_id).await?;
        channel.activate(now)?;

        self.repository
            .save(&channel)
            .await
            .context("Failed to save channel after activation")?;

        self.event_bus.publish_channel_event(ChannelEvent::ChannelActivated {
            channel_id: channel_id.clone(),
            activated_at: now,
        });

        info!("Channel {} activated", channel_id);
        Ok(())
    }

    async fn process_payment(
        &self,
        channel_id: &ChannelId,
        from_participant: &str,
        to_participant: &str,
        amount: Money,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<PaymentVoucher> {
        let lock = self.channel_lock(channel_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut channel = self.load_channel(channel_id).await?;

        // Policy checks run before any attestation call.
        channel.can_process_payment(from_participant, to_participant, &amount, now)?;

        // Attestation runs before any mutation; a signing failure leaves
        // the channel untouched.
        let payload = format!(
            "{}:{}:{}:{}",
            channel_id, from_participant, amount.value, amount.currency
        );
        let signature = self.attest_sign(payload.as_bytes()).await?;

        let voucher_id = VoucherId::new();
        let applied = channel.apply_payment(
            from_participant,
            to_participant,
            &amount,
            &voucher_id,
            now,
        )?;

        let voucher = PaymentVoucher {
            voucher_id: voucher_id.clone(),
            channel_id: channel_id.clone(),
            from_participant: from_participant.to_string(),
            to_participant: to_participant.to_string(),
            amount: amount.clone(),
            nonce: applied.sequence_number,
            cumulative_amount: applied.cumulative_to_payee.clone(),
            timestamp: now,
            signature,
            metadata,
        };

        self.repository
            .save(&channel)
            .await
            .context("Failed to save channel after payment")?;

        {
            let mut counters = self.counters.lock().await;
            counters.total_transactions += 1;
            *counters
                .total_volume
                .entry(amount.currency.clone())
                .or_insert(0.0) += amount.value;
        }

        self.event_bus.publish_channel_event(ChannelEvent::PaymentProcessed {
            channel_id: channel_id.clone(),
            voucher_id,
            from_participant: from_participant.to_string(),
            to_participant: to_participant.to_string(),
            amount: amount.clone(),
            sequence_number: applied.sequence_number,
            state_hash: applied.state_hash.clone(),
            processed_at: now,
        });

        debug!(
            "Payment of {} {} processed on channel {} (sequence {})",
            amount.value, amount.currency, channel_id, applied.sequence_number
        );

        Ok(voucher)
    }

    async fn acknowledge_update(
        &self,
        channel_id: &ChannelId,
        update_id: &UpdateId,
        participant_id: &str,
        signature: &str,
    ) -> Result<bool> {
        let lock = self.channel_lock(channel_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut channel = self.load_channel(channel_id).await?;

        let participant = channel
            .get_participant(participant_id)
            .ok_or_else(|| TreasuryError::not_found("participant", participant_id))?;
        let public_key = participant.public_key.clone();

        let update = channel
            .pending_updates
            .iter()
            .find(|u| &u.update_id == update_id)
            .ok_or_else(|| TreasuryError::not_found("channel update", update_id))?;
        let state_hash = update.state_hash.clone();

        let verified = self
            .attest_verify(state_hash.as_bytes(), signature, &public_key)
            .await?;
        if !verified {
            return Err(TreasuryError::policy(format!(
                "signature from {participant_id} does not verify over update state hash"
            ))
            .into());
        }

        let fully_signed = channel.sign_pending_update(update_id, participant_id, signature)?;

        self.repository
            .save(&channel)
            .await
            .context("Failed to save channel after update acknowledgement")?;

        self.event_bus.publish_channel_event(ChannelEvent::UpdateAcknowledged {
            channel_id: channel_id.clone(),
            update_id: update_id.clone(),
            participant_id: participant_id.to_string(),
            fully_signed,
            acknowledged_at: now,
        });

        Ok(fully_signed)
    }

    async fn close_channel(&self, request: ChannelCloseRequest) -> Result<SettlementInfo> {
        let lock = self.channel_lock(&request.channel_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut channel = self.load_channel(&request.channel_id).await?;

        if channel.get_participant(&request.requesting_participant).is_none() {
            return Err(
                TreasuryError::not_found("participant", &request.requesting_participant).into(),
            );
        }
        channel.validate_final_balances(&request.final_balances)?;

        let settlement = SettlementInfo {
            final_balances: request.final_balances.clone(),
            closed_by: Some(request.requesting_participant.clone()),
            close_reason: request.reason.clone(),
            closure_time: now,
        };

        let finalize = request.force_close
            || match self.close_policy {
                ClosePolicy::SingleSigner => true,
                ClosePolicy::RequireCounterparty => {
                    // A confirmation is a second request from a different
                    // participant repeating the proposed balances; anything
                    // else becomes the new pending proposal.
                    channel.state == ChannelState::Closing
                        && channel.settlement_info.as_ref().is_some_and(|pending| {
                            pending
                                .closed_by
                                .as_deref()
                                .is_some_and(|proposer| proposer != request.requesting_participant)
                                && balances_match(&pending.final_balances, &request.final_balances)
                        })
                }
            };

        if finalize {
            channel.settle(settlement.clone())?;
            self.repository
                .save(&channel)
                .await
                .context("Failed to save settled channel")?;
            self.locks.remove(&request.channel_id);

            self.event_bus.publish_channel_event(ChannelEvent::ChannelClosed {
                channel_id: request.channel_id.clone(),
                closed_by: request.requesting_participant.clone(),
                close_reason: request.reason.clone(),
                final_balances: settlement
                    .final_balances
                    .iter()
                    .map(|(id, balance)| (id.clone(), balance.clone()))
                    .collect(),
                closed_at: now,
            });

            info!(
                "Channel {} closed by {} ({})",
                request.channel_id, request.requesting_participant, request.reason
            );
        } else {
            channel.begin_close(settlement.clone())?;
            self.repository
                .save(&channel)
                .await
                .context("Failed to save closing channel")?;

            self.event_bus.publish_channel_event(ChannelEvent::ChannelClosing {
                channel_id: request.channel_id.clone(),
                initiated_by: request.requesting_participant.clone(),
                closing_at: now,
            });

            info!(
                "Channel {} closing, awaiting counterparty confirmation",
                request.channel_id
            );
        }

        Ok(settlement)
    }

    async fn dispute_channel(
        &self,
        channel_id: &ChannelId,
        disputing_participant: &str,
        reason: DisputeReason,
        evidence: Vec<serde_json::Value>,
    ) -> Result<ChannelDispute> {
        let lock = self.channel_lock(channel_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut channel = self.load_channel(channel_id).await?;
        let dispute = channel.raise_dispute(disputing_participant, reason, evidence, now)?;

        self.repository
            .save(&channel)
            .await
            .context("Failed to save disputed channel")?;

        self.event_bus.publish_channel_event(ChannelEvent::ChannelDisputed {
            channel_id: channel_id.clone(),
            dispute_id: dispute.dispute_id.clone(),
            raised_by: disputing_participant.to_string(),
            reason,
            disputed_at: now,
        });

        warn!(
            "Channel {} disputed by {} ({:?})",
            channel_id, disputing_participant, reason
        );

        Ok(dispute)
    }

    async fn resolve_dispute(
        &self,
        channel_id: &ChannelId,
        outcome: DisputeOutcome,
        resolution: &str,
    ) -> Result<()> {
        let lock = self.channel_lock(channel_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut channel = self.load_channel(channel_id).await?;
        let dispute_id = channel
            .dispute_info
            .as_ref()
            .map(|d| d.dispute_id.clone())
            .ok_or_else(|| TreasuryError::not_found("dispute", channel_id))?;

        channel.resolve_dispute(outcome, resolution, now)?;

        self.repository
            .save(&channel)
            .await
            .context("Failed to save channel after dispute resolution")?;

        self.event_bus.publish_channel_event(ChannelEvent::DisputeResolved {
            channel_id: channel_id.clone(),
            dispute_id,
            outcome,
            resolved_at: now,
        });

        if channel.state == ChannelState::Closed {
            self.locks.remove(channel_id);
            if let Some(settlement) = &channel.settlement_info {
                self.event_bus.publish_channel_event(ChannelEvent::ChannelClosed {
                    channel_id: channel_id.clone(),
                    closed_by: settlement.closed_by.clone().unwrap_or_default(),
                    close_reason: settlement.close_reason.clone(),
                    final_balances: settlement
                        .final_balances
                        .iter()
                        .map(|(id, balance)| (id.clone(), balance.clone()))
                        .collect(),
                    closed_at: now,
                });
            }
        }

        info!(
            "Dispute on channel {} resolved: {:?} ({})",
            channel_id, outcome, resolution
        );
        Ok(())
    }

    async fn get_channel_status(&self, channel_id: &ChannelId) -> Result<ChannelStatus> {
        let channel = self.load_channel(channel_id).await?;
        Ok(channel.status(Utc::now()))
    }

    async fn get_channels_by_participant(
        &self,
        participant_id: &str,
    ) -> Result<Vec<ChannelStatus>> {
        let now = Utc::now();
        let channels = self
            .repository
            .find_by_participant(participant_id)
            .await
            .context("Failed to list channels by participant")?;

        Ok(channels
            .iter()
            .filter(|c| !matches!(c.state, ChannelState::Closed | ChannelState::Expired))
            .map(|c| c.status(now))
            .collect())
    }

    async fn cleanup_expired_channels(&self) -> Result<Vec<ChannelId>> {
        let now = Utc::now();
        let candidates = self
            .repository
            .find_expired(now)
            .await
            .context("Failed to find expired channels")?;

        let mut swept = Vec::new();
        for candidate in candidates {
            let channel_id = candidate.channel_id.clone();
            let lock = self.channel_lock(&channel_id);
            let _guard = lock.lock().await;

            // Reload under the lock: a concurrent close may have settled it.
            let Some(mut channel) = self
                .repository
                .find_by_id(&channel_id)
                .await
                .context("Failed to reload channel during expiry sweep")?
            else {
                continue;
            };
            if !channel.is_expired(now)
                || !matches!(
                    channel.state,
                    ChannelState::Opening | ChannelState::Active | ChannelState::Closing
                )
            {
                continue;
            }

            channel.expire(now);
            self.repository
                .save(&channel)
                .await
                .context("Failed to save expired channel")?;
            self.locks.remove(&channel_id);

            self.event_bus.publish_channel_event(ChannelEvent::ChannelExpired {
                channel_id: channel_id.clone(),
                expired_at: now,
            });

            info!("Channel {} expired, settled at last balances", channel_id);
            swept.push(channel_id);
        }

        Ok(swept)
    }

    async fn get_treasury_stats(&self) -> Result<TreasuryStats> {
        let channels = self
            .repository
            .list_all()
            .await
            .context("Failed to list channels for statistics")?;

        let settled = channels
            .iter()
            .filter(|c| matches!(c.state, ChannelState::Closed | ChannelState::Expired))
            .count();

        let counters = self.counters.lock().await;
        Ok(TreasuryStats {
            active_channels: channels.len() - settled,
            settled_channels: settled,
            total_transactions: counters.total_transactions,
            total_volume: counters.total_volume.clone(),
        })
    }
}
