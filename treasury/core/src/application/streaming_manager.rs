// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Streaming Payment Application Service
//!
//! Manages continuous usage-metered payment sessions coordinating:
//! - Domain layer: StreamingPaymentSession aggregate, Attestation trait
//! - Infrastructure layer: StreamRepository, attestation adapters
//! - Event bus: Publishing StreamEvents for the audit trail
//!
//! Stream ids are minted from the manager's agent DID and a monotonic
//! counter, so one manager instance owns one agent's streams. The same
//! per-aggregate locking discipline as the channel manager applies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
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
use crate::domain::channel::ChannelId;
use crate::domain::error::TreasuryError;
use crate::domain::events::StreamEvent;
use crate::domain::money::Money;
use crate::domain::repository::StreamRepository;
use crate::domain::streaming::{
    PaymentCheckpoint, PaymentRate, StreamId, StreamLimit, StreamVoucher,
    StreamingPaymentPolicy, StreamingPaymentSession,
};
use crate::infrastructure::event_bus::EventBus;

const DEFAULT_ATTESTATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Aggregated statistics across all streams this manager has minted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamingStats {
    pub total_streams: u64,
    pub active_streams: usize,
    /// Volume folded in per currency when streams complete.
    pub total_volume: HashMap<String, f64>,
}

// ============================================================================
// Service Trait
// ============================================================================

#[async_trait]
pub trait StreamingService: Send + Sync {
    /// Create a new INITIALIZING stream bound to a payment channel
    async fn create_stream(
        &self,
        channel_id: ChannelId,
        payer_id: &str,
        payee_id: &str,
        service_description: &str,
        rate: PaymentRate,
        policy: StreamingPaymentPolicy,
    ) -> Result<StreamId>;

    /// Record one usage increment, returning the signed voucher
    async fn add_stream_voucher(
        &self,
        stream_id: &StreamId,
        units_consumed: f64,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<StreamVoucher>;

    /// Snapshot the stream position for later co-signing
    async fn create_checkpoint(&self, stream_id: &StreamId) -> Result<PaymentCheckpoint>;

    /// ACTIVE → PAUSED with the reason recorded
    async fn pause_stream(&self, stream_id: &StreamId, reason: &str) -> Result<()>;

    /// PAUSED → ACTIVE
    async fn resume_stream(&self, stream_id: &StreamId) -> Result<()>;

    /// Terminal COMPLETED; folds the stream's cumulative amount into the
    /// manager volume statistics and returns it
    async fn complete_stream(&self, stream_id: &StreamId) -> Result<Money>;

    /// Terminal CANCELLED
    async fn cancel_stream(&self, stream_id: &StreamId, reason: &str) -> Result<()>;

    /// Terminal FAILED
    async fn fail_stream(&self, stream_id: &StreamId, reason: &str) -> Result<()>;

    /// First breached policy limit, if any (advisory)
    async fn check_stream_limits(&self, stream_id: &StreamId) -> Result<Option<StreamLimit>>;

    /// Full session snapshot
    async fn get_stream(&self, stream_id: &StreamId) -> Result<StreamingPaymentSession>;

    /// Every non-terminal stream
    async fn get_active_streams(&self) -> Result<Vec<StreamingPaymentSession>>;

    /// Non-terminal streams metering against the given channel
    async fn get_streams_by_channel(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<StreamingPaymentSession>>;

    /// Complete streams that outlived their policy duration; returns the
    /// swept stream ids
    async fn cleanup_expired_streams(&self) -> Result<Vec<StreamId>>;

    /// Manager statistics (stream counts, completed volume per currency)
    async fn get_streaming_stats(&self) -> Result<StreamingStats>;
}

// ============================================================================
// Standard Implementation
// ============================================================================

pub struct StandardStreamingService {
    repository: Arc<dyn StreamRepository>,
    attestation: Arc<dyn Attestation>,
    event_bus: Arc<EventBus>,
    /// DID of the agent this manager mints streams for.
    agent_did: String,
    /// Monotonic, 1-based stream counter; doubles as the created total.
    stream_counter: AtomicU64,
    /// Per-stream mutation guards; entries removed when a stream terminates.
    locks: DashMap<StreamId, Arc<Mutex<()>>>,
    /// Volume folded in per currency as streams complete.
    completed_volume: Mutex<HashMap<String, f64>>,
    attestation_timeout: Duration,
}

impl StandardStreamingService {
    pub fn new(
        repository: Arc<dyn StreamRepository>,
        attestation: Arc<dyn Attestation>,
        event_bus: Arc<EventBus>,
        agent_did: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            attestation,
            event_bus,
            agent_did: agent_did.into(),
            stream_counter: AtomicU64::new(0),
            locks: DashMap::new(),
            completed_volume: Mutex::new(HashMap::new()),
            attestation_timeout: DEFAULT_ATTESTATION_TIMEOUT,
        }
    }

    pub fn with_attestation_timeout(mut self, timeout: Duration) -> Self {
        self.attestation_timeout = timeout;
        self
    }

    fn stream_lock(&self, stream_id: &StreamId) -> Arc<Mutex<()>> {
        self.locks
            .entry(stream_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_stream(&self, stream_id: &StreamId) -> Result<StreamingPaymentSession> {
        self.repository
            .find_by_id(stream_id)
            .await
            .context("Failed to load stream from repository")?
            .ok_or_else(|| TreasuryError::not_found("stream", stream_id).into())
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

    /// Fold a completed stream's cumulative amount into the volume stats.
    async fn record_completed_volume(&self, amount: &Money) {
        let mut volume = self.completed_volume.lock().await;
        *volume.entry(amount.currency.clone()).or_insert(0.0) += amount.value;
    }
}

#[async_trait]
impl StreamingService for StandardStreamingService {
    async fn create_stream(
        &self,
        channel_id: ChannelId,
        payer_id: &str,
        payee_id: &str,
        service_description: &str,
        rate: PaymentRate,
        policy: StreamingPaymentPolicy,
    ) -> Result<StreamId> {
        let now = Utc::now();
        let counter = self.stream_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let stream_id = StreamId::new(&self.agent_did, counter);

        let session = StreamingPaymentSession::new(
            stream_id.clone(),
            channel_id.clone(),
            payer_id,
            payee_id,
            service_description,
            rate,
            policy,
            now,
        );

        info!(
            "Creating stream {} on channel {} ({} -> {}, {:?})",
            stream_id, channel_id, payer_id, payee_id, session.rate.rate_type
        );

        self.repository
            .save(&session)
            .await
            .context("Failed to save created stream")?;

        self.event_bus.publish_stream_event(StreamEvent::StreamCreated {
            stream_id: stream_id.clone(),
            channel_id,
            payer_id: payer_id.to_string(),
            payee_id: payee_id.to_string(),
            created_at: now,
        });

        Ok(stream_id)
    }

    async fn add_stream_voucher(
        &self,
        stream_id: &StreamId,
        units_consumed: f64,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<StreamVoucher> {
        let lock = self.stream_lock(stream_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut session = self.load_stream(stream_id).await?;

        // Attestation runs before any mutation; the payload commits to the
        // sequence the voucher will carry.
        let increment = session.calculate_next_payment(units_consumed);
        let payload = format!(
            "{}:{}:{}:{}",
            stream_id,
            session.current_sequence + 1,
            increment.value,
            increment.currency
        );
        let signature = self.attest_sign(payload.as_bytes()).await?;

        let voucher = session.add_voucher(units_consumed, signature, metadata, now)?;

        self.repository
            .save(&session)
            .await
            .context("Failed to save stream after voucher")?;

        self.event_bus.publish_stream_event(StreamEvent::StreamVoucherAdded {
            stream_id: stream_id.clone(),
            voucher_id: voucher.voucher_id.clone(),
            amount: voucher.increment_amount.clone(),
            cumulative_amount: voucher.cumulative_amount.clone(),
            units_consumed: voucher.units_consumed,
            sequence_number: voucher.sequence_number,
            added_at: now,
        });

        debug!(
            "Stream {} voucher {} ({} {} for {} units)",
            stream_id,
            voucher.sequence_number,
            voucher.increment_amount.value,
            voucher.increment_amount.currency,
            units_consumed
        );

        Ok(voucher)
    }

    async fn create_checkpoint(&self, stream_id: &StreamId) -> Result<PaymentCheckpoint> {
        let lock = self.stream_lock(stream_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut session = self.load_stream(stream_id).await?;
        let checkpoint = session.create_checkpoint(now);

        self.repository
            .save(&session)
            .await
            .context("Failed to save stream after checkpoint")?;

        self.event_bus.publish_stream_event(StreamEvent::CheckpointCreated {
            stream_id: stream_id.clone(),
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            sequence_number: checkpoint.sequence_number,
            state_hash: checkpoint.state_hash.clone(),
            created_at: now,
        });

        Ok(checkpoint)
    }

    async fn pause_stream(&self, stream_id: &StreamId, reason: &str) -> Result<()> {
        let lock = self.stream_lock(stream_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut session = self.load_stream(stream_id).await?;
        session.pause_stream(reason, now)?;

        self.repository
            .save(&session)
            .await
            .context("Failed to save paused stream")?;

        self.event_bus.publish_stream_event(StreamEvent::StreamPaused {
            stream_id: stream_id.clone(),
            reason: reason.to_string(),
            paused_at: now,
        });

        info!("Stream {} paused: {}", stream_id, reason);
        Ok(())
    }

    async fn resume_stream(&self, stream_id: &StreamId) -> Result<()> {
        let lock = self.stream_lock(stream_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut session = self.load_stream(stream_id).await?;
        session.resume_stream(now)?;

        self.repository
            .save(&session)
            .await
            .context("Failed to save resumed stream")?;

        self.event_bus.publish_stream_event(StreamEvent::StreamResumed {
            stream_id: stream_id.clone(),
            resumed_at: now,
        });

        info!("Stream {} resumed", stream_id);
        Ok(())
    }

    async fn complete_stream(&self, stream_id: &StreamId) -> Result<Money> {
        let lock = self.stream_lock(stream_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut session = self.load_stream(stream_id).await?;
        session.complete_stream(now)?;

        self.repository
            .save(&session)
            .await
            .context("Failed to save completed stream")?;
        self.locks.remove(stream_id);

        self.record_completed_volume(&session.cumulative_amount).await;

        self.event_bus.publish_stream_event(StreamEvent::StreamCompleted {
            stream_id: stream_id.clone(),
            total_amount: session.cumulative_amount.clone(),
            total_units: session.cumulative_units,
            completed_at: now,
        });

        info!(
            "Stream {} completed ({} {} over {} units)",
            stream_id,
            session.cumulative_amount.value,
            session.cumulative_amount.currency,
            session.cumulative_units
        );

        Ok(session.cumulative_amount)
    }

    async fn cancel_stream(&self, stream_id: &StreamId, reason: &str) -> Result<()> {
        let lock = self.stream_lock(stream_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut session = self.load_stream(stream_id).await?;
        session.cancel_stream(reason, now)?;

        self.repository
            .save(&session)
            .await
            .context("Failed to save cancelled stream")?;
        self.locks.remove(stream_id);

        self.event_bus.publish_stream_event(StreamEvent::StreamCancelled {
            stream_id: stream_id.clone(),
            reason: reason.to_string(),
            cancelled_at: now,
        });

        info!("Stream {} cancelled: {}", stream_id, reason);
        Ok(())
    }

    async fn fail_stream(&self, stream_id: &StreamId, reason: &str) -> Result<()> {
        let lock = self.stream_lock(stream_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut session = self.load_stream(stream_id).await?;
        session.fail_stream(reason, now)?;

        self.repository
            .save(&session)
            .await
            .context("Failed to save failed stream")?;
        self.locks.remove(stream_id);

        self.event_bus.publish_stream_event(StreamEvent::StreamFailed {
            stream_id: stream_id.clone(),
            reason: reason.to_string(),
            failed_at: now,
        });

        warn!("Stream {} failed: {}", stream_id, reason);
        Ok(())
    }

    async fn check_stream_limits(&self, stream_id: &StreamId) -> Result<Option<StreamLimit>> {
        let session = self.load_stream(stream_id).await?;
        Ok(session.check_limits(Utc::now()))
    }

    async fn get_stream(&self, stream_id: &StreamId) -> Result<StreamingPaymentSession> {
        self.load_stream(stream_id).await
    }

    async fn get_active_streams(&self) -> Result<Vec<StreamingPaymentSession>> {
        self.repository
            .find_active()
            .await
            .context("Failed to list active streams")
    }

    async fn get_streams_by_channel(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<StreamingPaymentSession>> {
        let streams = self
            .repository
            .find_by_channel(channel_id)
            .await
            .context("Failed to list streams by channel")?;
        Ok(streams
            .into_iter()
            .filter(|s| !s.status.is_terminal())
            .collect())
    }

    async fn cleanup_expired_streams(&self) -> Result<Vec<StreamId>> {
        let now = Utc::now();
        let candidates = self
            .repository
            .find_active()
            .await
            .context("Failed to find streams for expiry sweep")?;

        let mut swept = Vec::new();
        for candidate in candidates {
            if !candidate.is_over_duration(now) {
                continue;
            }
            let stream_id = candidate.stream_id.clone();
            let lock = self.stream_lock(&stream_id);
            let _guard = lock.lock().await;

            // Reload under the lock: a concurrent call may have finished it.
            let Some(mut session) = self
                .repository
                .find_by_id(&stream_id)
                .await
                .context("Failed to reload stream during expiry sweep")?
            else {
                continue;
            };
            if session.status.is_terminal() || !session.is_over_duration(now) {
                continue;
            }

            session.complete_stream(now)?;
            self.repository
                .save(&session)
                .await
                .context("Failed to save expired stream")?;
            self.locks.remove(&stream_id);

            self.record_completed_volume(&session.cumulative_amount).await;

            self.event_bus.publish_stream_event(StreamEvent::StreamCompleted {
                stream_id: stream_id.clone(),
                total_amount: session.cumulative_amount.clone(),
                total_units: session.cumulative_units,
                completed_at: now,
            });

            info!(
                "Stream {} exceeded its duration cap, completed at {} {}",
                stream_id, session.cumulative_amount.value, session.cumulative_amount.currency
            );
            swept.push(stream_id);
        }

        Ok(swept)
    }

    async fn get_streaming_stats(&self) -> Result<StreamingStats> {
        let active = self
            .repository
            .find_active()
            .await
            .context("Failed to count active streams")?;
        let volume = self.completed_volume.lock().await;

        Ok(StreamingStats {
            total_streams: self.stream_counter.load(Ordering::SeqCst),
            active_streams: active.len(),
            total_volume: volume.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::streaming::{PaymentRateType, StreamStatus, TierThreshold};
    use crate::infrastructure::attestation::DigestAttestation;
    use crate::infrastructure::repositories::InMemoryStreamRepository;
    use chrono::Duration as ChronoDuration;
    use sha2::{Digest, Sha256};

    fn per_token_rate(value: f64) -> PaymentRate {
        PaymentRate {
            rate_type: PaymentRateType::PerToken,
            rate_amount: Money::usd(value),
            minimum_charge: None,
            maximum_charge: None,
            billing_frequency_seconds: 1,
            unit_description: "tokens".to_string(),
            tier_thresholds: None,
        }
    }

    fn tiered_rate() -> PaymentRate {
        PaymentRate {
            tier_thresholds: Some(vec![
                TierThreshold {
                    min_units: 0.0,
                    max_units: Some(100.0),
                    rate_per_unit: Some(0.01),
                },
                TierThreshold {
                    min_units: 100.0,
                    max_units: None,
                    rate_per_unit: Some(0.005),
                },
            ]),
            rate_type: PaymentRateType::TieredRate,
            ..per_token_rate(0.01)
        }
    }

    fn test_policy() -> StreamingPaymentPolicy {
        StreamingPaymentPolicy {
            max_stream_duration_seconds: 3_600,
            checkpoint_frequency_seconds: 60,
            auto_pause_threshold: Money::usd(50.0),
            max_cumulative_amount: Money::usd(100.0),
            rate_adjustment_allowed: false,
            dispute_resolution_timeout: 300,
            quality_requirements: None,
        }
    }

    fn create_test_service() -> (StandardStreamingService, Arc<InMemoryStreamRepository>) {
        let repository = Arc::new(InMemoryStreamRepository::new());
        let service = StandardStreamingService::new(
            repository.clone(),
            Arc::new(DigestAttestation::new()),
            Arc::new(EventBus::with_default_capacity()),
            "did:ap2:agent-a",
        );
        (service, repository)
    }

    async fn metered_stream(service: &StandardStreamingService, rate: PaymentRate) -> StreamId {
        service
            .create_stream(
                ChannelId::new(),
                "did:ap2:agent-a",
                "did:ap2:provider-b",
                "llm token metering",
                rate,
                test_policy(),
            )
            .await
            .expect("Failed to create stream")
    }

    #[tokio::test]
    async fn test_stream_ids_are_minted_monotonically() {
        let (service, _repository) = create_test_service();
        let first = metered_stream(&service, per_token_rate(0.01)).await;
        let second = metered_stream(&service, per_token_rate(0.01)).await;

        assert_eq!(first.0, "stream_did:ap2:agent-a_1");
        assert_eq!(second.0, "stream_did:ap2:agent-a_2");

        let stats = service.get_streaming_stats().await.unwrap();
        assert_eq!(stats.total_streams, 2);
        assert_eq!(stats.active_streams, 2);
        assert!(stats.total_volume.is_empty());
    }

    #[tokio::test]
    async fn test_first_voucher_activates_and_is_attested() {
        let (service, _repository) = create_test_service();
        let stream_id = metered_stream(&service, per_token_rate(0.01)).await;

        let session = service.get_stream(&stream_id).await.unwrap();
        assert_eq!(session.status, StreamStatus::Initializing);

        let voucher = service
            .add_stream_voucher(&stream_id, 5.0, HashMap::new())
            .await
            .expect("Voucher failed");

        assert_eq!(voucher.sequence_number, 1);
        assert!(voucher.increment_amount.approx_eq(&Money::usd(0.05)));
        assert!(voucher.cumulative_amount.approx_eq(&Money::usd(0.05)));

        let payload = format!("{}:1:{}:USD", stream_id, voucher.increment_amount.value);
        let expected = hex::encode(Sha256::digest(payload.as_bytes()));
        assert_eq!(voucher.signature, expected);

        let session = service.get_stream(&stream_id).await.unwrap();
        assert_eq!(session.status, StreamStatus::Active);
        assert_eq!(session.current_sequence, 1);
    }

    #[tokio::test]
    async fn test_tiered_billing_integrates_marginally() {
        let (service, _repository) = create_test_service();
        let stream_id = metered_stream(&service, tiered_rate()).await;

        let first = service
            .add_stream_voucher(&stream_id, 90.0, HashMap::new())
            .await
            .unwrap();
        assert!(first.increment_amount.approx_eq(&Money::usd(0.90)));

        // 90 -> 120: ten units in the first band, twenty in the second.
        let second = service
            .add_stream_voucher(&stream_id, 30.0, HashMap::new())
            .await
            .unwrap();
        assert!(second.increment_amount.approx_eq(&Money::usd(0.20)));
        assert!(second.cumulative_amount.approx_eq(&Money::usd(1.10)));
        assert_eq!(second.cumulative_units, 120.0);
    }

    #[tokio::test]
    async fn test_paused_stream_rejects_vouchers() {
        let (service, _repository) = create_test_service();
        let stream_id = metered_stream(&service, per_token_rate(0.01)).await;
        service
            .add_stream_voucher(&stream_id, 5.0, HashMap::new())
            .await
            .unwrap();

        service.pause_stream(&stream_id, "budget review").await.unwrap();

        let err = service
            .add_stream_voucher(&stream_id, 5.0, HashMap::new())
            .await
            .unwrap_err();
        let treasury = err.downcast_ref::<TreasuryError>().expect("typed error");
        assert!(matches!(treasury, TreasuryError::InvalidState { .. }));

        let session = service.get_stream(&stream_id).await.unwrap();
        assert_eq!(session.current_sequence, 1);

        service.resume_stream(&stream_id).await.unwrap();
        service
            .add_stream_voucher(&stream_id, 5.0, HashMap::new())
            .await
            .expect("Voucher should succeed after resume");
    }

    #[tokio::test]
    async fn test_complete_folds_volume_into_stats() {
        let (service, _repository) = create_test_service();
        let stream_id = metered_stream(&service, per_token_rate(0.01)).await;
        service
            .add_stream_voucher(&stream_id, 500.0, HashMap::new())
            .await
            .unwrap();

        let total = service.complete_stream(&stream_id).await.unwrap();
        assert!(total.approx_eq(&Money::usd(5.0)));

        let stats = service.get_streaming_stats().await.unwrap();
        assert_eq!(stats.active_streams, 0);
        assert!((stats.total_volume["USD"] - 5.0).abs() < 1e-9);

        // Terminal streams stay queryable but refuse further transitions.
        let err = service.complete_stream(&stream_id).await.unwrap_err();
        let treasury = err.downcast_ref::<TreasuryError>().expect("typed error");
        assert!(matches!(treasury, TreasuryError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_checkpoint_snapshots_position() {
        let (service, _repository) = create_test_service();
        let stream_id = metered_stream(&service, per_token_rate(0.01)).await;
        service
            .add_stream_voucher(&stream_id, 10.0, HashMap::new())
            .await
            .unwrap();

        let checkpoint = service.create_checkpoint(&stream_id).await.unwrap();
        assert_eq!(checkpoint.sequence_number, 1);
        assert!(checkpoint.cumulative_amount.approx_eq(&Money::usd(0.10)));
        assert!(!checkpoint.state_hash.is_empty());

        let session = service.get_stream(&stream_id).await.unwrap();
        assert_eq!(
            session.last_checkpoint.map(|c| c.checkpoint_id),
            Some(checkpoint.checkpoint_id)
        );
    }

    #[tokio::test]
    async fn test_limit_check_reports_auto_pause_threshold() {
        let (service, _repository) = create_test_service();
        let stream_id = metered_stream(&service, per_token_rate(0.01)).await;

        assert_eq!(service.check_stream_limits(&stream_id).await.unwrap(), None);

        // 6000 tokens at 0.01 crosses the 50.00 auto-pause threshold.
        service
            .add_stream_voucher(&stream_id, 6_000.0, HashMap::new())
            .await
            .unwrap();
        assert_eq!(
            service.check_stream_limits(&stream_id).await.unwrap(),
            Some(StreamLimit::AutoPauseThresholdReached)
        );
    }

    #[tokio::test]
    async fn test_cleanup_completes_overrunning_streams() {
        let (service, repository) = create_test_service();
        let stream_id = metered_stream(&service, per_token_rate(0.01)).await;
        service
            .add_stream_voucher(&stream_id, 5.0, HashMap::new())
            .await
            .unwrap();
        let fresh_id = metered_stream(&service, per_token_rate(0.01)).await;

        // Backdate past the one-hour duration cap.
        let mut session = repository.find_by_id(&stream_id).await.unwrap().unwrap();
        session.start_time = Utc::now() - ChronoDuration::hours(2);
        repository.save(&session).await.unwrap();

        let swept = service.cleanup_expired_streams().await.unwrap();
        assert_eq!(swept, vec![stream_id.clone()]);

        let session = service.get_stream(&stream_id).await.unwrap();
        assert_eq!(session.status, StreamStatus::Completed);

        let session = service.get_stream(&fresh_id).await.unwrap();
        assert_eq!(session.status, StreamStatus::Initializing);

        let stats = service.get_streaming_stats().await.unwrap();
        assert!((stats.total_volume["USD"] - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_streams_by_channel_excludes_terminal() {
        let (service, _repository) = create_test_service();
        let channel_id = ChannelId::new();

        let kept = service
            .create_stream(
                channel_id.clone(),
                "did:ap2:agent-a",
                "did:ap2:provider-b",
                "inference",
                per_token_rate(0.01),
                test_policy(),
            )
            .await
            .unwrap();
        let cancelled = service
            .create_stream(
                channel_id.clone(),
                "did:ap2:agent-a",
                "did:ap2:provider-b",
                "embedding",
                per_token_rate(0.02),
                test_policy(),
            )
            .await
            .unwrap();
        metered_stream(&service, per_token_rate(0.01)).await; // other channel

        service.cancel_stream(&cancelled, "wrong service").await.unwrap();

        let streams = service.get_streams_by_channel(&channel_id).await.unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].stream_id, kept);
    }
}
