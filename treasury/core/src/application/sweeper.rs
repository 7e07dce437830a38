// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Expiry Sweeper Application Service
//!
//! Periodically applies the treasury's time-based defaults:
//! - Channels past their expiry settle at their last balances
//! - Streams past their duration cap complete
//! - Undecided escalations past their deadline take the timeout default
//!
//! Runs as a background task on a fixed interval. Never crashes the host
//! process; sweep failures are logged and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::application::channel_manager::ChannelService;
use crate::application::governor::FiduciaryGovernor;
use crate::application::streaming_manager::StreamingService;

// ============================================================================
// Service
// ============================================================================

pub struct ExpirySweeper {
    channels: Arc<dyn ChannelService>,
    streams: Arc<dyn StreamingService>,
    governor: Arc<FiduciaryGovernor>,
    sweep_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    pub fn new(
        channels: Arc<dyn ChannelService>,
        streams: Arc<dyn StreamingService>,
        governor: Arc<FiduciaryGovernor>,
        sweep_interval: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            channels,
            streams,
            governor,
            sweep_interval,
            shutdown_tx,
        }
    }

    /// Start the background sweep task.
    ///
    /// Spawns a tokio task that sweeps on every interval tick until
    /// `shutdown()` is called. Returns a handle that can be awaited for
    /// graceful shutdown.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        info!(
            "Starting expiry sweeper background task (interval {:?})",
            self.sweep_interval
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.sweep_interval);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let mut sweeps_completed = 0u64;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                        sweeps_completed += 1;
                    }
                    _ = shutdown_rx.changed() => {
                        break;
                    }
                }
            }

            info!(
                "Expiry sweeper shut down gracefully (completed {} sweeps)",
                sweeps_completed
            );
        })
    }

    /// Signal the background task to stop after its current sweep.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn sweep_once(&self) {
        match self.channels.cleanup_expired_channels().await {
            Ok(swept) if !swept.is_empty() => {
                info!("Expiry sweep settled {} channels", swept.len());
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = ?e, "Channel expiry sweep failed");
            }
        }

        match self.streams.cleanup_expired_streams().await {
            Ok(swept) if !swept.is_empty() => {
                info!("Expiry sweep completed {} overrunning streams", swept.len());
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = ?e, "Stream expiry sweep failed");
            }
        }

        let timed_out = self.governor.apply_timeout_defaults(Utc::now());
        if !timed_out.is_empty() {
            info!(
                "Applied escalation timeout defaults for {} agents",
                timed_out.len()
            );
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::channel_manager::{ClosePolicy, StandardChannelService};
    use crate::application::streaming_manager::StandardStreamingService;
    use crate::domain::channel::{
        ChannelOpenRequest, ChannelParticipant, ChannelPolicy, ChannelRole, ChannelState,
    };
    use crate::domain::money::Money;
    use crate::domain::repository::StreamRepository;
    use crate::domain::streaming::{
        PaymentRate, PaymentRateType, StreamStatus, StreamingPaymentPolicy,
    };
    use crate::infrastructure::attestation::DigestAttestation;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::repositories::{
        InMemoryChannelRepository, InMemoryStreamRepository,
    };
    use chrono::Duration as ChronoDuration;
    use std::collections::HashMap;

    struct SweeperStack {
        sweeper: Arc<ExpirySweeper>,
        channels: Arc<StandardChannelService>,
        streams: Arc<StandardStreamingService>,
        stream_repository: Arc<InMemoryStreamRepository>,
    }

    fn sweeper_stack() -> SweeperStack {
        let event_bus = Arc::new(EventBus::with_default_capacity());
        let channel_repository = Arc::new(InMemoryChannelRepository::new());
        let stream_repository = Arc::new(InMemoryStreamRepository::new());

        let channels = Arc::new(StandardChannelService::new(
            channel_repository,
            Arc::new(DigestAttestation::new()),
            event_bus.clone(),
            ClosePolicy::SingleSigner,
        ));
        let streams = Arc::new(StandardStreamingService::new(
            stream_repository.clone(),
            Arc::new(DigestAttestation::new()),
            event_bus.clone(),
            "did:ap2:agent-a",
        ));
        let governor = Arc::new(FiduciaryGovernor::new(event_bus));

        let sweeper = Arc::new(ExpirySweeper::new(
            channels.clone(),
            streams.clone(),
            governor,
            Duration::from_millis(10),
        ));

        SweeperStack {
            sweeper,
            channels,
            streams,
            stream_repository,
        }
    }

    fn short_lived_request() -> ChannelOpenRequest {
        ChannelOpenRequest {
            requesting_participant: ChannelParticipant::new(
                "agent-a",
                "0xaaa",
                ChannelRole::Payer,
                "pk-a",
                Money::usd(50.0),
            ),
            target_participant: ChannelParticipant::new(
                "agent-b",
                "0xbbb",
                ChannelRole::Payee,
                "pk-b",
                Money::usd(0.0),
            ),
            proposed_policy: ChannelPolicy {
                max_transaction_amount: Money::usd(25.0),
                min_transaction_amount: Money::usd(0.01),
                dispute_timeout_seconds: 86_400,
                max_pending_updates: 1_000,
                settlement_threshold: Money::usd(100.0),
                fee_rate: 0.001,
                auto_close_timeout: 604_800,
            },
            duration_hours: 0, // expires immediately
            initial_deposit: Money::usd(50.0),
            purpose: "api metering".to_string(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_sweeper_settles_expired_channels_and_streams() {
        let stack = sweeper_stack();

        let channel_id = stack
            .channels
            .open_channel(short_lived_request())
            .await
            .expect("Failed to open channel");

        let stream_id = stack
            .streams
            .create_stream(
                channel_id.clone(),
                "did:ap2:agent-a",
                "did:ap2:provider-b",
                "inference",
                PaymentRate {
                    rate_type: PaymentRateType::PerToken,
                    rate_amount: Money::usd(0.01),
                    minimum_charge: None,
                    maximum_charge: None,
                    billing_frequency_seconds: 1,
                    unit_description: "tokens".to_string(),
                    tier_thresholds: None,
                },
                StreamingPaymentPolicy {
                    max_stream_duration_seconds: 3_600,
                    checkpoint_frequency_seconds: 60,
                    auto_pause_threshold: Money::usd(50.0),
                    max_cumulative_amount: Money::usd(100.0),
                    rate_adjustment_allowed: false,
                    dispute_resolution_timeout: 300,
                    quality_requirements: None,
                },
            )
            .await
            .expect("Failed to create stream");

        // Backdate the stream past its duration cap.
        let mut session = stack
            .stream_repository
            .find_by_id(&stream_id)
            .await
            .unwrap()
            .unwrap();
        session.start_time = Utc::now() - ChronoDuration::hours(2);
        stack.stream_repository.save(&session).await.unwrap();

        let handle = stack.sweeper.clone().start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = stack.channels.get_channel_status(&channel_id).await.unwrap();
        assert_eq!(status.state, ChannelState::Expired);

        let session = stack.streams.get_stream(&stream_id).await.unwrap();
        assert_eq!(session.status, StreamStatus::Completed);

        stack.sweeper.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not shut down")
            .expect("sweeper task panicked");
    }

    #[tokio::test]
    async fn test_sweeper_shuts_down_gracefully() {
        let stack = sweeper_stack();
        let handle = stack.sweeper.clone().start();
        tokio::time::sleep(Duration::from_millis(30)).await;

        stack.sweeper.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not shut down")
            .expect("sweeper task panicked");
    }
}
