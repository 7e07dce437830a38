// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces (AGENTS.md §Repository Patterns)
//!
//! Persistence contracts for each aggregate root, following the DDD Repository
//! pattern: one repository per aggregate, interface defined in the domain layer,
//! implemented in `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `ChannelRepository` | `PaymentChannel` | `InMemoryChannelRepository` |
//! | `StreamRepository` | `StreamingPaymentSession` | `InMemoryStreamRepository` |
//! | `SessionRepository` | `SessionAuthorization` | `InMemorySessionRepository` |
//!
//! In-memory implementations back the runtime registry; channels and streams
//! are ephemeral off-chain state, so no durable backend is required for a
//! treasury node that settles before shutdown.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::channel::{ChannelId, PaymentChannel};
use crate::domain::session::{SessionAuthorization, SessionId};
use crate::domain::streaming::{StreamId, StreamingPaymentSession};

/// Repository interface for PaymentChannel aggregates
/// One repository per aggregate root (Treasury Context)
#[async_trait]
pub trait ChannelRepository: Send + Sync {
    /// Save channel (create or update)
    async fn save(&self, channel: &PaymentChannel) -> Result<(), RepositoryError>;

    /// Find channel by ID
    async fn find_by_id(&self, id: &ChannelId) -> Result<Option<PaymentChannel>, RepositoryError>;

    /// Find channels a participant belongs to
    async fn find_by_participant(
        &self,
        participant_id: &str,
    ) -> Result<Vec<PaymentChannel>, RepositoryError>;

    /// Find open channels past their expiry (for the sweeper)
    async fn find_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<PaymentChannel>, RepositoryError>;

    /// List all channels
    async fn list_all(&self) -> Result<Vec<PaymentChannel>, RepositoryError>;

    /// Delete channel by ID
    async fn delete(&self, id: &ChannelId) -> Result<(), RepositoryError>;
}

/// Repository interface for StreamingPaymentSession aggregates
#[async_trait]
pub trait StreamRepository: Send + Sync {
    /// Save stream (create or update)
    async fn save(&self, stream: &StreamingPaymentSession) -> Result<(), RepositoryError>;

    /// Find stream by ID
    async fn find_by_id(
        &self,
        id: &StreamId,
    ) -> Result<Option<StreamingPaymentSession>, RepositoryError>;

    /// Find streams billing against a channel
    async fn find_by_channel(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<StreamingPaymentSession>, RepositoryError>;

    /// Find streams not yet in a terminal status
    async fn find_active(&self) -> Result<Vec<StreamingPaymentSession>, RepositoryError>;

    /// Delete stream by ID
    async fn delete(&self, id: &StreamId) -> Result<(), RepositoryError>;
}

/// Repository interface for SessionAuthorization aggregates
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Save session (create or update)
    async fn save(&self, session: &SessionAuthorization) -> Result<(), RepositoryError>;

    /// Find session by ID
    async fn find_by_id(
        &self,
        id: &SessionId,
    ) -> Result<Option<SessionAuthorization>, RepositoryError>;

    /// Find sessions delegated to an agent
    async fn find_by_agent(
        &self,
        agent_did: &str,
    ) -> Result<Vec<SessionAuthorization>, RepositoryError>;

    /// Delete session by ID
    async fn delete(&self, id: &SessionId) -> Result<(), RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
