// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the repository abstractions defined in
//! the domain layer, following the Repository pattern from DDD.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve domain aggregates
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! All implementations are in-memory, backed by `DashMap` for lock-free
//! concurrent access from the manager services and the expiry sweeper.
//! Channels and streams are ephemeral off-chain state; a treasury node
//! settles open channels before shutdown rather than persisting them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::domain::channel::{ChannelId, ChannelState, PaymentChannel};
use crate::domain::repository::{
    ChannelRepository, RepositoryError, SessionRepository, StreamRepository,
};
use crate::domain::session::{SessionAuthorization, SessionId};
use crate::domain::streaming::{StreamId, StreamingPaymentSession};

#[derive(Default)]
pub struct InMemoryChannelRepository {
    channels: DashMap<ChannelId, PaymentChannel>,
}

impl InMemoryChannelRepository {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }
}

#[async_trait]
impl ChannelRepository for InMemoryChannelRepository {
    async fn save(&self, channel: &PaymentChannel) -> Result<(), RepositoryError> {
        self.channels
            .insert(channel.channel_id.clone(), channel.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &ChannelId) -> Result<Option<PaymentChannel>, RepositoryError> {
        Ok(self.channels.get(id).map(|entry| entry.clone()))
    }

    async fn find_by_participant(
        &self,
        participant_id: &str,
    ) -> Result<Vec<PaymentChannel>, RepositoryError> {
        Ok(self
            .channels
            .iter()
            .filter(|entry| {
                entry
                    .participants
                    .iter()
                    .any(|p| p.participant_id == participant_id)
            })
            .map(|entry| entry.clone())
            .collect())
    }

    async fn find_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<PaymentChannel>, RepositoryError> {
        Ok(self
            .channels
            .iter()
            .filter(|entry| {
                entry.is_expired(now)
                    && matches!(
                        entry.state,
                        ChannelState::Opening | ChannelState::Active | ChannelState::Closing
                    )
            })
            .map(|entry| entry.clone())
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<PaymentChannel>, RepositoryError> {
        Ok(self.channels.iter().map(|entry| entry.clone()).collect())
    }

    async fn delete(&self, id: &ChannelId) -> Result<(), RepositoryError> {
        self.channels.remove(id);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryStreamRepository {
    streams: DashMap<StreamId, StreamingPaymentSession>,
}

impl InMemoryStreamRepository {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
        }
    }
}

#[async_trait]
impl StreamRepository for InMemoryStreamRepository {
    async fn save(&self, stream: &StreamingPaymentSession) -> Result<(), RepositoryError> {
        self.streams.insert(stream.stream_id.clone(), stream.clone());
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &StreamId,
    ) -> Result<Option<StreamingPaymentSession>, RepositoryError> {
        Ok(self.streams.get(id).map(|entry| entry.clone()))
    }

    async fn find_by_channel(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<StreamingPaymentSession>, RepositoryError> {
        Ok(self
            .streams
            .iter()
            .filter(|entry| &entry.channel_id == channel_id)
            .map(|entry| entry.clone())
            .collect())
    }

    async fn find_active(&self) -> Result<Vec<StreamingPaymentSession>, RepositoryError> {
        Ok(self
            .streams
            .iter()
            .filter(|entry| !entry.status.is_terminal())
            .map(|entry| entry.clone())
            .collect())
    }

    async fn delete(&self, id: &StreamId) -> Result<(), RepositoryError> {
        self.streams.remove(id);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemorySessionRepository {
    sessions: DashMap<SessionId, SessionAuthorization>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn save(&self, session: &SessionAuthorization) -> Result<(), RepositoryError> {
        self.sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &SessionId,
    ) -> Result<Option<SessionAuthorization>, RepositoryError> {
        Ok(self.sessions.get(id).map(|entry| entry.clone()))
    }

    async fn find_by_agent(
        &self,
        agent_did: &str,
    ) -> Result<Vec<SessionAuthorization>, RepositoryError> {
        Ok(self
            .sessions
            .iter()
            .filter(|entry| entry.agent_did == agent_did)
            .map(|entry| entry.clone())
            .collect())
    }

    async fn delete(&self, id: &SessionId) -> Result<(), RepositoryError> {
        self.sessions.remove(id);
        Ok(())
    }
}
