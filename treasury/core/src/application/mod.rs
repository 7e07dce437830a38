// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod channel_manager;
pub mod governor;
pub mod streaming_manager;
pub mod sweeper;

// Re-export services for convenience
pub use channel_manager::{ChannelService, ClosePolicy, StandardChannelService, TreasuryStats};
pub use governor::FiduciaryGovernor;
pub use streaming_manager::{StandardStreamingService, StreamingService, StreamingStats};
pub use sweeper::ExpirySweeper;
