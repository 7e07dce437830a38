// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod attestation;
pub mod event_bus;
pub mod repositories;

pub use event_bus::{EventBus, EventBusError, TreasuryEvent};
