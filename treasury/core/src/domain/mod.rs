// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Mod
//!
//! Provides mod functionality for the system.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Entities, value objects, state machines and domain errors

pub mod money;
pub mod error;
pub mod attestation;
pub mod repository;
pub mod channel;
pub mod streaming;
pub mod circuit_breaker;
pub mod spending_rules;
pub mod session;
pub mod events;
