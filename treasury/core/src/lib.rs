// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Agent Treasury Core
//!
//! Runtime governance for autonomous agent payments: micropayment channels,
//! streaming payment sessions, programmable spending rules, session-scoped
//! delegation and the fiduciary circuit breaker.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Off-chain bookkeeping and policy enforcement. Transport,
//!   mandate negotiation and key custody live outside this crate; callers
//!   inject an [`domain::attestation::Attestation`] implementation and a
//!   scheduler for the expiry sweeps.

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
