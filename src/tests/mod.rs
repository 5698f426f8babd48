//! Crate-level tests.
//!
//! - harness: deterministic validator keys, scripted peers and an engine cluster
//! - integration: engines over the local network, crash and restart, the double-sign guard
//! - fuzz: randomized schedules over state machines checking agreement and replay

pub mod integration;
pub mod fuzz;
