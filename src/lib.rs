//! Stratum BFT: a round-based Byzantine-fault-tolerant block consensus engine.
//!
//! Validators agree on one block per height through propose, prevote and precommit steps,
//! with locking across rounds, linearly growing timeouts, a write-ahead log for crash
//! recovery and a last-sign-state that keeps a validator from ever signing two conflicting
//! messages.

pub mod consensus;
pub mod crypto;
pub mod ledger;
pub mod network;
pub mod node;
pub mod storage;
pub mod txpool;
pub mod utils;

#[cfg(test)]
mod tests;
