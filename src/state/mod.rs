//! Request persistence
//!
//! Handles:
//! - The request store contract used by the escrow engine
//! - An in-memory backend for standalone runs and tests
//! - PostgreSQL persistence with per-request compare-and-swap

mod postgres;
mod store;

pub use postgres::PgRequestStore;
pub use store::{MemoryRequestStore, RequestStats, RequestStore};

#[cfg(test)]
pub use store::MockRequestStore;
