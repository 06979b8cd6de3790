//! Foreign chain access
//!
//! This module provides:
//! - Multi-endpoint Cosmos LCD access with automatic failover
//! - The verifier contract the escrow engine polls
//! - Bank-transfer verification against transaction events

pub mod provider;
pub mod verifier;

pub use provider::LcdProvider;
pub use verifier::{ForeignChainVerifier, LcdTransferVerifier, TransferQuery, TransferStatus};

#[cfg(test)]
pub use verifier::MockForeignChainVerifier;
