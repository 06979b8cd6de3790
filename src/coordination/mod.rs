//! Escrow coordination
//!
//! The coordination layer:
//! 1. Locks collateral and records loan requests
//! 2. Arbitrates solver claims, first claim wins
//! 3. Polls the foreign chain until each claim is verified or rejected
//! 4. Releases collateral exactly once on success

pub mod clock;
pub mod engine;
mod poller;
pub mod request;

pub use clock::{Clock, SystemClock};
pub use engine::EscrowEngine;
pub use request::{
    canonical_reference, ClaimStatus, EscrowEntry, EscrowRecord, FulfillmentClaim, LoanRequest, RequestId,
    RequestStatus,
};
