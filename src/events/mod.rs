//! Escrow lifecycle events
//!
//! Every committed transition is broadcast so that in-process subscribers
//! (metrics, notifiers, tests) can observe settlement without polling the
//! request store.

use crate::coordination::RequestId;
use crate::ledger::Amount;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EscrowEvent {
    /// Collateral taken into custody for a new request
    RequestLocked {
        request_id: RequestId,
        collateral: Amount,
        requested: Amount,
    },

    /// A solver's claim won the race and verification started
    ClaimAccepted {
        request_id: RequestId,
        solver: String,
        foreign_tx_reference: String,
    },

    /// Payout confirmed and collateral released to the solver
    RequestCompleted {
        request_id: RequestId,
        solver: String,
        released: Amount,
    },

    /// Claim rejected by verification; collateral still held
    RequestFailed { request_id: RequestId, reason: String },

    /// Collateral of a failed request returned to its depositor
    CollateralRefunded {
        request_id: RequestId,
        depositor: String,
        amount: Amount,
    },

    /// Claim has waited on verification longer than the staleness threshold
    ClaimStale {
        request_id: RequestId,
        age_secs: i64,
    },
}

impl EscrowEvent {
    pub fn request_id(&self) -> RequestId {
        match self {
            EscrowEvent::RequestLocked { request_id, .. } => *request_id,
            EscrowEvent::ClaimAccepted { request_id, .. } => *request_id,
            EscrowEvent::RequestCompleted { request_id, .. } => *request_id,
            EscrowEvent::RequestFailed { request_id, .. } => *request_id,
            EscrowEvent::CollateralRefunded { request_id, .. } => *request_id,
            EscrowEvent::ClaimStale { request_id, .. } => *request_id,
        }
    }

    /// Get event name for metrics
    pub fn name(&self) -> &'static str {
        match self {
            EscrowEvent::RequestLocked { .. } => "request_locked",
            EscrowEvent::ClaimAccepted { .. } => "claim_accepted",
            EscrowEvent::RequestCompleted { .. } => "request_completed",
            EscrowEvent::RequestFailed { .. } => "request_failed",
            EscrowEvent::CollateralRefunded { .. } => "collateral_refunded",
            EscrowEvent::ClaimStale { .. } => "claim_stale",
        }
    }

    /// Whether the event ends the request's settlement
    pub fn is_settlement(&self) -> bool {
        matches!(
            self,
            EscrowEvent::RequestCompleted { .. } | EscrowEvent::RequestFailed { .. }
        )
    }
}
