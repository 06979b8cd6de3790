//! Loan request records and the request status graph

use crate::error::{EscrowError, EscrowResult};
use crate::ledger::{Amount, HeldAsset, ReleaseReceipt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque request identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RequestId {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| EscrowError::InvalidRequest(format!("malformed request id: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 4] = [
        RequestStatus::Pending,
        RequestStatus::Claimed,
        RequestStatus::Completed,
        RequestStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Claimed => "CLAIMED",
            RequestStatus::Completed => "COMPLETED",
            RequestStatus::Failed => "FAILED",
        }
    }

    /// Forward-only transition graph
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (RequestStatus::Pending, RequestStatus::Claimed)
                | (RequestStatus::Claimed, RequestStatus::Completed)
                | (RequestStatus::Claimed, RequestStatus::Failed)
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RequestStatus::Pending),
            "CLAIMED" => Ok(RequestStatus::Claimed),
            "COMPLETED" => Ok(RequestStatus::Completed),
            "FAILED" => Ok(RequestStatus::Failed),
            other => Err(EscrowError::Storage(format!("unknown request status {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimStatus {
    Pending,
    Confirmed,
    Failed,
}

/// A user's request: collateral locked here, payout wanted on the foreign chain.
///
/// Amounts and recipient are fixed at creation; only the status moves, and
/// only through [`EscrowEntry::transition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanRequest {
    request_id: RequestId,
    status: RequestStatus,
    collateral_amount: Amount,
    requested_amount: Amount,
    recipient_address: String,
    depositor: String,
    created_at: DateTime<Utc>,
}

impl LoanRequest {
    pub fn new(
        request_id: RequestId,
        collateral_amount: Amount,
        requested_amount: Amount,
        recipient_address: String,
        depositor: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id,
            status: RequestStatus::Pending,
            collateral_amount,
            requested_amount,
            recipient_address,
            depositor,
            created_at,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn collateral_amount(&self) -> &Amount {
        &self.collateral_amount
    }

    pub fn requested_amount(&self) -> &Amount {
        &self.requested_amount
    }

    pub fn recipient_address(&self) -> &str {
        &self.recipient_address
    }

    pub fn depositor(&self) -> &str {
        &self.depositor
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Collateral in custody on behalf of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowRecord {
    pub request_id: RequestId,
    pub held_asset: HeldAsset,
}

/// A solver's assertion that the foreign-chain payout happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FulfillmentClaim {
    pub request_id: RequestId,
    pub foreign_tx_reference: String,
    pub solver_identity: String,
    pub claim_status: ClaimStatus,
    pub claimed_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl FulfillmentClaim {
    pub fn new(
        request_id: RequestId,
        foreign_tx_reference: String,
        solver_identity: String,
        claimed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id,
            foreign_tx_reference,
            solver_identity,
            claim_status: ClaimStatus::Pending,
            claimed_at,
            resolved_at: None,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.claimed_at)
    }
}

/// Canonical form of a foreign tx reference.
///
/// Hex hashes compare without their `0x` prefix and case; anything else is
/// compared as written.
pub fn canonical_reference(reference: &str) -> String {
    let trimmed = reference.trim();
    let bare = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if !bare.is_empty() && bare.chars().all(|c| c.is_ascii_hexdigit()) {
        bare.to_ascii_uppercase()
    } else {
        trimmed.to_string()
    }
}

/// Everything persisted for one request, written as a single record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowEntry {
    pub request: LoanRequest,
    pub escrow: Option<EscrowRecord>,
    pub claim: Option<FulfillmentClaim>,
    /// Where the collateral went once custody ended
    #[serde(default)]
    pub settlement: Option<ReleaseReceipt>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl EscrowEntry {
    pub fn new(request: LoanRequest, held_asset: HeldAsset) -> Self {
        let request_id = request.request_id;
        Self {
            request,
            escrow: Some(EscrowRecord {
                request_id,
                held_asset,
            }),
            claim: None,
            settlement: None,
            failure_reason: None,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request.request_id
    }

    pub fn status(&self) -> RequestStatus {
        self.request.status
    }

    /// Move the request forward, rejecting anything off the graph
    pub fn transition(&mut self, next: RequestStatus) -> EscrowResult<()> {
        let current = self.request.status;
        if !current.can_transition_to(next) {
            return Err(EscrowError::InvalidState {
                request_id: self.request.request_id,
                status: current,
            });
        }
        self.request.status = next;
        Ok(())
    }

    /// Completed but the collateral release did not go through
    pub fn has_pending_release(&self) -> bool {
        self.status() == RequestStatus::Completed && self.escrow.is_some()
    }

    /// The foreign tx this request has reserved, if any.
    ///
    /// A failed claim gives its reference back; every other claim holds it.
    pub fn reserved_reference(&self) -> Option<String> {
        match (&self.claim, self.status()) {
            (_, RequestStatus::Failed) | (None, _) => None,
            (Some(claim), _) => Some(canonical_reference(&claim.foreign_tx_reference)),
        }
    }
}
