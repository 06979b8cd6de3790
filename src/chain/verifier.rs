//! Foreign-chain payout verification
//!
//! A solver's claim is only a transaction reference. Ground truth comes from
//! the foreign chain itself: the transaction must exist, must have succeeded,
//! must be deep enough, and must credit the expected amount of the expected
//! denomination to the request's recipient.

use super::provider::{LcdProvider, TxEvent};
use crate::coordination::canonical_reference;
use crate::error::EscrowResult;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// What the foreign chain must show for a claim to hold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferQuery {
    pub tx_reference: String,
    pub expected_amount: u128,
    pub recipient_address: String,
    pub token_denom: String,
    /// Transfers included before this instant predate the request
    pub not_before: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Success,
    Failed,
    Pending,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Success => "success",
            TransferStatus::Failed => "failed",
            TransferStatus::Pending => "pending",
        }
    }
}

/// Queries a foreign chain for the status of a claimed payout.
///
/// Errors are transient by contract: the caller retries them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ForeignChainVerifier: Send + Sync {
    async fn check_transfer(&self, query: &TransferQuery) -> EscrowResult<TransferStatus>;

    async fn health_check(&self) -> bool;
}

/// Verifies bank transfers through a Cosmos LCD endpoint
pub struct LcdTransferVerifier {
    provider: Arc<LcdProvider>,
}

impl LcdTransferVerifier {
    pub fn new(provider: Arc<LcdProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ForeignChainVerifier for LcdTransferVerifier {
    async fn check_transfer(&self, query: &TransferQuery) -> EscrowResult<TransferStatus> {
        let Some(tx_hash) = normalize_tx_hash(&query.tx_reference) else {
            // Not a hash the chain could ever return
            warn!(
                "Claim reference {} is not a {} tx hash",
                query.tx_reference,
                self.provider.chain_id()
            );
            return Ok(TransferStatus::Failed);
        };

        let Some(tx) = self.provider.get_tx(&tx_hash).await? else {
            return Ok(TransferStatus::Pending);
        };

        if tx.code != 0 {
            debug!("Tx {} failed on chain with code {}: {}", tx_hash, tx.code, tx.raw_log);
            return Ok(TransferStatus::Failed);
        }

        let included_at = tx.timestamp()?;
        if included_at < query.not_before {
            warn!(
                "Tx {} was included at {}, before the request was opened at {}",
                tx_hash, included_at, query.not_before
            );
            return Ok(TransferStatus::Failed);
        }

        let required = self.provider.confirmation_blocks();
        if required > 1 {
            let latest = self.provider.latest_height().await?;
            let confirmations = latest.saturating_sub(tx.height()?) + 1;
            if confirmations < required {
                debug!(
                    "Tx {} has {} / {} confirmations",
                    tx_hash, confirmations, required
                );
                return Ok(TransferStatus::Pending);
            }
        }

        let credited = credited_amount(&tx.events, &query.recipient_address, &query.token_denom);
        if credited >= query.expected_amount {
            Ok(TransferStatus::Success)
        } else {
            warn!(
                "Tx {} credits {}{} to {}, expected {}{}",
                tx_hash,
                credited,
                query.token_denom,
                query.recipient_address,
                query.expected_amount,
                query.token_denom
            );
            Ok(TransferStatus::Failed)
        }
    }

    async fn health_check(&self) -> bool {
        self.provider.health_check().await
    }
}

/// Accept `0x`-prefixed or bare 32-byte hex hashes; LCD wants upper-case bare hex
fn normalize_tx_hash(reference: &str) -> Option<String> {
    let canonical = canonical_reference(reference);
    match hex::decode(&canonical) {
        Ok(bytes) if bytes.len() == 32 => Some(canonical),
        _ => None,
    }
}

/// Total of `denom` credited to `recipient` by `transfer` events
fn credited_amount(events: &[TxEvent], recipient: &str, denom: &str) -> u128 {
    events
        .iter()
        .filter(|event| event.kind == "transfer")
        .filter(|event| {
            event
                .attributes
                .iter()
                .any(|attr| attr.key == "recipient" && attr.value == recipient)
        })
        .flat_map(|event| {
            event
                .attributes
                .iter()
                .filter(|attr| attr.key == "amount")
                .flat_map(|attr| attr.value.split(','))
        })
        .filter_map(parse_coin)
        .filter(|(_, coin_denom)| *coin_denom == denom)
        .fold(0u128, |total, (amount, _)| total.saturating_add(amount))
}

/// Parse a Cosmos coin string such as `1000000ibc/498A...`
fn parse_coin(coin: &str) -> Option<(u128, &str)> {
    let coin = coin.trim();
    let split = coin.find(|c: char| !c.is_ascii_digit())?;
    let (amount, denom) = coin.split_at(split);
    if amount.is_empty() || denom.is_empty() {
        return None;
    }
    amount.parse().ok().map(|amount| (amount, denom))
}
