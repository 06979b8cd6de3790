//! Collateral ledger access
//!
//! The escrow never touches balances directly; it asks the host ledger to
//! take a payment into custody, and later to release that custody to a
//! recipient. `InMemoryLedger` is the in-process backend used when the
//! service runs standalone and in tests.

use crate::error::{EscrowError, EscrowResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

/// Quantity of a single denomination in base units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    #[serde(with = "u128_string")]
    pub value: u128,
    pub denom: String,
}

impl Amount {
    pub fn new(value: u128, denom: impl Into<String>) -> Self {
        Self {
            value,
            denom: denom.into(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.denom)
    }
}

/// Collateral offered by a depositor, not yet in custody
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub depositor: String,
    pub amount: Amount,
}

/// Handle to collateral held in custody by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeldAsset {
    pub deposit_id: Uuid,
    pub depositor: String,
    pub amount: Amount,
}

/// Proof that custody was handed to a recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseReceipt {
    pub deposit_id: Uuid,
    pub recipient: String,
    pub amount: Amount,
    pub released_at: DateTime<Utc>,
}

/// Host ledger operations needed by the escrow engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerAccessor: Send + Sync {
    /// Inspect a payment without taking it
    fn asset_amount(&self, payment: &Payment) -> EscrowResult<Amount>;

    /// Take a payment into custody. Fails without side effects on malformed input.
    async fn deposit_collateral(&self, payment: Payment) -> EscrowResult<HeldAsset>;

    /// Hand held collateral to `recipient`. A deposit can be released once.
    async fn release_collateral(
        &self,
        held: HeldAsset,
        recipient: &str,
    ) -> EscrowResult<ReleaseReceipt>;
}

/// In-process ledger keeping custody and balances in memory
pub struct InMemoryLedger {
    accepted_denoms: HashSet<String>,
    /// Deposits currently in custody
    deposits: DashMap<Uuid, HeldAsset>,
    /// Released balances: (account, denom) -> amount
    balances: DashMap<(String, String), u128>,
    releases: AtomicUsize,
}

impl InMemoryLedger {
    pub fn new<I, S>(accepted_denoms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            accepted_denoms: accepted_denoms.into_iter().map(Into::into).collect(),
            deposits: DashMap::new(),
            balances: DashMap::new(),
            releases: AtomicUsize::new(0),
        }
    }

    /// Balance credited to an account by releases
    pub fn balance_of(&self, account: &str, denom: &str) -> u128 {
        self.balances
            .get(&(account.to_string(), denom.to_string()))
            .map(|b| *b)
            .unwrap_or(0)
    }

    /// Number of deposits currently in custody
    pub fn held_count(&self) -> usize {
        self.deposits.len()
    }

    /// Number of successful releases so far
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    fn validate(&self, payment: &Payment) -> EscrowResult<()> {
        if payment.depositor.trim().is_empty() {
            return Err(EscrowError::InvalidRequest(
                "payment has no depositor".to_string(),
            ));
        }
        if payment.amount.is_zero() {
            return Err(EscrowError::InvalidRequest(
                "payment amount is zero".to_string(),
            ));
        }
        if !self.accepted_denoms.contains(&payment.amount.denom) {
            return Err(EscrowError::InvalidRequest(format!(
                "denomination {} is not held by this ledger",
                payment.amount.denom
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerAccessor for InMemoryLedger {
    fn asset_amount(&self, payment: &Payment) -> EscrowResult<Amount> {
        self.validate(payment)?;
        Ok(payment.amount.clone())
    }

    async fn deposit_collateral(&self, payment: Payment) -> EscrowResult<HeldAsset> {
        self.validate(&payment)?;

        let held = HeldAsset {
            deposit_id: Uuid::new_v4(),
            depositor: payment.depositor,
            amount: payment.amount,
        };
        self.deposits.insert(held.deposit_id, held.clone());

        debug!("Took {} into custody as {}", held.amount, held.deposit_id);
        Ok(held)
    }

    async fn release_collateral(
        &self,
        held: HeldAsset,
        recipient: &str,
    ) -> EscrowResult<ReleaseReceipt> {
        if recipient.trim().is_empty() {
            return Err(EscrowError::Ledger("release recipient is empty".to_string()));
        }

        // Removal is the single point where custody ends
        let (_, custody) = self
            .deposits
            .remove(&held.deposit_id)
            .ok_or_else(|| {
                EscrowError::Ledger(format!("deposit {} is not in custody", held.deposit_id))
            })?;

        if custody.amount != held.amount {
            let deposit_id = custody.deposit_id;
            self.deposits.insert(deposit_id, custody);
            return Err(EscrowError::Ledger(format!(
                "deposit {} does not match the presented handle",
                deposit_id
            )));
        }

        {
            let mut balance = self
                .balances
                .entry((recipient.to_string(), custody.amount.denom.clone()))
                .or_insert(0);
            *balance = balance.saturating_add(custody.amount.value);
        }
        self.releases.fetch_add(1, Ordering::SeqCst);

        info!(
            "Released {} from deposit {} to {}",
            custody.amount, custody.deposit_id, recipient
        );

        Ok(ReleaseReceipt {
            deposit_id: custody.deposit_id,
            recipient: recipient.to_string(),
            amount: custody.amount,
            released_at: Utc::now(),
        })
    }
}

/// Serialize u128 amounts as decimal strings; JSON numbers lose precision above 2^53
mod u128_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
