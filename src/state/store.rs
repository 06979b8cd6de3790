//! Request store interface and the in-memory backend

use crate::coordination::{EscrowEntry, RequestId, RequestStatus};
use crate::error::{EscrowError, EscrowResult};

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Request counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestStats {
    pub pending: u64,
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Durable record of loan requests keyed by request id.
///
/// Reads of a single request observe every write that returned before them.
/// A foreign tx reference is reserved by at most one request at a time: writes
/// that would give a second request the same live reference fail with
/// `InvalidRequest`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert or replace a record
    async fn put(&self, entry: &EscrowEntry) -> EscrowResult<()>;

    /// Replace a record only if its stored status is still `expected`.
    /// Returns false when another writer got there first.
    async fn compare_and_put(
        &self,
        entry: &EscrowEntry,
        expected: RequestStatus,
    ) -> EscrowResult<bool>;

    async fn get(&self, request_id: &RequestId) -> EscrowResult<Option<EscrowEntry>>;

    async fn scan_by_status(&self, status: RequestStatus) -> EscrowResult<Vec<EscrowEntry>>;

    /// The request whose live claim holds `reference` (canonical form)
    async fn find_by_reference(&self, reference: &str) -> EscrowResult<Option<RequestId>>;

    /// COMPLETED requests whose collateral is still in custody
    async fn scan_pending_releases(&self) -> EscrowResult<Vec<EscrowEntry>>;

    async fn stats(&self) -> EscrowResult<RequestStats> {
        Ok(RequestStats {
            pending: self.scan_by_status(RequestStatus::Pending).await?.len() as u64,
            claimed: self.scan_by_status(RequestStatus::Claimed).await?.len() as u64,
            completed: self.scan_by_status(RequestStatus::Completed).await?.len() as u64,
            failed: self.scan_by_status(RequestStatus::Failed).await?.len() as u64,
        })
    }

    async fn health_check(&self) -> EscrowResult<()>;
}

/// Request store kept in process memory
#[derive(Default)]
pub struct MemoryRequestStore {
    entries: RwLock<HashMap<RequestId, EscrowEntry>>,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_reference(
        entries: &HashMap<RequestId, EscrowEntry>,
        entry: &EscrowEntry,
    ) -> EscrowResult<()> {
        let Some(reference) = entry.reserved_reference() else {
            return Ok(());
        };
        let taken = entries.values().any(|other| {
            other.request_id() != entry.request_id()
                && other.reserved_reference().as_deref() == Some(reference.as_str())
        });
        if taken {
            return Err(reference_in_use(&reference));
        }
        Ok(())
    }
}

pub(crate) fn reference_in_use(reference: &str) -> EscrowError {
    EscrowError::InvalidRequest(format!(
        "foreign tx {} is already claimed by another request",
        reference
    ))
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn put(&self, entry: &EscrowEntry) -> EscrowResult<()> {
        let mut entries = self.entries.write().await;
        Self::check_reference(&entries, entry)?;
        entries.insert(entry.request_id(), entry.clone());
        Ok(())
    }

    async fn compare_and_put(
        &self,
        entry: &EscrowEntry,
        expected: RequestStatus,
    ) -> EscrowResult<bool> {
        let mut entries = self.entries.write().await;
        match entries.get(&entry.request_id()) {
            Some(stored) if stored.status() == expected => {}
            _ => return Ok(false),
        }
        Self::check_reference(&entries, entry)?;
        entries.insert(entry.request_id(), entry.clone());
        Ok(true)
    }

    async fn get(&self, request_id: &RequestId) -> EscrowResult<Option<EscrowEntry>> {
        Ok(self.entries.read().await.get(request_id).cloned())
    }

    async fn scan_by_status(&self, status: RequestStatus) -> EscrowResult<Vec<EscrowEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .values()
            .filter(|entry| entry.status() == status)
            .cloned()
            .collect())
    }

    async fn find_by_reference(&self, reference: &str) -> EscrowResult<Option<RequestId>> {
        Ok(self
            .entries
            .read()
            .await
            .values()
            .find(|entry| entry.reserved_reference().as_deref() == Some(reference))
            .map(EscrowEntry::request_id))
    }

    async fn scan_pending_releases(&self) -> EscrowResult<Vec<EscrowEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .values()
            .filter(|entry| entry.has_pending_release())
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> EscrowResult<()> {
        Ok(())
    }
}
