//! Escrow lifecycle engine
//!
//! Owns every loan request from lock to settlement:
//! - `lock` takes collateral into custody and records a PENDING request
//! - `claim` lets the first solver move the request to CLAIMED
//! - verification verdicts move CLAIMED to COMPLETED (collateral to the
//!   solver) or FAILED (collateral stays held)
//!
//! All mutations of one request are serialized behind a per-request mutex and
//! committed with a compare-and-swap on the stored status, so a request makes
//! at most one transition at a time and collateral is released at most once.

use super::clock::Clock;
use super::request::{
    canonical_reference, ClaimStatus, EscrowEntry, FulfillmentClaim, LoanRequest, RequestId,
    RequestStatus,
};
use crate::chain::{ForeignChainVerifier, TransferStatus};
use crate::config::EscrowConfig;
use crate::error::{EscrowError, EscrowResult};
use crate::events::EscrowEvent;
use crate::ledger::{Amount, HeldAsset, LedgerAccessor, Payment, ReleaseReceipt};
use crate::metrics;
use crate::state::RequestStore;

use dashmap::DashMap;
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

/// Cross-chain escrow lifecycle engine
#[derive(Clone)]
pub struct EscrowEngine {
    /// Request persistence
    pub(super) store: Arc<dyn RequestStore>,
    /// Custody of collateral
    ledger: Arc<dyn LedgerAccessor>,
    /// Ground truth on the foreign chain
    pub(super) verifier: Arc<dyn ForeignChainVerifier>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) config: Arc<EscrowConfig>,
    recipient_format: Arc<Regex>,
    /// Per-request serialization of mutations
    locks: Arc<DashMap<RequestId, Arc<Mutex<()>>>>,
    /// Live verification pollers, one per CLAIMED request
    pub(super) pollers: Arc<DashMap<RequestId, JoinHandle<()>>>,
    event_tx: broadcast::Sender<EscrowEvent>,
    shutdown: Arc<AtomicBool>,
}

impl EscrowEngine {
    /// Create a new escrow engine
    pub fn new(
        store: Arc<dyn RequestStore>,
        ledger: Arc<dyn LedgerAccessor>,
        verifier: Arc<dyn ForeignChainVerifier>,
        clock: Arc<dyn Clock>,
        config: EscrowConfig,
    ) -> EscrowResult<Self> {
        // Bech32: prefix, separator, 38+ data characters from the bech32 alphabet
        let pattern = format!(
            r"^{}1[qpzry9x8gf2tvdw0s3jn54khce6mua7l]{{38,58}}$",
            regex::escape(&config.recipient_prefix)
        );
        let recipient_format = Regex::new(&pattern)
            .map_err(|e| EscrowError::Config(format!("Invalid recipient prefix: {}", e)))?;

        let (event_tx, _) = broadcast::channel(1024);

        Ok(Self {
            store,
            ledger,
            verifier,
            clock,
            config: Arc::new(config),
            recipient_format: Arc::new(recipient_format),
            locks: Arc::new(DashMap::new()),
            pollers: Arc::new(DashMap::new()),
            event_tx,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Lock collateral and open a loan request.
    ///
    /// Nothing is taken from the depositor if validation fails, and the
    /// deposit is handed back if the request cannot be recorded.
    pub async fn lock(
        &self,
        payment: Payment,
        requested_amount: Amount,
        recipient_address: &str,
    ) -> EscrowResult<RequestId> {
        let collateral = self.validate_lock(&payment, &requested_amount, recipient_address)?;

        let request_id = RequestId::new();
        let _guard = self.acquire(request_id).await;

        let depositor = payment.depositor.clone();
        let held = self.ledger.deposit_collateral(payment).await?;

        let request = LoanRequest::new(
            request_id,
            collateral.clone(),
            requested_amount.clone(),
            recipient_address.to_string(),
            depositor.clone(),
            self.clock.now(),
        );
        let entry = EscrowEntry::new(request, held.clone());

        if let Err(e) = self.store.put(&entry).await {
            error!(
                "Failed to record request {}: {}; returning collateral to {}",
                request_id, e, depositor
            );
            self.roll_back_deposit(request_id, held, &depositor).await;
            return Err(e);
        }

        metrics::record_request_locked(&collateral.denom);
        info!(
            "Request {} locked {} for {} to {}",
            request_id, collateral, requested_amount, recipient_address
        );
        self.emit(EscrowEvent::RequestLocked {
            request_id,
            collateral,
            requested: requested_amount,
        });

        Ok(request_id)
    }

    /// Record a solver's fulfillment claim and start verifying it.
    ///
    /// Returns as soon as the claim is recorded; settlement is observed later.
    pub async fn claim(
        &self,
        request_id: RequestId,
        foreign_tx_reference: &str,
        solver_identity: &str,
    ) -> EscrowResult<()> {
        let foreign_tx_reference = foreign_tx_reference.trim();
        let solver_identity = solver_identity.trim();
        if foreign_tx_reference.is_empty() {
            return Err(rejected(
                "invalid_request",
                EscrowError::InvalidRequest("foreign transaction reference is empty".to_string()),
            ));
        }
        if solver_identity.is_empty() {
            return Err(rejected(
                "invalid_request",
                EscrowError::InvalidRequest("solver identity is empty".to_string()),
            ));
        }

        let _guard = self.acquire(request_id).await;

        let Some(mut entry) = self.store.get(&request_id).await? else {
            return Err(rejected("not_found", EscrowError::NotFound { request_id }));
        };

        match entry.status() {
            RequestStatus::Pending => {}
            RequestStatus::Claimed => {
                return Err(rejected(
                    "already_claimed",
                    EscrowError::AlreadyClaimed { request_id },
                ));
            }
            status => {
                return Err(rejected(
                    "invalid_state",
                    EscrowError::InvalidState { request_id, status },
                ));
            }
        }

        // One foreign payout settles one request
        let reference = canonical_reference(foreign_tx_reference);
        if let Some(holder) = self.store.find_by_reference(&reference).await? {
            return Err(rejected(
                "reference_in_use",
                EscrowError::InvalidRequest(format!(
                    "foreign tx {} already backs request {}",
                    foreign_tx_reference, holder
                )),
            ));
        }

        entry.claim = Some(FulfillmentClaim::new(
            request_id,
            foreign_tx_reference.to_string(),
            solver_identity.to_string(),
            self.clock.now(),
        ));
        entry.transition(RequestStatus::Claimed)?;

        let won = match self.store.compare_and_put(&entry, RequestStatus::Pending).await {
            Ok(won) => won,
            // Another request reserved the same tx since the lookup
            Err(e @ EscrowError::InvalidRequest(_)) => {
                return Err(rejected("reference_in_use", e))
            }
            Err(e) => return Err(e),
        };
        if !won {
            // Another engine sharing the store claimed it first
            return Err(rejected(
                "already_claimed",
                EscrowError::AlreadyClaimed { request_id },
            ));
        }

        metrics::record_claim_accepted();
        info!(
            "Request {} claimed by {} with foreign tx {}",
            request_id, solver_identity, foreign_tx_reference
        );
        self.emit(EscrowEvent::ClaimAccepted {
            request_id,
            solver: solver_identity.to_string(),
            foreign_tx_reference: foreign_tx_reference.to_string(),
        });

        self.spawn_poller(request_id);
        Ok(())
    }

    /// Apply a verifier verdict to a request.
    ///
    /// Returns true when this call settled the request. Verdicts for requests
    /// that are no longer CLAIMED are ignored, so redelivery is harmless.
    pub async fn apply_verification(
        &self,
        request_id: RequestId,
        verdict: TransferStatus,
    ) -> EscrowResult<bool> {
        if verdict == TransferStatus::Pending {
            return Ok(false);
        }

        let _guard = self.acquire(request_id).await;

        let entry = self.load(request_id).await?;
        if entry.status() != RequestStatus::Claimed {
            debug!(
                "Ignoring {} verdict for request {}: already {}",
                verdict.as_str(),
                request_id,
                entry.status()
            );
            return Ok(false);
        }

        match verdict {
            TransferStatus::Success => self.complete(entry).await,
            _ => {
                self.fail(
                    entry,
                    "verification_failed",
                    "foreign transfer did not match the request".to_string(),
                )
                .await
            }
        }
    }

    /// Fail a claim whose verification budget ran out
    pub(super) async fn expire_claim(&self, request_id: RequestId, attempts: u32) -> EscrowResult<bool> {
        let _guard = self.acquire(request_id).await;

        let entry = self.load(request_id).await?;
        if entry.status() != RequestStatus::Claimed {
            return Ok(false);
        }

        self.fail(
            entry,
            "retry_budget_exhausted",
            format!("no verification verdict after {} attempts", attempts),
        )
        .await
    }

    /// Return the collateral of a failed request to its depositor
    pub async fn refund(&self, request_id: RequestId) -> EscrowResult<ReleaseReceipt> {
        let _guard = self.acquire(request_id).await;

        let mut entry = self.load(request_id).await?;
        let status = entry.status();
        let escrow = match (&entry.escrow, status) {
            (Some(escrow), RequestStatus::Failed) => escrow.clone(),
            _ => return Err(EscrowError::InvalidState { request_id, status }),
        };

        let depositor = escrow.held_asset.depositor.clone();
        let receipt = self
            .ledger
            .release_collateral(escrow.held_asset, &depositor)
            .await
            .map_err(|e| {
                metrics::record_release_failure();
                e
            })?;

        entry.escrow = None;
        entry.settlement = Some(receipt.clone());
        self.record_settlement(&entry, RequestStatus::Failed).await;

        metrics::record_collateral_released("depositor");
        info!(
            "Request {} refunded {} to depositor {}",
            request_id, receipt.amount, depositor
        );
        self.emit(EscrowEvent::CollateralRefunded {
            request_id,
            depositor,
            amount: receipt.amount.clone(),
        });

        Ok(receipt)
    }

    /// Resume polling for every CLAIMED request and retry interrupted releases.
    ///
    /// Returns how many pollers were started.
    pub async fn recover(&self) -> EscrowResult<usize> {
        let mut resumed = 0;
        for entry in self.store.scan_by_status(RequestStatus::Claimed).await? {
            if self.spawn_poller(entry.request_id()) {
                resumed += 1;
            }
        }

        for entry in self.store.scan_pending_releases().await? {
            let request_id = entry.request_id();
            let _guard = self.acquire(request_id).await;

            let entry = self.load(request_id).await?;
            if !entry.has_pending_release() {
                continue;
            }
            info!("Retrying collateral release for request {}", request_id);
            if let Err(e) = self.release_to_solver(entry).await {
                warn!("Release for request {} still failing: {}", request_id, e);
            }
        }

        if resumed > 0 {
            info!("Resumed verification for {} claimed requests", resumed);
        }
        Ok(resumed)
    }

    /// Main engine loop: recover on start, then sweep periodically
    pub async fn run(&self) -> EscrowResult<()> {
        self.recover().await?;

        let mut sweep = interval(Duration::from_secs(self.config.sweep_interval_secs));
        // First tick completes immediately
        sweep.tick().await;

        info!("Escrow engine started");

        while !self.is_stopping() {
            sweep.tick().await;
            if let Err(e) = self.recover().await {
                error!("Escrow sweep failed: {}", e);
            }
        }

        info!("Escrow engine stopped");
        Ok(())
    }

    /// Stop the engine and abort pollers; CLAIMED requests resume on next start
    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for poller in self.pollers.iter() {
            poller.value().abort();
        }
        self.pollers.clear();
        metrics::set_active_pollers(0);
        info!("Escrow engine shutdown initiated");
    }

    /// Subscribe to lifecycle events
    pub fn subscribe_events(&self) -> broadcast::Receiver<EscrowEvent> {
        self.event_tx.subscribe()
    }

    /// Number of pollers still running
    pub fn active_pollers(&self) -> usize {
        self.pollers
            .iter()
            .filter(|poller| !poller.value().is_finished())
            .count()
    }

    pub(super) fn is_stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(super) fn emit(&self, event: EscrowEvent) {
        metrics::record_event(&event);
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Serialize mutations of one request until the guard is dropped
    async fn acquire(&self, request_id: RequestId) -> RequestGuard {
        let lock = self
            .locks
            .entry(request_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        RequestGuard {
            locks: self.locks.clone(),
            request_id,
            held: Some(lock.lock_owned().await),
        }
    }

    async fn load(&self, request_id: RequestId) -> EscrowResult<EscrowEntry> {
        self.store
            .get(&request_id)
            .await?
            .ok_or(EscrowError::NotFound { request_id })
    }

    fn validate_lock(
        &self,
        payment: &Payment,
        requested_amount: &Amount,
        recipient_address: &str,
    ) -> EscrowResult<Amount> {
        let collateral = self.ledger.asset_amount(payment)?;
        if collateral.denom != self.config.collateral_denom {
            return Err(EscrowError::InvalidRequest(format!(
                "collateral must be {}, got {}",
                self.config.collateral_denom, collateral.denom
            )));
        }
        if collateral.is_zero() {
            return Err(EscrowError::InvalidRequest("collateral amount is zero".to_string()));
        }
        if requested_amount.denom != self.config.requested_denom {
            return Err(EscrowError::InvalidRequest(format!(
                "requested asset must be {}, got {}",
                self.config.requested_denom, requested_amount.denom
            )));
        }
        if requested_amount.is_zero() {
            return Err(EscrowError::InvalidRequest("requested amount is zero".to_string()));
        }
        if !self.recipient_format.is_match(recipient_address) {
            return Err(EscrowError::InvalidRequest(format!(
                "{} is not a valid {} address",
                recipient_address, self.config.recipient_prefix
            )));
        }
        Ok(collateral)
    }

    async fn roll_back_deposit(&self, request_id: RequestId, held: HeldAsset, depositor: &str) {
        match self.ledger.release_collateral(held, depositor).await {
            Ok(receipt) => {
                metrics::record_collateral_released("depositor");
                warn!(
                    "Returned {} to {} after failing to record request {}",
                    receipt.amount, depositor, request_id
                );
            }
            Err(e) => {
                metrics::record_release_failure();
                error!(
                    "Collateral for unrecorded request {} is stranded in deposit: {}",
                    request_id, e
                );
            }
        }
    }

    /// CLAIMED -> COMPLETED, then release collateral to the solver.
    /// Caller holds the request lock.
    async fn complete(&self, mut entry: EscrowEntry) -> EscrowResult<bool> {
        let request_id = entry.request_id();
        let now = self.clock.now();

        if let Some(claim) = entry.claim.as_mut() {
            claim.claim_status = ClaimStatus::Confirmed;
            claim.resolved_at = Some(now);
        }
        entry.transition(RequestStatus::Completed)?;

        if !self
            .store
            .compare_and_put(&entry, RequestStatus::Claimed)
            .await?
        {
            debug!("Request {} left CLAIMED under another writer", request_id);
            return Ok(false);
        }

        if let Some(claim) = &entry.claim {
            metrics::record_request_completed(claim.age(now).num_milliseconds() as f64 / 1000.0);
        }

        // Only the writer that flipped the status reaches the release
        self.release_to_solver(entry).await?;
        Ok(true)
    }

    /// Hand a completed request's collateral to its solver.
    /// Caller holds the request lock.
    async fn release_to_solver(&self, mut entry: EscrowEntry) -> EscrowResult<()> {
        let request_id = entry.request_id();
        let (Some(escrow), Some(claim)) = (entry.escrow.clone(), entry.claim.clone()) else {
            return Err(EscrowError::Internal(format!(
                "request {} completed without collateral or claim on record",
                request_id
            )));
        };

        let receipt = match self
            .ledger
            .release_collateral(escrow.held_asset, &claim.solver_identity)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                metrics::record_release_failure();
                error!(
                    "Release of collateral for request {} to {} failed: {}",
                    request_id, claim.solver_identity, e
                );
                return Err(e);
            }
        };

        let released = receipt.amount.clone();
        entry.escrow = None;
        entry.settlement = Some(receipt);
        self.record_settlement(&entry, RequestStatus::Completed).await;

        metrics::record_collateral_released("solver");
        info!(
            "Request {} completed: {} released to solver {}",
            request_id, released, claim.solver_identity
        );
        self.emit(EscrowEvent::RequestCompleted {
            request_id,
            solver: claim.solver_identity,
            released,
        });

        Ok(())
    }

    /// CLAIMED -> FAILED; collateral stays in escrow. Caller holds the request lock.
    async fn fail(
        &self,
        mut entry: EscrowEntry,
        label: &'static str,
        reason: String,
    ) -> EscrowResult<bool> {
        let request_id = entry.request_id();
        let now = self.clock.now();

        if let Some(claim) = entry.claim.as_mut() {
            claim.claim_status = ClaimStatus::Failed;
            claim.resolved_at = Some(now);
        }
        entry.transition(RequestStatus::Failed)?;
        entry.failure_reason = Some(reason.clone());

        if !self
            .store
            .compare_and_put(&entry, RequestStatus::Claimed)
            .await?
        {
            debug!("Request {} left CLAIMED under another writer", request_id);
            return Ok(false);
        }

        metrics::record_request_failed(label);
        warn!(
            "Request {} failed: {}; collateral remains in escrow",
            request_id, reason
        );
        self.emit(EscrowEvent::RequestFailed { request_id, reason });

        Ok(true)
    }

    /// Persist the receipt of a release that already happened
    async fn record_settlement(&self, entry: &EscrowEntry, status: RequestStatus) {
        match self.store.compare_and_put(entry, status).await {
            Ok(true) => {}
            Ok(false) => warn!(
                "Request {} changed while recording its settlement",
                entry.request_id()
            ),
            Err(e) => error!(
                "Collateral for request {} was released but the receipt was not recorded: {}",
                entry.request_id(),
                e
            ),
        }
    }
}

/// Exclusive hold on one request.
///
/// On drop the request's entry leaves the lock map unless another task holds
/// or awaits it, so the map only tracks requests with work in flight.
struct RequestGuard {
    locks: Arc<DashMap<RequestId, Arc<Mutex<()>>>>,
    request_id: RequestId,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.held.take();
        self.locks
            .remove_if(&self.request_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn rejected(reason: &str, error: EscrowError) -> EscrowError {
    metrics::record_claim_rejected(reason);
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{LcdProvider, LcdTransferVerifier, MockForeignChainVerifier};
    use crate::config::ForeignChainConfig;
    use crate::coordination::clock::{ManualClock, SystemClock};
    use crate::ledger::{InMemoryLedger, MockLedgerAccessor};
    use crate::state::{MemoryRequestStore, MockRequestStore, RequestStats};

    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RECIPIENT: &str = "osmo1qpzry9x8gf2tvdw0s3jn54khce6mua7lqpzry9";
    const DEPOSITOR: &str = "0xdepositor";
    const ONE_ETH: u128 = 1_000_000_000_000_000_000;
    const USDC_1000: u128 = 1_000_000_000;

    fn config() -> EscrowConfig {
        EscrowConfig {
            collateral_denom: "wei".to_string(),
            requested_denom: "uusdc".to_string(),
            recipient_prefix: "osmo".to_string(),
            poll_interval_ms: 5,
            max_poll_interval_ms: 50,
            backoff_multiplier: 1.0,
            stale_claim_secs: 3_600,
            max_verification_attempts: None,
            sweep_interval_secs: 60,
            health_check_interval_secs: 30,
        }
    }

    fn one_eth() -> Payment {
        Payment {
            depositor: DEPOSITOR.to_string(),
            amount: Amount::new(ONE_ETH, "wei"),
        }
    }

    fn usdc_1000() -> Amount {
        Amount::new(USDC_1000, "uusdc")
    }

    /// Verifier that walks through `script`, repeating the last verdict
    fn scripted(script: Vec<TransferStatus>) -> (MockForeignChainVerifier, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut verifier = MockForeignChainVerifier::new();
        verifier.expect_check_transfer().returning(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(script.get(n).or(script.last()).copied().unwrap_or(TransferStatus::Pending))
        });
        verifier.expect_health_check().returning(|| true);
        (verifier, calls)
    }

    struct Harness {
        engine: EscrowEngine,
        store: Arc<MemoryRequestStore>,
        ledger: Arc<InMemoryLedger>,
    }

    fn harness_with(
        verifier: impl ForeignChainVerifier + 'static,
        store: Arc<MemoryRequestStore>,
        ledger: Arc<InMemoryLedger>,
        clock: Arc<dyn Clock>,
        config: EscrowConfig,
    ) -> Harness {
        let engine = EscrowEngine::new(
            store.clone(),
            ledger.clone(),
            Arc::new(verifier),
            clock,
            config,
        )
        .unwrap();
        Harness {
            engine,
            store,
            ledger,
        }
    }

    fn harness(verifier: MockForeignChainVerifier) -> Harness {
        harness_with(
            verifier,
            Arc::new(MemoryRequestStore::new()),
            Arc::new(InMemoryLedger::new(["wei"])),
            Arc::new(SystemClock::new()),
            config(),
        )
    }

    async fn next_settlement(
        events: &mut broadcast::Receiver<EscrowEvent>,
        request_id: RequestId,
    ) -> EscrowEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(event) if event.request_id() == request_id && event.is_settlement() => {
                        return event
                    }
                    Ok(_) => continue,
                    Err(e) => panic!("event stream ended: {}", e),
                }
            }
        })
        .await
        .expect("request did not settle in time")
    }

    async fn status_of(h: &Harness, request_id: RequestId) -> RequestStatus {
        h.store.get(&request_id).await.unwrap().unwrap().status()
    }

    #[tokio::test]
    async fn test_lock_creates_pending_request() {
        let (verifier, _) = scripted(vec![TransferStatus::Pending]);
        let h = harness(verifier);

        let request_id = h.engine.lock(one_eth(), usdc_1000(), RECIPIENT).await.unwrap();

        let entry = h.store.get(&request_id).await.unwrap().unwrap();
        assert_eq!(entry.status(), RequestStatus::Pending);
        assert_eq!(entry.request.collateral_amount(), &Amount::new(ONE_ETH, "wei"));
        assert_eq!(entry.request.requested_amount(), &usdc_1000());
        assert_eq!(entry.request.recipient_address(), RECIPIENT);
        assert_eq!(entry.request.depositor(), DEPOSITOR);
        assert!(entry.claim.is_none());
        assert_eq!(
            entry.escrow.as_ref().map(|e| e.held_asset.amount.value),
            Some(ONE_ETH)
        );
        assert_eq!(h.ledger.held_count(), 1);
    }

    #[tokio::test]
    async fn test_lock_rejects_invalid_input_without_taking_collateral() {
        let (verifier, _) = scripted(vec![TransferStatus::Pending]);
        let h = harness(verifier);

        let zero = Payment {
            depositor: DEPOSITOR.to_string(),
            amount: Amount::new(0, "wei"),
        };
        let wrong_collateral = Payment {
            depositor: DEPOSITOR.to_string(),
            amount: Amount::new(ONE_ETH, "uatom"),
        };
        let cases = vec![
            (zero, usdc_1000(), RECIPIENT),
            (wrong_collateral, usdc_1000(), RECIPIENT),
            (one_eth(), Amount::new(0, "uusdc"), RECIPIENT),
            (one_eth(), Amount::new(USDC_1000, "uosmo"), RECIPIENT),
            (one_eth(), usdc_1000(), "osmo1abc"),
            (
                one_eth(),
                usdc_1000(),
                "cosmos1qpzry9x8gf2tvdw0s3jn54khce6mua7lqpzry9",
            ),
        ];

        for (payment, requested, recipient) in cases {
            let result = h.engine.lock(payment, requested, recipient).await;
            assert!(
                matches!(result, Err(EscrowError::InvalidRequest(_))),
                "expected InvalidRequest, got {:?}",
                result
            );
        }

        assert_eq!(h.ledger.held_count(), 0);
        assert_eq!(h.store.stats().await.unwrap(), RequestStats::default());
    }

    #[tokio::test]
    async fn test_lock_returns_collateral_when_record_cannot_be_written() {
        let mut store = MockRequestStore::new();
        store
            .expect_put()
            .returning(|_| Err(EscrowError::Storage("disk full".to_string())));

        let (verifier, _) = scripted(vec![TransferStatus::Pending]);
        let ledger = Arc::new(InMemoryLedger::new(["wei"]));
        let engine = EscrowEngine::new(
            Arc::new(store),
            ledger.clone(),
            Arc::new(verifier),
            Arc::new(SystemClock::new()),
            config(),
        )
        .unwrap();

        let result = engine.lock(one_eth(), usdc_1000(), RECIPIENT).await;

        assert!(matches!(result, Err(EscrowError::Storage(_))));
        assert_eq!(ledger.held_count(), 0);
        assert_eq!(ledger.balance_of(DEPOSITOR, "wei"), ONE_ETH);
    }

    #[tokio::test]
    async fn test_second_claim_is_already_claimed() {
        let (verifier, _) = scripted(vec![TransferStatus::Pending]);
        let h = harness(verifier);
        let request_id = h.engine.lock(one_eth(), usdc_1000(), RECIPIENT).await.unwrap();

        h.engine.claim(request_id, "0xTX1", "solverA").await.unwrap();
        assert_eq!(status_of(&h, request_id).await, RequestStatus::Claimed);

        let second = h.engine.claim(request_id, "0xTX2", "solverB").await;
        assert!(matches!(second, Err(EscrowError::AlreadyClaimed { .. })));

        let claim = h.store.get(&request_id).await.unwrap().unwrap().claim.unwrap();
        assert_eq!(claim.foreign_tx_reference, "0xTX1");
        assert_eq!(claim.solver_identity, "solverA");
        assert_eq!(claim.claim_status, ClaimStatus::Pending);
        assert_eq!(h.engine.active_pollers(), 1);

        h.engine.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_have_one_winner() {
        let (verifier, _) = scripted(vec![TransferStatus::Pending]);
        let h = harness(verifier);
        let request_id = h.engine.lock(one_eth(), usdc_1000(), RECIPIENT).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let engine = h.engine.clone();
                tokio::spawn(async move {
                    engine
                        .claim(request_id, &format!("0xTX{}", i), &format!("solver{}", i))
                        .await
                })
            })
            .collect();

        let mut winners = 0;
        for result in futures::future::join_all(handles).await {
            match result.unwrap() {
                Ok(()) => winners += 1,
                Err(EscrowError::AlreadyClaimed { .. }) => {}
                Err(e) => panic!("unexpected claim error: {}", e),
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(h.engine.active_pollers(), 1);
        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_pending_then_success_releases_to_solver() {
        let (verifier, calls) = scripted(vec![
            TransferStatus::Pending,
            TransferStatus::Pending,
            TransferStatus::Pending,
            TransferStatus::Success,
        ]);
        let h = harness(verifier);
        let mut events = h.engine.subscribe_events();
        let request_id = h.engine.lock(one_eth(), usdc_1000(), RECIPIENT).await.unwrap();

        h.engine.claim(request_id, "0xTX1", "solverA").await.unwrap();
        let event = next_settlement(&mut events, request_id).await;

        assert!(matches!(event, EscrowEvent::RequestCompleted { ref solver, .. } if solver == "solverA"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let entry = h.store.get(&request_id).await.unwrap().unwrap();
        assert_eq!(entry.status(), RequestStatus::Completed);
        assert_eq!(entry.claim.unwrap().claim_status, ClaimStatus::Confirmed);
        assert!(entry.escrow.is_none());
        assert_eq!(entry.settlement.unwrap().recipient, "solverA");
        assert_eq!(h.ledger.balance_of("solverA", "wei"), ONE_ETH);
        assert_eq!(h.ledger.held_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_transfer_keeps_collateral() {
        let (verifier, _) = scripted(vec![TransferStatus::Failed]);
        let h = harness(verifier);
        let mut events = h.engine.subscribe_events();
        let request_id = h.engine.lock(one_eth(), usdc_1000(), RECIPIENT).await.unwrap();

        h.engine.claim(request_id, "0xTX1", "solverA").await.unwrap();
        let event = next_settlement(&mut events, request_id).await;

        assert!(matches!(event, EscrowEvent::RequestFailed { .. }));
        let entry = h.store.get(&request_id).await.unwrap().unwrap();
        assert_eq!(entry.status(), RequestStatus::Failed);
        assert_eq!(entry.claim.unwrap().claim_status, ClaimStatus::Failed);
        assert!(entry.escrow.is_some());
        assert_eq!(h.ledger.release_count(), 0);
        assert_eq!(h.ledger.held_count(), 1);
    }

    #[tokio::test]
    async fn test_claim_unknown_and_terminal_requests() {
        let (verifier, _) = scripted(vec![TransferStatus::Success]);
        let h = harness(verifier);
        let mut events = h.engine.subscribe_events();

        let unknown = h.engine.claim(RequestId::new(), "0xTX1", "solverA").await;
        assert!(matches!(unknown, Err(EscrowError::NotFound { .. })));

        let request_id = h.engine.lock(one_eth(), usdc_1000(), RECIPIENT).await.unwrap();
        h.engine.claim(request_id, "0xTX1", "solverA").await.unwrap();
        next_settlement(&mut events, request_id).await;

        let late = h.engine.claim(request_id, "0xTX2", "solverB").await;
        assert!(matches!(
            late,
            Err(EscrowError::InvalidState {
                status: RequestStatus::Completed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_claim_requires_reference_and_solver() {
        let (verifier, _) = scripted(vec![TransferStatus::Pending]);
        let h = harness(verifier);
        let request_id = h.engine.lock(one_eth(), usdc_1000(), RECIPIENT).await.unwrap();

        assert!(matches!(
            h.engine.claim(request_id, "  ", "solverA").await,
            Err(EscrowError::InvalidRequest(_))
        ));
        assert!(matches!(
            h.engine.claim(request_id, "0xTX1", "").await,
            Err(EscrowError::InvalidRequest(_))
        ));
        assert_eq!(status_of(&h, request_id).await, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn test_redelivered_success_does_not_release_twice() {
        let (verifier, _) = scripted(vec![TransferStatus::Success]);
        let h = harness(verifier);
        let mut events = h.engine.subscribe_events();
        let request_id = h.engine.lock(one_eth(), usdc_1000(), RECIPIENT).await.unwrap();

        h.engine.claim(request_id, "0xTX1", "solverA").await.unwrap();
        next_settlement(&mut events, request_id).await;

        for _ in 0..3 {
            let settled = h
                .engine
                .apply_verification(request_id, TransferStatus::Success)
                .await
                .unwrap();
            assert!(!settled);
        }
        assert_eq!(h.ledger.release_count(), 1);
        assert_eq!(h.ledger.balance_of("solverA", "wei"), ONE_ETH);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_verdict() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut verifier = MockForeignChainVerifier::new();
        verifier.expect_check_transfer().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(EscrowError::VerificationTransient("lcd timeout".to_string()))
            } else {
                Ok(TransferStatus::Success)
            }
        });
        let h = harness(verifier);
        let mut events = h.engine.subscribe_events();
        let request_id = h.engine.lock(one_eth(), usdc_1000(), RECIPIENT).await.unwrap();

        h.engine.claim(request_id, "0xTX1", "solverA").await.unwrap();
        let event = next_settlement(&mut events, request_id).await;

        assert!(matches!(event, EscrowEvent::RequestCompleted { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poller_stops_when_request_leaves_claimed() {
        let (verifier, _) = scripted(vec![TransferStatus::Pending]);
        let h = harness(verifier);
        let request_id = h.engine.lock(one_eth(), usdc_1000(), RECIPIENT).await.unwrap();
        h.engine.claim(request_id, "0xTX1", "solverA").await.unwrap();

        // Verdict delivered out of band, e.g. by a previous process
        assert!(h
            .engine
            .apply_verification(request_id, TransferStatus::Failed)
            .await
            .unwrap());

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.engine.active_pollers() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("poller kept running after settlement");
        assert_eq!(status_of(&h, request_id).await, RequestStatus::Failed);
    }

    #[tokio::test]
    async fn test_recover_resumes_claimed_requests_after_restart() {
        let store = Arc::new(MemoryRequestStore::new());
        let ledger = Arc::new(InMemoryLedger::new(["wei"]));

        let (stuck, _) = scripted(vec![TransferStatus::Pending]);
        let before = harness_with(
            stuck,
            store.clone(),
            ledger.clone(),
            Arc::new(SystemClock::new()),
            config(),
        );
        let request_id = before
            .engine
            .lock(one_eth(), usdc_1000(), RECIPIENT)
            .await
            .unwrap();
        before.engine.claim(request_id, "0xTX1", "solverA").await.unwrap();
        before.engine.stop().await;

        let (verifier, _) = scripted(vec![
            TransferStatus::Pending,
            TransferStatus::Pending,
            TransferStatus::Success,
        ]);
        let after = harness_with(
            verifier,
            store,
            ledger,
            Arc::new(SystemClock::new()),
            config(),
        );
        let mut events = after.engine.subscribe_events();

        assert_eq!(after.engine.recover().await.unwrap(), 1);
        // A live poller is never duplicated
        assert_eq!(after.engine.recover().await.unwrap(), 0);

        next_settlement(&mut events, request_id).await;
        assert_eq!(status_of(&after, request_id).await, RequestStatus::Completed);
        assert_eq!(after.ledger.balance_of("solverA", "wei"), ONE_ETH);
    }

    #[tokio::test]
    async fn test_retry_budget_fails_claim() {
        let (verifier, calls) = scripted(vec![TransferStatus::Pending]);
        let mut config = config();
        config.max_verification_attempts = Some(3);
        let h = harness_with(
            verifier,
            Arc::new(MemoryRequestStore::new()),
            Arc::new(InMemoryLedger::new(["wei"])),
            Arc::new(SystemClock::new()),
            config,
        );
        let mut events = h.engine.subscribe_events();
        let request_id = h.engine.lock(one_eth(), usdc_1000(), RECIPIENT).await.unwrap();

        h.engine.claim(request_id, "0xTX1", "solverA").await.unwrap();
        let event = next_settlement(&mut events, request_id).await;

        match event {
            EscrowEvent::RequestFailed { reason, .. } => assert!(reason.contains("3 attempts")),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.ledger.held_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_claim_raises_alarm_once() {
        let (verifier, _) = scripted(vec![TransferStatus::Pending]);
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let h = harness_with(
            verifier,
            Arc::new(MemoryRequestStore::new()),
            Arc::new(InMemoryLedger::new(["wei"])),
            clock.clone(),
            config(),
        );
        let mut events = h.engine.subscribe_events();
        let request_id = h.engine.lock(one_eth(), usdc_1000(), RECIPIENT).await.unwrap();

        h.engine.claim(request_id, "0xTX1", "solverA").await.unwrap();
        clock.advance(chrono::Duration::hours(2));

        let stale = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(EscrowEvent::ClaimStale { age_secs, .. }) = events.recv().await {
                    return age_secs;
                }
            }
        })
        .await
        .expect("no staleness alarm");
        assert!(stale >= 7_200);

        // Several more polls, no second alarm
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, EscrowEvent::ClaimStale { .. }));
        }
        assert_eq!(status_of(&h, request_id).await, RequestStatus::Claimed);
        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_refund_returns_failed_collateral_to_depositor() {
        let (verifier, _) = scripted(vec![TransferStatus::Failed]);
        let h = harness(verifier);
        let mut events = h.engine.subscribe_events();

        let pending = h.engine.lock(one_eth(), usdc_1000(), RECIPIENT).await.unwrap();
        assert!(matches!(
            h.engine.refund(pending).await,
            Err(EscrowError::InvalidState { .. })
        ));

        let request_id = h.engine.lock(one_eth(), usdc_1000(), RECIPIENT).await.unwrap();
        h.engine.claim(request_id, "0xTX1", "solverA").await.unwrap();
        next_settlement(&mut events, request_id).await;

        let receipt = h.engine.refund(request_id).await.unwrap();
        assert_eq!(receipt.recipient, DEPOSITOR);
        assert_eq!(h.ledger.balance_of(DEPOSITOR, "wei"), ONE_ETH);

        let entry = h.store.get(&request_id).await.unwrap().unwrap();
        assert_eq!(entry.status(), RequestStatus::Failed);
        assert!(entry.escrow.is_none());

        assert!(matches!(
            h.engine.refund(request_id).await,
            Err(EscrowError::InvalidState { .. })
        ));
        assert_eq!(h.ledger.release_count(), 1);
    }

    /// Ledger whose first release attempt fails
    struct FlakyLedger {
        inner: InMemoryLedger,
        fail_next_release: AtomicBool,
    }

    #[async_trait]
    impl LedgerAccessor for FlakyLedger {
        fn asset_amount(&self, payment: &Payment) -> EscrowResult<Amount> {
            self.inner.asset_amount(payment)
        }

        async fn deposit_collateral(&self, payment: Payment) -> EscrowResult<HeldAsset> {
            self.inner.deposit_collateral(payment).await
        }

        async fn release_collateral(
            &self,
            held: HeldAsset,
            recipient: &str,
        ) -> EscrowResult<ReleaseReceipt> {
            if self.fail_next_release.swap(false, Ordering::SeqCst) {
                return Err(EscrowError::Ledger("ledger unavailable".to_string()));
            }
            self.inner.release_collateral(held, recipient).await
        }
    }

    #[tokio::test]
    async fn test_interrupted_release_is_retried_by_recovery() {
        let (verifier, _) = scripted(vec![TransferStatus::Success]);
        let ledger = Arc::new(FlakyLedger {
            inner: InMemoryLedger::new(["wei"]),
            fail_next_release: AtomicBool::new(true),
        });
        let store = Arc::new(MemoryRequestStore::new());
        let engine = EscrowEngine::new(
            store.clone(),
            ledger.clone(),
            Arc::new(verifier),
            Arc::new(SystemClock::new()),
            config(),
        )
        .unwrap();

        let request_id = engine.lock(one_eth(), usdc_1000(), RECIPIENT).await.unwrap();
        engine.claim(request_id, "0xTX1", "solverA").await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let entry = store.get(&request_id).await.unwrap().unwrap();
                if entry.has_pending_release() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("release was never attempted");
        assert_eq!(ledger.inner.release_count(), 0);

        engine.recover().await.unwrap();

        let entry = store.get(&request_id).await.unwrap().unwrap();
        assert!(!entry.has_pending_release());
        assert_eq!(entry.settlement.unwrap().recipient, "solverA");
        assert_eq!(ledger.inner.balance_of("solverA", "wei"), ONE_ETH);
    }

    #[tokio::test]
    async fn test_lock_surfaces_deposit_failure() {
        let mut ledger = MockLedgerAccessor::new();
        ledger
            .expect_asset_amount()
            .returning(|payment| Ok(payment.amount.clone()));
        ledger
            .expect_deposit_collateral()
            .times(1)
            .returning(|_| Err(EscrowError::Ledger("custody offline".to_string())));
        ledger.expect_release_collateral().never();

        let (verifier, _) = scripted(vec![TransferStatus::Pending]);
        let store = Arc::new(MemoryRequestStore::new());
        let engine = EscrowEngine::new(
            store.clone(),
            Arc::new(ledger),
            Arc::new(verifier),
            Arc::new(SystemClock::new()),
            config(),
        )
        .unwrap();

        let result = engine.lock(one_eth(), usdc_1000(), RECIPIENT).await;

        assert!(matches!(result, Err(EscrowError::Ledger(_))));
        assert_eq!(store.stats().await.unwrap(), RequestStats::default());
        assert!(engine.locks.is_empty());
    }

    const PAYOUT_HASH: &str = "9F3B1C7E2D4A5B6C8D9E0F1A2B3C4D5E6F708192A3B4C5D6E7F8091A2B3C4D5E";

    /// LCD that knows one successful 500uusdc transfer to `RECIPIENT`
    async fn lcd_with_one_payout() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/cosmos/tx/v1beta1/txs/{}", PAYOUT_HASH)))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tx_response": {
                    "height": "100",
                    "txhash": PAYOUT_HASH,
                    "code": 0,
                    "timestamp": (Utc::now() + chrono::Duration::hours(1)).to_rfc3339(),
                    "events": [{
                        "type": "transfer",
                        "attributes": [
                            { "key": "recipient", "value": RECIPIENT },
                            { "key": "amount", "value": "500uusdc" }
                        ]
                    }]
                }
            })))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_one_foreign_payout_settles_one_request() {
        let server = lcd_with_one_payout().await;
        let provider = LcdProvider::new(ForeignChainConfig {
            chain_id: "osmosis-1".to_string(),
            lcd_urls: vec![server.uri()],
            confirmation_blocks: 1,
            request_timeout_ms: 2_000,
        })
        .unwrap();
        let h = harness_with(
            LcdTransferVerifier::new(Arc::new(provider)),
            Arc::new(MemoryRequestStore::new()),
            Arc::new(InMemoryLedger::new(["wei"])),
            Arc::new(SystemClock::new()),
            config(),
        );
        let mut events = h.engine.subscribe_events();

        let payment = || Payment {
            depositor: DEPOSITOR.to_string(),
            amount: Amount::new(1_000, "wei"),
        };
        let first = h
            .engine
            .lock(payment(), Amount::new(500, "uusdc"), RECIPIENT)
            .await
            .unwrap();
        let second = h
            .engine
            .lock(payment(), Amount::new(500, "uusdc"), RECIPIENT)
            .await
            .unwrap();

        h.engine.claim(first, PAYOUT_HASH, "solverA").await.unwrap();
        // Same tx, spelled with a prefix and lower case
        let reused = h
            .engine
            .claim(second, &format!("0x{}", PAYOUT_HASH.to_lowercase()), "solverA")
            .await;
        assert!(matches!(reused, Err(EscrowError::InvalidRequest(_))));

        let event = next_settlement(&mut events, first).await;
        assert!(matches!(event, EscrowEvent::RequestCompleted { .. }));

        assert_eq!(h.ledger.balance_of("solverA", "wei"), 1_000);
        assert_eq!(h.ledger.release_count(), 1);
        assert_eq!(status_of(&h, second).await, RequestStatus::Pending);
        // A settled payout still cannot back another request
        assert!(matches!(
            h.engine.claim(second, PAYOUT_HASH, "solverB").await,
            Err(EscrowError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_claim_frees_its_reference() {
        let (verifier, _) = scripted(vec![TransferStatus::Failed, TransferStatus::Pending]);
        let h = harness(verifier);
        let mut events = h.engine.subscribe_events();

        let first = h.engine.lock(one_eth(), usdc_1000(), RECIPIENT).await.unwrap();
        let second = h.engine.lock(one_eth(), usdc_1000(), RECIPIENT).await.unwrap();
        h.engine.claim(first, "0xabcd", "solverA").await.unwrap();
        next_settlement(&mut events, first).await;

        h.engine.claim(second, "0xABCD", "solverB").await.unwrap();
        assert_eq!(status_of(&h, second).await, RequestStatus::Claimed);
        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_lock_map_is_empty_once_requests_settle() {
        let (verifier, _) = scripted(vec![TransferStatus::Failed]);
        let h = harness(verifier);
        let mut events = h.engine.subscribe_events();

        for i in 0..20 {
            let request_id = h.engine.lock(one_eth(), usdc_1000(), RECIPIENT).await.unwrap();
            h.engine
                .claim(request_id, &format!("0xTX{}", i), "solverA")
                .await
                .unwrap();
            next_settlement(&mut events, request_id).await;
            h.engine.refund(request_id).await.unwrap();
            // Late claim on a settled request
            assert!(h.engine.claim(request_id, "0xLATE", "solverB").await.is_err());
        }
        for _ in 0..20 {
            let unknown = RequestId::new();
            assert!(matches!(
                h.engine.refund(unknown).await,
                Err(EscrowError::NotFound { .. })
            ));
            assert!(h
                .engine
                .apply_verification(unknown, TransferStatus::Success)
                .await
                .is_err());
        }

        assert!(h.engine.locks.is_empty());
        assert_eq!(h.ledger.held_count(), 0);
    }

    #[tokio::test]
    async fn test_contended_lock_outlives_first_holder() {
        let (verifier, _) = scripted(vec![TransferStatus::Pending]);
        let h = harness(verifier);
        let request_id = RequestId::new();

        let first = h.engine.acquire(request_id).await;
        let waiter = tokio::spawn({
            let engine = h.engine.clone();
            async move {
                let _guard = engine.acquire(request_id).await;
            }
        });
        tokio::task::yield_now().await;

        drop(first);
        assert!(h.engine.locks.contains_key(&request_id));

        waiter.await.unwrap();
        assert!(h.engine.locks.is_empty());
    }
}
