//! Verification polling for claimed requests
//!
//! Each CLAIMED request gets one poller task. The poller re-reads the request
//! before every query, so a verdict delivered elsewhere stops it.

use super::engine::EscrowEngine;
use super::request::{RequestId, RequestStatus};
use crate::chain::{TransferQuery, TransferStatus};
use crate::config::EscrowConfig;
use crate::events::EscrowEvent;
use crate::metrics;

use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, warn};

/// Delay between polls: fixed, or growing geometrically up to a cap
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    pub fn new(config: &EscrowConfig) -> Self {
        Self {
            current: Duration::from_millis(config.poll_interval_ms),
            max: Duration::from_millis(config.max_poll_interval_ms.max(config.poll_interval_ms)),
            multiplier: config.backoff_multiplier.max(1.0),
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn advance(&mut self) {
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
    }
}

/// Tracks whether this claim is counted in the stale-claims gauge
#[derive(Default)]
struct StaleAlarm {
    raised: bool,
}

impl StaleAlarm {
    /// Returns true only the first time
    fn raise(&mut self) -> bool {
        if self.raised {
            return false;
        }
        self.raised = true;
        metrics::record_stale_claim();
        true
    }
}

impl Drop for StaleAlarm {
    fn drop(&mut self) {
        if self.raised {
            metrics::clear_stale_claim();
        }
    }
}

impl EscrowEngine {
    /// Start polling a claim unless a live poller already owns it
    pub(super) fn spawn_poller(&self, request_id: RequestId) -> bool {
        if self.is_stopping() {
            return false;
        }

        let spawned = match self.pollers.entry(request_id) {
            Entry::Occupied(mut slot) => {
                if slot.get().is_finished() {
                    slot.insert(self.start_poll_task(request_id));
                    true
                } else {
                    debug!("Request {} already has a poller", request_id);
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(self.start_poll_task(request_id));
                true
            }
        };

        metrics::set_active_pollers(self.pollers.len());
        spawned
    }

    fn start_poll_task(&self, request_id: RequestId) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.poll_claim(request_id).await;
            engine.pollers.remove(&request_id);
            metrics::set_active_pollers(engine.pollers.len());
        })
    }

    async fn poll_claim(&self, request_id: RequestId) {
        let mut backoff = Backoff::new(&self.config);
        let mut stale = StaleAlarm::default();
        let mut attempts: u32 = 0;

        debug!("Polling verification for request {}", request_id);

        while !self.is_stopping() {
            let entry = match self.store.get(&request_id).await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    error!("Request {} disappeared while claimed", request_id);
                    return;
                }
                Err(e) => {
                    warn!("Failed to load request {}: {}", request_id, e);
                    sleep(backoff.current()).await;
                    backoff.advance();
                    continue;
                }
            };

            if entry.status() != RequestStatus::Claimed {
                debug!(
                    "Request {} is {}, stopping verification",
                    request_id,
                    entry.status()
                );
                return;
            }
            let Some(claim) = entry.claim.as_ref() else {
                error!("Request {} is CLAIMED without a claim record", request_id);
                return;
            };

            let age = claim.age(self.clock.now());
            if age.num_seconds() >= self.config.stale_claim_secs as i64 && stale.raise() {
                warn!(
                    "Claim on request {} by {} unresolved for {}s",
                    request_id,
                    claim.solver_identity,
                    age.num_seconds()
                );
                self.emit(EscrowEvent::ClaimStale {
                    request_id,
                    age_secs: age.num_seconds(),
                });
            }

            let query = TransferQuery {
                tx_reference: claim.foreign_tx_reference.clone(),
                expected_amount: entry.request.requested_amount().value,
                recipient_address: entry.request.recipient_address().to_string(),
                token_denom: entry.request.requested_amount().denom.clone(),
                not_before: entry.request.created_at(),
            };

            attempts = attempts.saturating_add(1);
            match self.verifier.check_transfer(&query).await {
                Ok(TransferStatus::Pending) => {
                    metrics::record_poll(TransferStatus::Pending.as_str());
                    debug!(
                        "Payout for request {} not yet visible (attempt {})",
                        request_id, attempts
                    );
                }
                Ok(verdict) => {
                    metrics::record_poll(verdict.as_str());
                    match self.apply_verification(request_id, verdict).await {
                        Ok(_) => return,
                        Err(e) if e.should_alert() => error!(
                            "Failed to apply {} verdict to request {}: {}",
                            verdict.as_str(),
                            request_id,
                            e
                        ),
                        Err(e) => warn!(
                            "Failed to apply {} verdict to request {}: {}",
                            verdict.as_str(),
                            request_id,
                            e
                        ),
                    }
                }
                Err(e) => {
                    metrics::record_poll("error");
                    if e.is_retryable() {
                        warn!("Verification of request {} failed: {}", request_id, e);
                    } else {
                        error!("Unexpected verifier error for request {}: {}", request_id, e);
                    }
                }
            }

            if let Some(max_attempts) = self.config.max_verification_attempts {
                if attempts >= max_attempts {
                    match self.expire_claim(request_id, attempts).await {
                        Ok(_) => return,
                        Err(e) => warn!("Failed to expire claim on {}: {}", request_id, e),
                    }
                }
            }

            sleep(backoff.current()).await;
            backoff.advance();
        }
    }
}
