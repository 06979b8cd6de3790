//! HTTP API for loan requests, claims, health checks, and monitoring
//!
//! Mutations go through the [`EscrowEngine`]; reads go through the
//! [`RequestApi`] facade, which always reads the request store directly.

use crate::chain::ForeignChainVerifier;
use crate::config::ApiConfig;
use crate::coordination::{
    Clock, EscrowEngine, EscrowEntry, FulfillmentClaim, LoanRequest, RequestId, RequestStatus,
};
use crate::error::{EscrowError, EscrowResult};
use crate::ledger::{Amount, Payment, ReleaseReceipt};
use crate::state::{RequestStats, RequestStore};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

/// Read-only view of requests and claims
pub struct RequestApi {
    store: Arc<dyn RequestStore>,
    clock: Arc<dyn Clock>,
    stale_after: chrono::Duration,
}

impl RequestApi {
    pub fn new(store: Arc<dyn RequestStore>, clock: Arc<dyn Clock>, stale_claim_secs: u64) -> Self {
        Self {
            store,
            clock,
            stale_after: chrono::Duration::seconds(stale_claim_secs as i64),
        }
    }

    pub async fn get_request(&self, request_id: RequestId) -> EscrowResult<LoanRequest> {
        Ok(self.get_entry(request_id).await?.request)
    }

    /// The request's claim; NotFound until a solver has claimed it
    pub async fn get_claim_status(&self, request_id: RequestId) -> EscrowResult<FulfillmentClaim> {
        self.get_entry(request_id)
            .await?
            .claim
            .ok_or(EscrowError::NotFound { request_id })
    }

    pub async fn get_entry(&self, request_id: RequestId) -> EscrowResult<EscrowEntry> {
        self.store
            .get(&request_id)
            .await?
            .ok_or(EscrowError::NotFound { request_id })
    }

    /// CLAIMED requests whose claim has waited longer than the staleness threshold
    pub async fn stale_claims(&self) -> EscrowResult<Vec<StaleClaim>> {
        let now = self.clock.now();
        let mut stale: Vec<StaleClaim> = self
            .store
            .scan_by_status(RequestStatus::Claimed)
            .await?
            .into_iter()
            .filter_map(|entry| {
                let claim = entry.claim?;
                let age = claim.age(now);
                (age >= self.stale_after).then(|| StaleClaim {
                    request_id: claim.request_id,
                    solver: claim.solver_identity,
                    foreign_tx_reference: claim.foreign_tx_reference,
                    claimed_at: claim.claimed_at,
                    age_secs: age.num_seconds(),
                })
            })
            .collect();
        stale.sort_by(|a, b| b.age_secs.cmp(&a.age_secs));
        Ok(stale)
    }

    pub async fn stats(&self) -> EscrowResult<RequestStats> {
        self.store.stats().await
    }

    pub async fn store_healthy(&self) -> bool {
        self.store.health_check().await.is_ok()
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: EscrowEngine,
    pub requests: Arc<RequestApi>,
    pub verifier: Arc<dyn ForeignChainVerifier>,
}

/// Build the API router
pub fn router(state: AppState, admin_enabled: bool) -> Router {
    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(get_stats))
        .route("/requests", post(lock_request))
        .route("/requests/:id", get(get_request))
        .route("/requests/:id/claim", post(claim_request).get(get_claim))
        .route("/claims/stale", get(get_stale_claims));

    if admin_enabled {
        app = app.route("/admin/requests/:id/refund", post(refund_request));
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> EscrowResult<()> {
    let app = router(state, config.admin_enabled);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| EscrowError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| EscrowError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - request store and foreign chain reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.requests.store_healthy().await;
    let foreign_chain = state.verifier.health_check().await;
    let ready = store && foreign_chain;

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready,
            store,
            foreign_chain,
            active_pollers: state.engine.active_pollers(),
        }),
    )
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<RequestStats>, ApiError> {
    Ok(Json(state.requests.stats().await?))
}

async fn lock_request(
    State(state): State<AppState>,
    Json(body): Json<LockBody>,
) -> Result<(StatusCode, Json<LockResponse>), ApiError> {
    let payment = Payment {
        depositor: body.depositor,
        amount: body.collateral,
    };
    let request_id = state
        .engine
        .lock(payment, body.requested_amount, &body.recipient_address)
        .await?;
    Ok((StatusCode::CREATED, Json(LockResponse { request_id })))
}

async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RequestResponse>, ApiError> {
    let entry = state.requests.get_entry(id.parse()?).await?;
    Ok(Json(RequestResponse {
        collateral_held: entry.escrow.is_some(),
        failure_reason: entry.failure_reason,
        settlement: entry.settlement,
        request: entry.request,
    }))
}

async fn claim_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ClaimBody>,
) -> Result<(StatusCode, Json<ClaimResponse>), ApiError> {
    let request_id: RequestId = id.parse()?;
    state
        .engine
        .claim(request_id, &body.foreign_tx_reference, &body.solver)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ClaimResponse {
            request_id,
            status: RequestStatus::Claimed,
        }),
    ))
}

async fn get_claim(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FulfillmentClaim>, ApiError> {
    Ok(Json(state.requests.get_claim_status(id.parse()?).await?))
}

async fn get_stale_claims(
    State(state): State<AppState>,
) -> Result<Json<Vec<StaleClaim>>, ApiError> {
    Ok(Json(state.requests.stale_claims().await?))
}

async fn refund_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ReleaseReceipt>, ApiError> {
    Ok(Json(state.engine.refund(id.parse()?).await?))
}

/// Error response mapping the escrow taxonomy onto HTTP statuses
pub struct ApiError(EscrowError);

impl From<EscrowError> for ApiError {
    fn from(err: EscrowError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EscrowError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EscrowError::NotFound { .. } => StatusCode::NOT_FOUND,
            EscrowError::InvalidState { .. } | EscrowError::AlreadyClaimed { .. } => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Internal details stay in the logs
        let message = if self.0.is_caller_error() {
            self.0.to_string()
        } else {
            error!("API request failed: {}", self.0);
            "internal error".to_string()
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

// Request/Response types

#[derive(Deserialize)]
struct LockBody {
    depositor: String,
    collateral: Amount,
    requested_amount: Amount,
    recipient_address: String,
}

#[derive(Serialize, Deserialize)]
struct LockResponse {
    request_id: RequestId,
}

#[derive(Deserialize)]
struct ClaimBody {
    foreign_tx_reference: String,
    solver: String,
}

#[derive(Serialize, Deserialize)]
struct ClaimResponse {
    request_id: RequestId,
    status: RequestStatus,
}

#[derive(Serialize)]
struct RequestResponse {
    #[serde(flatten)]
    request: LoanRequest,
    collateral_held: bool,
    failure_reason: Option<String>,
    settlement: Option<ReleaseReceipt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleClaim {
    pub request_id: RequestId,
    pub solver: String,
    pub foreign_tx_reference: String,
    pub claimed_at: DateTime<Utc>,
    pub age_secs: i64,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
    foreign_chain: bool,
    active_pollers: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}
