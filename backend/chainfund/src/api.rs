//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::error;

use crate::campaigns::{
    ActorRequest, CampaignService, CreateCampaignRequest, ListQuery, UpdateCampaignRequest,
};
use crate::config::Config;
use crate::contract::{Backer, ContractEvent, CrowdfundContract};
use crate::donations::{DonateRequest, DonationService, PageQuery};
use crate::errors::AppError;
use crate::models::{parse_address, to_eth, CampaignView, DonationView};
use crate::users;

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
    pub campaigns: CampaignService,
    pub donations: DonationService,
    pub contract: Arc<CrowdfundContract>,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct CampaignsResponse {
    pub total: usize,
    pub count: usize,
    pub campaigns: Vec<CampaignView>,
}

#[derive(Serialize)]
pub struct DonationResponse {
    pub donation: DonationView,
    pub campaign: CampaignView,
}

#[derive(Serialize)]
pub struct EventsResponse {
    pub project_id: i64,
    pub count: usize,
    pub events: Vec<ContractEvent>,
}

#[derive(Serialize)]
pub struct BackersResponse {
    pub project_id: i64,
    pub count: usize,
    pub backers: Vec<Backer>,
}

#[derive(Serialize)]
pub struct BalanceResponse {
    pub address: String,
    pub balance_eth: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub from_block: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DonorQuery {
    pub donor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TopQuery {
    pub limit: Option<usize>,
}

pub fn status_for(err: &AppError) -> StatusCode {
    match err {
        AppError::Validation(_) => StatusCode::BAD_REQUEST,
        AppError::Unauthorized(_) => StatusCode::FORBIDDEN,
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_chain() => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: AppError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!("Request failed: {err}");
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

fn respond<T: Serialize>(status: StatusCode, result: crate::errors::Result<T>) -> Response {
    match result {
        Ok(body) => (status, Json(body)).into_response(),
        Err(e) => error_response(e),
    }
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /campaigns`
///
/// Reconciles every campaign, then filters, sorts and pages them.
pub async fn list_campaigns(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let now = now();
    let result = state.campaigns.list(&query, now).await.map(|page| {
        let campaigns: Vec<CampaignView> = page
            .campaigns
            .iter()
            .map(|c| CampaignView::new(c, now))
            .collect();
        CampaignsResponse {
            total: page.total,
            count: campaigns.len(),
            campaigns,
        }
    });
    respond(StatusCode::OK, result)
}

/// `GET /campaigns/stats`
pub async fn campaign_stats(State(state): State<Arc<ApiState>>) -> Response {
    respond(StatusCode::OK, state.campaigns.stats(now()).await)
}

/// `GET /campaigns/:id`
pub async fn get_campaign(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<i64>,
) -> Response {
    let now = now();
    let result = state.campaigns.get(project_id, now).await;
    respond(StatusCode::OK, result.map(|c| CampaignView::new(&c, now)))
}

/// `POST /campaigns`
pub async fn create_campaign(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateCampaignRequest>,
) -> Response {
    let now = now();
    let result = state.campaigns.create(&req, now).await;
    respond(StatusCode::CREATED, result.map(|c| CampaignView::new(&c, now)))
}

/// `PATCH /campaigns/:id`
pub async fn update_campaign(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<i64>,
    Json(req): Json<UpdateCampaignRequest>,
) -> Response {
    let now = now();
    let result = state.campaigns.update(project_id, &req, now).await;
    respond(StatusCode::OK, result.map(|c| CampaignView::new(&c, now)))
}

/// `DELETE /campaigns/:id`
pub async fn delete_campaign(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<i64>,
    Json(req): Json<ActorRequest>,
) -> Response {
    let now = now();
    let result = state.campaigns.delete(project_id, &req).await;
    respond(StatusCode::OK, result.map(|c| CampaignView::new(&c, now)))
}

/// `GET /campaigns/:id/status`
pub async fn campaign_status(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<i64>,
) -> Response {
    respond(StatusCode::OK, state.campaigns.status_report(project_id).await)
}

/// `POST /campaigns/:id/payout`
pub async fn pay_out_campaign(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<i64>,
    Json(req): Json<ActorRequest>,
) -> Response {
    respond(StatusCode::OK, state.campaigns.pay_out(project_id, &req).await)
}

/// `GET /campaigns/:id/events`
///
/// Decoded contract events for one project, read straight from the node.
pub async fn campaign_events(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<i64>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let Ok(id) = u64::try_from(project_id) else {
        return error_response(AppError::Validation(format!(
            "invalid project id {project_id}"
        )));
    };
    let result = state
        .contract
        .events(query.from_block.unwrap_or(0), Some(id))
        .await
        .map(|events| EventsResponse {
            project_id,
            count: events.len(),
            events,
        });
    respond(StatusCode::OK, result)
}

/// `GET /campaigns/:id/backers`
///
/// The contract's own backer list, including refunded entries.
pub async fn campaign_backers(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<i64>,
) -> Response {
    let Ok(id) = u64::try_from(project_id) else {
        return error_response(AppError::Validation(format!(
            "invalid project id {project_id}"
        )));
    };
    let result = state
        .contract
        .backers(id)
        .await
        .map(|backers| BackersResponse {
            project_id,
            count: backers.len(),
            backers,
        });
    respond(StatusCode::OK, result)
}

/// `GET /campaigns/:id/donations`
pub async fn campaign_donations(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<i64>,
    Query(page): Query<PageQuery>,
) -> Response {
    respond(StatusCode::OK, state.donations.for_project(project_id, &page).await)
}

/// `POST /campaigns/:id/donations`
///
/// Blocks until the `backProject` transaction is mined.
pub async fn donate(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<i64>,
    Json(req): Json<DonateRequest>,
) -> Response {
    let now = now();
    let result = state
        .donations
        .donate(project_id, &req, now)
        .await
        .map(|outcome| DonationResponse {
            donation: DonationView::from(&outcome.donation),
            campaign: CampaignView::new(&outcome.campaign, now),
        });
    respond(StatusCode::CREATED, result)
}

/// `GET /campaigns/:id/donations/summary`
pub async fn campaign_donation_summary(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<i64>,
    Query(query): Query<DonorQuery>,
) -> Response {
    let result = state
        .donations
        .project_summary(project_id, query.donor.as_deref())
        .await;
    respond(StatusCode::OK, result)
}

/// `GET /donations/top`
pub async fn top_donors(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TopQuery>,
) -> Response {
    respond(StatusCode::OK, state.donations.top_donors(query.limit).await)
}

/// `GET /donations/stats`
pub async fn donation_stats(State(state): State<Arc<ApiState>>) -> Response {
    respond(StatusCode::OK, state.donations.stats().await)
}

/// `POST /donations/pending/resolve`
///
/// Checks every pending donation's receipt once.
pub async fn resolve_pending(State(state): State<Arc<ApiState>>) -> Response {
    respond(StatusCode::OK, state.donations.resolve_pending(now()).await)
}

/// `GET /donations/:id`
pub async fn get_donation(State(state): State<Arc<ApiState>>, Path(id): Path<i64>) -> Response {
    respond(StatusCode::OK, state.donations.get(id).await)
}

/// `GET /donors/:address/donations`
pub async fn donor_donations(
    State(state): State<Arc<ApiState>>,
    Path(address): Path<String>,
    Query(page): Query<PageQuery>,
) -> Response {
    respond(StatusCode::OK, state.donations.for_donor(&address, &page).await)
}

/// `GET /donors/:address/summary`
pub async fn donor_summary(
    State(state): State<Arc<ApiState>>,
    Path(address): Path<String>,
) -> Response {
    respond(StatusCode::OK, state.donations.donor_summary(&address).await)
}

/// `GET /users/:address`
pub async fn get_user(State(state): State<Arc<ApiState>>, Path(address): Path<String>) -> Response {
    respond(
        StatusCode::OK,
        users::get_user(&state.pool, &state.config, &address).await,
    )
}

/// `POST /users/:address/nonce`
pub async fn issue_nonce(
    State(state): State<Arc<ApiState>>,
    Path(address): Path<String>,
) -> Response {
    respond(StatusCode::OK, users::issue_nonce(&state.pool, &address).await)
}

/// `POST /users/:address/nonce/rotate`
pub async fn rotate_nonce(
    State(state): State<Arc<ApiState>>,
    Path(address): Path<String>,
) -> Response {
    match users::rotate_nonce(&state.pool, &address).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /balances/:address`
pub async fn balance(State(state): State<Arc<ApiState>>, Path(address): Path<String>) -> Response {
    let result = match parse_address(&address) {
        Ok((parsed, lower)) => state
            .contract
            .rpc()
            .get_balance(parsed)
            .await
            .map(|wei| BalanceResponse {
                address: lower,
                balance_eth: to_eth(wei),
            }),
        Err(e) => Err(e),
    };
    respond(StatusCode::OK, result)
}

/// `GET /contract/balance`
pub async fn contract_balance(State(state): State<Arc<ApiState>>) -> Response {
    let address = state.contract.address();
    let result = state
        .contract
        .rpc()
        .get_balance(address)
        .await
        .map(|wei| BalanceResponse {
            address: address.to_string().to_lowercase(),
            balance_eth: to_eth(wei),
        });
    respond(StatusCode::OK, result)
}

/// `GET /contract/stats`
pub async fn contract_stats(State(state): State<Arc<ApiState>>) -> Response {
    respond(StatusCode::OK, state.contract.stats().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_status_codes() {
        assert_eq!(status_for(&AppError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&AppError::Unauthorized("x".into())), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&AppError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&AppError::Reverted("0x1".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for(&AppError::Rpc {
                code: -32000,
                message: "nonce too low".into()
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&AppError::Decode("bad row".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
