//! ChainFund backend entry point.
//!
//! Serves the campaign REST API. Every read of campaign state first
//! reconciles the SQLite cache with the crowdfunding contract, and every
//! write goes through the contract before it is mirrored locally.

mod api;
mod campaigns;
mod config;
mod contract;
mod db;
mod donations;
mod errors;
mod models;
mod reconcile;
mod rpc;
mod status;
mod users;

#[cfg(test)]
mod testutil;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use reqwest::Client;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use campaigns::CampaignService;
use config::Config;
use contract::CrowdfundContract;
use db::SqliteStore;
use donations::DonationService;
use reconcile::ReconciliationService;
use rpc::RpcClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Arc::new(Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?);
    info!(
        "Using contract {} on chain {} via {}",
        config.contract_address, config.chain_id, config.rpc_url
    );

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    let client = Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;
    let rpc = RpcClient::new(client, config.rpc_url.clone(), config.rpc_max_retries);
    let contract = Arc::new(CrowdfundContract::new(rpc, &config));

    let store = Arc::new(SqliteStore::new(pool.clone()));
    let reconciler = ReconciliationService::new(store, contract.clone());

    let api_state = Arc::new(api::ApiState {
        pool: pool.clone(),
        config: config.clone(),
        campaigns: CampaignService::new(
            pool.clone(),
            config.clone(),
            contract.clone(),
            contract.clone(),
            reconciler.clone(),
        ),
        donations: DonationService::new(
            pool,
            config.clone(),
            contract.clone(),
            contract.clone(),
            reconciler,
        ),
        contract,
    });

    let app = Router::new()
        .route("/health", get(api::health))
        .route(
            "/campaigns",
            get(api::list_campaigns).post(api::create_campaign),
        )
        .route("/campaigns/stats", get(api::campaign_stats))
        .route(
            "/campaigns/:id",
            get(api::get_campaign)
                .patch(api::update_campaign)
                .delete(api::delete_campaign),
        )
        .route("/campaigns/:id/status", get(api::campaign_status))
        .route("/campaigns/:id/payout", post(api::pay_out_campaign))
        .route("/campaigns/:id/events", get(api::campaign_events))
        .route("/campaigns/:id/backers", get(api::campaign_backers))
        .route(
            "/campaigns/:id/donations",
            get(api::campaign_donations).post(api::donate),
        )
        .route(
            "/campaigns/:id/donations/summary",
            get(api::campaign_donation_summary),
        )
        .route("/donations/top", get(api::top_donors))
        .route("/donations/stats", get(api::donation_stats))
        .route("/donations/pending/resolve", post(api::resolve_pending))
        .route("/donations/:id", get(api::get_donation))
        .route("/donors/:address/donations", get(api::donor_donations))
        .route("/donors/:address/summary", get(api::donor_summary))
        .route("/users/:address", get(api::get_user))
        .route("/users/:address/nonce", post(api::issue_nonce))
        .route("/users/:address/nonce/rotate", post(api::rotate_nonce))
        .route("/balances/:address", get(api::balance))
        .route("/contract/balance", get(api::contract_balance))
        .route("/contract/stats", get(api::contract_stats))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(api_state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
