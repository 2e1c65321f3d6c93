//! Campaign lifecycle: creation, edits, deletion, payout, listing and
//! statistics.
//!
//! Every write goes to the contract first and is mirrored into the store
//! only after its receipt confirms success.

use std::sync::Arc;

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::Config;
use crate::contract::{self, ContractEvent, ProjectReader, ProjectWriter};
use crate::db;
use crate::errors::{AppError, Result};
use crate::models::{
    parse_address, parse_eth, to_eth, Campaign, CampaignEdit, NewCampaign, NewProject,
    ProjectEdit, SECONDS_PER_DAY,
};
use crate::reconcile::ReconciliationService;
use crate::status::{CampaignStatus, OnChainStatus};
use crate::users;

pub const DEFAULT_IMAGE_URL: &str = "https://via.placeholder.com/600x350";

// ─────────────────────────────────────────────────────────
// Requests and responses
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCampaignRequest {
    /// Wallet sending the transaction.
    pub from: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub target_eth: String,
    pub duration_days: i64,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateCampaignRequest {
    pub from: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub duration_days: Option<i64>,
    /// Explicit expiry; wins over `duration_days`.
    pub expires_at: Option<i64>,
}

/// Body of actions that only need to know who is asking.
#[derive(Debug, Clone, Deserialize)]
pub struct ActorRequest {
    pub from: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    /// A status name, or `completed` for approved and paid-out campaigns.
    pub status: Option<String>,
    pub owner: Option<String>,
    /// Case-insensitive title search.
    pub search: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusFilter {
    Exact(CampaignStatus),
    Completed,
}

impl StatusFilter {
    fn parse(raw: &str) -> Result<Option<Self>> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Ok(None),
            "completed" => Ok(Some(Self::Completed)),
            other => other
                .parse()
                .map(|s| Some(Self::Exact(s)))
                .map_err(|_| AppError::Validation(format!("unknown status filter '{raw}'"))),
        }
    }

    fn matches(self, status: CampaignStatus) -> bool {
        match self {
            Self::Exact(s) => s == status,
            Self::Completed => status.is_successful(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CampaignPage {
    /// Matches before paging.
    pub total: usize,
    pub campaigns: Vec<Campaign>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub project_id: i64,
    pub chain_status: OnChainStatus,
    pub raised_eth: String,
    pub cost_eth: String,
    pub backers: u64,
    pub expires_at: i64,
    pub stored_status: Option<CampaignStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PayoutSummary {
    pub project_id: i64,
    pub tx_hash: String,
    pub recipient: Option<String>,
    pub amount_eth: Option<String>,
    pub tax_eth: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CampaignStats {
    pub total_campaigns: usize,
    pub active_campaigns: usize,
    pub successful_campaigns: usize,
    pub total_raised_eth: String,
    pub total_donors: usize,
}

// ─────────────────────────────────────────────────────────
// Listing helpers
// ─────────────────────────────────────────────────────────

/// Filter, order (active first, then newest) and page reconciled campaigns.
pub fn select(campaigns: Vec<Campaign>, query: &ListQuery, default_limit: usize) -> Result<CampaignPage> {
    let status = query.status.as_deref().map(StatusFilter::parse).transpose()?.flatten();
    let owner = query.owner.as_deref().map(|o| o.trim().to_lowercase());
    let search = query
        .search
        .as_deref()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());

    let mut matched: Vec<Campaign> = campaigns
        .into_iter()
        .filter(|c| status.map_or(true, |f| f.matches(c.status)))
        .filter(|c| owner.as_ref().map_or(true, |o| c.owner_address == *o))
        .filter(|c| {
            search
                .as_ref()
                .map_or(true, |s| c.title.to_lowercase().contains(s.as_str()))
        })
        .collect();

    matched.sort_by(|a, b| {
        let a_active = a.status != CampaignStatus::Active;
        let b_active = b.status != CampaignStatus::Active;
        a_active
            .cmp(&b_active)
            .then(b.created_at.cmp(&a.created_at))
            .then(b.project_id.cmp(&a.project_id))
    });

    let total = matched.len();
    let limit = query.limit.unwrap_or(default_limit).max(1);
    let offset = query.offset.unwrap_or(0);
    let campaigns = matched.into_iter().skip(offset).take(limit).collect();
    Ok(CampaignPage { total, campaigns })
}

pub fn stats(campaigns: &[Campaign], total_donors: usize) -> CampaignStats {
    CampaignStats {
        total_campaigns: campaigns.len(),
        active_campaigns: campaigns
            .iter()
            .filter(|c| c.status == CampaignStatus::Active)
            .count(),
        successful_campaigns: campaigns.iter().filter(|c| c.status.is_successful()).count(),
        total_raised_eth: to_eth(
            campaigns
                .iter()
                .fold(U256::ZERO, |acc, c| acc.saturating_add(c.raised_amount)),
        ),
        total_donors,
    }
}

// ─────────────────────────────────────────────────────────
// Service
// ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct CampaignService {
    pool: SqlitePool,
    config: Arc<Config>,
    reader: Arc<dyn ProjectReader>,
    writer: Arc<dyn ProjectWriter>,
    reconciler: ReconciliationService,
}

impl CampaignService {
    pub fn new(
        pool: SqlitePool,
        config: Arc<Config>,
        reader: Arc<dyn ProjectReader>,
        writer: Arc<dyn ProjectWriter>,
        reconciler: ReconciliationService,
    ) -> Self {
        Self {
            pool,
            config,
            reader,
            writer,
            reconciler,
        }
    }

    pub async fn list(&self, query: &ListQuery, now: i64) -> Result<CampaignPage> {
        let pass = self.reconciler.reconcile(now).await?;
        select(pass.campaigns, query, self.config.limits.items_per_page)
    }

    pub async fn get(&self, project_id: i64, now: i64) -> Result<Campaign> {
        self.reconciler
            .reconcile_campaign(project_id, now)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("campaign {project_id}")))
    }

    pub async fn stats(&self, now: i64) -> Result<CampaignStats> {
        let pass = self.reconciler.reconcile(now).await?;
        let donors = db::distinct_donor_count(&self.pool).await?;
        Ok(stats(&pass.campaigns, usize::try_from(donors).unwrap_or(0)))
    }

    /// Admin-only. Registers the project on-chain, then mirrors it.
    pub async fn create(&self, req: &CreateCampaignRequest, now: i64) -> Result<Campaign> {
        let (from, from_lower) = parse_address(&req.from)?;
        let title = req.title.trim();
        if title.is_empty() {
            return Err(AppError::Validation("title is required".to_string()));
        }
        let target = parse_eth(&req.target_eth)?;
        if target < self.config.limits.min_target {
            return Err(AppError::Validation(format!(
                "target must be at least {} ETH",
                to_eth(self.config.limits.min_target)
            )));
        }
        self.check_duration(req.duration_days)?;
        if !users::is_admin(&self.pool, &self.config, &from_lower).await? {
            return Err(AppError::Unauthorized(
                "only admins can create campaigns".to_string(),
            ));
        }

        let image_url = req
            .image_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(DEFAULT_IMAGE_URL)
            .to_string();
        let expires_at = now + req.duration_days * SECONDS_PER_DAY;

        let project = NewProject {
            title: title.to_string(),
            description: req.description.clone(),
            image_url: image_url.clone(),
            cost: target,
            expires_at,
        };
        let tx_hash = self.writer.send_create_project(from, &project).await?;
        let receipt = contract::confirm(self.writer.as_ref(), tx_hash).await?;
        let project_id = i64::try_from(contract::created_project_id(&receipt)?)
            .map_err(|_| AppError::Decode("project id out of range".to_string()))?;

        let campaign = db::insert_campaign(
            &self.pool,
            &NewCampaign {
                project_id,
                title: project.title,
                description: project.description,
                image_url: Some(image_url),
                owner_address: from_lower,
                target_amount: target,
                duration_days: req.duration_days,
                created_at: now,
                expires_at,
            },
        )
        .await?;
        info!("Created campaign {project_id} ({tx_hash})");
        Ok(campaign)
    }

    /// Owner or admin. Unset fields keep their cached values.
    pub async fn update(&self, project_id: i64, req: &UpdateCampaignRequest, now: i64) -> Result<Campaign> {
        let (from, from_lower) = parse_address(&req.from)?;
        if req.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(AppError::Validation("title cannot be empty".to_string()));
        }
        if let Some(days) = req.duration_days {
            self.check_duration(days)?;
        }
        if req.expires_at.is_some_and(|t| t <= now) {
            return Err(AppError::Validation("expiry must be in the future".to_string()));
        }

        let campaign = self.editable(project_id, &from_lower).await?;
        let expires_at = req
            .expires_at
            .or(req.duration_days.map(|d| now + d * SECONDS_PER_DAY))
            .unwrap_or(campaign.expires_at);

        let edit = ProjectEdit {
            title: req
                .title
                .as_deref()
                .map(|t| t.trim().to_string())
                .unwrap_or_else(|| campaign.title.clone()),
            description: req
                .description
                .clone()
                .unwrap_or_else(|| campaign.description.clone()),
            image_url: req
                .image_url
                .clone()
                .or_else(|| campaign.image_url.clone())
                .unwrap_or_else(|| DEFAULT_IMAGE_URL.to_string()),
            expires_at,
        };
        let tx_hash = self
            .writer
            .send_update_project(from, chain_id(project_id)?, &edit)
            .await?;
        contract::confirm(self.writer.as_ref(), tx_hash).await?;

        db::update_campaign_fields(
            &self.pool,
            project_id,
            &CampaignEdit {
                title: req.title.as_ref().map(|_| edit.title.clone()),
                description: req.description.clone(),
                image_url: req.image_url.clone(),
                duration_days: req.duration_days,
                expires_at: (expires_at != campaign.expires_at).then_some(expires_at),
            },
        )
        .await?;
        info!("Updated campaign {project_id} ({tx_hash})");
        self.get(project_id, now).await
    }

    /// Owner or admin. Marks the campaign deleted; the row stays.
    pub async fn delete(&self, project_id: i64, req: &ActorRequest) -> Result<Campaign> {
        let (from, from_lower) = parse_address(&req.from)?;
        let mut campaign = self.editable(project_id, &from_lower).await?;

        let tx_hash = self
            .writer
            .send_delete_project(from, chain_id(project_id)?)
            .await?;
        contract::confirm(self.writer.as_ref(), tx_hash).await?;

        db::update_campaign_status(&self.pool, project_id, CampaignStatus::Deleted).await?;
        info!("Deleted campaign {project_id} ({tx_hash})");
        campaign.status = CampaignStatus::Deleted;
        Ok(campaign)
    }

    /// Owner or admin. The contract must already consider the project approved.
    pub async fn pay_out(&self, project_id: i64, req: &ActorRequest) -> Result<PayoutSummary> {
        let (from, from_lower) = parse_address(&req.from)?;
        self.editable(project_id, &from_lower).await?;

        let id = chain_id(project_id)?;
        let project = self.reader.get_project(id).await?;
        if project.status != OnChainStatus::Approved {
            return Err(AppError::Validation(format!(
                "campaign {project_id} is not approved for payout"
            )));
        }

        let tx_hash = self.writer.send_pay_out_project(from, id).await?;
        let receipt = contract::confirm(self.writer.as_ref(), tx_hash).await?;
        db::update_campaign_status(&self.pool, project_id, CampaignStatus::Paidout).await?;

        let payout = contract::decode_logs(&receipt.logs)
            .into_iter()
            .find_map(|ev| match ev {
                ContractEvent::PayoutProcessed {
                    recipient,
                    amount_eth,
                    tax_eth,
                    ..
                } => Some((recipient, amount_eth, tax_eth)),
                _ => None,
            });
        if payout.is_none() {
            warn!("Payout of campaign {project_id} emitted no PayoutProcessed event");
        }
        info!("Paid out campaign {project_id} ({tx_hash})");

        let (recipient, amount_eth, tax_eth) = match payout {
            Some((r, a, t)) => (Some(r), Some(a), Some(t)),
            None => (None, None, None),
        };
        Ok(PayoutSummary {
            project_id,
            tx_hash: tx_hash.to_string(),
            recipient,
            amount_eth,
            tax_eth,
        })
    }

    /// On-chain state next to the stored status.
    pub async fn status_report(&self, project_id: i64) -> Result<StatusReport> {
        let project = self.reader.get_project(chain_id(project_id)?).await?;
        let stored = db::get_campaign(&self.pool, project_id).await?;
        Ok(StatusReport {
            project_id,
            chain_status: project.status,
            raised_eth: to_eth(project.raised),
            cost_eth: to_eth(project.cost),
            backers: project.backers,
            expires_at: project.expires_at,
            stored_status: stored.map(|c| c.status),
        })
    }

    fn check_duration(&self, days: i64) -> Result<()> {
        let limits = &self.config.limits;
        if days < i64::from(limits.min_duration_days) || days > i64::from(limits.max_duration_days) {
            return Err(AppError::Validation(format!(
                "duration must be between {} and {} days",
                limits.min_duration_days, limits.max_duration_days
            )));
        }
        Ok(())
    }

    /// Load a non-terminal campaign that `actor` owns or administers.
    async fn editable(&self, project_id: i64, actor: &str) -> Result<Campaign> {
        let campaign = db::get_campaign(&self.pool, project_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("campaign {project_id}")))?;
        if campaign.owner_address != actor && !users::is_admin(&self.pool, &self.config, actor).await? {
            return Err(AppError::Unauthorized(format!(
                "{actor} may not modify campaign {project_id}"
            )));
        }
        if campaign.status.is_terminal() {
            return Err(AppError::Validation(format!(
                "campaign {project_id} is {}",
                campaign.status
            )));
        }
        Ok(campaign)
    }
}

fn chain_id(project_id: i64) -> Result<u64> {
    u64::try_from(project_id)
        .map_err(|_| AppError::Validation(format!("invalid project id {project_id}")))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
