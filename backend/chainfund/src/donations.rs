//! Donations: sending `backProject`, tracking the transaction and the
//! aggregate queries built on confirmed donations.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use alloy_primitives::{B256, U256};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::Config;
use crate::contract::{ProjectReader, ProjectWriter};
use crate::db;
use crate::errors::{AppError, Result};
use crate::models::{
    parse_address, parse_eth, to_eth, Campaign, Donation, DonationStats, DonationStatus,
    DonationView, DonationWithCampaign, TopDonor,
};
use crate::reconcile::ReconciliationService;

#[derive(Debug, Clone, Deserialize)]
pub struct DonateRequest {
    pub from: String,
    pub amount_eth: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct DonationOutcome {
    pub donation: Donation,
    /// The campaign after the donation was reconciled.
    pub campaign: Campaign,
}

/// Tally of one [`DonationService::resolve_pending`] sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingResolution {
    pub confirmed: usize,
    pub failed: usize,
    /// Not mined yet, or the lookup failed.
    pub still_pending: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectDonationSummary {
    pub project_id: i64,
    pub total_eth: String,
    pub donor_count: i64,
    /// Set when the caller asked about a specific donor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_donated: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DonorSummary {
    pub address: String,
    pub total_eth: String,
    pub campaigns_supported: i64,
}

/// Sum confirmed amounts per donor and return the `limit` biggest.
pub fn rank_donors(amounts: Vec<(String, U256)>, limit: usize) -> Vec<TopDonor> {
    let mut totals: HashMap<String, U256> = HashMap::new();
    for (donor, amount) in amounts {
        let total = totals.entry(donor).or_insert(U256::ZERO);
        *total = total.saturating_add(amount);
    }

    let mut ranked: Vec<(String, U256)> = totals.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .take(limit)
        .map(|(address, total)| TopDonor {
            address,
            total_eth: to_eth(total),
        })
        .collect()
}

pub fn summarize(amounts: &[(String, U256)]) -> DonationStats {
    let total = amounts
        .iter()
        .fold(U256::ZERO, |acc, (_, a)| acc.saturating_add(*a));
    let count = amounts.len() as u64;
    let average = if count == 0 {
        U256::ZERO
    } else {
        total / U256::from(count)
    };
    let mut donors: Vec<&str> = amounts.iter().map(|(d, _)| d.as_str()).collect();
    donors.sort_unstable();
    donors.dedup();

    DonationStats {
        total_donations: count,
        total_eth: to_eth(total),
        average_eth: to_eth(average),
        unique_donors: donors.len() as u64,
    }
}

#[derive(Clone)]
pub struct DonationService {
    pool: SqlitePool,
    config: Arc<Config>,
    reader: Arc<dyn ProjectReader>,
    writer: Arc<dyn ProjectWriter>,
    reconciler: ReconciliationService,
}

impl DonationService {
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

    /// Back a campaign and wait for the transaction to settle.
    ///
    /// The donation row is written as pending as soon as the transaction
    /// hash is known. A reverted transaction marks it failed; a receipt
    /// timeout leaves it pending for [`Self::resolve_pending`] to settle.
    pub async fn donate(&self, project_id: i64, req: &DonateRequest, now: i64) -> Result<DonationOutcome> {
        if let Err(e) = self.resolve_pending(now).await {
            warn!("Could not settle pending donations: {e}");
        }

        let (from, donor) = parse_address(&req.from)?;
        let amount = parse_eth(&req.amount_eth)?;
        if amount.is_zero() {
            return Err(AppError::Validation("donation must be positive".to_string()));
        }
        if amount < self.config.limits.min_donation {
            return Err(AppError::Validation(format!(
                "minimum donation is {} ETH",
                to_eth(self.config.limits.min_donation)
            )));
        }

        let campaign = db::get_campaign(&self.pool, project_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("campaign {project_id}")))?;
        if campaign.status.is_terminal() {
            return Err(AppError::Validation(format!(
                "campaign {project_id} is {}",
                campaign.status
            )));
        }
        if now >= campaign.expires_at {
            return Err(AppError::Validation(format!("campaign {project_id} has expired")));
        }
        let id = u64::try_from(project_id)
            .map_err(|_| AppError::Validation(format!("invalid project id {project_id}")))?;

        let tx_hash = self.writer.send_back_project(from, id, amount).await?;
        let hash = tx_hash.to_string();
        let mut donation = db::insert_donation(
            &self.pool,
            project_id,
            &donor,
            amount,
            &hash,
            DonationStatus::Pending,
            now,
        )
        .await?;

        let receipt = match self.writer.wait_for_receipt(tx_hash).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!("Donation {hash} to campaign {project_id} left pending: {e}");
                return Err(e);
            }
        };
        if !receipt.success {
            db::set_donation_status(&self.pool, &hash, DonationStatus::Failed).await?;
            warn!("Donation {hash} to campaign {project_id} reverted");
            return Err(AppError::Reverted(hash));
        }
        let campaign = self.record_confirmed(&donation, now).await?;
        donation.status = DonationStatus::Confirmed;
        Ok(DonationOutcome { donation, campaign })
    }

    /// Look up the receipt of every pending donation once and settle the
    /// ones that have been mined.
    pub async fn resolve_pending(&self, now: i64) -> Result<PendingResolution> {
        let mut tally = PendingResolution::default();

        for donation in db::pending_donations(&self.pool).await? {
            let hash = &donation.transaction_hash;
            let receipt = match B256::from_str(hash) {
                Ok(tx_hash) => self.writer.receipt(tx_hash).await,
                Err(_) => Err(AppError::Decode(format!("bad transaction hash '{hash}'"))),
            };
            match receipt {
                Ok(Some(r)) if r.success => {
                    self.record_confirmed(&donation, now).await?;
                    tally.confirmed += 1;
                }
                Ok(Some(_)) => {
                    db::set_donation_status(&self.pool, hash, DonationStatus::Failed).await?;
                    warn!("Pending donation {hash} reverted");
                    tally.failed += 1;
                }
                Ok(None) => tally.still_pending += 1,
                Err(e) => {
                    warn!("Receipt lookup for pending donation {hash} failed: {e}");
                    tally.still_pending += 1;
                }
            }
        }

        if tally.confirmed + tally.failed > 0 {
            info!(
                "Settled pending donations: {} confirmed, {} failed, {} still pending",
                tally.confirmed, tally.failed, tally.still_pending
            );
        }
        Ok(tally)
    }

    /// Mark a mined donation confirmed, refresh the campaign's raised amount
    /// and reconcile it.
    async fn record_confirmed(&self, donation: &Donation, now: i64) -> Result<Campaign> {
        let project_id = donation.project_id;
        let hash = &donation.transaction_hash;
        db::set_donation_status(&self.pool, hash, DonationStatus::Confirmed).await?;
        info!(
            "Donation of {} ETH to campaign {project_id} confirmed ({hash})",
            to_eth(donation.amount)
        );

        let chain = match u64::try_from(project_id) {
            Ok(id) => self.reader.get_project(id).await,
            Err(_) => Err(AppError::Validation(format!("invalid project id {project_id}"))),
        };
        match chain {
            Ok(project) => db::set_raised_amount(&self.pool, project_id, project.raised).await?,
            Err(e) => {
                warn!("Could not refresh raised amount of campaign {project_id}, incrementing cache: {e}");
                db::add_raised_amount(&self.pool, project_id, donation.amount).await?;
            }
        }

        self.reconciler
            .reconcile_campaign(project_id, now)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("campaign {project_id}")))
    }

    pub async fn for_project(&self, project_id: i64, page: &PageQuery) -> Result<Vec<DonationView>> {
        let (limit, offset) = self.page(page);
        let donations = db::donations_by_project(&self.pool, project_id, limit, offset).await?;
        Ok(donations.iter().map(DonationView::from).collect())
    }

    pub async fn for_donor(&self, address: &str, page: &PageQuery) -> Result<Vec<DonationWithCampaign>> {
        let (_, donor) = parse_address(address)?;
        let (limit, offset) = self.page(page);
        db::donations_by_donor(&self.pool, &donor, limit, offset).await
    }

    pub async fn get(&self, id: i64) -> Result<DonationWithCampaign> {
        db::get_donation(&self.pool, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("donation {id}")))
    }

    pub async fn project_summary(&self, project_id: i64, donor: Option<&str>) -> Result<ProjectDonationSummary> {
        let has_donated = match donor {
            Some(raw) => {
                let (_, donor) = parse_address(raw)?;
                Some(db::has_donated(&self.pool, project_id, &donor).await?)
            }
            None => None,
        };
        Ok(ProjectDonationSummary {
            project_id,
            total_eth: to_eth(db::total_for_project(&self.pool, project_id).await?),
            donor_count: db::donor_count_for_project(&self.pool, project_id).await?,
            has_donated,
        })
    }

    pub async fn donor_summary(&self, address: &str) -> Result<DonorSummary> {
        let (_, donor) = parse_address(address)?;
        Ok(DonorSummary {
            total_eth: to_eth(db::total_for_donor(&self.pool, &donor).await?),
            campaigns_supported: db::project_count_for_donor(&self.pool, &donor).await?,
            address: donor,
        })
    }

    pub async fn top_donors(&self, limit: Option<usize>) -> Result<Vec<TopDonor>> {
        let amounts = db::confirmed_amounts(&self.pool).await?;
        Ok(rank_donors(amounts, limit.unwrap_or(10).max(1)))
    }

    pub async fn stats(&self) -> Result<DonationStats> {
        Ok(summarize(&db::confirmed_amounts(&self.pool).await?))
    }

    fn page(&self, page: &PageQuery) -> (i64, i64) {
        let limit = page
            .limit
            .unwrap_or(self.config.limits.items_per_page)
            .max(1);
        let offset = page.offset.unwrap_or(0);
        (
            i64::try_from(limit).unwrap_or(i64::MAX),
            i64::try_from(offset).unwrap_or(0),
        )
    }
}
