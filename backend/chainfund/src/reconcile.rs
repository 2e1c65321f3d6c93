//! Status reconciliation between the contract and the off-chain store.
//!
//! A pass loads every cached campaign, overlays the latest on-chain snapshot
//! when the chain is reachable, re-derives each non-terminal status with
//! [`resolve_status`] and writes back the ones that drifted. The returned
//! campaigns always carry the derived status, whether or not the write-back
//! succeeded.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::contract::ProjectReader;
use crate::errors::Result;
use crate::models::{Campaign, ChainProject};
use crate::status::{resolve_status, CampaignStatus};

/// Off-chain campaign cache, as consumed by reconciliation.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn fetch_campaigns(&self) -> Result<Vec<Campaign>>;
    async fn fetch_campaign(&self, project_id: i64) -> Result<Option<Campaign>>;
    /// Persist only the `status` column of one campaign.
    async fn write_status(&self, project_id: i64, status: CampaignStatus) -> Result<()>;
}

/// Where the numeric fields of a pass came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Cached rows overlaid with a fresh on-chain snapshot.
    Chain,
    /// The chain could not be read; cached numbers were used.
    Cache,
}

/// Result of one pass.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub campaigns: Vec<Campaign>,
    pub source: Source,
    /// Status writes issued.
    pub writes: usize,
    /// Writes that failed and were skipped.
    pub failed_writes: usize,
}

/// Overlay an on-chain snapshot on a cached row.
///
/// Chain-owned numbers (`raised`, `cost`, `expiresAt`, `backers`, `owner`)
/// win; presentation fields and creation time stay from the cache. A
/// terminal cached status is kept; otherwise a terminal on-chain status is
/// adopted.
pub fn merge(cached: Campaign, chain: Option<&ChainProject>) -> Campaign {
    let Some(project) = chain else {
        return cached;
    };

    let status = if cached.status.is_terminal() {
        cached.status
    } else {
        project.status.terminal().unwrap_or(cached.status)
    };

    Campaign {
        target_amount: project.cost,
        raised_amount: project.raised,
        expires_at: project.expires_at,
        backers: Some(project.backers),
        owner_address: project.owner.clone(),
        status,
        ..cached
    }
}

/// The status `campaign` should have at `now`, given what is stored.
///
/// Returns `stored` unchanged when it is terminal.
pub fn settle(campaign: &Campaign, stored: CampaignStatus, now: i64) -> CampaignStatus {
    if stored.is_terminal() {
        stored
    } else if campaign.status.is_terminal() {
        campaign.status
    } else {
        resolve_status(
            campaign.raised_amount,
            campaign.target_amount,
            campaign.expires_at,
            now,
        )
    }
}

#[derive(Clone)]
pub struct ReconciliationService {
    store: Arc<dyn CampaignStore>,
    chain: Arc<dyn ProjectReader>,
}

impl ReconciliationService {
    pub fn new(store: Arc<dyn CampaignStore>, chain: Arc<dyn ProjectReader>) -> Self {
        Self { store, chain }
    }

    /// Reconcile every cached campaign.
    ///
    /// Fails only when the store cannot be read, in which case nothing is
    /// written.
    pub async fn reconcile(&self, now: i64) -> Result<Reconciliation> {
        let cached = self.store.fetch_campaigns().await?;

        let (snapshot, source) = match self.chain.get_projects().await {
            Ok(projects) => {
                let by_id: HashMap<i64, ChainProject> = projects
                    .into_iter()
                    .filter_map(|p| i64::try_from(p.id).ok().map(|id| (id, p)))
                    .collect();
                (by_id, Source::Chain)
            }
            Err(e) => {
                warn!("On-chain fetch failed, reconciling from cache: {e}");
                (HashMap::new(), Source::Cache)
            }
        };

        let mut out = Reconciliation {
            campaigns: Vec::with_capacity(cached.len()),
            source,
            writes: 0,
            failed_writes: 0,
        };

        for row in cached {
            let stored = row.status;
            let chain = snapshot.get(&row.project_id);
            if source == Source::Chain && chain.is_none() {
                debug!("Campaign {} has no on-chain project", row.project_id);
            }
            let campaign = self.settle_one(merge(row, chain), stored, now, &mut out).await;
            out.campaigns.push(campaign);
        }

        info!(
            "Reconciled {} campaigns from {:?}: {} writes, {} failed",
            out.campaigns.len(),
            out.source,
            out.writes,
            out.failed_writes
        );
        Ok(out)
    }

    /// Reconcile a single campaign. `Ok(None)` when it is not cached.
    pub async fn reconcile_campaign(&self, project_id: i64, now: i64) -> Result<Option<Campaign>> {
        let Some(row) = self.store.fetch_campaign(project_id).await? else {
            return Ok(None);
        };

        let chain = match u64::try_from(project_id) {
            Ok(id) => match self.chain.get_project(id).await {
                Ok(project) => Some(project),
                Err(e) => {
                    warn!("On-chain fetch of project {project_id} failed, using cache: {e}");
                    None
                }
            },
            Err(_) => None,
        };

        let stored = row.status;
        let mut tally = Reconciliation {
            campaigns: Vec::new(),
            source: if chain.is_some() { Source::Chain } else { Source::Cache },
            writes: 0,
            failed_writes: 0,
        };
        let campaign = self
            .settle_one(merge(row, chain.as_ref()), stored, now, &mut tally)
            .await;
        Ok(Some(campaign))
    }

    async fn settle_one(
        &self,
        mut campaign: Campaign,
        stored: CampaignStatus,
        now: i64,
        tally: &mut Reconciliation,
    ) -> Campaign {
        let target = settle(&campaign, stored, now);
        campaign.status = target;

        if target != stored {
            tally.writes += 1;
            match self.store.write_status(campaign.project_id, target).await {
                Ok(()) => info!(
                    "Campaign {} status {stored} -> {target}",
                    campaign.project_id
                ),
                Err(e) => {
                    tally.failed_writes += 1;
                    warn!(
                        "Failed to persist status {target} for campaign {}: {e}",
                        campaign.project_id
                    );
                }
            }
        }
        campaign
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parse_eth;
    use crate::status::OnChainStatus;
    use crate::testutil::{campaign, chain_project, FakeChain, MemoryStore};

    const NOW: i64 = 1_700_000_000;

    fn service(store: &Arc<MemoryStore>, chain: &Arc<FakeChain>) -> ReconciliationService {
        ReconciliationService::new(store.clone(), chain.clone())
    }

    #[tokio::test]
    async fn goal_met_before_expiry_is_approved_with_one_write() {
        let store = Arc::new(MemoryStore::with(vec![campaign(
            1,
            "5",
            "5",
            NOW + 1000,
            CampaignStatus::Active,
        )]));
        let chain = Arc::new(FakeChain::unreachable());

        let result = service(&store, &chain).reconcile(NOW).await.unwrap();
        assert_eq!(result.campaigns[0].status, CampaignStatus::Approved);
        assert_eq!(store.writes(), vec![(1, CampaignStatus::Approved)]);
        assert_eq!(result.writes, 1);
    }

    #[tokio::test]
    async fn unmet_goal_after_expiry_is_expired() {
        let store = Arc::new(MemoryStore::with(vec![campaign(
            2,
            "3",
            "5",
            NOW - 1,
            CampaignStatus::Active,
        )]));
        let chain = Arc::new(FakeChain::unreachable());

        let result = service(&store, &chain).reconcile(NOW).await.unwrap();
        assert_eq!(result.campaigns[0].status, CampaignStatus::Expired);
        assert_eq!(store.writes(), vec![(2, CampaignStatus::Expired)]);
    }

    #[tokio::test]
    async fn terminal_statuses_are_never_overwritten() {
        let store = Arc::new(MemoryStore::with(vec![
            campaign(1, "5", "5", NOW + 1000, CampaignStatus::Deleted),
            campaign(2, "0", "5", NOW - 1, CampaignStatus::Paidout),
            campaign(3, "9", "5", NOW + 1, CampaignStatus::Reverted),
        ]));
        let chain = Arc::new(FakeChain::with(vec![
            chain_project(1, "5", "5", NOW + 1000, OnChainStatus::Open),
            chain_project(2, "0", "5", NOW - 1, OnChainStatus::Approved),
            chain_project(3, "9", "5", NOW + 1, OnChainStatus::Deleted),
        ]));

        let result = service(&store, &chain).reconcile(NOW).await.unwrap();
        let statuses: Vec<_> = result.campaigns.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![
                CampaignStatus::Deleted,
                CampaignStatus::Paidout,
                CampaignStatus::Reverted
            ]
        );
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn writes_only_for_drifted_campaigns() {
        let store = Arc::new(MemoryStore::with(vec![
            campaign(1, "1", "5", NOW + 100, CampaignStatus::Active),
            campaign(2, "5", "5", NOW + 100, CampaignStatus::Active),
            campaign(3, "1", "5", NOW - 100, CampaignStatus::Expired),
            campaign(4, "1", "5", NOW - 100, CampaignStatus::Active),
            campaign(5, "6", "5", NOW + 100, CampaignStatus::Approved),
        ]));
        let chain = Arc::new(FakeChain::unreachable());

        let result = service(&store, &chain).reconcile(NOW).await.unwrap();
        assert_eq!(result.campaigns.len(), 5);
        assert_eq!(result.writes, 2);
        assert_eq!(
            store.writes(),
            vec![(2, CampaignStatus::Approved), (4, CampaignStatus::Expired)]
        );
    }

    #[tokio::test]
    async fn store_failure_returns_error_without_writes() {
        let store = Arc::new(MemoryStore::failing_reads());
        let chain = Arc::new(FakeChain::with(vec![chain_project(
            1,
            "5",
            "5",
            NOW + 1,
            OnChainStatus::Open,
        )]));

        assert!(service(&store, &chain).reconcile(NOW).await.is_err());
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn chain_failure_falls_back_to_cached_numbers() {
        let store = Arc::new(MemoryStore::with(vec![
            campaign(1, "1", "5", NOW + 100, CampaignStatus::Active),
            campaign(2, "1", "5", NOW - 100, CampaignStatus::Active),
            campaign(3, "8", "5", NOW + 100, CampaignStatus::Active),
        ]));
        let chain = Arc::new(FakeChain::unreachable());

        let result = service(&store, &chain).reconcile(NOW).await.unwrap();
        assert_eq!(result.source, Source::Cache);
        let statuses: Vec<_> = result.campaigns.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![
                CampaignStatus::Active,
                CampaignStatus::Expired,
                CampaignStatus::Approved
            ]
        );
    }

    #[tokio::test]
    async fn chain_numbers_take_precedence_over_cache() {
        let store = Arc::new(MemoryStore::with(vec![campaign(
            1,
            "1",
            "5",
            NOW + 100,
            CampaignStatus::Active,
        )]));
        let chain = Arc::new(FakeChain::with(vec![chain_project(
            1,
            "5.5",
            "5",
            NOW + 100,
            OnChainStatus::Approved,
        )]));

        let result = service(&store, &chain).reconcile(NOW).await.unwrap();
        let merged = &result.campaigns[0];
        assert_eq!(result.source, Source::Chain);
        assert_eq!(merged.raised_amount, parse_eth("5.5").unwrap());
        assert_eq!(merged.backers, Some(3));
        assert_eq!(merged.title, "Campaign 1");
        assert_eq!(merged.status, CampaignStatus::Approved);
        assert_eq!(store.writes(), vec![(1, CampaignStatus::Approved)]);
    }

    #[tokio::test]
    async fn terminal_chain_status_is_synced_into_cache() {
        let store = Arc::new(MemoryStore::with(vec![campaign(
            1,
            "5",
            "5",
            NOW + 100,
            CampaignStatus::Approved,
        )]));
        let chain = Arc::new(FakeChain::with(vec![chain_project(
            1,
            "5",
            "5",
            NOW + 100,
            OnChainStatus::Paidout,
        )]));

        let result = service(&store, &chain).reconcile(NOW).await.unwrap();
        assert_eq!(result.campaigns[0].status, CampaignStatus::Paidout);
        assert_eq!(store.writes(), vec![(1, CampaignStatus::Paidout)]);
    }

    #[tokio::test]
    async fn failed_write_does_not_stop_the_pass() {
        let store = Arc::new(
            MemoryStore::with(vec![
                campaign(1, "5", "5", NOW + 100, CampaignStatus::Active),
                campaign(2, "1", "5", NOW - 100, CampaignStatus::Active),
            ])
            .failing_writes_for(1),
        );
        let chain = Arc::new(FakeChain::unreachable());

        let result = service(&store, &chain).reconcile(NOW).await.unwrap();
        assert_eq!(result.campaigns[0].status, CampaignStatus::Approved);
        assert_eq!(result.campaigns[1].status, CampaignStatus::Expired);
        assert_eq!(result.writes, 2);
        assert_eq!(result.failed_writes, 1);
        assert_eq!(store.writes(), vec![(2, CampaignStatus::Expired)]);
    }

    #[tokio::test]
    async fn single_campaign_reconcile() {
        let store = Arc::new(MemoryStore::with(vec![campaign(
            7,
            "0",
            "5",
            NOW + 100,
            CampaignStatus::Active,
        )]));
        let chain = Arc::new(FakeChain::with(vec![chain_project(
            7,
            "5",
            "5",
            NOW + 100,
            OnChainStatus::Open,
        )]));
        let service = service(&store, &chain);

        let campaign = service.reconcile_campaign(7, NOW).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Approved);
        assert!(service.reconcile_campaign(8, NOW).await.unwrap().is_none());
    }

    #[test]
    fn merge_without_chain_keeps_cache() {
        let cached = campaign(1, "1", "5", NOW, CampaignStatus::Active);
        assert_eq!(merge(cached.clone(), None), cached);
    }
}
