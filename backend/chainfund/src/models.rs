//! Domain records for campaigns, donations and users, plus the raw row
//! shapes they are read from.
//!
//! Amounts are held as wei ([`U256`]) in memory and as decimal ETH strings in
//! the database and on the wire.

use std::str::FromStr;

use alloy_primitives::utils::{format_ether, parse_ether};
use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, Result};
use crate::status::{CampaignStatus, OnChainStatus};

pub const SECONDS_PER_DAY: i64 = 86_400;

// ─────────────────────────────────────────────────────────
// Amount and address helpers
// ─────────────────────────────────────────────────────────

/// Render wei as a decimal ETH string.
pub fn to_eth(amount: U256) -> String {
    format_ether(amount)
}

/// Parse a decimal ETH string into wei.
pub fn parse_eth(raw: &str) -> Result<U256> {
    parse_ether(raw.trim()).map_err(|_| AppError::Validation(format!("invalid ETH amount '{raw}'")))
}

/// Parse a hex address and return it together with its lowercase form.
pub fn parse_address(raw: &str) -> Result<(Address, String)> {
    let address = Address::from_str(raw.trim())
        .map_err(|_| AppError::Validation(format!("invalid address '{raw}'")))?;
    Ok((address, lowercase(&address)))
}

pub fn lowercase(address: &Address) -> String {
    address.to_string().to_lowercase()
}

// ─────────────────────────────────────────────────────────
// Campaigns
// ─────────────────────────────────────────────────────────

/// One fundraising project as seen by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Campaign {
    pub project_id: i64,
    pub title: String,
    pub description: String,
    pub image_url: Option<String>,
    pub owner_address: String,
    pub target_amount: U256,
    pub raised_amount: U256,
    pub duration_days: i64,
    /// Only known when an on-chain snapshot was merged in.
    pub backers: Option<u64>,
    pub status: CampaignStatus,
    pub created_at: i64,
    pub expires_at: i64,
}

/// `campaigns` row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CampaignRow {
    pub project_id: i64,
    pub title: String,
    pub description: String,
    pub target_amount: String,
    pub raised_amount: String,
    pub duration_days: i64,
    pub image_url: Option<String>,
    pub owner_address: String,
    pub status: String,
    pub created_at: i64,
    pub expires_at: i64,
}

impl TryFrom<CampaignRow> for Campaign {
    type Error = AppError;

    fn try_from(row: CampaignRow) -> Result<Self> {
        Ok(Campaign {
            project_id: row.project_id,
            target_amount: stored_amount(&row.target_amount)?,
            raised_amount: stored_amount(&row.raised_amount)?,
            status: row.status.parse()?,
            title: row.title,
            description: row.description,
            image_url: row.image_url,
            owner_address: row.owner_address.to_lowercase(),
            duration_days: row.duration_days,
            backers: None,
            created_at: row.created_at,
            expires_at: row.expires_at,
        })
    }
}

fn stored_amount(raw: &str) -> Result<U256> {
    parse_ether(raw.trim()).map_err(|_| AppError::Decode(format!("bad stored amount '{raw}'")))
}

/// Fields for a new `campaigns` row.
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub project_id: i64,
    pub title: String,
    pub description: String,
    pub image_url: Option<String>,
    pub owner_address: String,
    pub target_amount: U256,
    pub duration_days: i64,
    pub created_at: i64,
    pub expires_at: i64,
}

/// Presentation fields an owner or admin may edit.
#[derive(Debug, Clone, Default)]
pub struct CampaignEdit {
    pub title: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub duration_days: Option<i64>,
    pub expires_at: Option<i64>,
}

/// API representation of a campaign.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignView {
    pub project_id: i64,
    pub title: String,
    pub description: String,
    pub image_url: Option<String>,
    pub owner_address: String,
    pub target_eth: String,
    pub raised_eth: String,
    /// Funding progress, capped at 100.
    pub progress: u8,
    pub backers: Option<u64>,
    pub duration_days: i64,
    pub days_left: i64,
    pub status: CampaignStatus,
    pub created_at: i64,
    pub expires_at: i64,
}

impl CampaignView {
    pub fn new(campaign: &Campaign, now: i64) -> Self {
        CampaignView {
            project_id: campaign.project_id,
            title: campaign.title.clone(),
            description: campaign.description.clone(),
            image_url: campaign.image_url.clone(),
            owner_address: campaign.owner_address.clone(),
            target_eth: to_eth(campaign.target_amount),
            raised_eth: to_eth(campaign.raised_amount),
            progress: progress(campaign.raised_amount, campaign.target_amount),
            backers: campaign.backers,
            duration_days: campaign.duration_days,
            days_left: days_left(campaign.expires_at, now),
            status: campaign.status,
            created_at: campaign.created_at,
            expires_at: campaign.expires_at,
        }
    }
}

/// Percentage of the target raised, capped at 100. Zero target reads as 0.
pub fn progress(raised: U256, target: U256) -> u8 {
    if target.is_zero() {
        return 0;
    }
    let pct = raised.saturating_mul(U256::from(100u64)) / target;
    if pct >= U256::from(100u64) {
        100
    } else {
        u64::try_from(pct).map(|p| p as u8).unwrap_or(100)
    }
}

/// Whole days until expiry, rounded up, never negative.
pub fn days_left(expires_at: i64, now: i64) -> i64 {
    let remaining = expires_at - now;
    if remaining <= 0 {
        0
    } else {
        (remaining + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY
    }
}

// ─────────────────────────────────────────────────────────
// On-chain projects
// ─────────────────────────────────────────────────────────

/// Decoded `getProject` / `getProjects` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainProject {
    pub id: u64,
    pub owner: String,
    pub title: String,
    pub description: String,
    pub image_url: String,
    pub cost: U256,
    pub raised: U256,
    pub created_at: i64,
    pub expires_at: i64,
    pub backers: u64,
    pub status: OnChainStatus,
}

/// Arguments for `createProject`.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub title: String,
    pub description: String,
    pub image_url: String,
    pub cost: U256,
    pub expires_at: i64,
}

/// Arguments for `updateProject`.
#[derive(Debug, Clone)]
pub struct ProjectEdit {
    pub title: String,
    pub description: String,
    pub image_url: String,
    pub expires_at: i64,
}

// ─────────────────────────────────────────────────────────
// Donations
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DonationStatus {
    Pending,
    Confirmed,
    Failed,
}

impl DonationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for DonationStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            _ => Err(AppError::Decode(format!("unknown donation status '{s}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Donation {
    pub id: i64,
    pub project_id: i64,
    pub donor_address: String,
    pub amount: U256,
    pub transaction_hash: String,
    pub status: DonationStatus,
    pub donated_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DonationRow {
    pub id: i64,
    pub project_id: i64,
    pub donor_address: String,
    pub amount_eth: String,
    pub transaction_hash: String,
    pub status: String,
    pub donated_at: i64,
}

impl TryFrom<DonationRow> for Donation {
    type Error = AppError;

    fn try_from(row: DonationRow) -> Result<Self> {
        Ok(Donation {
            id: row.id,
            project_id: row.project_id,
            amount: stored_amount(&row.amount_eth)?,
            status: row.status.parse()?,
            donor_address: row.donor_address,
            transaction_hash: row.transaction_hash,
            donated_at: row.donated_at,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DonationView {
    pub id: i64,
    pub project_id: i64,
    pub donor_address: String,
    pub amount_eth: String,
    pub transaction_hash: String,
    pub status: DonationStatus,
    pub donated_at: i64,
}

impl From<&Donation> for DonationView {
    fn from(d: &Donation) -> Self {
        DonationView {
            id: d.id,
            project_id: d.project_id,
            donor_address: d.donor_address.clone(),
            amount_eth: to_eth(d.amount),
            transaction_hash: d.transaction_hash.clone(),
            status: d.status,
            donated_at: d.donated_at,
        }
    }
}

/// A donation joined with a few fields of the campaign it went to.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DonationWithCampaign {
    pub id: i64,
    pub project_id: i64,
    pub donor_address: String,
    pub amount_eth: String,
    pub transaction_hash: String,
    pub status: String,
    pub donated_at: i64,
    pub campaign_title: Option<String>,
    pub campaign_image_url: Option<String>,
    pub campaign_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopDonor {
    pub address: String,
    pub total_eth: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DonationStats {
    pub total_donations: u64,
    pub total_eth: String,
    pub average_eth: String,
    pub unique_donors: u64,
}

// ─────────────────────────────────────────────────────────
// Users
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub address: String,
    pub nonce: Option<String>,
    pub is_admin: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_capped() {
        let five = parse_eth("5").unwrap();
        assert_eq!(progress(parse_eth("2.5").unwrap(), five), 50);
        assert_eq!(progress(parse_eth("12").unwrap(), five), 100);
        assert_eq!(progress(five, U256::ZERO), 0);
    }

    #[test]
    fn days_left_rounds_up() {
        assert_eq!(days_left(1_000 + SECONDS_PER_DAY + 1, 1_000), 2);
        assert_eq!(days_left(1_000 + SECONDS_PER_DAY, 1_000), 1);
        assert_eq!(days_left(500, 1_000), 0);
    }

    #[test]
    fn addresses_are_lowercased() {
        let (_, lower) = parse_address("0xF39Fd6e51aad88F6F4ce6aB8827279cffFb92266").unwrap();
        assert_eq!(lower, "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266");
        assert!(parse_address("not-an-address").is_err());
    }

    #[test]
    fn campaign_row_decodes_legacy_status() {
        let row = CampaignRow {
            project_id: 7,
            title: "Flood relief".into(),
            description: "".into(),
            target_amount: "5".into(),
            raised_amount: "2.5".into(),
            duration_days: 10,
            image_url: None,
            owner_address: "0xABC".into(),
            status: "OPEN".into(),
            created_at: 1,
            expires_at: 2,
        };
        let campaign = Campaign::try_from(row).unwrap();
        assert_eq!(campaign.status, CampaignStatus::Active);
        assert_eq!(campaign.raised_amount, parse_eth("2.5").unwrap());
        assert_eq!(campaign.owner_address, "0xabc");
    }
}
