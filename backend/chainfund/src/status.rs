//! Campaign status vocabulary and derivation.
//!
//! There are two status enumerations in play:
//!
//! - [`OnChainStatus`]: the five-state enum stored by the contract
//!   (`OPEN`, `APPROVED`, `REVERTED`, `DELETED`, `PAIDOUT`).
//! - [`CampaignStatus`]: the canonical status shown to users and stored in
//!   the `campaigns.status` column.
//!
//! ```text
//! Active ──► Expired        (time passes, goal unmet)
//! Active ──► Approved       (goal met before expiry)
//! Approved ──► Paidout      (explicit payout)
//! Active/Approved/Expired ──► Deleted
//! Active/Approved ──► Reverted
//! ```
//!
//! `Deleted`, `Paidout` and `Reverted` are sticky: [`resolve_status`] is never
//! consulted again once a campaign reaches one of them. `Expired` is only
//! soft-terminal and stays governed by [`resolve_status`].

use std::fmt;
use std::str::FromStr;

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Canonical campaign status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    /// Accepting donations, goal not reached yet.
    Active,
    /// Deadline passed with the goal unmet.
    Expired,
    /// Goal met while the campaign window is still open.
    Approved,
    /// Cancelled or failed by an admin / contract action.
    Reverted,
    /// Removed by an admin. Rows are never physically deleted.
    Deleted,
    /// Funds were paid out to the owner.
    Paidout,
}

impl CampaignStatus {
    /// Terminal states are never overwritten by re-derivation.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Reverted | Self::Deleted | Self::Paidout)
    }

    /// Goal-reached states, counted as successful in statistics.
    pub fn is_successful(self) -> bool {
        matches!(self, Self::Approved | Self::Paidout)
    }

    /// Identifier stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Approved => "approved",
            Self::Reverted => "reverted",
            Self::Deleted => "deleted",
            Self::Paidout => "paidout",
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = AppError;

    /// Accepts the canonical identifiers plus the legacy labels older rows
    /// were written with. "Goal Met", "Overfunded" and "SUCCESSFUL" all mean
    /// the goal was reached and collapse onto `Approved`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalised = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        match normalised.as_str() {
            "active" | "open" => Ok(Self::Active),
            "expired" | "closed" => Ok(Self::Expired),
            "approved" | "goal_met" | "overfunded" | "successful" => Ok(Self::Approved),
            "reverted" => Ok(Self::Reverted),
            "deleted" => Ok(Self::Deleted),
            "paidout" | "paid_out" => Ok(Self::Paidout),
            _ => Err(AppError::Decode(format!("unknown campaign status '{s}'"))),
        }
    }
}

/// Status enum as stored by the crowdfunding contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnChainStatus {
    Open,
    Approved,
    Reverted,
    Deleted,
    Paidout,
}

impl OnChainStatus {
    /// The canonical status this on-chain value pins, if any.
    ///
    /// `OPEN` pins nothing: whether an open project is active or expired is
    /// decided by [`resolve_status`].
    pub fn pinned(self) -> Option<CampaignStatus> {
        match self {
            Self::Open => None,
            Self::Approved => Some(CampaignStatus::Approved),
            Self::Reverted => Some(CampaignStatus::Reverted),
            Self::Deleted => Some(CampaignStatus::Deleted),
            Self::Paidout => Some(CampaignStatus::Paidout),
        }
    }

    /// The pinned status when it is terminal.
    pub fn terminal(self) -> Option<CampaignStatus> {
        self.pinned().filter(|s| s.is_terminal())
    }
}

impl TryFrom<u8> for OnChainStatus {
    type Error = AppError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Open),
            1 => Ok(Self::Approved),
            2 => Ok(Self::Reverted),
            3 => Ok(Self::Deleted),
            4 => Ok(Self::Paidout),
            other => Err(AppError::Decode(format!("unknown on-chain status {other}"))),
        }
    }
}

/// Derive the displayed status of a non-terminal campaign.
///
/// First match wins:
/// 1. expired (`now >= expires_at`) with the goal unmet → `Expired`
/// 2. goal met (`raised >= target`) and `now <= expires_at` → `Approved`
/// 3. otherwise → `Active`
///
/// A zero target is never fundable. Never returns a terminal state.
pub fn resolve_status(raised: U256, target: U256, expires_at: i64, now: i64) -> CampaignStatus {
    let expired = now >= expires_at;
    if target.is_zero() {
        return if expired {
            CampaignStatus::Expired
        } else {
            CampaignStatus::Active
        };
    }

    let goal_met = raised >= target;
    if expired && !goal_met {
        CampaignStatus::Expired
    } else if goal_met && now <= expires_at {
        CampaignStatus::Approved
    } else {
        CampaignStatus::Active
    }
}
