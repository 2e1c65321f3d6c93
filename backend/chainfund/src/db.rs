//! Database layer: migrations and queries over `campaigns`, `donations`
//! and `users`.

use alloy_primitives::U256;
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;

use crate::errors::{AppError, Result};
use crate::models::{
    parse_eth, to_eth, Campaign, CampaignEdit, CampaignRow, Donation, DonationRow,
    DonationStatus, DonationWithCampaign, NewCampaign, User,
};
use crate::reconcile::CampaignStore;
use crate::status::CampaignStatus;

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    // Create the file on first start.
    let url = if url.contains('?') || url.contains(":memory:") {
        url
    } else {
        format!("{url}?mode=rwc")
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations applied successfully");
    Ok(())
}

fn sum_amounts(rows: &[(String,)]) -> Result<U256> {
    rows.iter().try_fold(U256::ZERO, |acc, (raw,)| {
        parse_eth(raw)
            .map(|v| acc.saturating_add(v))
            .map_err(|_| AppError::Decode(format!("bad stored amount '{raw}'")))
    })
}

// ─────────────────────────────────────────────────────────
// Campaigns
// ─────────────────────────────────────────────────────────

const CAMPAIGN_COLUMNS: &str = "project_id, title, description, target_amount, raised_amount, \
     duration_days, image_url, owner_address, status, created_at, expires_at";

pub async fn insert_campaign(pool: &SqlitePool, c: &NewCampaign) -> Result<Campaign> {
    sqlx::query(
        r#"
        INSERT INTO campaigns
            (project_id, title, description, target_amount, raised_amount, duration_days,
             image_url, owner_address, status, created_at, expires_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
    )
    .bind(c.project_id)
    .bind(&c.title)
    .bind(&c.description)
    .bind(to_eth(c.target_amount))
    .bind(to_eth(U256::ZERO))
    .bind(c.duration_days)
    .bind(&c.image_url)
    .bind(&c.owner_address)
    .bind(CampaignStatus::Active.as_str())
    .bind(c.created_at)
    .bind(c.expires_at)
    .execute(pool)
    .await?;

    get_campaign(pool, c.project_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("campaign {}", c.project_id)))
}

pub async fn get_campaign(pool: &SqlitePool, project_id: i64) -> Result<Option<Campaign>> {
    let row = sqlx::query_as::<_, CampaignRow>(&format!(
        "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE project_id = ?1"
    ))
    .bind(project_id)
    .fetch_optional(pool)
    .await?;
    row.map(Campaign::try_from).transpose()
}

/// All campaigns, newest first.
pub async fn list_campaigns(pool: &SqlitePool) -> Result<Vec<Campaign>> {
    let rows = sqlx::query_as::<_, CampaignRow>(&format!(
        "SELECT {CAMPAIGN_COLUMNS} FROM campaigns ORDER BY created_at DESC, project_id DESC"
    ))
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Campaign::try_from).collect()
}

/// Returns `false` when no row matched.
pub async fn update_campaign_status(
    pool: &SqlitePool,
    project_id: i64,
    status: CampaignStatus,
) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE campaigns SET status = ?1, updated_at = strftime('%s', 'now') WHERE project_id = ?2",
    )
    .bind(status.as_str())
    .bind(project_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

/// Apply the `Some` fields of `edit`.
pub async fn update_campaign_fields(
    pool: &SqlitePool,
    project_id: i64,
    edit: &CampaignEdit,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE campaigns SET
            title         = COALESCE(?1, title),
            description   = COALESCE(?2, description),
            image_url     = COALESCE(?3, image_url),
            duration_days = COALESCE(?4, duration_days),
            expires_at    = COALESCE(?5, expires_at),
            updated_at    = strftime('%s', 'now')
        WHERE project_id = ?6
        "#,
    )
    .bind(&edit.title)
    .bind(&edit.description)
    .bind(&edit.image_url)
    .bind(edit.duration_days)
    .bind(edit.expires_at)
    .bind(project_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_raised_amount(pool: &SqlitePool, project_id: i64, raised: U256) -> Result<()> {
    sqlx::query(
        "UPDATE campaigns SET raised_amount = ?1, updated_at = strftime('%s', 'now') WHERE project_id = ?2",
    )
    .bind(to_eth(raised))
    .bind(project_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Increment the cached raised amount (used when the chain cannot be read).
pub async fn add_raised_amount(pool: &SqlitePool, project_id: i64, amount: U256) -> Result<U256> {
    let mut tx = pool.begin().await?;
    let row: Option<(String,)> =
        sqlx::query_as("SELECT raised_amount FROM campaigns WHERE project_id = ?1")
            .bind(project_id)
            .fetch_optional(&mut *tx)
            .await?;
    let current = match row {
        Some(row) => sum_amounts(&[row])?,
        None => return Err(AppError::NotFound(format!("campaign {project_id}"))),
    };
    let raised = current.saturating_add(amount);
    sqlx::query(
        "UPDATE campaigns SET raised_amount = ?1, updated_at = strftime('%s', 'now') WHERE project_id = ?2",
    )
    .bind(to_eth(raised))
    .bind(project_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(raised)
}

/// [`CampaignStore`] over the SQLite pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignStore for SqliteStore {
    async fn fetch_campaigns(&self) -> Result<Vec<Campaign>> {
        list_campaigns(&self.pool).await
    }

    async fn fetch_campaign(&self, project_id: i64) -> Result<Option<Campaign>> {
        get_campaign(&self.pool, project_id).await
    }

    async fn write_status(&self, project_id: i64, status: CampaignStatus) -> Result<()> {
        if update_campaign_status(&self.pool, project_id, status).await? {
            Ok(())
        } else {
            Err(AppError::NotFound(format!("campaign {project_id}")))
        }
    }
}

// ─────────────────────────────────────────────────────────
// Donations
// ─────────────────────────────────────────────────────────

const DONATION_COLUMNS: &str =
    "id, project_id, donor_address, amount_eth, transaction_hash, status, donated_at";

pub async fn insert_donation(
    pool: &SqlitePool,
    project_id: i64,
    donor_address: &str,
    amount: U256,
    transaction_hash: &str,
    status: DonationStatus,
    donated_at: i64,
) -> Result<Donation> {
    let id = sqlx::query(
        r#"
        INSERT INTO donations
            (project_id, donor_address, amount_eth, transaction_hash, status, donated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(project_id)
    .bind(donor_address)
    .bind(to_eth(amount))
    .bind(transaction_hash)
    .bind(status.as_str())
    .bind(donated_at)
    .execute(pool)
    .await?
    .last_insert_rowid();

    Ok(Donation {
        id,
        project_id,
        donor_address: donor_address.to_string(),
        amount,
        transaction_hash: transaction_hash.to_string(),
        status,
        donated_at,
    })
}

pub async fn set_donation_status(
    pool: &SqlitePool,
    transaction_hash: &str,
    status: DonationStatus,
) -> Result<()> {
    sqlx::query("UPDATE donations SET status = ?1 WHERE transaction_hash = ?2")
        .bind(status.as_str())
        .bind(transaction_hash)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_donation_by_hash(pool: &SqlitePool, transaction_hash: &str) -> Result<Option<Donation>> {
    let row = sqlx::query_as::<_, DonationRow>(&format!(
        "SELECT {DONATION_COLUMNS} FROM donations WHERE transaction_hash = ?1"
    ))
    .bind(transaction_hash)
    .fetch_optional(pool)
    .await?;
    row.map(Donation::try_from).transpose()
}

const JOINED_DONATION: &str = r#"
    SELECT d.id, d.project_id, d.donor_address, d.amount_eth, d.transaction_hash,
           d.status, d.donated_at,
           c.title     AS campaign_title,
           c.image_url AS campaign_image_url,
           c.status    AS campaign_status
    FROM   donations d
    LEFT JOIN campaigns c ON c.project_id = d.project_id
"#;

pub async fn get_donation(pool: &SqlitePool, id: i64) -> Result<Option<DonationWithCampaign>> {
    let row = sqlx::query_as::<_, DonationWithCampaign>(&format!("{JOINED_DONATION} WHERE d.id = ?1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Confirmed donations to a project, newest first.
pub async fn donations_by_project(
    pool: &SqlitePool,
    project_id: i64,
    limit: i64,
    offset: i64,
) -> Result<Vec<Donation>> {
    let rows = sqlx::query_as::<_, DonationRow>(&format!(
        r#"
        SELECT {DONATION_COLUMNS} FROM donations
        WHERE  project_id = ?1 AND status = 'confirmed'
        ORDER  BY donated_at DESC, id DESC
        LIMIT  ?2 OFFSET ?3
        "#
    ))
    .bind(project_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Donation::try_from).collect()
}

/// Confirmed donations by one donor with campaign details, newest first.
pub async fn donations_by_donor(
    pool: &SqlitePool,
    donor_address: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<DonationWithCampaign>> {
    let rows = sqlx::query_as::<_, DonationWithCampaign>(&format!(
        r#"{JOINED_DONATION}
        WHERE  d.donor_address = ?1 AND d.status = 'confirmed'
        ORDER  BY d.donated_at DESC, d.id DESC
        LIMIT  ?2 OFFSET ?3
        "#
    ))
    .bind(donor_address)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn total_for_project(pool: &SqlitePool, project_id: i64) -> Result<U256> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT amount_eth FROM donations WHERE project_id = ?1 AND status = 'confirmed'",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    sum_amounts(&rows)
}

pub async fn total_for_donor(pool: &SqlitePool, donor_address: &str) -> Result<U256> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT amount_eth FROM donations WHERE donor_address = ?1 AND status = 'confirmed'",
    )
    .bind(donor_address)
    .fetch_all(pool)
    .await?;
    sum_amounts(&rows)
}

/// Distinct confirmed donors of a project.
pub async fn donor_count_for_project(pool: &SqlitePool, project_id: i64) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(DISTINCT donor_address) FROM donations WHERE project_id = ?1 AND status = 'confirmed'",
    )
    .bind(project_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

pub async fn has_donated(pool: &SqlitePool, project_id: i64, donor_address: &str) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT id FROM donations
        WHERE  project_id = ?1 AND donor_address = ?2 AND status = 'confirmed'
        LIMIT  1
        "#,
    )
    .bind(project_id)
    .bind(donor_address)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

/// Distinct projects a donor has confirmed donations to.
pub async fn project_count_for_donor(pool: &SqlitePool, donor_address: &str) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(DISTINCT project_id) FROM donations WHERE donor_address = ?1 AND status = 'confirmed'",
    )
    .bind(donor_address)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// `(donor_address, amount)` for every confirmed donation.
pub async fn confirmed_amounts(pool: &SqlitePool) -> Result<Vec<(String, U256)>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT donor_address, amount_eth FROM donations WHERE status = 'confirmed'",
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|(donor, raw)| {
            parse_eth(&raw)
                .map(|amount| (donor, amount))
                .map_err(|_| AppError::Decode(format!("bad stored amount '{raw}'")))
        })
        .collect()
}

/// Donations still waiting for their transaction, oldest first.
pub async fn pending_donations(pool: &SqlitePool) -> Result<Vec<Donation>> {
    let rows = sqlx::query_as::<_, DonationRow>(&format!(
        "SELECT {DONATION_COLUMNS} FROM donations WHERE status = 'pending' ORDER BY donated_at ASC, id ASC"
    ))
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Donation::try_from).collect()
}

/// Distinct donors across all confirmed donations.
pub async fn distinct_donor_count(pool: &SqlitePool) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(DISTINCT donor_address) FROM donations WHERE status = 'confirmed'",
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}

// ─────────────────────────────────────────────────────────
// Users
// ─────────────────────────────────────────────────────────

const USER_COLUMNS: &str = "id, address, nonce, is_admin, created_at, updated_at";

pub async fn get_user(pool: &SqlitePool, address: &str) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE address = ?1"
    ))
    .bind(address)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

/// Insert a non-admin user; an existing row is left untouched.
pub async fn insert_user(pool: &SqlitePool, address: &str, nonce: &str) -> Result<User> {
    sqlx::query("INSERT OR IGNORE INTO users (address, nonce, is_admin) VALUES (?1, ?2, 0)")
        .bind(address)
        .bind(nonce)
        .execute(pool)
        .await?;
    get_user(pool, address)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {address}")))
}

pub async fn set_nonce(pool: &SqlitePool, address: &str, nonce: &str) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE users SET nonce = ?1, updated_at = strftime('%s', 'now') WHERE address = ?2",
    )
    .bind(nonce)
    .bind(address)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{memory_pool, new_campaign};

    #[tokio::test]
    async fn campaign_insert_and_status_update() {
        let pool = memory_pool().await;
        let created = insert_campaign(&pool, &new_campaign(1, "5", 2_000)).await.unwrap();
        assert_eq!(created.status, CampaignStatus::Active);
        assert_eq!(created.raised_amount, U256::ZERO);

        assert!(update_campaign_status(&pool, 1, CampaignStatus::Approved).await.unwrap());
        assert!(!update_campaign_status(&pool, 99, CampaignStatus::Approved).await.unwrap());

        let stored = get_campaign(&pool, 1).await.unwrap().unwrap();
        assert_eq!(stored.status, CampaignStatus::Approved);
    }

    #[tokio::test]
    async fn campaign_edit_only_touches_given_fields() {
        let pool = memory_pool().await;
        insert_campaign(&pool, &new_campaign(4, "1", 2_000)).await.unwrap();

        let edit = CampaignEdit {
            title: Some("Renamed".to_string()),
            expires_at: Some(9_000),
            ..CampaignEdit::default()
        };
        update_campaign_fields(&pool, 4, &edit).await.unwrap();

        let stored = get_campaign(&pool, 4).await.unwrap().unwrap();
        assert_eq!(stored.title, "Renamed");
        assert_eq!(stored.expires_at, 9_000);
        assert_eq!(stored.description, "Campaign 4");
    }

    #[tokio::test]
    async fn raised_amount_increments() {
        let pool = memory_pool().await;
        insert_campaign(&pool, &new_campaign(2, "5", 2_000)).await.unwrap();
        add_raised_amount(&pool, 2, parse_eth("1.5").unwrap()).await.unwrap();
        let raised = add_raised_amount(&pool, 2, parse_eth("0.5").unwrap()).await.unwrap();
        assert_eq!(raised, parse_eth("2").unwrap());
        assert!(add_raised_amount(&pool, 3, U256::from(1u64)).await.is_err());
    }

    #[tokio::test]
    async fn donation_aggregates_only_count_confirmed() {
        let pool = memory_pool().await;
        insert_campaign(&pool, &new_campaign(1, "5", 2_000)).await.unwrap();
        let one = parse_eth("1").unwrap();
        insert_donation(&pool, 1, "0xaa", one, "0x01", DonationStatus::Confirmed, 10).await.unwrap();
        insert_donation(&pool, 1, "0xaa", one, "0x02", DonationStatus::Confirmed, 11).await.unwrap();
        insert_donation(&pool, 1, "0xbb", one, "0x03", DonationStatus::Failed, 12).await.unwrap();
        insert_donation(&pool, 1, "0xbb", one, "0x04", DonationStatus::Pending, 13).await.unwrap();

        assert_eq!(total_for_project(&pool, 1).await.unwrap(), parse_eth("2").unwrap());
        assert_eq!(donor_count_for_project(&pool, 1).await.unwrap(), 1);
        assert!(has_donated(&pool, 1, "0xaa").await.unwrap());
        assert!(!has_donated(&pool, 1, "0xbb").await.unwrap());
        assert_eq!(distinct_donor_count(&pool).await.unwrap(), 1);

        let pending = pending_donations(&pool).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].transaction_hash, "0x04");

        let listed = donations_by_project(&pool, 1, 50, 0).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].transaction_hash, "0x02");

        let history = donations_by_donor(&pool, "0xaa", 50, 0).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].campaign_title.as_deref(), Some("Campaign 1"));
    }

    #[tokio::test]
    async fn donation_status_transitions_by_hash() {
        let pool = memory_pool().await;
        insert_donation(&pool, 1, "0xaa", U256::from(1u64), "0xfeed", DonationStatus::Pending, 10)
            .await
            .unwrap();
        set_donation_status(&pool, "0xfeed", DonationStatus::Confirmed).await.unwrap();
        let stored = get_donation_by_hash(&pool, "0xfeed").await.unwrap().unwrap();
        assert_eq!(stored.status, DonationStatus::Confirmed);
    }

    #[tokio::test]
    async fn users_keep_their_first_row() {
        let pool = memory_pool().await;
        let user = insert_user(&pool, "0xaa", "n1").await.unwrap();
        assert_eq!(user.nonce.as_deref(), Some("n1"));
        assert!(!user.is_admin);

        let again = insert_user(&pool, "0xaa", "n2").await.unwrap();
        assert_eq!(again.id, user.id);
        assert_eq!(again.nonce.as_deref(), Some("n1"));

        assert!(set_nonce(&pool, "0xaa", "n3").await.unwrap());
        assert!(!set_nonce(&pool, "0xbb", "n3").await.unwrap());
    }
}
