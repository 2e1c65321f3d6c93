//! Wallet-identified users: sign-in nonces and admin resolution.
//!
//! Signature verification happens outside this service. It asks for a
//! challenge with [`issue_nonce`] and, once a signature checks out, calls
//! [`rotate_nonce`] so the same signature cannot be replayed.

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::errors::{AppError, Result};
use crate::models::parse_address;

pub fn new_nonce() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Message the wallet is asked to sign.
pub fn sign_in_message(nonce: &str) -> String {
    format!("Welcome! Please sign this nonce: {nonce}")
}

#[derive(Debug, Clone, Serialize)]
pub struct NonceChallenge {
    pub address: String,
    pub nonce: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserView {
    pub address: String,
    pub registered: bool,
    pub is_admin: bool,
    pub created_at: Option<i64>,
}

/// Get-or-create the user and hand out a fresh nonce.
pub async fn issue_nonce(pool: &SqlitePool, address: &str) -> Result<NonceChallenge> {
    let (_, address) = parse_address(address)?;
    let nonce = new_nonce();

    if db::get_user(pool, &address).await?.is_some() {
        db::set_nonce(pool, &address, &nonce).await?;
    } else {
        db::insert_user(pool, &address, &nonce).await?;
        info!("Registered user {address}");
    }

    Ok(NonceChallenge {
        message: sign_in_message(&nonce),
        address,
        nonce,
    })
}

/// Replace the nonce after a successful sign-in.
pub async fn rotate_nonce(pool: &SqlitePool, address: &str) -> Result<()> {
    let (_, address) = parse_address(address)?;
    if db::set_nonce(pool, &address, &new_nonce()).await? {
        Ok(())
    } else {
        Err(AppError::NotFound(format!("user {address}")))
    }
}

/// Admin if on the configured allow-list or flagged in the store.
pub async fn is_admin(pool: &SqlitePool, config: &Config, address: &str) -> Result<bool> {
    if config.is_listed_admin(address) {
        return Ok(true);
    }
    Ok(db::get_user(pool, &address.to_lowercase())
        .await?
        .map(|u| u.is_admin)
        .unwrap_or(false))
}

pub async fn get_user(pool: &SqlitePool, config: &Config, address: &str) -> Result<UserView> {
    let (_, address) = parse_address(address)?;
    let user = db::get_user(pool, &address).await?;
    Ok(UserView {
        is_admin: config.is_listed_admin(&address) || user.as_ref().is_some_and(|u| u.is_admin),
        registered: user.is_some(),
        created_at: user.map(|u| u.created_at),
        address,
    })
}
