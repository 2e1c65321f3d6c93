//! Application configuration loaded from environment variables.

use std::str::FromStr;

use alloy_primitives::utils::parse_ether;
use alloy_primitives::{Address, U256};

use crate::errors::{AppError, Result};

/// Addresses treated as admin regardless of the stored `is_admin` flag.
const DEFAULT_ADMIN_ADDRESSES: &str =
    "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266,0x8fa4c621f86eba072148b2fd6a20ccdb21b2f913";

#[derive(Debug, Clone)]
pub struct Config {
    /// Ethereum JSON-RPC endpoint (e.g. a local hardhat node)
    pub rpc_url: String,
    /// Address of the deployed crowdfunding contract
    pub contract_address: Address,
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    pub chain_id: u64,
    /// Lowercase hex addresses with admin rights
    pub admin_addresses: Vec<String>,
    pub gas: GasLimits,
    pub limits: Limits,
    /// Delay between `eth_getTransactionReceipt` polls
    pub receipt_poll_interval_ms: u64,
    /// Give up waiting for a receipt after this many seconds
    pub receipt_timeout_secs: u64,
    /// Retries for transport-level RPC failures
    pub rpc_max_retries: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct GasLimits {
    pub create: u64,
    pub donate: u64,
    pub update: u64,
    pub delete: u64,
    pub payout: u64,
}

impl Default for GasLimits {
    fn default() -> Self {
        Self {
            create: 500_000,
            donate: 500_000,
            update: 300_000,
            delete: 300_000,
            payout: 300_000,
        }
    }
}

/// Business-rule bounds applied before any network call.
#[derive(Debug, Clone)]
pub struct Limits {
    pub min_target: U256,
    pub min_duration_days: u32,
    pub max_duration_days: u32,
    pub min_donation: U256,
    pub items_per_page: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            // 0.1 ETH
            min_target: U256::from(100_000_000_000_000_000u64),
            min_duration_days: 1,
            max_duration_days: 365,
            // 0.01 ETH
            min_donation: U256::from(10_000_000_000_000_000u64),
            items_per_page: 20,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let contract_address = env_var("CONTRACT_ADDRESS").map_err(|_| {
            AppError::Config("CONTRACT_ADDRESS environment variable is required".to_string())
        })?;
        let defaults = GasLimits::default();

        Ok(Config {
            rpc_url: env_var("RPC_URL").unwrap_or_else(|_| "http://127.0.0.1:8545".to_string()),
            contract_address: Address::from_str(contract_address.trim())
                .map_err(|_| AppError::Config("Invalid CONTRACT_ADDRESS".to_string()))?,
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./chainfund.db".to_string()),
            api_port: parse_or("API_PORT", 3001)?,
            chain_id: parse_or("CHAIN_ID", 31337)?,
            admin_addresses: parse_admins(
                &env_var("ADMIN_ADDRESSES").unwrap_or_else(|_| DEFAULT_ADMIN_ADDRESSES.to_string()),
            ),
            gas: GasLimits {
                create: parse_or("GAS_LIMIT_CREATE", defaults.create)?,
                donate: parse_or("GAS_LIMIT_DONATE", defaults.donate)?,
                update: parse_or("GAS_LIMIT_UPDATE", defaults.update)?,
                delete: parse_or("GAS_LIMIT_DELETE", defaults.delete)?,
                payout: parse_or("GAS_LIMIT_PAYOUT", defaults.payout)?,
            },
            limits: Limits {
                min_target: ether_or("MIN_TARGET_ETH", "0.1")?,
                min_duration_days: parse_or("MIN_DURATION_DAYS", 1)?,
                max_duration_days: parse_or("MAX_DURATION_DAYS", 365)?,
                min_donation: ether_or("MIN_DONATION_ETH", "0.01")?,
                items_per_page: parse_or("ITEMS_PER_PAGE", 20)?,
            },
            receipt_poll_interval_ms: parse_or("RECEIPT_POLL_INTERVAL_MS", 1000)?,
            receipt_timeout_secs: parse_or("RECEIPT_TIMEOUT_SECS", 120)?,
            rpc_max_retries: parse_or("RPC_MAX_RETRIES", 3)?,
        })
    }

    /// True when `address` is on the static admin allow-list.
    pub fn is_listed_admin(&self, address: &str) -> bool {
        let address = address.to_lowercase();
        self.admin_addresses.iter().any(|a| *a == address)
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| AppError::Config(format!("Missing env var: {key}")))
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("Invalid {key}"))),
        Err(_) => Ok(default),
    }
}

fn ether_or(key: &str, default: &str) -> Result<U256> {
    let raw = env_var(key).unwrap_or_else(|_| default.to_string());
    parse_ether(raw.trim()).map_err(|_| AppError::Config(format!("Invalid {key}")))
}

fn parse_admins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|a| a.trim().to_lowercase())
        .filter(|a| !a.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_list_is_normalised() {
        let admins = parse_admins(" 0xABC ,, 0xdef");
        assert_eq!(admins, vec!["0xabc".to_string(), "0xdef".to_string()]);
    }

    #[test]
    fn default_limits_match_ether_values() {
        let limits = Limits::default();
        assert_eq!(limits.min_target, parse_ether("0.1").unwrap());
        assert_eq!(limits.min_donation, parse_ether("0.01").unwrap());
    }
}
