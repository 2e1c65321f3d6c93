//! In-memory stand-ins for the store and the contract, shared by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use alloy_primitives::{address, Address, B256, U256};
use alloy_sol_types::SolEvent;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::config::{Config, GasLimits, Limits};
use crate::contract::{self, ProjectReader, ProjectWriter, TxReceipt};
use crate::db;
use crate::errors::{AppError, Result};
use crate::models::{lowercase, parse_eth, Campaign, ChainProject, NewCampaign, NewProject, ProjectEdit};
use crate::reconcile::CampaignStore;
use crate::rpc::RpcLog;
use crate::status::{CampaignStatus, OnChainStatus};

pub const ADMIN: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";
pub const OUTSIDER: &str = "0x70997970c51812dc3a010c7d01b50e0d17dc79c8";

pub fn test_config() -> Config {
    Config {
        rpc_url: "http://127.0.0.1:8545".to_string(),
        contract_address: address!("5fbdb2315678afecb367f032d93f642f64180aa3"),
        database_url: "sqlite::memory:".to_string(),
        api_port: 0,
        chain_id: 31337,
        admin_addresses: vec![ADMIN.to_string()],
        gas: GasLimits::default(),
        limits: Limits::default(),
        receipt_poll_interval_ms: 1,
        receipt_timeout_secs: 1,
        rpc_max_retries: 0,
    }
}

/// Single-connection in-memory database with the schema applied.
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::migrate(&pool).await.unwrap();
    pool
}

pub fn new_campaign(project_id: i64, target: &str, expires_at: i64) -> NewCampaign {
    NewCampaign {
        project_id,
        title: format!("Campaign {project_id}"),
        description: format!("Campaign {project_id}"),
        image_url: None,
        owner_address: ADMIN.to_string(),
        target_amount: parse_eth(target).unwrap(),
        duration_days: 10,
        created_at: 1_000 + project_id,
        expires_at,
    }
}

pub fn campaign(
    project_id: i64,
    raised: &str,
    target: &str,
    expires_at: i64,
    status: CampaignStatus,
) -> Campaign {
    Campaign {
        project_id,
        title: format!("Campaign {project_id}"),
        description: String::new(),
        image_url: None,
        owner_address: ADMIN.to_string(),
        target_amount: parse_eth(target).unwrap(),
        raised_amount: parse_eth(raised).unwrap(),
        duration_days: 10,
        backers: None,
        status,
        created_at: 1_000 + project_id,
        expires_at,
    }
}

pub fn chain_project(
    id: u64,
    raised: &str,
    cost: &str,
    expires_at: i64,
    status: OnChainStatus,
) -> ChainProject {
    ChainProject {
        id,
        owner: ADMIN.to_string(),
        title: format!("Chain {id}"),
        description: String::new(),
        image_url: String::new(),
        cost: parse_eth(cost).unwrap(),
        raised: parse_eth(raised).unwrap(),
        created_at: 1_000,
        expires_at,
        backers: 3,
        status,
    }
}

// ─────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    campaigns: Mutex<Vec<Campaign>>,
    writes: Mutex<Vec<(i64, CampaignStatus)>>,
    fail_reads: bool,
    fail_writes_for: Option<i64>,
}

impl MemoryStore {
    pub fn with(campaigns: Vec<Campaign>) -> Self {
        Self {
            campaigns: Mutex::new(campaigns),
            ..Self::default()
        }
    }

    pub fn failing_reads() -> Self {
        Self {
            fail_reads: true,
            ..Self::default()
        }
    }

    pub fn failing_writes_for(mut self, project_id: i64) -> Self {
        self.fail_writes_for = Some(project_id);
        self
    }

    /// Successful status writes, in order.
    pub fn writes(&self) -> Vec<(i64, CampaignStatus)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn fetch_campaigns(&self) -> Result<Vec<Campaign>> {
        if self.fail_reads {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(self.campaigns.lock().unwrap().clone())
    }

    async fn fetch_campaign(&self, project_id: i64) -> Result<Option<Campaign>> {
        Ok(self
            .fetch_campaigns()
            .await?
            .into_iter()
            .find(|c| c.project_id == project_id))
    }

    async fn write_status(&self, project_id: i64, status: CampaignStatus) -> Result<()> {
        if self.fail_writes_for == Some(project_id) {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }
        if let Some(c) = self
            .campaigns
            .lock()
            .unwrap()
            .iter_mut()
            .find(|c| c.project_id == project_id)
        {
            c.status = status;
        }
        self.writes.lock().unwrap().push((project_id, status));
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Chain
// ─────────────────────────────────────────────────────────

/// Read-only chain with a fixed snapshot, or unreachable.
pub struct FakeChain {
    projects: Option<Vec<ChainProject>>,
}

impl FakeChain {
    pub fn with(projects: Vec<ChainProject>) -> Self {
        Self {
            projects: Some(projects),
        }
    }

    pub fn unreachable() -> Self {
        Self { projects: None }
    }
}

fn unreachable_rpc() -> AppError {
    AppError::Rpc {
        code: 0,
        message: "connection refused".to_string(),
    }
}

#[async_trait]
impl ProjectReader for FakeChain {
    async fn get_project(&self, id: u64) -> Result<ChainProject> {
        self.get_projects()
            .await?
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| AppError::NotFound(format!("project {id}")))
    }

    async fn get_projects(&self) -> Result<Vec<ChainProject>> {
        self.projects.clone().ok_or_else(unreachable_rpc)
    }
}

/// A tiny contract simulation: keeps projects in memory, mines every
/// transaction instantly and emits the events the real contract would.
#[derive(Default)]
pub struct FakeLedger {
    projects: Mutex<Vec<ChainProject>>,
    receipts: Mutex<HashMap<B256, TxReceipt>>,
    calls: Mutex<Vec<String>>,
    nonce: AtomicU64,
    /// Mined receipts that are not visible yet.
    held: Mutex<HashSet<B256>>,
    /// While set, new receipts are held back as if the node had not mined them.
    pub hold_receipts: AtomicBool,
    pub revert_next: AtomicBool,
    pub reads_fail: AtomicBool,
    pub sends_fail: AtomicBool,
}

impl FakeLedger {
    pub fn with(projects: Vec<ChainProject>) -> Self {
        Self {
            projects: Mutex::new(projects),
            ..Self::default()
        }
    }

    /// Names of the contract functions sent so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn project(&self, id: u64) -> Option<ChainProject> {
        self.projects.lock().unwrap().iter().find(|p| p.id == id).cloned()
    }

    /// Make every held receipt visible.
    pub fn release_receipts(&self) {
        self.hold_receipts.store(false, Ordering::SeqCst);
        self.held.lock().unwrap().clear();
    }

    fn mine(&self, call: &str, logs: Vec<RpcLog>) -> Result<B256> {
        if self.sends_fail.load(Ordering::SeqCst) {
            return Err(unreachable_rpc());
        }
        self.calls.lock().unwrap().push(call.to_string());
        let n = self.nonce.fetch_add(1, Ordering::SeqCst) + 1;
        let hash = B256::left_padding_from(&n.to_be_bytes());
        let success = !self.revert_next.swap(false, Ordering::SeqCst);
        let receipt = TxReceipt {
            tx_hash: hash,
            success,
            logs: if success { logs } else { Vec::new() },
        };
        self.receipts.lock().unwrap().insert(hash, receipt);
        if self.hold_receipts.load(Ordering::SeqCst) {
            self.held.lock().unwrap().insert(hash);
        }
        Ok(hash)
    }

    fn update<F: FnOnce(&mut ChainProject)>(&self, id: u64, f: F) -> Result<()> {
        if self.revert_next.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut projects = self.projects.lock().unwrap();
        let project = projects
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| AppError::Rpc {
                code: 3,
                message: "execution reverted: project not found".to_string(),
            })?;
        f(project);
        Ok(())
    }
}

fn log(data: alloy_primitives::LogData) -> RpcLog {
    RpcLog {
        address: Address::ZERO,
        topics: data.topics().to_vec(),
        data: data.data.clone(),
        block_number: None,
        transaction_hash: None,
    }
}

#[async_trait]
impl ProjectReader for FakeLedger {
    async fn get_project(&self, id: u64) -> Result<ChainProject> {
        if self.reads_fail.load(Ordering::SeqCst) {
            return Err(unreachable_rpc());
        }
        self.project(id)
            .ok_or_else(|| AppError::NotFound(format!("project {id}")))
    }

    async fn get_projects(&self) -> Result<Vec<ChainProject>> {
        if self.reads_fail.load(Ordering::SeqCst) {
            return Err(unreachable_rpc());
        }
        Ok(self.projects.lock().unwrap().clone())
    }
}

#[async_trait]
impl ProjectWriter for FakeLedger {
    async fn send_create_project(&self, from: Address, project: &NewProject) -> Result<B256> {
        let id = {
            let mut projects = self.projects.lock().unwrap();
            let id = projects.len() as u64;
            if !self.revert_next.load(Ordering::SeqCst) {
                projects.push(ChainProject {
                    id,
                    owner: lowercase(&from),
                    title: project.title.clone(),
                    description: project.description.clone(),
                    image_url: project.image_url.clone(),
                    cost: project.cost,
                    raised: U256::ZERO,
                    created_at: 0,
                    expires_at: project.expires_at,
                    backers: 0,
                    status: OnChainStatus::Open,
                });
            }
            id
        };
        let action = contract::Action {
            id: U256::from(id),
            actionType: "PROJECT CREATED".to_string(),
            executor: from,
            timestamp: U256::ZERO,
        };
        self.mine("createProject", vec![log(action.encode_log_data())])
    }

    async fn send_update_project(&self, _from: Address, id: u64, edit: &ProjectEdit) -> Result<B256> {
        self.update(id, |p| {
            p.title = edit.title.clone();
            p.description = edit.description.clone();
            p.image_url = edit.image_url.clone();
            p.expires_at = edit.expires_at;
        })?;
        self.mine("updateProject", Vec::new())
    }

    async fn send_delete_project(&self, _from: Address, id: u64) -> Result<B256> {
        self.update(id, |p| p.status = OnChainStatus::Deleted)?;
        self.mine("deleteProject", Vec::new())
    }

    async fn send_back_project(&self, from: Address, id: u64, amount: U256) -> Result<B256> {
        self.update(id, |p| {
            p.raised += amount;
            p.backers += 1;
            if p.raised >= p.cost {
                p.status = OnChainStatus::Approved;
            }
        })?;
        let backed = contract::ProjectBacked {
            id: U256::from(id),
            backer: from,
            amount,
            timestamp: U256::ZERO,
        };
        self.mine("backProject", vec![log(backed.encode_log_data())])
    }

    async fn send_pay_out_project(&self, from: Address, id: u64) -> Result<B256> {
        let mut raised = U256::ZERO;
        self.update(id, |p| {
            raised = p.raised;
            p.status = OnChainStatus::Paidout;
        })?;
        let tax = raised * U256::from(5u64) / U256::from(100u64);
        let payout = contract::PayoutProcessed {
            id: U256::from(id),
            recipient: from,
            amount: raised - tax,
            tax,
            timestamp: U256::ZERO,
        };
        self.mine("payOutProject", vec![log(payout.encode_log_data())])
    }

    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<TxReceipt> {
        self.receipt(tx_hash)
            .await?
            .ok_or_else(|| AppError::ReceiptTimeout(tx_hash.to_string()))
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>> {
        if self.held.lock().unwrap().contains(&tx_hash) {
            return Ok(None);
        }
        Ok(self.receipts.lock().unwrap().get(&tx_hash).cloned())
    }
}
