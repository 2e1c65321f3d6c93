//! Typed access to the crowdfunding contract.
//!
//! The contract itself is an external service; this module only carries its
//! ABI (via [`sol!`]), decodes what it returns and emits, and implements the
//! [`ProjectReader`] / [`ProjectWriter`] seams on top of [`RpcClient`].

use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::{sol, SolCall, SolEvent};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{Config, GasLimits};
use crate::errors::{AppError, Result};
use crate::models::{lowercase, to_eth, ChainProject, NewProject, ProjectEdit};
use crate::rpc::{RpcClient, RpcLog, TxRequest};
use crate::status::OnChainStatus;

sol! {
    struct ProjectStruct {
        uint256 id;
        address owner;
        string title;
        string description;
        string imageURL;
        uint256 cost;
        uint256 raised;
        uint256 timestamp;
        uint256 expiresAt;
        uint256 backers;
        uint8 status;
    }

    struct BackerStruct {
        address owner;
        uint256 contribution;
        uint256 timestamp;
        bool refunded;
    }

    function getProject(uint256 id) external view returns (ProjectStruct memory);
    function getProjects() external view returns (ProjectStruct[] memory);
    function getBackers(uint256 id) external view returns (BackerStruct[] memory);
    function stats() external view returns (uint256 totalProjects, uint256 totalBacking, uint256 totalDonations);
    function backProject(uint256 id) external payable returns (bool);
    function createProject(
        string title,
        string description,
        string imageURL,
        uint256 cost,
        uint256 expiresAt
    ) external returns (bool);
    function updateProject(
        uint256 id,
        string title,
        string description,
        string imageURL,
        uint256 expiresAt
    ) external returns (bool);
    function deleteProject(uint256 id) external returns (bool);
    function payOutProject(uint256 id) external returns (bool);

    event Action(uint256 id, string actionType, address indexed executor, uint256 timestamp);
    event ProjectBacked(uint256 indexed id, address indexed backer, uint256 amount, uint256 timestamp);
    event RefundProcessed(uint256 indexed id, address indexed recipient, uint256 amount, uint256 timestamp);
    event PayoutProcessed(
        uint256 indexed id,
        address indexed recipient,
        uint256 amount,
        uint256 tax,
        uint256 timestamp
    );
}

// ─────────────────────────────────────────────────────────
// Seams
// ─────────────────────────────────────────────────────────

/// Read side of the contract, consumed by reconciliation.
#[async_trait]
pub trait ProjectReader: Send + Sync {
    async fn get_project(&self, id: u64) -> Result<ChainProject>;
    async fn get_projects(&self) -> Result<Vec<ChainProject>>;
}

/// Outcome of a mined transaction.
#[derive(Debug, Clone)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub success: bool,
    pub logs: Vec<RpcLog>,
}

/// Write side of the contract. Each `send_*` returns the transaction hash
/// without waiting for it to be mined.
#[async_trait]
pub trait ProjectWriter: Send + Sync {
    async fn send_create_project(&self, from: Address, project: &NewProject) -> Result<B256>;
    async fn send_update_project(&self, from: Address, id: u64, edit: &ProjectEdit) -> Result<B256>;
    async fn send_delete_project(&self, from: Address, id: u64) -> Result<B256>;
    async fn send_back_project(&self, from: Address, id: u64, amount: U256) -> Result<B256>;
    async fn send_pay_out_project(&self, from: Address, id: u64) -> Result<B256>;
    /// Block until the transaction is mined or the receipt wait times out.
    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<TxReceipt>;
    /// Single receipt lookup; `None` while the transaction is not mined.
    async fn receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>>;
}

/// Wait for `tx_hash` and fail with [`AppError::Reverted`] unless it succeeded.
pub async fn confirm(writer: &dyn ProjectWriter, tx_hash: B256) -> Result<TxReceipt> {
    let receipt = writer.wait_for_receipt(tx_hash).await?;
    if receipt.success {
        Ok(receipt)
    } else {
        Err(AppError::Reverted(tx_hash.to_string()))
    }
}

// ─────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────

fn to_i64(value: U256, field: &str) -> Result<i64> {
    u64::try_from(value)
        .ok()
        .and_then(|v| i64::try_from(v).ok())
        .ok_or_else(|| AppError::Decode(format!("{field} out of range")))
}

fn to_u64(value: U256, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| AppError::Decode(format!("{field} out of range")))
}

impl TryFrom<ProjectStruct> for ChainProject {
    type Error = AppError;

    fn try_from(p: ProjectStruct) -> Result<Self> {
        Ok(ChainProject {
            id: to_u64(p.id, "id")?,
            owner: lowercase(&p.owner),
            title: p.title,
            description: p.description,
            image_url: p.imageURL,
            cost: p.cost,
            raised: p.raised,
            created_at: to_i64(p.timestamp, "timestamp")?,
            expires_at: to_i64(p.expiresAt, "expiresAt")?,
            backers: to_u64(p.backers, "backers")?,
            status: OnChainStatus::try_from(p.status)?,
        })
    }
}

/// Decode the return data of `getProject`.
pub fn decode_project(data: &[u8]) -> Result<ChainProject> {
    let ret = getProjectCall::abi_decode_returns(data, true)?;
    ChainProject::try_from(ret._0)
}

/// Decode the return data of `getProjects`.
///
/// Entries that do not fit the domain types are logged and skipped so the
/// rest keep their on-chain data.
pub fn decode_projects(data: &[u8]) -> Result<Vec<ChainProject>> {
    let ret = getProjectsCall::abi_decode_returns(data, true)?;
    Ok(ret
        ._0
        .into_iter()
        .enumerate()
        .filter_map(|(idx, raw)| match ChainProject::try_from(raw) {
            Ok(project) => Some(project),
            Err(e) => {
                warn!("Skipping undecodable project at index {idx}: {e}");
                None
            }
        })
        .collect())
}

/// One entry of `getBackers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Backer {
    pub owner: String,
    pub contribution_eth: String,
    pub timestamp: i64,
    pub refunded: bool,
}

/// Contract-wide counters from `stats()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContractStats {
    pub total_projects: u64,
    pub total_backing: u64,
    pub total_donations_eth: String,
}

pub fn decode_backers(data: &[u8]) -> Result<Vec<Backer>> {
    let ret = getBackersCall::abi_decode_returns(data, true)?;
    ret._0
        .into_iter()
        .map(|b| {
            Ok(Backer {
                owner: lowercase(&b.owner),
                contribution_eth: to_eth(b.contribution),
                timestamp: to_i64(b.timestamp, "timestamp")?,
                refunded: b.refunded,
            })
        })
        .collect()
}

pub fn decode_stats(data: &[u8]) -> Result<ContractStats> {
    let ret = statsCall::abi_decode_returns(data, true)?;
    Ok(ContractStats {
        total_projects: to_u64(ret.totalProjects, "totalProjects")?,
        total_backing: to_u64(ret.totalBacking, "totalBacking")?,
        total_donations_eth: to_eth(ret.totalDonations),
    })
}

/// A decoded contract event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ContractEvent {
    Action {
        project_id: u64,
        action_type: String,
        executor: String,
        timestamp: i64,
    },
    ProjectBacked {
        project_id: u64,
        backer: String,
        amount_eth: String,
        timestamp: i64,
    },
    RefundProcessed {
        project_id: u64,
        recipient: String,
        amount_eth: String,
        timestamp: i64,
    },
    PayoutProcessed {
        project_id: u64,
        recipient: String,
        amount_eth: String,
        tax_eth: String,
        timestamp: i64,
    },
}

impl ContractEvent {
    pub fn project_id(&self) -> u64 {
        match self {
            Self::Action { project_id, .. }
            | Self::ProjectBacked { project_id, .. }
            | Self::RefundProcessed { project_id, .. }
            | Self::PayoutProcessed { project_id, .. } => *project_id,
        }
    }
}

/// Decode one log. Logs from other events (or malformed ones) yield `None`.
pub fn decode_log(log: &RpcLog) -> Option<ContractEvent> {
    let topic0 = *log.topics.first()?;
    let topics = log.topics.iter().copied();

    if topic0 == Action::SIGNATURE_HASH {
        let ev = Action::decode_raw_log(topics, &log.data, true).ok()?;
        Some(ContractEvent::Action {
            project_id: to_u64(ev.id, "id").ok()?,
            action_type: ev.actionType,
            executor: lowercase(&ev.executor),
            timestamp: to_i64(ev.timestamp, "timestamp").ok()?,
        })
    } else if topic0 == ProjectBacked::SIGNATURE_HASH {
        let ev = ProjectBacked::decode_raw_log(topics, &log.data, true).ok()?;
        Some(ContractEvent::ProjectBacked {
            project_id: to_u64(ev.id, "id").ok()?,
            backer: lowercase(&ev.backer),
            amount_eth: to_eth(ev.amount),
            timestamp: to_i64(ev.timestamp, "timestamp").ok()?,
        })
    } else if topic0 == RefundProcessed::SIGNATURE_HASH {
        let ev = RefundProcessed::decode_raw_log(topics, &log.data, true).ok()?;
        Some(ContractEvent::RefundProcessed {
            project_id: to_u64(ev.id, "id").ok()?,
            recipient: lowercase(&ev.recipient),
            amount_eth: to_eth(ev.amount),
            timestamp: to_i64(ev.timestamp, "timestamp").ok()?,
        })
    } else if topic0 == PayoutProcessed::SIGNATURE_HASH {
        let ev = PayoutProcessed::decode_raw_log(topics, &log.data, true).ok()?;
        Some(ContractEvent::PayoutProcessed {
            project_id: to_u64(ev.id, "id").ok()?,
            recipient: lowercase(&ev.recipient),
            amount_eth: to_eth(ev.amount),
            tax_eth: to_eth(ev.tax),
            timestamp: to_i64(ev.timestamp, "timestamp").ok()?,
        })
    } else {
        None
    }
}

pub fn decode_logs(logs: &[RpcLog]) -> Vec<ContractEvent> {
    logs.iter().filter_map(decode_log).collect()
}

/// Id of the project created by a `createProject` transaction, taken from
/// its `Action` event.
pub fn created_project_id(receipt: &TxReceipt) -> Result<u64> {
    decode_logs(&receipt.logs)
        .into_iter()
        .find_map(|ev| match ev {
            ContractEvent::Action { project_id, .. } => Some(project_id),
            _ => None,
        })
        .ok_or_else(|| {
            AppError::Decode(format!(
                "no Action event in receipt of {}",
                receipt.tx_hash
            ))
        })
}

// ─────────────────────────────────────────────────────────
// JSON-RPC backed contract
// ─────────────────────────────────────────────────────────

pub struct CrowdfundContract {
    rpc: RpcClient,
    address: Address,
    gas: GasLimits,
    poll_interval: Duration,
    receipt_timeout: Duration,
}

impl CrowdfundContract {
    pub fn new(rpc: RpcClient, config: &Config) -> Self {
        Self {
            rpc,
            address: config.contract_address,
            gas: config.gas,
            poll_interval: Duration::from_millis(config.receipt_poll_interval_ms.max(1)),
            receipt_timeout: Duration::from_secs(config.receipt_timeout_secs),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    async fn send(&self, from: Address, data: Vec<u8>, value: U256, gas: u64) -> Result<B256> {
        let tx = TxRequest {
            from,
            to: self.address,
            data: Bytes::from(data),
            value,
            gas,
        };
        let hash = self.rpc.send_transaction(&tx).await?;
        info!("Submitted transaction {hash} from {from}");
        Ok(hash)
    }

    /// All decoded contract events since `from_block`, optionally narrowed
    /// to one project.
    pub async fn events(&self, from_block: u64, project_id: Option<u64>) -> Result<Vec<ContractEvent>> {
        let logs = self.rpc.get_logs(self.address, from_block).await?;
        Ok(decode_logs(&logs)
            .into_iter()
            .filter(|ev| project_id.map_or(true, |id| ev.project_id() == id))
            .collect())
    }

    /// Everyone who backed project `id`, refunded or not.
    pub async fn backers(&self, id: u64) -> Result<Vec<Backer>> {
        let data = getBackersCall { id: U256::from(id) }.abi_encode();
        let out = self.rpc.call(self.address, Bytes::from(data)).await?;
        decode_backers(&out)
    }

    pub async fn stats(&self) -> Result<ContractStats> {
        let out = self
            .rpc
            .call(self.address, Bytes::from(statsCall {}.abi_encode()))
            .await?;
        decode_stats(&out)
    }
}

#[async_trait]
impl ProjectReader for CrowdfundContract {
    async fn get_project(&self, id: u64) -> Result<ChainProject> {
        let data = getProjectCall { id: U256::from(id) }.abi_encode();
        let out = self.rpc.call(self.address, Bytes::from(data)).await?;
        decode_project(&out)
    }

    async fn get_projects(&self) -> Result<Vec<ChainProject>> {
        let data = getProjectsCall {}.abi_encode();
        let out = self.rpc.call(self.address, Bytes::from(data)).await?;
        let projects = decode_projects(&out)?;
        debug!("Loaded {} projects from chain", projects.len());
        Ok(projects)
    }
}

#[async_trait]
impl ProjectWriter for CrowdfundContract {
    async fn send_create_project(&self, from: Address, project: &NewProject) -> Result<B256> {
        let call = createProjectCall {
            title: project.title.clone(),
            description: project.description.clone(),
            imageURL: project.image_url.clone(),
            cost: project.cost,
            expiresAt: U256::from(project.expires_at.max(0) as u64),
        };
        self.send(from, call.abi_encode(), U256::ZERO, self.gas.create)
            .await
    }

    async fn send_update_project(&self, from: Address, id: u64, edit: &ProjectEdit) -> Result<B256> {
        let call = updateProjectCall {
            id: U256::from(id),
            title: edit.title.clone(),
            description: edit.description.clone(),
            imageURL: edit.image_url.clone(),
            expiresAt: U256::from(edit.expires_at.max(0) as u64),
        };
        self.send(from, call.abi_encode(), U256::ZERO, self.gas.update)
            .await
    }

    async fn send_delete_project(&self, from: Address, id: u64) -> Result<B256> {
        let call = deleteProjectCall { id: U256::from(id) };
        self.send(from, call.abi_encode(), U256::ZERO, self.gas.delete)
            .await
    }

    async fn send_back_project(&self, from: Address, id: u64, amount: U256) -> Result<B256> {
        let call = backProjectCall { id: U256::from(id) };
        self.send(from, call.abi_encode(), amount, self.gas.donate)
            .await
    }

    async fn send_pay_out_project(&self, from: Address, id: u64) -> Result<B256> {
        let call = payOutProjectCall { id: U256::from(id) };
        self.send(from, call.abi_encode(), U256::ZERO, self.gas.payout)
            .await
    }

    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<TxReceipt> {
        let deadline = tokio::time::Instant::now() + self.receipt_timeout;
        loop {
            if let Some(receipt) = self.receipt(tx_hash).await? {
                return Ok(receipt);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AppError::ReceiptTimeout(tx_hash.to_string()));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>> {
        Ok(self
            .rpc
            .transaction_receipt(tx_hash)
            .await?
            .map(|receipt| TxReceipt {
                tx_hash: receipt.transaction_hash,
                success: receipt.succeeded(),
                logs: receipt.logs,
            }))
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
