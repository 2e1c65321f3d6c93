//! Ethereum JSON-RPC client.
//!
//! ## Resilience
//!
//! * Reads (`eth_call`, receipts, logs, balances) are retried with
//!   exponential back-off, at most `max_retries` times, on transport failures
//!   (connection reset, timeout, HTTP 429/5xx) and the provider "limit
//!   exceeded" error.
//! * `eth_sendTransaction` is sent exactly once. A timeout or 5xx may arrive
//!   after the node accepted the transaction, and a resend would be a second
//!   transaction.
//! * Every other JSON-RPC error (execution reverted, invalid params, ...) is
//!   returned to the caller immediately.

use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256, U64};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::errors::{AppError, Result};

const MAX_BACKOFF_MS: u64 = 8_000;
const INITIAL_BACKOFF_MS: u64 = 250;
/// EIP-1474 "limit exceeded".
const LIMIT_EXCEEDED: i64 = -32005;

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// A log entry as returned by `eth_getLogs` and inside receipts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RpcLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    #[serde(rename = "blockNumber", default)]
    pub block_number: Option<U64>,
    #[serde(rename = "transactionHash", default)]
    pub transaction_hash: Option<B256>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcReceipt {
    #[serde(rename = "transactionHash")]
    pub transaction_hash: B256,
    /// `0x1` on success, `0x0` when the transaction reverted.
    pub status: Option<U64>,
    #[serde(default)]
    pub logs: Vec<RpcLog>,
}

impl RpcReceipt {
    pub fn succeeded(&self) -> bool {
        self.status.map(|s| s == U64::from(1u64)).unwrap_or(false)
    }
}

/// Fields of an `eth_sendTransaction` request.
#[derive(Debug, Clone)]
pub struct TxRequest {
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas: u64,
}

// ─────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RpcClient {
    client: Client,
    url: String,
    max_retries: u32,
}

impl RpcClient {
    pub fn new(client: Client, url: impl Into<String>, max_retries: u32) -> Self {
        Self {
            client,
            url: url.into(),
            max_retries,
        }
    }

    /// Issue one JSON-RPC request. `Ok(None)` means the node answered `null`.
    ///
    /// Transient failures are retried only when `retry` is set.
    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        retry: bool,
    ) -> Result<Option<T>> {
        let mut backoff = INITIAL_BACKOFF_MS;
        let mut attempt = 0u32;

        loop {
            let response = self
                .client
                .post(&self.url)
                .json(&json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "method": method,
                    "params": params,
                }))
                .send()
                .await;

            let reason = match response {
                Err(e) if e.is_connect() || e.is_timeout() => e.to_string(),
                Err(e) => return Err(e.into()),
                Ok(resp) => {
                    let status = resp.status();
                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        format!("HTTP {status}")
                    } else {
                        let body: RpcResponse<T> = resp.json().await?;
                        match body.error {
                            Some(err) if err.code == LIMIT_EXCEEDED => {
                                format!("{} {}", err.code, err.message)
                            }
                            Some(err) => {
                                return Err(AppError::Rpc {
                                    code: err.code,
                                    message: err.message,
                                })
                            }
                            None => return Ok(body.result),
                        }
                    }
                }
            };

            if !retry {
                return Err(AppError::Rpc {
                    code: 0,
                    message: format!("{method} failed, not resent: {reason}"),
                });
            }
            if attempt >= self.max_retries {
                return Err(AppError::Rpc {
                    code: 0,
                    message: format!("{method} gave up after {attempt} retries: {reason}"),
                });
            }
            warn!("{method} failed (retry in {backoff}ms): {reason}");
            tokio::time::sleep(Duration::from_millis(backoff)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF_MS);
            attempt += 1;
        }
    }

    async fn request_some<T: DeserializeOwned>(&self, method: &str, params: Value, retry: bool) -> Result<T> {
        self.request(method, params, retry)
            .await?
            .ok_or_else(|| AppError::Decode(format!("empty result from {method}")))
    }

    /// `eth_call` against the latest block.
    pub async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        self.request_some("eth_call", json!([{ "to": to, "data": data }, "latest"]), true)
            .await
    }

    /// `eth_sendTransaction`; the node signs with an unlocked `from` account.
    pub async fn send_transaction(&self, tx: &TxRequest) -> Result<B256> {
        self.request_some(
            "eth_sendTransaction",
            json!([{
                "from": tx.from,
                "to": tx.to,
                "data": tx.data,
                "value": tx.value,
                "gas": U64::from(tx.gas),
            }]),
            false,
        )
        .await
    }

    /// `eth_getTransactionReceipt`; `None` while the transaction is pending.
    pub async fn transaction_receipt(&self, hash: B256) -> Result<Option<RpcReceipt>> {
        self.request("eth_getTransactionReceipt", json!([hash]), true)
            .await
    }

    /// `eth_getLogs` for one contract.
    pub async fn get_logs(&self, address: Address, from_block: u64) -> Result<Vec<RpcLog>> {
        let logs: Vec<RpcLog> = self
            .request_some("eth_getLogs", json!([logs_filter(address, from_block)]), true)
            .await?;
        debug!("Fetched {} logs from block {from_block}", logs.len());
        Ok(logs)
    }

    /// `eth_getBalance` at the latest block, in wei.
    pub async fn get_balance(&self, address: Address) -> Result<U256> {
        self.request_some("eth_getBalance", json!([address, "latest"]), true)
            .await
    }
}

/// Every event of one contract from `from_block` on; callers filter by topic
/// after decoding.
fn logs_filter(address: Address, from_block: u64) -> Value {
    json!({
        "address": address,
        "fromBlock": U64::from(from_block),
        "toBlock": "latest",
    })
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
