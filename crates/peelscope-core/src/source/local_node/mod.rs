//! The primary source: a locally-run Bitcoin Core node over JSON-RPC.
//!
//! [`LocalNodeSource`] never fails to construct. A bad configuration leaves
//! it permanently unavailable. A failed `getblockchaininfo` handshake, or a
//! connection-level failure later on, marks it offline; the next call then
//! re-runs the handshake through [`probe`] and only short-circuits with
//! `SourceUnavailable` if that fails too.
//!
//! [`probe`]: crate::source::TransactionSource::probe

mod client;
mod connection;
mod protocol;

pub use client::ChainInfo;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bitcoin::{BlockHash, Txid};
use tracing::{debug, info, warn};

use crate::error::{CoreError, RpcError};
use crate::source::parsing::{is_confirmed, parse_verbose_transaction};
use crate::source::TransactionSource;
use crate::types::{BlockHeight, ResolvedTransaction, SourceTier};

use client::NodeRpcClient;

#[derive(Debug, Clone)]
pub struct LocalNodeConfig {
    /// `http://` or `https://` JSON-RPC endpoint.
    pub url: String,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub cookie_file: Option<PathBuf>,
    pub requests_per_second: Option<u32>,
    /// Maximum calls per JSON-RPC batch request.
    pub batch_chunk_size: usize,
}

impl Default for LocalNodeConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8332".to_owned(),
            user: None,
            pass: None,
            cookie_file: None,
            requests_per_second: None,
            batch_chunk_size: 100,
        }
    }
}

enum Backend {
    Ready(NodeRpcClient),
    Misconfigured(String),
}

pub struct LocalNodeSource {
    backend: Backend,
    available: AtomicBool,
}

impl LocalNodeSource {
    /// Build the client and run the initial handshake. Failures are logged
    /// and recorded, never returned.
    pub async fn connect(config: LocalNodeConfig) -> Self {
        let backend = match NodeRpcClient::new(&config) {
            Ok(client) => Backend::Ready(client),
            Err(e) => {
                warn!(url = %config.url, error = %e, "local node misconfigured; primary source disabled");
                Backend::Misconfigured(e.to_string())
            }
        };
        let source = Self {
            backend,
            available: AtomicBool::new(false),
        };
        if let Err(e) = source.probe().await {
            warn!(url = %config.url, error = %e, "local node unreachable at startup");
        }
        source
    }

    /// A source that is permanently offline, for runs without a local node.
    pub fn disabled(reason: impl Into<String>) -> Self {
        Self {
            backend: Backend::Misconfigured(reason.into()),
            available: AtomicBool::new(false),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// The RPC client, re-running the handshake first if the node was
    /// marked offline.
    async fn ready_client(&self) -> Result<&NodeRpcClient, CoreError> {
        let client = match &self.backend {
            Backend::Misconfigured(detail) => {
                return Err(CoreError::SourceUnavailable {
                    tier: SourceTier::Primary,
                    detail: detail.clone(),
                })
            }
            Backend::Ready(client) => client,
        };
        if !self.is_available() {
            debug!("local node offline, retrying handshake");
            self.probe().await.map_err(|e| CoreError::SourceUnavailable {
                tier: SourceTier::Primary,
                detail: format!("local node offline: {e}"),
            })?;
        }
        Ok(client)
    }

    /// Connection-level failures mark the node offline. RPC errors the node
    /// itself answered with leave it online.
    fn record_outcome<T>(&self, result: &Result<T, CoreError>) {
        if let Err(e) = result {
            if is_connection_failure(e) && self.available.swap(false, Ordering::AcqRel) {
                warn!(error = %e, "local node went offline");
            }
        }
    }

    async fn fetch_and_parse(
        &self,
        client: &NodeRpcClient,
        txid: &Txid,
    ) -> Result<ResolvedTransaction, CoreError> {
        let raw = client.get_raw_transaction(txid).await?;
        let mut tx = parse_verbose_transaction(&raw)?;
        if tx.block_height.is_none() && is_confirmed(&raw) {
            if let Some(block_hash) = tx.block_hash {
                tx.block_height = client.get_block_height(&block_hash).await?;
            }
        }
        resolve_input_values(client, &mut tx).await;
        Ok(tx)
    }
}

fn is_connection_failure(err: &CoreError) -> bool {
    matches!(
        err,
        CoreError::Rpc(RpcError::Transport(_) | RpcError::HttpStatus { .. })
    )
}

/// Fill input values, addresses and creation times from the funding
/// transactions with one batched `getrawtransaction`. Inputs the node
/// cannot resolve (pruned, no txindex) are left as they are.
async fn resolve_input_values(client: &NodeRpcClient, tx: &mut ResolvedTransaction) {
    let mut parents: Vec<Txid> = tx
        .inputs
        .iter()
        .filter(|input| input.value.is_none() || input.creation_time.is_none())
        .filter_map(|input| input.prevout.map(|p| p.txid))
        .collect();
    parents.sort_unstable();
    parents.dedup();
    if parents.is_empty() {
        return;
    }

    let results = match client.get_raw_transactions(&parents).await {
        Ok(results) => results,
        Err(e) => {
            warn!(txid = %tx.txid, parents = parents.len(), error = %e, "batch input resolution failed");
            return;
        }
    };

    let mut funding: HashMap<Txid, ResolvedTransaction> = HashMap::with_capacity(parents.len());
    for (txid, result) in parents.iter().zip(results) {
        match result.and_then(|raw| parse_verbose_transaction(&raw)) {
            Ok(parent) => {
                funding.insert(*txid, parent);
            }
            Err(e) => debug!(txid = %tx.txid, parent = %txid, error = %e, "funding tx unavailable"),
        }
    }

    for input in &mut tx.inputs {
        let Some(prevout) = input.prevout else {
            continue;
        };
        let Some(parent) = funding.get(&prevout.txid) else {
            continue;
        };
        if let Some(output) = parent.output(prevout.vout) {
            input.value.get_or_insert(output.value);
            if input.address.is_none() {
                input.address.clone_from(&output.address);
            }
        }
        if input.creation_time.is_none() {
            input.creation_time = parent.observed_time;
        }
    }
}

#[async_trait]
impl TransactionSource for LocalNodeSource {
    fn tier(&self) -> SourceTier {
        SourceTier::Primary
    }

    fn name(&self) -> &'static str {
        "local node"
    }

    async fn fetch_transaction(&self, txid: &Txid) -> Result<ResolvedTransaction, CoreError> {
        let client = self.ready_client().await?;
        let result = self.fetch_and_parse(client, txid).await;
        self.record_outcome(&result);
        result
    }

    async fn fetch_block_height(
        &self,
        block_hash: &BlockHash,
    ) -> Result<Option<BlockHeight>, CoreError> {
        let client = self.ready_client().await?;
        let result = client.get_block_height(block_hash).await;
        self.record_outcome(&result);
        result
    }

    async fn probe(&self) -> Result<(), CoreError> {
        let client = match &self.backend {
            Backend::Ready(client) => client,
            Backend::Misconfigured(detail) => {
                return Err(CoreError::SourceUnavailable {
                    tier: SourceTier::Primary,
                    detail: detail.clone(),
                })
            }
        };
        match client.get_blockchain_info().await {
            Ok(info) => {
                if !self.available.swap(true, Ordering::AcqRel) {
                    info!(chain = %info.chain, blocks = info.blocks, "local node online");
                }
                Ok(())
            }
            Err(e) => {
                self.available.store(false, Ordering::Release);
                Err(e)
            }
        }
    }
}
