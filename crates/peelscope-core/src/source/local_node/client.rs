use std::collections::HashMap;
use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitcoin::{BlockHash, Txid};
use futures::future::try_join_all;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use lru::LruCache;
use reqwest::header;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::error::{CoreError, RpcError};
use crate::source::parsing::parse_integer_optional;
use crate::types::BlockHeight;

use super::connection::{parse_node_url, resolve_auth};
use super::protocol::{parse_batch_id, parse_jsonrpc_error, JsonRpcRequest, JsonRpcResponse};
use super::LocalNodeConfig;

/// Maximum number of block-hash → height entries cached in memory.
const BLOCK_HEIGHT_CACHE_CAP: usize = 10_000;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Basic chain information from `getblockchaininfo`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainInfo {
    pub chain: String,
    pub blocks: u64,
    #[serde(rename = "bestblockhash")]
    pub best_block_hash: BlockHash,
}

/// Bitcoin Core JSON-RPC client over HTTP(S).
///
/// Supports single and batched calls and keeps an LRU cache of
/// block-hash-to-height mappings so confirmed transactions do not trigger
/// repeated `getblockheader` calls.
pub(super) struct NodeRpcClient {
    client: reqwest::Client,
    url: String,
    auth: Option<(String, String)>,
    limiter: Option<DirectRateLimiter>,
    batch_chunk_size: usize,
    next_id: AtomicU64,
    /// Confirmed block heights never change, so entries are only evicted,
    /// never invalidated.
    block_height_cache: RwLock<LruCache<BlockHash, BlockHeight>>,
}

impl NodeRpcClient {
    /// Authentication precedence: explicit user + pass, then the cookie
    /// file, then none. With `requests_per_second` set, every outbound HTTP
    /// request (a whole batch counts as one) waits on the limiter.
    pub(super) fn new(config: &LocalNodeConfig) -> Result<Self, CoreError> {
        let batch_chunk_size = NonZeroUsize::new(config.batch_chunk_size)
            .ok_or_else(|| CoreError::Config("node batch chunk size must be at least 1".into()))?;
        let auth = resolve_auth(
            config.user.as_deref(),
            config.pass.as_deref(),
            config.cookie_file.as_deref(),
        )?;
        let url = parse_node_url(&config.url)?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .build()
            .map_err(RpcError::Transport)?;

        let limiter = match config.requests_per_second {
            None => None,
            Some(limit) => {
                let limit = NonZeroU32::new(limit).ok_or_else(|| {
                    CoreError::Config("node requests_per_second must be at least 1".into())
                })?;
                Some(RateLimiter::direct(Quota::per_second(limit)))
            }
        };

        let cache_cap = NonZeroUsize::new(BLOCK_HEIGHT_CACHE_CAP).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            client,
            url,
            auth,
            limiter,
            batch_chunk_size: batch_chunk_size.get(),
            next_id: AtomicU64::new(initial_request_id()),
            block_height_cache: RwLock::new(LruCache::new(cache_cap)),
        })
    }

    /// Atomically reserve `count` consecutive request IDs for batch calls.
    fn reserve_request_ids(&self, count: u64) -> u64 {
        self.next_id.fetch_add(count, Ordering::Relaxed)
    }

    async fn wait_for_rate_limit(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    async fn post<T: serde::Serialize + ?Sized>(&self, body: &T) -> Result<String, CoreError> {
        let mut builder = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(body);
        if let Some((ref user, ref pass)) = self.auth {
            builder = builder.basic_auth(user, Some(pass));
        }

        let response = builder.send().await.map_err(RpcError::Transport)?;
        let status = response.status();
        let text = response.text().await.map_err(RpcError::Transport)?;

        // Core answers RPC-level errors with HTTP 500 and a JSON body; an
        // empty body on a non-2xx status (e.g. 401) is a transport failure.
        if !status.is_success() && text.trim().is_empty() {
            return Err(RpcError::HttpStatus {
                status: status.as_u16(),
                url: self.url.clone(),
            }
            .into());
        }
        Ok(text)
    }

    pub(super) async fn rpc_call(
        &self,
        method: &str,
        params: &[serde_json::Value],
    ) -> Result<serde_json::Value, CoreError> {
        self.wait_for_rate_limit().await;
        let id = self.reserve_request_ids(1);
        debug!(
            rpc.id = id,
            rpc.method = method,
            rpc.params = params.len(),
            "rpc call"
        );
        let body = self
            .post(&JsonRpcRequest {
                jsonrpc: "2.0",
                id,
                method,
                params,
            })
            .await?;
        debug!(rpc.id = id, rpc.method = method, body_len = body.len(), "rpc response");
        trace!(rpc.id = id, rpc.method = method, body = %body, "rpc response body");

        let decoded: JsonRpcResponse = serde_json::from_str(&body).map_err(|e| {
            RpcError::InvalidResponse(format!("decode JSON-RPC response: {e}; body={body}"))
        })?;

        if let Some(err) = decoded.error.filter(|e| !e.is_null()) {
            return Err(parse_jsonrpc_error(err));
        }
        Ok(decoded.result.unwrap_or(serde_json::Value::Null))
    }

    /// One HTTP request carrying every call. The outer `Result` covers the
    /// transport; each item carries its own JSON-RPC outcome.
    async fn rpc_batch(
        &self,
        method: &str,
        params: &[Vec<serde_json::Value>],
    ) -> Result<Vec<Result<serde_json::Value, CoreError>>, CoreError> {
        self.wait_for_rate_limit().await;
        let start_id = self.reserve_request_ids(params.len() as u64);
        debug!(
            rpc.batch_start_id = start_id,
            rpc.batch_size = params.len(),
            rpc.method = method,
            "rpc batch call"
        );
        let requests: Vec<JsonRpcRequest<'_>> = params
            .iter()
            .enumerate()
            .map(|(offset, p)| JsonRpcRequest {
                jsonrpc: "2.0",
                id: start_id + offset as u64,
                method,
                params: p,
            })
            .collect();

        let body = self.post(&requests).await?;
        debug!(
            rpc.batch_start_id = start_id,
            rpc.batch_size = params.len(),
            body_len = body.len(),
            "rpc batch response"
        );
        trace!(rpc.batch_start_id = start_id, body = %body, "rpc batch response body");

        let decoded: Vec<JsonRpcResponse> = serde_json::from_str(&body).map_err(|e| {
            RpcError::InvalidResponse(format!("decode JSON-RPC batch response: {e}; body={body}"))
        })?;

        let mut by_id: HashMap<u64, JsonRpcResponse> = HashMap::with_capacity(decoded.len());
        for item in decoded {
            let id = parse_batch_id(&item.id)?;
            by_id.insert(id, item);
        }

        let ordered = (start_id..start_id + params.len() as u64)
            .map(|id| {
                let item = by_id.remove(&id).ok_or(RpcError::MissingBatchItem { id })?;
                match item.error.filter(|e| !e.is_null()) {
                    Some(err) => Err(parse_jsonrpc_error(err)),
                    None => Ok(item.result.unwrap_or(serde_json::Value::Null)),
                }
            })
            .collect();
        Ok(ordered)
    }

    async fn rpc_batch_chunked(
        &self,
        method: &str,
        params: &[Vec<serde_json::Value>],
    ) -> Result<Vec<Result<serde_json::Value, CoreError>>, CoreError> {
        if params.is_empty() {
            return Ok(Vec::new());
        }

        // Chunks keep payloads under node/proxy limits and still go out
        // concurrently.
        let chunk_futures: Vec<_> = params
            .chunks(self.batch_chunk_size)
            .map(|chunk| self.rpc_batch(method, chunk))
            .collect();
        let chunked = try_join_all(chunk_futures).await?;
        Ok(chunked.into_iter().flatten().collect())
    }

    /// `getrawtransaction <txid> 1`, with "-5 not found" mapped to
    /// `TxNotFound`.
    pub(super) async fn get_raw_transaction(
        &self,
        txid: &Txid,
    ) -> Result<serde_json::Value, CoreError> {
        self.rpc_call(
            "getrawtransaction",
            &[serde_json::json!(txid.to_string()), serde_json::json!(1)],
        )
        .await
        .map_err(|err| normalize_getrawtransaction_error(txid, err))
    }

    /// Batched `getrawtransaction`, one result per txid in input order.
    pub(super) async fn get_raw_transactions(
        &self,
        txids: &[Txid],
    ) -> Result<Vec<Result<serde_json::Value, CoreError>>, CoreError> {
        let params: Vec<Vec<serde_json::Value>> = txids
            .iter()
            .map(|txid| vec![serde_json::json!(txid.to_string()), serde_json::json!(1)])
            .collect();
        let results = self
            .rpc_batch_chunked("getrawtransaction", &params)
            .await?;
        Ok(results
            .into_iter()
            .zip(txids)
            .map(|(result, txid)| result.map_err(|e| normalize_getrawtransaction_error(txid, e)))
            .collect())
    }

    pub(super) async fn get_block_height(
        &self,
        block_hash: &BlockHash,
    ) -> Result<Option<BlockHeight>, CoreError> {
        // `LruCache::get` updates recency, so even lookups take the write lock.
        if let Some(height) = self
            .block_height_cache
            .write()
            .await
            .get(block_hash)
            .copied()
        {
            return Ok(Some(height));
        }

        let raw = match self
            .rpc_call(
                "getblockheader",
                &[
                    serde_json::json!(block_hash.to_string()),
                    serde_json::json!(true),
                ],
            )
            .await
        {
            Ok(raw) => raw,
            // -5: block not found
            Err(CoreError::Rpc(RpcError::ServerError { code: -5, .. })) => return Ok(None),
            Err(e) => return Err(e),
        };
        let height = parse_integer_optional::<u32, false>(raw.get("height")).map(BlockHeight);
        if let Some(height) = height {
            self.block_height_cache
                .write()
                .await
                .put(*block_hash, height);
        }
        Ok(height)
    }

    pub(super) async fn get_blockchain_info(&self) -> Result<ChainInfo, CoreError> {
        let raw = self.rpc_call("getblockchaininfo", &[]).await?;
        serde_json::from_value(raw).map_err(|e| {
            RpcError::InvalidResponse(format!("invalid getblockchaininfo result: {e}")).into()
        })
    }
}

fn initial_request_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}

// ==============================================================================
// RPC Error Normalization
// ==============================================================================

/// Convert Bitcoin Core "missing tx" JSON-RPC responses into `TxNotFound`,
/// leaving other RPC and transport failures untouched.
fn normalize_getrawtransaction_error(txid: &Txid, err: CoreError) -> CoreError {
    match err {
        CoreError::Rpc(RpcError::ServerError { code, message })
            if is_tx_not_found_server_error(code, &message) =>
        {
            CoreError::TxNotFound(*txid)
        }
        other => other,
    }
}

fn is_tx_not_found_server_error(code: i64, message: &str) -> bool {
    if code != -5 {
        return false;
    }

    let msg = message.to_ascii_lowercase();
    msg.contains("not found") || msg.contains("no such mempool or blockchain transaction")
}
