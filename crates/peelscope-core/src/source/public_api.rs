//! Tertiary source: a public Esplora-style block explorer API
//! (mempool.space, blockstream.info).
//!
//! Responses from a third party are treated as untrusted. Every field is
//! presence- and type-checked; a transaction body that does not hold up is
//! logged and reported as `TxNotFound` rather than trusted partially.

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::{Amount, BlockHash, OutPoint, Script, ScriptBuf, Txid};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::StatusCode;
use tracing::{debug, trace, warn};

use crate::error::{CoreError, RpcError};
use crate::source::TransactionSource;
use crate::types::{BlockHeight, ResolvedInput, ResolvedOutput, ResolvedTransaction, SourceTier};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone)]
pub struct PublicApiConfig {
    /// API root without a trailing slash, e.g. `https://mempool.space/api`.
    pub base_url: String,
    /// Minimum spacing between consecutive calls through one source.
    /// Zero disables the limiter.
    pub min_interval: Duration,
    pub timeout: Duration,
}

impl Default for PublicApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://mempool.space/api".to_owned(),
            min_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct PublicApiSource {
    client: reqwest::Client,
    base_url: String,
    limiter: Option<DirectRateLimiter>,
}

impl PublicApiSource {
    pub fn new(config: PublicApiConfig) -> Result<Self, CoreError> {
        let base_url = config.base_url.trim_end_matches('/').to_owned();
        reqwest::Url::parse(&base_url)
            .map_err(|e| CoreError::Config(format!("invalid public api url `{base_url}`: {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(RpcError::Transport)?;

        // One cell per period, no burst: calls are spaced by `min_interval`.
        let limiter = Quota::with_period(config.min_interval)
            .map(|quota| RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN)));

        Ok(Self {
            client,
            base_url,
            limiter,
        })
    }

    /// GET `path`; `Ok(None)` on 404. Other non-2xx statuses are transport
    /// failures.
    async fn get_text(&self, path: &str) -> Result<Option<String>, CoreError> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "public api request");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(RpcError::Transport)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(RpcError::HttpStatus {
                status: status.as_u16(),
                url,
            }
            .into());
        }
        let body = response.text().await.map_err(RpcError::Transport)?;
        trace!(%url, body = %body, "public api response body");
        Ok(Some(body))
    }
}

#[async_trait]
impl TransactionSource for PublicApiSource {
    fn tier(&self) -> SourceTier {
        SourceTier::Tertiary
    }

    fn name(&self) -> &'static str {
        "public api"
    }

    async fn fetch_transaction(&self, txid: &Txid) -> Result<ResolvedTransaction, CoreError> {
        let Some(body) = self.get_text(&format!("/tx/{txid}")).await? else {
            return Err(CoreError::TxNotFound(*txid));
        };
        let parsed = serde_json::from_str::<serde_json::Value>(&body)
            .map_err(|e| format!("body is not JSON: {e}"))
            .and_then(|raw| parse_esplora_transaction(&raw));
        match parsed {
            Ok(tx) if tx.txid == *txid => Ok(tx),
            Ok(tx) => {
                warn!(%txid, returned = %tx.txid, "public api returned a different transaction");
                Err(CoreError::TxNotFound(*txid))
            }
            Err(reason) => {
                warn!(%txid, %reason, "public api transaction rejected");
                Err(CoreError::TxNotFound(*txid))
            }
        }
    }

    async fn fetch_block_height(
        &self,
        block_hash: &BlockHash,
    ) -> Result<Option<BlockHeight>, CoreError> {
        let Some(body) = self.get_text(&format!("/block/{block_hash}")).await? else {
            return Ok(None);
        };
        let raw: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| RpcError::InvalidResponse(format!("block body is not JSON: {e}")))?;
        let height = raw
            .get("height")
            .and_then(serde_json::Value::as_u64)
            .and_then(|h| u32::try_from(h).ok())
            .map(BlockHeight);
        if height.is_none() {
            warn!(%block_hash, "public api block without a usable height");
        }
        Ok(height)
    }

    async fn find_spending_transaction(
        &self,
        outpoint: &OutPoint,
        _script_pub_key: Option<&Script>,
    ) -> Result<Option<Txid>, CoreError> {
        let path = format!("/tx/{}/outspend/{}", outpoint.txid, outpoint.vout);
        let Some(body) = self.get_text(&path).await? else {
            return Ok(None);
        };
        Ok(parse_outspend(&body)?)
    }

    async fn probe(&self) -> Result<(), CoreError> {
        let body = self
            .get_text("/blocks/tip/height")
            .await?
            .ok_or_else(|| RpcError::InvalidResponse("tip height endpoint missing".into()))?;
        body.trim()
            .parse::<u64>()
            .map(|_| ())
            .map_err(|e| RpcError::InvalidResponse(format!("invalid tip height `{body}`: {e}")).into())
    }
}

// ==============================================================================
// Response Translation
// ==============================================================================

fn parse_esplora_transaction(raw: &serde_json::Value) -> Result<ResolvedTransaction, String> {
    let obj = raw.as_object().ok_or("response is not an object")?;
    let txid: Txid = obj
        .get("txid")
        .and_then(serde_json::Value::as_str)
        .ok_or("missing txid")?
        .parse()
        .map_err(|e| format!("invalid txid: {e}"))?;

    let (observed_time, block_hash, block_height) = parse_status(obj.get("status"));

    let inputs = obj
        .get("vin")
        .and_then(serde_json::Value::as_array)
        .ok_or("missing vin array")?
        .iter()
        .enumerate()
        .map(|(i, vin)| parse_esplora_input(vin).map_err(|e| format!("vin[{i}]: {e}")))
        .collect::<Result<Vec<_>, _>>()?;

    let outputs = obj
        .get("vout")
        .and_then(serde_json::Value::as_array)
        .ok_or("missing vout array")?
        .iter()
        .enumerate()
        .map(|(i, vout)| parse_esplora_output(i as u32, vout).map_err(|e| format!("vout[{i}]: {e}")))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ResolvedTransaction {
        txid,
        observed_time,
        block_hash,
        block_height,
        input_value_total: None,
        inputs,
        outputs,
    })
}

/// `status` is optional and each member inside it is optional too.
fn parse_status(
    status: Option<&serde_json::Value>,
) -> (Option<u64>, Option<BlockHash>, Option<BlockHeight>) {
    let Some(status) = status.filter(|s| s.is_object()) else {
        return (None, None, None);
    };
    if status.get("confirmed").and_then(serde_json::Value::as_bool) != Some(true) {
        return (None, None, None);
    }
    let time = status.get("block_time").and_then(serde_json::Value::as_u64);
    let hash = status
        .get("block_hash")
        .and_then(serde_json::Value::as_str)
        .and_then(|s| s.parse().ok());
    let height = status
        .get("block_height")
        .and_then(serde_json::Value::as_u64)
        .and_then(|h| u32::try_from(h).ok())
        .map(BlockHeight);
    (time, hash, height)
}

fn parse_esplora_input(vin: &serde_json::Value) -> Result<ResolvedInput, String> {
    let vin = vin.as_object().ok_or("not an object")?;
    if vin.get("is_coinbase").and_then(serde_json::Value::as_bool) == Some(true) {
        return Ok(ResolvedInput {
            prevout: None,
            value: None,
            address: None,
            creation_time: None,
        });
    }

    let prev_txid: Txid = vin
        .get("txid")
        .and_then(serde_json::Value::as_str)
        .ok_or("missing txid")?
        .parse()
        .map_err(|e| format!("invalid txid: {e}"))?;
    let prev_vout = vin
        .get("vout")
        .and_then(serde_json::Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or("missing or invalid vout")?;

    let prevout = vin.get("prevout").filter(|p| p.is_object());
    let value = match prevout.and_then(|p| p.get("value")).filter(|v| !v.is_null()) {
        None => None,
        Some(raw) => Some(parse_sats(raw).map_err(|e| format!("prevout {e}"))?),
    };
    let address = prevout
        .and_then(|p| p.get("scriptpubkey_address"))
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned);

    Ok(ResolvedInput {
        prevout: Some(OutPoint::new(prev_txid, prev_vout)),
        value,
        address,
        creation_time: None,
    })
}

fn parse_esplora_output(index: u32, vout: &serde_json::Value) -> Result<ResolvedOutput, String> {
    let vout = vout.as_object().ok_or("not an object")?;
    let value = parse_sats(vout.get("value").ok_or("missing value")?)?;
    let script_pub_key = vout
        .get("scriptpubkey")
        .and_then(serde_json::Value::as_str)
        .and_then(|hex| ScriptBuf::from_hex(hex).ok());
    let address = vout
        .get("scriptpubkey_address")
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned);

    Ok(ResolvedOutput {
        index,
        value,
        address,
        script_pub_key,
        is_spent: false,
        spending_txid: None,
    })
}

/// Integer satoshis within the money range.
fn parse_sats(raw: &serde_json::Value) -> Result<Amount, String> {
    let sats = raw
        .as_u64()
        .ok_or_else(|| format!("value is not an integer: {raw}"))?;
    let amount = Amount::from_sat(sats);
    if amount > Amount::MAX_MONEY {
        return Err(format!("value {sats} sat exceeds the money supply"));
    }
    Ok(amount)
}

fn parse_outspend(body: &str) -> Result<Option<Txid>, RpcError> {
    let raw: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| RpcError::InvalidResponse(format!("outspend body is not JSON: {e}")))?;
    if raw.get("spent").and_then(serde_json::Value::as_bool) != Some(true) {
        return Ok(None);
    }
    raw.get("txid")
        .and_then(serde_json::Value::as_str)
        .and_then(|s| s.parse().ok())
        .map(Some)
        .ok_or_else(|| RpcError::InvalidResponse(format!("spent outspend without txid: {body}")))
}
