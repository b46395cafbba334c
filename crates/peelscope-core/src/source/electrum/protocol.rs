//! Electrum line protocol: one JSON-RPC document per newline-terminated line.

use bitcoin::Txid;
use serde::{Deserialize, Serialize};

pub(super) const METHOD_PING: &str = "server.ping";
pub(super) const METHOD_SUBSCRIBE: &str = "blockchain.scripthash.subscribe";
pub(super) const METHOD_UNSUBSCRIBE: &str = "blockchain.scripthash.unsubscribe";
pub(super) const METHOD_GET_HISTORY: &str = "blockchain.scripthash.get_history";
pub(super) const METHOD_TX_GET: &str = "blockchain.transaction.get";

#[derive(Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a [serde_json::Value],
}

#[derive(Deserialize)]
struct Message {
    #[serde(default)]
    id: serde_json::Value,
    method: Option<String>,
    result: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
}

/// One entry of `blockchain.scripthash.get_history`. Mempool entries have
/// a height of `0` or `-1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub tx_hash: Txid,
    pub height: i64,
}

/// A decoded incoming line.
#[derive(Debug)]
pub(super) enum Incoming {
    /// Server-initiated notification (no id); not an answer to anything.
    Notification { method: String },
    Response {
        id: u64,
        /// `Err` carries the server's `error` member verbatim.
        outcome: Result<serde_json::Value, String>,
    },
}

/// Serialize a request as a single line, newline included.
pub(super) fn encode_request(
    id: u64,
    method: &str,
    params: &[serde_json::Value],
) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(&Request {
        jsonrpc: "2.0",
        id,
        method,
        params,
    })?;
    line.push(b'\n');
    Ok(line)
}

pub(super) fn decode_line(line: &[u8]) -> Result<Incoming, String> {
    let message: Message =
        serde_json::from_slice(line).map_err(|e| format!("malformed response line: {e}"))?;

    if message.id.is_null() {
        return match message.method {
            Some(method) => Ok(Incoming::Notification { method }),
            None => Err("response without id".to_owned()),
        };
    }

    let id = message
        .id
        .as_u64()
        .or_else(|| message.id.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| format!("invalid response id: {}", message.id))?;

    let outcome = match message.error.filter(|e| !e.is_null()) {
        Some(err) => Err(err.to_string()),
        None => Ok(message.result.unwrap_or(serde_json::Value::Null)),
    };
    Ok(Incoming::Response { id, outcome })
}
