use bitcoin::Txid;

use crate::types::SourceTier;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("transaction not found: {0}")]
    TxNotFound(Txid),

    #[error("{tier} source unavailable: {detail}")]
    SourceUnavailable { tier: SourceTier, detail: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("{tier} source does not support {operation}")]
    Unsupported {
        tier: SourceTier,
        operation: &'static str,
    },

    #[error("transaction {txid} could not be resolved: {reason}")]
    Unresolved { txid: Txid, reason: String },

    #[error("invalid transaction data: {0}")]
    InvalidTxData(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("graph store failure: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// A valid negative answer: the source is healthy but does not have
    /// the object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TxNotFound(_))
    }

    /// Infrastructure failures that make a source eligible for fallback.
    /// Protocol and transport failures are folded in here; a malformed
    /// response is indistinguishable from a broken server for routing.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable { .. } | Self::Protocol(_) | Self::Rpc(_) | Self::Io(_)
        )
    }
}

/// Failure talking the Electrum line protocol.
///
/// Connection refusal, TLS handshake failure, timeouts, malformed lines and
/// server-side `error` members all collapse into this one shape so callers
/// only have to decide whether to fall back.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{origin} `{method}` failed: {detail}")]
pub struct ProtocolError {
    /// `host:port` of the server the request was sent to.
    pub origin: String,
    pub method: String,
    pub detail: String,
}

impl ProtocolError {
    pub fn new(
        origin: impl Into<String>,
        method: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            origin: origin.into(),
            method: method.into(),
            detail: detail.into(),
        }
    }
}

/// Errors raised by the HTTP-based sources (JSON-RPC node, block explorer API).
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("RPC server error {code}: {message}")]
    ServerError { code: i64, message: String },

    #[error("unexpected HTTP status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("invalid RPC response: {0}")]
    InvalidResponse(String),

    #[error("missing JSON-RPC batch item id={id}")]
    MissingBatchItem { id: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::txid_from_byte;

    #[test]
    fn not_found_is_not_unavailable() {
        let err = CoreError::TxNotFound(txid_from_byte(1));
        assert!(err.is_not_found());
        assert!(!err.is_unavailable());
    }

    #[test]
    fn protocol_error_counts_as_unavailable() {
        let err: CoreError =
            ProtocolError::new("127.0.0.1:50002", "server.ping", "connection refused").into();
        assert!(err.is_unavailable());
        assert!(err.to_string().contains("server.ping"));
    }

    #[test]
    fn unsupported_is_neither_outcome() {
        let err = CoreError::Unsupported {
            tier: SourceTier::Secondary,
            operation: "fetch_transaction",
        };
        assert!(!err.is_not_found());
        assert!(!err.is_unavailable());
    }
}
