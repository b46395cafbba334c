//! Electrum-protocol client and the secondary source built on it.
//!
//! The wire client speaks newline-delimited JSON-RPC over TLS. It is used
//! for one thing: finding which transaction spends a given output, which a
//! plain Bitcoin Core node cannot answer.

mod protocol;
mod scripthash;
mod session;
mod tls;

pub use protocol::HistoryEntry;
pub use scripthash::{script_hash, ScriptHash};
pub use session::{ElectrumClient, ElectrumSession};

use std::time::Duration;

use async_trait::async_trait;
use bitcoin::{BlockHash, OutPoint, Script, Txid};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::error::CoreError;
use crate::source::TransactionSource;
use crate::types::{BlockHeight, ResolvedTransaction, SourceTier};

/// Electrum server address.
///
/// Connections use TLS but the server certificate is **not** validated;
/// the host is trusted by address. Point this only at a server you run or
/// otherwise trust.
#[derive(Debug, Clone)]
pub struct ElectrumConfig {
    pub host: String,
    pub port: u16,
    /// Applied to connect, handshake, and every read and write.
    pub timeout: Duration,
}

impl Default for ElectrumConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 50002,
            timeout: Duration::from_secs(20),
        }
    }
}

/// Secondary source. Answers spend lookups only.
pub struct ElectrumSource {
    client: ElectrumClient,
}

impl ElectrumSource {
    pub fn new(config: ElectrumConfig) -> Result<Self, CoreError> {
        Ok(Self {
            client: ElectrumClient::new(config)?,
        })
    }

    pub fn client(&self) -> &ElectrumClient {
        &self.client
    }
}

/// Spend lookup on an open session, reading the locking script from the
/// creating transaction when the caller does not supply it.
async fn lookup_spender<S>(
    session: &mut ElectrumSession<S>,
    outpoint: &OutPoint,
    script_pub_key: Option<&Script>,
) -> Result<Option<Txid>, CoreError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let fetched;
    let script = match script_pub_key {
        Some(script) => script,
        None => {
            debug!(%outpoint, "fetching creating tx for scriptPubKey");
            fetched = session
                .output_script(outpoint)
                .await?
                .ok_or(CoreError::TxNotFound(outpoint.txid))?;
            fetched.as_script()
        }
    };
    Ok(session.find_spending_transaction(outpoint, script).await?)
}

#[async_trait]
impl TransactionSource for ElectrumSource {
    fn tier(&self) -> SourceTier {
        SourceTier::Secondary
    }

    fn name(&self) -> &'static str {
        "electrum"
    }

    async fn fetch_transaction(&self, _txid: &Txid) -> Result<ResolvedTransaction, CoreError> {
        Err(CoreError::Unsupported {
            tier: SourceTier::Secondary,
            operation: "fetch_transaction",
        })
    }

    async fn fetch_block_height(
        &self,
        _block_hash: &BlockHash,
    ) -> Result<Option<BlockHeight>, CoreError> {
        Err(CoreError::Unsupported {
            tier: SourceTier::Secondary,
            operation: "fetch_block_height",
        })
    }

    async fn find_spending_transaction(
        &self,
        outpoint: &OutPoint,
        script_pub_key: Option<&Script>,
    ) -> Result<Option<Txid>, CoreError> {
        let mut session = self.client.connect().await?;
        lookup_spender(&mut session, outpoint, script_pub_key).await
    }

    async fn probe(&self) -> Result<(), CoreError> {
        Ok(self.client.ping().await?)
    }
}
