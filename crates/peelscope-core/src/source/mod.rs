//! Transaction sources, ordered by trust.
//!
//! Defines the [`TransactionSource`] capability trait and its three
//! implementations: the local Bitcoin Core node ([`LocalNodeSource`]), an
//! Electrum-protocol server used for spend lookups ([`ElectrumSource`]),
//! and a public Esplora-style block explorer ([`PublicApiSource`]).

pub mod electrum;
pub mod local_node;
#[cfg(test)]
pub mod mock;
pub(crate) mod parsing;
pub mod public_api;

pub use electrum::{ElectrumClient, ElectrumConfig, ElectrumSession, ElectrumSource};
pub use local_node::{LocalNodeConfig, LocalNodeSource};
pub use public_api::{PublicApiConfig, PublicApiSource};

use async_trait::async_trait;
use bitcoin::{BlockHash, OutPoint, Script, Txid};

use crate::error::CoreError;
use crate::types::{BlockHeight, ResolvedTransaction, SourceTier};

/// A place transactions and spend edges can be looked up.
///
/// `CoreError::TxNotFound` is a healthy negative answer. Errors for which
/// [`CoreError::is_unavailable`] holds mean the source itself is unusable
/// right now and the caller may fall back to a lower tier.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    fn tier(&self) -> SourceTier;

    /// Short human-readable name used in logs.
    fn name(&self) -> &'static str;

    /// Fetch and normalize a transaction by txid.
    async fn fetch_transaction(&self, txid: &Txid) -> Result<ResolvedTransaction, CoreError>;

    /// Height of a block, `None` if the source does not know the block.
    async fn fetch_block_height(
        &self,
        block_hash: &BlockHash,
    ) -> Result<Option<BlockHeight>, CoreError>;

    /// Txid of the transaction spending `outpoint`, `None` when unspent.
    ///
    /// `script_pub_key` is the locking script of the output when the caller
    /// already knows it; sources that key spends by script use it to avoid
    /// a lookup.
    async fn find_spending_transaction(
        &self,
        outpoint: &OutPoint,
        script_pub_key: Option<&Script>,
    ) -> Result<Option<Txid>, CoreError> {
        let _ = (outpoint, script_pub_key);
        Err(CoreError::Unsupported {
            tier: self.tier(),
            operation: "find_spending_transaction",
        })
    }

    /// Cheap health check. `Ok(())` means the source can serve requests.
    async fn probe(&self) -> Result<(), CoreError>;
}
