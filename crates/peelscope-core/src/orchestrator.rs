//! Source fallback orchestration.
//!
//! [`SourceOrchestrator`] answers "give me this transaction" and "who spends
//! this outpoint" by consulting the graph store first and then the most
//! trusted source that is currently authoritative. It owns the
//! [`SourceState`]: demotion to the public API needs explicit authorization
//! through an [`AuthorizationPort`], while recovery to the local node is
//! attempted automatically every `recovery_interval` degraded operations.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bitcoin::{OutPoint, Script, Txid};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::source::TransactionSource;
use crate::store::GraphStore;
use crate::types::{ResolvedTransaction, SourceState, SourceTier};

// ==============================================================================
// Resolver Capability
// ==============================================================================

/// What the tracers need from the data layer.
#[async_trait]
pub trait TransactionResolver: Send + Sync {
    /// Resolve a transaction, or fail with `CoreError::Unresolved`.
    async fn resolve(&self, txid: &Txid) -> Result<ResolvedTransaction, CoreError>;

    /// Spender of `outpoint`, `None` when it is unspent.
    async fn find_spender(
        &self,
        outpoint: &OutPoint,
        script_pub_key: Option<&Script>,
    ) -> Result<Option<Txid>, CoreError>;
}

// ==============================================================================
// Fallback Authorization
// ==============================================================================

/// A pending demotion from a trusted tier to a less trusted one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackRequest {
    pub from: SourceTier,
    pub to: SourceTier,
    /// Operation that triggered the request, e.g. `resolve <txid>`.
    pub operation: String,
    /// Failure reported by the `from` tier.
    pub reason: String,
}

/// Decides whether the orchestrator may demote to a less trusted tier.
///
/// Called synchronously while the orchestrator holds its state lock, so an
/// implementation that blocks (an interactive prompt) serializes demotions.
pub trait AuthorizationPort: Send + Sync {
    fn authorize(&self, request: &FallbackRequest) -> bool;
}

/// Never falls back.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyFallback;

impl AuthorizationPort for DenyFallback {
    fn authorize(&self, request: &FallbackRequest) -> bool {
        debug!(from = %request.from, to = %request.to, "fallback denied by policy");
        false
    }
}

/// Always falls back.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowFallback;

impl AuthorizationPort for AllowFallback {
    fn authorize(&self, request: &FallbackRequest) -> bool {
        debug!(from = %request.from, to = %request.to, "fallback allowed by policy");
        true
    }
}

/// Replays a fixed list of answers and records every request. Once the
/// answers run out it refuses.
#[derive(Debug, Default)]
pub struct ScriptedAuthorization {
    answers: StdMutex<VecDeque<bool>>,
    requests: StdMutex<Vec<FallbackRequest>>,
}

impl ScriptedAuthorization {
    pub fn new(answers: impl IntoIterator<Item = bool>) -> Self {
        Self {
            answers: StdMutex::new(answers.into_iter().collect()),
            requests: StdMutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<FallbackRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl AuthorizationPort for ScriptedAuthorization {
    fn authorize(&self, request: &FallbackRequest) -> bool {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());
        self.answers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .unwrap_or(false)
    }
}

// ==============================================================================
// Orchestrator
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Degraded operations between two Primary recovery probes.
    pub recovery_interval: u32,
    /// Network-resolved transactions kept in memory.
    pub cache_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            recovery_interval: 5,
            cache_capacity: 10_000,
        }
    }
}

/// The sources an orchestrator routes between.
pub struct SourceSet {
    pub primary: Arc<dyn TransactionSource>,
    /// Spend lookups while Primary is authoritative.
    pub electrum: Option<Arc<dyn TransactionSource>>,
    /// Demotion target for both transaction bodies and spend lookups.
    pub public_api: Option<Arc<dyn TransactionSource>>,
}

/// End-of-session accounting, logged by [`SourceOrchestrator::shutdown_summary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub authoritative: SourceTier,
    pub degraded_operations: u64,
}

pub struct SourceOrchestrator {
    sources: SourceSet,
    store: Arc<dyn GraphStore>,
    authorization: Arc<dyn AuthorizationPort>,
    config: OrchestratorConfig,
    resolved: quick_cache::sync::Cache<Txid, ResolvedTransaction>,
    state: Mutex<SourceState>,
    degraded_total: AtomicU64,
}

impl SourceOrchestrator {
    pub fn new(
        sources: SourceSet,
        store: Arc<dyn GraphStore>,
        authorization: Arc<dyn AuthorizationPort>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            resolved: quick_cache::sync::Cache::new(config.cache_capacity.max(1)),
            sources,
            store,
            authorization,
            config,
            state: Mutex::new(SourceState::default()),
            degraded_total: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub async fn state(&self) -> SourceState {
        *self.state.lock().await
    }

    /// Resolve `txid` and write it to the graph store.
    pub async fn store_transaction(&self, txid: &Txid) -> Result<ResolvedTransaction, CoreError> {
        let tx = self.resolve(txid).await?;
        self.store.put_transaction(&tx).await?;
        info!(txid = %txid, outputs = tx.outputs.len(), "transaction stored");
        Ok(tx)
    }

    pub async fn shutdown_summary(&self) -> SessionSummary {
        let summary = SessionSummary {
            authoritative: self.state.lock().await.authoritative,
            degraded_operations: self.degraded_total.load(Ordering::Relaxed),
        };
        if summary.degraded_operations > 0 {
            warn!(
                authoritative = %summary.authoritative,
                degraded_operations = summary.degraded_operations,
                "session used lower-trust sources"
            );
        } else {
            info!(authoritative = %summary.authoritative, "session served by primary source only");
        }
        summary
    }

    /// Probe Primary once enough degraded operations have accumulated.
    /// The counter resets whether or not the probe succeeds.
    async fn maybe_recover(&self) {
        let mut state = self.state.lock().await;
        if !state.is_degraded() || state.degraded_step_count < self.config.recovery_interval {
            return;
        }
        state.degraded_step_count = 0;
        match self.sources.primary.probe().await {
            Ok(()) => {
                info!(from = %state.authoritative, "primary source recovered");
                state.authoritative = SourceTier::Primary;
            }
            Err(e) => {
                debug!(error = %e, "primary source still unavailable");
            }
        }
    }

    async fn record_degraded(&self) {
        let mut state = self.state.lock().await;
        if state.is_degraded() {
            state.degraded_step_count += 1;
            self.degraded_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Ask for permission to move from `from` to the public API tier.
    /// Returns whether the caller should retry at the new tier.
    async fn demote(&self, from: SourceTier, operation: String, reason: String) -> bool {
        if self.sources.public_api.is_none() {
            warn!(from = %from, "no lower-trust source configured");
            return false;
        }
        let mut state = self.state.lock().await;
        if state.authoritative != from {
            // Another caller already moved the state on.
            return true;
        }
        let request = FallbackRequest {
            from,
            to: SourceTier::Tertiary,
            operation,
            reason,
        };
        if !self.authorization.authorize(&request) {
            warn!(from = %from, operation = %request.operation, "fallback refused");
            return false;
        }
        info!(from = %from, to = %request.to, reason = %request.reason, "demoting to public api");
        state.authoritative = SourceTier::Tertiary;
        state.degraded_step_count = 0;
        true
    }

    fn source_for(&self, tier: SourceTier) -> Option<&Arc<dyn TransactionSource>> {
        match tier {
            SourceTier::Primary => Some(&self.sources.primary),
            SourceTier::Secondary => self.sources.electrum.as_ref(),
            SourceTier::Tertiary => self.sources.public_api.as_ref(),
        }
    }

    async fn from_store(&self, txid: &Txid) -> Option<ResolvedTransaction> {
        match self.store.get_transaction(txid).await {
            Ok(Some(stored)) => {
                let resolved = stored.to_resolved();
                if resolved.is_none() {
                    debug!(txid = %txid, "stored record incomplete");
                }
                resolved
            }
            Ok(None) => None,
            Err(e) => {
                warn!(txid = %txid, error = %e, "graph store read failed");
                None
            }
        }
    }

    async fn fill_block_height(&self, source: &dyn TransactionSource, tx: &mut ResolvedTransaction) {
        let (None, Some(block_hash)) = (tx.block_height, tx.block_hash) else {
            return;
        };
        match source.fetch_block_height(&block_hash).await {
            Ok(height) => tx.block_height = height,
            Err(e) => debug!(txid = %tx.txid, error = %e, "block height lookup failed"),
        }
    }
}

#[async_trait]
impl TransactionResolver for SourceOrchestrator {
    async fn resolve(&self, txid: &Txid) -> Result<ResolvedTransaction, CoreError> {
        self.maybe_recover().await;

        if let Some(tx) = self.from_store(txid).await {
            debug!(txid = %txid, "served from graph store");
            return Ok(tx);
        }
        if let Some(tx) = self.resolved.get(txid) {
            return Ok(tx);
        }

        loop {
            let tier = self.state.lock().await.authoritative;
            let Some(source) = self.source_for(tier) else {
                return Err(CoreError::Unresolved {
                    txid: *txid,
                    reason: format!("no {tier} source configured"),
                });
            };
            let outcome = source.fetch_transaction(txid).await;
            if tier != SourceTier::Primary {
                self.record_degraded().await;
            }

            match outcome {
                Ok(mut tx) => {
                    self.fill_block_height(source.as_ref(), &mut tx).await;
                    debug!(txid = %txid, source = source.name(), "resolved");
                    self.resolved.insert(*txid, tx.clone());
                    return Ok(tx);
                }
                Err(e) if e.is_not_found() => {
                    return Err(CoreError::Unresolved {
                        txid: *txid,
                        reason: format!("{} has no record of it", source.name()),
                    });
                }
                Err(e) if e.is_unavailable() && tier == SourceTier::Primary => {
                    warn!(txid = %txid, error = %e, "primary source failed");
                    if !self
                        .demote(tier, format!("resolve {txid}"), e.to_string())
                        .await
                    {
                        return Err(CoreError::Unresolved {
                            txid: *txid,
                            reason: e.to_string(),
                        });
                    }
                }
                Err(e) => {
                    return Err(CoreError::Unresolved {
                        txid: *txid,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    async fn find_spender(
        &self,
        outpoint: &OutPoint,
        script_pub_key: Option<&Script>,
    ) -> Result<Option<Txid>, CoreError> {
        self.maybe_recover().await;

        match self.store.find_spending_transaction(outpoint).await {
            Ok(Some(spender)) => return Ok(Some(spender)),
            Ok(None) => {}
            Err(e) => warn!(outpoint = %outpoint, error = %e, "graph store spend lookup failed"),
        }

        loop {
            let tier = self.state.lock().await.authoritative;
            if tier == SourceTier::Primary {
                let failure = match &self.sources.electrum {
                    Some(electrum) => {
                        match electrum.find_spending_transaction(outpoint, script_pub_key).await {
                            Err(e) if e.is_unavailable() => e,
                            other => return other,
                        }
                    }
                    None => CoreError::SourceUnavailable {
                        tier: SourceTier::Secondary,
                        detail: "no electrum server configured".to_owned(),
                    },
                };
                warn!(outpoint = %outpoint, error = %failure, "spend lookup source failed");
                if !self
                    .demote(tier, format!("find spender of {outpoint}"), failure.to_string())
                    .await
                {
                    return Err(failure);
                }
                continue;
            }

            let Some(source) = self.source_for(tier) else {
                return Err(CoreError::SourceUnavailable {
                    tier,
                    detail: "source not configured".to_owned(),
                });
            };
            let outcome = source.find_spending_transaction(outpoint, script_pub_key).await;
            self.record_degraded().await;
            return outcome;
        }
    }
}
