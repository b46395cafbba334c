pub mod error;
pub mod flow;
pub mod metrics;
pub mod orchestrator;
pub mod path;
pub mod source;
pub mod store;
pub mod trace;
pub mod types;

#[cfg(test)]
pub(crate) mod test_util;

pub use error::CoreError;
pub use orchestrator::{
    AllowFallback, AuthorizationPort, DenyFallback, FallbackRequest, OrchestratorConfig,
    ScriptedAuthorization, SourceOrchestrator, SourceSet, TransactionResolver,
};
pub use store::{GraphStore, MemoryGraphStore};
pub use trace::trace_peeling_chain;
pub use types::{ChainTrace, ResolvedTransaction, SourceState, SourceTier, TraceLimits};
