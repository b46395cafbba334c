mod cli;
mod output;
mod prompt;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::WrapErr;
use serde_json::json;

use peelscope_core::flow::{analyze_fan_in, analyze_fan_out};
use peelscope_core::path::trace_path;
use peelscope_core::source::{
    ElectrumConfig, ElectrumSource, LocalNodeConfig, LocalNodeSource, PublicApiConfig,
    PublicApiSource, TransactionSource,
};
use peelscope_core::{
    trace_peeling_chain, AllowFallback, AuthorizationPort, DenyFallback, GraphStore,
    MemoryGraphStore, OrchestratorConfig, SourceOrchestrator, SourceSet, TraceLimits,
    TransactionResolver,
};

use cli::{Command, FallbackMode};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .init();

    let store: Arc<dyn GraphStore> = match &args.store {
        Some(path) => {
            let store = MemoryGraphStore::open(path).wrap_err("open graph store file")?;
            tracing::info!(path = %path.display(), "using persisted graph store");
            Arc::new(store)
        }
        None => Arc::new(MemoryGraphStore::new()),
    };

    let orchestrator = build_orchestrator(&args, store).await?;
    let outcome = run(&args.command, &orchestrator).await;
    orchestrator.shutdown_summary().await;

    let rendered = outcome?;
    println!("{rendered}");
    Ok(())
}

async fn build_orchestrator(
    args: &cli::Cli,
    store: Arc<dyn GraphStore>,
) -> eyre::Result<SourceOrchestrator> {
    let primary = if args.no_local_node {
        LocalNodeSource::disabled("disabled with --no-local-node")
    } else {
        LocalNodeSource::connect(LocalNodeConfig {
            url: args.node_url.clone(),
            user: args.node_user.clone(),
            pass: args.node_pass.clone(),
            cookie_file: args.node_cookie.clone(),
            requests_per_second: args.node_requests_per_second,
            ..LocalNodeConfig::default()
        })
        .await
    };

    let electrum: Option<Arc<dyn TransactionSource>> = match &args.electrum_host {
        Some(host) => {
            let source = ElectrumSource::new(ElectrumConfig {
                host: host.clone(),
                port: args.electrum_port,
                timeout: Duration::from_secs(args.electrum_timeout_secs),
            })
            .wrap_err("configure electrum source")?;
            tracing::warn!(
                origin = %source.client().origin(),
                "electrum TLS certificate is not verified; the host is trusted by address"
            );
            Some(Arc::new(source))
        }
        None => None,
    };

    let public_api: Option<Arc<dyn TransactionSource>> = if args.no_public_api {
        None
    } else {
        Some(Arc::new(
            PublicApiSource::new(PublicApiConfig {
                base_url: args.public_api_url.clone(),
                min_interval: Duration::from_millis(args.public_api_interval_ms),
                ..PublicApiConfig::default()
            })
            .wrap_err("configure public api source")?,
        ))
    };

    let authorization: Arc<dyn AuthorizationPort> = match args.fallback {
        FallbackMode::Ask => Arc::new(prompt::TerminalPrompt),
        FallbackMode::Allow => Arc::new(AllowFallback),
        FallbackMode::Deny => Arc::new(DenyFallback),
    };

    Ok(SourceOrchestrator::new(
        SourceSet {
            primary: Arc::new(primary),
            electrum,
            public_api,
        },
        store,
        authorization,
        OrchestratorConfig::default(),
    ))
}

/// Execute one command and render its JSON report.
async fn run(command: &Command, orchestrator: &SourceOrchestrator) -> eyre::Result<String> {
    let result = match command {
        Command::Store { txids } => {
            let mut stored = Vec::with_capacity(txids.len());
            for txid in txids {
                let tx = orchestrator
                    .store_transaction(txid)
                    .await
                    .wrap_err_with(|| format!("store transaction {txid}"))?;
                stored.push(tx);
            }
            serde_json::to_value(stored)
        }
        Command::TracePath { txid, max_steps } => {
            let path = trace_path(orchestrator, *txid, *max_steps)
                .await
                .wrap_err("trace value path")?;
            serde_json::to_value(path)
        }
        Command::Delete {
            txid,
            with_outpoints,
        } => {
            let store = orchestrator.store();
            let deleted = if *with_outpoints {
                store.delete_transaction_and_outpoints(txid).await
            } else {
                store.delete_transaction(txid).await
            }
            .wrap_err("delete transaction")?;
            if !deleted {
                tracing::warn!(txid = %txid, "transaction was not in the graph store");
            }
            Ok(json!({ "txid": txid, "with_outpoints": with_outpoints, "deleted": deleted }))
        }
        Command::DeleteOutpoint { outpoint } => {
            let deleted = orchestrator
                .store()
                .delete_outpoint(outpoint)
                .await
                .wrap_err("delete outpoint")?;
            if !deleted {
                tracing::warn!(outpoint = %outpoint, "outpoint was not in the graph store");
            }
            Ok(json!({ "outpoint": outpoint, "deleted": deleted }))
        }
        Command::Peel { txid, max_hops } => {
            let trace = trace_peeling_chain(
                orchestrator,
                *txid,
                &TraceLimits {
                    max_hops: *max_hops,
                },
            )
            .await;
            let times: Vec<u64> = trace.steps.iter().filter_map(|s| s.observed_time).collect();
            if let (Some(first), Some(last)) = (times.first(), times.last()) {
                tracing::info!(
                    from = %output::format_unix(*first)?,
                    to = %output::format_unix(*last)?,
                    steps = trace.steps.len(),
                    "peeling chain time span"
                );
            }
            if trace.termination.is_partial() {
                tracing::warn!(termination = ?trace.termination, "result is partial");
            }
            serde_json::to_value(trace)
        }
        Command::FanIn { txid } => {
            let tx = orchestrator.resolve(txid).await.wrap_err("resolve transaction")?;
            serde_json::to_value(analyze_fan_in(orchestrator, &tx).await)
        }
        Command::FanOut { txid } => {
            let tx = orchestrator.resolve(txid).await.wrap_err("resolve transaction")?;
            let report = analyze_fan_out(&tx).wrap_err("analyze fan-out")?;
            serde_json::to_value(report)
        }
    }
    .wrap_err("serialize result")?;

    output::render(command.name(), orchestrator.state().await, result)
}
