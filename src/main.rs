use alloy::providers::{Provider, RootProvider};
use alloy::transports::http::Http;
use reqwest::Client;
use chainguard::alerts::AlertDispatcher;
use chainguard::analyzer::Analyzer;
use chainguard::explorer::{ExplorerClient, ExplorerRouter, RateGate};
use chainguard::orchestrator::{run_workers, ChainReporter, Orchestrator};
use chainguard::report_store::ReportStore;
use chainguard::reporter::OnchainReporter;
use chainguard::scan_queue::ScanQueue;
use chainguard::storage::contracts_db::ContractsDb;
use chainguard::utils::config::Config;
use chainguard::watcher::spawn_watcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match std::env::var("RUST_LOG") {
        Ok(val) => println!("[STARTUP] RUST_LOG is set to: '{}'", val),
        Err(_) => println!("[STARTUP] RUST_LOG is unset."),
    }

    // Default to `info` when `RUST_LOG` is unset or invalid to avoid silent startup.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        println!("[STARTUP] RUST_LOG invalid or unset; defaulting to 'info'");
        tracing_subscriber::EnvFilter::new("info")
    });
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
    println!("[STARTUP] Tracing initialized.");

    let config = Config::from_env()?;
    println!(
        "[STARTUP] Monitoring {} network(s): {}",
        config.networks.len(),
        config
            .networks
            .iter()
            .map(|n| n.chain.key)
            .collect::<Vec<_>>()
            .join(", ")
    );
    if !config.onchain_enabled() {
        println!("[STARTUP] AGENT_PRIVATE_KEY or REGISTRY_ADDRESS unset; on-chain reporting disabled.");
    }

    let db = match &config.db_path {
        Some(path) => ContractsDb::open(path)?,
        None => ContractsDb::open_default()?,
    };
    println!("[STARTUP] Contracts DB opened.");

    // Check RPC connectivity early so configuration failures are visible immediately.
    let mut providers: Vec<(_, RootProvider<Http<Client>>)> = Vec::new();
    for network in &config.networks {
        let provider = RootProvider::<Http<Client>>::new_http(network.rpc_url.parse()?);
        match provider.get_block_number().await {
            Ok(head) => println!(
                "[STARTUP] {} connectivity OK. Latest block: {}",
                network.chain.name, head
            ),
            Err(err) => println!(
                "[STARTUP] {} CONNECTIVITY FAILURE: {}",
                network.chain.name, err
            ),
        }
        providers.push((network.clone(), provider));
    }

    let rate_gate = Arc::new(RateGate::new(Duration::from_millis(
        config.explorer_min_interval_ms,
    )));
    let (sender, receiver) = ScanQueue::new(config.queue_capacity);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // One reporter per run, bound to the first configured network: the
    // registry and certificate contracts live on one chain even when several
    // are watched for deployments.
    let chain_reporter: Option<Arc<dyn ChainReporter>> = match (
        &config.agent_private_key,
        &config.registry_address,
        providers.first(),
    ) {
        (Some(key), Some(registry), Some((network, provider))) => {
            let reporter = OnchainReporter::new(
                provider.clone(),
                key,
                *registry,
                config.certificate_address,
                config.mint_to,
                network.chain.chain_id,
            )?;
            println!(
                "[STARTUP] On-chain reporter ready: registry {:#x}, agent {:#x}.",
                registry,
                reporter.agent_address()
            );
            Some(Arc::new(reporter))
        }
        _ => None,
    };

    // One explorer client per network, all behind the shared rate gate, so
    // source lookups hit the endpoint that actually indexes the deployment.
    let mut explorer = ExplorerRouter::new();
    for network in &config.networks {
        explorer.insert(
            network.chain.key,
            ExplorerClient::new(
                network.chain.explorer_api_base,
                config.explorer_api_key.clone(),
                Arc::clone(&rate_gate),
            ),
        );
    }
    let explorer = Arc::new(explorer);
    let analyzer = Arc::new(Analyzer::new(config.ai.clone()));
    let report_store = Arc::new(ReportStore::new(
        config.pin_api_url.clone(),
        config.pin_jwt.clone(),
        config.ipfs_gateway.clone(),
    ));
    let alerts = Arc::new(AlertDispatcher::new(
        config.telegram_bot_token.clone(),
        config.telegram_chat_id.clone(),
        config.ipfs_gateway.clone(),
        db.clone(),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        db.clone(),
        explorer,
        analyzer,
        report_store,
        chain_reporter,
        alerts,
    ));

    let mut watcher_handles = Vec::new();
    for (network, provider) in providers {
        watcher_handles.push(spawn_watcher(
            network,
            provider,
            db.clone(),
            sender.clone(),
            shutdown_tx.subscribe(),
        ));
    }

    let worker_handle = tokio::spawn(run_workers(
        Arc::clone(&orchestrator),
        receiver,
        shutdown_tx.subscribe(),
        config.worker_count,
    ));

    // Periodic operator status line.
    let status_db = db.clone();
    let status_sender = sender.clone();
    let status_interval = config.status_interval_secs;
    let mut status_shutdown = shutdown_tx.subscribe();
    let status_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = status_shutdown.recv() => break,
                _ = tokio::time::sleep(Duration::from_secs(status_interval)) => {}
            }
            let queue_depth = status_sender.len().await;
            match status_db.status_counts() {
                Ok(counts) => tracing::info!(
                    "[OPS] Contracts: pending={} scanned={} failed={} total={} queue_depth={}",
                    counts.pending,
                    counts.scanned,
                    counts.failed,
                    counts.total(),
                    queue_depth
                ),
                Err(err) => tracing::warn!("[OPS] Status query failed: {}", err),
            }
        }
    });

    println!("[STARTUP] Agent running. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c().await?;
    tracing::info!("[OPS] Ctrl-C received; shutting down.");

    // Stop polling promptly; in-flight scans finish naturally, bounded by
    // each collaborator's own timeout.
    let _ = shutdown_tx.send(());
    sender.close().await;
    for handle in watcher_handles {
        let _ = handle.await;
    }
    let _ = worker_handle.await;
    let _ = status_handle.await;
    tracing::info!("[OPS] Shutdown complete.");
    Ok(())
}
