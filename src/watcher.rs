use crate::scan_queue::{ScanPriority, ScanQueueSender, ScanRequest};
use crate::storage::contracts_db::ContractsDb;
use crate::utils::config::NetworkConfig;
use alloy::consensus::Transaction;
use alloy::network::{ReceiptResponse, TransactionResponse};
use alloy::primitives::{keccak256, Address, Bytes};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::BlockTransactionsKind;
use alloy::transports::http::Http;
use reqwest::Client;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

type HttpProvider = RootProvider<Http<Client>>;

const HEAD_FETCH_TIMEOUT_MS: u64 = 5_000;
const BLOCK_FETCH_TIMEOUT_MS: u64 = 10_000;
const RECEIPT_FETCH_TIMEOUT_MS: u64 = 5_000;
const CODE_FETCH_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_BLOCKS_PER_TICK: u64 = 64;

fn load_max_blocks_per_tick() -> u64 {
    std::env::var("WATCH_MAX_BLOCKS_PER_TICK")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(|v| v.clamp(1, 4_096))
        .unwrap_or(DEFAULT_MAX_BLOCKS_PER_TICK)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TickStats {
    pub blocks_processed: u64,
    pub deployments_seen: u64,
    pub enqueued: u64,
    pub skipped_duplicates: u64,
    pub skipped_no_code: u64,
}

/// One deployment candidate with its bytecode already fetched. Claims the
/// fingerprint in the dedup store and hands the target to the workers.
/// Returns `true` only when this call enqueued new work.
pub async fn handle_deployment_candidate(
    db: &ContractsDb,
    sender: &ScanQueueSender,
    network: &NetworkConfig,
    address: Address,
    deployer: Option<Address>,
    block_number: u64,
    code: Bytes,
    stats: &mut TickStats,
) -> bool {
    if code.is_empty() {
        // Self-destructed in the deploying tx or a bare value transfer;
        // nothing to scan and no record to keep.
        stats.skipped_no_code += 1;
        tracing::debug!(
            "[WATCH] {} deployment {:#x} has empty runtime code; skipping.",
            network.chain.key,
            address
        );
        return false;
    }

    let code_hash = keccak256(&code);
    let claimed = match db.claim_pending(address, network.chain.key, deployer, block_number, code_hash)
    {
        Ok(claimed) => claimed,
        Err(err) => {
            tracing::warn!(
                "[WATCH] Dedup claim failed for {:#x}; skipping this sighting: {}",
                address,
                err
            );
            return false;
        }
    };
    if !claimed {
        // Already handled with identical code, e.g. a restart re-polling the
        // same block window.
        stats.skipped_duplicates += 1;
        return false;
    }

    let accepted = sender
        .enqueue(ScanRequest {
            address,
            network: network.chain.key.to_string(),
            chain_id: network.chain.chain_id,
            code,
            code_hash,
            deployer,
            block_number,
            priority: ScanPriority::Deployment,
        })
        .await;
    if accepted {
        stats.enqueued += 1;
        tracing::info!(
            "[WATCH] New deployment on {}: {:#x} at block {} (deployer {}).",
            network.chain.name,
            address,
            block_number,
            deployer
                .map(|d| format!("{d:#x}"))
                .unwrap_or_else(|| "unknown".to_string()),
        );
    } else {
        tracing::warn!(
            "[WATCH] Scan queue refused {:#x}; record stays pending for manual re-trigger.",
            address
        );
    }
    accepted
}

async fn process_block(
    provider: &HttpProvider,
    db: &ContractsDb,
    sender: &ScanQueueSender,
    network: &NetworkConfig,
    block_number: u64,
    stats: &mut TickStats,
) -> anyhow::Result<()> {
    let block = tokio::time::timeout(
        Duration::from_millis(BLOCK_FETCH_TIMEOUT_MS),
        provider.get_block_by_number(block_number.into(), BlockTransactionsKind::Full),
    )
    .await
    .map_err(|_| anyhow::anyhow!("block {block_number} fetch timed out"))??
    .ok_or_else(|| anyhow::anyhow!("block {block_number} not yet available"))?;

    let Some(transactions) = block.transactions.as_transactions() else {
        anyhow::bail!("block {block_number} returned without full transaction bodies");
    };

    for tx in transactions {
        // Contract creation: no `to` address.
        if tx.to().is_some() {
            continue;
        }
        stats.deployments_seen += 1;
        let tx_hash = tx.tx_hash();

        let receipt = match tokio::time::timeout(
            Duration::from_millis(RECEIPT_FETCH_TIMEOUT_MS),
            provider.get_transaction_receipt(tx_hash),
        )
        .await
        {
            Ok(Ok(Some(receipt))) => receipt,
            Ok(Ok(None)) => continue,
            Ok(Err(err)) => {
                // One bad receipt never stalls the block, let alone the loop.
                tracing::warn!(
                    "[WATCH] Receipt fetch failed for {:#x} in block {}: {}",
                    tx_hash,
                    block_number,
                    err
                );
                continue;
            }
            Err(_) => {
                tracing::warn!(
                    "[WATCH] Receipt fetch timed out for {:#x} in block {}.",
                    tx_hash,
                    block_number
                );
                continue;
            }
        };
        let Some(deployed) = receipt.contract_address() else {
            continue;
        };

        let code = match tokio::time::timeout(
            Duration::from_millis(CODE_FETCH_TIMEOUT_MS),
            provider.get_code_at(deployed),
        )
        .await
        {
            Ok(Ok(code)) => code,
            Ok(Err(err)) => {
                tracing::warn!(
                    "[WATCH] getCode failed for {:#x}; skipping this sighting: {}",
                    deployed,
                    err
                );
                continue;
            }
            Err(_) => {
                tracing::warn!("[WATCH] getCode timed out for {:#x}; skipping.", deployed);
                continue;
            }
        };

        handle_deployment_candidate(
            db,
            sender,
            network,
            deployed,
            Some(tx.from()),
            block_number,
            code,
            stats,
        )
        .await;
    }

    Ok(())
}

/// One polling tick: walk every unseen block from the durable cursor to the
/// current head, gap-free. The cursor advances past a block only after all
/// of its transactions were processed or individually skipped; a wholesale
/// block failure ends the tick and the block is retried next tick (safe to
/// replay thanks to the dedup claim).
pub async fn run_watch_tick(
    provider: &HttpProvider,
    db: &ContractsDb,
    sender: &ScanQueueSender,
    network: &NetworkConfig,
) -> anyhow::Result<TickStats> {
    let mut stats = TickStats::default();

    let head = tokio::time::timeout(
        Duration::from_millis(HEAD_FETCH_TIMEOUT_MS),
        provider.get_block_number(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("head fetch timed out"))??;

    let Some(cursor) = db.cursor(network.chain.key)? else {
        // First run on this network: start at the current head rather than
        // replaying chain history.
        db.advance_cursor(network.chain.key, head)?;
        tracing::info!(
            "[WATCH] {} cursor initialized at block {}.",
            network.chain.name,
            head
        );
        return Ok(stats);
    };
    if head <= cursor {
        return Ok(stats);
    }

    let max_blocks = load_max_blocks_per_tick();
    let range_end = head.min(cursor.saturating_add(max_blocks));
    for block_number in (cursor + 1)..=range_end {
        match process_block(provider, db, sender, network, block_number, &mut stats).await {
            Ok(()) => {
                db.advance_cursor(network.chain.key, block_number)?;
                stats.blocks_processed += 1;
            }
            Err(err) => {
                tracing::warn!(
                    "[WATCH] {} block {} failed; will retry next tick: {}",
                    network.chain.key,
                    block_number,
                    err
                );
                break;
            }
        }
    }

    Ok(stats)
}

/// Independent polling loop for one network. Loops share nothing but the
/// dedup store and the scan queue.
pub fn spawn_watcher(
    network: NetworkConfig,
    provider: HttpProvider,
    db: ContractsDb,
    sender: ScanQueueSender,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_millis(network.chain.poll_interval_ms);
        tracing::info!(
            "[WATCH] Monitoring {} (chain_id {}) every {}ms.",
            network.chain.name,
            network.chain.chain_id,
            network.chain.poll_interval_ms
        );
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("[WATCH] Shutdown signal received; {} watcher stopping.", network.chain.key);
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            match run_watch_tick(&provider, &db, &sender, &network).await {
                Ok(stats) => {
                    if stats.blocks_processed > 0 || stats.enqueued > 0 {
                        tracing::info!(
                            "[WATCH] {} tick: blocks={} deploys={} enqueued={} dup_skips={} no_code_skips={}",
                            network.chain.key,
                            stats.blocks_processed,
                            stats.deployments_seen,
                            stats.enqueued,
                            stats.skipped_duplicates,
                            stats.skipped_no_code,
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        "[WATCH] {} tick failed; retrying next interval: {}",
                        network.chain.key,
                        err
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::chains::ChainConfig;
    use crate::scan_queue::ScanQueue;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_db() -> (ContractsDb, std::path::PathBuf) {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let path = std::env::temp_dir().join(format!("watcher_test_{}.db", nanos));
        (ContractsDb::open(&path).expect("db open"), path)
    }

    fn bsc() -> NetworkConfig {
        NetworkConfig {
            chain: ChainConfig::bsc(),
            rpc_url: "http://localhost:8545".to_string(),
        }
    }

    #[tokio::test]
    async fn test_empty_code_creates_no_record_and_no_work() {
        let (db, path) = temp_db();
        let (sender, mut receiver) = ScanQueue::new(16);
        let network = bsc();
        let address = Address::from([0x77; 20]);
        let mut stats = TickStats::default();

        let accepted = handle_deployment_candidate(
            &db,
            &sender,
            &network,
            address,
            None,
            1000,
            Bytes::new(),
            &mut stats,
        )
        .await;

        assert!(!accepted);
        assert_eq!(stats.skipped_no_code, 1);
        assert!(db.record(address).expect("lookup").is_none());
        sender.close().await;
        assert!(receiver.recv().await.is_none());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_duplicate_sighting_is_not_reenqueued() {
        let (db, path) = temp_db();
        let (sender, mut receiver) = ScanQueue::new(16);
        let network = bsc();
        let address = Address::from([0x88; 20]);
        let code = Bytes::from(vec![0x60, 0x80, 0x60, 0x40]);
        let mut stats = TickStats::default();

        let first = handle_deployment_candidate(
            &db,
            &sender,
            &network,
            address,
            None,
            1000,
            code.clone(),
            &mut stats,
        )
        .await;
        // Restart-style replay of the same block window.
        let second = handle_deployment_candidate(
            &db,
            &sender,
            &network,
            address,
            None,
            1000,
            code.clone(),
            &mut stats,
        )
        .await;

        assert!(first);
        assert!(!second);
        assert_eq!(stats.enqueued, 1);
        assert_eq!(stats.skipped_duplicates, 1);

        let request = receiver.recv().await.expect("one request");
        assert_eq!(request.address, address);
        assert_eq!(request.code_hash, keccak256(&code));
        assert_eq!(request.network, "bsc");
        sender.close().await;
        assert!(receiver.recv().await.is_none());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_redeploy_with_new_code_is_new_logical_target() {
        let (db, path) = temp_db();
        let (sender, _receiver) = ScanQueue::new(16);
        let network = bsc();
        let address = Address::from([0x99; 20]);
        let mut stats = TickStats::default();

        let code_v1 = Bytes::from(vec![0x60, 0x01]);
        let code_v2 = Bytes::from(vec![0x60, 0x02]);
        assert!(
            handle_deployment_candidate(
                &db, &sender, &network, address, None, 1000, code_v1, &mut stats
            )
            .await
        );
        assert!(
            handle_deployment_candidate(
                &db, &sender, &network, address, None, 1200, code_v2.clone(), &mut stats
            )
            .await
        );

        let record = db.record(address).expect("lookup").expect("row");
        assert_eq!(record.code_hash, keccak256(&code_v2));
        assert_eq!(record.block_number, 1200);
        let _ = std::fs::remove_file(path);
    }
}
