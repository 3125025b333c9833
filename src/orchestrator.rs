use crate::analyzer::{Analysis, Finding, RiskLevel, VulnerabilityCounts};
use crate::error::ScanError;
use crate::explorer::{ExplorerError, VerifiedSource};
use crate::report_store::StoredReport;
use crate::reporter::ReporterError;
use crate::scan_queue::{ScanQueueReceiver, ScanRequest};
use crate::storage::contracts_db::ContractsDb;
use alloy::primitives::{Address, B256, TxHash};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, Semaphore};

/// On-chain linkage of a completed scan, absent when the chain write was
/// skipped or exhausted its retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnchainReceipt {
    /// Registry-assigned report id, absent when the post-landing read could
    /// not resolve it.
    pub report_id: Option<u64>,
    pub certificate_id: Option<u64>,
    pub tx_hash: TxHash,
}

/// The atomic output of one pipeline run. Produced and owned by the
/// orchestrator, then handed off immutably to storage and alerting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub address: Address,
    pub network: String,
    pub risk_level: RiskLevel,
    pub overall_score: u8,
    pub findings: Vec<Finding>,
    pub report_cid: String,
    pub report_offline: bool,
    pub onchain: Option<OnchainReceipt>,
}

// Collaborator seams. Production impls live in the respective modules; tests
// drive the pipeline through hand-rolled mocks.

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch_source(
        &self,
        network: &str,
        address: Address,
    ) -> Result<Option<VerifiedSource>, ExplorerError>;
}

#[async_trait]
pub trait VulnAnalyzer: Send + Sync {
    async fn analyze(&self, code: &str, address: Address) -> Analysis;
}

#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn upload(&self, report: &Value) -> StoredReport;
}

#[async_trait]
pub trait ChainReporter: Send + Sync {
    async fn submit_report(
        &self,
        target: Address,
        content_id: &str,
        counts: VulnerabilityCounts,
    ) -> Result<OnchainReceipt, ReporterError>;
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_alert(&self, result: &ScanResult);
}

#[async_trait]
impl SourceFetcher for crate::explorer::ExplorerRouter {
    async fn fetch_source(
        &self,
        network: &str,
        address: Address,
    ) -> Result<Option<VerifiedSource>, ExplorerError> {
        crate::explorer::ExplorerRouter::fetch_source(self, network, address).await
    }
}

#[async_trait]
impl VulnAnalyzer for crate::analyzer::Analyzer {
    async fn analyze(&self, code: &str, address: Address) -> Analysis {
        crate::analyzer::Analyzer::analyze(self, code, address).await
    }
}

#[async_trait]
impl ReportSink for crate::report_store::ReportStore {
    async fn upload(&self, report: &Value) -> StoredReport {
        crate::report_store::ReportStore::upload(self, report).await
    }
}

#[async_trait]
impl ChainReporter for crate::reporter::OnchainReporter {
    async fn submit_report(
        &self,
        target: Address,
        content_id: &str,
        counts: VulnerabilityCounts,
    ) -> Result<OnchainReceipt, ReporterError> {
        crate::reporter::OnchainReporter::submit_report(self, target, content_id, counts).await
    }
}

#[async_trait]
impl AlertSink for crate::alerts::AlertDispatcher {
    async fn send_alert(&self, result: &ScanResult) {
        crate::alerts::AlertDispatcher::send_alert(self, result).await
    }
}

/// Removes the fingerprint from the in-flight set on every exit path.
struct InFlightGuard<'a> {
    guard: &'a DashMap<(Address, B256), ()>,
    fingerprint: (Address, B256),
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.guard.remove(&self.fingerprint);
    }
}

pub struct Orchestrator {
    db: ContractsDb,
    source: Arc<dyn SourceFetcher>,
    analyzer: Arc<dyn VulnAnalyzer>,
    reports: Arc<dyn ReportSink>,
    chain: Option<Arc<dyn ChainReporter>>,
    alerts: Arc<dyn AlertSink>,
    in_flight: DashMap<(Address, B256), ()>,
}

impl Orchestrator {
    pub fn new(
        db: ContractsDb,
        source: Arc<dyn SourceFetcher>,
        analyzer: Arc<dyn VulnAnalyzer>,
        reports: Arc<dyn ReportSink>,
        chain: Option<Arc<dyn ChainReporter>>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            db,
            source,
            analyzer,
            reports,
            chain,
            alerts,
            in_flight: DashMap::new(),
        }
    }

    /// Drive one contract through the full pipeline:
    /// fetch source -> analyze -> upload -> report on-chain -> alert -> persist.
    ///
    /// Only "no bytecode" is a hard failure. Every collaborator failure past
    /// that point degrades: the scan still terminates in `scanned` with a
    /// best-effort result.
    pub async fn process(&self, request: &ScanRequest) -> Result<ScanResult, ScanError> {
        let fingerprint = request.fingerprint();
        if self.in_flight.insert(fingerprint, ()).is_some() {
            return Err(ScanError::AlreadyInFlight {
                address: request.address,
            });
        }
        let _guard = InFlightGuard {
            guard: &self.in_flight,
            fingerprint,
        };

        // Manual triggers may arrive for addresses the watcher never claimed;
        // make sure a contract row exists either way. For watcher-claimed
        // fingerprints this is a no-op.
        let _ = self
            .db
            .claim_pending(
                request.address,
                &request.network,
                request.deployer,
                request.block_number,
                request.code_hash,
            )
            .map_err(|e| ScanError::Storage(e.to_string()))?;

        if request.code.is_empty() {
            self.db
                .mark_failed(request.address, request.code_hash, "no bytecode at address")
                .map_err(|e| ScanError::Storage(e.to_string()))?;
            tracing::info!(
                "[SCAN] {:#x} has no bytecode (self-destructed or EOA); marked failed.",
                request.address
            );
            return Err(ScanError::NoCode {
                address: request.address,
            });
        }

        // Verified source beats raw bytecode as analyzer input. Source
        // absence is routine; a fetch error is transient and falls back too.
        let analysis_input = match self
            .source
            .fetch_source(&request.network, request.address)
            .await
        {
            Ok(Some(verified)) => {
                tracing::info!(
                    "[SCAN] Verified source found for {:#x} ({}).",
                    request.address,
                    verified.contract_name
                );
                verified.source
            }
            Ok(None) => format!("0x{}", hex::encode(&request.code)),
            Err(err) => {
                tracing::warn!(
                    "[SCAN] Source fetch failed for {:#x}; analyzing bytecode: {}",
                    request.address,
                    err
                );
                format!("0x{}", hex::encode(&request.code))
            }
        };

        let analysis = self.analyzer.analyze(&analysis_input, request.address).await;
        let counts = VulnerabilityCounts::from_findings(&analysis.findings);

        let payload = report_payload(request, &analysis);
        let stored = self.reports.upload(&payload).await;

        let onchain = match &self.chain {
            None => None,
            Some(chain) => {
                match chain
                    .submit_report(request.address, &stored.cid, counts)
                    .await
                {
                    Ok(receipt) => Some(receipt),
                    Err(err) => {
                        // The scan result is still reportable via alerts and
                        // the dashboard; on-chain linkage is best-effort.
                        tracing::warn!(
                            "[SCAN] On-chain report abandoned for {:#x}: {}",
                            request.address,
                            err
                        );
                        None
                    }
                }
            }
        };

        let result = ScanResult {
            address: request.address,
            network: request.network.clone(),
            risk_level: analysis.risk_level,
            overall_score: analysis.overall_score,
            findings: analysis.findings,
            report_cid: stored.cid,
            report_offline: stored.offline,
            onchain,
        };

        if result.risk_level.is_alertable() {
            let alerts = Arc::clone(&self.alerts);
            let alert_result = result.clone();
            tokio::spawn(async move {
                alerts.send_alert(&alert_result).await;
            });
        }

        self.db
            .mark_scanned(&result, request.code_hash)
            .map_err(|e| ScanError::Storage(e.to_string()))?;

        tracing::info!(
            "[SCAN] {:#x} scanned: risk={} findings={} cid={}{} onchain={}",
            request.address,
            result.risk_level.as_str(),
            result.findings.len(),
            result.report_cid,
            if result.report_offline { " (offline)" } else { "" },
            result
                .onchain
                .as_ref()
                .map(|o| match o.report_id {
                    Some(id) => format!("report_id={id}"),
                    None => format!("tx={:#x}", o.tx_hash),
                })
                .unwrap_or_else(|| "absent".to_string()),
        );
        Ok(result)
    }
}

/// Full structured report payload pinned to content-addressed storage.
fn report_payload(request: &ScanRequest, analysis: &Analysis) -> Value {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    json!({
        "contract": format!("{:#x}", request.address),
        "network": request.network,
        "chain_id": request.chain_id,
        "deployer": request.deployer.map(|d| format!("{d:#x}")),
        "block_number": request.block_number,
        "code_hash": format!("{:#x}", request.code_hash),
        "risk_level": analysis.risk_level.as_str(),
        "overall_score": analysis.overall_score,
        "degraded_analysis": analysis.degraded,
        "findings": analysis.findings,
        "analyzed_at_ms": now_ms,
    })
}

/// Pull scans off the queue and run each on its own task so one stuck
/// collaborator can never stall the queue or the watchers. `max_concurrent`
/// bounds simultaneous scans; the queue absorbs bursts beyond it.
pub async fn run_workers(
    orchestrator: Arc<Orchestrator>,
    mut receiver: ScanQueueReceiver,
    mut shutdown: broadcast::Receiver<()>,
    max_concurrent: usize,
) {
    let permits = Arc::new(Semaphore::new(std::cmp::max(1, max_concurrent)));
    loop {
        let request = tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("[SCAN] Shutdown signal received; worker loop stopping.");
                break;
            }
            maybe = receiver.recv() => {
                let Some(request) = maybe else {
                    tracing::info!("[SCAN] Queue closed and drained; worker loop stopping.");
                    break;
                };
                request
            }
        };

        // Semaphore closure is impossible here; the owner lives in this loop.
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let orch = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            let _permit = permit;
            match orch.process(&request).await {
                Ok(_) => {}
                Err(ScanError::AlreadyInFlight { address }) => {
                    tracing::debug!("[SCAN] Duplicate trigger ignored for {:#x}.", address);
                }
                Err(err) => {
                    tracing::warn!("[SCAN] Pipeline ended without result: {}", err);
                }
            }
        });
    }
}
