//! End-to-end orchestrator tests over mock collaborators.
//!
//! These cover the pipeline's failure-isolation contract: every collaborator
//! except bytecode presence may fail independently or together, and the scan
//! must still terminate in `scanned` with a best-effort result.

use alloy::primitives::{keccak256, Address, Bytes, TxHash};
use async_trait::async_trait;
use chainguard::analyzer::{
    degraded_analysis, Analysis, Finding, RiskLevel, Severity, VulnerabilityCounts,
};
use chainguard::error::ScanError;
use chainguard::explorer::{ExplorerError, VerifiedSource};
use chainguard::orchestrator::{
    AlertSink, ChainReporter, OnchainReceipt, Orchestrator, ReportSink, ScanResult, SourceFetcher,
    VulnAnalyzer,
};
use chainguard::report_store::{fallback_cid, StoredReport};
use chainguard::reporter::ReporterError;
use chainguard::scan_queue::{ScanPriority, ScanRequest};
use chainguard::storage::contracts_db::{ContractsDb, ScanStatus};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, Notify};

fn temp_db() -> (ContractsDb, std::path::PathBuf) {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let path = std::env::temp_dir().join(format!("pipeline_test_{}.db", nanos));
    (ContractsDb::open(&path).expect("db open"), path)
}

fn request_for(address: Address, code: Bytes) -> ScanRequest {
    let code_hash = keccak256(&code);
    ScanRequest {
        address,
        network: "bsc".to_string(),
        chain_id: 56,
        code,
        code_hash,
        deployer: Some(Address::from([0xD0; 20])),
        block_number: 1000,
        priority: ScanPriority::Deployment,
    }
}

fn high_reentrancy_analysis(address: Address) -> Analysis {
    let finding = Finding {
        id: format!("{address:#x}-0"),
        title: "Reentrancy".to_string(),
        severity: Severity::High,
        category: "Reentrancy".to_string(),
        description: "External call before state update.".to_string(),
        recommendation: "Apply checks-effects-interactions.".to_string(),
        confidence: 0.92,
    };
    Analysis {
        risk_level: RiskLevel::High,
        overall_score: 35,
        findings: vec![finding],
        degraded: false,
    }
}

// --- mocks -----------------------------------------------------------------

struct NoSource;

#[async_trait]
impl SourceFetcher for NoSource {
    async fn fetch_source(
        &self,
        _network: &str,
        _: Address,
    ) -> Result<Option<VerifiedSource>, ExplorerError> {
        Ok(None)
    }
}

struct FailingSource;

#[async_trait]
impl SourceFetcher for FailingSource {
    async fn fetch_source(
        &self,
        _network: &str,
        _: Address,
    ) -> Result<Option<VerifiedSource>, ExplorerError> {
        Err(ExplorerError::Transport("connection refused".to_string()))
    }
}

/// Returns a fixed analysis, or the degraded fallback when `fail` is set,
/// and counts invocations.
struct ScriptedAnalyzer {
    analysis: Option<Analysis>,
    calls: AtomicU32,
    gate: Option<Arc<Notify>>,
}

impl ScriptedAnalyzer {
    fn fixed(analysis: Analysis) -> Self {
        Self {
            analysis: Some(analysis),
            calls: AtomicU32::new(0),
            gate: None,
        }
    }

    fn failing() -> Self {
        Self {
            analysis: None,
            calls: AtomicU32::new(0),
            gate: None,
        }
    }
}

#[async_trait]
impl VulnAnalyzer for ScriptedAnalyzer {
    async fn analyze(&self, _code: &str, address: Address) -> Analysis {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        match &self.analysis {
            Some(analysis) => analysis.clone(),
            None => degraded_analysis(address),
        }
    }
}

struct ScriptedReports {
    fail: bool,
}

#[async_trait]
impl ReportSink for ScriptedReports {
    async fn upload(&self, report: &Value) -> StoredReport {
        if self.fail {
            StoredReport {
                cid: fallback_cid(&report.to_string(), 1_700_000_000_000),
                offline: true,
            }
        } else {
            StoredReport {
                cid: "Qm123".to_string(),
                offline: false,
            }
        }
    }
}

struct ScriptedChain {
    fail: bool,
    calls: AtomicU32,
}

impl ScriptedChain {
    fn ok() -> Self {
        Self {
            fail: false,
            calls: AtomicU32::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ChainReporter for ScriptedChain {
    async fn submit_report(
        &self,
        _target: Address,
        _content_id: &str,
        _counts: VulnerabilityCounts,
    ) -> Result<OnchainReceipt, ReporterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(ReporterError::RetriesExhausted {
                attempts: 3,
                last_error: "nonce too low".to_string(),
            })
        } else {
            Ok(OnchainReceipt {
                report_id: Some(7),
                certificate_id: None,
                tx_hash: TxHash::from([0xde; 32]),
            })
        }
    }
}

#[derive(Default)]
struct RecordingAlerts {
    sent: Mutex<Vec<ScanResult>>,
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn send_alert(&self, result: &ScanResult) {
        self.sent.lock().await.push(result.clone());
    }
}

struct Fixture {
    orchestrator: Orchestrator,
    analyzer: Arc<ScriptedAnalyzer>,
    chain: Arc<ScriptedChain>,
    alerts: Arc<RecordingAlerts>,
    db: ContractsDb,
    path: std::path::PathBuf,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn fixture(
    source: Arc<dyn SourceFetcher>,
    analyzer: ScriptedAnalyzer,
    reports_fail: bool,
    chain: ScriptedChain,
) -> Fixture {
    let (db, path) = temp_db();
    let analyzer = Arc::new(analyzer);
    let chain = Arc::new(chain);
    let alerts = Arc::new(RecordingAlerts::default());
    let orchestrator = Orchestrator::new(
        db.clone(),
        source,
        Arc::clone(&analyzer) as Arc<dyn VulnAnalyzer>,
        Arc::new(ScriptedReports { fail: reports_fail }),
        Some(Arc::clone(&chain) as Arc<dyn ChainReporter>),
        Arc::clone(&alerts) as Arc<dyn AlertSink>,
    );
    Fixture {
        orchestrator,
        analyzer,
        chain,
        alerts,
        db,
        path,
    }
}

async fn drain_spawned_alerts() {
    // The alert dispatch is fire-and-forget; give the spawned task a chance
    // to run before asserting on it.
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

// --- tests -----------------------------------------------------------------

#[tokio::test]
async fn test_concrete_bsc_scenario_end_to_end() {
    // Contract deployed at block 1000 on BSC, 512 bytes of bytecode, no
    // verified source; analysis says HIGH with one reentrancy finding;
    // content store and chain reporter both succeed.
    let address = Address::from([0xAB; 20]);
    let code = Bytes::from(vec![0xFE; 512]);
    let fx = fixture(
        Arc::new(NoSource),
        ScriptedAnalyzer::fixed(high_reentrancy_analysis(address)),
        false,
        ScriptedChain::ok(),
    );
    let mut request = request_for(address, code);
    request.block_number = 1000;

    let result = fx
        .orchestrator
        .process(&request)
        .await
        .expect("pipeline result");

    assert_eq!(result.risk_level, RiskLevel::High);
    let counts = VulnerabilityCounts::from_findings(&result.findings);
    assert_eq!(
        counts,
        VulnerabilityCounts {
            critical: 0,
            high: 1,
            medium: 0,
            low: 0
        }
    );
    assert_eq!(result.report_cid, "Qm123");
    assert!(!result.report_offline);
    let onchain = result.onchain.as_ref().expect("onchain receipt");
    assert_eq!(onchain.report_id, Some(7));
    assert_eq!(onchain.tx_hash, TxHash::from([0xde; 32]));

    let record = fx.db.record(address).expect("lookup").expect("row");
    assert_eq!(record.status, ScanStatus::Scanned);
    assert_eq!(record.counts.high, 1);
    assert_eq!(record.report_cid.as_deref(), Some("Qm123"));

    drain_spawned_alerts().await;
    let sent = fx.alerts.sent.lock().await;
    assert_eq!(sent.len(), 1, "HIGH risk dispatches exactly one alert");
    assert_eq!(sent[0].address, address);
}

#[tokio::test]
async fn test_every_collaborator_failing_still_reaches_scanned() {
    // AI down, content store down, chain reporter down, explorer down: the
    // pipeline must still produce a (degraded, offline, chainless) result.
    let address = Address::from([0xBC; 20]);
    let fx = fixture(
        Arc::new(FailingSource),
        ScriptedAnalyzer::failing(),
        true,
        ScriptedChain::failing(),
    );
    let request = request_for(address, Bytes::from(vec![0x60, 0x80]));

    let result = fx
        .orchestrator
        .process(&request)
        .await
        .expect("pipeline result despite failures");

    assert_eq!(result.risk_level, RiskLevel::Medium);
    assert_eq!(result.overall_score, 50);
    assert_eq!(result.findings.len(), 1);
    assert_eq!(result.findings[0].category, "Analysis Error");
    assert!(result.report_offline);
    assert!(result.report_cid.starts_with("local-"));
    assert!(result.onchain.is_none());
    assert_eq!(fx.chain.calls.load(Ordering::SeqCst), 1);

    let record = fx.db.record(address).expect("lookup").expect("row");
    assert_eq!(record.status, ScanStatus::Scanned);

    // MEDIUM does not alert.
    drain_spawned_alerts().await;
    assert!(fx.alerts.sent.lock().await.is_empty());
}

#[tokio::test]
async fn test_chain_failure_alone_degrades_to_absent_onchain() {
    let address = Address::from([0xCD; 20]);
    let fx = fixture(
        Arc::new(NoSource),
        ScriptedAnalyzer::fixed(high_reentrancy_analysis(address)),
        false,
        ScriptedChain::failing(),
    );
    let request = request_for(address, Bytes::from(vec![0x60, 0x80]));

    let result = fx.orchestrator.process(&request).await.expect("result");
    assert!(result.onchain.is_none());
    assert_eq!(result.report_cid, "Qm123");
    assert_eq!(
        fx.db.record(address).expect("lookup").expect("row").status,
        ScanStatus::Scanned
    );

    // The finding is still alertable even without on-chain linkage.
    drain_spawned_alerts().await;
    assert_eq!(fx.alerts.sent.lock().await.len(), 1);
}

#[tokio::test]
async fn test_no_code_is_hard_terminal_without_analysis() {
    let address = Address::from([0xDE; 20]);
    let fx = fixture(
        Arc::new(NoSource),
        ScriptedAnalyzer::fixed(high_reentrancy_analysis(address)),
        false,
        ScriptedChain::ok(),
    );
    let request = request_for(address, Bytes::new());

    let err = fx
        .orchestrator
        .process(&request)
        .await
        .expect_err("empty bytecode must fail");
    assert!(matches!(err, ScanError::NoCode { .. }));
    assert_eq!(fx.analyzer.calls.load(Ordering::SeqCst), 0);
    assert_eq!(fx.chain.calls.load(Ordering::SeqCst), 0);

    let record = fx.db.record(address).expect("lookup").expect("row");
    assert_eq!(record.status, ScanStatus::Failed);
    assert!(record.fail_reason.as_deref().unwrap_or("").contains("no bytecode"));
}

#[tokio::test]
async fn test_duplicate_trigger_is_rejected_while_in_flight() {
    let address = Address::from([0xEF; 20]);
    let gate = Arc::new(Notify::new());
    let mut analyzer = ScriptedAnalyzer::fixed(high_reentrancy_analysis(address));
    analyzer.gate = Some(Arc::clone(&gate));
    let fx = Arc::new(fixture(
        Arc::new(NoSource),
        analyzer,
        false,
        ScriptedChain::ok(),
    ));
    let request = request_for(address, Bytes::from(vec![0x01, 0x02]));

    let first = {
        let fx = Arc::clone(&fx);
        let request = request.clone();
        tokio::spawn(async move { fx.orchestrator.process(&request).await })
    };
    // Let the first run park inside the analyzer, then fire the duplicate.
    tokio::task::yield_now().await;
    let duplicate = fx.orchestrator.process(&request).await;
    assert!(matches!(
        duplicate,
        Err(ScanError::AlreadyInFlight { .. })
    ));

    gate.notify_one();
    let result = first.await.expect("join").expect("first run completes");
    assert_eq!(result.risk_level, RiskLevel::High);
    assert_eq!(fx.chain.calls.load(Ordering::SeqCst), 1);

    // Once terminal, a manual re-trigger is allowed again.
    gate.notify_one();
    let rerun = fx.orchestrator.process(&request).await.expect("re-run");
    assert_eq!(rerun.risk_level, RiskLevel::High);
}

#[tokio::test]
async fn test_severe_scan_waits_out_slow_alert_channel() {
    // A slow alert sink must not delay pipeline completion.
    struct SlowAlerts;

    #[async_trait]
    impl AlertSink for SlowAlerts {
        async fn send_alert(&self, _: &ScanResult) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }

    let (db, path) = temp_db();
    let address = Address::from([0xFA; 20]);
    let orchestrator = Orchestrator::new(
        db.clone(),
        Arc::new(NoSource),
        Arc::new(ScriptedAnalyzer::fixed(high_reentrancy_analysis(address))),
        Arc::new(ScriptedReports { fail: false }),
        Some(Arc::new(ScriptedChain::ok())),
        Arc::new(SlowAlerts),
    );
    let request = request_for(address, Bytes::from(vec![0x11]));

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.process(&request),
    )
    .await
    .expect("pipeline completes without waiting on the alert")
    .expect("result");
    assert_eq!(result.risk_level, RiskLevel::High);
    assert_eq!(
        db.record(address).expect("lookup").expect("row").status,
        ScanStatus::Scanned
    );
    let _ = std::fs::remove_file(path);
}
