use crate::analyzer::VulnerabilityCounts;
use crate::orchestrator::OnchainReceipt;
use crate::utils::config::MintTo;
use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolCall;
use alloy::transports::http::Http;
use reqwest::Client;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 2_000;
const RECEIPT_WAIT_TIMEOUT_SECS: u64 = 90;

/// Gas headroom over the node's estimate: 1.3x.
const GAS_HEADROOM_NUM: u64 = 13;
const GAS_HEADROOM_DEN: u64 = 10;

type HttpProvider = RootProvider<Http<Client>>;

alloy::sol! {
    interface ISecurityRegistry {
        function registerContract(address target) external;
        function reportVulnerability(
            address target,
            string contentId,
            uint8 critical,
            uint8 high,
            uint8 medium,
            uint8 low
        ) external returns (uint256 reportId);
        function isMonitored(address target) external view returns (bool);
        function pauseContract(address target) external;
        function getReportCount() external view returns (uint256);
    }

    interface IAuditCertificate {
        function mintCertificate(
            address to,
            uint256 reportId,
            string contentId
        ) external returns (uint256 certificateId);
    }
}

#[derive(Debug, Error)]
pub enum ReporterError {
    #[error("on-chain report failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("reporter misconfigured: {0}")]
    Misconfigured(String),
}

/// Severity counters on the registry are uint8; larger finding sets are
/// truncated rather than rejected.
pub fn clamp_count(count: u64) -> u8 {
    count.min(u8::MAX as u64) as u8
}

/// Delay slept after failed attempt `n` (1-based): base, base*2, base*4, ...
pub fn backoff_delay_ms(base_ms: u64, failed_attempt: u32) -> u64 {
    base_ms.saturating_mul(1u64 << failed_attempt.saturating_sub(1).min(16))
}

pub fn gas_with_headroom(estimate: u64) -> u64 {
    let headroom = estimate / GAS_HEADROOM_DEN * (GAS_HEADROOM_NUM - GAS_HEADROOM_DEN);
    estimate.saturating_add(headroom)
}

/// Retry driver for state-changing submissions: up to `max_retries` calls of
/// `send` with the doubling backoff slept between failures. The terminal
/// error carries the exact attempt count and the last underlying failure.
async fn send_with_retries<F, Fut>(
    max_retries: u32,
    backoff_base_ms: u64,
    context: &str,
    mut send: F,
) -> Result<TxHash, ReporterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<TxHash>>,
{
    let mut last_error = String::new();
    for attempt in 1..=max_retries {
        match send().await {
            Ok(tx_hash) => {
                if attempt > 1 {
                    tracing::info!(
                        "[REPORT] {} landed on attempt {}/{}.",
                        context,
                        attempt,
                        max_retries
                    );
                }
                return Ok(tx_hash);
            }
            Err(err) => {
                last_error = err.to_string();
                tracing::warn!(
                    "[REPORT] {} attempt {}/{} failed: {}",
                    context,
                    attempt,
                    max_retries,
                    last_error
                );
                if attempt < max_retries {
                    let delay = backoff_delay_ms(backoff_base_ms, attempt);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }

    Err(ReporterError::RetriesExhausted {
        attempts: max_retries,
        last_error,
    })
}

pub struct OnchainReporter {
    provider: HttpProvider,
    signer: PrivateKeySigner,
    wallet: EthereumWallet,
    registry: Address,
    certificate: Option<Address>,
    mint_to: MintTo,
    chain_id: u64,
    max_retries: u32,
    backoff_base_ms: u64,
}

impl OnchainReporter {
    pub fn new(
        provider: HttpProvider,
        private_key: &str,
        registry: Address,
        certificate: Option<Address>,
        mint_to: MintTo,
        chain_id: u64,
    ) -> Result<Self, ReporterError> {
        let signer: PrivateKeySigner = private_key
            .parse()
            .map_err(|e| ReporterError::Misconfigured(format!("invalid agent private key: {e}")))?;
        let wallet = EthereumWallet::from(signer.clone());
        Ok(Self {
            provider,
            signer,
            wallet,
            registry,
            certificate,
            mint_to,
            chain_id,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
        })
    }

    pub fn agent_address(&self) -> Address {
        self.signer.address()
    }

    /// Submit a severity-bucketed summary plus content identifier.
    ///
    /// Not idempotent on-chain: every successful call appends a new report
    /// entry. The orchestrator guarantees at most one call per scan result.
    pub async fn submit_report(
        &self,
        target: Address,
        content_id: &str,
        counts: VulnerabilityCounts,
    ) -> Result<OnchainReceipt, ReporterError> {
        self.ensure_registered(target).await;

        let calldata = ISecurityRegistry::reportVulnerabilityCall {
            target,
            contentId: content_id.to_string(),
            critical: clamp_count(counts.critical),
            high: clamp_count(counts.high),
            medium: clamp_count(counts.medium),
            low: clamp_count(counts.low),
        }
        .abi_encode();

        let context = format!("report for {target:#x}");
        let tx_hash = send_with_retries(self.max_retries, self.backoff_base_ms, &context, || {
            self.send_registry_tx(calldata.clone())
        })
        .await?;

        // The count is read right after the landing receipt and can be skewed
        // by a concurrent reporter; an id is never fabricated on a failed read.
        let report_id = match self.report_count().await {
            Ok(count) => Some(count),
            Err(err) => {
                tracing::warn!(
                    "[REPORT] Report count read failed for {:#x}; report id unknown: {}",
                    target,
                    err
                );
                None
            }
        };
        tracing::info!(
            "[REPORT] On-chain report landed for {:#x}: report_id={} tx={:#x}",
            target,
            report_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            tx_hash
        );
        if counts.critical > 0 {
            // The registry auto-pauses the target on critical findings;
            // nothing for the agent to drive here.
            tracing::info!(
                "[REPORT] Registry auto-pause expected for {:#x} (critical={})",
                target,
                counts.critical
            );
        }

        let certificate_id = match report_id {
            Some(id) => self.mint_certificate(id, content_id).await,
            None => None,
        };
        Ok(OnchainReceipt {
            report_id,
            certificate_id,
            tx_hash,
        })
    }

    /// Best-effort registration precondition. Failures are swallowed with a
    /// warning: the registry's own authorization check is the final gate, and
    /// another path may have registered the target already.
    async fn ensure_registered(&self, target: Address) {
        match self.is_monitored(target).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(
                    "[REPORT] isMonitored check failed for {:#x}; attempting registration anyway: {}",
                    target,
                    err
                );
            }
        }

        let calldata = ISecurityRegistry::registerContractCall { target }.abi_encode();
        match self.send_registry_tx(calldata).await {
            Ok(tx_hash) => {
                tracing::info!("[REPORT] Registered {:#x} for monitoring: tx={:#x}", target, tx_hash);
            }
            Err(err) => {
                tracing::warn!(
                    "[REPORT] Registration failed for {:#x} (continuing, best-effort): {}",
                    target,
                    err
                );
            }
        }
    }

    /// Mint the audit certificate for a landed report. Best-effort: a mint
    /// failure never affects the report outcome.
    async fn mint_certificate(&self, report_id: u64, content_id: &str) -> Option<u64> {
        let certificate = self.certificate?;
        let to = match self.mint_to {
            MintTo::Agent => self.signer.address(),
            MintTo::Orchestrator => self.registry,
        };
        let calldata = IAuditCertificate::mintCertificateCall {
            to,
            reportId: U256::from(report_id),
            contentId: content_id.to_string(),
        }
        .abi_encode();

        match self.send_tx(certificate, calldata).await {
            Ok(tx_hash) => {
                tracing::info!(
                    "[REPORT] Audit certificate minted for report {} to {:#x}: tx={:#x}",
                    report_id,
                    to,
                    tx_hash
                );
                // The certificate contract mints sequentially; reuse the
                // report id as the reference when the contract mirrors it.
                Some(report_id)
            }
            Err(err) => {
                tracing::warn!(
                    "[REPORT] Certificate mint failed for report {} (continuing): {}",
                    report_id,
                    err
                );
                None
            }
        }
    }

    pub async fn pause_contract(&self, target: Address) -> anyhow::Result<TxHash> {
        let calldata = ISecurityRegistry::pauseContractCall { target }.abi_encode();
        self.send_registry_tx(calldata).await
    }

    pub async fn is_monitored(&self, target: Address) -> anyhow::Result<bool> {
        let calldata = ISecurityRegistry::isMonitoredCall { target }.abi_encode();
        let request = TransactionRequest::default()
            .with_to(self.registry)
            .with_input(calldata);
        let raw = self.provider.call(&request).await?;
        let decoded = ISecurityRegistry::isMonitoredCall::abi_decode_returns(&raw, true)?;
        Ok(decoded._0)
    }

    pub async fn report_count(&self) -> anyhow::Result<u64> {
        let calldata = ISecurityRegistry::getReportCountCall {}.abi_encode();
        let request = TransactionRequest::default()
            .with_to(self.registry)
            .with_input(calldata);
        let raw = self.provider.call(&request).await?;
        let decoded = ISecurityRegistry::getReportCountCall::abi_decode_returns(&raw, true)?;
        Ok(decoded._0.try_into().unwrap_or(u64::MAX))
    }

    async fn send_registry_tx(&self, calldata: Vec<u8>) -> anyhow::Result<TxHash> {
        self.send_tx(self.registry, calldata).await
    }

    /// One estimate-price-sign-submit round trip, confirmed by receipt.
    async fn send_tx(&self, to: Address, calldata: Vec<u8>) -> anyhow::Result<TxHash> {
        let nonce = self
            .provider
            .get_transaction_count(self.signer.address())
            .await?;
        let gas_price = self.provider.get_gas_price().await?;

        let mut request = TransactionRequest::default()
            .with_to(to)
            .with_input(Bytes::from(calldata))
            .with_chain_id(self.chain_id)
            .with_nonce(nonce)
            .with_gas_price(gas_price);
        request.from = Some(self.signer.address());

        let estimate = self.provider.estimate_gas(&request).await?;
        request = request.with_gas_limit(gas_with_headroom(estimate));

        let signed = request
            .build(&self.wallet)
            .await
            .map_err(|err| anyhow::anyhow!("transaction signing failed: {err}"))?;
        let pending = self
            .provider
            .send_raw_transaction(&signed.encoded_2718())
            .await?;
        let tx_hash = *pending.tx_hash();

        let receipt = tokio::time::timeout(
            Duration::from_secs(RECEIPT_WAIT_TIMEOUT_SECS),
            pending.get_receipt(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("receipt wait timed out for {tx_hash:#x}"))??;
        if !receipt.status() {
            anyhow::bail!("transaction {tx_hash:#x} reverted");
        }
        Ok(tx_hash)
    }
}
