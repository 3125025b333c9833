use alloy::primitives::Address;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

const EXPLORER_REQUEST_TIMEOUT_SECS: u64 = 15;
const MAX_TRANSPORT_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum ExplorerError {
    #[error("explorer transport failure: {0}")]
    Transport(String),
    #[error("explorer rejected request: {0}")]
    Rejected(String),
}

/// Shared minimum-interval gate. One gate instance is shared by every caller
/// hitting the explorer (watchers on all networks plus manual fetches); a
/// caller arriving early sleeps out the remainder instead of failing.
pub struct RateGate {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last_call.lock().await;
        let now = Instant::now();
        if let Some(prev) = *last {
            let elapsed = now.saturating_duration_since(prev);
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Verified source for a contract, when the explorer has it. Absence is the
/// common case for fresh deployments and is not an error.
#[derive(Debug, Clone)]
pub struct VerifiedSource {
    pub source: String,
    pub contract_name: String,
    pub compiler_version: String,
}

#[derive(Deserialize)]
struct ExplorerEnvelope<T> {
    status: String,
    message: String,
    result: T,
}

#[derive(Deserialize)]
struct SourceCodeEntry {
    #[serde(rename = "SourceCode")]
    source_code: Option<String>,
    #[serde(rename = "ContractName")]
    contract_name: Option<String>,
    #[serde(rename = "CompilerVersion")]
    compiler_version: Option<String>,
}

pub struct ExplorerClient {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    gate: Arc<RateGate>,
}

impl ExplorerClient {
    pub fn new(api_base: impl Into<String>, api_key: Option<String>, gate: Arc<RateGate>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
            api_key,
            gate,
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Best-effort verified-source lookup. `Ok(None)` means the contract is
    /// simply not verified.
    pub async fn fetch_source(
        &self,
        address: Address,
    ) -> Result<Option<VerifiedSource>, ExplorerError> {
        let mut url = format!(
            "{}?module=contract&action=getSourceCode&address={:#x}",
            self.api_base, address
        );
        if let Some(key) = &self.api_key {
            url.push_str(&format!("&apikey={key}"));
        }

        let envelope: ExplorerEnvelope<Value> = self.explorer_get(&url).await?;
        parse_source_envelope(envelope)
    }

    async fn explorer_get<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, ExplorerError> {
        let mut last_err: Option<String> = None;
        for attempt in 0..MAX_TRANSPORT_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(1000 * 2u64.pow(attempt - 1))).await;
            }
            self.gate.wait().await;
            match self
                .client
                .get(url)
                .timeout(Duration::from_secs(EXPLORER_REQUEST_TIMEOUT_SECS))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => match resp.json::<T>().await {
                    Ok(parsed) => return Ok(parsed),
                    Err(e) => last_err = Some(e.to_string()),
                },
                Ok(resp) => last_err = Some(format!("HTTP {}", resp.status())),
                Err(e) => last_err = Some(e.to_string()),
            }
        }
        Err(ExplorerError::Transport(
            last_err.unwrap_or_else(|| "exhausted retries".to_string()),
        ))
    }
}

/// Status "1" carries an entry array; error statuses carry a string result
/// ("Invalid API Key", rate limits). An empty or array-shaped result under a
/// non-"1" status just means nothing was found.
fn parse_source_envelope(
    envelope: ExplorerEnvelope<Value>,
) -> Result<Option<VerifiedSource>, ExplorerError> {
    if envelope.status != "1" {
        if let Some(detail) = envelope.result.as_str() {
            return Err(ExplorerError::Rejected(format!(
                "{}: {}",
                envelope.message, detail
            )));
        }
        return Ok(None);
    }

    let entries: Vec<SourceCodeEntry> =
        serde_json::from_value(envelope.result).unwrap_or_default();
    let Some(entry) = entries.into_iter().next() else {
        return Ok(None);
    };
    let source = entry.source_code.unwrap_or_default();
    if source.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(VerifiedSource {
        source,
        contract_name: entry.contract_name.unwrap_or_default(),
        compiler_version: entry.compiler_version.unwrap_or_default(),
    }))
}

/// Routes verified-source lookups to the explorer serving the deployment's
/// network. Every client shares one `RateGate`; only the endpoint differs.
#[derive(Default)]
pub struct ExplorerRouter {
    clients: HashMap<String, ExplorerClient>,
}

impl ExplorerRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, network: impl Into<String>, client: ExplorerClient) {
        self.clients.insert(network.into(), client);
    }

    pub fn client(&self, network: &str) -> Option<&ExplorerClient> {
        self.clients.get(network)
    }

    /// A network without a configured explorer is not an error; the scan
    /// falls through to bytecode analysis.
    pub async fn fetch_source(
        &self,
        network: &str,
        address: Address,
    ) -> Result<Option<VerifiedSource>, ExplorerError> {
        let Some(client) = self.clients.get(network) else {
            tracing::debug!(
                "[SCAN] No explorer configured for network {}; skipping source lookup.",
                network
            );
            return Ok(None);
        };
        client.fetch_source(address).await
    }
}
