use alloy::primitives::keccak256;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const PIN_REQUEST_TIMEOUT_SECS: u64 = 30;
const GATEWAY_REQUEST_TIMEOUT_SECS: u64 = 15;

/// Prefix marking a fallback identifier minted locally while the pinning
/// service was unreachable. Deliberately nothing like a real CID so operators
/// and downstream consumers can spot non-resolvable reports at a glance.
pub const OFFLINE_CID_PREFIX: &str = "local-";

#[derive(Debug, Clone)]
pub struct StoredReport {
    pub cid: String,
    /// True when `cid` is a locally derived fallback that no gateway can
    /// resolve; callers must treat the report as non-authoritative.
    pub offline: bool,
}

#[derive(Deserialize)]
struct PinResponse {
    #[serde(rename = "IpfsHash")]
    ipfs_hash: String,
}

/// Deterministic fallback identifier: hash of the exact payload bytes plus
/// the clock tick. Pure so the derivation is testable with a frozen clock.
pub fn fallback_cid(payload_json: &str, now_ms: u64) -> String {
    let mut buf = Vec::with_capacity(payload_json.len() + 8);
    buf.extend_from_slice(payload_json.as_bytes());
    buf.extend_from_slice(&now_ms.to_be_bytes());
    let digest = keccak256(&buf);
    format!("{}{}", OFFLINE_CID_PREFIX, hex::encode(&digest[..8]))
}

pub fn is_offline_cid(cid: &str) -> bool {
    cid.starts_with(OFFLINE_CID_PREFIX)
}

pub struct ReportStore {
    client: reqwest::Client,
    pin_api_url: String,
    pin_jwt: Option<String>,
    gateway_base: String,
}

impl ReportStore {
    pub fn new(pin_api_url: String, pin_jwt: Option<String>, gateway_base: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            pin_api_url,
            pin_jwt,
            gateway_base: gateway_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn gateway_url(&self, cid: &str) -> String {
        format!("{}/{}", self.gateway_base, cid)
    }

    /// Pin a full report payload. Never fails: on any error the deterministic
    /// fallback identifier is returned with `offline = true`.
    pub async fn upload(&self, report: &Value) -> StoredReport {
        let payload = json!({
            "pinataContent": report,
            "pinataMetadata": {"name": "chainguard-scan-report"},
        });
        match self.try_pin(&payload).await {
            Ok(cid) => StoredReport {
                cid,
                offline: false,
            },
            Err(err) => {
                let payload_json = report.to_string();
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                let cid = fallback_cid(&payload_json, now);
                tracing::warn!(
                    "[STORE] Report pin failed; issuing offline identifier {}: {}",
                    cid,
                    err
                );
                StoredReport { cid, offline: true }
            }
        }
    }

    async fn try_pin(&self, payload: &Value) -> anyhow::Result<String> {
        let mut request = self
            .client
            .post(&self.pin_api_url)
            .timeout(Duration::from_secs(PIN_REQUEST_TIMEOUT_SECS))
            .json(payload);
        if let Some(jwt) = &self.pin_jwt {
            request = request.bearer_auth(jwt);
        }
        let resp = request.send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("HTTP {}", resp.status());
        }
        let pinned: PinResponse = resp.json().await?;
        if pinned.ipfs_hash.trim().is_empty() {
            anyhow::bail!("pinning service returned an empty identifier");
        }
        Ok(pinned.ipfs_hash)
    }

    /// Gateway fetch. Absent on any failure, no retry. Offline identifiers
    /// short-circuit: nothing can resolve them.
    pub async fn retrieve(&self, cid: &str) -> Option<Value> {
        if is_offline_cid(cid) {
            return None;
        }
        let resp = self
            .client
            .get(self.gateway_url(cid))
            .timeout(Duration::from_secs(GATEWAY_REQUEST_TIMEOUT_SECS))
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.json::<Value>().await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_cid_is_deterministic_under_frozen_clock() {
        let payload = r#"{"contract":"0xabcd","risk":"HIGH"}"#;
        let a = fallback_cid(payload, 1_700_000_000_000);
        let b = fallback_cid(payload, 1_700_000_000_000);
        assert_eq!(a, b);
        assert!(is_offline_cid(&a));
        // "local-" + 16 hex chars.
        assert_eq!(a.len(), OFFLINE_CID_PREFIX.len() + 16);
    }

    #[test]
    fn test_fallback_cid_varies_with_clock_and_payload() {
        let payload = r#"{"contract":"0xabcd"}"#;
        let a = fallback_cid(payload, 1_700_000_000_000);
        let b = fallback_cid(payload, 1_700_000_000_001);
        let c = fallback_cid(r#"{"contract":"0xbeef"}"#, 1_700_000_000_000);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_offline_cid_detection() {
        assert!(is_offline_cid("local-0011223344556677"));
        assert!(!is_offline_cid("QmYwAPJzv5CZsnAzt8auVTL1qDK7dCRpUq1AnkL8jSbGvy"));
    }
}
