use crate::orchestrator::ScanResult;
use crate::report_store::is_offline_cid;
use crate::storage::contracts_db::ContractsDb;
use serde_json::json;
use std::time::Duration;

const TELEGRAM_TIMEOUT_MS: u64 = 2_000;

/// Findings included in the alert body; the full set lives in the report.
const TOP_FINDINGS: usize = 3;

/// Human-readable alert text for a high/critical scan result. Pure so the
/// formatting is testable without a delivery channel.
pub fn format_alert(result: &ScanResult, report_url: Option<&str>) -> String {
    let counts = crate::analyzer::VulnerabilityCounts::from_findings(&result.findings);
    let mut message = format!(
        "[{} ALERT] Contract {:#x} on {}\nRisk score {}/100, {} finding(s): {} critical, {} high, {} medium, {} low",
        result.risk_level.as_str(),
        result.address,
        result.network,
        result.overall_score,
        counts.total(),
        counts.critical,
        counts.high,
        counts.medium,
        counts.low,
    );
    for (idx, finding) in result.findings.iter().take(TOP_FINDINGS).enumerate() {
        message.push_str(&format!(
            "\n{}. [{}] {} ({})",
            idx + 1,
            finding.severity.as_str(),
            finding.title,
            finding.category
        ));
    }
    if result.findings.len() > TOP_FINDINGS {
        message.push_str(&format!(
            "\n(+{} more in the full report)",
            result.findings.len() - TOP_FINDINGS
        ));
    }
    match report_url {
        Some(url) => message.push_str(&format!("\nFull report: {url}")),
        None => message.push_str("\nFull report: offline identifier, not yet resolvable"),
    }
    message
}

pub struct AlertDispatcher {
    client: reqwest::Client,
    bot_token: Option<String>,
    chat_id: Option<String>,
    gateway_base: String,
    db: ContractsDb,
}

impl AlertDispatcher {
    pub fn new(
        bot_token: Option<String>,
        chat_id: Option<String>,
        gateway_base: String,
        db: ContractsDb,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            bot_token,
            chat_id,
            gateway_base: gateway_base.trim_end_matches('/').to_string(),
            db,
        }
    }

    /// Best-effort notification for severe results. Never fails the caller:
    /// delivery problems are logged and absorbed, and there is no retry.
    pub async fn send_alert(&self, result: &ScanResult) {
        if !result.risk_level.is_alertable() {
            return;
        }

        let report_url = if is_offline_cid(&result.report_cid) {
            None
        } else {
            Some(format!("{}/{}", self.gateway_base, result.report_cid))
        };
        let message = format_alert(result, report_url.as_deref());

        if let Err(err) =
            self.db
                .record_alert(result.address, &result.network, result.risk_level, &message)
        {
            tracing::warn!("[ALERT] Failed to persist alert log entry: {}", err);
        }

        let (Some(token), Some(chat_id)) = (&self.bot_token, &self.chat_id) else {
            tracing::info!(
                "[ALERT] {} alert for {:#x} recorded; no messaging channel configured.",
                result.risk_level.as_str(),
                result.address
            );
            return;
        };

        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        let body = json!({
            "chat_id": chat_id,
            "text": message,
            "disable_web_page_preview": true,
        });
        match self
            .client
            .post(&url)
            .timeout(Duration::from_millis(TELEGRAM_TIMEOUT_MS))
            .json(&body)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(
                    "[ALERT] {} alert delivered for {:#x}.",
                    result.risk_level.as_str(),
                    result.address
                );
            }
            Ok(resp) => {
                tracing::warn!(
                    "[ALERT] Telegram rejected alert for {:#x}: HTTP {}",
                    result.address,
                    resp.status()
                );
            }
            Err(err) => {
                tracing::warn!(
                    "[ALERT] Telegram delivery failed for {:#x}: {}",
                    result.address,
                    err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{Finding, Severity};
    use alloy::primitives::Address;

    fn finding(title: &str, severity: Severity) -> Finding {
        Finding {
            id: "t".to_string(),
            title: title.to_string(),
            severity,
            category: "Reentrancy".to_string(),
            description: String::new(),
            recommendation: String::new(),
            confidence: 0.9,
        }
    }

    fn result(findings: Vec<Finding>) -> ScanResult {
        let counts = crate::analyzer::VulnerabilityCounts::from_findings(&findings);
        ScanResult {
            address: Address::from([0xAB; 20]),
            network: "bsc".to_string(),
            risk_level: counts.risk_level(),
            overall_score: 25,
            findings,
            report_cid: "Qm123".to_string(),
            report_offline: false,
            onchain: None,
        }
    }

    #[test]
    fn test_format_alert_caps_findings_and_links_report() {
        let findings = vec![
            finding("A", Severity::Critical),
            finding("B", Severity::High),
            finding("C", Severity::Medium),
            finding("D", Severity::Low),
            finding("E", Severity::Low),
        ];
        let message = format_alert(&result(findings), Some("https://gw/ipfs/Qm123"));
        assert!(message.starts_with("[CRITICAL ALERT]"));
        assert!(message.contains("1. [CRITICAL] A"));
        assert!(message.contains("3. [MEDIUM] C"));
        assert!(!message.contains("[LOW] D"));
        assert!(message.contains("(+2 more"));
        assert!(message.contains("https://gw/ipfs/Qm123"));
        assert!(message.contains("1 critical, 1 high, 1 medium, 2 low"));
    }

    #[test]
    fn test_format_alert_marks_unresolvable_reports() {
        let message = format_alert(&result(vec![finding("A", Severity::High)]), None);
        assert!(message.starts_with("[HIGH ALERT]"));
        assert!(message.contains("not yet resolvable"));
    }
}
