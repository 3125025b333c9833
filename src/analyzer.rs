use crate::utils::config::AiConfig;
use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

const AI_REQUEST_TIMEOUT_SECS: u64 = 60;
const DEGRADED_SCORE: u8 = 50;

/// The fixed classification taxonomy sent to the model. The model must pick
/// categories from this list; anything else is still accepted on the way back
/// (the category is informational, severity drives the pipeline).
pub const VULNERABILITY_CATEGORIES: [&str; 10] = [
    "Reentrancy",
    "Integer Overflow",
    "Access Control",
    "Unchecked External Call",
    "Front-Running",
    "Denial of Service",
    "Timestamp Dependence",
    "Delegatecall Injection",
    "Oracle Manipulation",
    "Logic Error",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
        }
    }

    /// Unknown labels land on Medium so a sloppy model response never drops
    /// a finding below the radar entirely.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CRITICAL" => Severity::Critical,
            "HIGH" => Severity::High,
            "LOW" => Severity::Low,
            _ => Severity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Critical => "CRITICAL",
            RiskLevel::High => "HIGH",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::Low => "LOW",
            RiskLevel::Safe => "SAFE",
        }
    }

    pub fn from_db(raw: &str) -> Option<Self> {
        match raw {
            "CRITICAL" => Some(Self::Critical),
            "HIGH" => Some(Self::High),
            "MEDIUM" => Some(Self::Medium),
            "LOW" => Some(Self::Low),
            "SAFE" => Some(Self::Safe),
            _ => None,
        }
    }

    pub fn from_severity(severity: Severity) -> Self {
        match severity {
            Severity::Critical => RiskLevel::Critical,
            Severity::High => RiskLevel::High,
            Severity::Medium => RiskLevel::Medium,
            Severity::Low => RiskLevel::Low,
        }
    }

    pub fn is_alertable(self) -> bool {
        matches!(self, RiskLevel::Critical | RiskLevel::High)
    }
}

/// One vulnerability instance. Immutable once produced; lives only inside a
/// scan result, never stored individually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub title: String,
    pub severity: Severity,
    pub category: String,
    pub description: String,
    pub recommendation: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnerabilityCounts {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
}

impl VulnerabilityCounts {
    pub fn from_findings(findings: &[Finding]) -> Self {
        let mut counts = Self::default();
        for finding in findings {
            match finding.severity {
                Severity::Critical => counts.critical += 1,
                Severity::High => counts.high += 1,
                Severity::Medium => counts.medium += 1,
                Severity::Low => counts.low += 1,
            }
        }
        counts
    }

    pub fn risk_level(&self) -> RiskLevel {
        if self.critical > 0 {
            RiskLevel::Critical
        } else if self.high > 0 {
            RiskLevel::High
        } else if self.medium > 0 {
            RiskLevel::Medium
        } else if self.low > 0 {
            RiskLevel::Low
        } else {
            RiskLevel::Safe
        }
    }

    pub fn total(&self) -> u64 {
        self.critical + self.high + self.medium + self.low
    }
}

/// Output of one analyzer round trip. `degraded` marks the fallback path
/// taken when the model call failed or returned garbage.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub risk_level: RiskLevel,
    pub overall_score: u8,
    pub findings: Vec<Finding>,
    pub degraded: bool,
}

// Wire shapes for the structured-output contract.

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize)]
struct AnalysisPayload {
    risk_level: Option<String>,
    overall_score: Option<f64>,
    #[serde(default)]
    findings: Vec<FindingPayload>,
}

#[derive(Deserialize)]
struct FindingPayload {
    title: Option<String>,
    severity: Option<String>,
    category: Option<String>,
    description: Option<String>,
    recommendation: Option<String>,
    confidence: Option<f64>,
}

pub struct Analyzer {
    client: reqwest::Client,
    config: AiConfig,
}

impl Analyzer {
    pub fn new(config: AiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Classify contract code. Never fails: transport errors, bad status
    /// codes, and unparseable output all collapse into the degraded result so
    /// per-contract latency stays bounded to one model round trip.
    pub async fn analyze(&self, code: &str, address: Address) -> Analysis {
        match self.request_classification(code, address).await {
            Ok(analysis) => analysis,
            Err(err) => {
                tracing::warn!(
                    "[SCAN] AI classification failed for {:#x}; degrading to manual-review finding: {}",
                    address,
                    err
                );
                degraded_analysis(address)
            }
        }
    }

    async fn request_classification(
        &self,
        code: &str,
        address: Address,
    ) -> anyhow::Result<Analysis> {
        let body = json!({
            "model": self.config.model,
            "temperature": 0.1,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": system_prompt()},
                {"role": "user", "content": format!(
                    "Analyze the smart contract at {address:#x}. Contract code or runtime bytecode follows.\n\n{code}"
                )},
            ],
        });

        let mut request = self
            .client
            .post(&self.config.api_url)
            .timeout(Duration::from_secs(AI_REQUEST_TIMEOUT_SECS))
            .json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("HTTP {}", resp.status());
        }
        let chat: ChatResponse = resp.json().await?;
        let content = chat
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| anyhow::anyhow!("empty choices in model response"))?;
        let payload: AnalysisPayload = serde_json::from_str(content)?;
        Ok(parse_analysis(payload, address))
    }
}

fn system_prompt() -> String {
    format!(
        "You are a smart contract security auditor. Classify vulnerabilities using only \
         these categories: {}. Respond with a single JSON object: \
         {{\"risk_level\": \"CRITICAL|HIGH|MEDIUM|LOW|SAFE\", \"overall_score\": 0-100, \
         \"findings\": [{{\"title\", \"severity\": \"CRITICAL|HIGH|MEDIUM|LOW\", \
         \"category\", \"description\", \"recommendation\", \"confidence\": 0.0-1.0}}]}}. \
         An empty findings array with risk_level SAFE means no issues.",
        VULNERABILITY_CATEGORIES.join(", ")
    )
}

fn parse_analysis(payload: AnalysisPayload, address: Address) -> Analysis {
    let findings: Vec<Finding> = payload
        .findings
        .into_iter()
        .enumerate()
        .map(|(idx, f)| Finding {
            id: format!("{address:#x}-{idx}"),
            title: f.title.unwrap_or_else(|| "Untitled finding".to_string()),
            severity: Severity::parse(f.severity.as_deref().unwrap_or("")),
            category: f.category.unwrap_or_else(|| "Logic Error".to_string()),
            description: f.description.unwrap_or_default(),
            recommendation: f.recommendation.unwrap_or_default(),
            confidence: f.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        })
        .collect();

    // The model's own risk label is advisory; the findings are the source of
    // truth so counts and risk level can never disagree.
    let derived = VulnerabilityCounts::from_findings(&findings).risk_level();
    if let Some(claimed) = payload.risk_level.as_deref().and_then(RiskLevel::from_db) {
        if claimed != derived {
            tracing::debug!(
                "[SCAN] Model risk label {} disagrees with derived {} for {:#x}; using derived.",
                claimed.as_str(),
                derived.as_str(),
                address
            );
        }
    }

    Analysis {
        risk_level: derived,
        overall_score: payload
            .overall_score
            .map(|s| s.clamp(0.0, 100.0) as u8)
            .unwrap_or(0),
        findings,
        degraded: false,
    }
}

/// Safe default for an unavailable or misbehaving model: one synthetic
/// medium finding asking for manual review, score pinned mid-scale.
pub fn degraded_analysis(address: Address) -> Analysis {
    let finding = Finding {
        id: format!("{address:#x}-analysis-error"),
        title: "Automated analysis unavailable".to_string(),
        severity: Severity::Medium,
        category: "Analysis Error".to_string(),
        description: "The AI classification service could not produce a usable result for this \
                      contract. Manual review is required."
            .to_string(),
        recommendation: "Re-run the scan or audit the contract manually.".to_string(),
        confidence: 0.0,
    };
    Analysis {
        risk_level: RiskLevel::Medium,
        overall_score: DEGRADED_SCORE,
        findings: vec![finding],
        degraded: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(severity: Severity) -> Finding {
        Finding {
            id: "t-0".to_string(),
            title: "t".to_string(),
            severity,
            category: "Logic Error".to_string(),
            description: String::new(),
            recommendation: String::new(),
            confidence: 0.9,
        }
    }

    #[test]
    fn test_counts_partition_findings() {
        let findings = vec![
            finding(Severity::Critical),
            finding(Severity::Critical),
            finding(Severity::High),
            finding(Severity::Low),
            finding(Severity::Low),
            finding(Severity::Low),
        ];
        let counts = VulnerabilityCounts::from_findings(&findings);
        assert_eq!(
            counts,
            VulnerabilityCounts {
                critical: 2,
                high: 1,
                medium: 0,
                low: 3
            }
        );
        assert_eq!(counts.risk_level(), RiskLevel::Critical);
        assert_eq!(counts.total(), 6);
    }

    #[test]
    fn test_risk_level_from_empty_counts_is_safe() {
        assert_eq!(VulnerabilityCounts::default().risk_level(), RiskLevel::Safe);
    }

    #[test]
    fn test_severity_parse_defaults_unknown_to_medium() {
        assert_eq!(Severity::parse("critical"), Severity::Critical);
        assert_eq!(Severity::parse(" HIGH "), Severity::High);
        assert_eq!(Severity::parse("definitely-bad"), Severity::Medium);
        assert_eq!(Severity::parse(""), Severity::Medium);
    }

    #[test]
    fn test_parse_analysis_derives_risk_from_findings() {
        let payload: AnalysisPayload = serde_json::from_str(
            r#"{
                "risk_level": "SAFE",
                "overall_score": 250.0,
                "findings": [
                    {"title": "Reentrancy", "severity": "HIGH", "category": "Reentrancy",
                     "description": "d", "recommendation": "r", "confidence": 1.5}
                ]
            }"#,
        )
        .expect("payload parses");
        let analysis = parse_analysis(payload, Address::ZERO);
        // A SAFE label cannot override a HIGH finding, the score clamps to
        // 100, and confidence clamps to 1.0.
        assert_eq!(analysis.risk_level, RiskLevel::High);
        assert_eq!(analysis.overall_score, 100);
        assert!((analysis.findings[0].confidence - 1.0).abs() < f64::EPSILON);
        assert!(!analysis.degraded);
    }

    #[test]
    fn test_degraded_analysis_shape() {
        let analysis = degraded_analysis(Address::ZERO);
        assert!(analysis.degraded);
        assert_eq!(analysis.overall_score, 50);
        assert_eq!(analysis.findings.len(), 1);
        assert_eq!(analysis.findings[0].severity, Severity::Medium);
        assert_eq!(analysis.findings[0].category, "Analysis Error");
        assert_eq!(analysis.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn test_malformed_model_content_is_rejected() {
        assert!(serde_json::from_str::<AnalysisPayload>("not json at all").is_err());
    }
}
