use crate::config::chains::ChainConfig;
use crate::error::{ConfigError, Result};
use alloy::primitives::Address;
use std::env;
use std::str::FromStr;

const DEFAULT_NETWORKS: &str = "bsc";
const DEFAULT_AI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_AI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_PIN_API_URL: &str = "https://api.pinata.cloud/pinning/pinJSONToIPFS";
const DEFAULT_IPFS_GATEWAY: &str = "https://gateway.pinata.cloud/ipfs";
const DEFAULT_EXPLORER_MIN_INTERVAL_MS: u64 = 250;
const DEFAULT_WORKER_COUNT: usize = 4;
const DEFAULT_QUEUE_CAPACITY: usize = 256;
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 60;

/// Who receives the audit certificate minted after a successful report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MintTo {
    /// Mint to the agent's signer address.
    Agent,
    /// Mint to the registry contract itself.
    Orchestrator,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub chain: ChainConfig,
    pub rpc_url: String,
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub networks: Vec<NetworkConfig>,
    pub db_path: Option<String>,
    pub agent_private_key: Option<String>,
    pub registry_address: Option<Address>,
    pub certificate_address: Option<Address>,
    pub mint_to: MintTo,
    pub ai: AiConfig,
    pub explorer_api_key: Option<String>,
    pub explorer_min_interval_ms: u64,
    pub pin_api_url: String,
    pub pin_jwt: Option<String>,
    pub ipfs_gateway: String,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub status_interval_secs: u64,
}

fn load_string(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn load_u64(var: &str, default: u64, min: u64, max: u64) -> u64 {
    env::var(var)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(|v| v.clamp(min, max))
        .unwrap_or(default)
}

fn load_usize(var: &str, default: usize, min: usize, max: usize) -> usize {
    env::var(var)
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .map(|v| v.clamp(min, max))
        .unwrap_or(default)
}

fn load_address(var: &str) -> Result<Option<Address>> {
    match load_string(var) {
        None => Ok(None),
        Some(raw) => Address::from_str(&raw)
            .map(Some)
            .map_err(|e| ConfigError::Invalid(format!("{var} is not an address: {e}")).into()),
    }
}

fn validate_http_url(name: &str, raw: &str) -> Result<()> {
    let parsed = raw.parse::<reqwest::Url>().map_err(|e| {
        ConfigError::Invalid(format!("{name} must be a valid URL, got `{raw}`: {e}"))
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => {
            Err(ConfigError::Invalid(format!("{name} must use http(s) scheme, got `{other}`"))
                .into())
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let raw_networks =
            load_string("MONITORED_NETWORKS").unwrap_or_else(|| DEFAULT_NETWORKS.to_string());
        let mut networks = Vec::new();
        for key in raw_networks.split(',') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let chain = ChainConfig::by_key(key).ok_or_else(|| {
                ConfigError::Invalid(format!("MONITORED_NETWORKS contains unknown chain `{key}`"))
            })?;
            let rpc_env = chain.rpc_url_env();
            let rpc_url = load_string(&rpc_env).ok_or(ConfigError::Missing(rpc_env.clone()))?;
            validate_http_url(&rpc_env, &rpc_url)?;
            networks.push(NetworkConfig { chain, rpc_url });
        }
        if networks.is_empty() {
            return Err(ConfigError::Invalid("MONITORED_NETWORKS resolved to no chains".into()).into());
        }

        let ai = AiConfig {
            api_url: load_string("AI_API_URL").unwrap_or_else(|| DEFAULT_AI_API_URL.to_string()),
            api_key: load_string("AI_API_KEY"),
            model: load_string("AI_MODEL").unwrap_or_else(|| DEFAULT_AI_MODEL.to_string()),
        };
        validate_http_url("AI_API_URL", &ai.api_url)?;

        let pin_api_url =
            load_string("PIN_API_URL").unwrap_or_else(|| DEFAULT_PIN_API_URL.to_string());
        validate_http_url("PIN_API_URL", &pin_api_url)?;
        let ipfs_gateway =
            load_string("IPFS_GATEWAY_URL").unwrap_or_else(|| DEFAULT_IPFS_GATEWAY.to_string());
        validate_http_url("IPFS_GATEWAY_URL", &ipfs_gateway)?;

        let registry_address = load_address("REGISTRY_ADDRESS")?;
        let certificate_address = load_address("CERTIFICATE_ADDRESS")?;
        let mint_to = match load_string("CERTIFICATE_MINT_TO").as_deref() {
            None | Some("agent") => MintTo::Agent,
            Some("orchestrator") => MintTo::Orchestrator,
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "CERTIFICATE_MINT_TO must be `agent` or `orchestrator`, got `{other}`"
                ))
                .into())
            }
        };

        Ok(Self {
            networks,
            db_path: load_string("CONTRACTS_DB_PATH"),
            agent_private_key: load_string("AGENT_PRIVATE_KEY"),
            registry_address,
            certificate_address,
            mint_to,
            ai,
            explorer_api_key: load_string("EXPLORER_API_KEY"),
            explorer_min_interval_ms: load_u64(
                "EXPLORER_MIN_INTERVAL_MS",
                DEFAULT_EXPLORER_MIN_INTERVAL_MS,
                50,
                60_000,
            ),
            pin_api_url,
            pin_jwt: load_string("PIN_JWT"),
            ipfs_gateway,
            telegram_bot_token: load_string("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: load_string("TELEGRAM_CHAT_ID"),
            worker_count: load_usize("SCAN_WORKER_COUNT", DEFAULT_WORKER_COUNT, 1, 64),
            queue_capacity: load_usize("SCAN_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY, 8, 65_536),
            status_interval_secs: load_u64(
                "STATUS_INTERVAL_SECS",
                DEFAULT_STATUS_INTERVAL_SECS,
                5,
                3_600,
            ),
        })
    }

    /// On-chain reporting needs both a signer and a registry target.
    pub fn onchain_enabled(&self) -> bool {
        self.agent_private_key.is_some() && self.registry_address.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_http_url_rejects_ws() {
        assert!(validate_http_url("X", "https://example.org").is_ok());
        assert!(validate_http_url("X", "ws://example.org").is_err());
        assert!(validate_http_url("X", "not a url").is_err());
    }
}
