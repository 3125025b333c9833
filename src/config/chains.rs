/// Static per-network parameters.
///
/// The watch loop polls at `poll_interval_ms`; anything tighter than the
/// chain's block time just burns RPC quota, so per-chain defaults track
/// block production rates.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub chain_id: u64,
    /// Short key used in config lists, env var prefixes, and the contracts DB.
    pub key: &'static str,
    pub name: &'static str,
    pub block_time_ms: u64,
    pub poll_interval_ms: u64,
    pub explorer_api_base: &'static str,
    pub native_symbol: &'static str,
}

impl ChainConfig {
    pub fn by_key(key: &str) -> Option<Self> {
        match key.trim().to_ascii_lowercase().as_str() {
            "eth" | "mainnet" | "ethereum" => Some(Self::mainnet()),
            "bsc" => Some(Self::bsc()),
            "bsc_testnet" => Some(Self::bsc_testnet()),
            "base" => Some(Self::base()),
            "polygon" => Some(Self::polygon()),
            _ => None,
        }
    }

    pub fn by_chain_id(chain_id: u64) -> Option<Self> {
        match chain_id {
            1 => Some(Self::mainnet()),
            56 => Some(Self::bsc()),
            97 => Some(Self::bsc_testnet()),
            8453 => Some(Self::base()),
            137 => Some(Self::polygon()),
            _ => None,
        }
    }

    /// Env var carrying the RPC endpoint for this chain, e.g. `BSC_RPC_URL`.
    pub fn rpc_url_env(&self) -> String {
        format!("{}_RPC_URL", self.key.to_ascii_uppercase())
    }

    pub fn mainnet() -> Self {
        Self {
            chain_id: 1,
            key: "eth",
            name: "Ethereum Mainnet",
            block_time_ms: 12_000,
            poll_interval_ms: 12_000,
            explorer_api_base: "https://api.etherscan.io/api",
            native_symbol: "ETH",
        }
    }

    pub fn bsc() -> Self {
        Self {
            chain_id: 56,
            key: "bsc",
            name: "BNB Smart Chain",
            block_time_ms: 3_000,
            poll_interval_ms: 10_000,
            explorer_api_base: "https://api.bscscan.com/api",
            native_symbol: "BNB",
        }
    }

    pub fn bsc_testnet() -> Self {
        Self {
            chain_id: 97,
            key: "bsc_testnet",
            name: "BNB Smart Chain Testnet",
            block_time_ms: 3_000,
            poll_interval_ms: 10_000,
            explorer_api_base: "https://api-testnet.bscscan.com/api",
            native_symbol: "tBNB",
        }
    }

    pub fn base() -> Self {
        Self {
            chain_id: 8453,
            key: "base",
            name: "Base",
            block_time_ms: 2_000,
            poll_interval_ms: 10_000,
            explorer_api_base: "https://api.basescan.org/api",
            native_symbol: "ETH",
        }
    }

    pub fn polygon() -> Self {
        Self {
            chain_id: 137,
            key: "polygon",
            name: "Polygon",
            block_time_ms: 2_000,
            poll_interval_ms: 10_000,
            explorer_api_base: "https://api.polygonscan.com/api",
            native_symbol: "POL",
        }
    }
}
