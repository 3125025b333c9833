use alloy::primitives::Address;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("scan error: {0}")]
    Scan(#[from] ScanError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Pipeline-level failures. `NoCode` is the only hard-terminal kind; every
/// other collaborator failure is degraded inside the owning module and never
/// reaches the orchestrator as an error.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("no bytecode at {address:#x}; nothing to scan")]
    NoCode { address: Address },
    #[error("scan already in flight for {address:#x}")]
    AlreadyInFlight { address: Address },
    #[error("persistence failure: {0}")]
    Storage(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
