/// Why a broadcast was rejected. Each variant maps to one resend policy in the broadcast stage.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    /// The node did not answer, or answered too late. The transaction may or may not have landed.
    #[error("no response: {0}")]
    NoResponse(String),
    /// The nonce is not yet valid on chain. Another item with a lower nonce must land first.
    #[error("invalid nonce: {0}")]
    InvalidNonce(String),
    /// The node already knows about this transaction.
    #[error("ignorable: {0}")]
    Ignorable(String),
    #[error("{0}")]
    Unknown(String),
}

impl BroadcastError {
    /// A short label for logs and metric attributes.
    pub fn kind(&self) -> &'static str {
        match self {
            BroadcastError::NoResponse(_) => "no_response",
            BroadcastError::InvalidNonce(_) => "invalid_nonce",
            BroadcastError::Ignorable(_) => "ignorable",
            BroadcastError::Unknown(_) => "unknown",
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid XRPL account {0}: {1}")]
    Xrpl(String, String),
    #[error("invalid EVM address {0}: {1}")]
    Evm(String, String),
    #[error("account {0} decodes to {1} bytes, expected 20")]
    Length(String, usize),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("invalid amount {0:?}")]
    Invalid(String),
    #[error("amount {0:?} overflows 256 bits at precision {1}")]
    Overflow(String, u32),
    #[error("unknown bridge {0}")]
    UnknownBridge(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0}.node must be set")]
    MissingNode(&'static str),
    #[error("{0} must be greater than zero")]
    ZeroPeriod(&'static str),
    #[error("min_bridge_signature_reward ({min}) exceeds max_bridge_signature_reward ({max})")]
    RewardBounds { min: u64, max: u64 },
    #[error("sequencer_url must be set when dynamic_bridge_creation is enabled")]
    MissingSequencer,
    #[error("{0}.signer: {1}")]
    Signer(&'static str, String),
    #[error("environment variable {0} has invalid value {1:?}")]
    InvalidOverride(String, String),
}
