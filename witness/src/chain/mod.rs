//! The capability interface every chain exposes to the witness, and the event types that flow out of it.

pub mod remote;

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    amount::Decimal,
    bridge::{BridgeId, BridgeRegistry},
    cache::TtlCache,
    error::{AmountError, BroadcastError},
};

pub type ChainId = u64;

/// An encoded transaction, signed or unsigned. Its format is private to the chain that produced it.
pub type Payload = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    Xrp,
    Evm,
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainType::Xrp => f.write_str("xrp"),
            ChainType::Evm => f.write_str("evm"),
        }
    }
}

/// A deposit into a bridge door, to be attested on the other chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub block: u64,
    pub claim_id: u64,
    pub sender: String,
    pub amount: String,
    #[serde(default)]
    pub destination: Option<String>,
    pub bridge_id: BridgeId,
}

/// A request to create and fund an account on the other chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountCreate {
    pub block: u64,
    pub sender: String,
    pub amount: String,
    pub destination: String,
    pub signature_reward: String,
    pub bridge_id: BridgeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Commit(Commit),
    AccountCreate(AccountCreate),
}

impl ChainEvent {
    pub fn block(&self) -> u64 {
        match self {
            ChainEvent::Commit(c) => c.block,
            ChainEvent::AccountCreate(c) => c.block,
        }
    }

    pub fn bridge_id(&self) -> &BridgeId {
        match self {
            ChainEvent::Commit(c) => &c.bridge_id,
            ChainEvent::AccountCreate(c) => &c.bridge_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChainEvent::Commit(_) => "commit",
            ChainEvent::AccountCreate(_) => "account_create",
        }
    }
}

/// A claim id created on the destination chain that has not yet collected a quorum of attestations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub claim_id: u64,
    /// The account on the source chain that is allowed to commit against this claim, in the destination chain's
    /// encoding.
    pub source: String,
}

/// Inputs for a claim attestation, already converted into the destination chain's encoding and precision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimAttestation {
    pub bridge_id: BridgeId,
    pub claim_id: u64,
    pub sender: String,
    pub amount: String,
    pub destination: String,
}

/// Inputs for an account-create attestation, already converted into the destination chain's encoding and precision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountCreateAttestation {
    pub bridge_id: BridgeId,
    pub sender: String,
    pub amount: String,
    pub destination: String,
    pub signature_reward: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedTransaction {
    pub payload: Payload,
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    NotFound,
    Accepted,
    Failed,
    Unconfirmed,
    Confirmed,
    Error,
}

/// A bridge-creation request emitted on a locking chain, to be countersigned through the sequencer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeRequest {
    pub tx_hash: String,
    pub log_index: u64,
    pub token_address: String,
    #[serde(default)]
    pub tries: u32,
}

impl BridgeRequest {
    pub fn id(&self) -> String {
        format!("{}-{}", self.tx_hash, self.log_index)
    }
}

/// What a chain must check before signing a sequencer-prepared create-bridge transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBridgeParams {
    pub is_locking: bool,
    pub min_signature_reward: u64,
    pub max_signature_reward: u64,
    /// The door on the other chain, in this chain's encoding.
    pub other_chain_door: String,
    /// The bridged token, in this chain's encoding.
    pub token_address: String,
    pub token_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBridgeSignature {
    pub account: String,
    pub public_key: String,
    pub signature: String,
}

/// Everything the witness needs from a chain. Implementations own the chain's RPC client, transaction codec and
/// signer; the witness core only sequences calls.
///
/// An `Err` from any method means the answer is currently unavailable. It is never a stand-in for an empty result.
#[async_trait]
pub trait ChainProvider: Send + Sync + fmt::Debug {
    fn chain_type(&self) -> ChainType;

    fn chain_id(&self) -> ChainId;

    /// Bridges this chain has discovered, paired or not.
    fn bridges(&self) -> &BridgeRegistry;

    /// The chain's latest block height. Zero means the node is not usable.
    async fn block_height(&self) -> Result<u64>;

    /// First block of the next event scan.
    fn current_block_number(&self) -> u64;

    fn set_current_block_number(&self, block: u64);

    /// First block of the next bridge-discovery scan.
    fn new_bridges_block_number(&self) -> u64;

    fn set_new_bridges_block_number(&self, block: u64);

    /// Commits on active bridges between the scan cursor and `to_block`, inclusive.
    async fn get_new_commits(&self, to_block: u64) -> Result<Vec<Commit>>;

    /// Account creates on active bridges between the scan cursor and `to_block`, inclusive.
    async fn get_new_account_creates(&self, to_block: u64) -> Result<Vec<AccountCreate>>;

    /// Scan for bridge objects up to `to_block` and add them to [ChainProvider::bridges].
    async fn fetch_new_bridges(&self, to_block: u64) -> Result<()>;

    fn set_bridge_validated(&self, id: &BridgeId) -> bool {
        self.bridges().set_validated(id)
    }

    async fn get_unattested_claim_by_id(
        &self,
        claim_id: u64,
        bridge_id: &BridgeId,
    ) -> Result<Option<Claim>>;

    async fn check_account_created(&self, account: &str, bridge_id: &BridgeId) -> Result<bool>;

    async fn check_witness_has_attested_create_account(
        &self,
        account: &str,
        bridge_id: &BridgeId,
    ) -> Result<bool>;

    async fn get_attest_claim_transaction(
        &self,
        attestation: &ClaimAttestation,
    ) -> Result<PreparedTransaction>;

    async fn get_attest_account_create_transaction(
        &self,
        attestation: &AccountCreateAttestation,
    ) -> Result<PreparedTransaction>;

    async fn sign_transaction(&self, payload: &str) -> Result<Payload>;

    /// Submit a signed transaction and return its hash.
    async fn broadcast_transaction(&self, signed: &str) -> Result<String, BroadcastError>;

    async fn get_transaction_status(&self, hash: &str) -> TransactionStatus;

    /// A transaction that does nothing but consume `nonce`, priced at `gas_factor`.
    async fn get_noop_transaction(&self, nonce: u64, gas_factor: u32) -> Result<Payload>;

    /// Re-price `payload` at `gas_factor`.
    async fn set_transaction_gas_price(&self, payload: &str, gas_factor: u32) -> Result<Payload>;

    /// The next nonce the chain will accept from this witness.
    async fn get_nonce(&self) -> Result<u64>;

    async fn is_in_signer_list(&self) -> Result<bool>;

    /// Number of account creates the chain has already executed.
    async fn get_current_create_account_count(&self) -> Result<u64>;

    /// The account-create count an account-create attestation payload is bound to.
    async fn get_transaction_create_count(&self, payload: &str) -> Result<u64>;

    /// Interpret an amount observed on this chain. Integer amounts are in the smallest unit of the bridged asset;
    /// amounts written with a fraction or exponent are already in whole units.
    fn convert_to_decimal(&self, amount: &str, bridge_id: &BridgeId) -> Result<Decimal, AmountError> {
        let precision = self
            .bridges()
            .asset_precision(bridge_id)
            .ok_or_else(|| AmountError::UnknownBridge(bridge_id.to_string()))?;
        if amount.contains(['.', 'e', 'E']) {
            Decimal::from_str(amount)
        } else {
            Decimal::from_whole(amount, precision)
        }
    }

    /// Express `amount` in the smallest unit of the bridged asset on this chain.
    fn convert_to_whole(&self, amount: &Decimal, bridge_id: &BridgeId) -> Result<String, AmountError> {
        let precision = self
            .bridges()
            .asset_precision(bridge_id)
            .ok_or_else(|| AmountError::UnknownBridge(bridge_id.to_string()))?;
        Ok(amount.to_whole(precision)?.to_string())
    }

    async fn fetch_new_bridge_requests(&self, _to_block: u64) -> Result<Vec<BridgeRequest>> {
        Ok(Vec::new())
    }

    async fn retry_new_bridge_request(&self, _request: BridgeRequest) -> Result<()> {
        Err(anyhow!("{} chains do not emit bridge requests", self.chain_type()))
    }

    async fn get_token_code_from_address(&self, _address: &str) -> Result<String> {
        Err(anyhow!("{} chains do not resolve token codes", self.chain_type()))
    }

    async fn sign_encoded_create_bridge_transaction(
        &self,
        _encoded: &str,
        _params: &CreateBridgeParams,
    ) -> Result<CreateBridgeSignature> {
        Err(anyhow!(
            "{} chains cannot sign create-bridge transactions",
            self.chain_type()
        ))
    }
}

/// Which of the two configured chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainSide {
    Main,
    Side,
}

impl ChainSide {
    pub fn other(self) -> ChainSide {
        match self {
            ChainSide::Main => ChainSide::Side,
            ChainSide::Side => ChainSide::Main,
        }
    }
}

impl fmt::Display for ChainSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainSide::Main => f.write_str("main_chain"),
            ChainSide::Side => f.write_str("side_chain"),
        }
    }
}

/// Both chain providers, handed to every component that needs them.
#[derive(Debug, Clone)]
pub struct Chains {
    pub main: Arc<dyn ChainProvider>,
    pub side: Arc<dyn ChainProvider>,
}

impl Chains {
    pub fn new(main: Arc<dyn ChainProvider>, side: Arc<dyn ChainProvider>) -> Self {
        Chains { main, side }
    }

    pub fn get(&self, side: ChainSide) -> &Arc<dyn ChainProvider> {
        match side {
            ChainSide::Main => &self.main,
            ChainSide::Side => &self.side,
        }
    }
}

/// Signer-set membership of this witness, re-checked on each chain at most once per recheck interval.
#[derive(Debug)]
pub struct SignerMembership {
    cache: TtlCache<ChainId, bool>,
    main_ttl: Duration,
    side_ttl: Duration,
    chains: Chains,
}

impl SignerMembership {
    pub fn new(chains: Chains, main_ttl: Duration, side_ttl: Duration) -> Self {
        SignerMembership {
            cache: TtlCache::new(),
            main_ttl,
            side_ttl,
            chains,
        }
    }

    /// Whether this witness currently signs for `side`. A failed lookup counts as not a member and is retried on the
    /// next call.
    pub async fn is_member(&self, side: ChainSide) -> bool {
        let provider = self.chains.get(side);
        let ttl = match side {
            ChainSide::Main => self.main_ttl,
            ChainSide::Side => self.side_ttl,
        };
        match self
            .cache
            .get_or_try_insert_with(provider.chain_id(), Some(ttl), || {
                provider.is_in_signer_list()
            })
            .await
        {
            Ok(member) => member,
            Err(e) => {
                warn!(chain_id = provider.chain_id(), "signer list lookup failed: {e:?}");
                false
            }
        }
    }
}
